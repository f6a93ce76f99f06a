//! Typed ID definitions for provider resources.
//!
//! Each ID type has a unique prefix that identifies the resource type.
//! Suffixes are assigned by the provider and treated as opaque.

use crate::define_id;

// =============================================================================
// Images and Storage
// =============================================================================

define_id!(ImageId, "ami");
define_id!(SnapshotId, "snap");

// =============================================================================
// Regions
// =============================================================================

/// A provider region name, e.g. `us-east-1`.
///
/// Regions are not prefixed IDs; they are validated as non-empty lowercase
/// ASCII made of letters, digits and dashes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Region(String);

impl Region {
    /// Parses a region name.
    pub fn parse(s: &str) -> Result<Self, crate::IdError> {
        if s.is_empty() {
            return Err(crate::IdError::Empty);
        }

        let valid = s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !valid || s.starts_with('-') || s.ends_with('-') {
            return Err(crate::IdError::InvalidRegion(s.to_string()));
        }

        Ok(Self(s.to_string()))
    }

    /// Returns the region name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Region {
    type Err = crate::IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for Region {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Region {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
