//! Macros for defining typed ID types.

/// Macro to define a typed provider ID with a specific prefix.
///
/// This generates a newtype wrapper around the canonical string with:
/// - A `PREFIX` constant
/// - `parse()` to parse from string
/// - `with_suffix()` to build an ID from its suffix alone
/// - `Display` and `FromStr` implementations
/// - `Serialize` and `Deserialize` implementations
/// - `Ord`, `Hash`, and other standard traits
///
/// # Example
///
/// ```ignore
/// define_id!(ImageId, "ami");
///
/// let parsed: ImageId = "ami-0c55b159cbfafe1f0".parse()?;
/// assert_eq!(parsed.suffix(), "0c55b159cbfafe1f0");
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        /// A typed ID for this resource type.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// The prefix for this ID type.
            pub const PREFIX: &'static str = $prefix;

            /// Parses an ID from a string.
            ///
            /// The string must be in the format `{prefix}-{suffix}` where the
            /// suffix is non-empty ASCII alphanumeric.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                let Some((prefix, suffix)) = s.split_once('-') else {
                    return Err($crate::IdError::MissingSeparator);
                };

                if prefix != Self::PREFIX {
                    return Err($crate::IdError::InvalidPrefix {
                        expected: Self::PREFIX,
                        actual: prefix.to_string(),
                    });
                }

                if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_alphanumeric()) {
                    return Err($crate::IdError::InvalidSuffix(suffix.to_string()));
                }

                Ok(Self(s.to_string()))
            }

            /// Builds an ID from its suffix (the part after `{prefix}-`).
            pub fn with_suffix(suffix: &str) -> Result<Self, $crate::IdError> {
                Self::parse(&format!("{}-{}", Self::PREFIX, suffix))
            }

            /// Returns the canonical string form.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Returns the portion after the prefix and separator.
            #[must_use]
            pub fn suffix(&self) -> &str {
                &self.0[Self::PREFIX.len() + 1..]
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}
