//! Configuration for the registrar.
//!
//! Two sources:
//! - [`ServiceConfig`]: where and how to talk to the image service, from the
//!   environment.
//! - [`BuildPlan`]: what to register, from a TOML build plan written by the
//!   earlier pipeline steps.

use amiforge_id::Region;
use amiforge_reconcile::{BlockDeviceMapping, OmissionSet, RootDeviceSpec, SnapshotIdLookup};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::waiter::PollingConfig;

/// Architectures the provider accepts.
pub const ARCHITECTURES: &[&str] = &["i386", "x86_64", "arm64", "x86_64_mac", "arm64_mac"];

/// Boot modes the provider accepts.
pub const BOOT_MODES: &[&str] = &["legacy-bios", "uefi", "uefi-preferred"];

/// Virtualization types the provider accepts.
pub const VIRTUALIZATION_TYPES: &[&str] = &["hvm", "paravirtual"];

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid build plan: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0} must not be empty")]
    MissingField(&'static str),

    #[error("unsupported architecture '{0}'")]
    UnsupportedArchitecture(String),

    #[error("unsupported boot mode '{0}'")]
    UnsupportedBootMode(String),

    #[error("unsupported virtualization type '{0}'")]
    UnsupportedVirtualizationType(String),

    #[error("invalid {var}: {message}")]
    InvalidEnv { var: &'static str, message: String },
}

/// Image service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Image service API URL.
    pub endpoint: String,

    /// Region the image is registered in.
    pub region: Region,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Availability polling policy.
    pub polling: PollingConfig,
}

impl ServiceConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let endpoint = std::env::var("AMIFORGE_ENDPOINT")
            .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());

        let region = std::env::var("AMIFORGE_REGION").unwrap_or_else(|_| "us-east-1".to_string());
        let region = Region::parse(&region).map_err(|e| ConfigError::InvalidEnv {
            var: "AMIFORGE_REGION",
            message: e.to_string(),
        })?;

        let log_level = std::env::var("AMIFORGE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            endpoint,
            region,
            log_level,
            polling: PollingConfig::from_env(),
        })
    }
}

/// A launch-time mapping, optionally excluded from the final image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchBlockDevice {
    #[serde(flatten)]
    pub mapping: BlockDeviceMapping,

    /// Drop this device from the registered image (instance-store scratch
    /// disks and the like).
    #[serde(default)]
    pub omit_from_artifact: bool,
}

/// Image settings of a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Name the finished image is published under.
    pub ami_name: String,

    #[serde(default = "default_virtualization_type")]
    pub ami_virtualization_type: String,

    #[serde(default = "default_architecture")]
    pub architecture: String,

    /// Encrypt the boot volume. Unset means "leave it to the provider".
    #[serde(default)]
    pub encrypt_boot: Option<bool>,

    /// Don't publish the image in the build region; a later step copies it.
    #[serde(default)]
    pub skip_build_region: bool,

    pub root_device: RootDeviceSpec,

    #[serde(default)]
    pub ami_block_device_mappings: Vec<BlockDeviceMapping>,

    #[serde(default)]
    pub launch_block_device_mappings: Vec<LaunchBlockDevice>,

    /// Enable ENA networking. Only an explicit `true` is sent.
    #[serde(default)]
    pub ena_support: Option<bool>,

    /// Enable SR-IOV networking (`simple` mode).
    #[serde(default)]
    pub sriov_support: bool,

    #[serde(default)]
    pub boot_mode: Option<String>,
}

fn default_virtualization_type() -> String {
    "hvm".to_string()
}

fn default_architecture() -> String {
    "x86_64".to_string()
}

impl BuildConfig {
    /// Minimal config for an image name and root device.
    pub fn new(ami_name: impl Into<String>, root_device: RootDeviceSpec) -> Self {
        Self {
            ami_name: ami_name.into(),
            ami_virtualization_type: default_virtualization_type(),
            architecture: default_architecture(),
            encrypt_boot: None,
            skip_build_region: false,
            root_device,
            ami_block_device_mappings: Vec::new(),
            launch_block_device_mappings: Vec::new(),
            ena_support: None,
            sriov_support: false,
            boot_mode: None,
        }
    }

    /// Launch mappings without their omission flags.
    pub fn launch_devices(&self) -> Vec<BlockDeviceMapping> {
        self.launch_block_device_mappings
            .iter()
            .map(|d| d.mapping.clone())
            .collect()
    }

    /// Omission flags keyed by launch device name.
    pub fn omissions(&self) -> OmissionSet {
        self.launch_block_device_mappings
            .iter()
            .filter(|d| d.omit_from_artifact)
            .map(|d| (d.mapping.device_name.clone(), true))
            .collect()
    }

    /// Whether the image is registered under a temporary name for a later
    /// copy step to finalize.
    pub fn wants_intermediary_image(&self) -> bool {
        self.encrypt_boot == Some(true) || self.skip_build_region
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ami_name.trim().is_empty() {
            return Err(ConfigError::MissingField("ami_name"));
        }
        if self.root_device.device_name.is_empty() {
            return Err(ConfigError::MissingField("root_device.device_name"));
        }
        if self.root_device.source_device_name.is_empty() {
            return Err(ConfigError::MissingField("root_device.source_device_name"));
        }
        if !VIRTUALIZATION_TYPES.contains(&self.ami_virtualization_type.as_str()) {
            return Err(ConfigError::UnsupportedVirtualizationType(
                self.ami_virtualization_type.clone(),
            ));
        }
        if !ARCHITECTURES.contains(&self.architecture.as_str()) {
            return Err(ConfigError::UnsupportedArchitecture(
                self.architecture.clone(),
            ));
        }
        if let Some(mode) = self.boot_mode.as_deref().filter(|m| !m.is_empty()) {
            if !BOOT_MODES.contains(&mode) {
                return Err(ConfigError::UnsupportedBootMode(mode.to_string()));
            }
        }
        Ok(())
    }
}

/// Everything the step consumes from earlier pipeline steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
    pub image: BuildConfig,

    /// Snapshots taken of the launch volumes, by device name.
    #[serde(default)]
    pub snapshot_ids: SnapshotIdLookup,
}

impl BuildPlan {
    /// Parse and validate a TOML build plan.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let plan: Self = toml::from_str(contents)?;
        plan.image.validate()?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amiforge_id::SnapshotId;

    const PLAN: &str = r#"
[image]
ami_name = "web-base"
architecture = "arm64"
ena_support = true
boot_mode = "uefi"

[image.root_device]
source_device_name = "/dev/xvdf"
device_name = "/dev/xvda"

[[image.ami_block_device_mappings]]
device_name = "/dev/xvdb"
virtual_name = "ephemeral0"

[[image.launch_block_device_mappings]]
device_name = "/dev/xvdf"
volume_size = 8
delete_on_termination = true

[[image.launch_block_device_mappings]]
device_name = "/dev/xvdg"
volume_size = 100
omit_from_artifact = true

[snapshot_ids]
"/dev/xvdf" = "snap-0123abcd"
"#;

    #[test]
    fn test_parse_build_plan() {
        let plan = BuildPlan::from_toml_str(PLAN).unwrap();
        let image = &plan.image;

        assert_eq!(image.ami_name, "web-base");
        assert_eq!(image.ami_virtualization_type, "hvm");
        assert_eq!(image.architecture, "arm64");
        assert_eq!(image.ena_support, Some(true));
        assert_eq!(image.encrypt_boot, None);
        assert_eq!(image.root_device.device_name, "/dev/xvda");
        assert_eq!(image.ami_block_device_mappings.len(), 1);
        assert_eq!(image.launch_devices().len(), 2);
        assert_eq!(image.launch_devices()[0].volume_size, Some(8));
        assert_eq!(
            plan.snapshot_ids.get("/dev/xvdf"),
            Some(&SnapshotId::parse("snap-0123abcd").unwrap())
        );
    }

    #[test]
    fn test_omissions_from_launch_flags() {
        let plan = BuildPlan::from_toml_str(PLAN).unwrap();
        let omissions = plan.image.omissions();

        assert_eq!(omissions.len(), 1);
        assert_eq!(omissions.get("/dev/xvdg"), Some(&true));
    }

    #[test]
    fn test_intermediary_image() {
        let mut config = BuildConfig::new("img", RootDeviceSpec::new("/dev/sda1", "/dev/xvda"));
        assert!(!config.wants_intermediary_image());

        config.encrypt_boot = Some(false);
        assert!(!config.wants_intermediary_image());

        config.encrypt_boot = Some(true);
        assert!(config.wants_intermediary_image());

        config.encrypt_boot = None;
        config.skip_build_region = true;
        assert!(config.wants_intermediary_image());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let root = RootDeviceSpec::new("/dev/sda1", "/dev/xvda");

        let config = BuildConfig::new("  ", root.clone());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField("ami_name"))
        ));

        let mut config = BuildConfig::new("img", root.clone());
        config.architecture = "sparc".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedArchitecture(_))
        ));

        let mut config = BuildConfig::new("img", root.clone());
        config.boot_mode = Some("bios".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedBootMode(_))
        ));

        let mut config = BuildConfig::new("img", RootDeviceSpec::new("/dev/sda1", ""));
        config.boot_mode = Some(String::new());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField("root_device.device_name"))
        ));
    }

    #[test]
    fn test_invalid_toml() {
        let err = BuildPlan::from_toml_str("[image]\nami_name = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
