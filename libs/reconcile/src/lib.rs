//! Block-device mapping reconciliation.
//!
//! An image is registered with one set of block-device mappings, but that set
//! is specified in two places:
//!
//! - **Image defaults**: mappings declared for the image itself.
//! - **Launch overrides**: mappings the build instance was launched with,
//!   whose volumes have since been snapshotted.
//!
//! [`reconcile`] merges the two into one list the provider will accept.
//!
//! # Invariants
//!
//! - The merged set has at most one entry per device name
//! - An override always replaces a same-named default as a whole (no field merge)
//! - An override that receives a fresh snapshot id inherits encryption from
//!   that snapshot, so its `encrypted` and `kms_key_id` are cleared
//! - A device name flagged for omission never appears in the result, even
//!   when the image defaults declare it
//! - A renamed root override replaces any entry under its source name, so
//!   the boot volume appears once, under its final name
//! - Output order is deterministic (sorted by device name)

use std::collections::BTreeMap;

use amiforge_id::SnapshotId;
use serde::{Deserialize, Serialize};

/// Device name to snapshot id, produced by the snapshot step upstream.
pub type SnapshotIdLookup = BTreeMap<String, SnapshotId>;

/// Device names that must not appear on the final image when `true`.
pub type OmissionSet = BTreeMap<String, bool>;

/// A declaration binding a device name to a volume and its attributes.
///
/// Only `snapshot_id`, `encrypted` and `kms_key_id` are interpreted here;
/// everything else is passed through to the provider untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDeviceMapping {
    /// Device name, e.g. `/dev/sda1`. Identity of the mapping.
    pub device_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<SnapshotId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kms_key_id: Option<String>,

    /// Volume size in GiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_size: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iops: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_on_termination: Option<bool>,

    /// Instance-store name (`ephemeral0`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_name: Option<String>,

    /// Suppresses a device defined by the image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_device: Option<bool>,
}

impl BlockDeviceMapping {
    /// Create a bare mapping for a device name.
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            ..Self::default()
        }
    }

    /// Point this mapping at a snapshot, dropping explicit encryption settings.
    ///
    /// Volumes created from a snapshot inherit its encryption, so any
    /// `encrypted`/`kms_key_id` carried over from the launch spec would be stale.
    pub fn inherit_snapshot(&mut self, snapshot_id: SnapshotId) {
        self.snapshot_id = Some(snapshot_id);
        self.encrypted = None;
        self.kms_key_id = None;
    }
}

/// Declares the boot device rename applied during the merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootDeviceSpec {
    /// Name the boot volume had on the build instance.
    pub source_device_name: String,

    /// Name the boot volume gets on the registered image.
    pub device_name: String,
}

impl RootDeviceSpec {
    pub fn new(source_device_name: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            source_device_name: source_device_name.into(),
            device_name: device_name.into(),
        }
    }
}

/// Working set of mappings keyed by device name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceMap {
    devices: BTreeMap<String, BlockDeviceMapping>,
}

impl DeviceMap {
    /// Seed from a list; later duplicates replace earlier ones.
    pub fn from_mappings<'a, I>(mappings: I) -> Self
    where
        I: IntoIterator<Item = &'a BlockDeviceMapping>,
    {
        let mut map = Self::default();
        for mapping in mappings {
            map.insert(mapping.clone());
        }
        map
    }

    /// Insert or replace under the mapping's device name.
    pub fn insert(&mut self, mapping: BlockDeviceMapping) -> Option<BlockDeviceMapping> {
        self.devices.insert(mapping.device_name.clone(), mapping)
    }

    /// Remove the entry under `device_name`, if any.
    pub fn remove(&mut self, device_name: &str) -> Option<BlockDeviceMapping> {
        self.devices.remove(device_name)
    }

    pub fn get(&self, device_name: &str) -> Option<&BlockDeviceMapping> {
        self.devices.get(device_name)
    }

    pub fn contains(&self, device_name: &str) -> bool {
        self.devices.contains_key(device_name)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Consume into a list sorted by device name.
    pub fn into_vec(self) -> Vec<BlockDeviceMapping> {
        self.devices.into_values().collect()
    }
}

/// The five inputs of a reconciliation, borrowed from their owner.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileInput<'a> {
    pub base: &'a [BlockDeviceMapping],
    pub overrides: &'a [BlockDeviceMapping],
    pub snapshot_ids: &'a SnapshotIdLookup,
    pub omissions: &'a OmissionSet,
    pub root: &'a RootDeviceSpec,
}

impl ReconcileInput<'_> {
    /// Merge into a working set.
    pub fn merge(&self) -> DeviceMap {
        // Omitted names are dropped from the defaults too.
        let mut devices = DeviceMap::from_mappings(
            self.base
                .iter()
                .filter(|d| !is_omitted(self.omissions, &d.device_name)),
        );

        for launch in self.overrides {
            if is_omitted(self.omissions, &launch.device_name) {
                continue;
            }

            let mut device = launch.clone();
            if let Some(snapshot_id) = self.snapshot_ids.get(&device.device_name) {
                device.inherit_snapshot(snapshot_id.clone());
            }
            if device.device_name == self.root.source_device_name {
                // The renamed entry takes the place of the source entry.
                devices.remove(&self.root.source_device_name);
                device.device_name = self.root.device_name.clone();
            }
            devices.insert(device);
        }

        devices
    }

    /// Merge and return the final list, sorted by device name.
    pub fn reconcile(&self) -> Vec<BlockDeviceMapping> {
        self.merge().into_vec()
    }
}

/// Merge image defaults with launch overrides.
///
/// See the crate docs for the rules. Inputs are not modified.
pub fn reconcile(
    base: &[BlockDeviceMapping],
    overrides: &[BlockDeviceMapping],
    snapshot_ids: &SnapshotIdLookup,
    omissions: &OmissionSet,
    root: &RootDeviceSpec,
) -> Vec<BlockDeviceMapping> {
    ReconcileInput {
        base,
        overrides,
        snapshot_ids,
        omissions,
        root,
    }
    .reconcile()
}

/// Snapshot ids referenced by a list of mappings, in list order.
pub fn snapshot_ids<'a, I>(mappings: I) -> Vec<SnapshotId>
where
    I: IntoIterator<Item = &'a BlockDeviceMapping>,
{
    mappings
        .into_iter()
        .filter_map(|m| m.snapshot_id.clone())
        .collect()
}

fn is_omitted(omissions: &OmissionSet, device_name: &str) -> bool {
    omissions.get(device_name).copied().unwrap_or(false)
}
