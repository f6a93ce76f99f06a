//! Image service interface and mock implementation.
//!
//! The image service abstracts the provider calls the registrar depends on:
//! - Registering an image from block-device mappings
//! - Describing an image (authoritative record)
//! - Deregistering an image
//!
//! A mock implementation is provided for testing and dry runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use amiforge_id::{ImageId, Region, SnapshotId};
use amiforge_reconcile::BlockDeviceMapping;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Errors from the image service transport.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    /// The provider refused the request (e.g. a duplicate image name).
    #[error("{0}")]
    Rejected(String),

    #[error("invalid response: {0}")]
    Decode(String),
}

/// Provider-side lifecycle state of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageState {
    Pending,
    Transient,
    Available,
    Invalid,
    Deregistered,
    Failed,
    Error,
    Disabled,
    /// Any state this client does not know about.
    #[serde(other)]
    Unknown,
}

impl ImageState {
    /// True while the provider is still working on the image.
    pub fn is_settling(&self) -> bool {
        matches!(self, Self::Pending | Self::Transient)
    }
}

impl std::fmt::Display for ImageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Transient => "transient",
            Self::Available => "available",
            Self::Invalid => "invalid",
            Self::Deregistered => "deregistered",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::Disabled => "disabled",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Authoritative image record as returned by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: ImageId,
    pub name: String,
    pub state: ImageState,
    #[serde(default)]
    pub root_device_name: Option<String>,
    #[serde(default)]
    pub block_device_mappings: Vec<BlockDeviceMapping>,
}

impl Image {
    /// Snapshot ids referenced by this image's mappings, in mapping order.
    pub fn snapshot_ids(&self) -> Vec<SnapshotId> {
        amiforge_reconcile::snapshot_ids(&self.block_device_mappings)
    }
}

/// Create-image request.
///
/// Optional capability flags are only sent when requested; `None` means
/// "provider default", never an explicit "disabled".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterImageRequest {
    pub name: String,
    pub architecture: String,
    pub root_device_name: String,
    pub virtualization_type: String,
    pub block_device_mappings: Vec<BlockDeviceMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ena_support: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sriov_net_support: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_mode: Option<String>,
}

/// Image service bound to a single region.
#[async_trait]
pub trait ImageService: Send + Sync {
    /// Region every call is issued against.
    fn region(&self) -> &Region;

    /// Submit a create-image request. Success only means it was accepted.
    async fn register_image(&self, request: &RegisterImageRequest) -> Result<ImageId, ServiceError>;

    /// Fetch the current record, `None` if the provider doesn't know the id.
    async fn describe_image(&self, id: &ImageId) -> Result<Option<Image>, ServiceError>;

    /// Best-effort teardown.
    async fn deregister_image(&self, id: &ImageId) -> Result<(), ServiceError>;

    /// Current lifecycle state, used by availability polling.
    async fn image_state(&self, id: &ImageId) -> Result<Option<ImageState>, ServiceError> {
        Ok(self.describe_image(id).await?.map(|image| image.state))
    }
}

/// A call observed by [`MockImageService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Register(RegisterImageRequest),
    Describe(ImageId),
    PollState(ImageId),
    Deregister(ImageId),
}

struct MockImage {
    image: Image,
    pending_polls: u32,
}

/// In-memory image service for tests and dry runs.
pub struct MockImageService {
    region: Region,

    /// Counter for generating image ids.
    counter: AtomicU64,

    images: Mutex<BTreeMap<ImageId, MockImage>>,
    calls: Mutex<Vec<MockCall>>,

    fail_register: Option<String>,
    fail_describe: Option<String>,
    fail_deregister: Option<String>,

    /// Number of state polls answered with `pending` before settling.
    pending_polls: u32,
    settled_state: ImageState,

    /// Mappings the provider adds on its own (e.g. defaults of the root volume).
    provider_mappings: Vec<BlockDeviceMapping>,
}

impl MockImageService {
    /// Create a mock service whose images become available on the first poll.
    pub fn new(region: Region) -> Self {
        Self {
            region,
            counter: AtomicU64::new(0),
            images: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            fail_register: None,
            fail_describe: None,
            fail_deregister: None,
            pending_polls: 0,
            settled_state: ImageState::Available,
            provider_mappings: Vec::new(),
        }
    }

    /// Reject every register call with `message`.
    pub fn failing_register(mut self, message: impl Into<String>) -> Self {
        self.fail_register = Some(message.into());
        self
    }

    /// Fail every describe call with `message`. State polls are unaffected.
    pub fn failing_describe(mut self, message: impl Into<String>) -> Self {
        self.fail_describe = Some(message.into());
        self
    }

    /// Fail every deregister call with `message`.
    pub fn failing_deregister(mut self, message: impl Into<String>) -> Self {
        self.fail_deregister = Some(message.into());
        self
    }

    /// Answer `polls` state polls with `pending` before settling.
    pub fn pending_for(mut self, polls: u32) -> Self {
        self.pending_polls = polls;
        self
    }

    /// State images settle in once the pending polls are used up.
    pub fn settling_in(mut self, state: ImageState) -> Self {
        self.settled_state = state;
        self
    }

    /// Mappings appended to every registered image.
    pub fn with_provider_mappings(mut self, mappings: Vec<BlockDeviceMapping>) -> Self {
        self.provider_mappings = mappings;
        self
    }

    /// All calls made so far, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    /// Register requests received so far.
    pub fn register_requests(&self) -> Vec<RegisterImageRequest> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Register(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    /// Ids passed to deregister so far.
    pub fn deregistered(&self) -> Vec<ImageId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Deregister(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Current record of an image, bypassing failure injection.
    pub fn image(&self, id: &ImageId) -> Option<Image> {
        lock(&self.images).get(id).map(|entry| entry.image.clone())
    }

    fn record(&self, call: MockCall) {
        lock(&self.calls).push(call);
    }

    fn next_image_id(&self) -> Result<ImageId, ServiceError> {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst);
        ImageId::with_suffix(&format!("{:017x}", counter))
            .map_err(|e| ServiceError::Decode(e.to_string()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl ImageService for MockImageService {
    fn region(&self) -> &Region {
        &self.region
    }

    async fn register_image(&self, request: &RegisterImageRequest) -> Result<ImageId, ServiceError> {
        self.record(MockCall::Register(request.clone()));

        if let Some(message) = &self.fail_register {
            return Err(ServiceError::Rejected(message.clone()));
        }

        let id = self.next_image_id()?;
        info!(
            image_id = %id,
            name = %request.name,
            mappings = request.block_device_mappings.len(),
            "[MOCK] Registered image"
        );

        let mut block_device_mappings = request.block_device_mappings.clone();
        block_device_mappings.extend(self.provider_mappings.iter().cloned());

        let image = Image {
            id: id.clone(),
            name: request.name.clone(),
            state: ImageState::Pending,
            root_device_name: Some(request.root_device_name.clone()),
            block_device_mappings,
        };
        lock(&self.images).insert(
            id.clone(),
            MockImage {
                image,
                pending_polls: self.pending_polls,
            },
        );

        Ok(id)
    }

    async fn describe_image(&self, id: &ImageId) -> Result<Option<Image>, ServiceError> {
        self.record(MockCall::Describe(id.clone()));

        if let Some(message) = &self.fail_describe {
            return Err(ServiceError::Rejected(message.clone()));
        }

        Ok(self.image(id))
    }

    async fn deregister_image(&self, id: &ImageId) -> Result<(), ServiceError> {
        self.record(MockCall::Deregister(id.clone()));

        if let Some(message) = &self.fail_deregister {
            return Err(ServiceError::Rejected(message.clone()));
        }

        if let Some(entry) = lock(&self.images).get_mut(id) {
            entry.image.state = ImageState::Deregistered;
        }
        debug!(image_id = %id, "[MOCK] Deregistered image");
        Ok(())
    }

    async fn image_state(&self, id: &ImageId) -> Result<Option<ImageState>, ServiceError> {
        self.record(MockCall::PollState(id.clone()));

        let mut images = lock(&self.images);
        let Some(entry) = images.get_mut(id) else {
            return Ok(None);
        };

        if entry.image.state == ImageState::Pending {
            if entry.pending_polls > 0 {
                entry.pending_polls -= 1;
            } else {
                entry.image.state = self.settled_state;
            }
        }

        Ok(Some(entry.image.state))
    }
}
