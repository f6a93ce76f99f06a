//! Image registration state machine.
//!
//! ```text
//! Idle → Registering → WaitingAvailable → DescribingMetadata → Ready
//!            │                │                   │
//!            └────────────────┴───────────────────┴──→ Failed
//! ```
//!
//! The image id is published as soon as the provider accepts the request, so a
//! cleanup path can find it even if the run is aborted during the wait.

use amiforge_reconcile::BlockDeviceMapping;
use rand::distr::{Alphanumeric, SampleString};
use tracing::{debug, info, warn};

use crate::config::BuildConfig;
use crate::error::StepError;
use crate::service::{Image, RegisterImageRequest};
use crate::step::{StepContext, StepOutputs};

/// Length of the temporary name given to intermediary images.
pub const PLACEHOLDER_NAME_LEN: usize = 7;

/// SR-IOV mode sent when SR-IOV networking is requested.
pub const SRIOV_NET_SUPPORT_MODE: &str = "simple";

/// Registrar lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrarPhase {
    Idle,
    Registering,
    WaitingAvailable,
    DescribingMetadata,
    Ready,
    Failed,
}

impl RegistrarPhase {
    /// Returns true if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

/// Random alphanumeric name for an image that a later step re-creates.
pub fn placeholder_name() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), PLACEHOLDER_NAME_LEN)
}

/// Build the create-image request for `config`.
///
/// Capability flags are attached only when requested.
pub fn build_request(
    config: &BuildConfig,
    name: String,
    block_device_mappings: Vec<BlockDeviceMapping>,
) -> RegisterImageRequest {
    RegisterImageRequest {
        name,
        architecture: config.architecture.clone(),
        root_device_name: config.root_device.device_name.clone(),
        virtualization_type: config.ami_virtualization_type.clone(),
        block_device_mappings,
        ena_support: (config.ena_support == Some(true)).then_some(true),
        sriov_net_support: config
            .sriov_support
            .then(|| SRIOV_NET_SUPPORT_MODE.to_string()),
        boot_mode: config.boot_mode.clone().filter(|mode| !mode.is_empty()),
    }
}

/// Drives register → wait → describe against the image service.
#[derive(Debug)]
pub struct ImageRegistrar {
    phase: RegistrarPhase,

    /// Authoritative record, retained for rollback once `Ready`.
    image: Option<Image>,
}

impl Default for ImageRegistrar {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageRegistrar {
    pub fn new() -> Self {
        Self {
            phase: RegistrarPhase::Idle,
            image: None,
        }
    }

    pub fn phase(&self) -> RegistrarPhase {
        self.phase
    }

    /// The image fetched after a successful registration.
    pub fn image(&self) -> Option<&Image> {
        self.image.as_ref()
    }

    /// Register an image and wait until the provider reports it available.
    ///
    /// Writes `amis[region]` right after the provider accepts the request and
    /// `snapshots[region]` once the authoritative record is fetched. Errors
    /// are returned, not reported; the caller owns user-facing output.
    pub async fn register(
        &mut self,
        ctx: &StepContext<'_>,
        request: RegisterImageRequest,
        outputs: &mut StepOutputs,
    ) -> Result<&Image, StepError> {
        let region = ctx.service.region().clone();

        self.transition(RegistrarPhase::Registering);
        let image_id = match ctx.service.register_image(&request).await {
            Ok(id) => id,
            Err(e) => return Err(self.fail(StepError::Registration(e.to_string()))),
        };

        ctx.ui.say(&format!("AMI: {image_id}"));
        outputs.publish_image(region.clone(), image_id.clone());

        self.transition(RegistrarPhase::WaitingAvailable);
        ctx.ui.say("Waiting for AMI to become ready...");
        if let Err(e) = ctx
            .waiter
            .wait_until_available(ctx.service, &image_id, ctx.shutdown.clone())
            .await
        {
            return Err(self.fail(e.into()));
        }

        self.transition(RegistrarPhase::DescribingMetadata);
        let image = match ctx.service.describe_image(&image_id).await {
            Ok(Some(image)) => image,
            Ok(None) => {
                let message = format!("image {image_id} not found");
                return Err(self.fail(StepError::MetadataFetch(message)));
            }
            Err(e) => return Err(self.fail(StepError::MetadataFetch(e.to_string()))),
        };

        let snapshots = image.snapshot_ids();
        debug!(
            image_id = %image.id,
            snapshot_count = snapshots.len(),
            "Recorded image snapshots"
        );
        outputs.publish_snapshots(region, snapshots);

        self.transition(RegistrarPhase::Ready);
        Ok(self.image.insert(image))
    }

    fn transition(&mut self, next: RegistrarPhase) {
        info!(from = ?self.phase, to = ?next, "Registrar phase change");
        self.phase = next;
    }

    fn fail(&mut self, err: StepError) -> StepError {
        warn!(phase = ?self.phase, error = %err, "Registration failed");
        self.phase = RegistrarPhase::Failed;
        err
    }
}
