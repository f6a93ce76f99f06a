//! Pipeline-facing controller for the registration step.
//!
//! Inputs are passed in as a borrowed [`StepContext`] and results are written
//! into [`StepOutputs`]; the step never reads back what it wrote.

use std::collections::BTreeMap;

use amiforge_id::{ImageId, Region, SnapshotId};
use amiforge_reconcile::{ReconcileInput, SnapshotIdLookup};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::BuildConfig;
use crate::error::StepError;
use crate::registrar::{self, ImageRegistrar, RegistrarPhase};
use crate::rollback::{CleanupOutcome, RollbackCoordinator, RunOutcome};
use crate::service::ImageService;
use crate::ui::Ui;
use crate::waiter::ImageWaiter;

/// What the pipeline should do after a step ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    Continue,
    Halt,
}

/// Read-only inputs of the step.
pub struct StepContext<'a> {
    pub config: &'a BuildConfig,

    /// Snapshots of the launch volumes, by device name.
    pub snapshot_ids: &'a SnapshotIdLookup,

    /// Image service bound to the build region.
    pub service: &'a dyn ImageService,

    pub waiter: &'a ImageWaiter,
    pub ui: &'a dyn Ui,

    /// Pipeline cancellation signal.
    pub shutdown: watch::Receiver<bool>,
}

/// Values the step publishes for later steps.
///
/// Each field is written at most once; `None` means "never written".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepOutputs {
    /// Region to registered image id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amis: Option<BTreeMap<Region, ImageId>>,

    /// Region to the snapshots actually referenced by the registered image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshots: Option<BTreeMap<Region, Vec<SnapshotId>>>,

    /// Whether the image carries a temporary name pending a copy step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intermediary_image: Option<bool>,

    /// The fatal error that halted the step.
    #[serde(skip)]
    pub error: Option<StepError>,
}

impl StepOutputs {
    pub fn publish_image(&mut self, region: Region, image_id: ImageId) {
        self.amis
            .get_or_insert_with(BTreeMap::new)
            .insert(region, image_id);
    }

    /// Record the image's snapshots. Regions without any are left out.
    pub fn publish_snapshots(&mut self, region: Region, snapshot_ids: Vec<SnapshotId>) {
        let snapshots = self.snapshots.get_or_insert_with(BTreeMap::new);
        if !snapshot_ids.is_empty() {
            snapshots.insert(region, snapshot_ids);
        }
    }
}

/// Registers the build's image and rolls it back on abort.
#[derive(Debug, Default)]
pub struct RegisterImageStep {
    registrar: ImageRegistrar,
}

impl RegisterImageStep {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> RegistrarPhase {
        self.registrar.phase()
    }

    /// Run the step. Fatal errors are recorded in `outputs.error`, reported
    /// once through the UI, and turn into [`StepAction::Halt`].
    pub async fn run(&mut self, ctx: &StepContext<'_>, outputs: &mut StepOutputs) -> StepAction {
        ctx.ui.say("Registering the AMI...");

        let config = ctx.config;
        let devices = ReconcileInput {
            base: &config.ami_block_device_mappings,
            overrides: &config.launch_devices(),
            snapshot_ids: ctx.snapshot_ids,
            omissions: &config.omissions(),
            root: &config.root_device,
        }
        .reconcile();

        let intermediary = config.wants_intermediary_image();
        outputs.intermediary_image = Some(intermediary);
        let name = if intermediary {
            registrar::placeholder_name()
        } else {
            config.ami_name.clone()
        };

        info!(
            region = %ctx.service.region(),
            name = %name,
            intermediary,
            device_count = devices.len(),
            "Registering image"
        );

        let request = registrar::build_request(config, name, devices);
        match self.registrar.register(ctx, request, outputs).await {
            Ok(image) => {
                info!(image_id = %image.id, "Image registered");
                StepAction::Continue
            }
            Err(e) => {
                error!(error = %e, "Image registration step failed");
                ctx.ui.error(&e.to_string());
                outputs.error = Some(e);
                StepAction::Halt
            }
        }
    }

    /// Deregister the image if the run was aborted. Always safe to call.
    pub async fn cleanup(&self, ctx: &StepContext<'_>, outcome: RunOutcome) -> CleanupOutcome {
        RollbackCoordinator::new(ctx.service, ctx.ui)
            .cleanup(self.registrar.image(), outcome)
            .await
    }
}
