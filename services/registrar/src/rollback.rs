//! Deregister-on-abort.
//!
//! The registered image is the step's deliverable, so it is only removed when
//! the pipeline did not finish normally. Rollback runs while the pipeline is
//! already unwinding: a failed deregister is reported once and swallowed.

use amiforge_id::ImageId;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::RollbackWarning;
use crate::service::{Image, ImageService};
use crate::ui::Ui;

/// How the pipeline run ended, as seen at cleanup time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The run completed (or is still completing) normally.
    Continuing,

    /// The run was cancelled from outside.
    Cancelled,

    /// A step failed and halted the run.
    Halted,
}

impl RunOutcome {
    /// Returns true if the run was cancelled or halted.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Halted)
    }
}

/// Result of a cleanup pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Nothing to roll back.
    Skipped,

    /// The image was deregistered.
    Deregistered(ImageId),

    /// Deregistration failed; the image may still exist.
    Warning(RollbackWarning),
}

/// Removes an image created by an aborted run.
pub struct RollbackCoordinator<'a> {
    service: &'a dyn ImageService,
    ui: &'a dyn Ui,
}

impl<'a> RollbackCoordinator<'a> {
    pub fn new(service: &'a dyn ImageService, ui: &'a dyn Ui) -> Self {
        Self { service, ui }
    }

    /// Deregister `image` if the run was aborted.
    ///
    /// `image` is the record retained by a completed registration; `None`
    /// means registration never got that far and there is nothing to undo.
    pub async fn cleanup(&self, image: Option<&Image>, outcome: RunOutcome) -> CleanupOutcome {
        let Some(image) = image else {
            return CleanupOutcome::Skipped;
        };

        if !outcome.is_aborted() {
            return CleanupOutcome::Skipped;
        }

        self.ui
            .say("Deregistering the AMI because cancellation or error...");
        info!(image_id = %image.id, outcome = ?outcome, "Rolling back image");

        match self.service.deregister_image(&image.id).await {
            Ok(()) => CleanupOutcome::Deregistered(image.id.clone()),
            Err(e) => {
                let warning = RollbackWarning(e.to_string());
                warn!(image_id = %image.id, error = %e, "Failed to deregister image");
                self.ui.error(&warning.to_string());
                CleanupOutcome::Warning(warning)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ImageState, MockImageService};
    use crate::ui::RecordingUi;
    use amiforge_id::Region;
    use rstest::rstest;

    fn region() -> Region {
        Region::parse("us-west-2").unwrap()
    }

    fn image() -> Image {
        Image {
            id: ImageId::with_suffix("0abc").unwrap(),
            name: "retained".to_string(),
            state: ImageState::Available,
            root_device_name: Some("/dev/xvda".to_string()),
            block_device_mappings: vec![],
        }
    }

    #[rstest]
    #[case::cancelled(RunOutcome::Cancelled)]
    #[case::halted(RunOutcome::Halted)]
    #[tokio::test]
    async fn test_aborted_run_deregisters(#[case] outcome: RunOutcome) {
        let service = MockImageService::new(region());
        let ui = RecordingUi::new();
        let image = image();

        let result = RollbackCoordinator::new(&service, &ui)
            .cleanup(Some(&image), outcome)
            .await;

        assert_eq!(result, CleanupOutcome::Deregistered(image.id.clone()));
        assert_eq!(service.deregistered(), vec![image.id]);
        assert!(ui.errors().is_empty());
    }

    #[tokio::test]
    async fn test_continuing_run_never_deregisters() {
        let service = MockImageService::new(region());
        let ui = RecordingUi::new();
        let image = image();

        let result = RollbackCoordinator::new(&service, &ui)
            .cleanup(Some(&image), RunOutcome::Continuing)
            .await;

        assert_eq!(result, CleanupOutcome::Skipped);
        assert!(service.calls().is_empty());
        assert!(ui.lines().is_empty());
    }

    #[tokio::test]
    async fn test_no_retained_image_is_noop() {
        let service = MockImageService::new(region());
        let ui = RecordingUi::new();

        let result = RollbackCoordinator::new(&service, &ui)
            .cleanup(None, RunOutcome::Cancelled)
            .await;

        assert_eq!(result, CleanupOutcome::Skipped);
        assert!(service.calls().is_empty());
        assert!(ui.lines().is_empty());
    }

    #[tokio::test]
    async fn test_deregister_failure_is_single_warning() {
        let service = MockImageService::new(region()).failing_deregister("UnauthorizedOperation");
        let ui = RecordingUi::new();
        let image = image();

        let result = RollbackCoordinator::new(&service, &ui)
            .cleanup(Some(&image), RunOutcome::Halted)
            .await;

        assert_eq!(
            result,
            CleanupOutcome::Warning(RollbackWarning("UnauthorizedOperation".to_string()))
        );
        assert_eq!(
            ui.errors(),
            vec!["Error deregistering AMI, may still be around: UnauthorizedOperation".to_string()]
        );
    }

    #[test]
    fn test_run_outcome_is_aborted() {
        assert!(!RunOutcome::Continuing.is_aborted());
        assert!(RunOutcome::Cancelled.is_aborted());
        assert!(RunOutcome::Halted.is_aborted());
    }
}
