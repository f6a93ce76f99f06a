//! Availability polling for freshly registered images.
//!
//! Registration is asynchronous on the provider side: a successful register
//! call only means the request was accepted. [`ImageWaiter`] polls the image
//! state until it becomes `available`, settles in a terminal failure state,
//! runs out of attempts, or the pipeline's shutdown signal fires.

use std::time::{Duration, Instant};

use amiforge_id::ImageId;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::service::{ImageService, ImageState};

/// Default delay between polls.
pub const DEFAULT_POLL_DELAY: Duration = Duration::from_secs(15);

/// Default number of polls before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 40;

/// Errors from waiting on an image.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timed out after {attempts} attempts ({elapsed:?})")]
    Timeout { attempts: u32, elapsed: Duration },

    #[error("cancelled")]
    Cancelled,

    #[error("image {image_id} entered state '{state}'")]
    Failed { image_id: ImageId, state: ImageState },

    #[error("image {0} not found")]
    NotFound(ImageId),
}

impl WaitError {
    /// Returns true if the wait ran out of attempts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Polling policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingConfig {
    /// Delay between polls.
    pub delay: Duration,

    /// Maximum number of polls.
    pub max_attempts: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            delay: DEFAULT_POLL_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl PollingConfig {
    /// Load polling overrides from the environment.
    ///
    /// `AWS_POLL_DELAY_SECONDS` and `AWS_MAX_ATTEMPTS` are honoured when they
    /// parse to a positive number; anything else falls back to the default.
    pub fn from_env() -> Self {
        let delay = std::env::var("AWS_POLL_DELAY_SECONDS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_DELAY);

        let max_attempts = std::env::var("AWS_MAX_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);

        Self {
            delay,
            max_attempts,
        }
    }
}

/// Blocks until an image is available.
#[derive(Debug, Clone, Default)]
pub struct ImageWaiter {
    config: PollingConfig,
}

impl ImageWaiter {
    pub fn new(config: PollingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    /// Poll until `image_id` is available.
    ///
    /// A shutdown signal (already set, or set while waiting) wins over any
    /// in-flight poll and yields [`WaitError::Cancelled`]. Transport errors
    /// during a poll use up an attempt and are otherwise ignored.
    pub async fn wait_until_available(
        &self,
        service: &dyn ImageService,
        image_id: &ImageId,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), WaitError> {
        let start = Instant::now();
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let polled = tokio::select! {
                biased;
                _ = cancelled(&mut shutdown) => return Err(WaitError::Cancelled),
                polled = service.image_state(image_id) => polled,
            };

            match polled {
                Ok(Some(ImageState::Available)) => {
                    info!(
                        image_id = %image_id,
                        attempts = attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Image available"
                    );
                    return Ok(());
                }
                Ok(Some(state)) if state.is_settling() => {
                    debug!(image_id = %image_id, attempt, state = %state, "Image still pending");
                }
                Ok(Some(state)) => {
                    return Err(WaitError::Failed {
                        image_id: image_id.clone(),
                        state,
                    });
                }
                Ok(None) => return Err(WaitError::NotFound(image_id.clone())),
                Err(e) => {
                    debug!(image_id = %image_id, attempt, error = %e, "Poll failed, will retry");
                }
            }

            if attempt == max_attempts {
                break;
            }

            tokio::select! {
                biased;
                _ = cancelled(&mut shutdown) => return Err(WaitError::Cancelled),
                _ = tokio::time::sleep(self.config.delay) => {}
            }
        }

        Err(WaitError::Timeout {
            attempts: max_attempts,
            elapsed: start.elapsed(),
        })
    }
}

/// Resolves once shutdown is signalled. Never resolves if the sender is gone.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{MockImageService, RegisterImageRequest};
    use amiforge_id::Region;
    use rstest::rstest;

    fn fast() -> ImageWaiter {
        ImageWaiter::new(PollingConfig {
            delay: Duration::from_millis(5),
            max_attempts: 5,
        })
    }

    async fn registered(service: &MockImageService) -> ImageId {
        let request = RegisterImageRequest {
            name: "waiter-test".to_string(),
            architecture: "x86_64".to_string(),
            root_device_name: "/dev/xvda".to_string(),
            virtualization_type: "hvm".to_string(),
            block_device_mappings: vec![],
            ena_support: None,
            sriov_net_support: None,
            boot_mode: None,
        };
        service.register_image(&request).await.unwrap()
    }

    fn region() -> Region {
        Region::parse("eu-west-1").unwrap()
    }

    #[test]
    fn test_polling_config_default() {
        let config = PollingConfig::default();
        assert_eq!(config.delay, Duration::from_secs(15));
        assert_eq!(config.max_attempts, 40);
    }

    #[tokio::test]
    async fn test_wait_succeeds_after_pending() {
        let service = MockImageService::new(region()).pending_for(2);
        let id = registered(&service).await;
        let (_tx, rx) = watch::channel(false);

        fast()
            .wait_until_available(&service, &id, rx)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let service = MockImageService::new(region()).pending_for(u32::MAX);
        let id = registered(&service).await;
        let (_tx, rx) = watch::channel(false);

        let err = fast()
            .wait_until_available(&service, &id, rx)
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(matches!(err, WaitError::Timeout { attempts: 5, .. }));
    }

    #[test]
    fn test_waiter_keeps_config() {
        let config = PollingConfig {
            delay: Duration::from_secs(2),
            max_attempts: 3,
        };
        assert_eq!(ImageWaiter::new(config.clone()).config(), &config);
    }

    #[rstest]
    #[case::failed(ImageState::Failed)]
    #[case::disabled(ImageState::Disabled)]
    #[case::unrecognised(ImageState::Unknown)]
    #[tokio::test]
    async fn test_wait_fails_fast_on_terminal_state(#[case] state: ImageState) {
        let service = MockImageService::new(region()).settling_in(state);
        let id = registered(&service).await;
        let (_tx, rx) = watch::channel(false);

        let err = fast()
            .wait_until_available(&service, &id, rx)
            .await
            .unwrap_err();

        assert!(matches!(err, WaitError::Failed { state: s, .. } if s == state));
        // One register, one poll.
        assert_eq!(service.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_wait_treats_transient_as_pending() {
        let service = MockImageService::new(region()).settling_in(ImageState::Transient);
        let id = registered(&service).await;
        let (_tx, rx) = watch::channel(false);

        let err = fast()
            .wait_until_available(&service, &id, rx)
            .await
            .unwrap_err();

        assert!(matches!(err, WaitError::Timeout { attempts: 5, .. }));
    }

    #[tokio::test]
    async fn test_wait_unknown_image() {
        let service = MockImageService::new(region());
        let id = ImageId::with_suffix("gone").unwrap();
        let (_tx, rx) = watch::channel(false);

        let err = fast()
            .wait_until_available(&service, &id, rx)
            .await
            .unwrap_err();

        assert!(matches!(err, WaitError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_wait_already_cancelled_does_not_poll() {
        let service = MockImageService::new(region());
        let id = registered(&service).await;
        let (_tx, rx) = watch::channel(true);

        let err = fast()
            .wait_until_available(&service, &id, rx)
            .await
            .unwrap_err();

        assert!(matches!(err, WaitError::Cancelled));
        assert_eq!(service.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_wait_cancelled_while_pending() {
        let service = MockImageService::new(region()).pending_for(u32::MAX);
        let id = registered(&service).await;
        let (tx, rx) = watch::channel(false);
        let waiter = ImageWaiter::new(PollingConfig {
            delay: Duration::from_millis(10),
            max_attempts: 10_000,
        });

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            tx.send(true).unwrap();
        });

        let started = Instant::now();
        let err = waiter
            .wait_until_available(&service, &id, rx)
            .await
            .unwrap_err();

        assert!(matches!(err, WaitError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_dropped_sender_means_not_cancelled() {
        let service = MockImageService::new(region()).pending_for(1);
        let id = registered(&service).await;
        let (tx, rx) = watch::channel(false);
        drop(tx);

        fast()
            .wait_until_available(&service, &id, rx)
            .await
            .unwrap();
    }
}
