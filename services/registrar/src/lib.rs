//! amiforge image registrar
//!
//! One step of a machine-image build pipeline. Given the snapshots produced by
//! earlier steps and the build's block-device layout, it registers a bootable
//! image, waits for it to become available, and records the image and snapshot
//! ids for the steps that follow. If the pipeline is cancelled or halts later
//! on, the step's cleanup deregisters the image again.
//!
//! ## Architecture
//!
//! ```text
//! RegisterImageStep
//! ├── reconcile()           (merge image + launch device mappings)
//! ├── ImageRegistrar        (register → wait → describe)
//! │   └── ImageWaiter       (poll until available, honours shutdown)
//! └── RollbackCoordinator   (deregister on cancel/halt)
//! ```
//!
//! ## Modules
//!
//! - `client`: HTTP transport for the image service
//! - `service`: `ImageService` interface, provider types and an in-memory mock
//! - `waiter`: availability polling
//! - `registrar`: registration state machine
//! - `rollback`: deregister-on-abort
//! - `step`: pipeline-facing controller and typed inputs/outputs

pub mod client;
pub mod config;
pub mod error;
pub mod registrar;
pub mod rollback;
pub mod service;
pub mod step;
pub mod ui;
pub mod waiter;

// Re-export commonly used types
pub use client::HttpImageService;
pub use config::{BuildConfig, BuildPlan, ConfigError, ServiceConfig};
pub use error::{RollbackWarning, StepError};
pub use registrar::{ImageRegistrar, RegistrarPhase};
pub use rollback::{CleanupOutcome, RollbackCoordinator, RunOutcome};
pub use service::{Image, ImageService, ImageState, MockImageService, RegisterImageRequest};
pub use step::{RegisterImageStep, StepAction, StepContext, StepOutputs};
pub use ui::{RecordingUi, TracingUi, Ui};
pub use waiter::{ImageWaiter, PollingConfig, WaitError};
