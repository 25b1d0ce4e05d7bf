//! Mosaic Training
//!
//! Configuration-driven training orchestration for text + expert-feature
//! models:
//! - Resolving a run configuration against typed component namespaces
//! - Building data loaders, model, loss, metrics, optimizer and scheduler
//! - Driving a resumable epoch loop with a per-epoch sample budget
//! - Atomic checkpoints, best-model tracking and early stopping

pub mod builder;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod layout;
pub mod namespaces;
pub mod registry;
pub mod sinks;
pub mod state;
pub mod trainer;

pub use builder::{build_components, build_components_with, Components};
pub use checkpoint::{
    Checkpoint, CheckpointSlot, CheckpointStore, ComponentSnapshot, ModelSnapshot, BEST_CHECKPOINT_FILE, CONFIG_FILE,
    CHECKPOINT_FORMAT_VERSION,
};
pub use config::{
    parse_device, parse_override, ConfigContext, ConfigDraft, Monitor, RunConfiguration, RunOptions, TrainerSettings,
};
pub use error::{TrainingError, TrainingResult};
pub use layout::RunLayout;
pub use namespaces::{Namespaces, REQUIRED_SECTIONS};
pub use registry::{ComponentSpec, Namespace, OverridePolicy};
pub use sinks::{select_tracker, Sinks};
pub use state::{MetricTracker, TrainingState};
pub use trainer::{Phase, TrainOutcome, Termination, Trainer};
pub use tokio_util::sync::CancellationToken;
