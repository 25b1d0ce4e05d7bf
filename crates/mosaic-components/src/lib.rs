//! Reference collaborators for Mosaic.
//!
//! This crate provides concrete implementations of the traits in
//! `mosaic-abstraction`. Every type exposes a `KIND` (or `NAME` for metrics)
//! constant, which is the string used as `type` in a run configuration, and a
//! `from_args` constructor taking the merged argument map.
//!
//! # Components
//!
//! - **Tokenizers**: `hashing-bow`, `byte-level`
//! - **Data loaders**: `JsonlDataLoader`, `SyntheticDataLoader`
//! - **Models**: `LinearFusion`, `GatedExpertFusion`
//! - **Losses**: `MseLoss`, `BceWithLogitsLoss`
//! - **Metrics**: `accuracy`, `mean_absolute_error`, `mean_squared_error`, `max_abs_error`
//! - **Optimizers**: `SGD`, `AdamW`
//! - **Schedulers**: `get_linear_schedule_with_warmup`, `get_constant_schedule_with_warmup`, `StepLR`
//! - **Sinks**: `HtmlVisualizer`, local and remote experiment trackers

pub mod data;
pub mod fusion;
pub mod loss;
pub mod metric;
pub mod optim;
pub mod scheduler;
pub mod tokenizer;
pub mod tracker;
pub mod visualizer;

pub use data::{JsonlDataLoader, SampleLoader, SyntheticDataLoader};
pub use fusion::{GatedExpertFusion, LinearFusion, TextParams};
pub use loss::{BceWithLogitsLoss, MseLoss};
pub use metric::{Accuracy, MaxAbsError, MeanAbsoluteError, MeanSquaredError};
pub use optim::{AdamW, Sgd};
pub use scheduler::{ConstantWarmupSchedule, LinearWarmupSchedule, StepLr};
pub use tokenizer::{ByteTokenizer, HashingTokenizer};
pub use tracker::{LocalTracker, RemoteTracker, TrackerCredentials};
pub use visualizer::HtmlVisualizer;
