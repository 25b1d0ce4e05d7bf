//! Collaborator abstraction layer for Mosaic.
//!
//! This crate defines the traits and value types the training core talks to:
//! data providers, tokenizers, models, objectives, optimizers, schedulers and
//! the observability sinks. Concrete implementations live in
//! `mosaic-components`; the orchestration core in `mosaic-training` only ever
//! sees the traits defined here.

pub mod data;
pub mod experts;
pub mod model;
pub mod optim;
pub mod sinks;

pub use data::{Batch, BatchIter, DataLoader, EncodedBatch, Sample, Split};
pub use experts::ExpertStreamSet;
pub use model::{Aggregation, Device, Loss, LossOutput, Metric, Model, ModelContext, Tokenizer};
pub use optim::{LrScheduler, Optimizer, OptimizerContext, ScheduleGranularity, SchedulerContext};
pub use sinks::{ExperimentTracker, PredictionSample, VisualArtifacts, Visualizer};

use serde::de::DeserializeOwned;
use thiserror::Error;

/// Keyword arguments handed to a component constructor.
///
/// This is the merged `args` mapping of a `{type, args}` configuration entry.
pub type ComponentArgs = serde_json::Map<String, serde_json::Value>;

/// Result type for collaborator operations.
pub type ComponentResult<T> = std::result::Result<T, ComponentError>;

/// Represents an error raised by a collaborator (data, model, optimizer, sink).
#[derive(Error, Debug)]
pub enum ComponentError {
    /// Constructor arguments could not be interpreted.
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// The dataset could not be loaded or is inconsistent.
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Input features do not match the shape a component was built for.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A numerical result was not finite.
    #[error("Numerical error: {0}")]
    Numerical(String),

    /// Persisted state could not be restored.
    #[error("State error: {0}")]
    State(String),

    /// An observability sink failed.
    #[error("Sink error: {0}")]
    Sink(String),

    /// A remote backend was selected without credentials.
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Deserializes typed constructor arguments from a merged argument map.
///
/// # Errors
/// Returns `ComponentError::InvalidArguments` when a field is missing, has the
/// wrong type, or is not recognised by `T`.
pub fn parse_args<T: DeserializeOwned>(args: &ComponentArgs) -> ComponentResult<T> {
    serde_json::from_value(serde_json::Value::Object(args.clone()))
        .map_err(|e| ComponentError::InvalidArguments(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Args {
        lr: f64,
        #[serde(default)]
        momentum: f64,
    }

    #[test]
    fn test_parse_args_applies_defaults() {
        let mut args = ComponentArgs::new();
        args.insert("lr".to_string(), serde_json::json!(0.1));
        let parsed: Args = parse_args(&args).unwrap();
        assert!((parsed.lr - 0.1).abs() < f64::EPSILON);
        assert!(parsed.momentum.abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_args_rejects_unknown_fields() {
        let mut args = ComponentArgs::new();
        args.insert("lr".to_string(), serde_json::json!(0.1));
        args.insert("lrr".to_string(), serde_json::json!(0.2));
        let err = parse_args::<Args>(&args).unwrap_err();
        assert!(matches!(err, ComponentError::InvalidArguments(_)));
    }
}
