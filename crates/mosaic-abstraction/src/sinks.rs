//! Observability sink capabilities.

use crate::ComponentResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One validation prediction, kept for rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionSample {
    pub text: String,
    pub prediction: f32,
    pub label: f32,
}

/// Intermediate artifacts produced by a validation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisualArtifacts {
    pub epoch: u64,
    pub metrics: BTreeMap<String, f64>,
    pub samples: Vec<PredictionSample>,
}

/// Renders artifacts into a run-scoped directory.
pub trait Visualizer: Send {
    fn kind(&self) -> &'static str;

    fn render(&mut self, step: u64, artifacts: &VisualArtifacts) -> ComponentResult<()>;
}

/// Receives run configuration and scalar streams.
#[async_trait]
pub trait ExperimentTracker: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn log_config(&self, config: &serde_json::Value) -> ComponentResult<()>;

    async fn log_scalar(&self, name: &str, value: f64, step: u64) -> ComponentResult<()>;

    async fn flush(&self) -> ComponentResult<()> {
        Ok(())
    }
}
