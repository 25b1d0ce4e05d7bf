//! Model assembly and objective contracts.

use crate::data::EncodedBatch;
use crate::experts::ExpertStreamSet;
use crate::ComponentResult;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Turns raw text into token ids.
pub trait Tokenizer: Send + Sync {
    fn kind(&self) -> &'static str;

    fn vocab_size(&self) -> usize;

    fn encode(&self, text: &str) -> Vec<u32>;
}

/// Compute device requested for the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    /// Pick whatever the model layer supports.
    #[default]
    Auto,
    Cpu,
    /// Accelerator indices, e.g. `-d 0,1`.
    Accelerators(Vec<usize>),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Cpu => f.write_str("cpu"),
            Self::Accelerators(ids) => {
                let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
                write!(f, "accelerators[{}]", ids.join(","))
            }
        }
    }
}

/// Positional context handed to model constructors.
#[derive(Debug, Clone)]
pub struct ModelContext {
    /// Vocabulary size of the tokenizer built for this run.
    pub vocab_size: usize,
    pub device: Device,
}

/// A trainable model with analytic gradients.
///
/// The parameter vector returned by `parameters` holds the trainable
/// parameters only; it is what the optimizer updates and what checkpoints
/// persist.
pub trait Model: Send {
    /// Registered type name of this model.
    fn kind(&self) -> &'static str;

    /// Expert streams this model was shaped for.
    fn expert_streams(&self) -> &ExpertStreamSet;

    fn parameters(&self) -> &[f32];

    fn parameters_mut(&mut self) -> &mut [f32];

    fn num_parameters(&self) -> usize {
        self.parameters().len()
    }

    /// One output per sample.
    fn forward(&self, batch: &EncodedBatch) -> ComponentResult<Vec<f32>>;

    /// Gradient of the objective w.r.t. the parameters, given the gradient
    /// w.r.t. the outputs.
    fn backward(&self, batch: &EncodedBatch, grad_outputs: &[f32]) -> ComponentResult<Vec<f32>>;

    /// Human-readable architecture summary.
    fn summary(&self) -> String;
}

/// Loss value and its gradient w.r.t. the model outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct LossOutput {
    pub value: f32,
    pub grad: Vec<f32>,
}

pub trait Loss: Send + Sync {
    fn kind(&self) -> &'static str;

    fn compute(&self, outputs: &[f32], labels: &[f32]) -> ComponentResult<LossOutput>;
}

/// How per-batch metric scores combine into one validation score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// Sample-weighted arithmetic mean.
    #[default]
    Mean,
    Max,
    Min,
}

pub trait Metric: Send + Sync {
    fn name(&self) -> &str;

    fn score(&self, outputs: &[f32], labels: &[f32]) -> f64;

    fn aggregation(&self) -> Aggregation {
        Aggregation::Mean
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_display() {
        assert_eq!(Device::Auto.to_string(), "auto");
        assert_eq!(Device::Accelerators(vec![0, 2]).to_string(), "accelerators[0,2]");
    }

    #[test]
    fn test_device_serde() {
        let json = serde_json::to_value(Device::Accelerators(vec![1])).unwrap();
        assert_eq!(json, serde_json::json!({"accelerators": [1]}));
        let back: Device = serde_json::from_value(serde_json::json!("cpu")).unwrap();
        assert_eq!(back, Device::Cpu);
    }
}
