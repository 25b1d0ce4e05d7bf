//! Optimization contracts.

use crate::ComponentResult;
use serde::{Deserialize, Serialize};

/// Positional context handed to optimizer constructors.
#[derive(Debug, Clone, Copy)]
pub struct OptimizerContext {
    /// Number of trainable parameters the optimizer will update.
    pub num_parameters: usize,
}

/// Positional context handed to scheduler constructors.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerContext {
    /// Learning rate of the optimizer at construction time.
    pub base_lr: f64,
}

pub trait Optimizer: Send {
    fn kind(&self) -> &'static str;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    /// Applies one update in place.
    fn step(&mut self, params: &mut [f32], grads: &[f32]) -> ComponentResult<()>;

    fn state(&self) -> ComponentResult<serde_json::Value>;

    fn load_state(&mut self, state: serde_json::Value) -> ComponentResult<()>;
}

/// When a scheduler advances. Declared by the scheduler, never inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleGranularity {
    Step,
    Epoch,
}

pub trait LrScheduler: Send {
    fn kind(&self) -> &'static str;

    fn granularity(&self) -> ScheduleGranularity;

    /// Sets the optimizer learning rate for the scheduler's current position.
    fn apply(&self, optimizer: &mut dyn Optimizer);

    /// Advances one unit of `granularity` and applies the new rate.
    fn step(&mut self, optimizer: &mut dyn Optimizer);

    fn state(&self) -> serde_json::Value;

    fn load_state(&mut self, state: serde_json::Value) -> ComponentResult<()>;
}
