//! Validation metrics, selected by name from the `metrics` list.

use mosaic_abstraction::{Aggregation, Metric};

/// Fraction of samples whose logit sign agrees with the binary label.
#[derive(Debug, Clone, Copy, Default)]
pub struct Accuracy;

impl Accuracy {
    pub const NAME: &'static str = "accuracy";
}

impl Metric for Accuracy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn score(&self, outputs: &[f32], labels: &[f32]) -> f64 {
        if outputs.is_empty() {
            return 0.0;
        }
        let correct = outputs.iter().zip(labels).filter(|(o, y)| (**o > 0.0) == (**y >= 0.5)).count();
        correct as f64 / outputs.len() as f64
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MeanAbsoluteError;

impl MeanAbsoluteError {
    pub const NAME: &'static str = "mean_absolute_error";
}

impl Metric for MeanAbsoluteError {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn score(&self, outputs: &[f32], labels: &[f32]) -> f64 {
        if outputs.is_empty() {
            return 0.0;
        }
        let total: f64 = outputs.iter().zip(labels).map(|(o, y)| f64::from((o - y).abs())).sum();
        total / outputs.len() as f64
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MeanSquaredError;

impl MeanSquaredError {
    pub const NAME: &'static str = "mean_squared_error";
}

impl Metric for MeanSquaredError {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn score(&self, outputs: &[f32], labels: &[f32]) -> f64 {
        if outputs.is_empty() {
            return 0.0;
        }
        let total: f64 = outputs.iter().zip(labels).map(|(o, y)| f64::from(o - y).powi(2)).sum();
        total / outputs.len() as f64
    }
}

/// Worst absolute error seen; aggregated across batches with `max`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxAbsError;

impl MaxAbsError {
    pub const NAME: &'static str = "max_abs_error";
}

impl Metric for MaxAbsError {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn score(&self, outputs: &[f32], labels: &[f32]) -> f64 {
        outputs.iter().zip(labels).map(|(o, y)| f64::from((o - y).abs())).fold(0.0, f64::max)
    }

    fn aggregation(&self) -> Aggregation {
        Aggregation::Max
    }
}
