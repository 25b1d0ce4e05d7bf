use mosaic_abstraction::Aggregation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Progress of a run, persisted in every checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Completed epochs.
    pub epoch: u64,
    /// Global optimizer step count, including skipped batches.
    pub step: u64,
    /// Best monitored score so far.
    #[serde(default)]
    pub best: Option<f64>,
    /// Batches consumed in the epoch in progress.
    #[serde(default)]
    pub epoch_batches: u64,
    /// Samples consumed in the epoch in progress.
    #[serde(default)]
    pub epoch_samples: usize,
    /// Consecutive validations without improvement.
    #[serde(default)]
    pub stale_validations: u32,
}

impl TrainingState {
    /// Epoch currently being trained (1-based).
    pub fn current_epoch(&self) -> u64 {
        self.epoch + 1
    }

    pub fn is_mid_epoch(&self) -> bool {
        self.epoch_batches > 0
    }

    pub fn finish_epoch(&mut self) {
        self.epoch += 1;
        self.epoch_batches = 0;
        self.epoch_samples = 0;
    }
}

#[derive(Debug, Clone, Copy)]
struct Accumulator {
    aggregation: Aggregation,
    weighted_sum: f64,
    weight: usize,
    extreme: Option<f64>,
}

impl Accumulator {
    fn new(aggregation: Aggregation) -> Self {
        Self { aggregation, weighted_sum: 0.0, weight: 0, extreme: None }
    }

    fn update(&mut self, value: f64, n: usize) {
        match self.aggregation {
            Aggregation::Mean => {
                self.weighted_sum += value * n as f64;
                self.weight += n;
            }
            Aggregation::Max => self.extreme = Some(self.extreme.map_or(value, |e| e.max(value))),
            Aggregation::Min => self.extreme = Some(self.extreme.map_or(value, |e| e.min(value))),
        }
    }

    fn result(&self) -> Option<f64> {
        match self.aggregation {
            Aggregation::Mean if self.weight > 0 => Some(self.weighted_sum / self.weight as f64),
            Aggregation::Mean => None,
            Aggregation::Max | Aggregation::Min => self.extreme,
        }
    }
}

/// Aggregates per-batch scores into one value per key.
///
/// Mean keys are weighted by batch size; `Max`/`Min` keys keep the extreme.
#[derive(Debug, Clone, Default)]
pub struct MetricTracker {
    entries: BTreeMap<String, Accumulator>,
}

impl MetricTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, key: impl Into<String>, aggregation: Aggregation) {
        self.entries.insert(key.into(), Accumulator::new(aggregation));
    }

    /// Records `value` for a batch of `n` samples. Unknown keys are tracked
    /// as means.
    pub fn update(&mut self, key: &str, value: f64, n: usize) {
        self.entries
            .entry(key.to_string())
            .or_insert_with(|| Accumulator::new(Aggregation::Mean))
            .update(value, n);
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.entries.get(key).and_then(Accumulator::result)
    }

    /// Aggregated values of every key that received at least one update.
    pub fn result(&self) -> BTreeMap<String, f64> {
        self.entries.iter().filter_map(|(k, acc)| acc.result().map(|v| (k.clone(), v))).collect()
    }
}
