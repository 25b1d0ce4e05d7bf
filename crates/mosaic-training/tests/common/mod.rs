//! Shared fixtures for the training integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use mosaic_abstraction::{ComponentResult, ExperimentTracker};
use mosaic_training::{CancellationToken, ConfigContext, ConfigDraft, Namespaces, Sinks, Trainer};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Synthetic binary task: 20-sample batches, 100-sample epoch budget.
pub fn base_config(save_dir: &Path) -> Value {
    json!({
        "name": "synthetic",
        "data_loader": {
            "type": "SyntheticDataLoader",
            "args": {"batch_size": 20, "num_samples": 200, "experts": {"audio": 3, "face": 2}, "seed": 7, "shuffle": true}
        },
        "arch": {"type": "LinearFusion", "args": {"text_params": {"model": "hashing-bow", "embed_dim": 16}, "seed": 1}},
        "loss": {"type": "BceWithLogitsLoss"},
        "metrics": ["accuracy", "max_abs_error"],
        "optimizer": {"type": "AdamW", "args": {"lr": 0.05}},
        "trainer": {
            "epochs": 2,
            "save_dir": save_dir,
            "monitor": "min val_loss",
            "max_samples_per_epoch": 100,
            "tracking": false,
            "verbosity": 0
        }
    })
}

pub fn patched(mut config: Value, patches: &[(&str, Value)]) -> Value {
    let mut draft = ConfigDraft::from_value(config.take()).unwrap();
    for (key, value) in patches {
        draft.set(key, value.clone()).unwrap();
    }
    draft.as_value().clone()
}

pub fn context(config: Value, resume: Option<PathBuf>, run_id: &str) -> ConfigContext {
    ConfigContext::new(ConfigDraft::from_value(config).unwrap(), resume, run_id).unwrap()
}

pub fn trainer(config: Value, run_id: &str) -> Trainer {
    Trainer::from_context_with(context(config, None, run_id), &Namespaces::builtin().unwrap(), |_| None).unwrap()
}

/// Builds a trainer whose only sink is `recorder`.
pub fn recorded_trainer(ctx: ConfigContext, namespaces: &Namespaces, recorder: Recorder) -> Trainer {
    let mut ctx = ctx;
    let mut components = mosaic_training::build_components_with(&mut ctx, namespaces, |_| None).unwrap();
    components.sinks = Sinks::new(None, Some(Box::new(recorder)));
    Trainer::new(ctx, components).unwrap()
}

pub type Events = Arc<Mutex<Vec<(String, f64, u64)>>>;

/// Tracker that keeps every scalar and can cancel the run at a given step.
#[derive(Default)]
pub struct Recorder {
    pub events: Events,
    pub configs: Arc<Mutex<Vec<Value>>>,
    cancel_at: Option<(u64, CancellationToken)>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancelling_at(step: u64, token: CancellationToken) -> Self {
        Self { cancel_at: Some((step, token)), ..Self::default() }
    }

    pub fn named(events: &Events, name: &str) -> Vec<(f64, u64)> {
        events.lock().unwrap().iter().filter(|(n, _, _)| n == name).map(|(_, v, s)| (*v, *s)).collect()
    }
}

#[async_trait]
impl ExperimentTracker for Recorder {
    fn kind(&self) -> &'static str {
        "recorder"
    }

    async fn log_config(&self, config: &Value) -> ComponentResult<()> {
        self.configs.lock().unwrap().push(config.clone());
        Ok(())
    }

    async fn log_scalar(&self, name: &str, value: f64, step: u64) -> ComponentResult<()> {
        self.events.lock().unwrap().push((name.to_string(), value, step));
        if let Some((at, token)) = &self.cancel_at {
            if name == "train/loss" && step == *at {
                token.cancel();
            }
        }
        Ok(())
    }
}
