//! Checkpoint format and atomic storage.
//!
//! A checkpoint is one JSON document holding the model parameters, optimizer
//! and scheduler state, the training state and the full run configuration.
//! Files are written to a temporary name in the same directory, fsynced and
//! renamed into place, so a finalised checkpoint is never partially written.

use crate::error::{TrainingError, TrainingResult};
use crate::state::TrainingState;
use chrono::{DateTime, Utc};
use mosaic_abstraction::{ExpertStreamSet, Model};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;
pub const BEST_CHECKPOINT_FILE: &str = "model_best.json";
pub const CONFIG_FILE: &str = "config.json";
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

const REQUIRED_KEYS: [&str; 6] = ["format_version", "model", "optimizer", "scheduler", "training_state", "config"];

/// Hex SHA-256 of the little-endian parameter bytes.
pub fn parameter_digest(parameters: &[f32]) -> String {
    let mut hasher = Sha256::new();
    for p in parameters {
        hasher.update(p.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub kind: String,
    pub experts: ExpertStreamSet,
    pub parameters: Vec<f32>,
    pub digest: String,
}

impl ModelSnapshot {
    pub fn capture(model: &dyn Model) -> Self {
        let parameters = model.parameters().to_vec();
        Self {
            kind: model.kind().to_string(),
            experts: model.expert_streams().clone(),
            digest: parameter_digest(&parameters),
            parameters,
        }
    }
}

/// Type name and serialized state of an optimizer or scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSnapshot {
    pub kind: String,
    pub state: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub model: ModelSnapshot,
    pub optimizer: ComponentSnapshot,
    /// Serialized as `null` when the run has no scheduler.
    pub scheduler: Option<ComponentSnapshot>,
    pub training_state: TrainingState,
    pub config: Value,
}

impl Checkpoint {
    /// Parses and validates checkpoint bytes read from `path`.
    pub fn from_slice(path: &Path, bytes: &[u8]) -> TrainingResult<Self> {
        let corrupt = |reason: String| TrainingError::CorruptCheckpoint { path: path.to_path_buf(), reason };

        let value: Value = serde_json::from_slice(bytes).map_err(|e| corrupt(format!("not valid JSON: {e}")))?;
        let Some(obj) = value.as_object() else {
            return Err(corrupt("top level is not a mapping".to_string()));
        };
        if let Some(key) = REQUIRED_KEYS.iter().find(|key| !obj.contains_key(**key)) {
            return Err(corrupt(format!("missing required key '{key}'")));
        }
        let version = obj["format_version"].as_u64();
        if version != Some(u64::from(CHECKPOINT_FORMAT_VERSION)) {
            return Err(corrupt(format!(
                "unsupported format_version {}, expected {CHECKPOINT_FORMAT_VERSION}",
                obj["format_version"]
            )));
        }

        let checkpoint: Self = serde_json::from_value(value).map_err(|e| corrupt(e.to_string()))?;
        if parameter_digest(&checkpoint.model.parameters) != checkpoint.model.digest {
            return Err(corrupt("model parameter digest does not match".to_string()));
        }
        Ok(checkpoint)
    }

    pub fn load(path: &Path) -> TrainingResult<Self> {
        let bytes = fs::read(path).map_err(|e| TrainingError::CorruptCheckpoint {
            path: path.to_path_buf(),
            reason: format!("cannot read: {e}"),
        })?;
        Self::from_slice(path, &bytes)
    }

    pub fn to_bytes(&self) -> TrainingResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// Where a checkpoint is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointSlot {
    /// Epoch cadence, `checkpoint-epoch<E>.json`.
    Epoch(u64),
    /// Step cadence, `checkpoint-step<S>.json`.
    Step(u64),
    /// `model_best.json`, overwritten on every new best.
    Best,
}

impl CheckpointSlot {
    pub fn file_name(self) -> String {
        match self {
            Self::Epoch(epoch) => format!("checkpoint-epoch{epoch}.json"),
            Self::Step(step) => format!("checkpoint-step{step}.json"),
            Self::Best => BEST_CHECKPOINT_FILE.to_string(),
        }
    }

    pub fn is_periodic(self) -> bool {
        !matches!(self, Self::Best)
    }
}

/// A checkpoint written to a temporary file and fsynced, not yet visible
/// under its final name.
#[derive(Debug)]
#[must_use = "a staged write is invisible until committed"]
pub struct StagedWrite {
    temp: PathBuf,
    target: PathBuf,
}

impl StagedWrite {
    fn create(target: &Path, bytes: &[u8]) -> std::io::Result<Self> {
        let dir = target.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let file_name = target.file_name().and_then(|n| n.to_str()).unwrap_or("checkpoint");
        let temp = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        if let Err(e) = write_synced(&temp, bytes) {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }
        Ok(Self { temp, target: target.to_path_buf() })
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    /// Renames the temporary file into place.
    pub fn commit(self) -> std::io::Result<PathBuf> {
        if let Err(e) = fs::rename(&self.temp, &self.target) {
            let _ = fs::remove_file(&self.temp);
            return Err(e);
        }
        if let Some(dir) = self.target.parent() {
            // Persist the rename itself; not every platform allows opening a directory.
            if let Ok(handle) = File::open(dir) {
                let _ = handle.sync_all();
            }
        }
        Ok(self.target)
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn write_atomic(target: &Path, bytes: &[u8]) -> std::io::Result<PathBuf> {
    StagedWrite::create(target, bytes)?.commit()
}

/// Writes checkpoints into one run directory.
#[derive(Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    keep_last: Option<usize>,
    retry_backoff: Duration,
    /// Periodic checkpoints written by this store, oldest first.
    history: Vec<PathBuf>,
    writes: usize,
}

impl CheckpointStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, keep_last: Option<usize>) -> Self {
        Self { dir: dir.into(), keep_last, retry_backoff: DEFAULT_RETRY_BACKOFF, history: Vec::new(), writes: 0 }
    }

    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, slot: CheckpointSlot) -> PathBuf {
        self.dir.join(slot.file_name())
    }

    /// Finalised checkpoint files written so far.
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Atomically writes `checkpoint` into `slot`, retrying once after the
    /// back-off.
    ///
    /// # Errors
    /// `StorageFailure` when the retry fails too.
    pub async fn save(&mut self, slot: CheckpointSlot, checkpoint: &Checkpoint) -> TrainingResult<PathBuf> {
        let bytes = checkpoint.to_bytes()?;
        let path = self.write_with_retry(self.path_for(slot), &bytes).await?;

        self.writes += 1;
        info!(path = %path.display(), epoch = checkpoint.training_state.epoch, step = checkpoint.training_state.step, "Saved checkpoint");

        if slot.is_periodic() {
            self.history.retain(|p| p != &path);
            self.history.push(path.clone());
            self.prune();
        }
        Ok(path)
    }

    /// Writes the checkpoint to a temporary file without finalising it.
    pub fn stage(&self, slot: CheckpointSlot, checkpoint: &Checkpoint) -> TrainingResult<StagedWrite> {
        let target = self.path_for(slot);
        let bytes = checkpoint.to_bytes()?;
        StagedWrite::create(&target, &bytes).map_err(|source| TrainingError::StorageFailure { path: target, source })
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    /// Persists the resolved configuration next to the checkpoints, with the
    /// same retry as `save`.
    pub async fn write_config(&self, config: &Value) -> TrainingResult<PathBuf> {
        let bytes = serde_json::to_vec_pretty(config)?;
        let path = self.write_with_retry(self.config_path(), &bytes).await?;
        debug!(path = %path.display(), "Saved run config");
        Ok(path)
    }

    async fn write_with_retry(&self, target: PathBuf, bytes: &[u8]) -> TrainingResult<PathBuf> {
        match write_atomic(&target, bytes) {
            Ok(path) => Ok(path),
            Err(first) => {
                warn!(path = %target.display(), error = %first, backoff_ms = self.retry_backoff.as_millis(), "Write failed, retrying");
                tokio::time::sleep(self.retry_backoff).await;
                write_atomic(&target, bytes).map_err(|source| TrainingError::StorageFailure { path: target, source })
            }
        }
    }

    fn prune(&mut self) {
        let Some(keep) = self.keep_last else {
            return;
        };
        while self.history.len() > keep {
            let old = self.history.remove(0);
            match fs::remove_file(&old) {
                Ok(()) => debug!(path = %old.display(), "Pruned checkpoint"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %old.display(), error = %e, "Failed to prune checkpoint"),
            }
        }
    }
}
