//! Run configuration.
//!
//! A run is configured by one JSON or TOML document plus command-line
//! overrides. While components are being built the document is a mutable
//! `ConfigDraft`; the orchestrator receives it frozen as a `RunConfiguration`.

use crate::checkpoint::Checkpoint;
use crate::error::{TrainingError, TrainingResult};
use crate::layout::RunLayout;
use crate::registry::{self, Namespace, OverridePolicy};
use mosaic_abstraction::{ComponentArgs, Device};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::ops::Index;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, info_span, Span};

pub const DEFAULT_RUN_NAME: &str = "mosaic";

/// Looks up a dotted path (`trainer.epochs`) in a JSON tree.
fn lookup<'a>(root: &'a Value, dotted: &str) -> Option<&'a Value> {
    dotted.split('.').try_fold(root, |node, key| node.get(key))
}

/// Mutable configuration tree, used until components are built.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDraft {
    root: Value,
}

impl ConfigDraft {
    pub fn from_value(root: Value) -> TrainingResult<Self> {
        if !root.is_object() {
            return Err(TrainingError::InvalidConfig("config document must be a mapping".to_string()));
        }
        Ok(Self { root })
    }

    pub fn from_json_str(text: &str) -> TrainingResult<Self> {
        Self::from_value(serde_json::from_str(text)?)
    }

    pub fn from_toml_str(text: &str) -> TrainingResult<Self> {
        let value: toml::Value = toml::from_str(text)?;
        Self::from_value(serde_json::to_value(value)?)
    }

    /// Loads a `.json` or `.toml` document.
    pub fn load(path: &Path) -> TrainingResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| TrainingError::InvalidConfig(format!("cannot read {}: {e}", path.display())))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&text),
            Some("json") | None => Self::from_json_str(&text),
            Some(other) => Err(TrainingError::InvalidConfig(format!(
                "unsupported config format '.{other}' for {}",
                path.display()
            ))),
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    pub fn get(&self, dotted: &str) -> Option<&Value> {
        lookup(&self.root, dotted)
    }

    /// Sets a dotted key, creating intermediate mappings as needed.
    pub fn set(&mut self, dotted: &str, value: Value) -> TrainingResult<()> {
        let mut keys: Vec<&str> = dotted.split('.').collect();
        let Some(last) = keys.pop().filter(|k| !k.is_empty()) else {
            return Err(TrainingError::InvalidConfig(format!("invalid config key '{dotted}'")));
        };

        let mut node = &mut self.root;
        for key in keys {
            let Value::Object(map) = node else {
                return Err(TrainingError::InvalidConfig(format!("cannot set '{dotted}': '{key}' is not a mapping")));
            };
            node = map.entry(key.to_string()).or_insert_with(|| Value::Object(Map::new()));
        }
        let Value::Object(map) = node else {
            return Err(TrainingError::InvalidConfig(format!("cannot set '{dotted}': parent is not a mapping")));
        };
        map.insert(last.to_string(), value);
        Ok(())
    }

    /// A required top-level section.
    pub fn section(&self, key: &str) -> TrainingResult<&Value> {
        self.root.get(key).ok_or_else(|| TrainingError::MissingConfigSection { section: key.to_string() })
    }

    /// Applies a `dotted.key=value` override. The value is parsed as JSON and
    /// falls back to a plain string.
    pub fn apply_override(&mut self, spec: &str) -> TrainingResult<()> {
        let (key, value) = parse_override(spec)?;
        self.set(&key, value)
    }

    /// Run name, `mosaic` unless configured.
    pub fn name(&self) -> &str {
        self.root.get("name").and_then(Value::as_str).unwrap_or(DEFAULT_RUN_NAME)
    }

    pub fn trainer(&self) -> TrainingResult<TrainerSettings> {
        TrainerSettings::from_config(self.section("trainer")?)
    }

    /// The `metrics` list.
    pub fn metric_names(&self) -> TrainingResult<Vec<String>> {
        serde_json::from_value(self.section("metrics")?.clone())
            .map_err(|e| TrainingError::InvalidConfig(format!("'metrics' must be a list of names: {e}")))
    }

    /// Device written by `-d/--device`, `auto` when absent.
    pub fn device(&self) -> TrainingResult<Device> {
        match self.root.get("device") {
            None | Some(Value::Null) => Ok(Device::Auto),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| TrainingError::InvalidConfig(format!("invalid 'device': {e}"))),
        }
    }

    /// Builds the component configured under `key`, rejecting conflicting
    /// extra arguments.
    pub fn initialize<T, C>(
        &self,
        key: &str,
        namespace: &Namespace<T, C>,
        ctx: C,
        extra: &ComponentArgs,
    ) -> TrainingResult<T> {
        registry::initialize(&self.root, key, namespace, ctx, extra, OverridePolicy::Reject)
    }

    pub fn initialize_with<T, C>(
        &self,
        key: &str,
        namespace: &Namespace<T, C>,
        ctx: C,
        extra: &ComponentArgs,
        policy: OverridePolicy,
    ) -> TrainingResult<T> {
        registry::initialize(&self.root, key, namespace, ctx, extra, policy)
    }

    #[must_use]
    pub fn freeze(self) -> RunConfiguration {
        RunConfiguration(Arc::new(self.root))
    }
}

impl Index<&str> for ConfigDraft {
    type Output = Value;

    fn index(&self, key: &str) -> &Value {
        &self.root[key]
    }
}

/// Read-only configuration handed to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfiguration(Arc<Value>);

impl RunConfiguration {
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn get(&self, dotted: &str) -> Option<&Value> {
        lookup(&self.0, dotted)
    }

    pub fn name(&self) -> &str {
        self.0.get("name").and_then(Value::as_str).unwrap_or(DEFAULT_RUN_NAME)
    }
}

impl Index<&str> for RunConfiguration {
    type Output = Value;

    fn index(&self, key: &str) -> &Value {
        &self.0[key]
    }
}

/// Which validation score decides "best" and early stopping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Monitor {
    #[default]
    Off,
    Min(String),
    Max(String),
}

impl Monitor {
    pub fn metric(&self) -> Option<&str> {
        match self {
            Self::Off => None,
            Self::Min(metric) | Self::Max(metric) => Some(metric),
        }
    }

    /// Strict improvement; ties and NaN never improve.
    pub fn improves(&self, candidate: f64, best: Option<f64>) -> bool {
        if candidate.is_nan() {
            return false;
        }
        match (self, best) {
            (Self::Off, _) => false,
            (_, None) => true,
            (Self::Min(_), Some(best)) => candidate < best,
            (Self::Max(_), Some(best)) => candidate > best,
        }
    }
}

impl TryFrom<String> for Monitor {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let parts: Vec<&str> = value.split_whitespace().collect();
        match parts.as_slice() {
            ["off"] => Ok(Self::Off),
            ["min", metric] => Ok(Self::Min((*metric).to_string())),
            ["max", metric] => Ok(Self::Max((*metric).to_string())),
            _ => Err(format!("monitor must be 'off' or '<min|max> <metric>', got '{value}'")),
        }
    }
}

impl From<Monitor> for String {
    fn from(monitor: Monitor) -> Self {
        monitor.to_string()
    }
}

impl fmt::Display for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => f.write_str("off"),
            Self::Min(metric) => write!(f, "min {metric}"),
            Self::Max(metric) => write!(f, "max {metric}"),
        }
    }
}

fn default_save_dir() -> PathBuf {
    PathBuf::from("saved")
}

fn default_period() -> u64 {
    1
}

fn default_verbosity() -> u8 {
    1
}

fn default_max_failures() -> u32 {
    3
}

fn default_tracking() -> bool {
    true
}

/// The `trainer` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainerSettings {
    pub epochs: u64,
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,
    /// Epochs between periodic checkpoints.
    #[serde(default = "default_period")]
    pub save_period: u64,
    /// Optimizer steps between mid-epoch checkpoints.
    #[serde(default)]
    pub save_steps: Option<u64>,
    #[serde(default = "default_period")]
    pub val_period: u64,
    #[serde(default)]
    pub monitor: Monitor,
    /// Stale validations tolerated before stopping.
    #[serde(default)]
    pub early_stop: Option<u32>,
    #[serde(default)]
    pub max_samples_per_epoch: Option<usize>,
    #[serde(default)]
    pub init_val: bool,
    #[serde(default = "default_verbosity")]
    pub verbosity: u8,
    /// Batches between progress lines; `floor(sqrt(batch_size))` if unset.
    #[serde(default)]
    pub log_step: Option<usize>,
    #[serde(default)]
    pub keep_last: Option<usize>,
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default, alias = "neptune")]
    pub remote_tracking: bool,
    #[serde(default = "default_tracking")]
    pub tracking: bool,
}

impl TrainerSettings {
    pub fn from_config(section: &Value) -> TrainingResult<Self> {
        let settings: Self = serde_json::from_value(section.clone())
            .map_err(|e| TrainingError::InvalidConfig(format!("trainer: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> TrainingResult<()> {
        let positive = [
            ("save_period", Some(self.save_period as usize)),
            ("val_period", Some(self.val_period as usize)),
            ("save_steps", self.save_steps.map(|s| s as usize)),
            ("max_samples_per_epoch", self.max_samples_per_epoch),
            ("log_step", self.log_step),
            ("keep_last", self.keep_last),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, value)| *value == Some(0)) {
            return Err(TrainingError::InvalidConfig(format!("trainer.{key} must be >= 1")));
        }
        if self.verbosity > 2 {
            return Err(TrainingError::InvalidConfig(format!(
                "trainer.verbosity must be 0, 1 or 2, got {}",
                self.verbosity
            )));
        }
        Ok(())
    }

    pub fn log_step_for(&self, batch_size: usize) -> usize {
        self.log_step.unwrap_or_else(|| (batch_size as f64).sqrt().floor() as usize).max(1)
    }

    /// Tracing level name for `verbosity`.
    pub fn log_level(&self) -> &'static str {
        match self.verbosity {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    }
}

/// Parses `dotted.key=value`.
pub fn parse_override(spec: &str) -> TrainingResult<(String, Value)> {
    let Some((key, raw)) = spec.split_once('=') else {
        return Err(TrainingError::InvalidConfig(format!("override '{spec}' must look like key=value")));
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(TrainingError::InvalidConfig(format!("override '{spec}' has an empty key")));
    }
    let value = serde_json::from_str(raw.trim()).unwrap_or_else(|_| Value::String(raw.trim().to_string()));
    Ok((key.to_string(), value))
}

/// Parses `-d/--device`: `auto`, `cpu`, or comma-separated accelerator ids.
pub fn parse_device(spec: &str) -> TrainingResult<Device> {
    match spec.trim() {
        "" | "auto" => Ok(Device::Auto),
        "cpu" => Ok(Device::Cpu),
        ids => ids
            .split(',')
            .map(|id| {
                id.trim()
                    .parse::<usize>()
                    .map_err(|_| TrainingError::InvalidConfig(format!("invalid device id '{id}' in '{spec}'")))
            })
            .collect::<TrainingResult<Vec<_>>>()
            .map(Device::Accelerators),
    }
}

/// Inputs that select and adjust a run's configuration.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config: Option<PathBuf>,
    pub resume: Option<PathBuf>,
    pub device: Option<Device>,
    /// Switches the tracker to the remote backend.
    pub observe: bool,
    /// Dotted-key overrides, applied in order.
    pub overrides: Vec<(String, Value)>,
    pub run_id: Option<String>,
}

/// The draft configuration together with the run it describes.
#[derive(Debug, Clone)]
pub struct ConfigContext {
    draft: ConfigDraft,
    resume: Option<PathBuf>,
    layout: RunLayout,
}

impl ConfigContext {
    /// Resolves the configuration for a run.
    ///
    /// Without `config`, the configuration saved in the `resume` checkpoint is
    /// used. With both, the new file is used and state is still restored.
    pub fn from_options(options: &RunOptions) -> TrainingResult<Self> {
        let mut draft = match (&options.config, &options.resume) {
            (Some(path), resume) => {
                if let Some(resume) = resume {
                    info!(config = %path.display(), checkpoint = %resume.display(), "Resuming with a new configuration");
                }
                ConfigDraft::load(path)?
            }
            (None, Some(resume)) => {
                info!(checkpoint = %resume.display(), "Using the configuration saved in the checkpoint");
                ConfigDraft::from_value(Checkpoint::load(resume)?.config)?
            }
            (None, None) => {
                return Err(TrainingError::InvalidConfig(
                    "a configuration file is required unless resuming from a checkpoint".to_string(),
                ));
            }
        };

        if options.observe {
            draft.set("trainer.remote_tracking", Value::Bool(true))?;
        }
        if let Some(device) = &options.device {
            draft.set("device", serde_json::to_value(device)?)?;
        }
        for (key, value) in &options.overrides {
            draft.set(key, value.clone())?;
        }

        let run_id = options.run_id.clone().unwrap_or_else(RunLayout::timestamp_run_id);
        Self::new(draft, options.resume.clone(), run_id)
    }

    pub fn new(draft: ConfigDraft, resume: Option<PathBuf>, run_id: impl Into<String>) -> TrainingResult<Self> {
        let trainer = draft.trainer()?;
        let layout = RunLayout::new(trainer.save_dir, draft.name(), run_id);
        Ok(Self { draft, resume, layout })
    }

    pub fn draft(&self) -> &ConfigDraft {
        &self.draft
    }

    pub fn draft_mut(&mut self) -> &mut ConfigDraft {
        &mut self.draft
    }

    pub fn resume(&self) -> Option<&Path> {
        self.resume.as_deref()
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    pub fn trainer(&self) -> TrainingResult<TrainerSettings> {
        self.draft.trainer()
    }

    /// Span carrying the run name, for a named component.
    pub fn logger(&self, name: &str) -> Span {
        info_span!("mosaic", run = %self.layout.name(), run_id = %self.layout.run_id(), component = %name)
    }

    pub fn into_parts(self) -> (ConfigDraft, Option<PathBuf>, RunLayout) {
        (self.draft, self.resume, self.layout)
    }
}

impl Index<&str> for ConfigContext {
    type Output = Value;

    fn index(&self, key: &str) -> &Value {
        &self.draft[key]
    }
}
