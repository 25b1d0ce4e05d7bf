//! Builds every collaborator of a run from its configuration.
//!
//! Order matters: the training data loader is built first so its expert
//! stream report can be injected into the model arguments.

use crate::config::{ConfigContext, Monitor};
use crate::error::{TrainingError, TrainingResult};
use crate::namespaces::{text_params, visualizer_type, Namespaces};
use crate::registry::ComponentSpec;
use crate::sinks::{select_tracker, Sinks};
use mosaic_abstraction::{
    ComponentArgs, DataLoader, Loss, LrScheduler, Metric, Model, ModelContext, Optimizer, OptimizerContext,
    SchedulerContext, Split, Tokenizer, Visualizer,
};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Everything the orchestrator drives.
pub struct Components {
    pub tokenizer: Box<dyn Tokenizer>,
    pub train_loader: Box<dyn DataLoader>,
    pub val_loader: Box<dyn DataLoader>,
    pub model: Box<dyn Model>,
    pub loss: Box<dyn Loss>,
    pub metrics: Vec<Box<dyn Metric>>,
    pub optimizer: Box<dyn Optimizer>,
    pub scheduler: Option<Box<dyn LrScheduler>>,
    pub sinks: Sinks,
}

impl std::fmt::Debug for Components {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Components")
            .field("tokenizer", &self.tokenizer.kind())
            .field("train_loader", &self.train_loader.kind())
            .field("model", &self.model.kind())
            .field("loss", &self.loss.kind())
            .field("metrics", &self.metrics.iter().map(|m| m.name().to_string()).collect::<Vec<_>>())
            .field("optimizer", &self.optimizer.kind())
            .field("scheduler", &self.scheduler.as_ref().map(|s| s.kind()))
            .field("sinks", &self.sinks)
            .finish()
    }
}

/// Builds all components, reading tracker credentials from the environment.
pub fn build_components(ctx: &mut ConfigContext, namespaces: &Namespaces) -> TrainingResult<Components> {
    build_components_with(ctx, namespaces, |key| std::env::var(key).ok())
}

/// Builds all components, reading tracker credentials through `lookup`.
pub fn build_components_with(
    ctx: &mut ConfigContext,
    namespaces: &Namespaces,
    lookup: impl Fn(&str) -> Option<String>,
) -> TrainingResult<Components> {
    namespaces.validate(ctx.draft())?;
    apply_global_seed(ctx)?;
    let settings = ctx.trainer()?;

    // Credentials are checked before any data is touched.
    let tracker = select_tracker(&settings, ctx.layout(), lookup)?;
    let visualizer = build_visualizer(ctx, namespaces)?;

    let text_args: ComponentArgs = text_params(ctx.draft())?.clone();
    let tokenizer_type = text_args.get("model").and_then(Value::as_str).unwrap_or_default().to_string();
    let tokenizer = namespaces.tokenizers.construct("arch.args.text_params.model", &tokenizer_type, (), &text_args)?;
    debug!(tokenizer = tokenizer.kind(), vocab_size = tokenizer.vocab_size(), "Built tokenizer");

    let none = ComponentArgs::new();
    ctx.draft_mut().set("data_loader.args.split", Value::String(Split::Train.to_string()))?;
    let train_loader = ctx.draft().initialize("data_loader", &namespaces.data_loaders, (), &none)?;
    let experts = train_loader.experts_used().clone();

    ctx.draft_mut().set("data_loader.args.split", Value::String(Split::Val.to_string()))?;
    let val_loader = ctx.draft().initialize("data_loader", &namespaces.data_loaders, (), &none)?;
    if let Some(diff) = experts.mismatch(val_loader.experts_used()) {
        return Err(TrainingError::ShapeMismatch {
            component: "data_loader".to_string(),
            reason: format!("train and val splits provide different expert streams: {diff}"),
        });
    }
    info!(
        train_samples = train_loader.num_samples(),
        val_samples = val_loader.num_samples(),
        experts = %experts,
        "Built data loaders"
    );

    ctx.draft_mut().set("arch.args.experts_used", serde_json::to_value(&experts)?)?;
    let model_ctx = ModelContext { vocab_size: tokenizer.vocab_size(), device: ctx.draft().device()? };
    let model = ctx.draft().initialize("arch", &namespaces.models, model_ctx, &none)?;
    if let Some(diff) = experts.mismatch(model.expert_streams()) {
        return Err(TrainingError::ShapeMismatch {
            component: format!("arch '{}'", model.kind()),
            reason: format!("model was built for different expert streams: {diff}"),
        });
    }
    info!(summary = %model.summary(), parameters = model.num_parameters(), "Built model");

    let loss = ctx.draft().initialize("loss", &namespaces.losses, (), &none)?;
    let metric_names = ctx.draft().metric_names()?;
    let metrics = metric_names
        .iter()
        .map(|name| namespaces.metrics.construct("metrics", name, (), &none))
        .collect::<TrainingResult<Vec<_>>>()?;
    check_monitor(&settings.monitor, &metric_names)?;

    let optimizer = ctx.draft().initialize(
        "optimizer",
        &namespaces.optimizers,
        OptimizerContext { num_parameters: model.num_parameters() },
        &none,
    )?;
    let scheduler = build_scheduler(ctx, namespaces, optimizer.learning_rate())?;

    Ok(Components {
        tokenizer,
        train_loader,
        val_loader,
        model,
        loss,
        metrics,
        optimizer,
        scheduler,
        sinks: Sinks::new(visualizer, tracker),
    })
}

/// A top-level `seed` fills in the data loader and model seeds they leave unset.
fn apply_global_seed(ctx: &mut ConfigContext) -> TrainingResult<()> {
    let Some(seed) = ctx.draft().get("seed").filter(|s| !s.is_null()).cloned() else {
        return Ok(());
    };
    for key in ["data_loader.args.seed", "arch.args.seed"] {
        if ctx.draft().get(key).is_none() {
            ctx.draft_mut().set(key, seed.clone())?;
        }
    }
    Ok(())
}

fn build_visualizer(ctx: &ConfigContext, namespaces: &Namespaces) -> TrainingResult<Option<Box<dyn Visualizer>>> {
    if visualizer_type(ctx.draft()).is_none() {
        return Ok(None);
    }
    let mut extra = ComponentArgs::new();
    extra.insert("exp_name".to_string(), Value::String(ctx.layout().name().to_string()));
    extra.insert("web_dir".to_string(), Value::String(ctx.layout().web_dir().to_string_lossy().into_owned()));
    ctx.draft().initialize("visualizer", &namespaces.visualizers, (), &extra).map(Some)
}

/// An absent `lr_scheduler` means none; an unknown type degrades to none
/// with a warning.
fn build_scheduler(
    ctx: &ConfigContext,
    namespaces: &Namespaces,
    base_lr: f64,
) -> TrainingResult<Option<Box<dyn LrScheduler>>> {
    let section = match ctx.draft().get("lr_scheduler") {
        None | Some(Value::Null) => return Ok(None),
        Some(section) => section,
    };
    let spec = ComponentSpec::from_section("lr_scheduler", section)?;
    if spec.type_name.trim().is_empty() {
        return Ok(None);
    }
    if !namespaces.schedulers.contains(&spec.type_name) {
        warn!(
            type_name = %spec.type_name,
            available = %namespaces.schedulers.names().join(", "),
            "Unknown lr_scheduler type, training without a scheduler"
        );
        return Ok(None);
    }
    let scheduler =
        ctx.draft().initialize("lr_scheduler", &namespaces.schedulers, SchedulerContext { base_lr }, &ComponentArgs::new())?;
    debug!(scheduler = scheduler.kind(), granularity = ?scheduler.granularity(), "Built lr scheduler");
    Ok(Some(scheduler))
}

/// The monitored score must be `val_loss` or `val_<configured metric>`.
fn check_monitor(monitor: &Monitor, metric_names: &[String]) -> TrainingResult<()> {
    let Some(metric) = monitor.metric() else {
        return Ok(());
    };
    let known = metric == "val_loss"
        || metric.strip_prefix("val_").is_some_and(|name| metric_names.iter().any(|m| m == name));
    if known {
        Ok(())
    } else {
        Err(TrainingError::InvalidConfig(format!(
            "trainer.monitor refers to '{metric}', expected val_loss or val_<metric> for one of [{}]",
            metric_names.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigDraft;
    use serde_json::json;
    use tempfile::TempDir;

    fn context(temp: &TempDir, patch: &[(&str, Value)]) -> ConfigContext {
        let mut draft = ConfigDraft::from_value(json!({
            "name": "builder",
            "data_loader": {"type": "SyntheticDataLoader", "args": {"batch_size": 8, "num_samples": 32, "experts": {"audio": 3}}},
            "arch": {"type": "LinearFusion", "args": {"text_params": {"model": "hashing-bow", "embed_dim": 8}}},
            "loss": {"type": "BceWithLogitsLoss"},
            "metrics": ["accuracy"],
            "optimizer": {"type": "AdamW", "args": {"lr": 0.01}},
            "trainer": {"epochs": 1, "save_dir": temp.path(), "tracking": false, "monitor": "max val_accuracy"}
        }))
        .unwrap();
        for (key, value) in patch {
            draft.set(key, value.clone()).unwrap();
        }
        ConfigContext::new(draft, None, "test").unwrap()
    }

    #[test]
    fn test_model_is_shaped_by_train_streams() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp, &[]);
        let components = build_components_with(&mut ctx, &Namespaces::builtin().unwrap(), |_| None).unwrap();

        assert_eq!(components.model.kind(), "LinearFusion");
        assert_eq!(components.model.num_parameters(), 8 + 3 + 1);
        assert_eq!(ctx.draft().get("arch.args.experts_used"), Some(&json!({"audio": 3})));
        assert_eq!(components.val_loader.num_samples(), 8);
        assert!(components.scheduler.is_none());
        assert_eq!(components.sinks.tracker_kind(), None);
    }

    #[test]
    fn test_global_seed_fills_unset_seeds() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp, &[("seed", json!(11)), ("arch.args.seed", json!(3))]);
        build_components_with(&mut ctx, &Namespaces::builtin().unwrap(), |_| None).unwrap();
        assert_eq!(ctx.draft().get("data_loader.args.seed"), Some(&json!(11)));
        assert_eq!(ctx.draft().get("arch.args.seed"), Some(&json!(3)));
    }

    #[test]
    fn test_unknown_scheduler_degrades() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp, &[("lr_scheduler", json!({"type": "CosineAnnealing", "args": {}}))]);
        let components = build_components_with(&mut ctx, &Namespaces::builtin().unwrap(), |_| None).unwrap();
        assert!(components.scheduler.is_none());
    }

    #[test]
    fn test_scheduler_gets_optimizer_rate() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp, &[("lr_scheduler", json!({"type": "StepLR", "args": {"step_size": 1}}))]);
        let components = build_components_with(&mut ctx, &Namespaces::builtin().unwrap(), |_| None).unwrap();
        assert_eq!(components.scheduler.unwrap().kind(), "StepLR");
    }

    #[test]
    fn test_conflicting_experts_used_is_overwritten_by_report() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp, &[("arch.args.experts_used", json!({"face": 2}))]);
        let components = build_components_with(&mut ctx, &Namespaces::builtin().unwrap(), |_| None).unwrap();
        assert_eq!(components.model.expert_streams().dim("audio"), Some(3));
    }

    #[test]
    fn test_monitor_must_name_a_metric() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp, &[("trainer.monitor", json!("max val_f1"))]);
        let err = build_components_with(&mut ctx, &Namespaces::builtin().unwrap(), |_| None).unwrap_err();
        assert!(matches!(err, TrainingError::InvalidConfig(_)));
    }

    #[test]
    fn test_bad_model_args() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp, &[("arch.args.hidden", json!(4))]);
        let err = build_components_with(&mut ctx, &Namespaces::builtin().unwrap(), |_| None).unwrap_err();
        assert!(matches!(err, TrainingError::InvalidArgs { ref section, .. } if section == "arch"));
    }

    #[test]
    fn test_visualizer_gets_run_paths() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp, &[("visualizer", json!({"type": "HtmlVisualizer", "args": {"num_samples": 3}}))]);
        let components = build_components_with(&mut ctx, &Namespaces::builtin().unwrap(), |_| None).unwrap();
        assert!(components.sinks.has_visualizer());
    }
}
