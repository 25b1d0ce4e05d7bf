//! The namespaces a run configuration is resolved against.

use crate::config::ConfigDraft;
use crate::error::{TrainingError, TrainingResult};
use crate::registry::{ComponentSpec, Namespace};
use mosaic_abstraction::{
    DataLoader, Loss, LrScheduler, Metric, Model, ModelContext, Optimizer, OptimizerContext, SchedulerContext,
    Tokenizer, Visualizer,
};
use mosaic_components::{
    Accuracy, AdamW, BceWithLogitsLoss, ByteTokenizer, ConstantWarmupSchedule, GatedExpertFusion, HashingTokenizer,
    HtmlVisualizer, JsonlDataLoader, LinearFusion, LinearWarmupSchedule, MaxAbsError, MeanAbsoluteError,
    MeanSquaredError, MseLoss, Sgd, StepLr, SyntheticDataLoader,
};
use serde_json::Value;

/// Config sections every run must have.
pub const REQUIRED_SECTIONS: [&str; 6] = ["data_loader", "arch", "loss", "metrics", "optimizer", "trainer"];

/// One typed registry per component kind.
#[derive(Debug)]
pub struct Namespaces {
    pub tokenizers: Namespace<Box<dyn Tokenizer>>,
    pub data_loaders: Namespace<Box<dyn DataLoader>>,
    pub models: Namespace<Box<dyn Model>, ModelContext>,
    pub losses: Namespace<Box<dyn Loss>>,
    pub metrics: Namespace<Box<dyn Metric>>,
    pub optimizers: Namespace<Box<dyn Optimizer>, OptimizerContext>,
    pub schedulers: Namespace<Box<dyn LrScheduler>, SchedulerContext>,
    pub visualizers: Namespace<Box<dyn Visualizer>>,
}

impl Namespaces {
    /// Empty namespaces.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            tokenizers: Namespace::new("tokenizer"),
            data_loaders: Namespace::new("data_loader"),
            models: Namespace::new("arch"),
            losses: Namespace::new("loss"),
            metrics: Namespace::new("metric"),
            optimizers: Namespace::new("optimizer"),
            schedulers: Namespace::new("lr_scheduler"),
            visualizers: Namespace::new("visualizer"),
        }
    }

    /// Namespaces holding every component shipped with `mosaic-components`.
    pub fn builtin() -> TrainingResult<Self> {
        let mut ns = Self::empty();

        ns.tokenizers.register(HashingTokenizer::KIND, |(), args| {
            Ok(Box::new(HashingTokenizer::from_args(args)?) as Box<dyn Tokenizer>)
        })?;
        ns.tokenizers
            .register(ByteTokenizer::KIND, |(), args| Ok(Box::new(ByteTokenizer::from_args(args)?) as Box<dyn Tokenizer>))?;

        ns.data_loaders.register(JsonlDataLoader::KIND, |(), args| {
            Ok(Box::new(JsonlDataLoader::from_args(args)?) as Box<dyn DataLoader>)
        })?;
        ns.data_loaders.register(SyntheticDataLoader::KIND, |(), args| {
            Ok(Box::new(SyntheticDataLoader::from_args(args)?) as Box<dyn DataLoader>)
        })?;

        ns.models
            .register(LinearFusion::KIND, |ctx, args| Ok(Box::new(LinearFusion::from_args(ctx, args)?) as Box<dyn Model>))?;
        ns.models.register(GatedExpertFusion::KIND, |ctx, args| {
            Ok(Box::new(GatedExpertFusion::from_args(ctx, args)?) as Box<dyn Model>)
        })?;

        ns.losses.register(MseLoss::KIND, |(), args| Ok(Box::new(MseLoss::from_args(args)?) as Box<dyn Loss>))?;
        ns.losses.register(BceWithLogitsLoss::KIND, |(), args| {
            Ok(Box::new(BceWithLogitsLoss::from_args(args)?) as Box<dyn Loss>)
        })?;

        ns.metrics.register(Accuracy::NAME, |(), _| Ok(Box::new(Accuracy) as Box<dyn Metric>))?;
        ns.metrics.register(MeanAbsoluteError::NAME, |(), _| Ok(Box::new(MeanAbsoluteError) as Box<dyn Metric>))?;
        ns.metrics.register(MeanSquaredError::NAME, |(), _| Ok(Box::new(MeanSquaredError) as Box<dyn Metric>))?;
        ns.metrics.register(MaxAbsError::NAME, |(), _| Ok(Box::new(MaxAbsError) as Box<dyn Metric>))?;

        ns.optimizers.register(Sgd::KIND, |ctx, args| Ok(Box::new(Sgd::from_args(ctx, args)?) as Box<dyn Optimizer>))?;
        ns.optimizers
            .register(AdamW::KIND, |ctx, args| Ok(Box::new(AdamW::from_args(ctx, args)?) as Box<dyn Optimizer>))?;

        ns.schedulers.register(LinearWarmupSchedule::KIND, |ctx, args| {
            Ok(Box::new(LinearWarmupSchedule::from_args(ctx, args)?) as Box<dyn LrScheduler>)
        })?;
        ns.schedulers.register(ConstantWarmupSchedule::KIND, |ctx, args| {
            Ok(Box::new(ConstantWarmupSchedule::from_args(ctx, args)?) as Box<dyn LrScheduler>)
        })?;
        ns.schedulers
            .register(StepLr::KIND, |ctx, args| Ok(Box::new(StepLr::from_args(ctx, args)?) as Box<dyn LrScheduler>))?;

        ns.visualizers.register(HtmlVisualizer::KIND, |(), args| {
            Ok(Box::new(HtmlVisualizer::from_args(args)?) as Box<dyn Visualizer>)
        })?;

        Ok(ns)
    }

    /// Checks the configuration against these namespaces before anything is
    /// built. `lr_scheduler` is not checked; an unknown scheduler degrades to
    /// none at build time.
    pub fn validate(&self, draft: &ConfigDraft) -> TrainingResult<()> {
        for section in REQUIRED_SECTIONS {
            draft.section(section)?;
        }

        check_section(draft, "data_loader", &self.data_loaders)?;
        check_section(draft, "arch", &self.models)?;
        check_section(draft, "loss", &self.losses)?;
        check_section(draft, "optimizer", &self.optimizers)?;

        let tokenizer = text_params(draft)?
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| TrainingError::InvalidConfig("'arch.args.text_params.model' must be a string".to_string()))?;
        self.tokenizers.check("arch.args.text_params.model", tokenizer)?;

        for name in draft.metric_names()? {
            self.metrics.check("metrics", &name)?;
        }

        if let Some(visualizer) = visualizer_type(draft) {
            self.visualizers.check("visualizer", visualizer)?;
        }
        Ok(())
    }
}

fn check_section<T, C>(draft: &ConfigDraft, section: &str, namespace: &Namespace<T, C>) -> TrainingResult<()> {
    let spec = ComponentSpec::from_section(section, draft.section(section)?)?;
    namespace.check(section, &spec.type_name)
}

/// `arch.args.text_params`, shared by the tokenizer and the model.
pub(crate) fn text_params(draft: &ConfigDraft) -> TrainingResult<&serde_json::Map<String, Value>> {
    draft
        .get("arch.args.text_params")
        .and_then(Value::as_object)
        .ok_or_else(|| TrainingError::InvalidConfig("'arch.args.text_params' must be a mapping".to_string()))
}

/// Configured visualizer type, `None` when absent or empty.
pub(crate) fn visualizer_type(draft: &ConfigDraft) -> Option<&str> {
    draft.get("visualizer.type").and_then(Value::as_str).filter(|t| !t.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> serde_json::Value {
        json!({
            "data_loader": {"type": "SyntheticDataLoader", "args": {"batch_size": 4}},
            "arch": {"type": "LinearFusion", "args": {"text_params": {"model": "hashing-bow"}}},
            "loss": {"type": "MseLoss"},
            "metrics": ["mean_absolute_error"],
            "optimizer": {"type": "SGD", "args": {"lr": 0.1}},
            "trainer": {"epochs": 1},
            "visualizer": {"type": ""}
        })
    }

    #[test]
    fn test_builtin_config_validates() {
        let ns = Namespaces::builtin().unwrap();
        ns.validate(&ConfigDraft::from_value(config()).unwrap()).unwrap();
        assert_eq!(ns.optimizers.names(), vec!["AdamW", "SGD"]);
    }

    #[test]
    fn test_unknown_types_rejected_up_front() {
        let ns = Namespaces::builtin().unwrap();
        for (key, value) in [
            ("optimizer.type", json!("Adamm")),
            ("arch.args.text_params.model", json!("bpe")),
            ("metrics", json!(["f1"])),
            ("visualizer.type", json!("Tensorboard")),
        ] {
            let mut draft = ConfigDraft::from_value(config()).unwrap();
            draft.set(key, value).unwrap();
            let err = ns.validate(&draft).unwrap_err();
            assert!(matches!(err, TrainingError::UnknownComponentType { .. }), "{key}: {err}");
        }
    }

    #[test]
    fn test_unknown_scheduler_is_not_rejected() {
        let ns = Namespaces::builtin().unwrap();
        let mut draft = ConfigDraft::from_value(config()).unwrap();
        draft.set("lr_scheduler", json!({"type": "CosineAnnealing"})).unwrap();
        assert!(ns.validate(&draft).is_ok());
    }

    #[test]
    fn test_missing_section() {
        let ns = Namespaces::builtin().unwrap();
        let mut value = config();
        value.as_object_mut().unwrap().remove("loss");
        let err = ns.validate(&ConfigDraft::from_value(value).unwrap()).unwrap_err();
        assert!(matches!(err, TrainingError::MissingConfigSection { ref section } if section == "loss"));
    }
}
