//! The training orchestrator.
//!
//! A `Trainer` owns every component of a run and drives it through
//! `Initializing -> (InitialValidation) -> TrainEpoch -> ValidateEpoch ->
//! {TrainEpoch | Terminated}`, checkpointing after validation and, when
//! `save_steps` is set, at a step cadence.

use crate::builder::{build_components_with, Components};
use crate::checkpoint::{
    Checkpoint, CheckpointSlot, CheckpointStore, ComponentSnapshot, ModelSnapshot, CHECKPOINT_FORMAT_VERSION,
};
use crate::config::{ConfigContext, RunConfiguration, TrainerSettings};
use crate::error::{TrainingError, TrainingResult};
use crate::layout::RunLayout;
use crate::namespaces::Namespaces;
use crate::state::{MetricTracker, TrainingState};
use chrono::Utc;
use mosaic_abstraction::{
    ComponentError, EncodedBatch, Loss, LrScheduler, Model, Optimizer, PredictionSample, ScheduleGranularity,
    VisualArtifacts,
};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Instrument, Span};

/// Where the orchestrator currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    InitialValidation,
    TrainEpoch(u64),
    ValidateEpoch(u64),
    Checkpointing,
    Terminated,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => f.write_str("initializing"),
            Self::InitialValidation => f.write_str("initial validation"),
            Self::TrainEpoch(epoch) => write!(f, "train epoch {epoch}"),
            Self::ValidateEpoch(epoch) => write!(f, "validate epoch {epoch}"),
            Self::Checkpointing => f.write_str("checkpointing"),
            Self::Terminated => f.write_str("terminated"),
        }
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// All configured epochs ran.
    Completed,
    /// `stale` consecutive validations did not improve the monitored score.
    EarlyStopped { stale: u32 },
    /// The cancellation token fired between steps.
    Interrupted,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutcome {
    pub termination: Termination,
    pub state: TrainingState,
    /// Validation passes, including the initial one.
    pub validations: usize,
    pub checkpoints_written: usize,
    pub best_checkpoint: Option<PathBuf>,
    pub last_checkpoint: Option<PathBuf>,
}

enum EpochEnd {
    Finished { mean_loss: Option<f64> },
    Interrupted,
}

/// Drives one training run.
pub struct Trainer {
    config: RunConfiguration,
    layout: RunLayout,
    resume: Option<PathBuf>,
    settings: TrainerSettings,
    components: Components,
    store: CheckpointStore,
    state: TrainingState,
    phase: Phase,
    cancel: CancellationToken,
    span: Span,
    validations: usize,
    consecutive_failures: u32,
    best_checkpoint: Option<PathBuf>,
    last_checkpoint: Option<PathBuf>,
}

impl fmt::Debug for Trainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trainer")
            .field("run", &self.layout.name())
            .field("run_id", &self.layout.run_id())
            .field("phase", &self.phase)
            .field("state", &self.state)
            .field("components", &self.components)
            .finish_non_exhaustive()
    }
}

impl Trainer {
    /// Takes ownership of built components and freezes the configuration.
    pub fn new(ctx: ConfigContext, components: Components) -> TrainingResult<Self> {
        let settings = ctx.trainer()?;
        let span = ctx.logger("trainer");
        let (draft, resume, layout) = ctx.into_parts();
        let store = CheckpointStore::new(layout.checkpoints_dir(), settings.keep_last);

        Ok(Self {
            config: draft.freeze(),
            layout,
            resume,
            settings,
            components,
            store,
            state: TrainingState::default(),
            phase: Phase::Initializing,
            cancel: CancellationToken::new(),
            span,
            validations: 0,
            consecutive_failures: 0,
            best_checkpoint: None,
            last_checkpoint: None,
        })
    }

    /// Builds components from `ctx` and wraps them in a trainer. Tracker
    /// credentials are read from the environment.
    pub fn from_context(ctx: ConfigContext, namespaces: &Namespaces) -> TrainingResult<Self> {
        Self::from_context_with(ctx, namespaces, |key| std::env::var(key).ok())
    }

    pub fn from_context_with(
        mut ctx: ConfigContext,
        namespaces: &Namespaces,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> TrainingResult<Self> {
        let components = build_components_with(&mut ctx, namespaces, lookup)?;
        Self::new(ctx, components)
    }

    /// Uses `token` to stop the run between steps.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.store = self.store.with_retry_backoff(backoff);
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &RunConfiguration {
        &self.config
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    pub fn settings(&self) -> &TrainerSettings {
        &self.settings
    }

    pub fn components(&self) -> &Components {
        &self.components
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn checkpoint_dir(&self) -> &Path {
        self.store.dir()
    }

    /// Runs to completion, early stop or interrupt.
    pub async fn train(&mut self) -> TrainingResult<TrainOutcome> {
        let span = self.span.clone();
        async {
            let result = self.run().await;
            self.components.sinks.flush().await;
            self.enter(Phase::Terminated);
            if let Err(e) = &result {
                warn!(error = %e, state = ?self.state, "Training aborted");
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run(&mut self) -> TrainingResult<TrainOutcome> {
        self.enter(Phase::Initializing);
        match self.resume.clone() {
            Some(path) => self.restore(&path)?,
            None => {
                if let Some(scheduler) = self.components.scheduler.as_ref() {
                    scheduler.apply(self.components.optimizer.as_mut());
                }
            }
        }

        self.components.sinks.log_config(self.config.as_value()).await?;
        self.store.write_config(self.config.as_value()).await?;
        info!(
            epochs = self.settings.epochs,
            start_epoch = self.state.current_epoch(),
            step = self.state.step,
            checkpoints = %self.store.dir().display(),
            "Starting training"
        );

        if self.settings.init_val && self.state.step == 0 && self.state.epoch == 0 {
            self.enter(Phase::InitialValidation);
            let results = self.validate_and_report(0).await?;
            self.update_best(&results, false);
            info!(best = ?self.state.best, monitor = %self.settings.monitor, "Initial validation done");
        }

        while self.state.epoch < self.settings.epochs {
            if self.cancel.is_cancelled() {
                return Ok(self.outcome(Termination::Interrupted));
            }

            let epoch = self.state.current_epoch();
            self.enter(Phase::TrainEpoch(epoch));
            let mean_loss = match self.train_epoch(epoch).await? {
                EpochEnd::Finished { mean_loss } => mean_loss,
                EpochEnd::Interrupted => {
                    info!(epoch, step = self.state.step, "Interrupted, last finalised checkpoint is kept");
                    return Ok(self.outcome(Termination::Interrupted));
                }
            };
            self.state.finish_epoch();

            if let Some(scheduler) = self.components.scheduler.as_mut() {
                if scheduler.granularity() == ScheduleGranularity::Epoch {
                    scheduler.step(self.components.optimizer.as_mut());
                }
            }
            if let Some(loss) = mean_loss {
                self.components.sinks.log_scalar("train/epoch_loss", loss, self.state.step).await;
            }
            info!(epoch, step = self.state.step, loss = ?mean_loss, lr = self.components.optimizer.learning_rate(), "Epoch finished");

            let mut improved = false;
            if epoch % self.settings.val_period == 0 {
                self.enter(Phase::ValidateEpoch(epoch));
                let results = self.validate_and_report(epoch).await?;
                improved = self.update_best(&results, true);
            }

            if epoch % self.settings.save_period == 0 {
                self.save(CheckpointSlot::Epoch(epoch)).await?;
            }
            if improved {
                self.save(CheckpointSlot::Best).await?;
            }

            if let Some(patience) = self.settings.early_stop {
                if self.settings.monitor.metric().is_some() && self.state.stale_validations >= patience {
                    info!(
                        epoch,
                        stale = self.state.stale_validations,
                        monitor = %self.settings.monitor,
                        "Validation performance didn't improve, stopping early"
                    );
                    return Ok(self.outcome(Termination::EarlyStopped { stale: self.state.stale_validations }));
                }
            }
        }

        info!(step = self.state.step, best = ?self.state.best, "Training completed");
        Ok(self.outcome(Termination::Completed))
    }

    fn enter(&mut self, phase: Phase) {
        debug!(from = %self.phase, to = %phase, "Phase transition");
        self.phase = phase;
    }

    /// Restores model, optimizer, scheduler and progress from `path`. Every
    /// compatibility check runs before anything is mutated.
    #[instrument(skip(self), fields(path = %path.display()))]
    fn restore(&mut self, path: &Path) -> TrainingResult<()> {
        let checkpoint = Checkpoint::load(path)?;
        let Components { model, optimizer, scheduler, .. } = &mut self.components;

        if checkpoint.model.kind != model.kind() {
            return Err(TrainingError::IncompatibleResume(format!(
                "checkpoint model is '{}', configured arch is '{}'",
                checkpoint.model.kind,
                model.kind()
            )));
        }
        if let Some(diff) = checkpoint.model.experts.mismatch(model.expert_streams()) {
            return Err(TrainingError::IncompatibleResume(format!("expert streams differ: {diff}")));
        }
        if checkpoint.model.parameters.len() != model.num_parameters() {
            return Err(TrainingError::IncompatibleResume(format!(
                "checkpoint has {} parameters, model has {}",
                checkpoint.model.parameters.len(),
                model.num_parameters()
            )));
        }
        if checkpoint.optimizer.kind != optimizer.kind() {
            return Err(TrainingError::IncompatibleResume(format!(
                "checkpoint optimizer is '{}', configured optimizer is '{}'",
                checkpoint.optimizer.kind,
                optimizer.kind()
            )));
        }
        match (&checkpoint.scheduler, scheduler.as_ref()) {
            (Some(saved), Some(current)) if saved.kind != current.kind() => {
                return Err(TrainingError::IncompatibleResume(format!(
                    "checkpoint lr_scheduler is '{}', configured lr_scheduler is '{}'",
                    saved.kind,
                    current.kind()
                )));
            }
            (Some(saved), None) => {
                return Err(TrainingError::IncompatibleResume(format!(
                    "checkpoint has lr_scheduler '{}' but none is configured",
                    saved.kind
                )));
            }
            (None, Some(current)) => {
                return Err(TrainingError::IncompatibleResume(format!(
                    "lr_scheduler '{}' is configured but the checkpoint has none",
                    current.kind()
                )));
            }
            _ => {}
        }

        model.parameters_mut().copy_from_slice(&checkpoint.model.parameters);
        optimizer
            .load_state(checkpoint.optimizer.state)
            .map_err(|e| TrainingError::IncompatibleResume(format!("optimizer state: {e}")))?;
        if let (Some(saved), Some(current)) = (checkpoint.scheduler, scheduler.as_mut()) {
            current
                .load_state(saved.state)
                .map_err(|e| TrainingError::IncompatibleResume(format!("lr_scheduler state: {e}")))?;
            current.apply(optimizer.as_mut());
        }

        self.state = checkpoint.training_state;
        info!(epoch = self.state.epoch, step = self.state.step, best = ?self.state.best, "Resumed from checkpoint");
        Ok(())
    }

    /// One pass over the training split, bounded by `max_samples_per_epoch`.
    #[instrument(skip(self), fields(step = self.state.step))]
    async fn train_epoch(&mut self, epoch: u64) -> TrainingResult<EpochEnd> {
        let Components { tokenizer, train_loader, model, loss, optimizer, scheduler, sinks, .. } = &mut self.components;
        let settings = &self.settings;
        let state = &mut self.state;

        let loader_kind = train_loader.kind();
        let log_step = settings.log_step_for(train_loader.batch_size());
        let epoch_total =
            settings.max_samples_per_epoch.map_or(train_loader.num_samples(), |b| b.min(train_loader.num_samples()));
        let mut losses = MetricTracker::new();

        if state.is_mid_epoch() {
            info!(epoch, batches = state.epoch_batches, samples = state.epoch_samples, "Continuing partially trained epoch");
        }
        let mut batches = train_loader.batches(state.epoch).skip(state.epoch_batches as usize);

        loop {
            if settings.max_samples_per_epoch.is_some_and(|budget| state.epoch_samples >= budget) {
                debug!(epoch, samples = state.epoch_samples, "Sample budget reached");
                break;
            }
            if self.cancel.is_cancelled() {
                return Ok(EpochEnd::Interrupted);
            }
            let Some(batch) = batches.next() else {
                break;
            };
            let batch = EncodedBatch::encode(
                batch.map_err(|e| TrainingError::component(loader_kind, e))?,
                tokenizer.as_ref(),
            );

            state.step += 1;
            state.epoch_batches += 1;
            state.epoch_samples += batch.len();

            match optimize_batch(model.as_mut(), loss.as_ref(), optimizer.as_mut(), &batch, state.step) {
                Ok(value) => {
                    self.consecutive_failures = 0;
                    if let Some(scheduler) = scheduler.as_mut() {
                        if scheduler.granularity() == ScheduleGranularity::Step {
                            scheduler.step(optimizer.as_mut());
                        }
                    }
                    losses.update("loss", f64::from(value), batch.len());
                    sinks.log_scalar("train/loss", f64::from(value), state.step).await;
                    sinks.log_scalar("train/lr", optimizer.learning_rate(), state.step).await;

                    if state.epoch_batches % log_step as u64 == 0 {
                        info!(
                            "Train Epoch: {epoch} [{}/{epoch_total} ({:.0}%)] Loss: {value:.6}",
                            state.epoch_samples,
                            100.0 * state.epoch_samples as f64 / epoch_total.max(1) as f64
                        );
                    }
                }
                Err(TrainingError::NumericInstability { step, reason }) => {
                    self.consecutive_failures += 1;
                    warn!(step, reason = %reason, consecutive = self.consecutive_failures, "Skipping batch");
                    if self.consecutive_failures > settings.max_consecutive_failures {
                        return Err(TrainingError::DivergedTraining {
                            failures: self.consecutive_failures,
                            threshold: settings.max_consecutive_failures,
                        });
                    }
                }
                Err(e) => return Err(e),
            }

            if settings.save_steps.is_some_and(|every| state.step % every == 0) {
                self.phase = Phase::Checkpointing;
                let checkpoint = snapshot(
                    model.as_ref(),
                    optimizer.as_ref(),
                    scheduler.as_deref(),
                    state,
                    &self.config,
                )?;
                let path = self.store.save(CheckpointSlot::Step(state.step), &checkpoint).await?;
                self.last_checkpoint = Some(path);
                self.phase = Phase::TrainEpoch(epoch);
            }
        }

        Ok(EpochEnd::Finished { mean_loss: losses.get("loss") })
    }

    /// Validation pass followed by sink reporting.
    async fn validate_and_report(&mut self, epoch: u64) -> TrainingResult<BTreeMap<String, f64>> {
        let (results, samples) = validate(&self.components, epoch)?;
        self.validations += 1;

        for (key, value) in &results {
            info!(epoch, "    {key:15}: {value}");
        }
        let step = self.state.step;
        self.components.sinks.log_scalars("valid", &results, step).await;
        self.components.sinks.render(step, &VisualArtifacts { epoch, metrics: results.clone(), samples });
        Ok(results)
    }

    /// Compares the monitored score against the best so far. Returns whether
    /// it improved. `count_stale` is false for the initial validation.
    fn update_best(&mut self, results: &BTreeMap<String, f64>, count_stale: bool) -> bool {
        let Some(metric) = self.settings.monitor.metric() else {
            return false;
        };
        let key = metric.strip_prefix("val_").unwrap_or(metric);
        let Some(&score) = results.get(key) else {
            warn!(metric, "Monitored metric was not produced by validation");
            return false;
        };

        if self.settings.monitor.improves(score, self.state.best) {
            debug!(metric, score, previous = ?self.state.best, "New best");
            self.state.best = Some(score);
            self.state.stale_validations = 0;
            true
        } else {
            if count_stale {
                self.state.stale_validations += 1;
            }
            false
        }
    }

    async fn save(&mut self, slot: CheckpointSlot) -> TrainingResult<PathBuf> {
        let previous = self.phase;
        self.enter(Phase::Checkpointing);
        let checkpoint = snapshot(
            self.components.model.as_ref(),
            self.components.optimizer.as_ref(),
            self.components.scheduler.as_deref(),
            &self.state,
            &self.config,
        )?;
        let path = self.store.save(slot, &checkpoint).await?;
        if slot == CheckpointSlot::Best {
            info!(path = %path.display(), best = ?self.state.best, "Saving current best");
            self.best_checkpoint = Some(path.clone());
        } else {
            self.last_checkpoint = Some(path.clone());
        }
        self.enter(previous);
        Ok(path)
    }

    fn outcome(&self, termination: Termination) -> TrainOutcome {
        TrainOutcome {
            termination,
            state: self.state.clone(),
            validations: self.validations,
            checkpoints_written: self.store.writes(),
            best_checkpoint: self.best_checkpoint.clone(),
            last_checkpoint: self.last_checkpoint.clone(),
        }
    }
}

/// Forward, loss, backward and optimizer step for one batch.
///
/// Non-finite outputs, loss or gradients yield `NumericInstability` and leave
/// parameters and optimizer state untouched.
fn optimize_batch(
    model: &mut dyn Model,
    loss: &dyn Loss,
    optimizer: &mut dyn Optimizer,
    batch: &EncodedBatch,
    step: u64,
) -> TrainingResult<f32> {
    let unstable = |reason: String| TrainingError::NumericInstability { step, reason };
    let wrap = |component: &str, e: ComponentError| match e {
        ComponentError::Numerical(reason) => unstable(reason),
        e => TrainingError::component(component, e),
    };

    let outputs = model.forward(batch).map_err(|e| wrap(model.kind(), e))?;
    if outputs.iter().any(|o| !o.is_finite()) {
        return Err(unstable(format!("non-finite output from {}", model.kind())));
    }
    let output = loss.compute(&outputs, &batch.labels).map_err(|e| wrap(loss.kind(), e))?;
    if !output.value.is_finite() {
        return Err(unstable(format!("non-finite {} value {}", loss.kind(), output.value)));
    }
    let grads = model.backward(batch, &output.grad).map_err(|e| wrap(model.kind(), e))?;
    if grads.iter().any(|g| !g.is_finite()) {
        return Err(unstable("non-finite gradient".to_string()));
    }
    optimizer.step(model.parameters_mut(), &grads).map_err(|e| wrap(optimizer.kind(), e))?;
    Ok(output.value)
}

/// Inference over the validation split. Returns aggregated results keyed
/// `loss` and by metric name, and the predictions of the first batch.
fn validate(components: &Components, epoch: u64) -> TrainingResult<(BTreeMap<String, f64>, Vec<PredictionSample>)> {
    let Components { tokenizer, val_loader, model, loss, metrics, .. } = components;
    let mut tracker = MetricTracker::new();
    tracker.track("loss", mosaic_abstraction::Aggregation::Mean);
    for metric in metrics {
        tracker.track(metric.name(), metric.aggregation());
    }

    let mut samples = Vec::new();
    for batch in val_loader.batches(0) {
        let batch =
            EncodedBatch::encode(batch.map_err(|e| TrainingError::component(val_loader.kind(), e))?, tokenizer.as_ref());
        if batch.is_empty() {
            continue;
        }
        let outputs = model.forward(&batch).map_err(|e| TrainingError::component(model.kind(), e))?;
        let output = loss.compute(&outputs, &batch.labels).map_err(|e| TrainingError::component(loss.kind(), e))?;

        tracker.update("loss", f64::from(output.value), batch.len());
        for metric in metrics {
            tracker.update(metric.name(), metric.score(&outputs, &batch.labels), batch.len());
        }
        if samples.is_empty() {
            samples = batch
                .texts
                .iter()
                .zip(&outputs)
                .zip(&batch.labels)
                .map(|((text, &prediction), &label)| PredictionSample { text: text.clone(), prediction, label })
                .collect();
        }
    }

    let results = tracker.result();
    debug!(epoch, ?results, "Validation finished");
    Ok((results, samples))
}

fn snapshot(
    model: &dyn Model,
    optimizer: &dyn Optimizer,
    scheduler: Option<&dyn LrScheduler>,
    state: &TrainingState,
    config: &RunConfiguration,
) -> TrainingResult<Checkpoint> {
    Ok(Checkpoint {
        format_version: CHECKPOINT_FORMAT_VERSION,
        created_at: Utc::now(),
        model: ModelSnapshot::capture(model),
        optimizer: ComponentSnapshot {
            kind: optimizer.kind().to_string(),
            state: optimizer.state().map_err(|e| TrainingError::component(optimizer.kind(), e))?,
        },
        scheduler: scheduler.map(|s| ComponentSnapshot { kind: s.kind().to_string(), state: s.state() }),
        training_state: state.clone(),
        config: config.as_value().clone(),
    })
}
