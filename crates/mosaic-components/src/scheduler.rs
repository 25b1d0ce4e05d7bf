//! Learning-rate schedules. Each declares whether it advances per optimizer
//! step or per epoch.

use mosaic_abstraction::{
    parse_args, ComponentArgs, ComponentError, ComponentResult, LrScheduler, Optimizer, ScheduleGranularity,
    SchedulerContext,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
struct SchedulerState {
    count: u64,
}

fn load_count(kind: &str, state: serde_json::Value) -> ComponentResult<u64> {
    serde_json::from_value::<SchedulerState>(state)
        .map(|s| s.count)
        .map_err(|e| ComponentError::State(format!("{kind} state: {e}")))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LinearWarmupArgs {
    #[serde(default)]
    num_warmup_steps: u64,
    num_training_steps: u64,
}

/// Linear warmup from 0 to the base rate, then linear decay to 0 at
/// `num_training_steps`.
#[derive(Debug, Clone)]
pub struct LinearWarmupSchedule {
    base_lr: f64,
    warmup: u64,
    total: u64,
    count: u64,
}

impl LinearWarmupSchedule {
    pub const KIND: &'static str = "get_linear_schedule_with_warmup";

    pub fn from_args(ctx: SchedulerContext, args: &ComponentArgs) -> ComponentResult<Self> {
        let args: LinearWarmupArgs = parse_args(args)?;
        if args.num_training_steps == 0 || args.num_warmup_steps > args.num_training_steps {
            return Err(ComponentError::InvalidArguments(format!(
                "need 0 < num_training_steps and num_warmup_steps <= num_training_steps, got {} / {}",
                args.num_warmup_steps, args.num_training_steps
            )));
        }
        Ok(Self { base_lr: ctx.base_lr, warmup: args.num_warmup_steps, total: args.num_training_steps, count: 0 })
    }

    fn factor(&self) -> f64 {
        if self.count < self.warmup {
            return self.count as f64 / self.warmup.max(1) as f64;
        }
        let remaining = self.total.saturating_sub(self.count) as f64;
        (remaining / (self.total - self.warmup).max(1) as f64).max(0.0)
    }
}

impl LrScheduler for LinearWarmupSchedule {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn granularity(&self) -> ScheduleGranularity {
        ScheduleGranularity::Step
    }

    fn apply(&self, optimizer: &mut dyn Optimizer) {
        optimizer.set_learning_rate(self.base_lr * self.factor());
    }

    fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.count += 1;
        self.apply(optimizer);
    }

    fn state(&self) -> serde_json::Value {
        serde_json::json!({ "count": self.count })
    }

    fn load_state(&mut self, state: serde_json::Value) -> ComponentResult<()> {
        self.count = load_count(Self::KIND, state)?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConstantWarmupArgs {
    #[serde(default)]
    num_warmup_steps: u64,
}

/// Linear warmup, then the base rate for the rest of training.
#[derive(Debug, Clone)]
pub struct ConstantWarmupSchedule {
    base_lr: f64,
    warmup: u64,
    count: u64,
}

impl ConstantWarmupSchedule {
    pub const KIND: &'static str = "get_constant_schedule_with_warmup";

    pub fn from_args(ctx: SchedulerContext, args: &ComponentArgs) -> ComponentResult<Self> {
        let args: ConstantWarmupArgs = parse_args(args)?;
        Ok(Self { base_lr: ctx.base_lr, warmup: args.num_warmup_steps, count: 0 })
    }

    fn factor(&self) -> f64 {
        if self.count < self.warmup { self.count as f64 / self.warmup as f64 } else { 1.0 }
    }
}

impl LrScheduler for ConstantWarmupSchedule {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn granularity(&self) -> ScheduleGranularity {
        ScheduleGranularity::Step
    }

    fn apply(&self, optimizer: &mut dyn Optimizer) {
        optimizer.set_learning_rate(self.base_lr * self.factor());
    }

    fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.count += 1;
        self.apply(optimizer);
    }

    fn state(&self) -> serde_json::Value {
        serde_json::json!({ "count": self.count })
    }

    fn load_state(&mut self, state: serde_json::Value) -> ComponentResult<()> {
        self.count = load_count(Self::KIND, state)?;
        Ok(())
    }
}

fn default_gamma() -> f64 {
    0.1
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepLrArgs {
    step_size: u64,
    #[serde(default = "default_gamma")]
    gamma: f64,
}

/// Multiplies the rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone)]
pub struct StepLr {
    base_lr: f64,
    step_size: u64,
    gamma: f64,
    count: u64,
}

impl StepLr {
    pub const KIND: &'static str = "StepLR";

    pub fn from_args(ctx: SchedulerContext, args: &ComponentArgs) -> ComponentResult<Self> {
        let args: StepLrArgs = parse_args(args)?;
        if args.step_size == 0 {
            return Err(ComponentError::InvalidArguments("step_size must be >= 1".to_string()));
        }
        Ok(Self { base_lr: ctx.base_lr, step_size: args.step_size, gamma: args.gamma, count: 0 })
    }
}

impl LrScheduler for StepLr {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn granularity(&self) -> ScheduleGranularity {
        ScheduleGranularity::Epoch
    }

    fn apply(&self, optimizer: &mut dyn Optimizer) {
        let decays = i32::try_from(self.count / self.step_size).unwrap_or(i32::MAX);
        optimizer.set_learning_rate(self.base_lr * self.gamma.powi(decays));
    }

    fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.count += 1;
        self.apply(optimizer);
    }

    fn state(&self) -> serde_json::Value {
        serde_json::json!({ "count": self.count })
    }

    fn load_state(&mut self, state: serde_json::Value) -> ComponentResult<()> {
        self.count = load_count(Self::KIND, state)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::Sgd;
    use mosaic_abstraction::OptimizerContext;

    fn sgd() -> Sgd {
        let mut args = ComponentArgs::new();
        args.insert("lr".to_string(), serde_json::json!(1.0));
        Sgd::from_args(OptimizerContext { num_parameters: 1 }, &args).unwrap()
    }

    fn args(value: serde_json::Value) -> ComponentArgs {
        value.as_object().unwrap().clone()
    }

    const CTX: SchedulerContext = SchedulerContext { base_lr: 1.0 };

    #[test]
    fn test_linear_warmup_then_decay() {
        let mut opt = sgd();
        let mut sched = LinearWarmupSchedule::from_args(
            CTX,
            &args(serde_json::json!({"num_warmup_steps": 2, "num_training_steps": 6})),
        )
        .unwrap();
        sched.apply(&mut opt);
        assert!(opt.learning_rate().abs() < 1e-12);

        let mut rates = Vec::new();
        for _ in 0..7 {
            sched.step(&mut opt);
            rates.push(opt.learning_rate());
        }
        let expected = [0.5, 1.0, 0.75, 0.5, 0.25, 0.0, 0.0];
        for (got, want) in rates.iter().zip(expected) {
            assert!((got - want).abs() < 1e-12, "{rates:?}");
        }
    }

    #[test]
    fn test_constant_warmup() {
        let mut opt = sgd();
        let mut sched = ConstantWarmupSchedule::from_args(CTX, &args(serde_json::json!({"num_warmup_steps": 4}))).unwrap();
        sched.step(&mut opt);
        assert!((opt.learning_rate() - 0.25).abs() < 1e-12);
        for _ in 0..10 {
            sched.step(&mut opt);
        }
        assert!((opt.learning_rate() - 1.0).abs() < 1e-12);
        assert_eq!(sched.granularity(), ScheduleGranularity::Step);
    }

    #[test]
    fn test_step_lr_is_per_epoch() {
        let mut opt = sgd();
        let mut sched = StepLr::from_args(CTX, &args(serde_json::json!({"step_size": 2, "gamma": 0.5}))).unwrap();
        assert_eq!(sched.granularity(), ScheduleGranularity::Epoch);
        sched.step(&mut opt);
        assert!((opt.learning_rate() - 1.0).abs() < 1e-12);
        sched.step(&mut opt);
        assert!((opt.learning_rate() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_state_restores_position() {
        let mut opt = sgd();
        let mut a = StepLr::from_args(CTX, &args(serde_json::json!({"step_size": 1, "gamma": 0.5}))).unwrap();
        a.step(&mut opt);
        a.step(&mut opt);

        let mut b = StepLr::from_args(CTX, &args(serde_json::json!({"step_size": 1, "gamma": 0.5}))).unwrap();
        b.load_state(a.state()).unwrap();
        b.apply(&mut opt);
        assert!((opt.learning_rate() - 0.25).abs() < 1e-12);
        assert!(b.load_state(serde_json::json!({"cnt": 1})).is_err());
    }
}
