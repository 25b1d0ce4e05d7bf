//! Optimizers over a flat parameter vector.
//!
//! ## AdamW
//!
//! ```text
//! θ = θ * (1 - lr * λ)
//! m = β₁ * m + (1 - β₁) * g
//! v = β₂ * v + (1 - β₂) * g²
//! θ = θ - lr * m_hat / (√v_hat + ε)
//! ```
//!
//! `m_hat`/`v_hat` are the bias-corrected moments; with `correct_bias = false`
//! the raw moments are used.

use mosaic_abstraction::{parse_args, ComponentArgs, ComponentError, ComponentResult, Optimizer, OptimizerContext};
use serde::{Deserialize, Serialize};

fn check_step(params: &[f32], grads: &[f32], expected: usize) -> ComponentResult<()> {
    if params.len() != expected || grads.len() != expected {
        return Err(ComponentError::ShapeMismatch(format!(
            "optimizer built for {expected} parameters, got {} params / {} grads",
            params.len(),
            grads.len()
        )));
    }
    Ok(())
}

fn check_lr(lr: f64) -> ComponentResult<()> {
    if lr.is_finite() && lr >= 0.0 {
        Ok(())
    } else {
        Err(ComponentError::InvalidArguments(format!("lr must be a non-negative number, got {lr}")))
    }
}

fn default_sgd_lr() -> f64 {
    0.01
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SgdArgs {
    #[serde(default = "default_sgd_lr")]
    lr: f64,
    #[serde(default)]
    momentum: f64,
    #[serde(default)]
    weight_decay: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SgdState {
    lr: f64,
    velocity: Vec<f32>,
}

/// Stochastic gradient descent with optional momentum and L2 weight decay.
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f64,
    momentum: f32,
    weight_decay: f32,
    velocity: Vec<f32>,
}

impl Sgd {
    pub const KIND: &'static str = "SGD";

    pub fn from_args(ctx: OptimizerContext, args: &ComponentArgs) -> ComponentResult<Self> {
        let args: SgdArgs = parse_args(args)?;
        check_lr(args.lr)?;
        Ok(Self {
            lr: args.lr,
            momentum: args.momentum as f32,
            weight_decay: args.weight_decay as f32,
            velocity: vec![0.0; ctx.num_parameters],
        })
    }
}

impl Optimizer for Sgd {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn step(&mut self, params: &mut [f32], grads: &[f32]) -> ComponentResult<()> {
        check_step(params, grads, self.velocity.len())?;
        let lr = self.lr as f32;
        for ((p, g), v) in params.iter_mut().zip(grads).zip(self.velocity.iter_mut()) {
            let g = g + self.weight_decay * *p;
            *v = self.momentum * *v + g;
            *p -= lr * *v;
        }
        Ok(())
    }

    fn state(&self) -> ComponentResult<serde_json::Value> {
        Ok(serde_json::to_value(SgdState { lr: self.lr, velocity: self.velocity.clone() })?)
    }

    fn load_state(&mut self, state: serde_json::Value) -> ComponentResult<()> {
        let state: SgdState =
            serde_json::from_value(state).map_err(|e| ComponentError::State(format!("SGD state: {e}")))?;
        if state.velocity.len() != self.velocity.len() {
            return Err(ComponentError::State(format!(
                "SGD state holds {} entries, optimizer has {}",
                state.velocity.len(),
                self.velocity.len()
            )));
        }
        self.lr = state.lr;
        self.velocity = state.velocity;
        Ok(())
    }
}

fn default_adamw_lr() -> f64 {
    1e-3
}

fn default_betas() -> (f64, f64) {
    (0.9, 0.999)
}

fn default_eps() -> f64 {
    1e-8
}

fn default_correct_bias() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AdamWArgs {
    #[serde(default = "default_adamw_lr")]
    lr: f64,
    #[serde(default = "default_betas")]
    betas: (f64, f64),
    #[serde(default = "default_eps")]
    eps: f64,
    #[serde(default)]
    weight_decay: f64,
    #[serde(default = "default_correct_bias")]
    correct_bias: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct AdamWState {
    lr: f64,
    step: u64,
    exp_avg: Vec<f32>,
    exp_avg_sq: Vec<f32>,
}

/// Adam with decoupled weight decay.
#[derive(Debug, Clone)]
pub struct AdamW {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    correct_bias: bool,
    step: u64,
    exp_avg: Vec<f32>,
    exp_avg_sq: Vec<f32>,
}

impl AdamW {
    pub const KIND: &'static str = "AdamW";

    pub fn from_args(ctx: OptimizerContext, args: &ComponentArgs) -> ComponentResult<Self> {
        let args: AdamWArgs = parse_args(args)?;
        check_lr(args.lr)?;
        let (beta1, beta2) = args.betas;
        if !(0.0..1.0).contains(&beta1) || !(0.0..1.0).contains(&beta2) {
            return Err(ComponentError::InvalidArguments(format!("betas must be in [0, 1), got ({beta1}, {beta2})")));
        }
        Ok(Self {
            lr: args.lr,
            beta1,
            beta2,
            eps: args.eps,
            weight_decay: args.weight_decay,
            correct_bias: args.correct_bias,
            step: 0,
            exp_avg: vec![0.0; ctx.num_parameters],
            exp_avg_sq: vec![0.0; ctx.num_parameters],
        })
    }
}

impl Optimizer for AdamW {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn step(&mut self, params: &mut [f32], grads: &[f32]) -> ComponentResult<()> {
        check_step(params, grads, self.exp_avg.len())?;
        self.step += 1;

        let step = i32::try_from(self.step).unwrap_or(i32::MAX);
        let (bias1, bias2) = if self.correct_bias {
            (1.0 - self.beta1.powi(step), 1.0 - self.beta2.powi(step))
        } else {
            (1.0, 1.0)
        };
        let decay = (1.0 - self.lr * self.weight_decay) as f32;
        let (beta1, beta2) = (self.beta1 as f32, self.beta2 as f32);

        for (i, (p, g)) in params.iter_mut().zip(grads).enumerate() {
            *p *= decay;
            let m = &mut self.exp_avg[i];
            let v = &mut self.exp_avg_sq[i];
            *m = beta1 * *m + (1.0 - beta1) * g;
            *v = beta2 * *v + (1.0 - beta2) * g * g;
            let m_hat = f64::from(*m) / bias1;
            let v_hat = f64::from(*v) / bias2;
            *p -= (self.lr * m_hat / (v_hat.sqrt() + self.eps)) as f32;
        }
        Ok(())
    }

    fn state(&self) -> ComponentResult<serde_json::Value> {
        Ok(serde_json::to_value(AdamWState {
            lr: self.lr,
            step: self.step,
            exp_avg: self.exp_avg.clone(),
            exp_avg_sq: self.exp_avg_sq.clone(),
        })?)
    }

    fn load_state(&mut self, state: serde_json::Value) -> ComponentResult<()> {
        let state: AdamWState =
            serde_json::from_value(state).map_err(|e| ComponentError::State(format!("AdamW state: {e}")))?;
        if state.exp_avg.len() != self.exp_avg.len() || state.exp_avg_sq.len() != self.exp_avg_sq.len() {
            return Err(ComponentError::State(format!(
                "AdamW state holds {} moments, optimizer has {}",
                state.exp_avg.len(),
                self.exp_avg.len()
            )));
        }
        self.lr = state.lr;
        self.step = state.step;
        self.exp_avg = state.exp_avg;
        self.exp_avg_sq = state.exp_avg_sq;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(value: serde_json::Value) -> ComponentArgs {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_sgd_momentum() {
        let mut opt = Sgd::from_args(OptimizerContext { num_parameters: 1 }, &args(serde_json::json!({"lr": 0.1, "momentum": 0.5})))
            .unwrap();
        let mut params = [1.0_f32];
        opt.step(&mut params, &[1.0]).unwrap();
        assert!((params[0] - 0.9).abs() < 1e-6);
        opt.step(&mut params, &[1.0]).unwrap();
        // velocity = 0.5 * 1 + 1
        assert!((params[0] - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_adamw_first_step_moves_by_lr() {
        let mut opt = AdamW::from_args(OptimizerContext { num_parameters: 2 }, &args(serde_json::json!({"lr": 0.01}))).unwrap();
        let mut params = [0.5_f32, -0.5];
        opt.step(&mut params, &[3.0, -0.2]).unwrap();
        assert!((params[0] - 0.49).abs() < 1e-5);
        assert!((params[1] + 0.49).abs() < 1e-5);
    }

    #[test]
    fn test_state_round_trip_continues_identically() {
        let ctx = OptimizerContext { num_parameters: 3 };
        let mut a = AdamW::from_args(ctx, &args(serde_json::json!({"lr": 0.05, "weight_decay": 0.01}))).unwrap();
        let mut params = [0.1_f32, 0.2, 0.3];
        a.step(&mut params, &[0.5, -0.5, 1.0]).unwrap();

        let mut b = AdamW::from_args(ctx, &args(serde_json::json!({"lr": 0.05, "weight_decay": 0.01}))).unwrap();
        b.load_state(a.state().unwrap()).unwrap();

        let mut pa = params;
        let mut pb = params;
        a.step(&mut pa, &[0.1, 0.1, 0.1]).unwrap();
        b.step(&mut pb, &[0.1, 0.1, 0.1]).unwrap();
        assert_eq!(pa, pb);
    }

    #[test]
    fn test_load_state_rejects_wrong_size() {
        let mut small = Sgd::from_args(OptimizerContext { num_parameters: 2 }, &ComponentArgs::new()).unwrap();
        let big = Sgd::from_args(OptimizerContext { num_parameters: 5 }, &ComponentArgs::new()).unwrap();
        let err = small.load_state(big.state().unwrap()).unwrap_err();
        assert!(matches!(err, ComponentError::State(_)));
    }

    #[test]
    fn test_step_rejects_wrong_gradient_length() {
        let mut opt = Sgd::from_args(OptimizerContext { num_parameters: 2 }, &ComponentArgs::new()).unwrap();
        let mut params = [0.0_f32; 2];
        assert!(opt.step(&mut params, &[1.0]).is_err());
    }

    #[test]
    fn test_unknown_argument_is_rejected() {
        let err = AdamW::from_args(OptimizerContext { num_parameters: 1 }, &args(serde_json::json!({"learning_rate": 0.1})))
            .unwrap_err();
        assert!(matches!(err, ComponentError::InvalidArguments(_)));
    }
}
