//! Training objectives.

use mosaic_abstraction::{ComponentArgs, ComponentError, ComponentResult, Loss, LossOutput};

fn check_lengths(outputs: &[f32], labels: &[f32]) -> ComponentResult<()> {
    if outputs.len() != labels.len() {
        return Err(ComponentError::ShapeMismatch(format!(
            "{} outputs for {} labels",
            outputs.len(),
            labels.len()
        )));
    }
    if outputs.is_empty() {
        return Err(ComponentError::ShapeMismatch("empty batch".to_string()));
    }
    Ok(())
}

fn reject_args(kind: &str, args: &ComponentArgs) -> ComponentResult<()> {
    match args.keys().next() {
        Some(key) => Err(ComponentError::InvalidArguments(format!("{kind} takes no arguments, got '{key}'"))),
        None => Ok(()),
    }
}

/// Mean squared error.
#[derive(Debug, Clone, Copy, Default)]
pub struct MseLoss;

impl MseLoss {
    pub const KIND: &'static str = "MseLoss";

    pub fn from_args(args: &ComponentArgs) -> ComponentResult<Self> {
        reject_args(Self::KIND, args)?;
        Ok(Self)
    }
}

impl Loss for MseLoss {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn compute(&self, outputs: &[f32], labels: &[f32]) -> ComponentResult<LossOutput> {
        check_lengths(outputs, labels)?;
        let n = outputs.len() as f32;
        let diffs: Vec<f32> = outputs.iter().zip(labels).map(|(o, y)| o - y).collect();
        let value = diffs.iter().map(|d| d * d).sum::<f32>() / n;
        let grad = diffs.iter().map(|d| 2.0 * d / n).collect();
        Ok(LossOutput { value, grad })
    }
}

/// Binary cross-entropy on raw logits, in the numerically stable form
/// `max(z, 0) - z*y + ln(1 + e^-|z|)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BceWithLogitsLoss;

impl BceWithLogitsLoss {
    pub const KIND: &'static str = "BceWithLogitsLoss";

    pub fn from_args(args: &ComponentArgs) -> ComponentResult<Self> {
        reject_args(Self::KIND, args)?;
        Ok(Self)
    }
}

pub(crate) fn sigmoid(z: f32) -> f32 {
    1.0 / (1.0 + (-z).exp())
}

impl Loss for BceWithLogitsLoss {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn compute(&self, outputs: &[f32], labels: &[f32]) -> ComponentResult<LossOutput> {
        check_lengths(outputs, labels)?;
        let n = outputs.len() as f32;
        let value = outputs
            .iter()
            .zip(labels)
            .map(|(z, y)| z.max(0.0) - z * y + (-z.abs()).exp().ln_1p())
            .sum::<f32>()
            / n;
        let grad = outputs.iter().zip(labels).map(|(z, y)| (sigmoid(*z) - y) / n).collect();
        Ok(LossOutput { value, grad })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mse() {
        let out = MseLoss.compute(&[1.0, 3.0], &[0.0, 1.0]).unwrap();
        assert!((out.value - 2.5).abs() < 1e-6);
        assert_eq!(out.grad, vec![1.0, 2.0]);
    }

    #[test]
    fn test_bce_matches_closed_form_at_zero() {
        let out = BceWithLogitsLoss.compute(&[0.0, 0.0], &[1.0, 0.0]).unwrap();
        assert!((out.value - std::f32::consts::LN_2).abs() < 1e-6);
        assert!((out.grad[0] + 0.25).abs() < 1e-6);
        assert!((out.grad[1] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_bce_is_finite_for_large_logits() {
        let out = BceWithLogitsLoss.compute(&[80.0, -80.0], &[0.0, 1.0]).unwrap();
        assert!(out.value.is_finite());
        assert!((out.value - 80.0).abs() < 1e-3);
    }

    #[test]
    fn test_length_mismatch() {
        let err = MseLoss.compute(&[1.0], &[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, ComponentError::ShapeMismatch(_)));
    }

    #[test]
    fn test_losses_take_no_arguments() {
        let mut args = ComponentArgs::new();
        args.insert("reduction".to_string(), serde_json::json!("sum"));
        assert!(MseLoss::from_args(&args).is_err());
        assert!(BceWithLogitsLoss::from_args(&ComponentArgs::new()).is_ok());
    }
}
