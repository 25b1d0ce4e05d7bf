//! Text + expert fusion models.
//!
//! Text is embedded as a normalised bag of hashed token buckets; each expert
//! stream contributes its raw feature vector. The input layout is derived from
//! the `experts_used` argument, so the model is shaped by the data at runtime.

use mosaic_abstraction::{
    parse_args, ComponentArgs, ComponentError, ComponentResult, Device, EncodedBatch, ExpertStreamSet, Model,
    ModelContext,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use tracing::warn;

/// `arch.args.text_params`. The tokenizer reads the same object.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TextParams {
    /// Tokenizer type name.
    pub model: String,
    #[serde(default = "default_embed_dim")]
    pub embed_dim: usize,
    #[serde(default)]
    pub vocab_size: Option<usize>,
    #[serde(default = "default_lowercase")]
    pub lowercase: bool,
}

fn default_embed_dim() -> usize {
    64
}

fn default_lowercase() -> bool {
    true
}

fn default_init_scale() -> f32 {
    0.01
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FusionArgs {
    text_params: TextParams,
    #[serde(default)]
    experts_used: ExpertStreamSet,
    #[serde(default)]
    seed: u64,
    #[serde(default = "default_init_scale")]
    init_scale: f32,
}

/// Input segments: the text embedding followed by each expert stream.
#[derive(Debug, Clone)]
struct Segments {
    text_dim: usize,
    experts: ExpertStreamSet,
}

impl Segments {
    fn new(args: &FusionArgs, ctx: &ModelContext) -> ComponentResult<Self> {
        if args.text_params.embed_dim == 0 {
            return Err(ComponentError::InvalidArguments("text_params.embed_dim must be >= 1".to_string()));
        }
        if matches!(ctx.device, Device::Accelerators(_)) {
            warn!(device = %ctx.device, "No accelerator support in fusion models, training will be performed on CPU");
        }
        Ok(Self { text_dim: args.text_params.embed_dim.min(ctx.vocab_size.max(1)), experts: args.experts_used.clone() })
    }

    fn dims(&self) -> Vec<usize> {
        std::iter::once(self.text_dim).chain(self.experts.iter().map(|(_, dim)| dim)).collect()
    }

    fn input_dim(&self) -> usize {
        self.text_dim + self.experts.total_dim()
    }

    /// One feature vector per segment, per sample.
    fn features(&self, batch: &EncodedBatch) -> ComponentResult<Vec<Vec<Vec<f32>>>> {
        self.experts.check_features(&batch.experts, batch.len())?;
        if batch.tokens.len() != batch.len() {
            return Err(ComponentError::ShapeMismatch(format!(
                "{} token rows for {} samples",
                batch.tokens.len(),
                batch.len()
            )));
        }

        Ok((0..batch.len())
            .map(|row| {
                let mut segments = Vec::with_capacity(1 + self.experts.len());
                segments.push(self.text_features(&batch.tokens[row]));
                for name in self.experts.names() {
                    segments.push(batch.experts[name][row].clone());
                }
                segments
            })
            .collect())
    }

    fn text_features(&self, tokens: &[u32]) -> Vec<f32> {
        let mut bag = vec![0.0; self.text_dim];
        if tokens.is_empty() {
            return bag;
        }
        let weight = 1.0 / tokens.len() as f32;
        for token in tokens {
            bag[*token as usize % self.text_dim] += weight;
        }
        bag
    }

    fn describe(&self) -> String {
        format!("text:{} + experts[{}]", self.text_dim, self.experts)
    }
}

fn init_params(len: usize, seed: u64, scale: f32) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| if scale > 0.0 { rng.gen_range(-scale..scale) } else { 0.0 }).collect()
}

fn dot(weights: &[f32], values: &[f32]) -> f32 {
    weights.iter().zip(values).map(|(w, x)| w * x).sum()
}

fn check_grad_len(grad_outputs: &[f32], batch: &EncodedBatch) -> ComponentResult<()> {
    if grad_outputs.len() == batch.len() {
        Ok(())
    } else {
        Err(ComponentError::ShapeMismatch(format!(
            "{} output gradients for {} samples",
            grad_outputs.len(),
            batch.len()
        )))
    }
}

/// Concatenates all segments and applies one linear layer.
#[derive(Debug, Clone)]
pub struct LinearFusion {
    segments: Segments,
    /// `[weights (input_dim), bias]`
    params: Vec<f32>,
}

impl LinearFusion {
    pub const KIND: &'static str = "LinearFusion";

    pub fn from_args(ctx: ModelContext, args: &ComponentArgs) -> ComponentResult<Self> {
        let args: FusionArgs = parse_args(args)?;
        let segments = Segments::new(&args, &ctx)?;
        let params = init_params(segments.input_dim() + 1, args.seed, args.init_scale);
        Ok(Self { segments, params })
    }
}

impl Model for LinearFusion {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn expert_streams(&self) -> &ExpertStreamSet {
        &self.segments.experts
    }

    fn parameters(&self) -> &[f32] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [f32] {
        &mut self.params
    }

    fn forward(&self, batch: &EncodedBatch) -> ComponentResult<Vec<f32>> {
        let bias = self.params[self.params.len() - 1];
        Ok(self
            .segments
            .features(batch)?
            .iter()
            .map(|segments| {
                let mut offset = 0;
                let mut out = bias;
                for values in segments {
                    out += dot(&self.params[offset..offset + values.len()], values);
                    offset += values.len();
                }
                out
            })
            .collect())
    }

    fn backward(&self, batch: &EncodedBatch, grad_outputs: &[f32]) -> ComponentResult<Vec<f32>> {
        check_grad_len(grad_outputs, batch)?;
        let mut grads = vec![0.0; self.params.len()];
        let bias_idx = grads.len() - 1;
        for (segments, g) in self.segments.features(batch)?.iter().zip(grad_outputs) {
            let mut offset = 0;
            for values in segments {
                for (k, x) in values.iter().enumerate() {
                    grads[offset + k] += g * x;
                }
                offset += values.len();
            }
            grads[bias_idx] += g;
        }
        Ok(grads)
    }

    fn summary(&self) -> String {
        format!("{}({} -> 1, params={})", Self::KIND, self.segments.describe(), self.params.len())
    }
}

/// One linear head per segment, mixed by learned softmax gates.
///
/// `out = sum_m softmax(a)_m * (w_m . x_m + b_m)`
#[derive(Debug, Clone)]
pub struct GatedExpertFusion {
    segments: Segments,
    /// `[w_0, b_0, w_1, b_1, ..., a_0 .. a_{M-1}]`
    params: Vec<f32>,
}

impl GatedExpertFusion {
    pub const KIND: &'static str = "GatedExpertFusion";

    pub fn from_args(ctx: ModelContext, args: &ComponentArgs) -> ComponentResult<Self> {
        let args: FusionArgs = parse_args(args)?;
        let segments = Segments::new(&args, &ctx)?;
        let heads: usize = segments.dims().iter().map(|d| d + 1).sum();
        let mut params = init_params(heads, args.seed, args.init_scale);
        // Gates start uniform.
        params.extend(std::iter::repeat_n(0.0, segments.dims().len()));
        Ok(Self { segments, params })
    }

    fn gate_offset(&self) -> usize {
        self.params.len() - self.segments.dims().len()
    }

    fn gates(&self) -> Vec<f32> {
        let logits = &self.params[self.gate_offset()..];
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = logits.iter().map(|a| (a - max).exp()).collect();
        let total: f32 = exps.iter().sum();
        exps.iter().map(|e| e / total).collect()
    }

    /// Head outputs for one sample.
    fn heads(&self, segments: &[Vec<f32>]) -> Vec<f32> {
        let mut offset = 0;
        segments
            .iter()
            .map(|values| {
                let dim = values.len();
                let h = dot(&self.params[offset..offset + dim], values) + self.params[offset + dim];
                offset += dim + 1;
                h
            })
            .collect()
    }
}

impl Model for GatedExpertFusion {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn expert_streams(&self) -> &ExpertStreamSet {
        &self.segments.experts
    }

    fn parameters(&self) -> &[f32] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [f32] {
        &mut self.params
    }

    fn forward(&self, batch: &EncodedBatch) -> ComponentResult<Vec<f32>> {
        let gates = self.gates();
        Ok(self
            .segments
            .features(batch)?
            .iter()
            .map(|segments| self.heads(segments).iter().zip(&gates).map(|(h, p)| h * p).sum())
            .collect())
    }

    fn backward(&self, batch: &EncodedBatch, grad_outputs: &[f32]) -> ComponentResult<Vec<f32>> {
        check_grad_len(grad_outputs, batch)?;
        let gates = self.gates();
        let gate_offset = self.gate_offset();
        let mut grads = vec![0.0; self.params.len()];

        for (segments, g) in self.segments.features(batch)?.iter().zip(grad_outputs) {
            let heads = self.heads(segments);
            let out: f32 = heads.iter().zip(&gates).map(|(h, p)| h * p).sum();
            let mut offset = 0;
            for (m, values) in segments.iter().enumerate() {
                let scale = g * gates[m];
                for (k, x) in values.iter().enumerate() {
                    grads[offset + k] += scale * x;
                }
                grads[offset + values.len()] += scale;
                offset += values.len() + 1;
                grads[gate_offset + m] += g * gates[m] * (heads[m] - out);
            }
        }
        Ok(grads)
    }

    fn summary(&self) -> String {
        format!(
            "{}({}, heads={}, params={})",
            Self::KIND,
            self.segments.describe(),
            self.segments.dims().len(),
            self.params.len()
        )
    }
}
