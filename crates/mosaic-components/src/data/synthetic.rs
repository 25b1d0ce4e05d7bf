use super::SampleLoader;
use mosaic_abstraction::{parse_args, ComponentArgs, ComponentResult, ExpertStreamSet, Sample, Split};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::collections::BTreeMap;

const WORDS: [&str; 16] = [
    "red", "blue", "green", "quiet", "loud", "fast", "slow", "bright", "dark", "warm", "cold", "small", "large",
    "smooth", "rough", "sharp",
];

const WORDS_PER_SAMPLE: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Task {
    #[default]
    Binary,
    Regression,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SyntheticArgs {
    batch_size: usize,
    #[serde(default)]
    split: Split,
    #[serde(default = "default_num_samples")]
    num_samples: usize,
    /// Defaults to a quarter of `num_samples`.
    #[serde(default)]
    val_samples: Option<usize>,
    /// Stream name -> feature dim.
    #[serde(default)]
    experts: BTreeMap<String, usize>,
    #[serde(default)]
    seed: u64,
    #[serde(default)]
    shuffle: Option<bool>,
    #[serde(default)]
    task: Task,
    #[serde(default = "default_noise")]
    noise: f32,
}

fn default_num_samples() -> usize {
    256
}

fn default_noise() -> f32 {
    0.05
}

/// Generates a deterministic labelled dataset from a seed.
///
/// The label is a fixed linear function of the word choice and the expert
/// features, so the reference models can actually fit it.
pub struct SyntheticDataLoader;

impl SyntheticDataLoader {
    pub const KIND: &'static str = "SyntheticDataLoader";

    pub fn from_args(args: &ComponentArgs) -> ComponentResult<SampleLoader> {
        let args: SyntheticArgs = parse_args(args)?;
        let count = match args.split {
            Split::Train => args.num_samples,
            Split::Val => args.val_samples.unwrap_or((args.num_samples / 4).max(1)),
        };

        let experts: ExpertStreamSet = args.experts.iter().map(|(name, dim)| (name.clone(), *dim)).collect();
        let samples = generate(&args, &experts, count);
        let shuffle = args.shuffle.unwrap_or(args.split == Split::Train);
        SampleLoader::new(Self::KIND, args.split, args.batch_size, shuffle, args.seed, samples, experts)
    }
}

fn generate(args: &SyntheticArgs, experts: &ExpertStreamSet, count: usize) -> Vec<Sample> {
    // Ground-truth weights are shared by both splits.
    let mut truth = StdRng::seed_from_u64(args.seed ^ 0x7275_7468);
    let word_weights: Vec<f32> = WORDS.iter().map(|_| truth.gen_range(-1.0..1.0)).collect();
    let stream_weights: BTreeMap<&str, Vec<f32>> = experts
        .iter()
        .map(|(name, dim)| (name, (0..dim).map(|_| truth.gen_range(-1.0..1.0)).collect()))
        .collect();

    let salt = match args.split {
        Split::Train => 0x0001,
        Split::Val => 0x0002,
    };
    let mut rng = StdRng::seed_from_u64(args.seed.wrapping_mul(31).wrapping_add(salt));

    (0..count)
        .map(|_| {
            let picks: Vec<usize> = (0..WORDS_PER_SAMPLE).map(|_| rng.gen_range(0..WORDS.len())).collect();
            let text = picks.iter().map(|&i| WORDS[i]).collect::<Vec<_>>().join(" ");
            let mut score: f32 = picks.iter().map(|&i| word_weights[i]).sum::<f32>() / WORDS_PER_SAMPLE as f32;

            let mut features = BTreeMap::new();
            for (name, weights) in &stream_weights {
                let values: Vec<f32> = weights.iter().map(|_| rng.gen_range(-1.0..1.0)).collect();
                let dot: f32 = values.iter().zip(weights).map(|(x, w)| x * w).sum();
                score += dot / weights.len().max(1) as f32;
                features.insert((*name).to_string(), values);
            }
            if args.noise > 0.0 {
                score += rng.gen_range(-args.noise..args.noise);
            }

            let label = match args.task {
                Task::Binary => {
                    if score > 0.0 {
                        1.0
                    } else {
                        0.0
                    }
                }
                Task::Regression => score,
            };
            Sample { text, experts: features, label }
        })
        .collect()
}
