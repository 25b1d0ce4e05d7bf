//! In-memory data providers.
//!
//! Both loaders materialise their split into a `SampleLoader`, which owns the
//! samples, the expert stream report and the seeded batch ordering.

pub mod jsonl;
pub mod synthetic;

pub use jsonl::JsonlDataLoader;
pub use synthetic::SyntheticDataLoader;

use mosaic_abstraction::{Batch, BatchIter, ComponentError, ComponentResult, DataLoader, ExpertStreamSet, Sample, Split};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// A split held in memory with deterministic, seed-driven ordering.
#[derive(Debug, Clone)]
pub struct SampleLoader {
    kind: &'static str,
    split: Split,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    samples: Vec<Sample>,
    experts: ExpertStreamSet,
}

impl SampleLoader {
    pub fn new(
        kind: &'static str,
        split: Split,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
        samples: Vec<Sample>,
        experts: ExpertStreamSet,
    ) -> ComponentResult<Self> {
        if batch_size == 0 {
            return Err(ComponentError::InvalidArguments("batch_size must be >= 1".to_string()));
        }
        if samples.is_empty() {
            return Err(ComponentError::Dataset(format!("{split} split must not be empty")));
        }
        Ok(Self { kind, split, batch_size, shuffle, seed, samples, experts })
    }

    /// Sample indices for `epoch`.
    fn order(&self, epoch: u64) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch));
            order.shuffle(&mut rng);
        }
        order
    }
}

impl DataLoader for SampleLoader {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn split(&self) -> Split {
        self.split
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn num_samples(&self) -> usize {
        self.samples.len()
    }

    fn experts_used(&self) -> &ExpertStreamSet {
        &self.experts
    }

    fn batches(&self, epoch: u64) -> BatchIter<'_> {
        let order = self.order(epoch);
        let total = order.len();
        Box::new((0..total).step_by(self.batch_size).map(move |start| {
            let end = (start + self.batch_size).min(total);
            Ok(Batch::from_samples(order[start..end].iter().map(|&i| &self.samples[i]), &self.experts))
        }))
    }
}

/// Streams present in every sample, with consistent dimensions.
pub(crate) fn common_streams(samples: &[Sample]) -> ComponentResult<ExpertStreamSet> {
    let Some(first) = samples.first() else {
        return Ok(ExpertStreamSet::new());
    };
    let mut streams: ExpertStreamSet = first.experts.iter().map(|(name, values)| (name.clone(), values.len())).collect();

    for (idx, sample) in samples.iter().enumerate() {
        let mut kept = ExpertStreamSet::new();
        for (name, dim) in streams.iter() {
            match sample.experts.get(name) {
                Some(values) if values.len() == dim => kept.insert(name, dim),
                Some(values) => {
                    return Err(ComponentError::Dataset(format!(
                        "sample[{idx}] stream '{name}' has dim {}, expected {dim}",
                        values.len()
                    )));
                }
                None => {}
            }
        }
        streams = kept;
    }
    Ok(streams)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample(text: &str, streams: &[(&str, usize)]) -> Sample {
        let experts: BTreeMap<String, Vec<f32>> =
            streams.iter().map(|(name, dim)| ((*name).to_string(), vec![0.5; *dim])).collect();
        Sample { text: text.to_string(), experts, label: 1.0 }
    }

    #[test]
    fn test_common_streams_is_intersection() {
        let samples = vec![sample("a", &[("audio", 2), ("face", 3)]), sample("b", &[("audio", 2)])];
        let streams = common_streams(&samples).unwrap();
        assert_eq!(streams, ExpertStreamSet::new().with_stream("audio", 2));
    }

    #[test]
    fn test_common_streams_rejects_inconsistent_dims() {
        let samples = vec![sample("a", &[("audio", 2)]), sample("b", &[("audio", 3)])];
        assert!(matches!(common_streams(&samples), Err(ComponentError::Dataset(_))));
    }

    #[test]
    fn test_batches_cover_split_and_shuffle_is_seeded() {
        let samples: Vec<Sample> = (0..7).map(|i| sample(&i.to_string(), &[])).collect();
        let loader = SampleLoader::new("test", Split::Train, 3, true, 11, samples, ExpertStreamSet::new()).unwrap();

        let epoch0: Vec<Batch> = loader.batches(0).map(Result::unwrap).collect();
        assert_eq!(epoch0.iter().map(Batch::len).collect::<Vec<_>>(), vec![3, 3, 1]);

        let again: Vec<Batch> = loader.batches(0).map(Result::unwrap).collect();
        assert_eq!(epoch0, again);

        let mut seen: Vec<String> = epoch0.iter().flat_map(|b| b.texts.clone()).collect();
        seen.sort();
        assert_eq!(seen.len(), 7);
    }

    #[test]
    fn test_empty_split_is_rejected() {
        let err = SampleLoader::new("test", Split::Val, 2, false, 0, Vec::new(), ExpertStreamSet::new()).unwrap_err();
        assert!(matches!(err, ComponentError::Dataset(_)));
    }
}
