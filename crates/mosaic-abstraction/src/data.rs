//! Data provisioning contract.

use crate::experts::ExpertStreamSet;
use crate::model::Tokenizer;
use crate::{ComponentError, ComponentResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Dataset split served by a data loader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    #[default]
    Train,
    Val,
}

impl Split {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Val => "val",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Split {
    type Err = ComponentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "train" => Ok(Self::Train),
            "val" | "valid" | "validation" => Ok(Self::Val),
            other => Err(ComponentError::InvalidArguments(format!("unknown split: {other}"))),
        }
    }
}

/// One (text, expert features, label) sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub text: String,
    #[serde(default)]
    pub experts: BTreeMap<String, Vec<f32>>,
    pub label: f32,
}

/// A batch of raw samples in column layout.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub texts: Vec<String>,
    /// Stream name -> one feature row per sample.
    pub experts: BTreeMap<String, Vec<Vec<f32>>>,
    pub labels: Vec<f32>,
}

impl Batch {
    /// Collects samples into a batch, keeping only the streams in `streams`.
    pub fn from_samples<'a>(samples: impl IntoIterator<Item = &'a Sample>, streams: &ExpertStreamSet) -> Self {
        let mut batch = Self::default();
        for name in streams.names() {
            batch.experts.insert(name.to_string(), Vec::new());
        }
        for sample in samples {
            batch.texts.push(sample.text.clone());
            batch.labels.push(sample.label);
            for (name, rows) in &mut batch.experts {
                rows.push(sample.experts.get(name).cloned().unwrap_or_default());
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// A batch whose text has been tokenized, ready for the model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodedBatch {
    pub tokens: Vec<Vec<u32>>,
    pub experts: BTreeMap<String, Vec<Vec<f32>>>,
    pub labels: Vec<f32>,
    pub texts: Vec<String>,
}

impl EncodedBatch {
    pub fn encode(batch: Batch, tokenizer: &dyn Tokenizer) -> Self {
        let tokens = batch.texts.iter().map(|text| tokenizer.encode(text)).collect();
        Self { tokens, experts: batch.experts, labels: batch.labels, texts: batch.texts }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Blocking iterator of batches, as consumed by the training loop.
pub type BatchIter<'a> = Box<dyn Iterator<Item = ComponentResult<Batch>> + 'a>;

/// A data provider for one split.
pub trait DataLoader: Send {
    /// Registered type name of this loader.
    fn kind(&self) -> &'static str;

    fn split(&self) -> Split;

    fn batch_size(&self) -> usize;

    /// Number of samples the sampler yields per epoch.
    fn num_samples(&self) -> usize;

    /// Streams this dataset instance actually provides.
    fn experts_used(&self) -> &ExpertStreamSet;

    /// Batches for `epoch`. The order must be a deterministic function of the
    /// loader's seed and `epoch` so a resumed run replays the same sequence.
    fn batches(&self, epoch: u64) -> BatchIter<'_>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_from_samples_drops_unlisted_streams() {
        let mut experts = BTreeMap::new();
        experts.insert("audio".to_string(), vec![1.0, 2.0]);
        experts.insert("face".to_string(), vec![3.0]);
        let samples = vec![
            Sample { text: "a".to_string(), experts: experts.clone(), label: 1.0 },
            Sample { text: "b".to_string(), experts, label: 0.0 },
        ];
        let streams = ExpertStreamSet::new().with_stream("audio", 2);
        let batch = Batch::from_samples(&samples, &streams);

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.experts.len(), 1);
        assert_eq!(batch.experts["audio"], vec![vec![1.0, 2.0], vec![1.0, 2.0]]);
        assert_eq!(batch.labels, vec![1.0, 0.0]);
    }

    #[test]
    fn test_split_parsing() {
        assert_eq!("validation".parse::<Split>().unwrap(), Split::Val);
        assert_eq!("train".parse::<Split>().unwrap(), Split::Train);
        assert!("test".parse::<Split>().is_err());
        assert_eq!(serde_json::to_value(Split::Val).unwrap(), serde_json::json!("val"));
    }
}
