//! Expert stream bookkeeping.

use crate::{ComponentError, ComponentResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The named auxiliary feature streams a dataset instance provides, with the
/// feature dimension of each stream.
///
/// Serialized as a plain JSON object (`{"audio": 16, "face": 8}`) so it can be
/// injected into a model's constructor arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExpertStreamSet(BTreeMap<String, usize>);

impl ExpertStreamSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion of a stream.
    #[must_use]
    pub fn with_stream(mut self, name: impl Into<String>, dim: usize) -> Self {
        self.0.insert(name.into(), dim);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, dim: usize) {
        self.0.insert(name.into(), dim);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn dim(&self, name: &str) -> Option<usize> {
        self.0.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sum of all stream dimensions.
    pub fn total_dim(&self) -> usize {
        self.0.values().sum()
    }

    /// Streams in stable (name) order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.0.iter().map(|(name, dim)| (name.as_str(), *dim))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Keeps only the streams named in `requested`.
    #[must_use]
    pub fn restricted_to(&self, requested: &[String]) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(name, _)| requested.iter().any(|r| r == *name))
                .map(|(name, dim)| (name.clone(), *dim))
                .collect(),
        )
    }

    /// Describes how `other` differs from `self`, or `None` when they match.
    pub fn mismatch(&self, other: &Self) -> Option<String> {
        if self == other {
            return None;
        }
        let mut parts = Vec::new();
        for (name, dim) in &self.0 {
            match other.0.get(name) {
                None => parts.push(format!("'{name}' missing")),
                Some(d) if d != dim => parts.push(format!("'{name}' dim {dim} vs {d}")),
                Some(_) => {}
            }
        }
        for name in other.0.keys() {
            if !self.0.contains_key(name) {
                parts.push(format!("'{name}' unexpected"));
            }
        }
        Some(parts.join(", "))
    }

    /// Checks that batch features carry exactly these streams with these dims.
    ///
    /// # Errors
    /// Returns `ComponentError::ShapeMismatch` naming the offending stream.
    pub fn check_features(&self, features: &BTreeMap<String, Vec<Vec<f32>>>, rows: usize) -> ComponentResult<()> {
        for name in features.keys() {
            if !self.contains(name) {
                return Err(ComponentError::ShapeMismatch(format!(
                    "stream '{name}' is not part of the expected set [{self}]"
                )));
            }
        }
        for (name, dim) in self.iter() {
            let Some(values) = features.get(name) else {
                return Err(ComponentError::ShapeMismatch(format!("stream '{name}' is missing from the batch")));
            };
            if values.len() != rows {
                return Err(ComponentError::ShapeMismatch(format!(
                    "stream '{name}' has {} rows, batch has {rows}",
                    values.len()
                )));
            }
            if let Some(row) = values.iter().find(|row| row.len() != dim) {
                return Err(ComponentError::ShapeMismatch(format!(
                    "stream '{name}' expects dim {dim}, got {}",
                    row.len()
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for ExpertStreamSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<none>");
        }
        let rendered: Vec<String> = self.0.iter().map(|(name, dim)| format!("{name}:{dim}")).collect();
        f.write_str(&rendered.join(", "))
    }
}

impl FromIterator<(String, usize)> for ExpertStreamSet {
    fn from_iter<I: IntoIterator<Item = (String, usize)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_as_plain_object() {
        let set = ExpertStreamSet::new().with_stream("audio", 4).with_stream("face", 2);
        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(json, serde_json::json!({"audio": 4, "face": 2}));
        let back: ExpertStreamSet = serde_json::from_value(json).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn test_mismatch_reports_missing_and_unexpected() {
        let a = ExpertStreamSet::new().with_stream("audio", 4).with_stream("face", 2);
        let b = ExpertStreamSet::new().with_stream("audio", 3).with_stream("motion", 2);
        let msg = a.mismatch(&b).unwrap();
        assert!(msg.contains("'audio' dim 4 vs 3"));
        assert!(msg.contains("'face' missing"));
        assert!(msg.contains("'motion' unexpected"));
        assert!(a.mismatch(&a.clone()).is_none());
    }

    #[test]
    fn test_check_features_rejects_extra_stream() {
        let set = ExpertStreamSet::new().with_stream("audio", 2);
        let mut features = BTreeMap::new();
        features.insert("audio".to_string(), vec![vec![0.0, 1.0]]);
        assert!(set.check_features(&features, 1).is_ok());

        features.insert("face".to_string(), vec![vec![0.0]]);
        let err = set.check_features(&features, 1).unwrap_err();
        assert!(matches!(err, ComponentError::ShapeMismatch(_)));
    }

    #[test]
    fn test_check_features_rejects_wrong_dim() {
        let set = ExpertStreamSet::new().with_stream("audio", 2);
        let mut features = BTreeMap::new();
        features.insert("audio".to_string(), vec![vec![0.0, 1.0, 2.0]]);
        assert!(set.check_features(&features, 1).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(ExpertStreamSet::new().to_string(), "<none>");
        let set = ExpertStreamSet::new().with_stream("b", 1).with_stream("a", 2);
        assert_eq!(set.to_string(), "a:2, b:1");
    }
}
