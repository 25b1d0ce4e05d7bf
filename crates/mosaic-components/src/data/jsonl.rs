use super::{common_streams, SampleLoader};
use mosaic_abstraction::{parse_args, ComponentArgs, ComponentError, ComponentResult, Sample, Split};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JsonlArgs {
    data_dir: PathBuf,
    batch_size: usize,
    #[serde(default)]
    split: Split,
    /// Defaults to shuffling the training split only.
    #[serde(default)]
    shuffle: Option<bool>,
    #[serde(default)]
    seed: u64,
    /// Restrict the provided streams to this list.
    #[serde(default)]
    experts: Option<Vec<String>>,
    #[serde(default)]
    max_samples: Option<usize>,
}

/// Reads `<data_dir>/<split>.jsonl`, one `Sample` per line.
pub struct JsonlDataLoader;

impl JsonlDataLoader {
    pub const KIND: &'static str = "JsonlDataLoader";

    pub fn from_args(args: &ComponentArgs) -> ComponentResult<SampleLoader> {
        let args: JsonlArgs = parse_args(args)?;
        let path = args.data_dir.join(format!("{}.jsonl", args.split));
        let samples = read_samples(&path, args.max_samples)?;

        let mut experts = common_streams(&samples)?;
        if let Some(requested) = &args.experts {
            for name in requested {
                if !experts.contains(name) {
                    warn!(stream = %name, split = %args.split, "Requested expert stream is not present in every sample");
                }
            }
            experts = experts.restricted_to(requested);
        }
        debug!(path = %path.display(), samples = samples.len(), experts = %experts, "Loaded JSONL split");

        let shuffle = args.shuffle.unwrap_or(args.split == Split::Train);
        SampleLoader::new(Self::KIND, args.split, args.batch_size, shuffle, args.seed, samples, experts)
    }
}

fn read_samples(path: &Path, max_samples: Option<usize>) -> ComponentResult<Vec<Sample>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ComponentError::Dataset(format!("failed to read {}: {e}", path.display())))?;
    let mut samples = Vec::new();

    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let sample: Sample = serde_json::from_str(line).map_err(|e| {
            ComponentError::Dataset(format!("failed to parse {} line {}: {}", path.display(), idx + 1, e))
        })?;
        samples.push(sample);
        if max_samples.is_some_and(|max| samples.len() >= max) {
            break;
        }
    }

    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mosaic_abstraction::{DataLoader, ExpertStreamSet};
    use tempfile::TempDir;

    fn write_split(dir: &Path, split: &str, lines: &[&str]) {
        std::fs::write(dir.join(format!("{split}.jsonl")), lines.join("\n")).unwrap();
    }

    fn args(dir: &Path, extra: serde_json::Value) -> ComponentArgs {
        let mut value = serde_json::json!({"data_dir": dir, "batch_size": 2});
        if let (Some(obj), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
            obj.extend(extra.clone());
        }
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_loads_split_and_reports_common_streams() {
        let temp = TempDir::new().unwrap();
        write_split(
            temp.path(),
            "val",
            &[
                r#"{"text": "a cat", "experts": {"audio": [1, 2], "face": [1]}, "label": 1}"#,
                "",
                r#"{"text": "a dog", "experts": {"audio": [3, 4]}, "label": 0}"#,
            ],
        );

        let loader = JsonlDataLoader::from_args(&args(temp.path(), serde_json::json!({"split": "val"}))).unwrap();
        assert_eq!(loader.kind(), JsonlDataLoader::KIND);
        assert_eq!(loader.split(), Split::Val);
        assert_eq!(loader.num_samples(), 2);
        assert_eq!(loader.experts_used(), &ExpertStreamSet::new().with_stream("audio", 2));
    }

    #[test]
    fn test_requested_streams_restrict_report() {
        let temp = TempDir::new().unwrap();
        write_split(temp.path(), "train", &[r#"{"text": "x", "experts": {"audio": [1], "face": [1]}, "label": 1}"#]);

        let loader =
            JsonlDataLoader::from_args(&args(temp.path(), serde_json::json!({"experts": ["face", "motion"]}))).unwrap();
        assert_eq!(loader.experts_used(), &ExpertStreamSet::new().with_stream("face", 1));
    }

    #[test]
    fn test_parse_error_names_line() {
        let temp = TempDir::new().unwrap();
        write_split(temp.path(), "train", &[r#"{"text": "x", "label": 1}"#, "{oops"]);

        let err = JsonlDataLoader::from_args(&args(temp.path(), serde_json::json!({}))).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
