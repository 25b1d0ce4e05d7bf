use chrono::Local;
use std::path::{Path, PathBuf};

/// Run-scoped directories for a training run.
///
/// Layout is `<save_dir>/{models,log,web}/<name>/<run_id>`. Nothing is created
/// here; each directory appears when its first file is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    save_dir: PathBuf,
    name: String,
    run_id: String,
}

impl RunLayout {
    #[must_use]
    pub fn new(save_dir: impl Into<PathBuf>, name: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self { save_dir: save_dir.into(), name: name.into(), run_id: run_id.into() }
    }

    /// Run id derived from the local time, e.g. `0314_095502`.
    #[must_use]
    pub fn timestamp_run_id() -> String {
        Local::now().format("%m%d_%H%M%S").to_string()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    #[must_use]
    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    fn scoped(&self, area: &str) -> PathBuf {
        self.save_dir.join(area).join(&self.name).join(&self.run_id)
    }

    /// Checkpoints and the persisted `config.json`.
    #[must_use]
    pub fn checkpoints_dir(&self) -> PathBuf {
        self.scoped("models")
    }

    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.scoped("log")
    }

    #[must_use]
    pub fn web_dir(&self) -> PathBuf {
        self.scoped("web")
    }

    #[must_use]
    pub fn log_file(&self) -> PathBuf {
        self.log_dir().join("train.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let temp = TempDir::new().unwrap();
        let layout = RunLayout::new(temp.path(), "demo", "0101_120000");

        assert_eq!(layout.checkpoints_dir(), temp.path().join("models/demo/0101_120000"));
        assert_eq!(layout.log_file(), temp.path().join("log/demo/0101_120000/train.log"));
        assert_eq!(layout.web_dir(), temp.path().join("web/demo/0101_120000"));
        assert!(!layout.checkpoints_dir().exists());
        assert!(!layout.log_dir().exists());
    }

    #[test]
    fn test_timestamp_run_id_shape() {
        let id = RunLayout::timestamp_run_id();
        assert_eq!(id.len(), 11);
        assert_eq!(id.as_bytes()[4], b'_');
    }
}
