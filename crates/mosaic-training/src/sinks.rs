//! Optional observability sinks.
//!
//! Both sinks are optional handles. A missing sink is a no-op and a failing
//! sink is logged. The one exception is a tracker rejecting its credentials
//! at run start, which stops the run before the first step.

use crate::config::TrainerSettings;
use crate::error::{TrainingError, TrainingResult};
use crate::layout::RunLayout;
use mosaic_abstraction::{ComponentError, ExperimentTracker, VisualArtifacts, Visualizer};
use mosaic_components::{LocalTracker, RemoteTracker, TrackerCredentials};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

/// Chooses the tracker backend for a run.
///
/// Remote tracking needs credentials from `lookup` and fails here, before any
/// training, when they are missing.
pub fn select_tracker(
    settings: &TrainerSettings,
    layout: &RunLayout,
    lookup: impl Fn(&str) -> Option<String>,
) -> TrainingResult<Option<Box<dyn ExperimentTracker>>> {
    if settings.remote_tracking {
        let credentials =
            TrackerCredentials::from_lookup(lookup).map_err(|e| TrainingError::component("tracker", e))?;
        let run = format!("{}-{}", layout.name(), layout.run_id());
        info!(url = %credentials.base_url, project = %credentials.project, run = %run, "Using remote experiment tracker");
        return Ok(Some(Box::new(RemoteTracker::new(credentials, run))));
    }
    if settings.tracking {
        debug!(dir = %layout.log_dir().display(), "Using local experiment tracker");
        return Ok(Some(Box::new(LocalTracker::new(&layout.log_dir()))));
    }
    Ok(None)
}

#[derive(Default)]
pub struct Sinks {
    visualizer: Option<Box<dyn Visualizer>>,
    tracker: Option<Box<dyn ExperimentTracker>>,
}

impl fmt::Debug for Sinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sinks")
            .field("visualizer", &self.visualizer.as_ref().map(|v| v.kind()))
            .field("tracker", &self.tracker.as_ref().map(|t| t.kind()))
            .finish()
    }
}

impl Sinks {
    #[must_use]
    pub fn new(visualizer: Option<Box<dyn Visualizer>>, tracker: Option<Box<dyn ExperimentTracker>>) -> Self {
        Self { visualizer, tracker }
    }

    pub fn has_visualizer(&self) -> bool {
        self.visualizer.is_some()
    }

    pub fn tracker_kind(&self) -> Option<&'static str> {
        self.tracker.as_ref().map(|t| t.kind())
    }

    /// Sends the resolved config at run start.
    ///
    /// A tracker that rejects its credentials fails the run here; any other
    /// tracker error is logged.
    pub async fn log_config(&self, config: &serde_json::Value) -> TrainingResult<()> {
        if let Some(tracker) = &self.tracker {
            match tracker.log_config(config).await {
                Ok(()) => {}
                Err(ComponentError::MissingCredentials(reason)) => {
                    return Err(TrainingError::MissingCredentials(reason));
                }
                Err(e) => warn!(tracker = tracker.kind(), error = %e, "Failed to send config to tracker"),
            }
        }
        Ok(())
    }

    pub async fn log_scalar(&self, name: &str, value: f64, step: u64) {
        if let Some(tracker) = &self.tracker {
            if let Err(e) = tracker.log_scalar(name, value, step).await {
                warn!(tracker = tracker.kind(), name, step, error = %e, "Failed to log scalar");
            }
        }
    }

    /// Logs every entry as `<prefix>/<key>`.
    pub async fn log_scalars(&self, prefix: &str, values: &BTreeMap<String, f64>, step: u64) {
        for (key, value) in values {
            self.log_scalar(&format!("{prefix}/{key}"), *value, step).await;
        }
    }

    pub fn render(&mut self, step: u64, artifacts: &VisualArtifacts) {
        if let Some(visualizer) = self.visualizer.as_mut() {
            if let Err(e) = visualizer.render(step, artifacts) {
                warn!(visualizer = visualizer.kind(), step, error = %e, "Failed to render artifacts");
            }
        }
    }

    pub async fn flush(&self) {
        if let Some(tracker) = &self.tracker {
            if let Err(e) = tracker.flush().await {
                warn!(tracker = tracker.kind(), error = %e, "Failed to flush tracker");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn settings(value: serde_json::Value) -> TrainerSettings {
        TrainerSettings::from_config(&value).unwrap()
    }

    #[test]
    fn test_tracker_selection() {
        let temp = TempDir::new().unwrap();
        let layout = RunLayout::new(temp.path(), "demo", "r1");

        let local = select_tracker(&settings(json!({"epochs": 1})), &layout, |_| None).unwrap();
        assert_eq!(local.unwrap().kind(), "local");

        let none = select_tracker(&settings(json!({"epochs": 1, "tracking": false})), &layout, |_| None).unwrap();
        assert!(none.is_none());

        let err = select_tracker(&settings(json!({"epochs": 1, "remote_tracking": true})), &layout, |_| None)
            .err().unwrap();
        assert!(matches!(err, TrainingError::MissingCredentials(_)));

        let remote = select_tracker(&settings(json!({"epochs": 1, "remote_tracking": true})), &layout, |k| {
            Some(format!("{k}-value"))
        })
        .unwrap();
        assert_eq!(remote.unwrap().kind(), "remote");
    }

    #[tokio::test]
    async fn test_empty_sinks_are_noops() {
        let mut sinks = Sinks::default();
        sinks.log_config(&json!({"name": "demo"})).await.unwrap();
        sinks.log_scalar("train/loss", 1.0, 1).await;
        sinks.render(1, &VisualArtifacts::default());
        sinks.flush().await;
        assert!(!sinks.has_visualizer());
        assert_eq!(sinks.tracker_kind(), None);
    }
}
