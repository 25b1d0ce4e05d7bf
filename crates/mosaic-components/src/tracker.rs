//! Experiment tracker backends.
//!
//! `LocalTracker` appends JSON lines under the run's log directory.
//! `RemoteTracker` posts the same events to an HTTP tracking service.

use async_trait::async_trait;
use mosaic_abstraction::{ComponentError, ComponentResult, ExperimentTracker};
use reqwest::Client;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

pub const TOKEN_ENV: &str = "MOSAIC_TRACKER_TOKEN";
pub const PROJECT_ENV: &str = "MOSAIC_TRACKER_PROJECT";
pub const URL_ENV: &str = "MOSAIC_TRACKER_URL";
pub const DEFAULT_TRACKER_URL: &str = "http://127.0.0.1:8765";

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum TrackerEvent<'a> {
    Config { config: &'a serde_json::Value },
    Scalar { name: &'a str, value: f64, step: u64 },
}

/// Appends events to `<log_dir>/metrics.jsonl`, creating it on first write.
#[derive(Debug)]
pub struct LocalTracker {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl LocalTracker {
    pub const KIND: &'static str = "local";

    #[must_use]
    pub fn new(log_dir: &Path) -> Self {
        Self { path: log_dir.join("metrics.jsonl"), file: Mutex::new(None) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, event: &TrackerEvent<'_>) -> ComponentResult<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&self.path).await?;
            *guard = Some(file);
        }
        if let Some(file) = guard.as_mut() {
            file.write_all(&line).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ExperimentTracker for LocalTracker {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    async fn log_config(&self, config: &serde_json::Value) -> ComponentResult<()> {
        self.append(&TrackerEvent::Config { config }).await
    }

    async fn log_scalar(&self, name: &str, value: f64, step: u64) -> ComponentResult<()> {
        self.append(&TrackerEvent::Scalar { name, value, step }).await
    }

    async fn flush(&self) -> ComponentResult<()> {
        if let Some(file) = self.file.lock().await.as_mut() {
            file.flush().await?;
        }
        Ok(())
    }
}

/// Credentials for the remote tracking service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerCredentials {
    pub token: String,
    pub project: String,
    pub base_url: String,
}

impl TrackerCredentials {
    /// Reads credentials through `lookup`, treating empty values as unset.
    ///
    /// # Errors
    /// `ComponentError::MissingCredentials` naming the unset variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ComponentResult<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let token = get(TOKEN_ENV);
        let project = get(PROJECT_ENV);

        match (token, project) {
            (Some(token), Some(project)) => Ok(Self {
                token,
                project,
                base_url: get(URL_ENV).unwrap_or_else(|| DEFAULT_TRACKER_URL.to_string()),
            }),
            (token, project) => {
                let missing: Vec<&str> = [(TOKEN_ENV, token.is_none()), (PROJECT_ENV, project.is_none())]
                    .into_iter()
                    .filter_map(|(key, absent)| absent.then_some(key))
                    .collect();
                Err(ComponentError::MissingCredentials(format!(
                    "remote tracking requires {} to be set",
                    missing.join(" and ")
                )))
            }
        }
    }
}

/// Posts events to `<base_url>/api/projects/<project>/runs/<run>/…`.
#[derive(Debug, Clone)]
pub struct RemoteTracker {
    client: Client,
    credentials: TrackerCredentials,
    run: String,
}

impl RemoteTracker {
    pub const KIND: &'static str = "remote";

    #[must_use]
    pub fn new(credentials: TrackerCredentials, run: impl Into<String>) -> Self {
        Self { client: Client::new(), credentials, run: run.into() }
    }

    fn url(&self, endpoint: &str) -> String {
        format!(
            "{}/api/projects/{}/runs/{}/{endpoint}",
            self.credentials.base_url.trim_end_matches('/'),
            self.credentials.project,
            self.run
        )
    }

    async fn post(&self, endpoint: &str, body: &TrackerEvent<'_>) -> ComponentResult<()> {
        let url = self.url(endpoint);
        debug!(url = %url, "Posting tracker event");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.credentials.token)
            .json(body)
            .send()
            .await
            .map_err(|e| ComponentError::Sink(format!("tracker request to {url} failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ComponentError::MissingCredentials(format!("tracker rejected token ({status}): {text}")));
        }
        Err(ComponentError::Sink(format!("tracker returned {status}: {text}")))
    }
}

#[async_trait]
impl ExperimentTracker for RemoteTracker {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    async fn log_config(&self, config: &serde_json::Value) -> ComponentResult<()> {
        self.post("config", &TrackerEvent::Config { config }).await
    }

    async fn log_scalar(&self, name: &str, value: f64, step: u64) -> ComponentResult<()> {
        self.post("scalars", &TrackerEvent::Scalar { name, value, step }).await
    }
}
