use crate::error::{ControllerError, Result};
use crate::logs::LogRegistry;
use crate::model::LogSourceId;
use bytes::{Buf, BytesMut};
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Thin client for the local model runtime's HTTP API.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: Client,
    base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified_at: Option<String>,
    #[serde(default)]
    pub digest: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

/// One NDJSON progress record from a pull.
#[derive(Debug, Deserialize)]
struct PullProgress {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    completed: Option<u64>,
}

impl PullProgress {
    /// Progress line, bucketed to 10% steps so the log is not flooded.
    fn render(&self) -> Option<String> {
        let status = self.status.as_deref()?;
        match (self.completed, self.total) {
            (Some(done), Some(total)) if total > 0 => {
                let pct = (done.saturating_mul(100) / total).min(100);
                Some(format!("{status} {}%", pct / 10 * 10))
            }
            _ => Some(status.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullOutcome {
    pub model: String,
    pub status: String,
    pub lines: usize,
}

impl OllamaClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .user_agent(format!("seclab-controller/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ControllerError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let resp = self
            .http
            .get(format!("{}/api/tags", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ControllerError::Collaborator(format!(
                "model list failed with HTTP {}",
                resp.status()
            )));
        }
        let tags: TagsResponse = resp.json().await?;
        Ok(tags.models)
    }

    /// Pull a model, streaming progress lines into `log` as they arrive.
    pub async fn pull(&self, model: &str, logs: &LogRegistry, log: LogSourceId) -> Result<PullOutcome> {
        logs.append(log, &format!("Pulling model {model} from {}", self.base_url))
            .await?;
        let resp = self
            .http
            .post(format!("{}/api/pull", self.base_url))
            .json(&serde_json::json!({ "name": model, "stream": true }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let msg = format!("model pull failed with HTTP {}", resp.status());
            logs.append(log, &msg).await?;
            return Err(ControllerError::Collaborator(msg));
        }

        let mut stream = resp.bytes_stream();
        let mut pending = BytesMut::new();
        let mut last_line = String::new();
        let mut lines = 0usize;
        let mut final_status = String::from("unknown");

        while let Some(chunk) = stream.next().await {
            pending.extend_from_slice(&chunk?);
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let raw = pending.split_to(pos + 1);
                let text = String::from_utf8_lossy(&raw[..pos]);
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                let progress: PullProgress = match serde_json::from_str(text) {
                    Ok(p) => p,
                    Err(_) => {
                        logs.append(log, text).await?;
                        lines += 1;
                        continue;
                    }
                };
                if let Some(err) = progress.error {
                    let msg = format!("model pull failed: {err}");
                    logs.append(log, &msg).await?;
                    return Err(ControllerError::Collaborator(msg));
                }
                if let Some(status) = progress.status.as_deref() {
                    final_status = status.to_string();
                }
                if let Some(rendered) = progress.render() {
                    if rendered != last_line {
                        logs.append(log, &rendered).await?;
                        lines += 1;
                        last_line = rendered;
                    }
                }
            }
        }
        if pending.has_remaining() {
            let tail = String::from_utf8_lossy(&pending).trim().to_string();
            if !tail.is_empty() {
                logs.append(log, &tail).await?;
                lines += 1;
            }
        }

        logs.append(log, &format!("Pull finished: {final_status}"))
            .await?;
        Ok(PullOutcome {
            model: model.to_string(),
            status: final_status,
            lines,
        })
    }

    pub async fn remove(&self, model: &str) -> Result<()> {
        let resp = self
            .http
            .delete(format!("{}/api/delete", self.base_url))
            .json(&serde_json::json!({ "name": model }))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ControllerError::Collaborator(format!(
                "model remove failed with HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }
}
