//! Security metrics: artifact parsing, the recomputer, and history statistics.

use crate::engine::{CommandSpec, DemoEngine};
use crate::events::EventBroadcaster;
use crate::logs::LogRegistry;
use crate::model::{now_rfc3339, ControllerEvent, LogSourceId, MetricsSnapshot, Settings};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const DEFAULT_HISTORY: usize = 20;

/// Compute metrics (mean, median, 25th percentile, 75th percentile) from samples
pub fn compute_metrics(samples: &[f64]) -> Option<(f64, f64, f64, f64)> {
    if samples.len() < 2 {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    let median = sorted[n / 2];
    let p25 = sorted[n / 4];
    let p75 = sorted[3 * n / 4];
    Some((mean, median, p25, p75))
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn field_f64(block: &serde_json::Map<String, Value>, key: &str) -> Result<f64, String> {
    match block.get(key) {
        None | Some(Value::Null) => Ok(0.0),
        Some(v) => as_f64(v).ok_or_else(|| format!("`{key}` is not a number")),
    }
}

fn field_count(block: &serde_json::Map<String, Value>, key: &str) -> Result<u64, String> {
    let v = field_f64(block, key)?;
    if v < 0.0 || v.fract() != 0.0 {
        return Err(format!("`{key}` must be a non-negative integer, got {v}"));
    }
    Ok(v as u64)
}

/// Map a harness artifact to the canonical snapshot shape.
///
/// Accepts either `{"metrics": {...}}` or a flat object. `asr` (or
/// `attack_success_rate`) is required; the other fields default to zero.
pub fn summarize_artifact(payload: &Value, timestamp: String) -> Result<MetricsSnapshot, String> {
    let root = payload
        .as_object()
        .ok_or_else(|| "artifact is not a JSON object".to_string())?;
    let block = match root.get("metrics") {
        Some(Value::Object(m)) => m,
        _ => root,
    };

    let asr = block
        .get("asr")
        .or_else(|| block.get("attack_success_rate"))
        .ok_or_else(|| "artifact has no `asr`".to_string())
        .and_then(|v| as_f64(v).ok_or_else(|| "`asr` is not a number".to_string()))?;
    if !(0.0..=1.0).contains(&asr) {
        return Err(format!("`asr` out of range: {asr}"));
    }
    let detection_latency_ms = field_f64(block, "detection_latency_ms")?;
    if !detection_latency_ms.is_finite() || detection_latency_ms < 0.0 {
        return Err(format!(
            "`detection_latency_ms` must be non-negative, got {detection_latency_ms}"
        ));
    }

    Ok(MetricsSnapshot {
        asr,
        leakage_count: field_count(block, "leakage_count")?,
        detection_latency_ms,
        total_prompts: field_count(block, "total_prompts")?,
        timestamp,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecomputeStatus {
    Updated,
    Stale,
}

/// Result of one recomputation attempt. On failure `snapshot` is the
/// previous one, unchanged.
#[derive(Debug, Clone, Serialize)]
pub struct Recomputation {
    pub status: RecomputeStatus,
    pub snapshot: Option<MetricsSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsView {
    pub latest: Option<MetricsSnapshot>,
    pub attempts: u64,
    pub failures: u64,
    pub last_error: Option<String>,
    pub redteam: JsonArtifact,
}

/// A JSON file written by a collaborator, passed through as-is.
/// Unparseable content reads as missing with `error` set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonArtifact {
    pub data: Option<Value>,
    pub missing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JsonArtifact {
    fn absent(error: Option<&str>) -> Self {
        Self {
            data: None,
            missing: true,
            error: error.map(str::to_owned),
        }
    }
}

pub async fn read_json_artifact(path: &Path) -> JsonArtifact {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return JsonArtifact::absent(None),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "artifact unreadable");
            return JsonArtifact::absent(Some("unreadable"));
        }
    };
    match serde_json::from_str(&raw) {
        Ok(data) => JsonArtifact {
            data: Some(data),
            missing: false,
            error: None,
        },
        Err(_) => JsonArtifact::absent(Some("invalid_json")),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesStats {
    pub mean: f64,
    pub median: f64,
    pub p25: f64,
    pub p75: f64,
}

impl SeriesStats {
    fn from_samples(samples: &[f64]) -> Option<Self> {
        compute_metrics(samples).map(|(mean, median, p25, p75)| Self {
            mean,
            median,
            p25,
            p75,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryView {
    pub snapshots: Vec<MetricsSnapshot>,
    pub asr: Option<SeriesStats>,
    pub detection_latency_ms: Option<SeriesStats>,
}

#[derive(Debug, Default)]
struct MetricsState {
    latest: Option<MetricsSnapshot>,
    history: VecDeque<MetricsSnapshot>,
    attempts: u64,
    failures: u64,
    last_error: Option<String>,
}

pub struct MetricsRecomputer {
    engine: DemoEngine,
    logs: Arc<LogRegistry>,
    events: EventBroadcaster,
    harness: CommandSpec,
    artifact: PathBuf,
    redteam: PathBuf,
    history_cap: usize,
    // Held across the whole attempt so recomputations publish in order.
    state: Mutex<MetricsState>,
}

impl MetricsRecomputer {
    pub fn new(
        engine: DemoEngine,
        logs: Arc<LogRegistry>,
        events: EventBroadcaster,
        harness: CommandSpec,
        artifact: PathBuf,
        redteam: PathBuf,
        history_cap: usize,
    ) -> Self {
        Self {
            engine,
            logs,
            events,
            harness,
            artifact,
            redteam,
            history_cap: history_cap.max(1),
            state: Mutex::new(MetricsState::default()),
        }
    }

    /// Run the harness, read its artifact and publish the new snapshot.
    /// Any failure keeps the previous snapshot and is reported, never raised.
    pub async fn recompute(&self, settings: &Settings) -> Recomputation {
        let mut state = self.state.lock().await;
        state.attempts += 1;

        match self.produce(settings).await {
            Ok(snapshot) => {
                if state.history.len() == self.history_cap {
                    state.history.pop_front();
                }
                state.history.push_back(snapshot.clone());
                state.latest = Some(snapshot.clone());
                state.last_error = None;
                tracing::info!(
                    asr = snapshot.asr,
                    leakage = snapshot.leakage_count,
                    "metrics recomputed"
                );
                self.events.publish(ControllerEvent::Metrics {
                    snapshot: snapshot.clone(),
                });
                Recomputation {
                    status: RecomputeStatus::Updated,
                    snapshot: Some(snapshot),
                    error: None,
                }
            }
            Err(reason) => {
                state.failures += 1;
                state.last_error = Some(reason.clone());
                tracing::warn!(%reason, "metrics recomputation failed; keeping previous snapshot");
                self.events.publish(ControllerEvent::MetricsFailed {
                    reason: reason.clone(),
                });
                Recomputation {
                    status: RecomputeStatus::Stale,
                    snapshot: state.latest.clone(),
                    error: Some(reason),
                }
            }
        }
    }

    async fn produce(&self, settings: &Settings) -> Result<MetricsSnapshot, String> {
        self.logs
            .reset(LogSourceId::Metrics)
            .await
            .map_err(|e| e.to_string())?;
        let exit = self
            .engine
            .run_command(&self.harness, LogSourceId::Metrics, &settings.as_env())
            .await
            .map_err(|e| e.to_string())?;
        if !exit.succeeded() {
            return Err(format!(
                "metrics harness finished with status {}",
                exit.status.as_log_str()
            ));
        }

        let raw = match tokio::fs::read_to_string(&self.artifact).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(format!("metrics artifact missing: {}", self.artifact.display()))
            }
            Err(e) => return Err(format!("metrics artifact unreadable: {e}")),
        };
        let payload: Value =
            serde_json::from_str(&raw).map_err(|e| format!("metrics artifact malformed: {e}"))?;
        summarize_artifact(&payload, now_rfc3339())
            .map_err(|e| format!("metrics artifact malformed: {e}"))
    }

    pub async fn view(&self) -> MetricsView {
        let redteam = read_json_artifact(&self.redteam).await;
        let state = self.state.lock().await;
        MetricsView {
            latest: state.latest.clone(),
            attempts: state.attempts,
            failures: state.failures,
            last_error: state.last_error.clone(),
            redteam,
        }
    }

    pub async fn history(&self) -> HistoryView {
        let state = self.state.lock().await;
        let snapshots: Vec<MetricsSnapshot> = state.history.iter().cloned().collect();
        let asr: Vec<f64> = snapshots.iter().map(|s| s.asr).collect();
        let latency: Vec<f64> = snapshots.iter().map(|s| s.detection_latency_ms).collect();
        HistoryView {
            asr: SeriesStats::from_samples(&asr),
            detection_latency_ms: SeriesStats::from_samples(&latency),
            snapshots,
        }
    }

    pub async fn attempts(&self) -> u64 {
        self.state.lock().await.attempts
    }
}
