use crate::error::ControllerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Immutable runtime configuration built from CLI arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub repo_root: PathBuf,
    pub log_dir: PathBuf,
    pub settings_path: PathBuf,
    pub metrics_path: PathBuf,
    pub redteam_path: PathBuf,
    pub lab_endpoint: String,
    pub ollama_docker_url: String,
    pub ollama_local_url: String,
    pub python: String,
    pub docker: String,
    pub log_capacity: usize,
    pub metrics_history: usize,
    pub subscriber_queue: usize,
    #[serde(with = "humantime_serde")]
    pub log_poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub lab_health_timeout: Duration,
    pub bootstrap_metrics: bool,
}

impl ControllerConfig {
    /// Configuration rooted at `repo_root` with every path in its default place.
    pub fn rooted_at(repo_root: impl Into<PathBuf>) -> Self {
        let repo_root = repo_root.into();
        Self {
            log_dir: repo_root.join("controller_api").join("logs"),
            settings_path: repo_root.join(".env"),
            metrics_path: repo_root.join("harness").join("results").join("metrics.json"),
            redteam_path: repo_root
                .join("harness")
                .join("results")
                .join("redteam_results.json"),
            repo_root,
            lab_endpoint: "http://mock-llm:8000/complete".into(),
            ollama_docker_url: "http://ollama:11434".into(),
            ollama_local_url: "http://127.0.0.1:11434".into(),
            python: "python".into(),
            docker: "docker".into(),
            log_capacity: crate::logs::DEFAULT_CAPACITY,
            metrics_history: crate::metrics::DEFAULT_HISTORY,
            subscriber_queue: crate::events::DEFAULT_QUEUE_DEPTH,
            log_poll_interval: Duration::from_secs(1),
            lab_health_timeout: Duration::from_secs(45),
            bootstrap_metrics: false,
        }
    }

    /// Scheme + authority of the lab endpoint, used for health checks.
    pub fn lab_base(&self) -> String {
        match reqwest::Url::parse(&self.lab_endpoint) {
            Ok(url) if url.has_host() => {
                let mut base = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
                if let Some(port) = url.port() {
                    base.push_str(&format!(":{port}"));
                }
                base
            }
            _ => "http://mock-llm:8000".into(),
        }
    }

    pub fn log_path(&self, source: LogSourceId) -> PathBuf {
        match source {
            LogSourceId::Requests => self
                .repo_root
                .join("jailbreak_demo")
                .join("logs")
                .join("requests.log"),
            other => self.log_dir.join(other.file_name()),
        }
    }
}

/// One attack or defense scenario the controller can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DemoKey {
    Jailbreak,
    JailbreakDefense,
    RagInjection,
    RagDefense,
    Poisoning,
    Redaction,
}

impl DemoKey {
    pub const ALL: [DemoKey; 6] = [
        DemoKey::Jailbreak,
        DemoKey::JailbreakDefense,
        DemoKey::RagInjection,
        DemoKey::RagDefense,
        DemoKey::Poisoning,
        DemoKey::Redaction,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DemoKey::Jailbreak => "jailbreak",
            DemoKey::JailbreakDefense => "jailbreak_defense",
            DemoKey::RagInjection => "rag_injection",
            DemoKey::RagDefense => "rag_defense",
            DemoKey::Poisoning => "poisoning",
            DemoKey::Redaction => "redaction",
        }
    }

    /// Log source the demo's collaborators write to.
    pub fn log_source(self) -> LogSourceId {
        match self {
            DemoKey::Jailbreak | DemoKey::JailbreakDefense => LogSourceId::Jailbreak,
            DemoKey::RagInjection => LogSourceId::RagInjection,
            DemoKey::RagDefense => LogSourceId::RagDefense,
            DemoKey::Poisoning => LogSourceId::Poisoning,
            DemoKey::Redaction => LogSourceId::Redaction,
        }
    }
}

impl fmt::Display for DemoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DemoKey {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DemoKey::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ControllerError::UnknownDemo(s.to_string()))
    }
}

/// Named log streams known to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSourceId {
    Jailbreak,
    RagInjection,
    RagDefense,
    Poisoning,
    Redaction,
    Metrics,
    Requests,
    Models,
}

impl LogSourceId {
    pub const ALL: [LogSourceId; 8] = [
        LogSourceId::Jailbreak,
        LogSourceId::RagInjection,
        LogSourceId::RagDefense,
        LogSourceId::Poisoning,
        LogSourceId::Redaction,
        LogSourceId::Metrics,
        LogSourceId::Requests,
        LogSourceId::Models,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LogSourceId::Jailbreak => "jailbreak",
            LogSourceId::RagInjection => "rag_injection",
            LogSourceId::RagDefense => "rag_defense",
            LogSourceId::Poisoning => "poisoning",
            LogSourceId::Redaction => "redaction",
            LogSourceId::Metrics => "metrics",
            LogSourceId::Requests => "requests",
            LogSourceId::Models => "models",
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            LogSourceId::Jailbreak => "jailbreak_run.log",
            LogSourceId::RagInjection => "rag_injection.log",
            LogSourceId::RagDefense => "rag_defense.log",
            LogSourceId::Poisoning => "poisoning.log",
            LogSourceId::Redaction => "redaction.log",
            LogSourceId::Metrics => "metrics.log",
            LogSourceId::Requests => "requests.log",
            LogSourceId::Models => "models.log",
        }
    }
}

impl fmt::Display for LogSourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogSourceId {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogSourceId::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ControllerError::UnknownLog(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Mock,
    Ollama,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Mock => "mock",
            Provider::Ollama => "ollama",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OllamaMode {
    Docker,
    Local,
}

impl OllamaMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OllamaMode::Docker => "docker",
            OllamaMode::Local => "local",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub provider: Provider,
    pub strict_mode: bool,
    pub bypass_token: String,
    pub ollama_model: String,
    pub ollama_mode: OllamaMode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: Provider::Mock,
            strict_mode: true,
            bypass_token: "roleplay".into(),
            ollama_model: "llama3:8b".into(),
            ollama_mode: OllamaMode::Docker,
        }
    }
}

impl Settings {
    /// Environment handed to collaborator programs.
    pub fn as_env(&self) -> Vec<(String, String)> {
        vec![
            ("LLM_PROVIDER".into(), self.provider.as_str().into()),
            ("STRICT_MODE".into(), self.strict_mode.to_string()),
            ("BYPASS_TOKEN".into(), self.bypass_token.clone()),
            ("OLLAMA_MODEL".into(), self.ollama_model.clone()),
            ("OLLAMA_MODE".into(), self.ollama_mode.as_str().into()),
        ]
    }
}

/// Latest computed security-metrics summary. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub asr: f64,
    pub leakage_count: u64,
    pub detection_latency_ms: f64,
    pub total_prompts: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatusKind {
    Succeeded,
    Failed,
    TimedOut,
}

impl ExitStatusKind {
    /// Label used in log framing lines.
    pub fn as_log_str(self) -> &'static str {
        match self {
            ExitStatusKind::Succeeded => "ok",
            ExitStatusKind::Failed => "error",
            ExitStatusKind::TimedOut => "timeout",
        }
    }
}

/// Exit information for one collaborator command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitInfo {
    pub label: String,
    pub status: ExitStatusKind,
    pub code: Option<i32>,
    pub duration_ms: u64,
    pub lines: usize,
}

impl ExitInfo {
    pub fn succeeded(&self) -> bool {
        self.status == ExitStatusKind::Succeeded
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub key: DemoKey,
    pub state: RunState,
    /// Terminal state of the most recent run, kept after the record returns to Idle.
    pub last_outcome: Option<RunState>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub exit_info: Vec<ExitInfo>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(skip)]
    pub generation: u64,
}

impl RunRecord {
    pub fn idle(key: DemoKey) -> Self {
        Self {
            key,
            state: RunState::Idle,
            last_outcome: None,
            started_at: None,
            finished_at: None,
            exit_info: Vec::new(),
            error: None,
            generation: 0,
        }
    }
}

/// Summary attached to `run_completed` events and invoke responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub state: RunState,
    pub message: String,
    pub steps: Vec<ExitInfo>,
}

/// Structured events pushed to live viewers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerEvent {
    Log {
        source: LogSourceId,
        line: String,
    },
    LogReset {
        source: LogSourceId,
    },
    Metrics {
        snapshot: MetricsSnapshot,
    },
    MetricsFailed {
        reason: String,
    },
    RunStatus {
        key: DemoKey,
        state: RunState,
    },
    RunCompleted {
        key: DemoKey,
        summary: RunSummary,
    },
    Status {
        message: String,
        timestamp: String,
    },
}

impl ControllerEvent {
    /// SSE event name.
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerEvent::Log { .. } => "log",
            ControllerEvent::LogReset { .. } => "log_reset",
            ControllerEvent::Metrics { .. } => "metrics",
            ControllerEvent::MetricsFailed { .. } => "metrics_failed",
            ControllerEvent::RunStatus { .. } => "run_status",
            ControllerEvent::RunCompleted { .. } => "run_completed",
            ControllerEvent::Status { .. } => "status",
        }
    }

    pub fn status(message: impl Into<String>) -> Self {
        ControllerEvent::Status {
            message: message.into(),
            timestamp: now_rfc3339(),
        }
    }
}

pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}
