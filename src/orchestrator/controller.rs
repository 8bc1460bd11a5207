//! Controller facade.
//!
//! Owns every long-lived component and exposes the operations the HTTP layer
//! calls: demo invocation, log access, settings, services, model management
//! and metrics.

use crate::engine::{
    DemoCatalog, DemoEngine, DemoPlan, ModelInfo, OllamaClient, PlanRun, PullOutcome,
};
use crate::error::{ControllerError, Result};
use crate::events::{EventBroadcaster, Subscription};
use crate::logs::LogRegistry;
use crate::metrics::{HistoryView, MetricsRecomputer, MetricsView, Recomputation};
use crate::model::{
    ControllerConfig, ControllerEvent, DemoKey, LogSourceId, OllamaMode, RunRecord,
    RunState, Settings,
};
use crate::orchestrator::coordinator::{RunCoordinator, RunTicket};
use crate::orchestrator::post_process::{process_run_completion, CompletionContext, ProcessedRun};
use crate::services::{self, ServiceOutcome};
use crate::settings::{SettingsPatch, SettingsStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const PROMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// What an invoker gets back once a demo run (and its metrics refresh) finished.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub key: DemoKey,
    pub state: RunState,
    #[serde(flatten)]
    pub processed: ProcessedRun,
}

/// Settings as stored on disk; `missing` is set when the file does not exist yet.
#[derive(Debug, Clone, Serialize)]
pub struct SettingsView {
    pub missing: bool,
    pub settings: Settings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptRequest {
    pub text: String,
    #[serde(default = "default_intent")]
    pub intent: String,
}

fn default_intent() -> String {
    "custom".into()
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptOutcome {
    pub http_status: u16,
    pub latency_ms: u64,
    pub response: serde_json::Value,
}

pub struct Controller {
    config: ControllerConfig,
    catalog: DemoCatalog,
    events: EventBroadcaster,
    logs: Arc<LogRegistry>,
    settings: SettingsStore,
    coordinator: Arc<RunCoordinator>,
    metrics: Arc<MetricsRecomputer>,
    engine: DemoEngine,
    http: reqwest::Client,
}

impl Controller {
    /// Wire every component from `config` and the given demo catalog.
    pub fn new(config: ControllerConfig, catalog: DemoCatalog) -> Result<Arc<Self>> {
        let events = EventBroadcaster::new(config.subscriber_queue);
        let logs = Arc::new(LogRegistry::new(config.clone(), events.clone()));
        let engine = DemoEngine::new(config.repo_root.clone(), Arc::clone(&logs));
        let metrics = Arc::new(MetricsRecomputer::new(
            engine.clone(),
            Arc::clone(&logs),
            events.clone(),
            catalog.harness().clone(),
            config.metrics_path.clone(),
            config.redteam_path.clone(),
            config.metrics_history,
        ));
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .user_agent(format!("seclab-controller/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ControllerError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Arc::new(Self {
            settings: SettingsStore::new(config.settings_path.clone()),
            coordinator: Arc::new(RunCoordinator::new(events.clone())),
            config,
            catalog,
            events,
            logs,
            metrics,
            engine,
            http,
        }))
    }

    /// Controller with the lab's standard demo catalog.
    pub fn standard(config: ControllerConfig) -> Result<Arc<Self>> {
        let catalog = DemoCatalog::standard(&config);
        Self::new(config, catalog)
    }

    /// Validate settings, reset logs, and start the background tasks.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let settings = self.settings.load().await?;
        tracing::info!(
            provider = settings.provider.as_str(),
            strict_mode = settings.strict_mode,
            path = %self.settings.path().display(),
            "settings loaded"
        );
        self.logs.reset_all().await?;
        tokio::spawn(Arc::clone(&self.logs).watch(self.config.log_poll_interval));
        self.events
            .publish(ControllerEvent::status("controller_started"));

        if self.config.bootstrap_metrics {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if this.wait_for_lab().await {
                    this.recompute_metrics().await;
                } else {
                    tracing::warn!(
                        timeout = ?this.config.lab_health_timeout,
                        "lab model not healthy; skipping startup metrics"
                    );
                }
            });
        }
        Ok(())
    }

    async fn wait_for_lab(&self) -> bool {
        let url = format!("{}/healthz", self.config.lab_base());
        let deadline = Instant::now() + self.config.lab_health_timeout;
        loop {
            match self
                .http
                .get(&url)
                .timeout(Duration::from_secs(2))
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => return true,
                Ok(resp) => tracing::debug!(status = %resp.status(), "lab model not ready"),
                Err(e) => tracing::debug!(error = %e, "lab model not reachable"),
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn catalog(&self) -> &DemoCatalog {
        &self.catalog
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    pub fn logs(&self) -> &Arc<LogRegistry> {
        &self.logs
    }

    pub fn coordinator(&self) -> &Arc<RunCoordinator> {
        &self.coordinator
    }

    pub fn metrics(&self) -> &Arc<MetricsRecomputer> {
        &self.metrics
    }

    /// Run a demo to completion. Fails fast with `AlreadyRunning` when the
    /// key (or a key sharing its log) is mid-run.
    pub async fn invoke(self: &Arc<Self>, key: DemoKey) -> Result<RunOutcome> {
        let plan = self.catalog.plan(key)?.clone();
        let ticket = self.coordinator.begin(key)?;
        tracing::info!(%key, "demo run started");

        let this = Arc::clone(self);
        self.supervise(key, async move { this.execute(ticket, plan).await })
            .await
    }

    // The run lives in its own task so a dropped request cannot cancel it. A
    // panicking run loses its ticket, whose drop marks the key failed; the
    // recomputation that every terminal run owes happens here instead.
    async fn supervise<F>(&self, key: DemoKey, run: F) -> Result<RunOutcome>
    where
        F: std::future::Future<Output = Result<RunOutcome>> + Send + 'static,
    {
        match tokio::spawn(run).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(%key, error = %e, "run task aborted");
                self.recompute_metrics().await;
                Err(ControllerError::Internal(format!(
                    "run task for {key} failed: {e}"
                )))
            }
        }
    }

    async fn execute(&self, ticket: RunTicket, plan: DemoPlan) -> Result<RunOutcome> {
        let key = ticket.key();
        let PlanRun {
            exits,
            error: launch_error,
        } = match self.prepare(&plan).await {
            Ok(settings) => self.engine.run_plan(&plan, &settings.as_env()).await,
            Err(e) => PlanRun {
                exits: Vec::new(),
                error: Some(e),
            },
        };
        if let Some(e) = &launch_error {
            match e.class() {
                crate::error::ErrorClass::Infrastructure => {
                    tracing::error!(%key, error = %e, "demo could not run")
                }
                _ => tracing::warn!(%key, error = %e, "demo could not run"),
            }
        }

        let processed = process_run_completion(
            CompletionContext {
                logs: &self.logs,
                events: &self.events,
                settings: &self.settings,
                metrics: &self.metrics,
            },
            &ticket,
            &plan,
            &exits,
            launch_error.as_ref(),
        )
        .await;
        ticket.release();
        tracing::info!(%key, state = ?processed.summary.state, "demo run finished");

        match launch_error {
            Some(e) => Err(e),
            None => Ok(RunOutcome {
                key,
                state: processed.summary.state,
                processed,
            }),
        }
    }

    // Reset the demo's log and apply its settings override.
    async fn prepare(&self, plan: &DemoPlan) -> Result<Settings> {
        self.logs.reset(plan.log).await?;
        match plan.strict_mode {
            Some(strict) => {
                self.save_settings_as(&SettingsPatch::strict_mode(strict), "demo_settings_override")
                    .await
            }
            None => self.settings.load().await,
        }
    }

    pub fn run_records(&self) -> Vec<RunRecord> {
        self.coordinator.records()
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    pub async fn tail(&self, name: &str, lines: usize) -> Result<Vec<String>> {
        let source: LogSourceId = name.parse()?;
        self.logs.tail(source, lines).await
    }

    /// Clear one log, or every log when `target` is `all`. Returns what was cleared.
    pub async fn clear_log(&self, target: &str) -> Result<Vec<LogSourceId>> {
        if target.eq_ignore_ascii_case("all") {
            self.logs.reset_all().await?;
            return Ok(LogSourceId::ALL.to_vec());
        }
        let source: LogSourceId = target.parse()?;
        self.logs.reset(source).await?;
        Ok(vec![source])
    }

    pub async fn load_settings(&self) -> Result<SettingsView> {
        let raw = self.settings.load_raw().await?;
        Ok(SettingsView {
            missing: raw.is_none(),
            settings: self.settings.load().await?,
            raw,
        })
    }

    pub async fn save_settings(&self, patch: &SettingsPatch) -> Result<Settings> {
        self.save_settings_as(patch, "settings_save").await
    }

    async fn save_settings_as(&self, patch: &SettingsPatch, operation: &'static str) -> Result<Settings> {
        let _guard = self.coordinator.exclusive(operation).await;
        let saved = self.settings.save(patch).await?;
        self.events
            .publish(ControllerEvent::status("settings_updated"));
        Ok(saved)
    }

    pub async fn restart_service(&self, service: &str) -> Result<ServiceOutcome> {
        if !services::is_allowed(service) {
            return Err(ControllerError::ServiceNotAllowed(service.to_string()));
        }
        let _guard = self.coordinator.exclusive("service_restart").await;
        services::restart_service(&self.config.docker, &self.config.repo_root, service).await
    }

    fn ollama(&self, settings: &Settings) -> Result<OllamaClient> {
        let base = match settings.ollama_mode {
            OllamaMode::Docker => &self.config.ollama_docker_url,
            OllamaMode::Local => &self.config.ollama_local_url,
        };
        OllamaClient::new(base)
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let settings = self.settings.load().await?;
        self.ollama(&settings)?.list_models().await
    }

    /// Pull `model` (or the configured one), streaming progress to the `models` log.
    pub async fn pull_model(self: &Arc<Self>, model: Option<String>) -> Result<PullOutcome> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = this.coordinator.exclusive("model_pull").await;
            let settings = this.settings.load().await?;
            let model = model
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| settings.ollama_model.clone());
            this.logs.reset(LogSourceId::Models).await?;
            let outcome = this
                .ollama(&settings)?
                .pull(&model, &this.logs, LogSourceId::Models)
                .await;
            match &outcome {
                Ok(o) => tracing::info!(model = %o.model, status = %o.status, "model pulled"),
                Err(e) => tracing::warn!(%model, error = %e, "model pull failed"),
            }
            outcome
        })
        .await
        .map_err(|e| ControllerError::Internal(format!("model pull task failed: {e}")))?
    }

    pub async fn remove_model(&self, model: &str) -> Result<()> {
        let model = model.trim();
        if model.is_empty() {
            return Err(ControllerError::invalid_setting("model", "must not be empty"));
        }
        let _guard = self.coordinator.exclusive("model_remove").await;
        let settings = self.settings.load().await?;
        self.ollama(&settings)?.remove(model).await?;
        self.logs
            .append(LogSourceId::Models, &format!("Removed model {model}"))
            .await?;
        Ok(())
    }

    pub async fn recompute_metrics(&self) -> Recomputation {
        let settings = self.settings.load().await.unwrap_or_else(|e| {
            tracing::error!(error = %e, "settings unreadable; recomputing metrics with defaults");
            Settings::default()
        });
        self.metrics.recompute(&settings).await
    }

    pub async fn metrics_view(&self) -> MetricsView {
        self.metrics.view().await
    }

    pub async fn metrics_history(&self) -> HistoryView {
        self.metrics.history().await
    }

    /// Forward a custom prompt to the lab endpoint and time the round trip.
    pub async fn send_prompt(&self, request: &PromptRequest) -> Result<PromptOutcome> {
        if request.text.trim().is_empty() {
            return Err(ControllerError::invalid_setting("text", "must not be empty"));
        }
        let started = Instant::now();
        let resp = self
            .http
            .post(&self.config.lab_endpoint)
            .json(&serde_json::json!({ "text": request.text, "intent": request.intent }))
            .timeout(PROMPT_TIMEOUT)
            .send()
            .await
            .map_err(|e| ControllerError::Collaborator(format!("lab endpoint unreachable: {e}")))?;
        let http_status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| ControllerError::Collaborator(format!("lab endpoint response failed: {e}")))?;
        let latency_ms = started.elapsed().as_millis() as u64;
        let response = serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body));
        tracing::info!(http_status, latency_ms, "test prompt answered");
        Ok(PromptOutcome {
            http_status,
            latency_ms,
            response,
        })
    }
}
