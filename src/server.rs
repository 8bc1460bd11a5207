//! HTTP surface for the lab dashboard.

use crate::error::{ControllerError, ErrorClass};
use crate::model::DemoKey;
use crate::orchestrator::{Controller, PromptRequest};
use crate::settings::SettingsPatch;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

type AppState = Arc<Controller>;

const DEFAULT_TAIL_LINES: usize = 200;

/// Error body returned by every failing handler.
#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: String,
    class: ErrorClass,
}

pub struct ApiError(ControllerError);

impl From<ControllerError> for ApiError {
    fn from(e: ControllerError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            ControllerError::UnknownDemo(_) | ControllerError::UnknownLog(_) => StatusCode::NOT_FOUND,
            ControllerError::AlreadyRunning { .. } => StatusCode::CONFLICT,
            ControllerError::InvalidSetting { .. } => StatusCode::BAD_REQUEST,
            ControllerError::ServiceNotAllowed(_) => StatusCode::FORBIDDEN,
            ControllerError::Collaborator(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let class = self.0.class();
        if class == ErrorClass::Infrastructure {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = ErrorBody {
            detail: self.0.to_string(),
            class,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(controller: Arc<Controller>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/demos", get(demos))
        .route("/api/demo/:key", post(invoke_demo))
        .route("/api/runs", get(runs))
        .route("/api/metrics", get(metrics))
        .route("/api/metrics/history", get(metrics_history))
        .route("/api/metrics/orchestrate", post(orchestrate))
        .route("/api/logs/tail", get(log_tail))
        .route("/api/logs/clear", post(log_clear))
        .route("/api/logs/stream", get(log_stream))
        .route("/api/settings", get(get_settings).post(save_settings))
        .route("/api/services/restart", post(restart_service))
        .route("/api/ollama/models", get(list_models))
        .route("/api/ollama/pull", post(pull_model))
        .route("/api/ollama/remove", post(remove_model))
        .route("/api/test/prompt", post(test_prompt))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(controller)
}

async fn health(State(c): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "commands": c.catalog().command_labels(),
        "subscribers": c.events().subscriber_count(),
    }))
}

async fn demos(State(c): State<AppState>) -> Json<serde_json::Value> {
    let demos: Vec<_> = c.catalog().plans().cloned().collect();
    Json(json!({ "demos": demos, "harness": c.catalog().harness() }))
}

async fn invoke_demo(State(c): State<AppState>, Path(key): Path<String>) -> ApiResult<impl IntoResponse> {
    let key: DemoKey = key.parse()?;
    let outcome = c.invoke(key).await?;
    Ok(Json(json!({
        "status": outcome.state,
        "message": outcome.processed.summary.message,
        "results": outcome,
    })))
}

async fn runs(State(c): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "runs": c.run_records() }))
}

async fn metrics(State(c): State<AppState>) -> impl IntoResponse {
    Json(c.metrics_view().await)
}

async fn metrics_history(State(c): State<AppState>) -> impl IntoResponse {
    Json(c.metrics_history().await)
}

async fn orchestrate(State(c): State<AppState>) -> impl IntoResponse {
    Json(c.recompute_metrics().await)
}

#[derive(Debug, Deserialize)]
struct TailQuery {
    name: String,
    lines: Option<usize>,
}

async fn log_tail(State(c): State<AppState>, Query(q): Query<TailQuery>) -> ApiResult<impl IntoResponse> {
    let lines = c
        .tail(&q.name, q.lines.unwrap_or(DEFAULT_TAIL_LINES))
        .await?;
    Ok(Json(json!({ "name": q.name, "lines": lines })))
}

#[derive(Debug, Deserialize)]
struct ClearRequest {
    name: String,
}

async fn log_clear(State(c): State<AppState>, Json(req): Json<ClearRequest>) -> ApiResult<impl IntoResponse> {
    let cleared = c.clear_log(&req.name).await?;
    Ok(Json(json!({ "status": "ok", "cleared": cleared })))
}

async fn log_stream(State(c): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = c.subscribe();
    tracing::debug!(subscriber = subscription.id(), "event stream opened");
    let stream = subscription.into_stream().map(|event| {
        let sse = Event::default().event(event.kind());
        Ok(match sse.json_data(&event) {
            Ok(sse) => sse,
            Err(e) => Event::default().comment(format!("unserializable event: {e}")),
        })
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

async fn get_settings(State(c): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(c.load_settings().await?))
}

async fn save_settings(
    State(c): State<AppState>,
    Json(patch): Json<SettingsPatch>,
) -> ApiResult<impl IntoResponse> {
    let settings = c.save_settings(&patch).await?;
    Ok(Json(json!({
        "status": "ok",
        "settings": settings,
        "note": "Restart mock-llm to apply provider changes.",
    })))
}

#[derive(Debug, Deserialize)]
struct RestartRequest {
    service: String,
}

async fn restart_service(
    State(c): State<AppState>,
    Json(req): Json<RestartRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(c.restart_service(&req.service).await?))
}

async fn list_models(State(c): State<AppState>) -> ApiResult<impl IntoResponse> {
    let models = c.list_models().await?;
    Ok(Json(json!({ "models": models })))
}

#[derive(Debug, Default, Deserialize)]
struct PullRequest {
    #[serde(default)]
    model: Option<String>,
}

async fn pull_model(
    State(c): State<AppState>,
    body: Option<Json<PullRequest>>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = body.unwrap_or_default();
    Ok(Json(c.pull_model(req.model).await?))
}

#[derive(Debug, Deserialize)]
struct RemoveRequest {
    model: String,
}

async fn remove_model(
    State(c): State<AppState>,
    Json(req): Json<RemoveRequest>,
) -> ApiResult<impl IntoResponse> {
    c.remove_model(&req.model).await?;
    Ok((StatusCode::OK, Json(json!({ "status": "ok", "model": req.model }))))
}

async fn test_prompt(
    State(c): State<AppState>,
    Json(req): Json<PromptRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(c.send_prompt(&req).await?))
}
