//! Post-run processing.
//!
//! Writes the run summary, records the terminal state, and refreshes the
//! security metrics before the key is handed back to Idle.

use crate::engine::DemoPlan;
use crate::error::ControllerError;
use crate::events::EventBroadcaster;
use crate::logs::LogRegistry;
use crate::metrics::{MetricsRecomputer, Recomputation};
use crate::model::{ControllerEvent, ExitInfo, Settings};
use crate::orchestrator::coordinator::RunTicket;
use crate::settings::SettingsStore;
use crate::text_summary::build_run_summary;
use serde::Serialize;

/// Result of post-run processing, returned to the invoker.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedRun {
    pub summary: crate::model::RunSummary,
    pub metrics: Recomputation,
}

pub(crate) struct CompletionContext<'a> {
    pub logs: &'a LogRegistry,
    pub events: &'a EventBroadcaster,
    pub settings: &'a SettingsStore,
    pub metrics: &'a MetricsRecomputer,
}

/// Process a finished run: summary lines, terminal state, `run_completed`,
/// then exactly one metrics recomputation. The ticket is left for the caller
/// to release.
pub(crate) async fn process_run_completion(
    ctx: CompletionContext<'_>,
    ticket: &RunTicket,
    plan: &DemoPlan,
    exits: &[ExitInfo],
    launch_error: Option<&ControllerError>,
) -> ProcessedRun {
    let launch_text = launch_error.map(ToString::to_string);
    let text = build_run_summary(plan, exits, launch_text.as_deref());

    for line in &text.lines {
        if let Err(e) = ctx.logs.append(plan.log, line).await {
            tracing::error!(key = %plan.key, error = %e, "failed to write run summary");
        }
    }

    let step_error = exits
        .iter()
        .find(|e| !e.succeeded())
        .map(|e| format!("{} finished with status {}", e.label, e.status.as_log_str()));
    ticket.complete(&text.summary, launch_text.or(step_error));
    ctx.events.publish(ControllerEvent::RunCompleted {
        key: plan.key,
        summary: text.summary.clone(),
    });

    let settings = ctx.settings.load().await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "settings unreadable; recomputing metrics with defaults");
        Settings::default()
    });
    let metrics = ctx.metrics.recompute(&settings).await;

    ProcessedRun {
        summary: text.summary,
        metrics,
    }
}
