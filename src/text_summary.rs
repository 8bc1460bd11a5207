//! Run summary builder.
//!
//! Turns a demo plan and its step exits into the terminal run state, the
//! message carried by `run_completed`, and the `[SUMMARY]` lines appended to
//! the demo's log.

use crate::engine::DemoPlan;
use crate::model::{ExitInfo, RunState, RunSummary};

/// Pre-formatted summary for the log plus the structured event payload.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
    pub summary: RunSummary,
}

/// Build the summary of a finished run. `launch_error` is set when a step
/// could not be started at all.
pub(crate) fn build_run_summary(
    plan: &DemoPlan,
    exits: &[ExitInfo],
    launch_error: Option<&str>,
) -> TextSummary {
    let failed = exits.iter().filter(|e| !e.succeeded()).count();
    let state = if launch_error.is_none() && failed == 0 && exits.len() == plan.steps.len() {
        RunState::Succeeded
    } else {
        RunState::Failed
    };

    let message = match (launch_error, failed) {
        (Some(err), _) => format!("{} aborted: {err}", plan.key),
        (None, 0) => plan.summary.clone(),
        (None, n) => format!("{} ({n} of {} steps failed)", plan.summary, exits.len()),
    };

    let mut lines = Vec::with_capacity(exits.len() + 1);
    for exit in exits {
        let code = exit
            .code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".into());
        lines.push(format!(
            "[SUMMARY] {}: {} (exit {code}, {} lines, {} ms)",
            exit.label,
            exit.status.as_log_str(),
            exit.lines,
            exit.duration_ms
        ));
    }
    lines.push(format!("[SUMMARY] {message}"));

    TextSummary {
        lines,
        summary: RunSummary {
            state,
            message,
            steps: exits.to_vec(),
        },
    }
}
