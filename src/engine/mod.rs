//! Collaborator execution: demo scripts, the metrics harness, and the model runtime.

mod catalog;
mod ollama;
mod process;

pub use catalog::{CommandSpec, DemoCatalog, DemoPlan};
pub use ollama::{ModelInfo, OllamaClient, PullOutcome};

use crate::error::{ControllerError, Result};
use crate::logs::LogRegistry;
use crate::model::{ExitInfo, LogSourceId};
use process::{run_process, ProcessParams};
use std::path::PathBuf;
use std::sync::Arc;

/// Runs collaborator commands from the lab's repository root and streams
/// their output into the log registry.
#[derive(Clone)]
pub struct DemoEngine {
    repo_root: PathBuf,
    logs: Arc<LogRegistry>,
}

impl DemoEngine {
    pub fn new(repo_root: PathBuf, logs: Arc<LogRegistry>) -> Self {
        Self { repo_root, logs }
    }

    pub async fn run_command(
        &self,
        spec: &CommandSpec,
        log: LogSourceId,
        envs: &[(String, String)],
    ) -> Result<ExitInfo> {
        run_process(ProcessParams {
            spec,
            cwd: &self.repo_root,
            envs,
            logs: &self.logs,
            log,
        })
        .await
    }

    /// Run every step of a plan in order. Steps keep running after a
    /// non-zero exit so the log shows the whole scenario; a launch failure
    /// stops the plan but keeps the exits of the steps that did run.
    pub async fn run_plan(&self, plan: &DemoPlan, envs: &[(String, String)]) -> PlanRun {
        let mut exits = Vec::with_capacity(plan.steps.len());
        for step in &plan.steps {
            match self.run_command(step, plan.log, envs).await {
                Ok(exit) => exits.push(exit),
                Err(e) => {
                    return PlanRun {
                        exits,
                        error: Some(e),
                    }
                }
            }
        }
        PlanRun { exits, error: None }
    }
}

/// Outcome of a plan: the steps that ran, and the error that stopped it early.
#[derive(Debug)]
pub struct PlanRun {
    pub exits: Vec<ExitInfo>,
    pub error: Option<ControllerError>,
}
