//! Best-effort restart of dependent lab services through docker compose.

use crate::error::{ControllerError, Result};
use serde::Serialize;
use std::path::Path;
use tokio::process::Command;

pub const ALLOWED_SERVICES: [&str; 4] = ["mock-llm", "controller_api", "lab_webui", "rag"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Ok,
    Failed,
}

/// Structured result of an external action; failures are data, not errors.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceOutcome {
    pub service: String,
    pub status: ActionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub fn is_allowed(service: &str) -> bool {
    ALLOWED_SERVICES.contains(&service)
}

/// Run `<docker> compose restart <service>` from the repository root.
///
/// Only an unknown service name is an error; anything that goes wrong with
/// docker itself comes back as `ActionStatus::Failed`.
pub async fn restart_service(docker: &str, repo_root: &Path, service: &str) -> Result<ServiceOutcome> {
    if !is_allowed(service) {
        return Err(ControllerError::ServiceNotAllowed(service.to_string()));
    }

    let failed = |message: String| ServiceOutcome {
        service: service.to_string(),
        status: ActionStatus::Failed,
        output: None,
        message: Some(message),
    };

    let output = match Command::new(docker)
        .args(["compose", "restart", service])
        .current_dir(repo_root)
        .output()
        .await
    {
        Ok(o) => o,
        Err(e) => {
            tracing::warn!(%service, error = %e, "service restart could not start");
            return Ok(failed(format!("failed to run {docker}: {e}")));
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        tracing::warn!(%service, code = ?output.status.code(), "service restart failed");
        return Ok(failed(if stderr.is_empty() {
            "restart failed".to_string()
        } else {
            stderr
        }));
    }

    tracing::info!(%service, "service restarted");
    Ok(ServiceOutcome {
        service: service.to_string(),
        status: ActionStatus::Ok,
        output: Some(String::from_utf8_lossy(&output.stdout).trim().to_string()),
        message: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_service_is_rejected() {
        let err = restart_service("docker", Path::new("."), "postgres")
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::ServiceNotAllowed(_)));
    }

    #[tokio::test]
    async fn missing_docker_is_a_failed_outcome() {
        let out = restart_service("no-such-docker-binary-xyz", Path::new("."), "rag")
            .await
            .unwrap();
        assert_eq!(out.status, ActionStatus::Failed);
        assert!(out.message.unwrap().contains("no-such-docker-binary-xyz"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_reports_stderr() {
        // `false` ignores its arguments and exits 1 without output.
        let out = restart_service("false", Path::new("."), "mock-llm").await.unwrap();
        assert_eq!(out.status, ActionStatus::Failed);
        assert_eq!(out.message.as_deref(), Some("restart failed"));
    }
}
