use crate::engine::catalog::CommandSpec;
use crate::error::{ControllerError, Result};
use crate::logs::LogRegistry;
use crate::model::{now_rfc3339, ExitInfo, ExitStatusKind, LogSourceId};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Parameters for one collaborator invocation.
pub(crate) struct ProcessParams<'a> {
    pub spec: &'a CommandSpec,
    pub cwd: &'a Path,
    pub envs: &'a [(String, String)],
    pub logs: &'a LogRegistry,
    pub log: LogSourceId,
}

fn forward_lines<R>(reader: R, prefix: &'static str, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(format!("{prefix}{line}")).await.is_err() {
                break;
            }
        }
    });
}

/// Spawn the program, stream its combined output into the log source, and
/// wait for it to exit (or time out).
///
/// A non-zero exit is a normal outcome reported in `ExitInfo`; only a
/// failure to launch at all is an error.
pub(crate) async fn run_process(params: ProcessParams<'_>) -> Result<ExitInfo> {
    let ProcessParams {
        spec,
        cwd,
        envs,
        logs,
        log,
    } = params;

    logs.append(log, &format!("=== {} :: {} ===", now_rfc3339(), spec.label))
        .await?;
    logs.append(log, &format!("Command: {}", spec.display()))
        .await?;

    let started = Instant::now();
    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .current_dir(cwd)
        .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| {
            tracing::warn!(program = %spec.program, error = %source, "collaborator failed to launch");
            ControllerError::Launch {
                program: spec.program.clone(),
                source,
            }
        })?;

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = child.start_kill();
        return Err(ControllerError::NoOutput {
            program: spec.program.clone(),
        });
    };

    let (tx, mut rx) = mpsc::channel::<String>(64);
    forward_lines(stdout, "", tx.clone());
    forward_lines(stderr, "[stderr] ", tx);

    let mut lines = 0usize;
    let drive = async {
        while let Some(line) = rx.recv().await {
            logs.append(log, &line).await?;
            lines += 1;
        }
        child
            .wait()
            .await
            .map_err(|e| ControllerError::io(format!("wait for {}", spec.program), e))
    };

    let outcome = tokio::time::timeout(spec.timeout, drive).await;
    let (status, code) = match outcome {
        Ok(Ok(exit)) if exit.success() => (ExitStatusKind::Succeeded, exit.code()),
        Ok(Ok(exit)) => (ExitStatusKind::Failed, exit.code()),
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            // Keep what was already produced: queued lines, plus anything still
            // in the pipes, bounded by a short grace period.
            let grace = tokio::time::Instant::now() + DRAIN_GRACE;
            while let Ok(Some(line)) = tokio::time::timeout_at(grace, rx.recv()).await {
                logs.append(log, &line).await?;
                lines += 1;
            }
            logs.append(
                log,
                &format!("[timeout after {}]", humantime::format_duration(spec.timeout)),
            )
            .await?;
            (ExitStatusKind::TimedOut, None)
        }
    };

    logs.append(
        log,
        &format!("=== END {} (status={}) ===", spec.label, status.as_log_str()),
    )
    .await?;

    if status != ExitStatusKind::Succeeded {
        tracing::warn!(label = %spec.label, ?code, ?status, "collaborator did not succeed");
    }

    Ok(ExitInfo {
        label: spec.label.clone(),
        status,
        code,
        duration_ms: started.elapsed().as_millis() as u64,
        lines,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::events::EventBroadcaster;
    use crate::model::ControllerConfig;
    use std::time::Duration;

    fn sh(label: &str, script: &str, timeout: Duration) -> CommandSpec {
        CommandSpec {
            label: label.into(),
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            timeout,
        }
    }

    async fn run(spec: &CommandSpec) -> (tempfile::TempDir, LogRegistry, Result<ExitInfo>) {
        let dir = tempfile::tempdir().unwrap();
        let logs = LogRegistry::new(
            ControllerConfig::rooted_at(dir.path()),
            EventBroadcaster::new(64),
        );
        let res = run_process(ProcessParams {
            spec,
            cwd: dir.path(),
            envs: &[("DEMO_FLAG".into(), "on".into())],
            logs: &logs,
            log: LogSourceId::Poisoning,
        })
        .await;
        (dir, logs, res)
    }

    #[tokio::test]
    async fn success_streams_output_and_frames_it() {
        let spec = sh("ECHO", "echo one; echo two; echo \"flag=$DEMO_FLAG\"", Duration::from_secs(10));
        let (_dir, logs, res) = run(&spec).await;
        let exit = res.unwrap();
        assert!(exit.succeeded());
        assert_eq!(exit.code, Some(0));
        assert_eq!(exit.lines, 3);

        let tail = logs.tail(LogSourceId::Poisoning, 50).await.unwrap();
        assert!(tail[0].contains(":: ECHO ==="));
        assert!(tail.contains(&"one".to_string()));
        assert!(tail.contains(&"flag=on".to_string()));
        assert_eq!(tail.last().unwrap(), "=== END ECHO (status=ok) ===");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_raised() {
        let spec = sh("FAIL", "echo oops 1>&2; exit 3", Duration::from_secs(10));
        let (_dir, logs, res) = run(&spec).await;
        let exit = res.unwrap();
        assert_eq!(exit.status, ExitStatusKind::Failed);
        assert_eq!(exit.code, Some(3));
        let tail = logs.tail(LogSourceId::Poisoning, 50).await.unwrap();
        assert!(tail.contains(&"[stderr] oops".to_string()));
    }

    #[tokio::test]
    async fn missing_binary_is_a_launch_error() {
        let spec = CommandSpec::new("NOPE", "definitely-not-a-real-binary-xyz", &[], 5);
        let (_dir, _logs, res) = run(&spec).await;
        assert!(matches!(res, Err(ControllerError::Launch { .. })));
    }

    #[tokio::test]
    async fn timeout_kills_child() {
        let spec = sh("SLOW", "sleep 5", Duration::from_millis(200));
        let (_dir, _logs, res) = run(&spec).await;
        let exit = res.unwrap();
        assert_eq!(exit.status, ExitStatusKind::TimedOut);
        assert!(exit.duration_ms < 5_000);
    }

    #[tokio::test]
    async fn output_pending_at_timeout_is_still_logged() {
        // The background writer outlives the killed shell and keeps the pipe open.
        let spec = sh(
            "STRAGGLER",
            "(sleep 0.4; echo straggler) & sleep 5",
            Duration::from_millis(200),
        );
        let (_dir, logs, res) = run(&spec).await;
        let exit = res.unwrap();
        assert_eq!(exit.status, ExitStatusKind::TimedOut);
        assert_eq!(exit.lines, 1);

        let tail = logs.tail(LogSourceId::Poisoning, 50).await.unwrap();
        let n = tail.len();
        assert_eq!(tail[n - 3], "straggler");
        assert_eq!(tail[n - 2], "[timeout after 200ms]");
        assert_eq!(tail[n - 1], "=== END STRAGGLER (status=timeout) ===");
    }
}
