use crate::model::ControllerConfig;
use crate::orchestrator::Controller;
use crate::server;
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "seclab-controller",
    version,
    about = "Controller service for the classroom LLM security lab"
)]
pub struct Cli {
    /// Address the HTTP API listens on
    #[arg(long, env = "CONTROLLER_BIND", default_value = "0.0.0.0:8080")]
    pub bind: String,

    /// Lab repository root; demo commands run from here
    #[arg(long, env = "LAB_REPO_ROOT", default_value = ".")]
    pub repo_root: PathBuf,

    /// Directory holding demo logs (default: <repo>/controller_api/logs)
    #[arg(long, env = "CONTROLLER_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Settings file (default: <repo>/.env)
    #[arg(long, env = "CONTROLLER_SETTINGS_FILE")]
    pub settings_file: Option<PathBuf>,

    /// Metrics artifact written by the harness (default: <repo>/harness/results/metrics.json)
    #[arg(long, env = "CONTROLLER_METRICS_FILE")]
    pub metrics_file: Option<PathBuf>,

    /// Red-team results shown next to the metrics (default: <repo>/harness/results/redteam_results.json)
    #[arg(long, env = "CONTROLLER_REDTEAM_FILE")]
    pub redteam_file: Option<PathBuf>,

    /// Completion endpoint of the lab model
    #[arg(long, env = "LAB_ENDPOINT", default_value = "http://mock-llm:8000/complete")]
    pub lab_endpoint: String,

    /// Model runtime URL when running inside docker
    #[arg(long, env = "OLLAMA_DOCKER_URL", default_value = "http://ollama:11434")]
    pub ollama_docker_url: String,

    /// Model runtime URL when running on the host
    #[arg(long, env = "OLLAMA_LOCAL_URL", default_value = "http://127.0.0.1:11434")]
    pub ollama_local_url: String,

    /// Python interpreter used for demo scripts and the harness
    #[arg(long, env = "LAB_PYTHON", default_value = "python")]
    pub python: String,

    /// Docker CLI used for service restarts
    #[arg(long, env = "LAB_DOCKER", default_value = "docker")]
    pub docker: String,

    /// Lines kept in memory per log source
    #[arg(long, default_value_t = crate::logs::DEFAULT_CAPACITY)]
    pub log_capacity: usize,

    /// Metrics snapshots kept in history
    #[arg(long, default_value_t = crate::metrics::DEFAULT_HISTORY)]
    pub metrics_history: usize,

    /// Events queued per live viewer before it is dropped
    #[arg(long, default_value_t = crate::events::DEFAULT_QUEUE_DEPTH)]
    pub subscriber_queue: usize,

    /// How often log files are polled for external writes
    #[arg(long, default_value = "1s")]
    pub log_poll_interval: humantime::Duration,

    /// How long startup waits for the lab model before skipping the first metrics run
    #[arg(long, default_value = "45s")]
    pub lab_health_timeout: humantime::Duration,

    /// Use --bootstrap-metrics true or --bootstrap-metrics false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub bootstrap_metrics: bool,
}

/// Build a `ControllerConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> ControllerConfig {
    let mut cfg = ControllerConfig::rooted_at(args.repo_root.clone());
    if let Some(dir) = &args.log_dir {
        cfg.log_dir = dir.clone();
    }
    if let Some(path) = &args.settings_file {
        cfg.settings_path = path.clone();
    }
    if let Some(path) = &args.metrics_file {
        cfg.metrics_path = path.clone();
    }
    if let Some(path) = &args.redteam_file {
        cfg.redteam_path = path.clone();
    }
    cfg.lab_endpoint = args.lab_endpoint.clone();
    cfg.ollama_docker_url = args.ollama_docker_url.clone();
    cfg.ollama_local_url = args.ollama_local_url.clone();
    cfg.python = args.python.clone();
    cfg.docker = args.docker.clone();
    cfg.log_capacity = args.log_capacity;
    cfg.metrics_history = args.metrics_history;
    cfg.subscriber_queue = args.subscriber_queue;
    cfg.log_poll_interval = Duration::from(args.log_poll_interval);
    cfg.lab_health_timeout = Duration::from(args.lab_health_timeout);
    cfg.bootstrap_metrics = args.bootstrap_metrics;
    cfg
}

pub async fn run(args: Cli) -> Result<()> {
    let cfg = build_config(&args);
    tracing::debug!(?cfg, "configuration resolved");

    let controller = Controller::standard(cfg).context("failed to build controller")?;
    controller
        .start()
        .await
        .context("controller failed to start")?;

    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!("controller listening on http://{}", args.bind);

    axum::serve(listener, server::router(controller))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
