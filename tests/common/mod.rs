#![allow(dead_code)]

use seclab_controller::engine::{CommandSpec, DemoCatalog};
use seclab_controller::model::{ControllerConfig, ControllerEvent, DemoKey};
use seclab_controller::orchestrator::Controller;
use std::path::Path;
use std::sync::Arc;

pub const GOOD_ARTIFACT: &str =
    r#"{"metrics": {"asr": 0.33, "leakage_count": 4, "detection_latency_ms": 12.5, "total_prompts": 12}}"#;

pub fn sh(label: &str, script: &str, timeout_secs: u64) -> CommandSpec {
    CommandSpec::new(label, "sh", &["-c", script], timeout_secs)
}

/// A lab rooted in a temp dir whose collaborators are shell one-liners.
/// The harness copies `artifact.json` from the repo root into place.
pub fn lab() -> (tempfile::TempDir, Arc<Controller>) {
    lab_with(|_| {})
}

/// Same as `lab`, with the configuration adjusted before the controller is built.
pub fn lab_with(configure: impl FnOnce(&mut ControllerConfig)) -> (tempfile::TempDir, Arc<Controller>) {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = ControllerConfig::rooted_at(dir.path());
    configure(&mut cfg);
    let catalog = DemoCatalog::standard(&cfg)
        .with_steps(
            DemoKey::Poisoning,
            vec![sh(
                "POISONING_RUN",
                "echo 'poisoned doc 1'; echo 'poisoned doc 2'",
                10,
            )],
        )
        .with_steps(
            DemoKey::Jailbreak,
            vec![sh("JAILBREAK_BYPASS", "echo \"strict=$STRICT_MODE\"", 10)],
        )
        .with_steps(DemoKey::Redaction, vec![sh("REDACTION_RUN", "sleep 1; echo done", 10)])
        .with_steps(
            DemoKey::RagDefense,
            vec![sh("RAG_DEFENDED", "echo 'blocked' >&2; exit 2", 10)],
        )
        .with_steps(
            DemoKey::RagInjection,
            vec![
                sh("RAG_BUILD", "echo built", 10),
                CommandSpec::new("RAG_RUN", "seclab-no-such-binary", &[], 5),
            ],
        )
        .with_harness(sh(
            "ORCHESTRATE",
            "mkdir -p harness/results && cp artifact.json harness/results/metrics.json",
            10,
        ));
    let controller = Controller::new(cfg, catalog).unwrap();
    (dir, controller)
}

pub fn write_artifact(root: &Path, contents: &str) {
    std::fs::write(root.join("artifact.json"), contents).unwrap();
}

/// Everything queued on a subscription right now.
pub fn drain(sub: &mut seclab_controller::events::Subscription) -> Vec<ControllerEvent> {
    let mut out = Vec::new();
    while let Some(ev) = sub.try_recv() {
        out.push(ev);
    }
    out
}
