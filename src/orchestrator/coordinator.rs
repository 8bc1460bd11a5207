//! Run state machine and locking discipline.
//!
//! Per demo key: `Idle -> Running -> {Succeeded, Failed} -> Idle`. A key
//! cannot re-enter Running while it (or another key writing to the same log
//! source) is Running; there is no queueing. A separate global lock serializes
//! settings saves, service restarts and model operations against each other.

use crate::error::{ControllerError, Result};
use crate::events::EventBroadcaster;
use crate::model::{now_rfc3339, ControllerEvent, DemoKey, RunRecord, RunState, RunSummary};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

pub struct RunCoordinator {
    records: Mutex<BTreeMap<DemoKey, RunRecord>>,
    exclusive: Arc<tokio::sync::Mutex<()>>,
    events: EventBroadcaster,
}

/// Proof that a key is Running. Dropping it without `release` (a panicking
/// run task) still returns the key to Idle, marked Failed.
pub struct RunTicket {
    key: DemoKey,
    generation: u64,
    coordinator: Arc<RunCoordinator>,
    released: bool,
}

impl RunTicket {
    pub fn key(&self) -> DemoKey {
        self.key
    }

    /// Record the terminal state of the run.
    pub fn complete(&self, summary: &RunSummary, error: Option<String>) {
        self.coordinator
            .finish(self.key, self.generation, summary.state, summary, error);
    }

    /// Return the key to Idle.
    pub fn release(mut self) {
        self.released = true;
        self.coordinator.release(self.key, self.generation);
    }
}

impl Drop for RunTicket {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        tracing::error!(key = %self.key, "run ended without completing; marking failed");
        let summary = RunSummary {
            state: RunState::Failed,
            message: "run aborted".into(),
            steps: Vec::new(),
        };
        self.coordinator.finish(
            self.key,
            self.generation,
            RunState::Failed,
            &summary,
            Some("run task aborted".into()),
        );
        self.coordinator.release(self.key, self.generation);
    }
}

impl RunCoordinator {
    pub fn new(events: EventBroadcaster) -> Self {
        let records = DemoKey::ALL
            .into_iter()
            .map(|k| (k, RunRecord::idle(k)))
            .collect();
        Self {
            records: Mutex::new(records),
            exclusive: Arc::new(tokio::sync::Mutex::new(())),
            events,
        }
    }

    /// Move `key` to Running, or fail with `AlreadyRunning`.
    pub fn begin(self: &Arc<Self>, key: DemoKey) -> Result<RunTicket> {
        let mut records = self.records.lock();
        if let Some(holder) = records
            .values()
            .find(|r| r.state == RunState::Running && r.key.log_source() == key.log_source())
            .map(|r| r.key)
        {
            return Err(ControllerError::AlreadyRunning { key, holder });
        }

        let record = records.entry(key).or_insert_with(|| RunRecord::idle(key));
        record.generation += 1;
        record.state = RunState::Running;
        record.started_at = Some(now_rfc3339());
        record.finished_at = None;
        record.exit_info.clear();
        record.error = None;
        let generation = record.generation;
        self.events.publish(ControllerEvent::RunStatus {
            key,
            state: RunState::Running,
        });

        Ok(RunTicket {
            key,
            generation,
            coordinator: Arc::clone(self),
            released: false,
        })
    }

    fn finish(
        &self,
        key: DemoKey,
        generation: u64,
        state: RunState,
        summary: &RunSummary,
        error: Option<String>,
    ) {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(&key) else {
            return;
        };
        if record.generation != generation || record.state != RunState::Running {
            return;
        }
        record.state = state;
        record.last_outcome = Some(state);
        record.finished_at = Some(now_rfc3339());
        record.exit_info = summary.steps.clone();
        record.error = error;
        self.events.publish(ControllerEvent::RunStatus { key, state });
    }

    fn release(&self, key: DemoKey, generation: u64) {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(&key) else {
            return;
        };
        // A newer run may already own the key.
        if record.generation != generation || record.state == RunState::Idle {
            return;
        }
        record.state = RunState::Idle;
        self.events.publish(ControllerEvent::RunStatus {
            key,
            state: RunState::Idle,
        });
    }

    pub fn records(&self) -> Vec<RunRecord> {
        self.records.lock().values().cloned().collect()
    }

    pub fn record(&self, key: DemoKey) -> Option<RunRecord> {
        self.records.lock().get(&key).cloned()
    }

    /// Acquire the global lock guarding settings, services and model operations.
    pub async fn exclusive(&self, operation: &'static str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(&self.exclusive);
        if let Ok(guard) = lock.clone().try_lock_owned() {
            tracing::debug!(operation, "exclusive lock acquired");
            return guard;
        }
        tracing::info!(operation, "waiting for another exclusive operation to finish");
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn coordinator() -> (Arc<RunCoordinator>, EventBroadcaster) {
        let events = EventBroadcaster::new(64);
        (Arc::new(RunCoordinator::new(events.clone())), events)
    }

    fn summary(state: RunState) -> RunSummary {
        RunSummary {
            state,
            message: "done".into(),
            steps: Vec::new(),
        }
    }

    #[test]
    fn second_begin_is_rejected_until_release() {
        let (coord, _events) = coordinator();
        let ticket = coord.begin(DemoKey::Poisoning).unwrap();
        let err = coord.begin(DemoKey::Poisoning).err().unwrap();
        assert!(matches!(
            err,
            ControllerError::AlreadyRunning {
                key: DemoKey::Poisoning,
                holder: DemoKey::Poisoning
            }
        ));
        // The original run is unaffected.
        assert_eq!(
            coord.record(DemoKey::Poisoning).unwrap().state,
            RunState::Running
        );

        ticket.complete(&summary(RunState::Succeeded), None);
        assert_eq!(
            coord.record(DemoKey::Poisoning).unwrap().state,
            RunState::Succeeded
        );
        ticket.release();
        let rec = coord.record(DemoKey::Poisoning).unwrap();
        assert_eq!(rec.state, RunState::Idle);
        assert_eq!(rec.last_outcome, Some(RunState::Succeeded));
        assert!(coord.begin(DemoKey::Poisoning).is_ok());
    }

    #[test]
    fn keys_sharing_a_log_source_exclude_each_other() {
        let (coord, _events) = coordinator();
        let _ticket = coord.begin(DemoKey::Jailbreak).unwrap();
        let err = coord.begin(DemoKey::JailbreakDefense).err().unwrap();
        assert!(matches!(
            err,
            ControllerError::AlreadyRunning {
                holder: DemoKey::Jailbreak,
                ..
            }
        ));
        // Unrelated sources run in parallel.
        assert!(coord.begin(DemoKey::Redaction).is_ok());
    }

    #[test]
    fn transitions_are_published_in_order() {
        let (coord, events) = coordinator();
        let mut sub = events.subscribe();
        while sub.try_recv().is_some() {}

        let ticket = coord.begin(DemoKey::RagDefense).unwrap();
        ticket.complete(&summary(RunState::Failed), Some("exit 1".into()));
        ticket.release();

        let mut states = Vec::new();
        while let Some(ev) = sub.try_recv() {
            if let ControllerEvent::RunStatus { key: DemoKey::RagDefense, state } = ev {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![RunState::Running, RunState::Failed, RunState::Idle]
        );
    }

    #[test]
    fn dropped_ticket_fails_and_idles_the_key() {
        let (coord, _events) = coordinator();
        drop(coord.begin(DemoKey::Redaction).unwrap());
        let rec = coord.record(DemoKey::Redaction).unwrap();
        assert_eq!(rec.state, RunState::Idle);
        assert_eq!(rec.last_outcome, Some(RunState::Failed));
    }

    #[test]
    fn stale_release_does_not_clobber_newer_run() {
        let (coord, _events) = coordinator();
        let first = coord.begin(DemoKey::Poisoning).unwrap();
        first.complete(&summary(RunState::Succeeded), None);
        // Succeeded is not Running, so a new run may start before release.
        let second = coord.begin(DemoKey::Poisoning).unwrap();
        first.release();
        assert_eq!(
            coord.record(DemoKey::Poisoning).unwrap().state,
            RunState::Running
        );
        second.release();
    }

    #[tokio::test]
    async fn exclusive_lock_serializes_holders() {
        let (coord, _events) = coordinator();
        let guard = coord.exclusive("model_pull").await;
        let c2 = Arc::clone(&coord);
        let waiter = tokio::spawn(async move {
            let _g = c2.exclusive("settings_save").await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }
}
