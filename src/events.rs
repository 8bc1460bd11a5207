//! Fan-out of controller events to live viewers.
//!
//! Each subscriber owns a bounded queue. Publishing never waits: a subscriber
//! whose queue is full is dropped instead of stalling everyone else, and the
//! client is expected to reconnect and receive a fresh replay.

use crate::model::{ControllerEvent, DemoKey, MetricsSnapshot, RunState};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;

pub const DEFAULT_QUEUE_DEPTH: usize = 256;

struct Inner {
    next_id: u64,
    subscribers: BTreeMap<u64, mpsc::Sender<ControllerEvent>>,
    // Replay state, updated as events pass through publish.
    latest_metrics: Option<MetricsSnapshot>,
    run_states: BTreeMap<DemoKey, RunState>,
}

impl Inner {
    fn observe(&mut self, event: &ControllerEvent) {
        match event {
            ControllerEvent::Metrics { snapshot } => {
                self.latest_metrics = Some(snapshot.clone());
            }
            ControllerEvent::RunStatus { key, state } => {
                self.run_states.insert(*key, *state);
            }
            _ => {}
        }
    }

    fn replay(&self) -> Vec<ControllerEvent> {
        let mut out = Vec::with_capacity(self.run_states.len() + 1);
        if let Some(snapshot) = self.latest_metrics.clone() {
            out.push(ControllerEvent::Metrics { snapshot });
        }
        out.extend(
            self.run_states
                .iter()
                .map(|(key, state)| ControllerEvent::RunStatus {
                    key: *key,
                    state: *state,
                }),
        );
        out
    }
}

#[derive(Clone)]
pub struct EventBroadcaster {
    inner: Arc<Mutex<Inner>>,
    queue_depth: usize,
}

/// Receiving half handed to a connected viewer.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<ControllerEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<ControllerEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ControllerEvent> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> ReceiverStream<ControllerEvent> {
        ReceiverStream::new(self.rx)
    }
}

impl EventBroadcaster {
    pub fn new(queue_depth: usize) -> Self {
        let run_states = DemoKey::ALL
            .into_iter()
            .map(|k| (k, RunState::Idle))
            .collect();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 1,
                subscribers: BTreeMap::new(),
                latest_metrics: None,
                run_states,
            })),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Register a viewer and queue the current state ahead of any live event.
    pub fn subscribe(&self) -> Subscription {
        let mut inner = self.inner.lock();
        let replay = inner.replay();
        let (tx, rx) = mpsc::channel(self.queue_depth.max(replay.len() + 1));
        for event in replay {
            // Capacity covers the replay, so this cannot fail.
            let _ = tx.try_send(event);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(id, tx);
        tracing::debug!(subscriber = id, total = inner.subscribers.len(), "viewer subscribed");
        Subscription { id, rx }
    }

    /// Deliver an event to every live subscriber in call order.
    pub fn publish(&self, event: ControllerEvent) {
        let mut inner = self.inner.lock();
        inner.observe(&event);
        inner.subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(subscriber = id, "dropping viewer that cannot keep up");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(subscriber = id, "viewer disconnected");
                false
            }
        });
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner.lock().subscribers.remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn latest_metrics(&self) -> Option<MetricsSnapshot> {
        self.inner.lock().latest_metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogSourceId;

    fn line(s: &str) -> ControllerEvent {
        ControllerEvent::Log {
            source: LogSourceId::Poisoning,
            line: s.into(),
        }
    }

    fn drain(sub: &mut Subscription) -> Vec<ControllerEvent> {
        let mut out = Vec::new();
        while let Some(ev) = sub.try_recv() {
            out.push(ev);
        }
        out
    }

    fn log_lines(events: &[ControllerEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                ControllerEvent::Log { line, .. } => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn new_subscriber_gets_run_status_replay() {
        let bus = EventBroadcaster::new(8);
        bus.publish(ControllerEvent::RunStatus {
            key: DemoKey::Poisoning,
            state: RunState::Running,
        });
        let mut sub = bus.subscribe();
        let replay = drain(&mut sub);
        assert_eq!(replay.len(), DemoKey::ALL.len());
        assert!(replay.iter().any(|e| matches!(
            e,
            ControllerEvent::RunStatus {
                key: DemoKey::Poisoning,
                state: RunState::Running
            }
        )));
    }

    #[test]
    fn replay_includes_latest_metrics_first() {
        let bus = EventBroadcaster::new(8);
        bus.publish(ControllerEvent::Metrics {
            snapshot: MetricsSnapshot {
                asr: 0.5,
                leakage_count: 1,
                detection_latency_ms: 3.0,
                total_prompts: 4,
                timestamp: "t".into(),
            },
        });
        let mut sub = bus.subscribe();
        let first = sub.try_recv().unwrap();
        assert!(matches!(first, ControllerEvent::Metrics { snapshot } if snapshot.asr == 0.5));
    }

    #[test]
    fn every_subscriber_sees_append_order() {
        let bus = EventBroadcaster::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        for s in ["a", "b", "c"] {
            bus.publish(line(s));
        }
        assert_eq!(log_lines(&drain(&mut a)), vec!["a", "b", "c"]);
        assert_eq!(log_lines(&drain(&mut b)), vec!["a", "b", "c"]);
    }

    #[test]
    fn slow_subscriber_is_dropped_without_affecting_others() {
        let bus = EventBroadcaster::new(DemoKey::ALL.len() + 2);
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();
        drain(&mut fast);

        for i in 0..10 {
            bus.publish(line(&i.to_string()));
            drain(&mut fast);
        }
        assert_eq!(bus.subscriber_count(), 1);

        // The slow viewer still drains what was queued, then sees the end of stream.
        let queued = drain(&mut slow);
        assert!(!queued.is_empty());
        bus.publish(line("after"));
        assert_eq!(log_lines(&drain(&mut fast)), vec!["after"]);
    }

    #[test]
    fn closed_subscriber_is_pruned_on_next_publish() {
        let bus = EventBroadcaster::new(8);
        let sub = bus.subscribe();
        drop(sub);
        bus.publish(line("x"));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
