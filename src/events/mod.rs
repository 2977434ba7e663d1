//! # Run event stream
//!
//! One logical stream per process. The run task publishes inline and must
//! stay snappy, so delivery is fan-out over a bounded broadcast channel:
//! each subscriber owns an independent cursor, slow subscribers lose the
//! *oldest* events, and the loss is surfaced in-band as a synthetic
//! `stream:dropped` event so downstream tooling can reconcile.
//!
//! Subscribers register with a topic prefix (`run:`, `step:`, `console`,
//! `network`, `suite:`, `debug:`); the empty prefix receives everything.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::evidence::{ConsoleMessage, NetworkResponse};
use crate::protocol::{RunStatus, Section};

/// Queue depth per subscriber before drop-oldest kicks in.
pub const DEFAULT_CAPACITY: usize = 256;

/// Everything the engine publishes. `type` is the wire discriminator and
/// doubles as the subscription topic.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum RunEvent {
    #[serde(rename = "run:start")]
    RunStart { test_id: String, run_id: String },

    #[serde(rename = "run:complete")]
    RunComplete {
        test_id: String,
        run_id: String,
        status: RunStatus,
    },

    #[serde(rename = "step:start")]
    StepStart {
        step_index: usize,
        section: Section,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },

    #[serde(rename = "step:pass")]
    StepPass {
        step_index: usize,
        section: Section,
        duration_ms: u64,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        skipped: bool,
    },

    #[serde(rename = "step:fail")]
    StepFail {
        step_index: usize,
        section: Section,
        duration_ms: u64,
        error: String,
    },

    #[serde(rename = "debug:paused")]
    DebugPaused { step_index: usize },

    #[serde(rename = "debug:resumed")]
    DebugResumed { step_index: usize },

    #[serde(rename = "console")]
    Console { message: ConsoleMessage },

    #[serde(rename = "network")]
    Network { response: NetworkResponse },

    /// Synthetic: inserted on a subscriber's stream after it lost `count`
    /// events to overflow. Never published by the engine itself.
    #[serde(rename = "stream:dropped")]
    StreamDropped { count: u64 },
}

impl RunEvent {
    /// The wire `type`, used for prefix subscription matching.
    pub fn topic(&self) -> &'static str {
        match self {
            RunEvent::RunStart { .. } => "run:start",
            RunEvent::RunComplete { .. } => "run:complete",
            RunEvent::StepStart { .. } => "step:start",
            RunEvent::StepPass { .. } => "step:pass",
            RunEvent::StepFail { .. } => "step:fail",
            RunEvent::DebugPaused { .. } => "debug:paused",
            RunEvent::DebugResumed { .. } => "debug:resumed",
            RunEvent::Console { .. } => "console",
            RunEvent::Network { .. } => "network",
            RunEvent::StreamDropped { .. } => "stream:dropped",
        }
    }
}

/// Fan-out hub. Cloning shares the underlying channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event. Never blocks and never fails: with no
    /// subscribers the event simply evaporates.
    pub fn emit(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribes with a topic prefix. A trailing `*` is accepted and
    /// ignored, so `"step:*"` and `"step:"` are the same subscription.
    pub fn subscribe(&self, prefix: &str) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            prefix: prefix.trim_end_matches('*').to_string(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's cursor. Dropping it unsubscribes.
pub struct EventSubscription {
    rx: broadcast::Receiver<RunEvent>,
    prefix: String,
}

impl EventSubscription {
    fn wants(&self, event: &RunEvent) -> bool {
        // Drop notices always come through, whatever the filter.
        matches!(event, RunEvent::StreamDropped { .. }) || event.topic().starts_with(&self.prefix)
    }

    /// Next matching event, or `None` once the hub is gone. A lagged
    /// cursor yields `stream:dropped` before resuming with the oldest
    /// retained event.
    pub async fn next(&mut self) -> Option<RunEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Some(RunEvent::StreamDropped { count })
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant used by tests to drain what is already queued.
    pub fn try_next(&mut self) -> Option<RunEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(count)) => {
                    return Some(RunEvent::StreamDropped { count })
                }
                Err(_) => return None,
            }
        }
    }

    /// Drains every queued matching event.
    pub fn drain(&mut self) -> Vec<RunEvent> {
        let mut out = Vec::new();
        while let Some(event) = self.try_next() {
            out.push(event);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_pass(i: usize) -> RunEvent {
        RunEvent::StepPass {
            step_index: i,
            section: Section::Steps,
            duration_ms: 1,
            skipped: false,
        }
    }

    #[tokio::test]
    async fn test_fifo_delivery_per_subscriber() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("");
        bus.emit(RunEvent::RunStart {
            test_id: "t".into(),
            run_id: "r".into(),
        });
        bus.emit(step_pass(0));
        let events = sub.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].topic(), "run:start");
        assert_eq!(events[1].topic(), "step:pass");
    }

    #[tokio::test]
    async fn test_prefix_filter() {
        let bus = EventBus::new();
        let mut steps_only = bus.subscribe("step:*");
        bus.emit(RunEvent::RunStart {
            test_id: "t".into(),
            run_id: "r".into(),
        });
        bus.emit(step_pass(0));
        let events = steps_only.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].topic(), "step:pass");
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_and_reports() {
        let bus = EventBus::with_capacity(4);
        let mut sub = bus.subscribe("");
        for i in 0..10 {
            bus.emit(step_pass(i));
        }
        let events = sub.drain();
        match &events[0] {
            RunEvent::StreamDropped { count } => assert_eq!(*count, 6),
            other => panic!("expected stream:dropped first, got {:?}", other),
        }
        // The oldest retained event follows the drop notice.
        match &events[1] {
            RunEvent::StepPass { step_index, .. } => assert_eq!(*step_index, 6),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(events.len(), 5);
    }

    #[tokio::test]
    async fn test_independent_subscriber_cursors() {
        let bus = EventBus::new();
        let mut a = bus.subscribe("");
        bus.emit(step_pass(0));
        let mut b = bus.subscribe("");
        bus.emit(step_pass(1));
        assert_eq!(a.drain().len(), 2);
        // b subscribed late and only sees the second event.
        assert_eq!(b.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_evidence_events_serialize_with_bare_topics() {
        let console = RunEvent::Console {
            message: ConsoleMessage {
                level: "error".into(),
                text: "boom".into(),
                timestamp: 7,
            },
        };
        assert_eq!(console.topic(), "console");
        let v = serde_json::to_value(&console).unwrap();
        assert_eq!(v["type"], "console");
        assert_eq!(v["message"]["type"], "error");

        let network = RunEvent::Network {
            response: NetworkResponse {
                url: "http://x".into(),
                method: "GET".into(),
                status: 404,
                duration_ms: 3,
            },
        };
        assert_eq!(network.topic(), "network");
        let v = serde_json::to_value(&network).unwrap();
        assert_eq!(v["response"]["status"], 404);
    }

    #[tokio::test]
    async fn test_serialized_event_shape() {
        let event = RunEvent::StepFail {
            step_index: 3,
            section: Section::Steps,
            duration_ms: 12,
            error: "boom".into(),
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "step:fail");
        assert_eq!(v["step_index"], 3);
        assert_eq!(v["section"], "steps");
        assert_eq!(v["error"], "boom");
    }
}
