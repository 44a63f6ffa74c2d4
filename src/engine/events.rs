//! Events emitted by the runner while it drives a run

use super::state::{DispatchStatus, EngineState, SkipReason};
use crate::journal::Scope;
use crate::routing::RouteKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EngineEvent {
    StateChanged {
        from: EngineState,
        to: EngineState,
        timestamp: DateTime<Utc>,
    },
    LevelPlanned {
        checks: Vec<String>,
        base_scope: Scope,
        event: Option<String>,
        forward: bool,
    },
    CheckStarted {
        check_id: String,
        scope: Scope,
        attempt: u32,
    },
    CheckCompleted {
        check_id: String,
        scope: Scope,
        status: DispatchStatus,
        attempt: u32,
        duration_ms: u64,
        issue_count: usize,
    },
    CheckSkipped {
        check_id: String,
        scope: Scope,
        reason: SkipReason,
    },
    CheckRetrying {
        check_id: String,
        scope: Scope,
        attempt: u32,
        backoff_ms: u64,
    },
    ForwardRunRequested {
        target: String,
        kind: RouteKind,
        scope: Scope,
        goto_event: Option<String>,
        origin: String,
    },
}

/// Collects every event of a run and mirrors it to an optional subscriber
#[derive(Debug, Default)]
pub struct EventBus {
    events: Vec<EngineEvent>,
    subscriber: Option<mpsc::UnboundedSender<EngineEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive a copy of every event emitted from now on
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriber = Some(tx);
        rx
    }

    pub fn emit(&mut self, event: EngineEvent) {
        if let Some(tx) = &self.subscriber {
            // A dropped receiver just stops the mirror
            if tx.send(event.clone()).is_err() {
                self.subscriber = None;
            }
        }
        self.events.push(event);
    }

    pub fn events(&self) -> &[EngineEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<EngineEvent> {
        self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriber_receives_events() {
        let mut bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(EngineEvent::CheckSkipped {
            check_id: "a".into(),
            scope: Scope::root(),
            reason: SkipReason::Assume,
        });
        assert_eq!(bus.events().len(), 1);
        assert!(matches!(rx.try_recv(), Ok(EngineEvent::CheckSkipped { .. })));
    }

    #[test]
    fn test_dropped_subscriber_keeps_collecting() {
        let mut bus = EventBus::new();
        drop(bus.subscribe());
        for _ in 0..2 {
            bus.emit(EngineEvent::CheckStarted {
                check_id: "a".into(),
                scope: Scope::root(),
                attempt: 1,
            });
        }
        assert_eq!(bus.into_events().len(), 2);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = EngineEvent::ForwardRunRequested {
            target: "fix".into(),
            kind: RouteKind::Goto,
            scope: Scope::root(),
            goto_event: None,
            origin: "lint".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "forward_run_requested");
        assert_eq!(json["kind"], "goto");
    }
}
