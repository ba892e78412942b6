// Event bus for orchestrator lifecycle events and external signals

//! # Event Bus
//!
//! A broadcast bus connecting the orchestrator to the outside world in both
//! directions: lifecycle events (run started/completed/failed, breaker
//! transitions, approvals requested) flow out to any subscriber, and
//! external signals flow in to fire event- and threshold-triggered
//! workflows.
//!
//! External monitors deliver threshold breaches through the same
//! [`EventBus::signal`] path as plain business events; the orchestrator
//! owns no metric-evaluation logic.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::breaker::BreakerState;

/// An orchestrator lifecycle event or inbound signal.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum OrchestratorEvent {
    RunStarted {
        run_id: Uuid,
        workflow_id: String,
    },
    RunCompleted {
        run_id: Uuid,
        workflow_id: String,
        items_succeeded: u64,
        items_failed: u64,
    },
    RunFailed {
        run_id: Uuid,
        workflow_id: String,
        error: String,
        will_retry: bool,
    },
    RunDeadLettered {
        run_id: Uuid,
        workflow_id: String,
    },
    ApprovalRequested {
        run_id: Uuid,
        workflow_id: String,
        level: u8,
        amount: f64,
    },
    ApprovalEscalated {
        run_id: Uuid,
        level: u8,
    },
    BreakerStateChanged {
        state: BreakerState,
    },
    ExceptionRaised {
        exception_id: Uuid,
        exception_type: String,
    },
    /// Inbound: an external system fired a named signal. Event- and
    /// threshold-triggered workflows listening for this name dispatch.
    ExternalSignal {
        event_name: String,
        at: DateTime<Utc>,
    },
}

/// Broadcast bus for orchestrator events.
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        EventBus { sender }
    }

    /// Publish an event to all subscribers. Lossy when nobody listens;
    /// lifecycle events are observability, not state.
    pub fn publish(&self, event: OrchestratorEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }

    /// Deliver an external signal by name.
    pub fn signal<S: Into<String>>(&self, event_name: S) {
        self.publish(OrchestratorEvent::ExternalSignal {
            event_name: event_name.into(),
            at: Utc::now(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        EventBus {
            sender: self.sender.clone(),
        }
    }
}
