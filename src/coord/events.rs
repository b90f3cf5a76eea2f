//! Events published by the coordinator
//!
//! Three event kinds, wrapped in a sequence-numbered envelope. Envelopes are
//! serialisable so an outer transport can forward them as-is.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::types::{ExecutionState, PhaseContext, WorkflowPhase};

/// Coordinator event kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CoordinatorEvent {
    /// The launcher should start an agent for `phase`
    #[serde(rename_all = "camelCase")]
    ExecuteNextPhase {
        entity_id: String,
        phase: WorkflowPhase,
        context: PhaseContext,
    },
    /// An agent has been attached to `phase`
    #[serde(rename_all = "camelCase")]
    PhaseStarted {
        entity_id: String,
        phase: WorkflowPhase,
        agent_handle: String,
    },
    /// The entity's status changed outside normal phase dispatch
    #[serde(rename_all = "camelCase")]
    StateChanged {
        entity_id: String,
        state: ExecutionState,
    },
}

impl CoordinatorEvent {
    pub fn entity_id(&self) -> &str {
        match self {
            CoordinatorEvent::ExecuteNextPhase { entity_id, .. }
            | CoordinatorEvent::PhaseStarted { entity_id, .. }
            | CoordinatorEvent::StateChanged { entity_id, .. } => entity_id,
        }
    }

    /// Wire name of the event kind
    pub fn kind(&self) -> &'static str {
        match self {
            CoordinatorEvent::ExecuteNextPhase { .. } => "execute-next-phase",
            CoordinatorEvent::PhaseStarted { .. } => "phase-started",
            CoordinatorEvent::StateChanged { .. } => "state-changed",
        }
    }
}

/// Event envelope with metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Monotonic per coordinator; follows the order of table mutations
    pub sequence: u64,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub event: CoordinatorEvent,
}

impl EventEnvelope {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Receiving end of a coordinator subscription
pub type EventReceiver = mpsc::UnboundedReceiver<EventEnvelope>;

/// Fan-out list of subscribers. Closed receivers are pruned on publish.
#[derive(Default)]
pub(crate) struct EventBus {
    subscribers: Vec<mpsc::UnboundedSender<EventEnvelope>>,
    next_sequence: u64,
}

impl EventBus {
    pub(crate) fn subscribe(&mut self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub(crate) fn publish(&mut self, event: CoordinatorEvent) {
        let envelope = EventEnvelope {
            sequence: self.next_sequence,
            timestamp: chrono::Utc::now().timestamp_millis(),
            event,
        };
        self.next_sequence += 1;

        tracing::trace!(
            "Publishing {} #{} for {}",
            envelope.event.kind(),
            envelope.sequence,
            envelope.event.entity_id()
        );
        self.subscribers
            .retain(|tx| tx.send(envelope.clone()).is_ok());
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Drop every sender so receivers observe end-of-stream.
    pub(crate) fn close(&mut self) {
        self.subscribers.clear();
    }
}
