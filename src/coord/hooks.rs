//! Observer hooks for coordinator events
//!
//! Hooks consume a subscription on their own task, so they can call back into
//! the coordinator without contending with the caller that produced the event.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::events::{CoordinatorEvent, EventEnvelope, EventReceiver};
use super::types::ExecutionStatus;

/// Event hook trait - observes coordinator events in publication order
#[async_trait]
pub trait EventHook: Send + Sync {
    /// Handle one event
    async fn handle(&self, envelope: &EventEnvelope);

    /// Optional: Called once the subscription has ended
    async fn on_close(&self) {}
}

/// Drive `hook` with every event from `events` until the stream ends.
pub fn spawn_hook(mut events: EventReceiver, hook: Arc<dyn EventHook>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = events.recv().await {
            hook.handle(&envelope).await;
        }
        hook.on_close().await;
    })
}

/// Composite hook that chains multiple hooks
#[derive(Default)]
pub struct CompositeHook {
    hooks: Vec<Arc<dyn EventHook>>,
}

impl CompositeHook {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn add_hook(&mut self, hook: Arc<dyn EventHook>) {
        self.hooks.push(hook);
    }
}

#[async_trait]
impl EventHook for CompositeHook {
    async fn handle(&self, envelope: &EventEnvelope) {
        for hook in &self.hooks {
            hook.handle(envelope).await;
        }
    }

    async fn on_close(&self) {
        for hook in &self.hooks {
            hook.on_close().await;
        }
    }
}

/// Logs every event through tracing
pub struct LoggingHook;

#[async_trait]
impl EventHook for LoggingHook {
    async fn handle(&self, envelope: &EventEnvelope) {
        match &envelope.event {
            CoordinatorEvent::ExecuteNextPhase {
                entity_id,
                phase,
                context,
            } => {
                tracing::info!(
                    "Execute next phase: {} -> {} (retry {})",
                    entity_id,
                    phase,
                    context.retry_count
                );
            }
            CoordinatorEvent::PhaseStarted {
                entity_id,
                phase,
                agent_handle,
            } => {
                tracing::info!("Phase started: {} {} [{}]", entity_id, phase, agent_handle);
            }
            CoordinatorEvent::StateChanged { entity_id, state } => match state.status {
                ExecutionStatus::Error => {
                    let last = state.errors.last().map(|e| e.message.as_str()).unwrap_or("");
                    tracing::error!("Execution error: {} - {}", entity_id, last);
                }
                status => tracing::info!("State changed: {} - {:?}", entity_id, status),
            },
        }
    }
}

/// A buffering hook that collects events
#[derive(Default, Clone)]
pub struct BufferingHook {
    events: Arc<RwLock<Vec<EventEnvelope>>>,
}

impl BufferingHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_events(&self) -> Vec<EventEnvelope> {
        self.events.read().clone()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

#[async_trait]
impl EventHook for BufferingHook {
    async fn handle(&self, envelope: &EventEnvelope) {
        self.events.write().push(envelope.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::types::WorkflowPhase;
    use tokio::sync::mpsc;

    fn envelope(sequence: u64) -> EventEnvelope {
        EventEnvelope {
            sequence,
            timestamp: 0,
            event: CoordinatorEvent::PhaseStarted {
                entity_id: "bugs/a".to_string(),
                phase: WorkflowPhase::Analyze,
                agent_handle: format!("agent-{}", sequence),
            },
        }
    }

    #[tokio::test]
    async fn test_spawn_hook_drains_until_close() {
        let (tx, rx) = mpsc::unbounded_channel();
        let buffer = BufferingHook::new();

        let mut composite = CompositeHook::new();
        composite.add_hook(Arc::new(LoggingHook));
        composite.add_hook(Arc::new(buffer.clone()));

        let handle = spawn_hook(rx, Arc::new(composite));
        tx.send(envelope(0)).unwrap();
        tx.send(envelope(1)).unwrap();
        drop(tx);
        handle.await.unwrap();

        let sequences: Vec<u64> = buffer.get_events().iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![0, 1]);

        buffer.clear();
        assert!(buffer.get_events().is_empty());
    }
}
