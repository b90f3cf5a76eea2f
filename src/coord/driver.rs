//! Launcher wiring
//!
//! `AgentLauncher` is the interface the coordinator expects from whatever
//! actually spawns agent processes. `PhaseDriver` connects one to a
//! coordinator: it reacts to `ExecuteNextPhase`, attaches the agent handle
//! and reports the outcome back.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::coordinator::Coordinator;
use super::events::{CoordinatorEvent, EventReceiver};
use super::types::{AgentOutcome, PhaseContext, WorkflowPhase};

/// A phase the coordinator wants executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseRequest {
    pub entity_id: String,
    pub phase: WorkflowPhase,
    pub context: PhaseContext,
}

/// Spawns and supervises agents on behalf of the coordinator
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    /// Start an agent for the request and return its handle
    async fn launch(&self, request: &PhaseRequest) -> anyhow::Result<String>;

    /// Wait for the agent to exit
    async fn wait(&self, agent_handle: &str) -> AgentOutcome;

    /// Optional: Stop an agent nobody is waiting for anymore
    async fn cancel(&self, _agent_handle: &str) {}
}

/// Runs every dispatched phase through an `AgentLauncher`
pub struct PhaseDriver {
    coordinator: Coordinator,
    launcher: Arc<dyn AgentLauncher>,
}

impl PhaseDriver {
    pub fn new(coordinator: Coordinator, launcher: Arc<dyn AgentLauncher>) -> Self {
        Self {
            coordinator,
            launcher,
        }
    }

    /// Subscribe now and process events on a background task.
    ///
    /// The task ends when the coordinator is disposed.
    pub fn spawn(self) -> JoinHandle<()> {
        let events = self.coordinator.subscribe();
        tokio::spawn(self.run(events))
    }

    async fn run(self, mut events: EventReceiver) {
        while let Some(envelope) = events.recv().await {
            if let CoordinatorEvent::ExecuteNextPhase {
                entity_id,
                phase,
                context,
            } = envelope.event
            {
                let request = PhaseRequest {
                    entity_id,
                    phase,
                    context,
                };
                tokio::spawn(run_phase(
                    self.coordinator.clone(),
                    self.launcher.clone(),
                    request,
                ));
            }
        }
        debug!("Phase driver stopped: event stream closed");
    }
}

async fn run_phase(
    coordinator: Coordinator,
    launcher: Arc<dyn AgentLauncher>,
    request: PhaseRequest,
) {
    let entity_id = request.entity_id.as_str();
    let dispatch_id = request.context.dispatch_id;

    let agent_handle = match launcher.launch(&request).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!("Failed to launch {} for {}: {}", request.phase, entity_id, e);
            let reason = format!("launch failed: {}", e);
            if let Err(e) = coordinator.fail_dispatch(entity_id, dispatch_id, &reason) {
                debug!("Launch failure for {} not recorded: {}", entity_id, e);
            }
            return;
        }
    };

    // Subscribed before attaching so nothing published after the attach is missed.
    let mut events = coordinator.subscribe();
    if coordinator
        .attach_agent(entity_id, dispatch_id, request.phase, &agent_handle)
        .is_none()
    {
        info!(
            "{} is no longer waiting for dispatch {}, cancelling agent {}",
            entity_id, dispatch_id, agent_handle
        );
        launcher.cancel(&agent_handle).await;
        return;
    }

    let outcome = tokio::select! {
        outcome = launcher.wait(&agent_handle) => outcome,
        _ = superseded(&mut events, entity_id, &agent_handle) => {
            info!("Agent {} for {} superseded, cancelling", agent_handle, entity_id);
            launcher.cancel(&agent_handle).await;
            return;
        }
    };
    drop(events);

    if let Err(e) = coordinator.handle_agent_completed(&agent_handle, entity_id, outcome) {
        debug!("Completion of {} not applied: {}", agent_handle, e);
    }
}

/// Resolves once `agent_handle` is no longer the running agent of `entity_id`:
/// timed out, stopped, retried, replaced, or the coordinator disposed.
async fn superseded(events: &mut EventReceiver, entity_id: &str, agent_handle: &str) {
    while let Some(envelope) = events.recv().await {
        if envelope.event.entity_id() != entity_id {
            continue;
        }
        let still_current = match &envelope.event {
            CoordinatorEvent::PhaseStarted {
                agent_handle: started,
                ..
            } => started == agent_handle,
            CoordinatorEvent::StateChanged { state, .. } => {
                state.is_running() && state.agent_handle.as_deref() == Some(agent_handle)
            }
            CoordinatorEvent::ExecuteNextPhase { .. } => false,
        };
        if !still_current {
            return;
        }
    }
}
