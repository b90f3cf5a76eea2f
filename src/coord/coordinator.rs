//! Coordinator - per-entity auto-execution
//!
//! Owns the table of active entities and drives each one through its
//! permitted phases, one agent invocation per phase. All table mutations and
//! event publication happen under a single lock, so events reach subscribers
//! in exactly the order the table changed.
//!
//! The coordinator never awaits an agent. It publishes `ExecuteNextPhase` and
//! returns; the launcher reports back through `set_current_phase` and
//! `handle_agent_completed`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::coord::events::{CoordinatorEvent, EventBus, EventReceiver};
use crate::coord::phase::next_permitted_phase;
use crate::coord::types::{
    AgentOutcome, ExecutionState, ExecutionStatus, PhaseContext, PhasePermissions, StartOptions,
    WorkflowPhase,
};
use crate::core::config::CoordinatorConfig;
use crate::core::errors::{CoordinatorError, Result};

/// Table entry: the public state plus the bookkeeping that stays private.
struct Entry {
    state: ExecutionState,
    permissions: PhasePermissions,
    timer: Option<AbortHandle>,
    /// Bumped on every arm and cancel; a firing timer must match it.
    timer_generation: u64,
    /// Identifies the current dispatch; unique across the coordinator's lifetime.
    dispatch_id: u64,
}

impl Entry {
    fn new(state: ExecutionState, permissions: PhasePermissions, dispatch_id: u64) -> Self {
        Self {
            state,
            permissions,
            timer: None,
            timer_generation: 0,
            dispatch_id,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.timer_generation += 1;
    }
}

#[derive(Default)]
struct Table {
    entries: HashMap<String, Entry>,
    bus: EventBus,
    disposed: bool,
    next_dispatch_id: u64,
}

struct Shared {
    config: CoordinatorConfig,
    runtime: Handle,
    table: Mutex<Table>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        for entry in self.table.get_mut().entries.values_mut() {
            entry.cancel_timer();
        }
    }
}

/// Per-entity auto-execution coordinator. Cheap to clone; clones share one table.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    /// Create a coordinator bound to the current tokio runtime.
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| CoordinatorError::NoRuntime)?;

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                runtime,
                table: Mutex::new(Table::default()),
            }),
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(CoordinatorConfig::default())
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    /// Register a listener. Every event published afterwards is delivered in order.
    pub fn subscribe(&self) -> EventReceiver {
        let mut table = self.shared.table.lock();
        if table.disposed {
            let (_, rx) = mpsc::unbounded_channel();
            return rx;
        }
        table.bus.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.shared.table.lock().bus.subscriber_count()
    }

    /// Start auto-execution at the first permitted phase after `last_completed_phase`.
    pub fn start(
        &self,
        entity_id: &str,
        entity_name: &str,
        options: StartOptions,
        last_completed_phase: Option<WorkflowPhase>,
    ) -> Result<ExecutionState> {
        let mut guard = self.shared.table.lock();
        let table = &mut *guard;
        if table.disposed {
            return Err(CoordinatorError::Disposed);
        }

        if table.entries.contains_key(entity_id) {
            return Err(CoordinatorError::AlreadyExecuting {
                entity_id: entity_id.to_string(),
            });
        }

        let limit = self.shared.config.max_concurrent;
        if table.entries.len() >= limit {
            warn!("Rejecting start for {}: {} executions active", entity_id, limit);
            return Err(CoordinatorError::MaxConcurrentReached { limit });
        }

        let first_phase = next_permitted_phase(last_completed_phase, &options.permissions)
            .ok_or_else(|| CoordinatorError::NoPhaseToRun {
                entity_id: entity_id.to_string(),
                after: last_completed_phase,
            })?;

        let state = ExecutionState::new(entity_id, entity_name, first_phase);
        let dispatch_id = issue_dispatch(&mut table.next_dispatch_id);
        let mut entry = Entry::new(state, options.permissions, dispatch_id);
        self.arm_timer(&mut entry);

        let snapshot = entry.state.clone();
        table.entries.insert(entity_id.to_string(), entry);
        table.bus.publish(CoordinatorEvent::ExecuteNextPhase {
            entity_id: entity_id.to_string(),
            phase: first_phase,
            context: PhaseContext::for_state(&snapshot, dispatch_id, false),
        });

        info!(
            "Started auto-execution for {} at phase {} (after {:?})",
            entity_id, first_phase, last_completed_phase
        );
        Ok(snapshot)
    }

    /// Cancel an entity's run and forget it.
    pub fn stop(&self, entity_id: &str) -> Result<()> {
        let mut guard = self.shared.table.lock();
        let table = &mut *guard;
        if table.disposed {
            return Err(CoordinatorError::Disposed);
        }

        let mut entry =
            table
                .entries
                .remove(entity_id)
                .ok_or_else(|| CoordinatorError::NotExecuting {
                    entity_id: entity_id.to_string(),
                })?;
        entry.cancel_timer();

        let previous = entry.state.status;
        table.bus.publish(CoordinatorEvent::StateChanged {
            entity_id: entity_id.to_string(),
            state: entry.state.into_idle(),
        });

        info!("Stopped auto-execution for {} (was {:?})", entity_id, previous);
        Ok(())
    }

    pub fn get_status(&self, entity_id: &str) -> Option<ExecutionState> {
        let table = self.shared.table.lock();
        table.entries.get(entity_id).map(|entry| entry.state.clone())
    }

    /// Consistent snapshot of every active entity.
    pub fn get_all_statuses(&self) -> HashMap<String, ExecutionState> {
        let table = self.shared.table.lock();
        table
            .entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.state.clone()))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.shared.table.lock().entries.len()
    }

    /// Attach the launcher's agent handle to the dispatched phase and restart its timeout.
    ///
    /// Returns `None` without side effects when the entity is absent or not running.
    pub fn set_current_phase(
        &self,
        entity_id: &str,
        phase: WorkflowPhase,
        agent_handle: &str,
    ) -> Option<ExecutionState> {
        self.attach(entity_id, None, phase, agent_handle)
    }

    /// Like `set_current_phase`, but only while `dispatch_id` is the entity's current dispatch.
    pub fn attach_agent(
        &self,
        entity_id: &str,
        dispatch_id: u64,
        phase: WorkflowPhase,
        agent_handle: &str,
    ) -> Option<ExecutionState> {
        self.attach(entity_id, Some(dispatch_id), phase, agent_handle)
    }

    fn attach(
        &self,
        entity_id: &str,
        dispatch_id: Option<u64>,
        phase: WorkflowPhase,
        agent_handle: &str,
    ) -> Option<ExecutionState> {
        let mut guard = self.shared.table.lock();
        let table = &mut *guard;
        if table.disposed {
            return None;
        }

        let Some(entry) = table.entries.get_mut(entity_id) else {
            debug!("Ignoring phase {} for unknown entity {}", phase, entity_id);
            return None;
        };
        if !entry.state.is_running() {
            warn!(
                "Ignoring phase {} for {}: status is {:?}",
                phase, entity_id, entry.state.status
            );
            return None;
        }
        if dispatch_id.is_some_and(|id| id != entry.dispatch_id) {
            debug!(
                "Ignoring agent {} for {}: dispatch {:?} superseded by {}",
                agent_handle, entity_id, dispatch_id, entry.dispatch_id
            );
            return None;
        }

        entry.state.current_phase = Some(phase);
        entry.state.agent_handle = Some(agent_handle.to_string());
        entry.state.touch();
        self.arm_timer(entry);

        let snapshot = entry.state.clone();
        table.bus.publish(CoordinatorEvent::PhaseStarted {
            entity_id: entity_id.to_string(),
            phase,
            agent_handle: agent_handle.to_string(),
        });

        debug!("Phase {} for {} running as {}", phase, entity_id, agent_handle);
        Some(snapshot)
    }

    /// Record the outcome of the current phase's agent.
    ///
    /// Success advances to the next permitted phase, or completes the run when
    /// none is left. Failure parks the entity in `error` until `retry_from`.
    /// Only the agent currently attached through `set_current_phase` is heard;
    /// any other handle, or any handle while none is attached, is `StaleAgent`.
    pub fn handle_agent_completed(
        &self,
        agent_handle: &str,
        entity_id: &str,
        outcome: AgentOutcome,
    ) -> Result<ExecutionState> {
        let mut guard = self.shared.table.lock();
        let table = &mut *guard;
        if table.disposed {
            return Err(CoordinatorError::Disposed);
        }

        let entry =
            table
                .entries
                .get_mut(entity_id)
                .ok_or_else(|| CoordinatorError::NotExecuting {
                    entity_id: entity_id.to_string(),
                })?;

        let attached = entry.state.agent_handle.as_deref() == Some(agent_handle);
        if !entry.state.is_running() || !attached {
            warn!(
                "Discarding completion from {} for {} ({:?}, current agent {:?})",
                agent_handle, entity_id, entry.state.status, entry.state.agent_handle
            );
            return Err(CoordinatorError::StaleAgent {
                entity_id: entity_id.to_string(),
                agent_handle: agent_handle.to_string(),
            });
        }

        entry.cancel_timer();
        let finished = entry.state.current_phase;

        let event = match outcome {
            AgentOutcome::Completed => {
                if let Some(phase) = finished {
                    entry.state.record_executed(phase);
                }
                entry.state.agent_handle = None;
                entry.state.touch();

                match next_permitted_phase(finished, &entry.permissions) {
                    Some(next) => {
                        entry.state.current_phase = Some(next);
                        entry.dispatch_id = issue_dispatch(&mut table.next_dispatch_id);
                        self.arm_timer(entry);
                        info!("{} finished {}, advancing to {}", entity_id, phase_label(finished), next);
                        CoordinatorEvent::ExecuteNextPhase {
                            entity_id: entity_id.to_string(),
                            phase: next,
                            context: PhaseContext::for_state(&entry.state, entry.dispatch_id, false),
                        }
                    }
                    None => {
                        entry.state.status = ExecutionStatus::Completed;
                        entry.state.current_phase = None;
                        info!(
                            "Auto-execution completed for {} ({:?})",
                            entity_id, entry.state.executed_phases
                        );
                        CoordinatorEvent::StateChanged {
                            entity_id: entity_id.to_string(),
                            state: entry.state.clone(),
                        }
                    }
                }
            }
            AgentOutcome::Failed { reason } => {
                let message = match reason {
                    Some(reason) => format!("Phase {} failed: {}", phase_label(finished), reason),
                    None => format!("Phase {} failed", phase_label(finished)),
                };
                warn!("{}: {}", entity_id, message);
                entry.state.record_failure(message);
                CoordinatorEvent::StateChanged {
                    entity_id: entity_id.to_string(),
                    state: entry.state.clone(),
                }
            }
        };

        let snapshot = entry.state.clone();
        table.bus.publish(event);
        Ok(snapshot)
    }

    /// Fail a dispatch that never got an agent attached, e.g. because launching it failed.
    ///
    /// `dispatch_id` comes from the `ExecuteNextPhase` context. The failure only
    /// lands while that exact dispatch is still waiting for its agent; anything
    /// else (a newer dispatch, an attached agent, another status) is `StaleDispatch`.
    pub fn fail_dispatch(
        &self,
        entity_id: &str,
        dispatch_id: u64,
        reason: &str,
    ) -> Result<ExecutionState> {
        let mut guard = self.shared.table.lock();
        let table = &mut *guard;
        if table.disposed {
            return Err(CoordinatorError::Disposed);
        }

        let entry =
            table
                .entries
                .get_mut(entity_id)
                .ok_or_else(|| CoordinatorError::NotExecuting {
                    entity_id: entity_id.to_string(),
                })?;

        let awaiting = entry.state.is_running()
            && entry.state.agent_handle.is_none()
            && entry.dispatch_id == dispatch_id;
        if !awaiting {
            debug!(
                "Discarding failure of dispatch {} for {} (current dispatch {}, {:?})",
                dispatch_id, entity_id, entry.dispatch_id, entry.state.status
            );
            return Err(CoordinatorError::StaleDispatch {
                entity_id: entity_id.to_string(),
                dispatch_id,
            });
        }

        entry.cancel_timer();
        let message = format!("Phase {} failed: {}", phase_label(entry.state.current_phase), reason);
        warn!("{}: {}", entity_id, message);
        entry.state.record_failure(message);

        let snapshot = entry.state.clone();
        table.bus.publish(CoordinatorEvent::StateChanged {
            entity_id: entity_id.to_string(),
            state: snapshot.clone(),
        });
        Ok(snapshot)
    }

    /// Resume an entity from `phase`, bounded by `max_retries` per run.
    pub fn retry_from(&self, entity_id: &str, phase: WorkflowPhase) -> Result<ExecutionState> {
        let mut guard = self.shared.table.lock();
        let table = &mut *guard;
        if table.disposed {
            return Err(CoordinatorError::Disposed);
        }

        let entry =
            table
                .entries
                .get_mut(entity_id)
                .ok_or_else(|| CoordinatorError::NotExecuting {
                    entity_id: entity_id.to_string(),
                })?;

        if !phase.is_auto_executable() {
            return Err(CoordinatorError::PhaseNotExecutable { phase });
        }

        let max_retries = self.shared.config.max_retries;
        if entry.state.retry_count >= max_retries {
            warn!("Retry limit reached for {} ({} attempts)", entity_id, max_retries);
            return Err(CoordinatorError::MaxRetriesExceeded {
                entity_id: entity_id.to_string(),
                max_retries,
            });
        }

        entry.cancel_timer();
        entry.dispatch_id = issue_dispatch(&mut table.next_dispatch_id);
        entry.state.retry_count += 1;
        entry.state.status = ExecutionStatus::Running;
        entry.state.current_phase = Some(phase);
        entry.state.last_failed_phase = None;
        entry.state.agent_handle = None;
        entry.state.executed_phases.retain(|done| *done < phase);
        entry.state.touch();
        self.arm_timer(entry);

        let snapshot = entry.state.clone();
        table.bus.publish(CoordinatorEvent::ExecuteNextPhase {
            entity_id: entity_id.to_string(),
            phase,
            context: PhaseContext::for_state(&snapshot, entry.dispatch_id, true),
        });

        info!(
            "Retrying {} from {} (attempt {}/{})",
            entity_id, phase, snapshot.retry_count, max_retries
        );
        Ok(snapshot)
    }

    /// Drop every entry and its timer. No per-entity events are published.
    pub fn reset_all(&self) {
        let mut table = self.shared.table.lock();
        let cleared = clear_entries(&mut table);
        if cleared > 0 {
            info!("Reset {} auto-executions", cleared);
        }
    }

    /// Cancel all timers, detach all listeners and empty the table. Idempotent.
    pub fn dispose(&self) {
        let mut table = self.shared.table.lock();
        if table.disposed {
            return;
        }
        table.disposed = true;
        let cleared = clear_entries(&mut table);
        table.bus.close();
        info!("Coordinator disposed ({} executions dropped)", cleared);
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.table.lock().disposed
    }

    /// Schedule the timeout for the entry's current phase, replacing any earlier one.
    fn arm_timer(&self, entry: &mut Entry) {
        entry.cancel_timer();

        let generation = entry.timer_generation;
        let entity_id = entry.state.entity_id.clone();
        let timeout = self.shared.config.phase_timeout;
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);

        let task = self.shared.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = shared.upgrade() {
                Coordinator { shared }.expire_phase(&entity_id, generation);
            }
        });
        entry.timer = Some(task.abort_handle());

        debug!(
            "Armed {:?} timeout for {} ({:?}, generation {})",
            timeout, entry.state.entity_id, entry.state.current_phase, generation
        );
    }

    /// Timer callback: fail the phase unless the timer was superseded.
    fn expire_phase(&self, entity_id: &str, generation: u64) {
        let mut guard = self.shared.table.lock();
        let table = &mut *guard;

        let Some(entry) = table.entries.get_mut(entity_id) else {
            return;
        };
        if entry.timer_generation != generation || !entry.state.is_running() {
            debug!("Ignoring superseded timeout for {}", entity_id);
            return;
        }

        entry.timer = None;
        let timeout = self.shared.config.phase_timeout;
        let message = format!(
            "Phase {} timed out after {}ms",
            phase_label(entry.state.current_phase),
            timeout.as_millis()
        );
        warn!("{}: {}", entity_id, message);
        entry.state.record_failure(message);

        let state = entry.state.clone();
        table.bus.publish(CoordinatorEvent::StateChanged {
            entity_id: entity_id.to_string(),
            state,
        });
    }
}

fn clear_entries(table: &mut Table) -> usize {
    let cleared = table.entries.len();
    for (_, mut entry) in table.entries.drain() {
        entry.cancel_timer();
    }
    cleared
}

fn issue_dispatch(counter: &mut u64) -> u64 {
    *counter += 1;
    *counter
}

fn phase_label(phase: Option<WorkflowPhase>) -> &'static str {
    phase.map(WorkflowPhase::as_str).unwrap_or("none")
}
