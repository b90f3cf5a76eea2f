//! Core types for per-entity auto-execution
//!
//! Phases, permissions and the execution record the coordinator keeps for
//! each active entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One step of the workflow, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowPhase {
    Report,
    Analyze,
    Fix,
    Verify,
    Deploy,
}

impl WorkflowPhase {
    /// All phases in workflow order
    pub const ALL: [WorkflowPhase; 5] = [
        WorkflowPhase::Report,
        WorkflowPhase::Analyze,
        WorkflowPhase::Fix,
        WorkflowPhase::Verify,
        WorkflowPhase::Deploy,
    ];

    /// Position in the workflow order
    pub fn index(self) -> usize {
        self as usize
    }

    /// `report` is written by a human and only ever marks prior progress.
    pub fn is_auto_executable(self) -> bool {
        self != WorkflowPhase::Report
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowPhase::Report => "report",
            WorkflowPhase::Analyze => "analyze",
            WorkflowPhase::Fix => "fix",
            WorkflowPhase::Verify => "verify",
            WorkflowPhase::Deploy => "deploy",
        }
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkflowPhase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| format!("Unknown workflow phase: {}", s))
    }
}

/// Which auto-executable phases may run for one `start` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhasePermissions {
    pub analyze: bool,
    pub fix: bool,
    pub verify: bool,
    pub deploy: bool,
}

impl Default for PhasePermissions {
    /// Everything up to verification; deploy needs an explicit opt-in.
    fn default() -> Self {
        Self {
            analyze: true,
            fix: true,
            verify: true,
            deploy: false,
        }
    }
}

impl PhasePermissions {
    pub fn all() -> Self {
        Self {
            analyze: true,
            fix: true,
            verify: true,
            deploy: true,
        }
    }

    pub fn none() -> Self {
        Self {
            analyze: false,
            fix: false,
            verify: false,
            deploy: false,
        }
    }

    /// Set the flag for one phase. `report` has no flag and is ignored.
    pub fn with(mut self, phase: WorkflowPhase, allowed: bool) -> Self {
        match phase {
            WorkflowPhase::Report => {}
            WorkflowPhase::Analyze => self.analyze = allowed,
            WorkflowPhase::Fix => self.fix = allowed,
            WorkflowPhase::Verify => self.verify = allowed,
            WorkflowPhase::Deploy => self.deploy = allowed,
        }
        self
    }

    pub fn is_permitted(&self, phase: WorkflowPhase) -> bool {
        match phase {
            WorkflowPhase::Report => false,
            WorkflowPhase::Analyze => self.analyze,
            WorkflowPhase::Fix => self.fix,
            WorkflowPhase::Verify => self.verify,
            WorkflowPhase::Deploy => self.deploy,
        }
    }
}

/// Options for `Coordinator::start`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOptions {
    pub permissions: PhasePermissions,
}

impl StartOptions {
    pub fn new(permissions: PhasePermissions) -> Self {
        Self { permissions }
    }
}

/// Status of an entity.
///
/// `Idle` never appears in the table: an idle entity has no entry. It is only
/// reported in the `StateChanged` event emitted by `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Idle,
    Running,
    Error,
    Completed,
}

/// One entry in the failure log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub phase: Option<WorkflowPhase>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Execution record for one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub entity_id: String,
    pub entity_name: String,
    /// `Running`, `Error` or `Completed` for any state read from the table;
    /// `Idle` only in the snapshot published by `stop`.
    pub status: ExecutionStatus,
    pub current_phase: Option<WorkflowPhase>,
    /// Agent attached to the current phase by `set_current_phase`
    pub agent_handle: Option<String>,
    /// Phases completed this run, in completion order, without duplicates
    pub executed_phases: Vec<WorkflowPhase>,
    pub errors: Vec<ExecutionError>,
    pub start_time: DateTime<Utc>,
    pub last_activity_time: DateTime<Utc>,
    pub retry_count: u32,
    pub last_failed_phase: Option<WorkflowPhase>,
}

impl ExecutionState {
    pub(crate) fn new(
        entity_id: impl Into<String>,
        entity_name: impl Into<String>,
        first_phase: WorkflowPhase,
    ) -> Self {
        let now = Utc::now();
        Self {
            entity_id: entity_id.into(),
            entity_name: entity_name.into(),
            status: ExecutionStatus::Running,
            current_phase: Some(first_phase),
            agent_handle: None,
            executed_phases: Vec::new(),
            errors: Vec::new(),
            start_time: now,
            last_activity_time: now,
            retry_count: 0,
            last_failed_phase: None,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity_time = Utc::now();
    }

    pub(crate) fn record_executed(&mut self, phase: WorkflowPhase) {
        if !self.executed_phases.contains(&phase) {
            self.executed_phases.push(phase);
        }
    }

    pub(crate) fn record_failure(&mut self, message: impl Into<String>) {
        self.status = ExecutionStatus::Error;
        self.last_failed_phase = self.current_phase;
        self.errors.push(ExecutionError {
            phase: self.current_phase,
            message: message.into(),
            timestamp: Utc::now(),
        });
        self.touch();
    }

    /// Snapshot reported to observers once the entry has been removed.
    pub(crate) fn into_idle(mut self) -> Self {
        self.status = ExecutionStatus::Idle;
        self.current_phase = None;
        self.agent_handle = None;
        self.touch();
        self
    }

    pub fn is_running(&self) -> bool {
        self.status == ExecutionStatus::Running
    }
}

/// How an agent invocation ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum AgentOutcome {
    Completed,
    Failed { reason: Option<String> },
}

impl AgentOutcome {
    pub fn failed() -> Self {
        AgentOutcome::Failed { reason: None }
    }

    pub fn failed_with(reason: impl Into<String>) -> Self {
        AgentOutcome::Failed {
            reason: Some(reason.into()),
        }
    }
}

/// Context sent along with `ExecuteNextPhase`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseContext {
    /// Token for this dispatch; pass it to `fail_dispatch` if no agent can be attached.
    pub dispatch_id: u64,
    pub entity_name: String,
    pub retry_count: u32,
    pub is_retry: bool,
    pub executed_phases: Vec<WorkflowPhase>,
}

impl PhaseContext {
    pub(crate) fn for_state(state: &ExecutionState, dispatch_id: u64, is_retry: bool) -> Self {
        Self {
            dispatch_id,
            entity_name: state.entity_name.clone(),
            retry_count: state.retry_count,
            is_retry,
            executed_phases: state.executed_phases.clone(),
        }
    }
}
