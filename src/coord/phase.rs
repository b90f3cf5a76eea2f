//! Phase selection
//!
//! A single rule decides which phase runs next, both when a run starts and
//! when a phase completes.

use super::types::{PhasePermissions, WorkflowPhase};

/// First auto-executable, permitted phase strictly after `after`.
///
/// `None` as the anchor starts the walk at the beginning of the workflow.
/// Returns `None` once the workflow is exhausted.
pub fn next_permitted_phase(
    after: Option<WorkflowPhase>,
    permissions: &PhasePermissions,
) -> Option<WorkflowPhase> {
    let start = after.map(|phase| phase.index() + 1).unwrap_or(0);

    WorkflowPhase::ALL
        .iter()
        .skip(start)
        .copied()
        .find(|phase| phase.is_auto_executable() && permissions.is_permitted(*phase))
}
