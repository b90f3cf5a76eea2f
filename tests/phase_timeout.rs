//! Phase timeout behaviour, run on tokio's paused clock.

use autoexec::{
    AgentOutcome, Coordinator, CoordinatorConfig, CoordinatorEvent, EventReceiver,
    ExecutionStatus, StartOptions, WorkflowPhase,
};
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);

fn coordinator() -> Coordinator {
    autoexec::core::init_tracing("autoexec=debug");
    Coordinator::new(CoordinatorConfig::default()).unwrap()
}

fn pending_kinds(rx: &mut EventReceiver) -> Vec<&'static str> {
    let mut kinds = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        kinds.push(envelope.event.kind());
    }
    kinds
}

#[tokio::test(start_paused = true)]
async fn test_stalled_phase_times_out() {
    let coord = coordinator();
    let mut rx = coord.subscribe();
    coord
        .start("bugs/a", "a", StartOptions::default(), None)
        .unwrap();
    coord.set_current_phase("bugs/a", WorkflowPhase::Analyze, "agent-1");
    assert_eq!(pending_kinds(&mut rx), vec!["execute-next-phase", "phase-started"]);

    // The clock auto-advances to the timer while we wait
    let envelope = rx.recv().await.unwrap();
    match envelope.event {
        CoordinatorEvent::StateChanged { state, .. } => {
            assert_eq!(state.status, ExecutionStatus::Error);
            assert_eq!(state.last_failed_phase, Some(WorkflowPhase::Analyze));
            assert!(state.errors[0].message.contains("timed out after 600000ms"));
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // A late completion from the timed-out agent is discarded
    let err = coord
        .handle_agent_completed("agent-1", "bugs/a", AgentOutcome::Completed)
        .unwrap_err();
    assert_eq!(err.code(), "STALE_AGENT");
}

#[tokio::test(start_paused = true)]
async fn test_set_current_phase_rearms_timeout() {
    let coord = coordinator();
    coord
        .start("bugs/a", "a", StartOptions::default(), None)
        .unwrap();

    tokio::time::sleep(8 * MINUTE).await;
    coord.set_current_phase("bugs/a", WorkflowPhase::Analyze, "agent-1");

    tokio::time::sleep(8 * MINUTE).await;
    assert_eq!(coord.get_status("bugs/a").unwrap().status, ExecutionStatus::Running);

    tokio::time::sleep(3 * MINUTE).await;
    let state = coord.get_status("bugs/a").unwrap();
    assert_eq!(state.status, ExecutionStatus::Error);
    assert_eq!(state.errors.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_timeout() {
    let coord = coordinator();
    let mut rx = coord.subscribe();
    coord
        .start("bugs/a", "a", StartOptions::default(), None)
        .unwrap();
    coord.stop("bugs/a").unwrap();

    tokio::time::sleep(30 * MINUTE).await;
    assert_eq!(pending_kinds(&mut rx), vec!["execute-next-phase", "state-changed"]);
    assert!(coord.get_status("bugs/a").is_none());

    // A fresh run of the same entity is not failed by the old timer
    coord
        .start("bugs/a", "a", StartOptions::default(), None)
        .unwrap();
    tokio::time::sleep(9 * MINUTE).await;
    assert_eq!(coord.get_status("bugs/a").unwrap().status, ExecutionStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn test_completion_clears_timeout() {
    let coord = coordinator();
    coord
        .start("bugs/a", "a", StartOptions::default(), None)
        .unwrap();
    coord.set_current_phase("bugs/a", WorkflowPhase::Analyze, "agent-1");

    tokio::time::sleep(9 * MINUTE).await;
    coord
        .handle_agent_completed("agent-1", "bugs/a", AgentOutcome::failed())
        .unwrap();
    tokio::time::sleep(5 * MINUTE).await;

    let state = coord.get_status("bugs/a").unwrap();
    assert_eq!(state.errors.len(), 1);
    assert!(!state.errors[0].message.contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn test_advanced_phase_gets_fresh_timeout() {
    let coord = coordinator();
    coord
        .start("bugs/a", "a", StartOptions::default(), None)
        .unwrap();
    coord.set_current_phase("bugs/a", WorkflowPhase::Analyze, "agent-1");

    tokio::time::sleep(9 * MINUTE).await;
    coord
        .handle_agent_completed("agent-1", "bugs/a", AgentOutcome::Completed)
        .unwrap();

    tokio::time::sleep(9 * MINUTE).await;
    let state = coord.get_status("bugs/a").unwrap();
    assert_eq!(state.status, ExecutionStatus::Running);
    assert_eq!(state.current_phase, Some(WorkflowPhase::Fix));

    tokio::time::sleep(2 * MINUTE).await;
    let state = coord.get_status("bugs/a").unwrap();
    assert_eq!(state.status, ExecutionStatus::Error);
    assert_eq!(state.last_failed_phase, Some(WorkflowPhase::Fix));
}

#[tokio::test(start_paused = true)]
async fn test_reset_all_cancels_timeouts() {
    let coord = coordinator();
    let mut rx = coord.subscribe();
    coord
        .start("bugs/a", "a", StartOptions::default(), None)
        .unwrap();
    coord.reset_all();

    tokio::time::sleep(30 * MINUTE).await;
    assert_eq!(pending_kinds(&mut rx), vec!["execute-next-phase"]);
}
