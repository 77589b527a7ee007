//! FSM unit tests

use deployd::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentStatus};

#[test]
fn test_fsm_initial_state() {
    let fsm = DeploymentFsm::new();
    assert_eq!(fsm.state(), DeploymentStatus::Pending);
    assert!(fsm.error().is_none());
    assert!(!fsm.state().is_terminal());
}

#[test]
fn test_fsm_success_flow() {
    let mut fsm = DeploymentFsm::new();

    // Pending -> Running
    fsm.process(DeploymentEvent::Start).unwrap();
    assert_eq!(fsm.state(), DeploymentStatus::Running);

    // Running -> Success
    fsm.process(DeploymentEvent::Succeed).unwrap();
    assert_eq!(fsm.state(), DeploymentStatus::Success);
}

#[test]
fn test_fsm_failure_flow() {
    let mut fsm = DeploymentFsm::new();

    fsm.process(DeploymentEvent::Start).unwrap();
    fsm.process(DeploymentEvent::Fail("install failed".to_string()))
        .unwrap();

    assert_eq!(fsm.state(), DeploymentStatus::Failed);
    assert_eq!(fsm.error(), Some("install failed"));
}

#[test]
fn test_fsm_fail_before_start() {
    let mut fsm = DeploymentFsm::new();

    fsm.process(DeploymentEvent::Fail("internal error: gate closed".to_string()))
        .unwrap();
    assert_eq!(fsm.state(), DeploymentStatus::Failed);
}

#[test]
fn test_fsm_terminal_states_absorb_nothing() {
    let mut succeeded = DeploymentFsm::new();
    succeeded.process(DeploymentEvent::Start).unwrap();
    succeeded.process(DeploymentEvent::Succeed).unwrap();

    assert!(succeeded.process(DeploymentEvent::Start).is_err());
    assert!(succeeded.process(DeploymentEvent::Succeed).is_err());
    assert!(succeeded.process(DeploymentEvent::Fail("late".to_string())).is_err());
    assert_eq!(succeeded.state(), DeploymentStatus::Success);
    assert!(succeeded.error().is_none());

    let mut failed = DeploymentFsm::new();
    failed.process(DeploymentEvent::Fail("first".to_string())).unwrap();
    assert!(failed.process(DeploymentEvent::Start).is_err());
    assert_eq!(failed.error(), Some("first"));
}

#[test]
fn test_fsm_invalid_transition() {
    let mut fsm = DeploymentFsm::new();

    // Cannot succeed without running
    let result = fsm.process(DeploymentEvent::Succeed);
    assert!(result.is_err());
    assert_eq!(fsm.state(), DeploymentStatus::Pending);
}

#[test]
fn test_status_serializes_lowercase() {
    assert_eq!(
        serde_json::to_string(&DeploymentStatus::Success).unwrap(),
        "\"success\""
    );
    assert_eq!(DeploymentStatus::Running.as_str(), "running");
}
