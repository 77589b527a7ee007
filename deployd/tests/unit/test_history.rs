//! Deployment history unit tests

use deployd::cache::deployments::DeploymentHistory;
use deployd::models::deployment::{Deployment, FailureKind};
use deployd::models::framework::Framework;

fn create_test_deployment(id: &str) -> Deployment {
    Deployment::new(
        id.to_string(),
        "https://github.com/example/site.git".to_string(),
        Framework::React,
    )
}

fn finished(id: &str) -> Deployment {
    let mut deployment = create_test_deployment(id);
    deployment.mark_running().unwrap();
    deployment.mark_succeeded("/".to_string()).unwrap();
    deployment
}

#[test]
fn test_history_insert_and_get() {
    let history = DeploymentHistory::new(10);
    history.upsert(&create_test_deployment("d-1"));

    let stored = history.get("d-1");
    assert!(stored.is_some());
    assert_eq!(stored.unwrap().repo_url, "https://github.com/example/site.git");
    assert!(history.get("d-2").is_none());
}

#[test]
fn test_history_lists_newest_first() {
    let history = DeploymentHistory::new(10);
    history.upsert(&finished("d-1"));
    history.upsert(&finished("d-2"));
    history.upsert(&finished("d-3"));

    let ids: Vec<String> = history.list().into_iter().map(|d| d.id).collect();
    assert_eq!(ids, vec!["d-3", "d-2", "d-1"]);
}

#[test]
fn test_history_upsert_replaces_snapshot_in_place() {
    let history = DeploymentHistory::new(10);
    let mut deployment = create_test_deployment("d-1");
    history.upsert(&deployment);
    history.upsert(&finished("d-2"));

    deployment.mark_running().unwrap();
    deployment
        .mark_failed(FailureKind::Stage, "build failed: exited with status 1".to_string())
        .unwrap();
    history.upsert(&deployment);

    assert_eq!(history.len(), 2);
    let ids: Vec<String> = history.list().into_iter().map(|d| d.id).collect();
    assert_eq!(ids, vec!["d-2", "d-1"]);
    assert_eq!(
        history.get("d-1").unwrap().error_message(),
        Some("build failed: exited with status 1")
    );
}

#[test]
fn test_history_eviction() {
    let history = DeploymentHistory::new(2);

    history.upsert(&finished("d-1"));
    history.upsert(&finished("d-2"));
    history.upsert(&finished("d-3"));

    // History should have evicted the oldest entry
    assert_eq!(history.len(), 2);
    assert!(history.get("d-1").is_none());
}

#[test]
fn test_history_evicts_finished_before_unfinished() {
    let history = DeploymentHistory::new(2);

    history.upsert(&create_test_deployment("pending"));
    history.upsert(&finished("done"));
    history.upsert(&finished("latest"));

    assert!(history.get("pending").is_some());
    assert!(history.get("done").is_none());
    assert!(history.get("latest").is_some());
}
