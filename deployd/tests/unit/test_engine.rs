//! Pipeline engine tests

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    engine, engine_with, entries, request, seed_serving, served_index, serving_dir, FailingFs,
    ScriptedRunner,
};
use deployd::app::options::{AppOptions, StorageOptions};
use deployd::app::state::AppState;
use deployd::deploy::fsm::DeploymentStatus;
use deployd::deploy::publisher::ArtifactPublisher;
use deployd::models::deployment::FailureKind;
use deployd::storage::layout::StorageLayout;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_react_deploy_publishes_build_output() {
    let root = tempfile::tempdir().unwrap();
    let runner = Arc::new(ScriptedRunner::new());
    let engine = engine(root.path(), runner.clone());

    let deployment = assert_ok!(engine.deploy(&request("react")).await);

    assert_eq!(deployment.status(), DeploymentStatus::Success);
    assert_eq!(deployment.deploy_path(), Some("/"));
    assert!(deployment.error_message().is_none());
    assert_eq!(
        deployment.stage_outputs().stages(),
        vec!["clone", "install", "build", "verify"]
    );
    assert!(deployment
        .stage_outputs()
        .get("clone")
        .unwrap()
        .starts_with("Cloning into"));
    assert_eq!(
        runner.calls()[0],
        format!(
            "git clone https://github.com/example/site.git {}",
            root.path().join("workspaces").join(&deployment.id).display()
        )
    );

    assert_eq!(served_index(root.path()), "<h1>v1</h1>");
    assert!(serving_dir(root.path()).join("assets/app.js").exists());

    // Workspace reclaimed, no publish leftovers next to the serving location
    assert!(entries(&root.path().join("workspaces")).is_empty());
    assert_eq!(entries(root.path()), vec!["static", "workspaces"]);

    let stored = engine.history().get(&deployment.id).unwrap();
    assert_eq!(stored.status(), DeploymentStatus::Success);
    assert!(stored.started_at.is_some() && stored.finished_at.is_some());
}

#[tokio::test]
async fn test_redeploy_replaces_served_tree() {
    let root = tempfile::tempdir().unwrap();
    seed_serving(root.path(), "<h1>old</h1>");
    std::fs::write(serving_dir(root.path()).join("stale.txt"), "gone").unwrap();

    let engine = engine(root.path(), Arc::new(ScriptedRunner::new().serving("<h1>v2</h1>")));
    let deployment = engine.deploy(&request("vue")).await.unwrap();

    assert_eq!(deployment.status(), DeploymentStatus::Success);
    assert_eq!(served_index(root.path()), "<h1>v2</h1>");
    assert!(!serving_dir(root.path()).join("stale.txt").exists());
    assert_eq!(entries(root.path()), vec!["static", "workspaces"]);
}

#[tokio::test]
async fn test_build_failure_keeps_previous_tree() {
    let root = tempfile::tempdir().unwrap();
    seed_serving(root.path(), "<h1>old</h1>");
    let runner = Arc::new(ScriptedRunner::new().failing("npm run build"));
    let engine = engine(root.path(), runner);

    let deployment = engine.deploy(&request("react")).await.unwrap();

    assert_eq!(deployment.status(), DeploymentStatus::Failed);
    assert_eq!(deployment.failure_kind(), Some(FailureKind::Stage));
    assert_eq!(
        deployment.error_message(),
        Some("build failed: exited with status 1")
    );
    assert_eq!(
        deployment.stage_outputs().stages(),
        vec!["clone", "install", "build"]
    );
    assert_eq!(
        deployment.stage_outputs().get("build"),
        Some("error: npm run build failed\n")
    );
    assert!(deployment.deploy_path().is_none());
    assert_eq!(served_index(root.path()), "<h1>old</h1>");
    assert!(entries(&root.path().join("workspaces")).is_empty());
}

#[tokio::test]
async fn test_unknown_framework_is_rejected_before_any_work() {
    let root = tempfile::tempdir().unwrap();
    let runner = Arc::new(ScriptedRunner::new());
    let engine = engine(root.path(), runner.clone());

    let err = assert_err!(engine.deploy(&request("cobol-web")).await);

    assert!(err.is_validation());
    assert!(err.to_string().contains("cobol-web"));
    assert!(runner.calls().is_empty());
    assert!(!root.path().join("workspaces").exists());
    assert!(engine.history().is_empty());
}

#[tokio::test]
async fn test_invalid_repo_url_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let runner = Arc::new(ScriptedRunner::new());
    let engine = engine(root.path(), runner.clone());

    let mut bad = request("react");
    bad.repo_url = "file:///etc".to_string();

    let err = engine.deploy(&bad).await.unwrap_err();
    assert!(err.is_validation());
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_prisma_hook_runs_between_clone_and_install() {
    let root = tempfile::tempdir().unwrap();
    let runner = Arc::new(ScriptedRunner::new().with_prisma_schema());
    let engine = engine(root.path(), runner.clone());

    let deployment = engine.deploy(&request("node-prisma")).await.unwrap();

    assert_eq!(deployment.status(), DeploymentStatus::Success);
    assert_eq!(
        deployment.stage_outputs().stages(),
        vec!["clone", "prisma", "install", "build", "verify"]
    );
    assert_eq!(
        deployment.stage_outputs().get("prisma"),
        Some("npx prisma generate: ok\n\nnpx prisma migrate deploy: ok\n")
    );

    let calls: Vec<String> = runner.calls().into_iter().skip(1).collect();
    assert_eq!(
        calls,
        vec![
            "npx prisma generate",
            "npx prisma migrate deploy",
            "npm install",
            "npm run build"
        ]
    );
}

#[tokio::test]
async fn test_prisma_hook_without_schema_is_skipped() {
    let root = tempfile::tempdir().unwrap();
    let runner = Arc::new(ScriptedRunner::new());
    let engine = engine(root.path(), runner.clone());

    let deployment = engine.deploy(&request("node-prisma")).await.unwrap();

    assert_eq!(deployment.status(), DeploymentStatus::Success);
    assert_eq!(
        deployment.stage_outputs().stages(),
        vec!["clone", "install", "build", "verify"]
    );
    assert!(!runner.calls().iter().any(|c| c.starts_with("npx")));
}

#[tokio::test]
async fn test_failing_hook_stops_the_pipeline() {
    let root = tempfile::tempdir().unwrap();
    let runner = Arc::new(
        ScriptedRunner::new()
            .with_prisma_schema()
            .failing("npx prisma migrate deploy"),
    );
    let engine = engine(root.path(), runner.clone());

    let deployment = engine.deploy(&request("node-prisma")).await.unwrap();

    assert_eq!(deployment.status(), DeploymentStatus::Failed);
    assert_eq!(
        deployment.error_message(),
        Some("prisma failed: exited with status 1")
    );
    assert_eq!(deployment.stage_outputs().stages(), vec!["clone", "prisma"]);
    assert!(!runner.calls().contains(&"npm install".to_string()));
}

#[tokio::test]
async fn test_missing_package_json_fails_install() {
    let root = tempfile::tempdir().unwrap();
    let runner = Arc::new(ScriptedRunner::new().without_package_json());
    let engine = engine(root.path(), runner.clone());

    let deployment = engine.deploy(&request("svelte")).await.unwrap();

    assert_eq!(deployment.status(), DeploymentStatus::Failed);
    assert_eq!(
        deployment.error_message(),
        Some("install failed: package.json not found")
    );
    assert_eq!(runner.calls().len(), 1);
}

#[tokio::test]
async fn test_missing_build_output_fails_verify() {
    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path(), Arc::new(ScriptedRunner::new().without_build_output()));

    let deployment = engine.deploy(&request("node")).await.unwrap();

    assert_eq!(deployment.status(), DeploymentStatus::Failed);
    assert_eq!(
        deployment.error_message(),
        Some("verify failed: build output dist not found")
    );
    assert!(!serving_dir(root.path()).exists());
}

#[tokio::test]
async fn test_timed_out_stage_fails_the_deployment() {
    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path(), Arc::new(ScriptedRunner::new().hanging("npm install")));

    let deployment = engine.deploy(&request("react")).await.unwrap();

    assert_eq!(deployment.status(), DeploymentStatus::Failed);
    assert_eq!(
        deployment.error_message(),
        Some("install failed: timed out after 600s")
    );
    assert_eq!(deployment.stage_outputs().get("install"), Some("started\n"));
}

#[tokio::test]
async fn test_panic_becomes_internal_failure_and_releases_gate() {
    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path(), Arc::new(ScriptedRunner::new().panicking("npm run build")));

    let deployment = engine.deploy(&request("react")).await.unwrap();

    assert_eq!(deployment.status(), DeploymentStatus::Failed);
    assert_eq!(deployment.failure_kind(), Some(FailureKind::Internal));
    let message = deployment.error_message().unwrap();
    assert!(message.starts_with("internal error:"), "{}", message);
    assert!(message.contains("scripted panic in npm run build"));

    assert!(!engine.gate().is_busy());
    assert!(entries(&root.path().join("workspaces")).is_empty());
}

#[tokio::test]
async fn test_publish_failure_rolls_back() {
    let root = tempfile::tempdir().unwrap();
    seed_serving(root.path(), "<h1>old</h1>");
    let publisher = ArtifactPublisher::with_fs(
        serving_dir(root.path()),
        Arc::new(FailingFs::failing_renames(&[2])),
    );
    let engine = engine_with(root.path(), Arc::new(ScriptedRunner::new()), publisher);

    let deployment = engine.deploy(&request("react")).await.unwrap();

    assert_eq!(deployment.status(), DeploymentStatus::Failed);
    assert_eq!(deployment.failure_kind(), Some(FailureKind::Publish));
    assert!(deployment
        .error_message()
        .unwrap()
        .starts_with("publish failed:"));
    assert_eq!(
        deployment.stage_outputs().stages(),
        vec!["clone", "install", "build", "verify"]
    );
    assert_eq!(served_index(root.path()), "<h1>old</h1>");
    assert_eq!(entries(root.path()), vec!["static", "workspaces"]);
}

#[tokio::test]
async fn test_unrecoverable_publish_failure_is_distinguishable() {
    let root = tempfile::tempdir().unwrap();
    seed_serving(root.path(), "<h1>old</h1>");
    let publisher = ArtifactPublisher::with_fs(
        serving_dir(root.path()),
        Arc::new(FailingFs::failing_renames(&[2, 3])),
    );
    let engine = engine_with(root.path(), Arc::new(ScriptedRunner::new()), publisher);

    let deployment = engine.deploy(&request("react")).await.unwrap();

    assert_eq!(deployment.status(), DeploymentStatus::Failed);
    assert_eq!(
        deployment.failure_kind(),
        Some(FailureKind::PublishUnrecoverable)
    );
    assert_eq!(
        deployment.to_record().failure_kind.as_deref(),
        Some("publish_unrecoverable")
    );
}

#[tokio::test]
async fn test_concurrent_deployments_never_overlap() {
    let root = tempfile::tempdir().unwrap();
    let runner = Arc::new(ScriptedRunner::new().with_delay(Duration::from_millis(20)));
    let engine = Arc::new(engine(root.path(), runner.clone()));

    let mut handles = Vec::new();
    for framework in ["react", "vue", "svelte", "node"] {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.deploy(&request(framework)).await.unwrap()
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        let deployment = handle.await.unwrap();
        assert_eq!(deployment.status(), DeploymentStatus::Success);
        ids.push(deployment.id);
    }

    assert_eq!(runner.max_active(), 1);
    assert_eq!(runner.calls().len(), 12);
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    assert_eq!(engine.history().len(), 4);
    assert_eq!(entries(root.path()), vec!["static", "workspaces"]);
}

#[tokio::test]
async fn test_startup_clears_workspaces_left_by_a_crash() {
    let root = tempfile::tempdir().unwrap();
    let layout = StorageLayout::new(root.path());
    let stale = layout
        .workspaces_dir()
        .path()
        .join("20260101000000-abcdefabcdef/node_modules");
    std::fs::create_dir_all(&stale).unwrap();
    let options = AppOptions {
        storage: StorageOptions {
            layout: layout.clone(),
            history_capacity: 10,
        },
        ..AppOptions::default()
    };

    let state = assert_ok!(AppState::init(&options, Arc::new(ScriptedRunner::new())).await);

    assert!(layout.workspaces_dir().exists().await);
    assert!(entries(layout.workspaces_dir().path()).is_empty());

    // The swept root still serves new deployments
    let deployment = assert_ok!(state.engine.deploy(&request("react")).await);
    assert_eq!(deployment.status(), DeploymentStatus::Success);
    assert_eq!(state.abort_commands(), 0);
}
