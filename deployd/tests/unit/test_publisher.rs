//! Artifact publisher tests

mod common;

use std::path::Path;
use std::sync::Arc;

use common::{entries, seed_serving, served_index, serving_dir, FailingFs};
use deployd::deploy::publisher::{ArtifactPublisher, PublishError};
use tokio_test::assert_ok;

fn build_output(root: &Path, index_html: &str) -> std::path::PathBuf {
    let dist = root.join("workspace/dist");
    std::fs::create_dir_all(dist.join("assets")).unwrap();
    std::fs::write(dist.join("index.html"), index_html).unwrap();
    std::fs::write(dist.join("assets/app.js"), "console.log(1)").unwrap();
    dist
}

#[tokio::test]
async fn test_first_publish_creates_serving_location() {
    let root = tempfile::tempdir().unwrap();
    let dist = build_output(root.path(), "<h1>v1</h1>");
    let publisher = ArtifactPublisher::new(serving_dir(root.path()));

    let report = assert_ok!(publisher.publish(&dist, "20260101000000-aaaaaaaaaaaa").await);

    assert_eq!(report.files, 2);
    assert!(report.warnings.is_empty());
    assert_eq!(report.serving, serving_dir(root.path()));
    assert_eq!(served_index(root.path()), "<h1>v1</h1>");
    // The build output is copied, not moved
    assert!(dist.join("index.html").exists());
    assert_eq!(entries(root.path()), vec!["static", "workspace"]);
}

#[tokio::test]
async fn test_publish_swaps_whole_tree() {
    let root = tempfile::tempdir().unwrap();
    seed_serving(root.path(), "<h1>old</h1>");
    std::fs::write(serving_dir(root.path()).join("old.css"), "body {}").unwrap();
    let dist = build_output(root.path(), "<h1>new</h1>");
    let publisher = ArtifactPublisher::new(serving_dir(root.path()));

    publisher.publish(&dist, "20260101000000-bbbbbbbbbbbb").await.unwrap();

    assert_eq!(served_index(root.path()), "<h1>new</h1>");
    assert!(!serving_dir(root.path()).join("old.css").exists());
    assert_eq!(entries(root.path()), vec!["static", "workspace"]);
}

#[tokio::test]
async fn test_failed_swap_restores_previous_tree() {
    let root = tempfile::tempdir().unwrap();
    seed_serving(root.path(), "<h1>old</h1>");
    let dist = build_output(root.path(), "<h1>new</h1>");
    let publisher = ArtifactPublisher::with_fs(
        serving_dir(root.path()),
        Arc::new(FailingFs::failing_renames(&[2])),
    );

    let err = publisher
        .publish(&dist, "20260101000000-cccccccccccc")
        .await
        .unwrap_err();

    assert!(matches!(err, PublishError::Failed { .. }));
    assert!(!err.is_unrecoverable());
    assert_eq!(served_index(root.path()), "<h1>old</h1>");
    assert_eq!(entries(root.path()), vec!["static", "workspace"]);
}

#[tokio::test]
async fn test_failed_rollback_is_unrecoverable_and_recoverable_at_startup() {
    let root = tempfile::tempdir().unwrap();
    seed_serving(root.path(), "<h1>old</h1>");
    let dist = build_output(root.path(), "<h1>new</h1>");
    let id = "20260101000000-dddddddddddd";
    let failing = ArtifactPublisher::with_fs(
        serving_dir(root.path()),
        Arc::new(FailingFs::failing_renames(&[2, 3])),
    );

    let err = failing.publish(&dist, id).await.unwrap_err();

    assert!(err.is_unrecoverable());
    assert!(err.to_string().contains("operator attention"));
    assert!(!serving_dir(root.path()).exists());
    assert!(failing.previous_path(id).exists());
    assert!(failing.staging_path(id).exists());

    // Next start: put the previous tree back and clear the rest
    let publisher = ArtifactPublisher::new(serving_dir(root.path()));
    let report = publisher.recover().await.unwrap();

    assert_eq!(report.restored, Some(publisher.previous_path(id)));
    assert_eq!(report.removed, vec![publisher.staging_path(id)]);
    assert_eq!(served_index(root.path()), "<h1>old</h1>");
    assert_eq!(entries(root.path()), vec!["static", "workspace"]);
}

#[tokio::test]
async fn test_failed_move_aside_leaves_live_tree() {
    let root = tempfile::tempdir().unwrap();
    seed_serving(root.path(), "<h1>old</h1>");
    let dist = build_output(root.path(), "<h1>new</h1>");
    let publisher = ArtifactPublisher::with_fs(
        serving_dir(root.path()),
        Arc::new(FailingFs::failing_renames(&[1])),
    );

    let err = publisher
        .publish(&dist, "20260101000000-eeeeeeeeeeee")
        .await
        .unwrap_err();

    assert!(matches!(err, PublishError::MoveAside(_)));
    assert_eq!(served_index(root.path()), "<h1>old</h1>");
    assert_eq!(entries(root.path()), vec!["static", "workspace"]);
}

#[tokio::test]
async fn test_missing_source_fails_staging() {
    let root = tempfile::tempdir().unwrap();
    seed_serving(root.path(), "<h1>old</h1>");
    let publisher = ArtifactPublisher::new(serving_dir(root.path()));

    let err = publisher
        .publish(&root.path().join("nope"), "20260101000000-ffffffffffff")
        .await
        .unwrap_err();

    assert!(matches!(err, PublishError::Staging(_)));
    assert_eq!(served_index(root.path()), "<h1>old</h1>");
    assert_eq!(entries(root.path()), vec!["static"]);
}

#[tokio::test]
async fn test_cleanup_failure_is_a_warning() {
    let root = tempfile::tempdir().unwrap();
    seed_serving(root.path(), "<h1>old</h1>");
    let dist = build_output(root.path(), "<h1>new</h1>");
    let publisher = ArtifactPublisher::with_fs(
        serving_dir(root.path()),
        Arc::new(FailingFs::failing_previous_removal()),
    );

    let report = publisher
        .publish(&dist, "20260101000000-111111111111")
        .await
        .unwrap();

    assert_eq!(served_index(root.path()), "<h1>new</h1>");
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("failed to remove previous tree"));
}

#[tokio::test]
async fn test_recover_with_live_tree_only_removes_leftovers() {
    let root = tempfile::tempdir().unwrap();
    seed_serving(root.path(), "<h1>live</h1>");
    let publisher = ArtifactPublisher::new(serving_dir(root.path()));
    let previous = publisher.previous_path("20260101000000-222222222222");
    let staging = publisher.staging_path("20260101000000-333333333333");
    std::fs::create_dir_all(&previous).unwrap();
    std::fs::create_dir_all(&staging).unwrap();

    let report = publisher.recover().await.unwrap();

    assert!(report.restored.is_none());
    assert_eq!(report.removed.len(), 2);
    assert_eq!(served_index(root.path()), "<h1>live</h1>");
    assert_eq!(entries(root.path()), vec!["static"]);
}

#[tokio::test]
async fn test_recover_restores_newest_previous_tree() {
    let root = tempfile::tempdir().unwrap();
    let publisher = ArtifactPublisher::new(serving_dir(root.path()));
    for (id, html) in [
        ("20260101000000-444444444444", "<h1>older</h1>"),
        ("20260102000000-555555555555", "<h1>newer</h1>"),
    ] {
        let previous = publisher.previous_path(id);
        std::fs::create_dir_all(&previous).unwrap();
        std::fs::write(previous.join("index.html"), html).unwrap();
    }

    let report = publisher.recover().await.unwrap();

    assert_eq!(
        report.restored,
        Some(publisher.previous_path("20260102000000-555555555555"))
    );
    assert_eq!(served_index(root.path()), "<h1>newer</h1>");
    assert_eq!(entries(root.path()), vec!["static"]);
}

#[tokio::test]
async fn test_publish_copies_symlink_targets() {
    let root = tempfile::tempdir().unwrap();
    let dist = build_output(root.path(), "<h1>v1</h1>");
    let public = root.path().join("workspace/public");
    std::fs::create_dir_all(public.join("fonts")).unwrap();
    std::fs::write(public.join("logo.svg"), "<svg/>").unwrap();
    std::fs::write(public.join("fonts/inter.woff2"), "woff2").unwrap();
    std::os::unix::fs::symlink("../public/logo.svg", dist.join("logo.svg")).unwrap();
    std::os::unix::fs::symlink(public.join("fonts"), dist.join("fonts")).unwrap();
    let publisher = ArtifactPublisher::new(serving_dir(root.path()));

    let report = assert_ok!(publisher.publish(&dist, "20260101000000-777777777777").await);
    std::fs::remove_dir_all(root.path().join("workspace")).unwrap();

    let serving = serving_dir(root.path());
    assert_eq!(report.files, 4);
    assert_eq!(std::fs::read_to_string(serving.join("logo.svg")).unwrap(), "<svg/>");
    assert_eq!(
        std::fs::read_to_string(serving.join("fonts/inter.woff2")).unwrap(),
        "woff2"
    );
    assert!(!std::fs::symlink_metadata(serving.join("logo.svg"))
        .unwrap()
        .file_type()
        .is_symlink());
}

#[tokio::test]
async fn test_symlink_cycle_fails_staging() {
    let root = tempfile::tempdir().unwrap();
    seed_serving(root.path(), "<h1>old</h1>");
    let dist = build_output(root.path(), "<h1>new</h1>");
    std::os::unix::fs::symlink("..", dist.join("assets/up")).unwrap();
    let publisher = ArtifactPublisher::new(serving_dir(root.path()));

    let err = publisher
        .publish(&dist, "20260101000000-888888888888")
        .await
        .unwrap_err();

    assert!(matches!(err, PublishError::Staging(_)));
    assert!(err.to_string().contains("symlink cycle"));
    assert_eq!(served_index(root.path()), "<h1>old</h1>");
    assert_eq!(entries(root.path()), vec!["static", "workspace"]);
}

#[tokio::test]
async fn test_dangling_symlink_fails_staging() {
    let root = tempfile::tempdir().unwrap();
    let dist = build_output(root.path(), "<h1>new</h1>");
    std::os::unix::fs::symlink("../missing.svg", dist.join("logo.svg")).unwrap();
    let publisher = ArtifactPublisher::new(serving_dir(root.path()));

    let err = publisher
        .publish(&dist, "20260101000000-999999999999")
        .await
        .unwrap_err();

    assert!(matches!(err, PublishError::Staging(_)));
    assert!(!serving_dir(root.path()).exists());
}

#[tokio::test]
async fn test_recover_orders_same_second_trees_by_mtime() {
    let root = tempfile::tempdir().unwrap();
    let publisher = ArtifactPublisher::new(serving_dir(root.path()));
    let base = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_767_225_600);
    // The later tree sorts first by name
    for (id, html, offset) in [
        ("20260101000000-ffffffffffff", "<h1>older</h1>", 0),
        ("20260101000000-000000000000", "<h1>newer</h1>", 60),
    ] {
        let previous = publisher.previous_path(id);
        std::fs::create_dir_all(&previous).unwrap();
        std::fs::write(previous.join("index.html"), html).unwrap();
        std::fs::File::open(&previous)
            .unwrap()
            .set_modified(base + std::time::Duration::from_secs(offset))
            .unwrap();
    }

    let report = publisher.recover().await.unwrap();

    assert_eq!(
        report.restored,
        Some(publisher.previous_path("20260101000000-000000000000"))
    );
    assert_eq!(served_index(root.path()), "<h1>newer</h1>");
    assert_eq!(entries(root.path()), vec!["static"]);
}
