//! Document synchronization: versions, unsaved edits, per-URI ordering.

use std::sync::Arc;

use relay_lsp::{CacheConfig, LspError, Position};
use tokio::task::JoinSet;

use crate::common::{Workspace, manager_for, stub_server};

#[tokio::test]
async fn test_unchanged_file_is_not_resynced() {
    let ws = Workspace::new();
    let path = ws.write("a.stub", "func A() {}\n");

    let first = ws.inspect(&path).await;
    assert_eq!((first.version, first.opens), (1, 1));

    let second = ws.inspect(&path).await;
    assert_eq!((second.version, second.opens), (1, 1));
}

#[tokio::test]
async fn test_disk_change_bumps_version() {
    let ws = Workspace::new();
    let path = ws.write("a.stub", "func A() {}\n");
    ws.inspect(&path).await;

    ws.write("a.stub", "func Longer() {}\n");
    let view = ws.inspect(&path).await;
    assert_eq!(view.first_line, "func Longer() {}");
    assert_eq!((view.version, view.opens), (2, 1));

    let status = ws.manager.document_status(&path).await.unwrap().unwrap();
    assert!(status.open);
    assert!(status.disk_backed);
    assert_eq!(status.version, 2);
}

#[tokio::test]
async fn test_unsaved_edits_survive_disk_reads() {
    let ws = Workspace::new();
    let path = ws.write("a.stub", "func OnDisk() {}\n");

    let status = ws
        .manager
        .change_file(&path, 1, "func Unsaved() {}\n")
        .await
        .unwrap();
    assert!(status.open);
    assert!(!status.disk_backed);

    assert_eq!(ws.inspect(&path).await.first_line, "func Unsaved() {}");

    // A different disk write must not clobber the unsaved content.
    ws.write("a.stub", "func SomethingElse() {}\n");
    let view = ws.inspect(&path).await;
    assert_eq!(view.first_line, "func Unsaved() {}");
    let version = view.version;

    // Saving the same bytes makes the document disk-backed without a resync.
    ws.write("a.stub", "func Unsaved() {}\n");
    let view = ws.inspect(&path).await;
    assert_eq!(view.version, version);
    let status = ws.manager.document_status(&path).await.unwrap().unwrap();
    assert!(status.disk_backed);

    // From here on disk changes flow through again.
    ws.write("a.stub", "func Saved() {}\n");
    assert_eq!(ws.inspect(&path).await.first_line, "func Saved() {}");
}

#[tokio::test]
async fn test_stale_change_version_is_bumped() {
    let ws = Workspace::new();
    let path = ws.write("a.stub", "func A() {}\n");
    ws.inspect(&path).await;

    let status = ws.manager.change_file(&path, 7, "func B() {}\n").await.unwrap();
    assert_eq!(status.version, 7);
    let status = ws.manager.change_file(&path, 3, "func C() {}\n").await.unwrap();
    assert_eq!(status.version, 8);
    assert_eq!(ws.inspect(&path).await.version, 8);
}

#[tokio::test]
async fn test_version_overflow_is_rejected() {
    let ws = Workspace::new();
    let path = ws.write("a.stub", "func A() {}\n");

    let status = ws
        .manager
        .change_file(&path, i32::MAX, "func B() {}\n")
        .await
        .unwrap();
    assert_eq!(status.version, i32::MAX);

    let err = ws
        .manager
        .change_file(&path, 1, "func C() {}\n")
        .await
        .unwrap_err();
    assert!(matches!(err.root(), LspError::InvalidArgument(_)), "{err}");
    assert!(err.is_configuration());

    let view = ws.inspect(&path).await;
    assert_eq!(view.first_line, "func B() {}");
    assert_eq!(view.version, i32::MAX);
}

#[tokio::test]
async fn test_non_utf8_file_is_sent_lossily() {
    let ws = Workspace::new();
    let path = ws.root().join("latin.stub");
    std::fs::write(&path, b"func Caf\xe9() {}\n").unwrap();

    let hover = ws.manager.hover(&path, Position::new(0, 0)).await.unwrap();
    assert!(hover.is_some());
    assert_eq!(ws.inspect(&path).await.first_line, "func Caf\u{fffd}() {}");

    let status = ws.manager.document_status(&path).await.unwrap().unwrap();
    assert!(status.disk_backed);
    assert_eq!(status.version, 1);
}

#[tokio::test]
async fn test_change_file_opens_unopened_document() {
    let ws = Workspace::new();
    let path = ws.root().join("new.stub");

    let status = ws.manager.change_file(&path, 1, "func Fresh() {}\n").await.unwrap();
    assert!(status.open);
    let view = ws.inspect(&path).await;
    assert_eq!(view.first_line, "func Fresh() {}");
    assert_eq!(view.opens, 1);
}

#[tokio::test]
async fn test_close_then_reopen() {
    let ws = Workspace::new();
    let path = ws.write("a.stub", "func A() {}\n");
    ws.inspect(&path).await;

    ws.manager.close_file(&path).await.unwrap();
    let status = ws.manager.document_status(&path).await.unwrap().unwrap();
    assert!(!status.open);

    assert_eq!(ws.inspect(&path).await.opens, 2);
}

#[tokio::test]
async fn test_operations_on_one_uri_are_serialized() {
    let ws = Workspace::new();
    let path = ws.write("a.stub", "func A() {}\n");

    let mut tasks = JoinSet::new();
    for _ in 0..8 {
        let manager = Arc::clone(&ws.manager);
        let path = path.clone();
        tasks.spawn(async move { manager.hover(&path, Position::new(0, 5)).await });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap().unwrap();
    }

    let view = ws.inspect(&path).await;
    assert_eq!(view.max_in_flight, 1);
    assert_eq!(view.opens, 1);
}

#[tokio::test]
async fn test_stop_all_keeps_unsaved_content() {
    let ws = Workspace::new();
    let path = ws.write("a.stub", "func OnDisk() {}\n");
    ws.manager
        .change_file(&path, 1, "func Unsaved() {}\n")
        .await
        .unwrap();

    ws.manager.stop_all().await;
    let status = ws.manager.document_status(&path).await.unwrap().unwrap();
    assert!(!status.open);

    let view = ws.inspect(&path).await;
    assert_eq!(view.first_line, "func Unsaved() {}");
    assert_eq!(view.opens, 1);
}

#[tokio::test]
async fn test_cached_baseline_survives_a_new_manager() {
    let ws = Workspace::new();
    let cache = CacheConfig {
        dir: ws.root().join(".cache"),
        ..CacheConfig::default()
    };
    let path = ws.write("a.stub", "func A() {}\n");

    let first = manager_for(ws.root(), vec![stub_server(&[])], cache.clone());
    first.open_file(&path).await.unwrap();
    ws.write("a.stub", "func AB() {}\n");
    first.open_file(&path).await.unwrap();
    ws.write("a.stub", "func ABC() {}\n");
    let status = first.bootstrap_document(&path).await.unwrap();
    assert_eq!(status.version, 3);
    first.stop_all().await;

    // Same disk content: the fresh process resumes at the cached version.
    let second = manager_for(ws.root(), vec![stub_server(&[])], cache);
    let status = second.bootstrap_document(&path).await.unwrap();
    assert_eq!(status.version, 3);
    assert!(status.disk_backed);
    second.stop_all().await;
}
