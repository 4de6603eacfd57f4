//! Server lifecycle: missing binaries, crashes, restarts and races.

use std::sync::{Arc, Mutex};

use relay_lsp::{Diagnostic, DiagnosticsHandler, LspError, Position, ServerConfig, ServerState};
use tokio::task::JoinSet;

use crate::common::{LANGUAGE, STUB, Workspace, eventually, stub_server};

#[tokio::test]
async fn test_missing_binary_does_not_affect_other_languages() {
    let ghost = ServerConfig::new(
        "ghost",
        "relay-no-such-language-server",
        vec![],
        vec!["ghost".to_string()],
    )
    .unwrap();
    let ws = Workspace::with_servers(vec![stub_server(&[]), ghost]);
    let haunted = ws.write("a.ghost", "boo\n");
    let path = ws.write("a.stub", "func A() {}\n");

    let err = ws
        .manager
        .hover(&haunted, Position::new(0, 0))
        .await
        .unwrap_err();
    assert!(matches!(err.root(), LspError::BinaryNotFound { .. }), "{err}");
    assert!(err.is_configuration());

    assert_eq!(ws.inspect(&path).await.opens, 1);

    let status = ws.manager.status();
    let state_of = |language: &str| {
        status
            .iter()
            .find(|s| s.language == language)
            .map(|s| s.state)
    };
    assert_eq!(state_of("ghost"), Some(ServerState::NotStarted));
    assert_eq!(state_of(LANGUAGE), Some(ServerState::Running));
}

#[tokio::test]
async fn test_crashed_server_is_replaced_on_next_operation() {
    let marker_dir = tempfile::tempdir().unwrap();
    let marker = marker_dir.path().join("crashed");
    let marker_arg = marker.to_str().unwrap();
    let ws = Workspace::with_servers(vec![stub_server(&["--crash-once", marker_arg])]);
    let path = ws.write("a.stub", "func A() {}\n");

    ws.manager.open_file(&path).await.unwrap();
    let before = ws.manager.ensure_client(LANGUAGE).await.unwrap();

    let err = ws
        .manager
        .hover(&path, Position::new(0, 0))
        .await
        .unwrap_err();
    assert!(err.is_transport(), "{err}");
    assert!(marker.exists());

    let view = ws.inspect(&path).await;
    assert_eq!(view.opens, 1);
    assert_eq!(view.first_line, "func A() {}");

    let after = ws.manager.ensure_client(LANGUAGE).await.unwrap();
    assert!(after.generation() > before.generation());
    assert!(!before.is_running());
}

#[cfg(unix)]
#[tokio::test]
async fn test_failed_change_escalates_to_restart() {
    let marker_dir = tempfile::tempdir().unwrap();
    let marker = marker_dir.path().join("deaf");
    let ws = Workspace::with_servers(vec![stub_server(&["--deaf-once", marker.to_str().unwrap()])]);
    let path = ws.write("a.stub", "func A() {}\n");

    // The first hover leaves the server alive but no longer reading.
    assert_eq!(ws.inspect(&path).await.version, 1);
    assert!(marker.exists());
    let before = ws.manager.ensure_client(LANGUAGE).await.unwrap();
    assert!(before.is_running());

    let status = ws
        .manager
        .change_file(&path, 1, "func Changed() {}\n")
        .await
        .unwrap();
    assert_eq!(status.version, 2);
    assert!(status.open);
    assert!(!status.disk_backed);
    assert!(!before.is_running());

    let after = ws.manager.ensure_client(LANGUAGE).await.unwrap();
    assert!(after.generation() > before.generation());

    let view = ws.inspect(&path).await;
    assert_eq!(view.first_line, "func Changed() {}");
    assert_eq!((view.version, view.opens), (2, 1));
    let status = ws.manager.document_status(&path).await.unwrap().unwrap();
    assert!(status.open);
    assert_eq!(status.version, 2);
}

#[cfg(unix)]
#[tokio::test]
async fn test_failed_restart_is_reported() {
    let scratch = tempfile::tempdir().unwrap();
    let binary = scratch.path().join("relay-stub-copy");
    std::fs::copy(STUB, &binary).unwrap();
    let marker = scratch.path().join("deaf");
    let server = ServerConfig::new(
        LANGUAGE,
        binary.to_str().unwrap(),
        vec!["--deaf-once".to_string(), marker.to_str().unwrap().to_string()],
        vec![LANGUAGE.to_string()],
    )
    .unwrap();
    let ws = Workspace::with_servers(vec![server]);
    let path = ws.write("a.stub", "func A() {}\n");

    ws.inspect(&path).await;
    std::fs::remove_file(&binary).unwrap();

    let err = ws
        .manager
        .change_file(&path, 2, "func Changed() {}\n")
        .await
        .unwrap_err();
    let LspError::RestartFailed { language, source } = err.root() else {
        panic!("expected RestartFailed, got {err}");
    };
    assert_eq!(language, LANGUAGE);
    assert!(matches!(**source, LspError::BinaryNotFound { .. }), "{source}");
}

#[tokio::test]
async fn test_restart_reopens_documents() {
    let ws = Workspace::new();
    let path = ws.write("a.stub", "func A() {}\n");
    ws.inspect(&path).await;

    let before = ws.manager.ensure_client(LANGUAGE).await.unwrap();
    let after = ws
        .manager
        .restart_client_for_language(LANGUAGE)
        .await
        .unwrap();
    assert_ne!(before.pid(), after.pid());
    assert_eq!(before.state(), ServerState::Stopped);

    let view = ws.inspect(&path).await;
    assert_eq!(view.opens, 1);
    assert_eq!(view.version, 1);
}

#[tokio::test]
async fn test_concurrent_ensure_client_starts_one_server() {
    let ws = Workspace::new();

    let mut tasks = JoinSet::new();
    for _ in 0..8 {
        let manager = Arc::clone(&ws.manager);
        tasks.spawn(async move { manager.ensure_client(LANGUAGE).await });
    }
    let mut clients = Vec::new();
    while let Some(result) = tasks.join_next().await {
        clients.push(result.unwrap().unwrap());
    }

    assert!(clients.iter().all(|c| Arc::ptr_eq(c, &clients[0])));
    assert!(clients[0].is_running());
    let status = ws.manager.status();
    assert_eq!(status[0].pid, clients[0].pid());
}

#[tokio::test]
async fn test_stop_all_then_reload() {
    let ws = Workspace::new();
    let path = ws.write("a.stub", "func A() {}\n");
    let client = {
        ws.inspect(&path).await;
        ws.manager.ensure_client(LANGUAGE).await.unwrap()
    };

    ws.manager.stop_all().await;
    assert!(!client.is_running());
    assert!(
        ws.manager
            .status()
            .iter()
            .all(|s| s.state == ServerState::NotStarted)
    );

    ws.manager
        .reload(vec![stub_server(&[]), stub_server(&[])])
        .await;
    assert_eq!(ws.manager.languages(), [LANGUAGE]);
    assert_eq!(ws.inspect(&path).await.opens, 1);
}

#[tokio::test]
async fn test_diagnostics_handler_sees_every_publish() {
    let ws = Workspace::new();
    let seen: Arc<Mutex<Vec<(String, usize)>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let handler: DiagnosticsHandler = Arc::new(move |uri: &str, items: &[Diagnostic]| {
        sink.lock().unwrap().push((uri.to_string(), items.len()));
    });
    ws.manager.set_diagnostics_handler(Some(handler));

    let path = ws.write("bad.stub", "ERROR ERROR\n");
    ws.manager.open_file(&path).await.unwrap();
    eventually(|| !seen.lock().unwrap().is_empty()).await;

    let uri = relay_lsp::path_to_file_uri(&path).unwrap().to_string();
    assert_eq!(seen.lock().unwrap()[0], (uri, 2));
    assert_eq!(ws.manager.diagnostics(&path).unwrap().len(), 2);
}
