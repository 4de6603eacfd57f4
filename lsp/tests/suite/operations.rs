//! Editor operations end to end.

use relay_lsp::edit::apply_text_edits;
use relay_lsp::{
    CallDirection, CodeActionEntry, FormattingOptions, LocationTarget, LspError, Position, Range,
    ServerConfig, WorkspaceSymbolEntry, WorkspaceSymbolQuery,
};

use crate::common::{STUB, Workspace};

const PROGRAM: &str = "func Greet(name) {\n  print(name)\n}\n\nfunc main() {\n  Greet(\"x\")\n}\n";

#[tokio::test]
async fn test_rename_edits_every_occurrence() {
    let ws = Workspace::new();
    let path = ws.write("main.stub", PROGRAM);

    let edit = ws
        .manager
        .rename(&path, Position::new(5, 3), "Welcome")
        .await
        .unwrap();
    assert_eq!(edit.edit_count(), 2);

    let uri = relay_lsp::path_to_file_uri(&path).unwrap().to_string();
    let renamed = apply_text_edits(PROGRAM, edit.edits_for(&uri)).unwrap();
    assert!(renamed.starts_with("func Welcome(name) {"));
    assert!(renamed.contains("  Welcome(\"x\")"));
    assert!(!renamed.contains("Greet"));

    // The renamed file resyncs on the next operation.
    std::fs::write(&path, &renamed).unwrap();
    let symbols = ws.manager.document_symbol(&path).await.unwrap();
    let names: Vec<&str> = symbols.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["Welcome", "main"]);
}

#[tokio::test]
async fn test_format_is_idempotent() {
    let ws = Workspace::new();
    let messy = "func main() {   \n  print(1)\t\n}\n";
    let path = ws.write("fmt.stub", messy);

    let edits = ws
        .manager
        .format(&path, FormattingOptions::default())
        .await
        .unwrap();
    assert_eq!(edits.len(), 2);
    let formatted = apply_text_edits(messy, &edits).unwrap();
    assert_eq!(formatted, "func main() {\n  print(1)\n}\n");

    std::fs::write(&path, &formatted).unwrap();
    let again = ws
        .manager
        .format(&path, FormattingOptions::default())
        .await
        .unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn test_definition_keeps_location_link_shape() {
    let ws = Workspace::new();
    let path = ws.write("main.stub", PROGRAM);

    let targets = ws
        .manager
        .definition(&path, Position::new(5, 4))
        .await
        .unwrap();
    assert_eq!(targets.len(), 1);
    assert!(matches!(targets[0], LocationTarget::Link(_)));
    assert_eq!(
        targets[0].range(),
        Range::new(Position::new(0, 5), Position::new(0, 10))
    );

    let references = ws
        .manager
        .references(&path, Position::new(0, 6), true)
        .await
        .unwrap();
    assert_eq!(references.len(), 2);
}

#[tokio::test]
async fn test_semantic_tokens_resolve_legend_names() {
    let ws = Workspace::new();
    let path = ws.write("main.stub", PROGRAM);

    let tokens = ws.manager.semantic_tokens(&path).await.unwrap();
    assert_eq!(tokens.tokens.len(), 2);
    assert_eq!(tokens.tokens[1].line, 4);
    assert_eq!(tokens.tokens[1].start, 5);
    assert_eq!(tokens.tokens[1].token_type_name.as_deref(), Some("function"));
    assert_eq!(tokens.tokens[0].modifiers, ["declaration"]);

    let folds = ws.manager.folding_range(&path).await.unwrap();
    assert_eq!(folds.len(), 2);
    assert_eq!((folds[0].start_line, folds[0].end_line), (0, 2));
}

#[tokio::test]
async fn test_diagnostics_feed_code_action_context() {
    let ws = Workspace::new();
    let path = ws.write("bad.stub", "func main() {\n  ERROR\n}\n");

    ws.manager.open_file(&path).await.unwrap();
    // Publishes precede later responses on the wire.
    ws.manager.document_symbol(&path).await.unwrap();
    let diagnostics = ws.manager.diagnostics(&path).unwrap();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].range.start, Position::new(1, 2));
    assert_eq!(ws.manager.diagnostics_snapshot().status_string(), "E:1 W:0");

    let hit = Range::new(Position::new(1, 0), Position::new(1, 4));
    let actions = ws.manager.code_action(&path, hit).await.unwrap();
    assert_eq!(actions.len(), 1);
    let CodeActionEntry::Action(action) = &actions[0] else {
        panic!("expected a code action, got {:?}", actions[0]);
    };
    assert_eq!(action.title, "Remove ERROR marker");
    assert_eq!(action.diagnostics.len(), 1);
    assert!(action.edit.as_ref().is_some_and(|e| e.edit_count() == 1));

    let miss = Range::new(Position::new(0, 0), Position::new(0, 4));
    assert!(ws.manager.code_action(&path, miss).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_fixing_the_file_clears_diagnostics() {
    let ws = Workspace::new();
    let path = ws.write("bad.stub", "ERROR\n");
    ws.manager.document_symbol(&path).await.unwrap();
    assert_eq!(ws.manager.diagnostics(&path).unwrap().len(), 1);

    ws.write("bad.stub", "func ok() {}\n");
    ws.manager.document_symbol(&path).await.unwrap();
    assert!(ws.manager.diagnostics(&path).unwrap().is_empty());
    assert!(ws.manager.diagnostics_snapshot().is_empty());
}

#[tokio::test]
async fn test_workspace_symbol_by_file_and_language() {
    let ws = Workspace::new();
    let path = ws.write("main.stub", PROGRAM);

    let by_file = ws
        .manager
        .workspace_symbol(&WorkspaceSymbolQuery {
            file_path: Some(path.clone()),
            query: "Gre".to_string(),
            ..WorkspaceSymbolQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(by_file.len(), 1);
    assert_eq!(by_file[0].name(), "Greet");
    assert!(matches!(by_file[0], WorkspaceSymbolEntry::Information(_)));

    let by_language = ws
        .manager
        .workspace_symbol(&WorkspaceSymbolQuery {
            language: Some("stub".to_string()),
            query: String::new(),
            ..WorkspaceSymbolQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(by_language.len(), 2);

    let both = ws
        .manager
        .workspace_symbol(&WorkspaceSymbolQuery {
            file_path: Some(path),
            language: Some("stub".to_string()),
            query: String::new(),
        })
        .await
        .unwrap_err();
    assert!(matches!(both.root(), LspError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_unsupported_method_surfaces_rpc_error() {
    let ws = Workspace::new();
    let path = ws.write("main.stub", PROGRAM);

    let err = ws
        .manager
        .call_hierarchy(&path, Position::new(0, 6), CallDirection::Incoming)
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("call_hierarchy: "));
    assert!(matches!(err.root(), LspError::Rpc { code: -32601, .. }));
    assert!(!err.is_transport());

    // The server stays usable.
    assert_eq!(ws.manager.document_symbol(&path).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_missing_file_is_reported() {
    let ws = Workspace::new();
    let err = ws
        .manager
        .hover(&ws.root().join("gone.stub"), Position::new(0, 0))
        .await
        .unwrap_err();
    assert!(matches!(err.root(), LspError::FileNotFound { .. }));
    assert!(err.is_configuration());
}

#[tokio::test]
async fn test_go_file_rename_round_trip() {
    let go = ServerConfig::new("go", STUB, vec![], vec!["go".to_string()]).unwrap();
    let ws = Workspace::with_servers(vec![go]);
    let source = "package main\n\nfunc OldName() int { return 1 }\n";
    let path = ws.write("main.go", source);

    let symbols = ws.manager.document_symbol(&path).await.unwrap();
    assert_eq!(symbols.len(), 1);
    assert_eq!(symbols[0].name, "OldName");

    let at = symbols[0].selection_range.start;
    let edit = ws.manager.rename(&path, at, "RenamedName").await.unwrap();
    assert!(edit.edit_count() >= 1);
    let uri = relay_lsp::path_to_file_uri(&path).unwrap().to_string();
    assert!(edit.edits_for(&uri).iter().all(|e| e.new_text == "RenamedName"));

    let renamed = apply_text_edits(source, edit.edits_for(&uri)).unwrap();
    assert!(renamed.contains("RenamedName"));
    assert!(!renamed.contains("OldName"));
    assert_eq!(ws.read("main.go"), source);
}
