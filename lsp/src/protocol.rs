//! JSON-RPC envelopes, frame classification and request parameter builders.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::types::{Diagnostic, FormattingOptions, HierarchyItem, Position, Range};

/// JSON-RPC "method not found".
pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// Error object of a JSON-RPC response.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ResponseError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// A message received from the server, classified by its envelope keys.
#[derive(Debug)]
pub(crate) enum IncomingFrame {
    Response {
        id: u64,
        body: Value,
    },
    ServerRequest {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

pub(crate) fn parse_incoming(frame: &Value) -> Option<IncomingFrame> {
    let id = frame.get("id").filter(|id| !id.is_null());
    let method = frame
        .get("method")
        .and_then(Value::as_str)
        .map(String::from);
    let has_result_or_error = frame.get("result").is_some() || frame.get("error").is_some();

    match (id, method, has_result_or_error) {
        (Some(id_val), None, true) => Some(IncomingFrame::Response {
            id: id_val.as_u64()?,
            body: frame.clone(),
        }),
        (Some(id_val), Some(method), _) => Some(IncomingFrame::ServerRequest {
            id: id_val.clone(),
            method,
            params: frame.get("params").cloned(),
        }),
        (None, Some(method), _) => Some(IncomingFrame::Notification {
            method,
            params: frame.get("params").cloned(),
        }),
        _ => None,
    }
}

/// Split a response body into its `result` or its `error`.
pub(crate) fn into_result(mut body: Value) -> Result<Value, ResponseError> {
    if let Some(error) = body.get_mut("error").map(Value::take)
        && !error.is_null()
    {
        return Err(serde_json::from_value(error).unwrap_or(ResponseError {
            code: 0,
            message: "malformed error object".to_string(),
        }));
    }
    Ok(body.get_mut("result").map(Value::take).unwrap_or(Value::Null))
}

/// Reply payload for a request the server sent to us.
///
/// Servers block on some of these (gopls waits for `workspace/configuration`),
/// so every request is answered, with a method-not-found error if need be.
pub(crate) fn server_request_reply(id: &Value, method: &str, params: Option<&Value>) -> Value {
    match method {
        "workspace/configuration" => {
            let count = params
                .and_then(|p| p.get("items"))
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            json!({ "jsonrpc": "2.0", "id": id, "result": vec![Value::Null; count] })
        }
        "client/registerCapability"
        | "client/unregisterCapability"
        | "window/workDoneProgress/create" => {
            json!({ "jsonrpc": "2.0", "id": id, "result": null })
        }
        _ => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": METHOD_NOT_FOUND,
                "message": format!("Method not found: {method}")
            }
        }),
    }
}

pub(crate) fn initialize_params(root_uri: &str, workspace_name: &str) -> Value {
    json!({
        "processId": std::process::id(),
        "clientInfo": { "name": "relay", "version": env!("CARGO_PKG_VERSION") },
        "rootUri": root_uri,
        "capabilities": {
            "general": { "positionEncodings": ["utf-16"] },
            "workspace": {
                "configuration": true,
                "workspaceFolders": true,
                "symbol": { "dynamicRegistration": false }
            },
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": false
                },
                "hover": { "contentFormat": ["markdown", "plaintext"] },
                "definition": { "linkSupport": true },
                "typeDefinition": { "linkSupport": true },
                "implementation": { "linkSupport": true },
                "references": {},
                "documentSymbol": { "hierarchicalDocumentSymbolSupport": true },
                "completion": {
                    "completionItem": {
                        "snippetSupport": false,
                        "documentationFormat": ["markdown", "plaintext"]
                    }
                },
                "rename": { "prepareSupport": false },
                "codeAction": {
                    "codeActionLiteralSupport": {
                        "codeActionKind": {
                            "valueSet": ["quickfix", "refactor", "source"]
                        }
                    }
                },
                "signatureHelp": {
                    "signatureInformation": {
                        "parameterInformation": { "labelOffsetSupport": true }
                    }
                },
                "formatting": {},
                "semanticTokens": {
                    "requests": { "full": true },
                    "tokenTypes": [],
                    "tokenModifiers": [],
                    "formats": ["relative"]
                },
                "foldingRange": { "lineFoldingOnly": false },
                "callHierarchy": {},
                "typeHierarchy": {},
                "publishDiagnostics": { "relatedInformation": true }
            }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": workspace_name
        }]
    })
}

pub(crate) fn did_open_params(uri: &str, language_id: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_change_params(uri: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "version": version
        },
        "contentChanges": [{
            "text": text
        }]
    })
}

pub(crate) fn did_close_params(uri: &str) -> Value {
    json!({ "textDocument": { "uri": uri } })
}

pub(crate) fn text_document_params(uri: &str) -> Value {
    json!({ "textDocument": { "uri": uri } })
}

pub(crate) fn position_params(uri: &str, position: Position) -> Value {
    json!({
        "textDocument": { "uri": uri },
        "position": position
    })
}

pub(crate) fn references_params(uri: &str, position: Position, include_declaration: bool) -> Value {
    json!({
        "textDocument": { "uri": uri },
        "position": position,
        "context": { "includeDeclaration": include_declaration }
    })
}

pub(crate) fn rename_params(uri: &str, position: Position, new_name: &str) -> Value {
    json!({
        "textDocument": { "uri": uri },
        "position": position,
        "newName": new_name
    })
}

pub(crate) fn code_action_params(uri: &str, range: Range, diagnostics: &[Diagnostic]) -> Value {
    json!({
        "textDocument": { "uri": uri },
        "range": range,
        "context": { "diagnostics": diagnostics }
    })
}

pub(crate) fn formatting_params(uri: &str, options: FormattingOptions) -> Value {
    json!({
        "textDocument": { "uri": uri },
        "options": options
    })
}

pub(crate) fn hierarchy_item_params(item: &HierarchyItem) -> Value {
    json!({ "item": item })
}

pub(crate) fn workspace_symbol_params(query: &str) -> Value {
    json!({ "query": query })
}

pub fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

#[must_use]
pub fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
}
