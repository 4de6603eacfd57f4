//! Minimal stdio language server used by the integration tests.
//!
//! Understands a toy language where `func Name(` declares a function.
//! Supports enough of the protocol to drive every manager operation:
//!
//! - hover reports the first line of the server's copy of the document,
//!   its version, how often it was opened and the peak number of
//!   concurrent hovers on that URI
//! - definition answers with `LocationLink`s, references and rename work
//!   on whole-word occurrences
//! - formatting strips trailing whitespace
//! - every `ERROR` marker is published as an error diagnostic, and code
//!   actions offer one quick fix per diagnostic in the request context
//!
//! With `--crash-once <path>`, the first hover across all runs creates
//! `<path>` and exits the process without replying.
//!
//! With `--deaf-once <path>`, the first hover across all runs creates
//! `<path>`, then the server stops reading: the process replaces itself
//! with one that sends the hover reply, keeps stdout open and holds no end
//! of the stdin pipe. The client still sees a live server, but its next
//! write fails.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use relay_lsp::codec::{FrameReader, FrameWriter};
use relay_lsp::edit::{offset_to_position, position_to_offset};
use relay_lsp::types::Position;
use serde_json::{Value, json};
use tokio::io::Stdout;

const HOVER_DELAY: Duration = Duration::from_millis(30);
const LINGER: Duration = Duration::from_secs(60);

#[derive(Default)]
struct Document {
    text: String,
    version: i64,
    opens: u32,
    in_flight: u32,
    max_in_flight: u32,
}

#[derive(Default)]
struct State {
    documents: HashMap<String, Document>,
    open_counts: HashMap<String, u32>,
}

type Writer = Arc<tokio::sync::Mutex<FrameWriter<Stdout>>>;

#[tokio::main]
async fn main() -> Result<()> {
    if let Some(last_reply) = flag_value("--linger") {
        return linger(&last_reply).await;
    }

    let mut reader = FrameReader::new(tokio::io::stdin());
    let writer: Writer = Arc::new(tokio::sync::Mutex::new(FrameWriter::new(tokio::io::stdout())));
    let state = Arc::new(Mutex::new(State::default()));
    let crash_marker = flag_value("--crash-once");
    let deaf_marker = flag_value("--deaf-once");
    let mut shutdown_requested = false;

    while let Some(frame) = reader.read_frame().await? {
        let Some(method) = frame.get("method").and_then(Value::as_str) else {
            // Response to one of our own requests.
            continue;
        };
        let params = frame.get("params").cloned().unwrap_or(Value::Null);

        let Some(id) = frame.get("id").cloned() else {
            match method {
                "exit" => std::process::exit(i32::from(!shutdown_requested)),
                "initialized" => {
                    let request = json!({
                        "jsonrpc": "2.0",
                        "id": "stub-config",
                        "method": "workspace/configuration",
                        "params": { "items": [{ "section": "stub" }] }
                    });
                    writer.lock().await.write_frame(&request).await?;
                }
                _ => {
                    if let Some(publish) = handle_notification(&state, method, &params) {
                        writer.lock().await.write_frame(&publish).await?;
                    }
                }
            }
            continue;
        };

        match method {
            "initialize" => reply(&writer, &id, capabilities()).await?,
            "shutdown" => {
                shutdown_requested = true;
                reply(&writer, &id, Value::Null).await?;
            }
            "textDocument/hover" => {
                if let Some(marker) = &crash_marker
                    && claim(marker)
                {
                    std::process::exit(3);
                }
                if let Some(marker) = &deaf_marker
                    && claim(marker)
                {
                    let result = hover(&state, &params).await;
                    let frame = json!({ "jsonrpc": "2.0", "id": id, "result": result });
                    return Err(go_deaf(&frame));
                }
                let state = Arc::clone(&state);
                let writer = Arc::clone(&writer);
                tokio::spawn(async move {
                    let result = hover(&state, &params).await;
                    let _ = reply(&writer, &id, result).await;
                });
            }
            _ => {
                let response = {
                    let state = state.lock().unwrap_or_else(PoisonError::into_inner);
                    handle_request(&state, method, &params)
                };
                match response {
                    Some(result) => reply(&writer, &id, result).await?,
                    None => {
                        let error = json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": { "code": -32601, "message": format!("unhandled method {method}") }
                        });
                        writer.lock().await.write_frame(&error).await?;
                    }
                }
            }
        }
    }
    Ok(())
}

async fn reply(writer: &Writer, id: &Value, result: Value) -> Result<()> {
    let frame = json!({ "jsonrpc": "2.0", "id": id, "result": result });
    writer.lock().await.write_frame(&frame).await
}

fn flag_value(flag: &str) -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

/// True for the first caller across all runs sharing `marker`.
fn claim(marker: &str) -> bool {
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(marker)
        .is_ok()
}

/// Re-exec as `--linger <last_reply>` with stdin on /dev/null. Only returns
/// on failure.
#[cfg(unix)]
fn go_deaf(last_reply: &Value) -> anyhow::Error {
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => return e.into(),
    };
    Command::new(exe)
        .arg("--linger")
        .arg(last_reply.to_string())
        .stdin(Stdio::null())
        .exec()
        .into()
}

#[cfg(not(unix))]
fn go_deaf(_last_reply: &Value) -> anyhow::Error {
    anyhow::anyhow!("--deaf-once is only supported on unix")
}

/// Send one frame, then stay alive without reading anything.
async fn linger(last_reply: &str) -> Result<()> {
    let frame: Value = serde_json::from_str(last_reply)?;
    FrameWriter::new(tokio::io::stdout())
        .write_frame(&frame)
        .await?;
    tokio::time::sleep(LINGER).await;
    Ok(())
}

fn capabilities() -> Value {
    json!({
        "capabilities": {
            "textDocumentSync": 1,
            "hoverProvider": true,
            "definitionProvider": true,
            "referencesProvider": true,
            "renameProvider": true,
            "documentSymbolProvider": true,
            "workspaceSymbolProvider": true,
            "documentFormattingProvider": true,
            "codeActionProvider": true,
            "foldingRangeProvider": true,
            "semanticTokensProvider": {
                "legend": { "tokenTypes": ["function"], "tokenModifiers": ["declaration"] },
                "full": true
            }
        },
        "serverInfo": { "name": "relay-stub-server" }
    })
}

fn uri_of(params: &Value) -> String {
    params
        .pointer("/textDocument/uri")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn handle_notification(state: &Mutex<State>, method: &str, params: &Value) -> Option<Value> {
    let uri = uri_of(params);
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    match method {
        "textDocument/didOpen" => {
            let opens = state.open_counts.entry(uri.clone()).or_default();
            *opens += 1;
            let opens = *opens;
            let doc = state.documents.entry(uri.clone()).or_default();
            doc.text = params
                .pointer("/textDocument/text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            doc.version = params
                .pointer("/textDocument/version")
                .and_then(Value::as_i64)
                .unwrap_or_default();
            doc.opens = opens;
            Some(publish_diagnostics(&uri, &doc.text))
        }
        "textDocument/didChange" => {
            let doc = state.documents.get_mut(&uri)?;
            if let Some(text) = params
                .pointer("/contentChanges/0/text")
                .and_then(Value::as_str)
            {
                doc.text = text.to_string();
            }
            doc.version = params
                .pointer("/textDocument/version")
                .and_then(Value::as_i64)
                .unwrap_or(doc.version);
            Some(publish_diagnostics(&uri, &doc.text))
        }
        "textDocument/didClose" => {
            state.documents.remove(&uri);
            Some(publish_diagnostics(&uri, ""))
        }
        _ => None,
    }
}

fn publish_diagnostics(uri: &str, text: &str) -> Value {
    let diagnostics: Vec<Value> = occurrences(text, "ERROR")
        .into_iter()
        .map(|(start, end)| {
            json!({
                "range": { "start": start, "end": end },
                "severity": 1,
                "source": "stub",
                "message": "ERROR marker"
            })
        })
        .collect();
    json!({
        "jsonrpc": "2.0",
        "method": "textDocument/publishDiagnostics",
        "params": { "uri": uri, "diagnostics": diagnostics }
    })
}

async fn hover(state: &Mutex<State>, params: &Value) -> Value {
    let uri = uri_of(params);
    {
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(doc) = state.documents.get_mut(&uri) else {
            return Value::Null;
        };
        doc.in_flight += 1;
        doc.max_in_flight = doc.max_in_flight.max(doc.in_flight);
    }
    tokio::time::sleep(HOVER_DELAY).await;

    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(doc) = state.documents.get_mut(&uri) else {
        return Value::Null;
    };
    doc.in_flight -= 1;
    let first = doc.text.lines().next().unwrap_or_default();
    json!({
        "contents": {
            "kind": "markdown",
            "value": format!(
                "first: {first}\nversion: {}\nopens: {}\nmaxInFlight: {}",
                doc.version, doc.opens, doc.max_in_flight
            )
        }
    })
}

fn handle_request(state: &State, method: &str, params: &Value) -> Option<Value> {
    if method == "workspace/symbol" {
        return Some(workspace_symbols(state, params));
    }

    let uri = uri_of(params);
    let text = state
        .documents
        .get(&uri)
        .map(|d| d.text.as_str())
        .unwrap_or_default();
    let position: Option<Position> = params
        .get("position")
        .cloned()
        .and_then(|p| serde_json::from_value(p).ok());
    let word = position.and_then(|p| word_at(text, p));

    let result = match method {
        "textDocument/definition" => match word.and_then(|w| declaration_of(text, &w)) {
            Some(range) => json!([{
                "targetUri": uri,
                "targetRange": range,
                "targetSelectionRange": range,
            }]),
            None => Value::Null,
        },
        "textDocument/references" => {
            let locations: Vec<Value> = word
                .map(|w| occurrences(text, &w))
                .unwrap_or_default()
                .into_iter()
                .map(|(start, end)| json!({ "uri": uri, "range": { "start": start, "end": end } }))
                .collect();
            json!(locations)
        }
        "textDocument/rename" => {
            let new_name = params.get("newName").and_then(Value::as_str).unwrap_or_default();
            match word {
                Some(word) => {
                    let edits: Vec<Value> = occurrences(text, &word)
                        .into_iter()
                        .map(|(start, end)| {
                            json!({ "range": { "start": start, "end": end }, "newText": new_name })
                        })
                        .collect();
                    json!({ "changes": { uri: edits } })
                }
                None => Value::Null,
            }
        }
        "textDocument/documentSymbol" => {
            let symbols: Vec<Value> = functions(text)
                .into_iter()
                .map(|(name, start, end)| {
                    let range = json!({ "start": start, "end": end });
                    json!({ "name": name, "kind": 12, "range": range, "selectionRange": range })
                })
                .collect();
            json!(symbols)
        }
        "textDocument/formatting" => json!(trailing_whitespace_edits(text)),
        "textDocument/codeAction" => {
            let diagnostics = params
                .pointer("/context/diagnostics")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let actions: Vec<Value> = diagnostics
                .into_iter()
                .map(|diagnostic| {
                    let edit = json!({ "range": diagnostic["range"], "newText": "" });
                    json!({
                        "title": "Remove ERROR marker",
                        "kind": "quickfix",
                        "diagnostics": [diagnostic],
                        "edit": { "changes": { uri.clone(): [edit] } }
                    })
                })
                .collect();
            json!(actions)
        }
        "textDocument/foldingRange" => json!(folding_ranges(text)),
        "textDocument/semanticTokens/full" => json!({ "data": semantic_tokens(text) }),
        _ => return None,
    };
    Some(result)
}

fn workspace_symbols(state: &State, params: &Value) -> Value {
    let query = params.get("query").and_then(Value::as_str).unwrap_or_default();
    let mut uris: Vec<&String> = state.documents.keys().collect();
    uris.sort();
    let symbols: Vec<Value> = uris
        .into_iter()
        .flat_map(|uri| {
            functions(&state.documents[uri].text)
                .into_iter()
                .filter(|(name, _, _)| name.contains(query))
                .map(move |(name, start, end)| {
                    json!({
                        "name": name,
                        "kind": 12,
                        "location": { "uri": uri, "range": { "start": start, "end": end } }
                    })
                })
        })
        .collect();
    json!(symbols)
}

fn is_ident(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn word_at(text: &str, position: Position) -> Option<String> {
    let offset = position_to_offset(text, position).ok()?;
    let start = text[..offset]
        .char_indices()
        .rev()
        .take_while(|(_, c)| is_ident(*c))
        .last()
        .map_or(offset, |(i, _)| i);
    let end = text[offset..]
        .char_indices()
        .find(|(_, c)| !is_ident(*c))
        .map_or(text.len(), |(i, _)| offset + i);
    (start < end).then(|| text[start..end].to_string())
}

/// Whole-word occurrences of `word` as LSP start/end positions.
fn occurrences(text: &str, word: &str) -> Vec<(Position, Position)> {
    text.match_indices(word)
        .filter(|(idx, _)| {
            let before = text[..*idx].chars().next_back();
            let after = text[idx + word.len()..].chars().next();
            !before.is_some_and(is_ident) && !after.is_some_and(is_ident)
        })
        .filter_map(|(idx, _)| {
            Some((
                offset_to_position(text, idx).ok()?,
                offset_to_position(text, idx + word.len()).ok()?,
            ))
        })
        .collect()
}

/// `func Name(` declarations: name with the range of the name.
fn functions(text: &str) -> Vec<(String, Position, Position)> {
    text.match_indices("func ")
        .filter_map(|(idx, _)| {
            let start = idx + "func ".len();
            let len = text[start..].find('(')?;
            let name = &text[start..start + len];
            if name.is_empty() || !name.chars().all(is_ident) {
                return None;
            }
            Some((
                name.to_string(),
                offset_to_position(text, start).ok()?,
                offset_to_position(text, start + len).ok()?,
            ))
        })
        .collect()
}

fn declaration_of(text: &str, word: &str) -> Option<Value> {
    functions(text)
        .into_iter()
        .find(|(name, _, _)| name == word)
        .map(|(_, start, end)| json!({ "start": start, "end": end }))
}

fn trailing_whitespace_edits(text: &str) -> Vec<Value> {
    text.split('\n')
        .enumerate()
        .filter_map(|(line, content)| {
            let content = content.strip_suffix('\r').unwrap_or(content);
            let trimmed = content.trim_end();
            if trimmed.len() == content.len() {
                return None;
            }
            let start = trimmed.encode_utf16().count();
            let end = content.encode_utf16().count();
            Some(json!({
                "range": {
                    "start": { "line": line, "character": start },
                    "end": { "line": line, "character": end }
                },
                "newText": ""
            }))
        })
        .collect()
}

fn folding_ranges(text: &str) -> Vec<Value> {
    let mut ranges = Vec::new();
    let mut open: Vec<usize> = Vec::new();
    for (line, content) in text.lines().enumerate() {
        if content.trim_end().ends_with('{') {
            open.push(line);
        }
        if content.trim_start().starts_with('}')
            && let Some(start) = open.pop()
            && line > start
        {
            ranges.push(json!({ "startLine": start, "endLine": line }));
        }
    }
    ranges
}

fn semantic_tokens(text: &str) -> Vec<u32> {
    let mut data = Vec::new();
    let (mut prev_line, mut prev_char) = (0u32, 0u32);
    for (name, start, _) in functions(text) {
        let delta_line = start.line - prev_line;
        let delta_start = if delta_line == 0 {
            start.character - prev_char
        } else {
            start.character
        };
        data.extend([delta_line, delta_start, name.encode_utf16().count() as u32, 0, 1]);
        prev_line = start.line;
        prev_char = start.character;
    }
    data
}
