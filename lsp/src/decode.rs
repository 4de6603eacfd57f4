//! Decoders for LSP's polymorphic result shapes.
//!
//! Servers pick freely among the encodings the protocol allows, regardless of
//! the capabilities we advertised, so every decoder looks for a
//! discriminating key before committing to a shape. `null` is a legitimate
//! "no result" everywhere and decodes to an empty value, never an error.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{LspError, LspResult};
use crate::types::{
    CodeAction, CodeActionEntry, Command, CompletionItem, CompletionList, Diagnostic,
    DocumentSymbol, FoldingRange, HierarchyCall, HierarchyItem, Hover, Location, LocationTarget,
    ParameterInformation, Range, ResourceOperation, SemanticToken, SemanticTokens,
    SemanticTokensLegend, SignatureHelp, SignatureInformation, SymbolInformation, SymbolKind,
    TextEdit, WorkspaceEdit, WorkspaceSymbol, WorkspaceSymbolEntry,
};

fn from_value<T: DeserializeOwned>(what: &'static str, value: Value) -> LspResult<T> {
    serde_json::from_value(value).map_err(|e| LspError::Protocol(format!("decoding {what}: {e}")))
}

fn shape_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn unexpected(what: &'static str, value: &Value) -> LspError {
    LspError::Protocol(format!("unexpected {what} shape: {}", shape_name(value)))
}

/// `T[] | null`; null entries inside the array are skipped.
fn decode_array<T: DeserializeOwned>(what: &'static str, value: Value) -> LspResult<Vec<T>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .into_iter()
            .filter(|item| !item.is_null())
            .map(|item| from_value(what, item))
            .collect(),
        other => Err(unexpected(what, &other)),
    }
}

/// Flatten `MarkupContent | MarkedString | MarkedString[] | string` to text.
fn markup_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => {
            let text = map.get("value").and_then(Value::as_str)?;
            match map.get("language").and_then(Value::as_str) {
                Some(language) => Some(format!("```{language}\n{text}\n```")),
                None => Some(text.to_string()),
            }
        }
        Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .filter_map(markup_text)
                .filter(|s| !s.is_empty())
                .collect();
            Some(parts.join("\n\n"))
        }
        _ => None,
    }
}

// ── Locations ──────────────────────────────────────────────────────────

/// `Location | Location[] | LocationLink[] | null`.
pub fn decode_locations(value: Value) -> LspResult<Vec<LocationTarget>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .into_iter()
            .filter(|item| !item.is_null())
            .map(decode_location_target)
            .collect(),
        single @ Value::Object(_) => Ok(vec![decode_location_target(single)?]),
        other => Err(unexpected("location", &other)),
    }
}

fn decode_location_target(value: Value) -> LspResult<LocationTarget> {
    if value.get("targetUri").is_some() {
        Ok(LocationTarget::Link(from_value("location link", value)?))
    } else {
        Ok(LocationTarget::Location(from_value("location", value)?))
    }
}

/// `Location[] | null` (references).
pub fn decode_references(value: Value) -> LspResult<Vec<Location>> {
    decode_array("references", value)
}

// ── Hover / completion / signature help ────────────────────────────────

#[derive(Deserialize)]
struct RawHover {
    contents: Value,
    #[serde(default)]
    range: Option<Range>,
}

/// `Hover | null`. A hover with no text is treated as no hover.
pub fn decode_hover(value: Value) -> LspResult<Option<Hover>> {
    if value.is_null() {
        return Ok(None);
    }
    let raw: RawHover = from_value("hover", value)?;
    let contents = markup_text(&raw.contents).unwrap_or_default();
    if contents.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(Hover {
        contents,
        range: raw.range,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCompletionItem {
    label: String,
    #[serde(default)]
    kind: Option<u32>,
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    documentation: Option<Value>,
    #[serde(default)]
    insert_text: Option<String>,
    #[serde(default)]
    sort_text: Option<String>,
    #[serde(default)]
    filter_text: Option<String>,
    #[serde(default)]
    text_edit: Option<Value>,
}

impl From<RawCompletionItem> for CompletionItem {
    fn from(raw: RawCompletionItem) -> Self {
        let insert_text = raw.insert_text.or_else(|| {
            raw.text_edit
                .as_ref()
                .and_then(|edit| edit.get("newText"))
                .and_then(Value::as_str)
                .map(String::from)
        });
        Self {
            label: raw.label,
            kind: raw.kind,
            detail: raw.detail,
            documentation: raw.documentation.as_ref().and_then(markup_text),
            insert_text,
            sort_text: raw.sort_text,
            filter_text: raw.filter_text,
        }
    }
}

/// `CompletionItem[] | CompletionList | null`.
pub fn decode_completion(value: Value) -> LspResult<CompletionList> {
    match value {
        Value::Null => Ok(CompletionList::default()),
        items @ Value::Array(_) => {
            let raw: Vec<RawCompletionItem> = decode_array("completion items", items)?;
            Ok(CompletionList {
                is_incomplete: false,
                items: raw.into_iter().map(CompletionItem::from).collect(),
            })
        }
        Value::Object(mut map) => {
            let is_incomplete = map
                .get("isIncomplete")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let items = map.remove("items").unwrap_or(Value::Null);
            let raw: Vec<RawCompletionItem> = decode_array("completion items", items)?;
            Ok(CompletionList {
                is_incomplete,
                items: raw.into_iter().map(CompletionItem::from).collect(),
            })
        }
        other => Err(unexpected("completion", &other)),
    }
}

#[derive(Deserialize)]
struct RawParameter {
    label: Value,
    #[serde(default)]
    documentation: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSignature {
    label: String,
    #[serde(default)]
    documentation: Option<Value>,
    #[serde(default)]
    parameters: Vec<RawParameter>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSignatureHelp {
    #[serde(default)]
    signatures: Vec<RawSignature>,
    #[serde(default)]
    active_signature: Option<u32>,
    #[serde(default)]
    active_parameter: Option<u32>,
}

/// Substring of `label` between two UTF-16 offsets, clamped to the label.
fn slice_utf16(label: &str, start: usize, end: usize) -> String {
    let mut out = String::new();
    let mut offset = 0usize;
    for ch in label.chars() {
        if offset >= end {
            break;
        }
        if offset >= start {
            out.push(ch);
        }
        offset += ch.len_utf16();
    }
    out
}

fn parameter_label(signature_label: &str, label: &Value) -> String {
    match label {
        Value::String(s) => s.clone(),
        Value::Array(bounds) => {
            let start = bounds.first().and_then(Value::as_u64).unwrap_or(0) as usize;
            let end = bounds.get(1).and_then(Value::as_u64).unwrap_or(0) as usize;
            slice_utf16(signature_label, start, end)
        }
        _ => String::new(),
    }
}

/// `SignatureHelp | null`; offset-style parameter labels are resolved.
pub fn decode_signature_help(value: Value) -> LspResult<Option<SignatureHelp>> {
    if value.is_null() {
        return Ok(None);
    }
    let raw: RawSignatureHelp = from_value("signature help", value)?;
    if raw.signatures.is_empty() {
        return Ok(None);
    }
    let signatures = raw
        .signatures
        .into_iter()
        .map(|sig| {
            let parameters = sig
                .parameters
                .iter()
                .map(|param| ParameterInformation {
                    label: parameter_label(&sig.label, &param.label),
                    documentation: param.documentation.as_ref().and_then(markup_text),
                })
                .collect();
            SignatureInformation {
                documentation: sig.documentation.as_ref().and_then(markup_text),
                label: sig.label,
                parameters,
            }
        })
        .collect();
    Ok(Some(SignatureHelp {
        signatures,
        active_signature: raw.active_signature,
        active_parameter: raw.active_parameter,
    }))
}

// ── Symbols ────────────────────────────────────────────────────────────

/// `DocumentSymbol[] | SymbolInformation[] | null`.
///
/// Flat `SymbolInformation` entries (recognized by their `location` key) are
/// lifted into childless [`DocumentSymbol`]s.
pub fn decode_document_symbols(value: Value) -> LspResult<Vec<DocumentSymbol>> {
    let items: Vec<Value> = decode_array("document symbols", value)?;
    items
        .into_iter()
        .map(|item| {
            if item.get("location").is_some() {
                let info: SymbolInformation = from_value("symbol information", item)?;
                Ok(DocumentSymbol {
                    name: info.name,
                    detail: info.container_name,
                    kind: info.kind,
                    range: info.location.range,
                    selection_range: info.location.range,
                    children: Vec::new(),
                })
            } else {
                from_value("document symbol", item)
            }
        })
        .collect()
}

#[derive(Deserialize)]
struct RawUriOnly {
    uri: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWorkspaceSymbol {
    name: String,
    kind: SymbolKind,
    #[serde(default)]
    container_name: Option<String>,
    location: RawUriOnly,
}

/// `SymbolInformation[] | WorkspaceSymbol[] | null`.
///
/// A `location` carrying a `range` is the legacy `SymbolInformation` shape; a
/// URI-only location is a modern `WorkspaceSymbol` awaiting resolution.
pub fn decode_workspace_symbols(value: Value) -> LspResult<Vec<WorkspaceSymbolEntry>> {
    let items: Vec<Value> = decode_array("workspace symbols", value)?;
    items
        .into_iter()
        .map(|item| {
            let has_range = item
                .get("location")
                .and_then(|loc| loc.get("range"))
                .is_some();
            if has_range {
                Ok(WorkspaceSymbolEntry::Information(from_value(
                    "symbol information",
                    item,
                )?))
            } else {
                let raw: RawWorkspaceSymbol = from_value("workspace symbol", item)?;
                Ok(WorkspaceSymbolEntry::Symbol(WorkspaceSymbol {
                    name: raw.name,
                    kind: raw.kind,
                    container_name: raw.container_name,
                    uri: raw.location.uri,
                }))
            }
        })
        .collect()
}

// ── Edits and actions ──────────────────────────────────────────────────

/// `TextEdit[] | null` (formatting).
pub fn decode_text_edits(value: Value) -> LspResult<Vec<TextEdit>> {
    decode_array("text edits", value)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTextDocumentEdit {
    text_document: RawUriOnly,
    #[serde(default)]
    edits: Vec<TextEdit>,
}

/// `WorkspaceEdit | null`.
///
/// When `documentChanges` is present it wins over `changes`, as the protocol
/// prescribes. Text edits from both encodings land in one per-URI map; file
/// operations (discriminated by `kind`) are kept in order.
pub fn decode_workspace_edit(value: Value) -> LspResult<WorkspaceEdit> {
    let mut map = match value {
        Value::Null => return Ok(WorkspaceEdit::default()),
        Value::Object(map) => map,
        other => return Err(unexpected("workspace edit", &other)),
    };

    let mut edit = WorkspaceEdit::default();
    match map.remove("documentChanges") {
        Some(Value::Array(changes)) => {
            for change in changes {
                if change.get("kind").is_some() {
                    let op: ResourceOperation = from_value("resource operation", change)?;
                    edit.resource_operations.push(op);
                } else {
                    let doc_edit: RawTextDocumentEdit = from_value("text document edit", change)?;
                    edit.changes
                        .entry(doc_edit.text_document.uri)
                        .or_default()
                        .extend(doc_edit.edits);
                }
            }
        }
        _ => {
            if let Some(changes) = map.remove("changes").filter(|c| !c.is_null()) {
                let changes: BTreeMap<String, Vec<TextEdit>> =
                    from_value("workspace edit changes", changes)?;
                edit.changes = changes;
            }
        }
    }
    edit.changes.retain(|_, edits| !edits.is_empty());
    Ok(edit)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCodeAction {
    title: String,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    is_preferred: bool,
    #[serde(default)]
    diagnostics: Vec<Diagnostic>,
    #[serde(default)]
    edit: Option<Value>,
    #[serde(default)]
    command: Option<Command>,
}

/// `(CodeAction | Command)[] | null`.
///
/// A bare `Command` has a string `command`; a `CodeAction`'s `command`, when
/// present, is an object.
pub fn decode_code_actions(value: Value) -> LspResult<Vec<CodeActionEntry>> {
    let items: Vec<Value> = decode_array("code actions", value)?;
    items
        .into_iter()
        .map(|item| {
            if item.get("command").is_some_and(Value::is_string) {
                return Ok(CodeActionEntry::Command(from_value("command", item)?));
            }
            let raw: RawCodeAction = from_value("code action", item)?;
            let edit = match raw.edit {
                Some(edit) if !edit.is_null() => Some(decode_workspace_edit(edit)?),
                _ => None,
            };
            Ok(CodeActionEntry::Action(CodeAction {
                title: raw.title,
                kind: raw.kind,
                is_preferred: raw.is_preferred,
                diagnostics: raw.diagnostics,
                edit,
                command: raw.command,
            }))
        })
        .collect()
}

// ── Structure ──────────────────────────────────────────────────────────

/// `FoldingRange[] | null`.
pub fn decode_folding_ranges(value: Value) -> LspResult<Vec<FoldingRange>> {
    decode_array("folding ranges", value)
}

/// `CallHierarchyItem[] | TypeHierarchyItem[] | null`.
pub fn decode_hierarchy_items(value: Value) -> LspResult<Vec<HierarchyItem>> {
    decode_array("hierarchy items", value)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawIncomingCall {
    from: HierarchyItem,
    #[serde(default)]
    from_ranges: Vec<Range>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOutgoingCall {
    to: HierarchyItem,
    #[serde(default)]
    from_ranges: Vec<Range>,
}

/// `CallHierarchyIncomingCall[] | null`.
pub fn decode_incoming_calls(value: Value) -> LspResult<Vec<HierarchyCall>> {
    let raw: Vec<RawIncomingCall> = decode_array("incoming calls", value)?;
    Ok(raw
        .into_iter()
        .map(|call| HierarchyCall {
            item: call.from,
            from_ranges: call.from_ranges,
        })
        .collect())
}

/// `CallHierarchyOutgoingCall[] | null`.
pub fn decode_outgoing_calls(value: Value) -> LspResult<Vec<HierarchyCall>> {
    let raw: Vec<RawOutgoingCall> = decode_array("outgoing calls", value)?;
    Ok(raw
        .into_iter()
        .map(|call| HierarchyCall {
            item: call.to,
            from_ranges: call.from_ranges,
        })
        .collect())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSemanticTokens {
    #[serde(default)]
    result_id: Option<String>,
    #[serde(default)]
    data: Vec<u32>,
}

/// `SemanticTokens | null`, expanded from relative five-tuples to absolute
/// tokens and labelled from the legend when one is known.
pub fn decode_semantic_tokens(
    value: Value,
    legend: Option<&SemanticTokensLegend>,
) -> LspResult<SemanticTokens> {
    if value.is_null() {
        return Ok(SemanticTokens::default());
    }
    let raw: RawSemanticTokens = from_value("semantic tokens", value)?;
    if raw.data.len() % 5 != 0 {
        return Err(LspError::Protocol(format!(
            "semantic token data length {} is not a multiple of 5",
            raw.data.len()
        )));
    }

    let mut tokens = Vec::with_capacity(raw.data.len() / 5);
    let mut line = 0u32;
    let mut start = 0u32;
    for chunk in raw.data.chunks_exact(5) {
        let (delta_line, delta_start, length, token_type, modifier_bits) =
            (chunk[0], chunk[1], chunk[2], chunk[3], chunk[4]);
        if delta_line == 0 {
            start = start.saturating_add(delta_start);
        } else {
            line = line.saturating_add(delta_line);
            start = delta_start;
        }

        let token_type_name =
            legend.and_then(|l| l.token_types.get(token_type as usize).cloned());
        let modifiers = legend
            .map(|l| {
                l.token_modifiers
                    .iter()
                    .enumerate()
                    .filter(|(bit, _)| *bit < 32 && modifier_bits & (1 << bit) != 0)
                    .map(|(_, name)| name.clone())
                    .collect()
            })
            .unwrap_or_default();

        tokens.push(SemanticToken {
            line,
            start,
            length,
            token_type,
            token_type_name,
            modifier_bits,
            modifiers,
        });
    }

    Ok(SemanticTokens {
        result_id: raw.result_id,
        tokens,
    })
}
