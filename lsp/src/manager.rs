//! `LspManager` facade: the public API consumed by callers.
//!
//! Routes files to language servers by extension, starts servers lazily on
//! first use, aggregates diagnostics and exposes the editor operations. Every
//! operation bootstraps its document (see [`crate::sync`]) and makes its
//! JSON-RPC call while holding that document's lock.
//!
//! Lock discipline: the registry `RwLock` is a std lock and is always
//! released before awaiting a client; clients never reach back into it.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheStore;
use crate::client::{ClientPhase, DiagnosticsHandler, LspClient};
use crate::config::{LspConfig, ServerConfig, normalize_language};
use crate::decode;
use crate::diagnostics::{DiagnosticsSnapshot, DiagnosticsStore};
use crate::error::{LspError, LspResult};
use crate::protocol;
use crate::sync::DocumentSyncState;
use crate::types::{
    CallDirection, CallHierarchy, CodeActionEntry, CompletionList, Diagnostic, DocumentSymbol,
    FoldingRange, FormattingOptions, Hover, Location, LocationTarget, Position, Range,
    SemanticTokens, ServerState, ServerStatus, SignatureHelp, TextEdit, TypeDirection,
    TypeHierarchy, WorkspaceEdit, WorkspaceSymbolEntry, WorkspaceSymbolQuery,
};

type DocumentLock = Arc<tokio::sync::Mutex<DocumentSyncState>>;

/// Server configs by extension and language, plus the live clients.
struct Registry {
    by_extension: HashMap<String, ServerConfig>,
    by_language: BTreeMap<String, ServerConfig>,
    clients: HashMap<String, Arc<LspClient>>,
}

impl Registry {
    fn new(servers: Vec<ServerConfig>) -> Self {
        let mut by_extension: HashMap<String, ServerConfig> = HashMap::new();
        let mut by_language = BTreeMap::new();
        for server in servers {
            for ext in server.extensions() {
                if let Some(existing) = by_extension.get(ext) {
                    tracing::warn!(
                        "Multiple LSP servers configured for extension '{ext}': '{}' and '{}'. Using '{}'.",
                        existing.language(),
                        server.language(),
                        existing.language()
                    );
                    continue;
                }
                by_extension.insert(ext.clone(), server.clone());
            }
            by_language.insert(server.language().to_string(), server);
        }
        Self {
            by_extension,
            by_language,
            clients: HashMap::new(),
        }
    }
}

/// Public facade for the LSP client subsystem.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct LspManager {
    root: PathBuf,
    root_uri: String,
    workspace_name: String,
    request_timeout: Duration,
    registry: RwLock<Registry>,
    documents: Mutex<HashMap<String, DocumentLock>>,
    cache: CacheStore,
    diagnostics: Arc<Mutex<DiagnosticsStore>>,
    diagnostics_callback: Arc<RwLock<Option<DiagnosticsHandler>>>,
    cancel: Mutex<CancellationToken>,
    next_generation: AtomicU64,
}

impl LspManager {
    /// Build a manager for one workspace root. No server is started yet.
    pub fn new(config: LspConfig) -> LspResult<Self> {
        let cache = CacheStore::new(&config.cache);
        Self::with_cache(config, cache)
    }

    /// Like [`new`](Self::new) with a caller-provided cache store.
    pub fn with_cache(config: LspConfig, cache: CacheStore) -> LspResult<Self> {
        let root = std::path::absolute(&config.root)?;
        let root_uri = protocol::path_to_file_uri(&root)
            .map_err(|e| LspError::InvalidArgument(e.to_string()))?
            .to_string();
        let workspace_name = root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("workspace")
            .to_string();

        Ok(Self {
            root,
            root_uri,
            workspace_name,
            request_timeout: config.request_timeout,
            registry: RwLock::new(Registry::new(config.servers)),
            documents: Mutex::new(HashMap::new()),
            cache,
            diagnostics: Arc::new(Mutex::new(DiagnosticsStore::new())),
            diagnostics_callback: Arc::new(RwLock::new(None)),
            cancel: Mutex::new(CancellationToken::new()),
            next_generation: AtomicU64::new(1),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn root_uri(&self) -> &str {
        &self.root_uri
    }

    pub(crate) fn cache(&self) -> &CacheStore {
        &self.cache
    }

    fn registry(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Routing ────────────────────────────────────────────────────────

    pub(crate) fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub(crate) fn uri_for(&self, path: &Path) -> LspResult<String> {
        protocol::path_to_file_uri(path)
            .map(|u| u.to_string())
            .map_err(|e| LspError::InvalidArgument(e.to_string()))
    }

    pub(crate) fn config_for_path(&self, path: &Path) -> LspResult<ServerConfig> {
        let unsupported = || LspError::UnsupportedFile {
            path: path.to_path_buf(),
        };
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .ok_or_else(unsupported)?;
        self.registry()
            .by_extension
            .get(&ext)
            .cloned()
            .ok_or_else(unsupported)
    }

    /// Configured languages, sorted.
    #[must_use]
    pub fn languages(&self) -> Vec<String> {
        self.registry().by_language.keys().cloned().collect()
    }

    /// The language that would serve `path`, if any.
    #[must_use]
    pub fn language_for_path(&self, path: &Path) -> Option<String> {
        self.config_for_path(path)
            .ok()
            .map(|c| c.language().to_string())
    }

    // ── Documents ──────────────────────────────────────────────────────

    pub(crate) fn document_lock(&self, uri: &str, language: &str) -> DocumentLock {
        let mut documents = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(documents.entry(uri.to_string()).or_insert_with(|| {
            Arc::new(tokio::sync::Mutex::new(DocumentSyncState::new(uri, language)))
        }))
    }

    pub(crate) fn existing_document_lock(&self, uri: &str) -> Option<DocumentLock> {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uri)
            .cloned()
    }

    // ── Clients ────────────────────────────────────────────────────────

    pub(crate) fn current_client(&self, language: &str) -> Option<Arc<LspClient>> {
        self.registry().clients.get(language).cloned()
    }

    fn new_client(&self, config: ServerConfig) -> LspClient {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let store = Arc::clone(&self.diagnostics);
        let callback = Arc::clone(&self.diagnostics_callback);
        let handler: DiagnosticsHandler = Arc::new(move |uri: &str, items: &[Diagnostic]| {
            store
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .update(uri, items.to_vec());
            let callback = callback
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(callback) = callback {
                callback(uri, items);
            }
        });
        let cancel = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        LspClient::new(config, generation, self.request_timeout, handler, &cancel)
    }

    /// The running client for `language`, starting it if needed.
    ///
    /// Concurrent callers share one start: the first registers the client
    /// and runs the handshake, the others wait for it.
    pub async fn ensure_client(&self, language: &str) -> LspResult<Arc<LspClient>> {
        let language = normalize_language(language);

        let pending = {
            let registry = self.registry();
            if !registry.by_language.contains_key(&language) {
                return Err(LspError::UnknownLanguage(language));
            }
            match registry.clients.get(&language) {
                Some(client) if client.is_running() => return Ok(Arc::clone(client)),
                Some(client) if client.phase() != ClientPhase::Stopped => Some(Arc::clone(client)),
                _ => None,
            }
        };
        if let Some(client) = pending {
            client.wait_ready().await?;
            return Ok(client);
        }

        let (client, created, replaced) = {
            let mut registry = self.registry_mut();
            match registry.clients.get(&language) {
                Some(client) if client.phase() != ClientPhase::Stopped => {
                    (Arc::clone(client), false, None)
                }
                _ => {
                    let config = registry
                        .by_language
                        .get(&language)
                        .cloned()
                        .ok_or_else(|| LspError::UnknownLanguage(language.clone()))?;
                    let client = Arc::new(self.new_client(config));
                    let replaced = registry.clients.insert(language.clone(), Arc::clone(&client));
                    (client, true, replaced)
                }
            }
        };

        if let Some(old) = replaced {
            tracing::info!(language = %language, generation = old.generation(), "replacing stopped language server");
            old.stop().await;
        }
        if !created {
            client.wait_ready().await?;
            return Ok(client);
        }

        if let Err(e) = client.start(&self.root_uri, &self.workspace_name).await {
            let mut registry = self.registry_mut();
            if registry
                .clients
                .get(&language)
                .is_some_and(|c| Arc::ptr_eq(c, &client))
            {
                registry.clients.remove(&language);
            }
            return Err(e);
        }
        Ok(client)
    }

    /// Stop the current server for `language` and start a fresh one.
    pub async fn restart_client_for_language(&self, language: &str) -> LspResult<Arc<LspClient>> {
        let language = normalize_language(language);
        let old = self.registry_mut().clients.remove(&language);
        if let Some(old) = old {
            tracing::info!(language = %language, generation = old.generation(), "restarting language server");
            old.stop().await;
        }
        self.ensure_client(&language).await
    }

    /// Stop every server and mark every document closed.
    ///
    /// The manager stays usable: the next operation starts servers again.
    pub async fn stop_all(&self) {
        let old_token = {
            let mut cancel = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *cancel, CancellationToken::new())
        };
        let clients: Vec<Arc<LspClient>> = self
            .registry_mut()
            .clients
            .drain()
            .map(|(_, client)| client)
            .collect();

        for client in &clients {
            client.stop().await;
        }
        old_token.cancel();

        let documents: Vec<DocumentLock> = self
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for document in documents {
            document.lock().await.reset();
        }
        tracing::debug!(stopped = clients.len(), "all language servers stopped");
    }

    /// Stop everything and replace the server registry.
    ///
    /// Tracked documents are forgotten since their routing may have changed.
    pub async fn reload(&self, servers: Vec<ServerConfig>) {
        self.stop_all().await;
        *self.registry_mut() = Registry::new(servers);
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    // ── Status and diagnostics ─────────────────────────────────────────

    /// Every configured language with its server state.
    #[must_use]
    pub fn status(&self) -> Vec<ServerStatus> {
        let registry = self.registry();
        registry
            .by_language
            .values()
            .map(|config| {
                let client = registry.clients.get(config.language());
                ServerStatus {
                    language: config.language().to_string(),
                    command: config.command_line(),
                    state: client.map_or(ServerState::NotStarted, |c| c.state()),
                    pid: client.and_then(|c| c.pid()),
                }
            })
            .collect()
    }

    /// Latest diagnostics published for `path`.
    pub fn diagnostics(&self, path: &Path) -> LspResult<Vec<Diagnostic>> {
        let uri = self
            .uri_for(&self.resolve_path(path))
            .map_err(|e| e.in_op("diagnostics"))?;
        Ok(self
            .diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&uri))
    }

    /// All files' diagnostics, files with errors first.
    #[must_use]
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    /// Forward every publish to `handler` after it is stored.
    pub fn set_diagnostics_handler(&self, handler: Option<DiagnosticsHandler>) {
        *self
            .diagnostics_callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = handler;
    }

    // ── Operations ─────────────────────────────────────────────────────

    async fn position_request(
        &self,
        path: &Path,
        method: &str,
        position: Position,
    ) -> LspResult<(Value, Arc<LspClient>)> {
        let doc = self.with_bootstrapped_document(path).await?;
        let params = protocol::position_params(doc.uri(), position);
        let result = doc.client().request(method, Some(params)).await?;
        Ok((result, Arc::clone(doc.client())))
    }

    async fn document_request(&self, path: &Path, method: &str) -> LspResult<(Value, Arc<LspClient>)> {
        let doc = self.with_bootstrapped_document(path).await?;
        let params = protocol::text_document_params(doc.uri());
        let result = doc.client().request(method, Some(params)).await?;
        Ok((result, Arc::clone(doc.client())))
    }

    pub async fn hover(&self, path: &Path, position: Position) -> LspResult<Option<Hover>> {
        async {
            let (result, _) = self
                .position_request(path, "textDocument/hover", position)
                .await?;
            decode::decode_hover(result)
        }
        .await
        .map_err(|e| e.in_op("hover"))
    }

    pub async fn definition(&self, path: &Path, position: Position) -> LspResult<Vec<LocationTarget>> {
        async {
            let (result, _) = self
                .position_request(path, "textDocument/definition", position)
                .await?;
            decode::decode_locations(result)
        }
        .await
        .map_err(|e| e.in_op("definition"))
    }

    pub async fn type_definition(
        &self,
        path: &Path,
        position: Position,
    ) -> LspResult<Vec<LocationTarget>> {
        async {
            let (result, _) = self
                .position_request(path, "textDocument/typeDefinition", position)
                .await?;
            decode::decode_locations(result)
        }
        .await
        .map_err(|e| e.in_op("type_definition"))
    }

    pub async fn implementation(
        &self,
        path: &Path,
        position: Position,
    ) -> LspResult<Vec<LocationTarget>> {
        async {
            let (result, _) = self
                .position_request(path, "textDocument/implementation", position)
                .await?;
            decode::decode_locations(result)
        }
        .await
        .map_err(|e| e.in_op("implementation"))
    }

    pub async fn references(
        &self,
        path: &Path,
        position: Position,
        include_declaration: bool,
    ) -> LspResult<Vec<Location>> {
        async {
            let doc = self.with_bootstrapped_document(path).await?;
            let params = protocol::references_params(doc.uri(), position, include_declaration);
            let result = doc
                .client()
                .request("textDocument/references", Some(params))
                .await?;
            decode::decode_references(result)
        }
        .await
        .map_err(|e| e.in_op("references"))
    }

    pub async fn document_symbol(&self, path: &Path) -> LspResult<Vec<DocumentSymbol>> {
        async {
            let (result, _) = self
                .document_request(path, "textDocument/documentSymbol")
                .await?;
            decode::decode_document_symbols(result)
        }
        .await
        .map_err(|e| e.in_op("document_symbol"))
    }

    pub async fn completion(&self, path: &Path, position: Position) -> LspResult<CompletionList> {
        async {
            let (result, _) = self
                .position_request(path, "textDocument/completion", position)
                .await?;
            decode::decode_completion(result)
        }
        .await
        .map_err(|e| e.in_op("completion"))
    }

    pub async fn rename(
        &self,
        path: &Path,
        position: Position,
        new_name: &str,
    ) -> LspResult<WorkspaceEdit> {
        async {
            if new_name.trim().is_empty() {
                return Err(LspError::InvalidArgument(
                    "new name must not be empty".to_string(),
                ));
            }
            let doc = self.with_bootstrapped_document(path).await?;
            let params = protocol::rename_params(doc.uri(), position, new_name);
            let result = doc
                .client()
                .request("textDocument/rename", Some(params))
                .await?;
            decode::decode_workspace_edit(result)
        }
        .await
        .map_err(|e| e.in_op("rename"))
    }

    /// Code actions for `range`, with the stored diagnostics it touches as context.
    pub async fn code_action(&self, path: &Path, range: Range) -> LspResult<Vec<CodeActionEntry>> {
        async {
            let doc = self.with_bootstrapped_document(path).await?;
            let diagnostics = self
                .diagnostics
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .overlapping(doc.uri(), &range);
            let params = protocol::code_action_params(doc.uri(), range, &diagnostics);
            let result = doc
                .client()
                .request("textDocument/codeAction", Some(params))
                .await?;
            decode::decode_code_actions(result)
        }
        .await
        .map_err(|e| e.in_op("code_action"))
    }

    pub async fn signature_help(
        &self,
        path: &Path,
        position: Position,
    ) -> LspResult<Option<SignatureHelp>> {
        async {
            let (result, _) = self
                .position_request(path, "textDocument/signatureHelp", position)
                .await?;
            decode::decode_signature_help(result)
        }
        .await
        .map_err(|e| e.in_op("signature_help"))
    }

    pub async fn format(&self, path: &Path, options: FormattingOptions) -> LspResult<Vec<TextEdit>> {
        async {
            let doc = self.with_bootstrapped_document(path).await?;
            let params = protocol::formatting_params(doc.uri(), options);
            let result = doc
                .client()
                .request("textDocument/formatting", Some(params))
                .await?;
            decode::decode_text_edits(result)
        }
        .await
        .map_err(|e| e.in_op("format"))
    }

    pub async fn semantic_tokens(&self, path: &Path) -> LspResult<SemanticTokens> {
        async {
            let (result, client) = self
                .document_request(path, "textDocument/semanticTokens/full")
                .await?;
            decode::decode_semantic_tokens(result, client.semantic_legend().as_ref())
        }
        .await
        .map_err(|e| e.in_op("semantic_tokens"))
    }

    pub async fn folding_range(&self, path: &Path) -> LspResult<Vec<FoldingRange>> {
        async {
            let (result, _) = self
                .document_request(path, "textDocument/foldingRange")
                .await?;
            decode::decode_folding_ranges(result)
        }
        .await
        .map_err(|e| e.in_op("folding_range"))
    }

    /// Prepare the call hierarchy at `position` and resolve one direction.
    pub async fn call_hierarchy(
        &self,
        path: &Path,
        position: Position,
        direction: CallDirection,
    ) -> LspResult<CallHierarchy> {
        async {
            let doc = self.with_bootstrapped_document(path).await?;
            let params = protocol::position_params(doc.uri(), position);
            let prepared = doc
                .client()
                .request("textDocument/prepareCallHierarchy", Some(params))
                .await?;
            let items = decode::decode_hierarchy_items(prepared)?;

            let method = match direction {
                CallDirection::Incoming => "callHierarchy/incomingCalls",
                CallDirection::Outgoing => "callHierarchy/outgoingCalls",
            };
            let mut calls = Vec::new();
            for item in &items {
                let result = doc
                    .client()
                    .request(method, Some(protocol::hierarchy_item_params(item)))
                    .await?;
                calls.extend(match direction {
                    CallDirection::Incoming => decode::decode_incoming_calls(result)?,
                    CallDirection::Outgoing => decode::decode_outgoing_calls(result)?,
                });
            }
            Ok(CallHierarchy {
                direction,
                items,
                calls,
            })
        }
        .await
        .map_err(|e: LspError| e.in_op("call_hierarchy"))
    }

    /// Prepare the type hierarchy at `position` and resolve one direction.
    pub async fn type_hierarchy(
        &self,
        path: &Path,
        position: Position,
        direction: TypeDirection,
    ) -> LspResult<TypeHierarchy> {
        async {
            let doc = self.with_bootstrapped_document(path).await?;
            let params = protocol::position_params(doc.uri(), position);
            let prepared = doc
                .client()
                .request("textDocument/prepareTypeHierarchy", Some(params))
                .await?;
            let items = decode::decode_hierarchy_items(prepared)?;

            let method = match direction {
                TypeDirection::Supertypes => "typeHierarchy/supertypes",
                TypeDirection::Subtypes => "typeHierarchy/subtypes",
            };
            let mut related = Vec::new();
            for item in &items {
                let result = doc
                    .client()
                    .request(method, Some(protocol::hierarchy_item_params(item)))
                    .await?;
                related.extend(decode::decode_hierarchy_items(result)?);
            }
            Ok(TypeHierarchy {
                direction,
                items,
                related,
            })
        }
        .await
        .map_err(|e: LspError| e.in_op("type_hierarchy"))
    }

    /// `workspace/symbol` on the server chosen by exactly one of
    /// `query.file_path` or `query.language`.
    pub async fn workspace_symbol(
        &self,
        query: &WorkspaceSymbolQuery,
    ) -> LspResult<Vec<WorkspaceSymbolEntry>> {
        async {
            let file_path = query
                .file_path
                .as_deref()
                .filter(|p| !p.as_os_str().is_empty());
            let language = query.language.as_deref().filter(|l| !l.trim().is_empty());
            let params = protocol::workspace_symbol_params(&query.query);

            let result = match (file_path, language) {
                (Some(path), None) => {
                    let doc = self.with_bootstrapped_document(path).await?;
                    doc.client()
                        .request("workspace/symbol", Some(params))
                        .await?
                }
                (None, Some(language)) => {
                    let client = self.ensure_client(language).await?;
                    client.request("workspace/symbol", Some(params)).await?
                }
                _ => {
                    return Err(LspError::InvalidArgument(
                        "exactly one of file_path or language is required".to_string(),
                    ));
                }
            };
            decode::decode_workspace_symbols(result)
        }
        .await
        .map_err(|e| e.in_op("workspace_symbol"))
    }
}
