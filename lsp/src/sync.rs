//! Per-document synchronization with the language server.
//!
//! Every operation funnels through [`LspManager::with_bootstrapped_document`],
//! which reconciles three views of a file: what is on disk, what the server
//! was last told, and what a caller pushed with [`LspManager::change_file`]
//! without saving. A document lives in one of three states:
//!
//! - closed: never opened, explicitly closed, or opened on a replaced server
//! - open + disk-backed: the server holds the disk content
//! - open + memory-only: the server holds unsaved content from `change_file`
//!
//! Unsaved content is never overwritten by a disk read. It becomes
//! disk-backed again only once the disk content hashes the same.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use tokio::sync::OwnedMutexGuard;

use crate::cache::{CacheKey, DocumentCacheRecord, OpenState, sha256_hex};
use crate::client::LspClient;
use crate::config::ServerConfig;
use crate::error::{LspError, LspResult};
use crate::manager::LspManager;
use crate::types::DocumentStatus;

/// Client-side record of what the server holds for one URI.
#[derive(Debug)]
pub(crate) struct DocumentSyncState {
    uri: String,
    language: String,
    version: i32,
    mtime_ns: u64,
    size: u64,
    content_hash: String,
    content: Option<String>,
    disk_backed: bool,
    open: bool,
    client_generation: u64,
    seeded: bool,
}

impl DocumentSyncState {
    pub(crate) fn new(uri: &str, language: &str) -> Self {
        Self {
            uri: uri.to_string(),
            language: language.to_string(),
            version: 0,
            mtime_ns: 0,
            size: 0,
            content_hash: String::new(),
            content: None,
            disk_backed: false,
            open: false,
            client_generation: 0,
            seeded: false,
        }
    }

    /// Mark closed without dropping unsaved content.
    pub(crate) fn reset(&mut self) {
        self.open = false;
    }

    fn is_open_on(&self, client: &LspClient) -> bool {
        self.open && self.client_generation == client.generation()
    }

    fn is_memory_only(&self) -> bool {
        !self.disk_backed && self.content.is_some()
    }

    fn matches_disk(&self, disk: &DiskSnapshot) -> bool {
        self.mtime_ns == disk.mtime_ns && self.size == disk.size && self.content_hash == disk.hash
    }

    fn adopt_disk(&mut self, disk: DiskSnapshot) {
        self.mtime_ns = disk.mtime_ns;
        self.size = disk.size;
        self.content_hash = disk.hash;
        self.content = Some(disk.text);
        self.disk_backed = true;
    }

    fn mark_open(&mut self, client: &LspClient, version: i32) {
        self.version = version;
        self.open = true;
        self.client_generation = client.generation();
    }

    fn to_status(&self, open: bool) -> DocumentStatus {
        DocumentStatus {
            uri: self.uri.clone(),
            language: self.language.clone(),
            version: self.version,
            open,
            disk_backed: self.disk_backed,
            content_hash: self.content_hash.clone(),
        }
    }

    fn cache_record(&self, last_synced_at: u64) -> DocumentCacheRecord {
        let open_state = match (self.open, self.disk_backed) {
            (false, _) => OpenState::Closed,
            (true, true) => OpenState::DiskBacked,
            (true, false) => OpenState::MemoryOnly,
        };
        DocumentCacheRecord {
            uri: self.uri.clone(),
            version: self.version,
            mtime_ns: self.mtime_ns,
            size: self.size,
            content_hash: self.content_hash.clone(),
            last_synced_at,
            open_state,
        }
    }
}

/// File content and metadata as read from disk.
#[derive(Debug)]
struct DiskSnapshot {
    text: String,
    mtime_ns: u64,
    size: u64,
    hash: String,
}

/// Read `path` as sent to the server. Invalid UTF-8 is replaced, not
/// rejected; the hash covers the raw bytes.
async fn read_disk(path: &Path) -> LspResult<Option<DiskSnapshot>> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mtime_ns = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX));
    let hash = sha256_hex(&bytes);
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => {
            tracing::debug!(path = %path.display(), "file is not valid UTF-8; sending it lossily");
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        }
    };
    Ok(Some(DiskSnapshot {
        hash,
        size: metadata.len(),
        mtime_ns,
        text,
    }))
}

/// The version after `version`.
fn next_version(version: i32) -> LspResult<i32> {
    version.checked_add(1).ok_or_else(|| {
        LspError::InvalidArgument(format!("document version {version} cannot be incremented"))
    })
}

/// A document synchronized with its server, locked for one operation.
///
/// Holds the per-URI lock: no other operation on this URI runs until the
/// guard is dropped.
pub struct BootstrappedDocument {
    state: OwnedMutexGuard<DocumentSyncState>,
    client: Arc<LspClient>,
    path: PathBuf,
}

impl BootstrappedDocument {
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.state.uri
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn client(&self) -> &Arc<LspClient> {
        &self.client
    }

    #[must_use]
    pub fn status(&self) -> DocumentStatus {
        self.state.to_status(self.state.is_open_on(&self.client))
    }
}

impl LspManager {
    /// Bring `path` in sync with its server and lock it for one operation.
    pub async fn with_bootstrapped_document(&self, path: &Path) -> LspResult<BootstrappedDocument> {
        let path = self.resolve_path(path);
        let config = self.config_for_path(&path)?;
        let uri = self.uri_for(&path)?;
        let mut state = self
            .document_lock(&uri, config.language())
            .lock_owned()
            .await;
        let client = self.ensure_client(config.language()).await?;
        self.seed_from_cache(&mut state);

        let disk = read_disk(&path).await?;
        let client = self
            .reconcile(&mut state, client, &config, &path, disk)
            .await?;

        Ok(BootstrappedDocument {
            state,
            client,
            path,
        })
    }

    /// Open (or re-sync) `path` without running an operation.
    pub async fn open_file(&self, path: &Path) -> LspResult<()> {
        self.with_bootstrapped_document(path)
            .await
            .map(drop)
            .map_err(|e| e.in_op("open_file"))
    }

    /// Like [`open_file`](Self::open_file), returning the resulting state.
    pub async fn bootstrap_document(&self, path: &Path) -> LspResult<DocumentStatus> {
        self.with_bootstrapped_document(path)
            .await
            .map(|doc| doc.status())
            .map_err(|e| e.in_op("bootstrap_document"))
    }

    /// Push unsaved `content` for `path`.
    ///
    /// A `version` not ahead of the tracked one is bumped to tracked + 1,
    /// which is an `InvalidArgument` once the tracked version is `i32::MAX`.
    /// The document becomes memory-only until disk catches up.
    pub async fn change_file(
        &self,
        path: &Path,
        version: i32,
        content: &str,
    ) -> LspResult<DocumentStatus> {
        async {
            let path = self.resolve_path(path);
            let config = self.config_for_path(&path)?;
            let uri = self.uri_for(&path)?;
            let mut state = self
                .document_lock(&uri, config.language())
                .lock_owned()
                .await;
            let client = self.ensure_client(config.language()).await?;
            self.seed_from_cache(&mut state);

            let version = if version > state.version {
                version
            } else {
                next_version(state.version)?
            };
            let was_open = state.is_open_on(&client);
            let language_id = config.language_id_for(&path);
            let client = self
                .push_content(client, &uri, &language_id, version, content, was_open)
                .await?;

            state.content = Some(content.to_string());
            state.content_hash = sha256_hex(content.as_bytes());
            state.disk_backed = false;
            state.mark_open(&client, version);
            self.record(&state);
            tracing::debug!(uri = %uri, version, "document changed in memory");
            Ok::<_, LspError>(state.to_status(true))
        }
        .await
        .map_err(|e| e.in_op("change_file"))
    }

    /// Close `path` on its server and forget its unsaved content.
    ///
    /// A failing `didClose` is logged; the document is closed regardless.
    pub async fn close_file(&self, path: &Path) -> LspResult<()> {
        async {
            let path = self.resolve_path(path);
            let config = self.config_for_path(&path)?;
            let uri = self.uri_for(&path)?;
            let mut state = self
                .document_lock(&uri, config.language())
                .lock_owned()
                .await;

            if let Some(client) = self.current_client(config.language())
                && client.is_running()
                && state.is_open_on(&client)
                && let Err(e) = client.did_close(&uri).await
            {
                tracing::warn!(uri = %uri, error = %e, "didClose failed");
            }

            state.open = false;
            state.content = None;
            state.disk_backed = false;
            self.record(&state);
            Ok::<_, LspError>(())
        }
        .await
        .map_err(|e| e.in_op("close_file"))
    }

    /// Tracked state of `path`, without contacting any server.
    pub async fn document_status(&self, path: &Path) -> LspResult<Option<DocumentStatus>> {
        let path = self.resolve_path(path);
        let config = self
            .config_for_path(&path)
            .map_err(|e| e.in_op("document_status"))?;
        let uri = self.uri_for(&path).map_err(|e| e.in_op("document_status"))?;
        let Some(lock) = self.existing_document_lock(&uri) else {
            return Ok(None);
        };
        let state = lock.lock().await;
        let open = self
            .current_client(config.language())
            .is_some_and(|c| c.is_running() && state.is_open_on(&c));
        Ok(Some(state.to_status(open)))
    }

    fn cache_key(&self, state: &DocumentSyncState) -> CacheKey {
        CacheKey::new(self.root_uri(), &state.language, &state.uri)
    }

    fn seed_from_cache(&self, state: &mut DocumentSyncState) {
        if state.seeded {
            return;
        }
        state.seeded = true;
        if let Some(record) = self.cache().load(&self.cache_key(state)) {
            tracing::debug!(uri = %state.uri, version = record.version, "seeded baseline from cache");
            state.version = record.version;
            state.mtime_ns = record.mtime_ns;
            state.size = record.size;
            state.content_hash = record.content_hash;
        }
    }

    fn record(&self, state: &DocumentSyncState) {
        let record = state.cache_record(self.cache().now_millis());
        self.cache().upsert(&self.cache_key(state), record);
    }

    async fn reconcile(
        &self,
        state: &mut DocumentSyncState,
        client: Arc<LspClient>,
        config: &ServerConfig,
        path: &Path,
        disk: Option<DiskSnapshot>,
    ) -> LspResult<Arc<LspClient>> {
        let uri = state.uri.clone();
        let language_id = config.language_id_for(path);
        let open_here = state.is_open_on(&client);

        // Unsaved edits on this server: adopt disk only once it caught up.
        if open_here && state.is_memory_only() {
            if let Some(disk) = disk
                && disk.hash == state.content_hash
            {
                tracing::debug!(uri = %uri, "disk caught up with memory; document is disk-backed");
                state.adopt_disk(disk);
                self.record(state);
            }
            return Ok(client);
        }

        // Unsaved edits, but the server that held them is gone.
        if !open_here && state.is_memory_only() {
            let text = state.content.clone().unwrap_or_default();
            let version = state.version.max(1);
            tracing::debug!(uri = %uri, version, "reopening unsaved content on new server");
            let client = self
                .push_content(client, &uri, &language_id, version, &text, false)
                .await?;
            state.mark_open(&client, version);
            self.record(state);
            return Ok(client);
        }

        if !open_here {
            let Some(disk) = disk else {
                return Err(LspError::FileNotFound {
                    path: path.to_path_buf(),
                });
            };
            let version = if state.matches_disk(&disk) {
                state.version.max(1)
            } else {
                next_version(state.version)?.max(1)
            };
            tracing::debug!(uri = %uri, version, "opening document");
            let client = self
                .push_content(client, &uri, &language_id, version, &disk.text, false)
                .await?;
            state.adopt_disk(disk);
            state.mark_open(&client, version);
            self.record(state);
            return Ok(client);
        }

        // Open and disk-backed.
        let Some(disk) = disk else {
            tracing::debug!(uri = %uri, "file deleted; keeping the server's view");
            return Ok(client);
        };
        if state.matches_disk(&disk) {
            return Ok(client);
        }
        let version = next_version(state.version)?;
        tracing::debug!(uri = %uri, version, "disk changed; re-syncing");
        let client = self
            .push_content(client, &uri, &language_id, version, &disk.text, true)
            .await?;
        state.adopt_disk(disk);
        state.mark_open(&client, version);
        self.record(state);
        Ok(client)
    }

    /// Deliver `text` at `version`, escalating on failure.
    ///
    /// An open document goes `didChange`, then `didClose` + `didOpen`; a
    /// closed one goes `didOpen`. The last rung restarts the server and opens
    /// the document there. Returns the client now holding the document.
    async fn push_content(
        &self,
        client: Arc<LspClient>,
        uri: &str,
        language_id: &str,
        version: i32,
        text: &str,
        was_open: bool,
    ) -> LspResult<Arc<LspClient>> {
        if was_open {
            match client.did_change(uri, version, text).await {
                Ok(()) => return Ok(client),
                Err(e) => tracing::warn!(uri, version, error = %e, "didChange failed; reopening"),
            }
            let reopened = async {
                client.did_close(uri).await?;
                client.did_open(uri, language_id, version, text).await
            };
            match reopened.await {
                Ok(()) => return Ok(client),
                Err(e) => tracing::warn!(uri, version, error = %e, "reopen failed; restarting server"),
            }
        } else {
            match client.did_open(uri, language_id, version, text).await {
                Ok(()) => return Ok(client),
                Err(e) => tracing::warn!(uri, version, error = %e, "didOpen failed; restarting server"),
            }
        }

        let language = client.language().to_string();
        let restart_failed = |source: LspError| LspError::RestartFailed {
            language: language.clone(),
            source: Box::new(source),
        };
        let fresh = self
            .restart_client_for_language(&language)
            .await
            .map_err(restart_failed)?;
        fresh
            .did_open(uri, language_id, version, text)
            .await
            .map_err(restart_failed)?;
        Ok(fresh)
    }
}
