//! Two-tier cache of document sync metadata.
//!
//! Records are advisory: they seed a baseline version for a document that is
//! always re-verified against disk, so losing or corrupting the cache only
//! costs a version bump. Layout on disk:
//!
//! ```text
//! <dir>/<sha256(workspace)>/<language>/<sha256(uri)>.json
//! ```
//!
//! The persistent tier is checked lazily with a sentinel write. Any check or
//! write failure demotes the store to memory-only for the rest of the process
//! and logs a single warning; callers never see cache errors.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::config::{CacheConfig, normalize_language};

/// Source of "now" for TTL decisions.
pub type Clock = Arc<dyn Fn() -> SystemTime + Send + Sync>;

#[must_use]
pub fn system_clock() -> Clock {
    Arc::new(SystemTime::now)
}

/// Lowercase hex SHA-256 of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for b in digest {
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenState {
    Closed,
    DiskBacked,
    MemoryOnly,
}

/// Last-known sync metadata of one document. Never holds file content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentCacheRecord {
    pub uri: String,
    pub version: i32,
    pub mtime_ns: u64,
    pub size: u64,
    pub content_hash: String,
    /// Milliseconds since the Unix epoch.
    pub last_synced_at: u64,
    pub open_state: OpenState,
}

/// `sha256(workspace) | language | sha256(uri)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    workspace: String,
    language: String,
    document: String,
}

impl CacheKey {
    #[must_use]
    pub fn new(workspace: &str, language: &str, uri: &str) -> Self {
        Self {
            workspace: sha256_hex(workspace.as_bytes()),
            language: normalize_language(language),
            document: sha256_hex(uri.trim().as_bytes()),
        }
    }

    fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(&self.workspace)
            .join(&self.language)
            .join(format!("{}.json", self.document))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}|{}", self.workspace, self.language, self.document)
    }
}

const PERSIST_UNKNOWN: u8 = 0;
const PERSIST_READY: u8 = 1;
const PERSIST_DISABLED: u8 = 2;

pub struct CacheStore {
    dir: PathBuf,
    ttl: Duration,
    cleanup_interval: Duration,
    clock: Clock,
    memory: Mutex<HashMap<CacheKey, DocumentCacheRecord>>,
    persist: AtomicU8,
    demotion_logged: AtomicBool,
    cleanup_running: Arc<AtomicBool>,
    last_cleanup: Mutex<Option<SystemTime>>,
}

impl CacheStore {
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    #[must_use]
    pub fn with_clock(config: &CacheConfig, clock: Clock) -> Self {
        let persist = if config.enabled {
            PERSIST_UNKNOWN
        } else {
            PERSIST_DISABLED
        };
        Self {
            dir: config.dir.clone(),
            ttl: config.ttl,
            cleanup_interval: config.cleanup_interval,
            clock,
            memory: Mutex::new(HashMap::new()),
            persist: AtomicU8::new(persist),
            demotion_logged: AtomicBool::new(false),
            cleanup_running: Arc::new(AtomicBool::new(false)),
            last_cleanup: Mutex::new(None),
        }
    }

    /// Current time in epoch milliseconds, for stamping records.
    #[must_use]
    pub fn now_millis(&self) -> u64 {
        unix_millis((self.clock)())
    }

    /// Whether the persistent tier is usable, probing it on first call.
    pub fn is_persistent(&self) -> bool {
        match self.persist.load(Ordering::Acquire) {
            PERSIST_READY => true,
            PERSIST_DISABLED => false,
            _ => match self.check_writable() {
                Ok(()) => {
                    self.persist.store(PERSIST_READY, Ordering::Release);
                    true
                }
                Err(e) => {
                    self.demote(&e);
                    false
                }
            },
        }
    }

    fn check_writable(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut sentinel = NamedTempFile::new_in(&self.dir)?;
        sentinel.write_all(b"ok")?;
        sentinel.as_file().sync_all()?;
        sentinel.close()
    }

    fn demote(&self, err: &dyn std::fmt::Display) {
        self.persist.store(PERSIST_DISABLED, Ordering::Release);
        if !self.demotion_logged.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                dir = %self.dir.display(),
                error = %err,
                "LSP sync cache unavailable; continuing memory-only"
            );
        }
    }

    fn is_expired(&self, record: &DocumentCacheRecord, now: SystemTime) -> bool {
        let age = unix_millis(now).saturating_sub(record.last_synced_at);
        u128::from(age) > self.ttl.as_millis()
    }

    fn memory(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, DocumentCacheRecord>> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a record: memory first, then the persistent tier.
    pub fn load(&self, key: &CacheKey) -> Option<DocumentCacheRecord> {
        let now = (self.clock)();
        {
            let mut memory = self.memory();
            if let Some(record) = memory.get(key) {
                if !self.is_expired(record, now) {
                    return Some(record.clone());
                }
                memory.remove(key);
                drop(memory);
                if self.persist.load(Ordering::Acquire) == PERSIST_READY {
                    let _ = fs::remove_file(key.path_in(&self.dir));
                }
                return None;
            }
        }

        if !self.is_persistent() {
            return None;
        }

        let path = key.path_in(&self.dir);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "cache read failed");
                return None;
            }
        };
        let Ok(record) = serde_json::from_slice::<DocumentCacheRecord>(&bytes) else {
            tracing::debug!(path = %path.display(), "removing undecodable cache record");
            let _ = fs::remove_file(&path);
            return None;
        };
        if self.is_expired(&record, now) {
            let _ = fs::remove_file(&path);
            return None;
        }

        self.memory().insert(key.clone(), record.clone());
        Some(record)
    }

    /// Record `record` in memory and, when possible, on disk.
    pub fn upsert(&self, key: &CacheKey, record: DocumentCacheRecord) {
        self.memory().insert(key.clone(), record.clone());

        if self.is_persistent()
            && let Err(e) = write_record(&key.path_in(&self.dir), &record)
        {
            self.demote(&e);
        }

        self.maybe_cleanup();
    }

    /// Forget `key` in both tiers.
    pub fn remove(&self, key: &CacheKey) {
        self.memory().remove(key);
        if self.persist.load(Ordering::Acquire) == PERSIST_READY {
            let _ = fs::remove_file(key.path_in(&self.dir));
        }
    }

    /// Run a cleanup cycle unless one ran within the cleanup interval.
    pub fn maybe_cleanup(&self) {
        let now = (self.clock)();
        {
            let mut last = self
                .last_cleanup
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let due = last.is_none_or(|at| {
                now.duration_since(at)
                    .is_ok_and(|elapsed| elapsed >= self.cleanup_interval)
            });
            if !due {
                return;
            }
            *last = Some(now);
        }
        // Detached; at most one walk runs at a time.
        let _ = self.cleanup_now();
    }

    /// Expire memory entries now and start a filesystem walk.
    ///
    /// Returns the walk's handle (yielding the number of files deleted), or
    /// `None` when the tier is memory-only or a walk is already running.
    pub fn cleanup_now(&self) -> Option<JoinHandle<usize>> {
        let now = (self.clock)();
        self.memory()
            .retain(|_, record| !self.is_expired(record, now));

        if !self.is_persistent() {
            return None;
        }
        if self
            .cleanup_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        let running = Arc::clone(&self.cleanup_running);
        let dir = self.dir.clone();
        let ttl_millis = self.ttl.as_millis();
        let now_millis = unix_millis(now);
        let spawned = std::thread::Builder::new()
            .name("relay-lsp-cache-cleanup".to_string())
            .spawn(move || {
                let _reset = RunningFlag(running);
                let removed = sweep(&dir, now_millis, ttl_millis);
                if removed > 0 {
                    tracing::debug!(removed, "removed expired LSP cache records");
                }
                removed
            });
        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                self.cleanup_running.store(false, Ordering::Release);
                tracing::debug!(error = %e, "could not spawn cache cleanup thread");
                None
            }
        }
    }
}

/// Clears the cleanup flag when the walk ends, even by panic.
struct RunningFlag(Arc<AtomicBool>);

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

fn write_record(path: &Path, record: &DocumentCacheRecord) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("cache record path has no parent"))?;
    fs::create_dir_all(parent)?;
    let bytes = serde_json::to_vec_pretty(record)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(&bytes)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Delete expired or undecodable `*.json` records two levels below `dir`.
fn sweep(dir: &Path, now_millis: u64, ttl_millis: u128) -> usize {
    let mut removed = 0;
    let Ok(workspaces) = fs::read_dir(dir) else {
        return 0;
    };
    for workspace in workspaces.flatten() {
        let Ok(languages) = fs::read_dir(workspace.path()) else {
            continue;
        };
        for language in languages.flatten() {
            let Ok(files) = fs::read_dir(language.path()) else {
                continue;
            };
            for file in files.flatten() {
                let path = file.path();
                if path.extension().is_none_or(|e| e != "json") {
                    continue;
                }
                let stale = match fs::read(&path) {
                    Ok(bytes) => match serde_json::from_slice::<DocumentCacheRecord>(&bytes) {
                        Ok(record) => {
                            u128::from(now_millis.saturating_sub(record.last_synced_at))
                                > ttl_millis
                        }
                        Err(_) => true,
                    },
                    Err(_) => false,
                };
                if stale && fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestClock(Arc<Mutex<SystemTime>>);

    impl TestClock {
        fn new() -> Self {
            Self(Arc::new(Mutex::new(
                UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            )))
        }

        fn clock(&self) -> Clock {
            let now = Arc::clone(&self.0);
            Arc::new(move || *now.lock().unwrap())
        }

        fn advance(&self, by: Duration) {
            *self.0.lock().unwrap() += by;
        }
    }

    fn config(dir: &Path) -> CacheConfig {
        CacheConfig {
            enabled: true,
            dir: dir.to_path_buf(),
            ttl: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(3600),
        }
    }

    fn record(store: &CacheStore, uri: &str, version: i32) -> DocumentCacheRecord {
        DocumentCacheRecord {
            uri: uri.to_string(),
            version,
            mtime_ns: 1,
            size: 12,
            content_hash: sha256_hex(b"package main"),
            last_synced_at: store.now_millis(),
            open_state: OpenState::DiskBacked,
        }
    }

    #[test]
    fn test_key_layout() {
        let key = CacheKey::new("file:///work", "golang", " file:///work/main.go ");
        assert_eq!(key.language, "go");
        assert_eq!(key.document, sha256_hex(b"file:///work/main.go"));
        let path = key.path_in(Path::new("/cache"));
        assert!(path.starts_with(Path::new("/cache").join(sha256_hex(b"file:///work"))));
        assert_eq!(path.extension().unwrap(), "json");
        assert_eq!(key.to_string().split('|').count(), 3);
    }

    #[test]
    fn test_roundtrip_survives_new_store() {
        let dir = tempfile::tempdir().unwrap();
        let clock = TestClock::new();
        let key = CacheKey::new("ws", "go", "file:///ws/a.go");

        let store = CacheStore::with_clock(&config(dir.path()), clock.clock());
        let rec = record(&store, "file:///ws/a.go", 3);
        store.upsert(&key, rec.clone());
        assert_eq!(store.load(&key), Some(rec.clone()));
        assert!(key.path_in(dir.path()).exists());

        let fresh = CacheStore::with_clock(&config(dir.path()), clock.clock());
        assert_eq!(fresh.load(&key), Some(rec));
    }

    #[test]
    fn test_ttl_expiry_removes_memory_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let clock = TestClock::new();
        let store = CacheStore::with_clock(&config(dir.path()), clock.clock());
        let key = CacheKey::new("ws", "go", "file:///ws/a.go");
        store.upsert(&key, record(&store, "file:///ws/a.go", 1));

        clock.advance(Duration::from_secs(61));
        assert_eq!(store.load(&key), None);
        assert!(!key.path_in(dir.path()).exists());
    }

    #[test]
    fn test_expired_file_is_a_miss_for_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let clock = TestClock::new();
        let key = CacheKey::new("ws", "rust", "file:///ws/lib.rs");
        let store = CacheStore::with_clock(&config(dir.path()), clock.clock());
        store.upsert(&key, record(&store, "file:///ws/lib.rs", 1));

        clock.advance(Duration::from_secs(120));
        let fresh = CacheStore::with_clock(&config(dir.path()), clock.clock());
        assert_eq!(fresh.load(&key), None);
        assert!(!key.path_in(dir.path()).exists());
    }

    #[test]
    fn test_corrupt_file_self_heals() {
        let dir = tempfile::tempdir().unwrap();
        let key = CacheKey::new("ws", "go", "file:///ws/a.go");
        let path = key.path_in(dir.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{ not json").unwrap();

        let store = CacheStore::new(&config(dir.path()));
        assert_eq!(store.load(&key), None);
        assert!(!path.exists());

        let rec = record(&store, "file:///ws/a.go", 2);
        store.upsert(&key, rec.clone());
        assert_eq!(store.load(&key), Some(rec));
    }

    #[test]
    fn test_unwritable_dir_demotes_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"file in the way").unwrap();

        let store = CacheStore::new(&config(&blocker.join("cache")));
        let key = CacheKey::new("ws", "go", "file:///ws/a.go");
        let rec = record(&store, "file:///ws/a.go", 4);
        store.upsert(&key, rec.clone());

        assert!(!store.is_persistent());
        assert_eq!(store.load(&key), Some(rec));
        assert!(store.cleanup_now().is_none());
    }

    #[test]
    fn test_disabled_cache_never_touches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        let mut cfg = config(&cache_dir);
        cfg.enabled = false;

        let store = CacheStore::new(&cfg);
        let key = CacheKey::new("ws", "go", "file:///ws/a.go");
        store.upsert(&key, record(&store, "file:///ws/a.go", 1));
        assert!(store.load(&key).is_some());
        assert!(!cache_dir.exists());
    }

    #[test]
    fn test_disabled_cache_expiry_leaves_disk_alone() {
        let dir = tempfile::tempdir().unwrap();
        let clock = TestClock::new();
        let mut cfg = config(dir.path());
        cfg.enabled = false;
        let key = CacheKey::new("ws", "go", "file:///ws/a.go");
        let path = key.path_in(dir.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"owned by someone else").unwrap();

        let store = CacheStore::with_clock(&cfg, clock.clock());
        store.upsert(&key, record(&store, "file:///ws/a.go", 1));
        clock.advance(Duration::from_secs(61));
        assert_eq!(store.load(&key), None);
        assert!(path.exists());
    }

    #[test]
    fn test_remove_clears_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(&config(dir.path()));
        let key = CacheKey::new("ws", "go", "file:///ws/a.go");
        store.upsert(&key, record(&store, "file:///ws/a.go", 1));
        store.remove(&key);
        assert_eq!(store.load(&key), None);
        assert!(!key.path_in(dir.path()).exists());
    }

    #[test]
    fn test_cleanup_walk_deletes_expired_files() {
        let dir = tempfile::tempdir().unwrap();
        let clock = TestClock::new();
        let writer = CacheStore::with_clock(&config(dir.path()), clock.clock());
        let old = CacheKey::new("ws", "go", "file:///ws/old.go");
        writer.upsert(&old, record(&writer, "file:///ws/old.go", 1));
        while writer.cleanup_running.load(Ordering::Acquire) {
            std::thread::yield_now();
        }

        clock.advance(Duration::from_secs(90));
        let keep = CacheKey::new("ws", "go", "file:///ws/new.go");
        writer.upsert(&keep, record(&writer, "file:///ws/new.go", 1));

        let junk = dir.path().join("x").join("go").join("junk.json");
        fs::create_dir_all(junk.parent().unwrap()).unwrap();
        fs::write(&junk, b"garbage").unwrap();

        let store = CacheStore::with_clock(&config(dir.path()), clock.clock());
        let handle = store.cleanup_now().expect("walk should start");
        assert_eq!(handle.join().unwrap(), 2);
        assert!(!old.path_in(dir.path()).exists());
        assert!(keep.path_in(dir.path()).exists());
        assert!(!junk.exists());
    }

    #[test]
    fn test_cleanup_expires_memory_entries() {
        let clock = TestClock::new();
        let mut cfg = CacheConfig::memory_only();
        cfg.ttl = Duration::from_secs(10);
        let store = CacheStore::with_clock(&cfg, clock.clock());
        let key = CacheKey::new("ws", "go", "file:///ws/a.go");
        store.upsert(&key, record(&store, "file:///ws/a.go", 1));

        clock.advance(Duration::from_secs(11));
        assert!(store.cleanup_now().is_none());
        assert!(store.memory().is_empty());
    }
}
