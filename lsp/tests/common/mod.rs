//! Shared fixtures: a temporary workspace served by the stub server.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use relay_lsp::{CacheConfig, LspConfig, LspManager, Position, ServerConfig};
use tempfile::TempDir;

pub const STUB: &str = env!("CARGO_BIN_EXE_relay-stub-server");

/// Language served by the stub, for files ending in `.stub`.
pub const LANGUAGE: &str = "stub";

pub fn stub_server(args: &[&str]) -> ServerConfig {
    ServerConfig::new(
        LANGUAGE,
        STUB,
        args.iter().map(ToString::to_string).collect(),
        vec![LANGUAGE.to_string()],
    )
    .unwrap()
}

pub struct Workspace {
    pub dir: TempDir,
    pub manager: Arc<LspManager>,
}

impl Workspace {
    pub fn new() -> Self {
        Self::with_servers(vec![stub_server(&[])])
    }

    pub fn with_servers(servers: Vec<ServerConfig>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_for(dir.path(), servers, CacheConfig::memory_only());
        Self { dir, manager }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn read(&self, name: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(name)).unwrap()
    }

    /// Hover at the origin and parse the stub's `key: value` report.
    pub async fn inspect(&self, path: &Path) -> StubView {
        let hover = self
            .manager
            .hover(path, Position::new(0, 0))
            .await
            .unwrap()
            .expect("stub always answers hover for open documents");
        StubView::parse(&hover.contents)
    }
}

pub fn manager_for(root: &Path, servers: Vec<ServerConfig>, cache: CacheConfig) -> Arc<LspManager> {
    let config = LspConfig {
        root: root.to_path_buf(),
        servers,
        cache,
        request_timeout: Duration::from_secs(10),
    };
    Arc::new(LspManager::new(config).unwrap())
}

/// What the stub server reports about its copy of a document.
#[derive(Debug, Default)]
pub struct StubView {
    pub first_line: String,
    pub version: i32,
    pub opens: u32,
    pub max_in_flight: u32,
}

impl StubView {
    fn parse(report: &str) -> Self {
        let mut view = Self::default();
        for line in report.lines() {
            let Some((key, value)) = line.split_once(": ") else {
                continue;
            };
            match key {
                "first" => view.first_line = value.to_string(),
                "version" => view.version = value.parse().unwrap(),
                "opens" => view.opens = value.parse().unwrap(),
                "maxInFlight" => view.max_in_flight = value.parse().unwrap(),
                _ => {}
            }
        }
        view
    }
}

/// Wait until `cond` holds, polling every few milliseconds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met within 5s");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
