//! Server and cache configuration.
//!
//! Raw deserialization structs stay private; [`ServerConfig`] is validated at
//! the parse boundary so every value in the registry is usable as-is.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Default lifetime of a cached document record.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Minimum spacing between two cache cleanup cycles.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

const ENV_CACHE: &str = "RELAY_LSP_CACHE";
const ENV_CACHE_DIR: &str = "RELAY_LSP_CACHE_DIR";
const ENV_CACHE_TTL: &str = "RELAY_LSP_CACHE_TTL_SECS";
const ENV_REQUEST_TIMEOUT: &str = "RELAY_LSP_REQUEST_TIMEOUT_SECS";

#[derive(Debug, Clone, thiserror::Error)]
pub enum ServerConfigError {
    #[error("server command must not be empty")]
    EmptyCommand,
    #[error("language must not be empty")]
    EmptyLanguage,
}

#[derive(Deserialize)]
struct RawServerConfig {
    language: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    extensions: Vec<String>,
}

/// Validated language server configuration.
///
/// Invariant: `command` and `language` are non-empty, `language` is
/// normalized and `extensions` are lowercase without a leading dot.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawServerConfig")]
pub struct ServerConfig {
    language: String,
    command: String,
    args: Vec<String>,
    extensions: Vec<String>,
}

impl TryFrom<RawServerConfig> for ServerConfig {
    type Error = ServerConfigError;

    fn try_from(raw: RawServerConfig) -> Result<Self, Self::Error> {
        Self::new(raw.language, raw.command, raw.args, raw.extensions)
    }
}

impl ServerConfig {
    pub fn new(
        language: impl AsRef<str>,
        command: impl Into<String>,
        args: Vec<String>,
        extensions: Vec<String>,
    ) -> Result<Self, ServerConfigError> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(ServerConfigError::EmptyCommand);
        }
        let language = normalize_language(language.as_ref());
        if language.is_empty() {
            return Err(ServerConfigError::EmptyLanguage);
        }
        let extensions = extensions
            .iter()
            .map(|ext| normalize_extension(ext))
            .filter(|ext| !ext.is_empty())
            .collect();
        Ok(Self {
            language,
            command,
            args,
            extensions,
        })
    }

    #[must_use]
    pub fn language(&self) -> &str {
        &self.language
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// `command args...` for display.
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// The `languageId` sent in `didOpen` for `path`.
    ///
    /// The typescript server distinguishes dialects by `languageId`.
    #[must_use]
    pub fn language_id_for(&self, path: &Path) -> String {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match (self.language.as_str(), ext.as_str()) {
            ("typescript", "tsx") => "typescriptreact".to_string(),
            ("typescript", "js" | "mjs" | "cjs") => "javascript".to_string(),
            ("typescript", "jsx") => "javascriptreact".to_string(),
            _ => self.language.clone(),
        }
    }
}

fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// Trim, lowercase and canonicalize language aliases.
#[must_use]
pub fn normalize_language(language: &str) -> String {
    let lower = language.trim().to_ascii_lowercase();
    match lower.as_str() {
        "ts" | "js" | "jsx" | "tsx" | "javascript" => "typescript".to_string(),
        "rs" => "rust".to_string(),
        "golang" => "go".to_string(),
        "py" => "python".to_string(),
        "cpp" | "cc" | "c++" => "c".to_string(),
        _ => lower,
    }
}

/// gopls, rust-analyzer and typescript-language-server.
#[must_use]
pub fn default_servers() -> Vec<ServerConfig> {
    let table: [(&str, &str, &[&str], &[&str]); 3] = [
        ("go", "gopls", &[], &["go"]),
        ("rust", "rust-analyzer", &[], &["rs"]),
        (
            "typescript",
            "typescript-language-server",
            &["--stdio"],
            &["ts", "tsx", "js", "jsx", "mjs", "cjs"],
        ),
    ];
    table
        .into_iter()
        .filter_map(|(language, command, args, extensions)| {
            ServerConfig::new(
                language,
                command,
                args.iter().map(ToString::to_string).collect(),
                extensions.iter().map(ToString::to_string).collect(),
            )
            .ok()
        })
        .collect()
}

/// Settings of the sync-metadata cache.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_cache_dir(),
            ttl: DEFAULT_CACHE_TTL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

impl CacheConfig {
    /// A memory-only cache, for callers that never want files written.
    #[must_use]
    pub fn memory_only() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Defaults overridden by `RELAY_LSP_CACHE*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var(ENV_CACHE) {
            config.enabled = parse_toggle(&value).unwrap_or_else(|| {
                tracing::warn!(value = %value, "unrecognized {ENV_CACHE} value; cache disabled");
                false
            });
        }
        if let Ok(dir) = std::env::var(ENV_CACHE_DIR)
            && !dir.trim().is_empty()
        {
            config.dir = PathBuf::from(dir.trim());
        }
        if let Some(ttl) = env_secs(ENV_CACHE_TTL) {
            config.ttl = ttl;
        }
        config
    }
}

/// `<system cache dir>/relay/lsp`, or a temp-dir fallback.
#[must_use]
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir().map_or_else(
        || std::env::temp_dir().join("relay-lsp-cache"),
        |dir| dir.join("relay").join("lsp"),
    )
}

/// Boolean env toggle; `None` for anything unrecognized.
fn parse_toggle(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            tracing::warn!(value = %raw, "invalid {name}; using default");
            None
        }
    }
}

/// Everything a manager needs: one workspace root, its servers, the cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LspConfig {
    pub root: PathBuf,
    pub servers: Vec<ServerConfig>,
    pub cache: CacheConfig,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

impl Default for LspConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            servers: default_servers(),
            cache: CacheConfig::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl LspConfig {
    /// Default servers for `root`, with cache and timeout from the environment.
    #[must_use]
    pub fn from_env(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            servers: default_servers(),
            cache: CacheConfig::from_env(),
            request_timeout: env_secs(ENV_REQUEST_TIMEOUT).unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    /// Add a server, replacing any existing one for the same language.
    #[must_use]
    pub fn with_server(mut self, server: ServerConfig) -> Self {
        self.servers.retain(|s| s.language() != server.language());
        self.servers.push(server);
        self
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        u64::deserialize(de).map(Duration::from_secs)
    }
}
