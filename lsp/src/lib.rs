//! Multi-language LSP client.
//!
//! One stdio subprocess per configured language, started lazily on first
//! use. [`LspManager`] keeps each document in sync with its server (disk
//! content or unsaved edits), serializes operations per document and
//! persists sync metadata so a fresh process can skip redundant resyncs.

pub mod cache;
pub mod codec;
pub mod config;
pub mod decode;
pub mod edit;
pub mod error;
pub mod types;

pub(crate) mod client;
pub(crate) mod diagnostics;
pub(crate) mod protocol;

mod manager;
mod sync;

pub use cache::{CacheKey, CacheStore, DocumentCacheRecord, OpenState};
pub use client::{DiagnosticsHandler, LspClient};
pub use config::{CacheConfig, LspConfig, ServerConfig, ServerConfigError, normalize_language};
pub use diagnostics::DiagnosticsSnapshot;
pub use error::{LspError, LspResult};
pub use manager::LspManager;
pub use protocol::{PathToUriError, file_uri_to_path, path_to_file_uri};
pub use sync::BootstrappedDocument;
pub use types::{
    CallDirection, CallHierarchy, CodeAction, CodeActionEntry, Command, CompletionItem,
    CompletionList, Diagnostic, DiagnosticSeverity, DocumentStatus, DocumentSymbol, FoldingRange,
    FormattingOptions, HierarchyCall, HierarchyItem, Hover, Location, LocationLink, LocationTarget,
    ParameterInformation, Position, Range, ResourceOperation, SemanticToken, SemanticTokens,
    SemanticTokensLegend, ServerState, ServerStatus, SignatureHelp, SignatureInformation,
    SymbolInformation, SymbolKind, TextEdit, TypeDirection, TypeHierarchy, WorkspaceEdit,
    WorkspaceSymbol, WorkspaceSymbolEntry, WorkspaceSymbolQuery,
};
