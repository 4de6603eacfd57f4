//! relay CLI - run one LSP operation and print JSON.
//!
//! ```text
//! main() -> parse args -> LspConfig (env or --config) -> LspManager
//!        -> one operation -> pretty JSON on stdout -> stop_all()
//! ```
//!
//! Logs go to stderr so stdout stays machine-readable.

mod args;

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Value, json};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use relay_lsp::{FormattingOptions, LspConfig, LspManager, Position, Range, WorkspaceSymbolQuery};

use crate::args::{Cli, Command};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn load_config(cli: &Cli) -> Result<LspConfig> {
    let root = match &cli.root {
        Some(root) => root.clone(),
        None => std::env::current_dir().context("resolving current directory")?,
    };

    let Some(path) = &cli.config else {
        return Ok(LspConfig::from_env(root));
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let mut config: LspConfig =
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
    if cli.root.is_some() || config.root == Path::new(".") {
        config.root = root;
    }
    Ok(config)
}

async fn run_command(manager: &LspManager, command: Command) -> Result<Value> {
    let value = match command {
        Command::Status => serde_json::to_value(manager.status())?,
        Command::Open { file } => serde_json::to_value(manager.bootstrap_document(&file).await?)?,
        Command::Symbols { file } => serde_json::to_value(manager.document_symbol(&file).await?)?,
        Command::Hover(at) => serde_json::to_value(manager.hover(&at.file, at.position()).await?)?,
        Command::Definition(at) => {
            serde_json::to_value(manager.definition(&at.file, at.position()).await?)?
        }
        Command::References(at) => {
            serde_json::to_value(manager.references(&at.file, at.position(), true).await?)?
        }
        Command::Rename { at, new_name } => {
            serde_json::to_value(manager.rename(&at.file, at.position(), &new_name).await?)?
        }
        Command::Completion(at) => {
            serde_json::to_value(manager.completion(&at.file, at.position()).await?)?
        }
        Command::Signature(at) => {
            serde_json::to_value(manager.signature_help(&at.file, at.position()).await?)?
        }
        Command::Format { file } => {
            serde_json::to_value(manager.format(&file, FormattingOptions::default()).await?)?
        }
        Command::Folding { file } => serde_json::to_value(manager.folding_range(&file).await?)?,
        Command::Tokens { file } => serde_json::to_value(manager.semantic_tokens(&file).await?)?,
        Command::Actions(at) => {
            let pos = at.position();
            let range = Range::new(pos, Position::new(pos.line, pos.character.saturating_add(1)));
            serde_json::to_value(manager.code_action(&at.file, range).await?)?
        }
        Command::Calls { at, direction } => serde_json::to_value(
            manager
                .call_hierarchy(&at.file, at.position(), direction.into())
                .await?,
        )?,
        Command::Types { at, direction } => serde_json::to_value(
            manager
                .type_hierarchy(&at.file, at.position(), direction.into())
                .await?,
        )?,
        Command::WorkspaceSymbol { query, scope } => {
            let query = WorkspaceSymbolQuery {
                file_path: scope.file,
                language: scope.language,
                query,
            };
            serde_json::to_value(manager.workspace_symbol(&query).await?)?
        }
        Command::Diagnostics { file } => {
            manager.open_file(&file).await?;
            // One round trip so publishes sent on open have been received.
            let _ = manager.document_symbol(&file).await;
            json!({
                "diagnostics": manager.diagnostics(&file)?,
                "summary": manager.diagnostics_snapshot().status_string(),
            })
        }
    };
    Ok(value)
}

async fn run(cli: Cli) -> Result<Value> {
    let config = load_config(&cli)?;
    tracing::debug!(root = %config.root.display(), servers = config.servers.len(), "starting manager");
    let manager = LspManager::new(config)?;

    let result = run_command(&manager, cli.command).await;
    manager.stop_all().await;
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(text) => {
                println!("{text}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("relay: {e}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("relay: {e:#}");
            ExitCode::FAILURE
        }
    }
}
