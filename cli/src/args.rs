//! Command-line arguments.
//!
//! Lines and characters are zero-based LSP positions (UTF-16 character).

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use relay_lsp::{CallDirection, Position, TypeDirection};

#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(version, about = "Run one language server operation and print JSON", long_about = None)]
pub struct Cli {
    /// Workspace root (defaults to the current directory)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// TOML config file replacing the built-in server table
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// A file and a position in it.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct At {
    pub file: PathBuf,
    pub line: u32,
    pub character: u32,
}

impl At {
    pub fn position(&self) -> Position {
        Position::new(self.line, self.character)
    }
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
#[group(required = true, multiple = false)]
pub struct SymbolScope {
    /// Route the query to the server for this file
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Route the query to the server for this language
    #[arg(long)]
    pub language: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallArg {
    In,
    Out,
}

impl From<CallArg> for CallDirection {
    fn from(arg: CallArg) -> Self {
        match arg {
            CallArg::In => CallDirection::Incoming,
            CallArg::Out => CallDirection::Outgoing,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeArg {
    Super,
    Sub,
}

impl From<TypeArg> for TypeDirection {
    fn from(arg: TypeArg) -> Self {
        match arg {
            TypeArg::Super => TypeDirection::Supertypes,
            TypeArg::Sub => TypeDirection::Subtypes,
        }
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Sync a file and print its status
    Open { file: PathBuf },
    /// Document symbols
    Symbols { file: PathBuf },
    Hover(At),
    Definition(At),
    References(At),
    Rename {
        #[command(flatten)]
        at: At,
        new_name: String,
    },
    Completion(At),
    Signature(At),
    Format { file: PathBuf },
    Folding { file: PathBuf },
    /// Semantic tokens
    Tokens { file: PathBuf },
    /// Code actions at a position
    Actions(At),
    Calls {
        #[command(flatten)]
        at: At,
        #[arg(value_enum)]
        direction: CallArg,
    },
    Types {
        #[command(flatten)]
        at: At,
        #[arg(value_enum)]
        direction: TypeArg,
    },
    /// Workspace-wide symbol search
    WorkspaceSymbol {
        query: String,
        #[command(flatten)]
        scope: SymbolScope,
    },
    /// Current diagnostics for a file
    Diagnostics { file: PathBuf },
    /// Configured servers
    Status,
}
