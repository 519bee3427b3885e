//! CLI module for editrpc
//!
//! Provides command-line interface using clap derive macros.

pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use commands::{echo::EchoArgs, frame::FrameArgs, inspect::InspectArgs};

use crate::protocol::Dialect;

const LONG_ABOUT: &str = r#"
editrpc - transport and dispatch core for editor protocols

Speaks Content-Length framed JSON-RPC 2.0 (Language Server Protocol style)
and the Debug Adapter Protocol over stdio.

QUICK START:
  1. Frame some messages:     editrpc frame messages.jsonl > stream.bin
  2. Inspect a stream:        editrpc inspect stream.bin
  3. Talk to the demo server: editrpc frame messages.jsonl | editrpc echo

DEMO SERVER METHODS:
  echo      returns its params (parallel)
  sleep     waits {"ms": N}, honoring cancellation (parallel)
  log       notification appending {"message": ".."} to a journal (serial)
  journal   returns the journal (serial)

LOGGING:
  Logs go to stderr. Set RUST_LOG=editrpc=debug for verbose output.
"#;

/// editrpc - transport and dispatch core for editor protocols
#[derive(Parser, Debug)]
#[command(name = "editrpc")]
#[command(author, version, about, long_about = LONG_ABOUT)]
#[command(propagate_version = true)]
#[command(after_help = "Use 'editrpc <COMMAND> --help' for more information about a command.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (defaults to ~/.config/editrpc/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the envelopes found in a framed stream
    Inspect(InspectArgs),

    /// Frame newline-delimited JSON with Content-Length headers
    Frame(FrameArgs),

    /// Serve the demo handlers over stdio
    Echo(EchoArgs),
}

/// Dialect names as written on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DialectArg {
    /// JSON-RPC 2.0 as used by the Language Server Protocol
    #[default]
    Lsp,
    /// Debug Adapter Protocol
    Dap,
}

impl From<DialectArg> for Dialect {
    fn from(arg: DialectArg) -> Self {
        match arg {
            DialectArg::Lsp => Dialect::JsonRpc,
            DialectArg::Dap => Dialect::Dap,
        }
    }
}
