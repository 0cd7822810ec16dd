//! CLI module for lspipe
//!
//! Provides command-line interface using clap derive macros.

pub mod commands;
pub mod output;

pub use output::OutputContext;

use clap::{Parser, Subcommand};

use commands::{complete::CompleteArgs, config::ConfigArgs, echo::EchoArgs, send::SendArgs};

const LONG_ABOUT: &str = r#"
lspipe - talk to a language server over stdio

lspipe starts a language server as a supervised child process and exchanges
Content-Length framed JSON-RPC messages with it. The server and everything it
spawns are killed when lspipe stops.

QUICK START:
  1. Write a config file:     lspipe config init
  2. Complete in a document:  lspipe complete package.json --line 1 --character 1
  3. Send any request:        lspipe send textDocument/documentSymbol --params '{...}'

SCHEMAS:
  lspipe complete package.json --schema package.json=http://json.schemastore.org/package

LOGGING:
  RUST_LOG=lspipe=trace lspipe complete package.json   # every frame in and out
"#;

/// lspipe - supervised JSON-RPC transport for language servers
#[derive(Parser, Debug)]
#[command(name = "lspipe")]
#[command(author, version, about, long_about = LONG_ABOUT)]
#[command(propagate_version = true)]
#[command(after_help = "Use 'lspipe <COMMAND> --help' for more information about a command.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Language server command line, overrides the configured server
    #[arg(long, global = true, value_name = "COMMAND")]
    pub server: Option<String>,

    /// Verbose output (show debug info)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Open a JSON document and request completions at a position
    Complete(CompleteArgs),

    /// Send a single request or notification after the handshake
    Send(SendArgs),

    /// Configuration management
    Config(ConfigArgs),

    /// Framed echo server on stdin/stdout
    #[command(hide = true)]
    Echo(EchoArgs),
}
