//! lspipe - supervised JSON-RPC transport for language servers
//!
//! Runs a language server as a child process and speaks Content-Length framed
//! messages with it over stdin/stdout. The child and its descendants are
//! terminated on cancellation or disposal, and exit is reported exactly once.

pub mod app;
pub mod cli;
pub mod error;
pub mod infra;
pub mod models;
pub mod services;

pub use error::{LspipeError, LspipeResult};
