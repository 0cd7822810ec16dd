//! Command implementations for lspipe
//!
//! Each command is implemented in its own module.

pub mod complete;
pub mod config;
pub mod echo;
pub mod send;
