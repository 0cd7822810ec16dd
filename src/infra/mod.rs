//! Infrastructure layer for lspipe
//!
//! Contains low-level implementations and external integrations.

pub mod lsp;
