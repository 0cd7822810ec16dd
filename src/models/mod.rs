//! Data models for lspipe

pub mod config;

pub use config::LspipeConfig;
