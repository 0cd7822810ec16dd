//! Configuration model for lspipe

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::infra::lsp::{ClientSettings, ProcessSpec, SupervisorSettings, TransportSettings};

/// lspipe configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct LspipeConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub client: ClientConfig,
}

/// Language server to launch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "defaults::command")]
    pub command: String,

    #[serde(default = "defaults::args")]
    pub args: Vec<String>,

    /// Defaults to the current directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: defaults::command(),
            args: defaults::args(),
            working_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn spec(&self) -> ProcessSpec {
        let spec = ProcessSpec::new(&self.command).with_args(&self.args);
        match &self.working_dir {
            Some(dir) => spec.with_working_dir(dir),
            None => spec,
        }
    }
}

/// Framing and process supervision
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    #[serde(default = "defaults::read_chunk_size")]
    pub read_chunk_size: usize,

    /// 0 disables the limit
    #[serde(default = "defaults::max_payload_bytes")]
    pub max_payload_bytes: usize,

    #[serde(default = "defaults::stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    #[serde(default = "defaults::join_timeout_ms")]
    pub join_timeout_ms: u64,

    #[serde(default = "defaults::exit_grace_ms")]
    pub exit_grace_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: defaults::read_chunk_size(),
            max_payload_bytes: defaults::max_payload_bytes(),
            stop_timeout_ms: defaults::stop_timeout_ms(),
            join_timeout_ms: defaults::join_timeout_ms(),
            exit_grace_ms: defaults::exit_grace_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "defaults::shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: defaults::request_timeout_secs(),
            shutdown_timeout_secs: defaults::shutdown_timeout_secs(),
        }
    }
}

mod defaults {
    // Server
    pub fn command() -> String {
        "vscode-json-language-server".to_string()
    }
    pub fn args() -> Vec<String> {
        vec!["--stdio".to_string()]
    }

    // Transport
    pub fn read_chunk_size() -> usize {
        1024
    }
    pub fn max_payload_bytes() -> usize {
        64 * 1024 * 1024
    }
    pub fn stop_timeout_ms() -> u64 {
        5000
    }
    pub fn join_timeout_ms() -> u64 {
        1000
    }
    pub fn exit_grace_ms() -> u64 {
        2000
    }

    // Client
    pub fn request_timeout_secs() -> u64 {
        30
    }
    pub fn shutdown_timeout_secs() -> u64 {
        2
    }
}

impl From<&LspipeConfig> for TransportSettings {
    fn from(config: &LspipeConfig) -> Self {
        let transport = &config.transport;
        Self {
            supervisor: SupervisorSettings {
                read_chunk_size: transport.read_chunk_size.max(1),
                join_timeout: Duration::from_millis(transport.join_timeout_ms),
                exit_grace: Duration::from_millis(transport.exit_grace_ms),
            },
            max_payload_bytes: transport.max_payload_bytes,
            stop_timeout: Duration::from_millis(transport.stop_timeout_ms),
        }
    }
}

impl From<&LspipeConfig> for ClientSettings {
    fn from(config: &LspipeConfig) -> Self {
        Self {
            request_timeout: Duration::from_secs(config.client.request_timeout_secs),
            shutdown_timeout: Duration::from_secs(config.client.shutdown_timeout_secs),
            exit_timeout: Duration::from_millis(config.transport.stop_timeout_ms),
        }
    }
}
