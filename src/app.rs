//! Application container for lspipe

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cli::OutputContext;
use crate::models::config::LspipeConfig;
use crate::services::config::{ConfigService, DefaultConfigService};

pub struct App {
    root: PathBuf,
    pub(crate) output: OutputContext,
    pub(crate) config_service: Arc<dyn ConfigService>,
    pub(crate) config: LspipeConfig,
}

impl App {
    /// `server` replaces the configured command line, split on whitespace.
    pub async fn new(server: Option<&str>) -> anyhow::Result<Self> {
        let root = std::env::current_dir()?;

        tracing::debug!("Initializing lspipe at {:?}", root);

        let output = OutputContext::new(root.clone());
        let config_service = Arc::new(DefaultConfigService::new(&root));
        let mut config = config_service.load(false).await?;

        if let Some(server) = server {
            let mut parts = server.split_whitespace().map(str::to_string);
            let command = parts
                .next()
                .ok_or_else(|| anyhow::anyhow!("--server must not be empty"))?;
            config.server.command = command;
            config.server.args = parts.collect();
        }

        tracing::debug!(
            "Language server: {} {}",
            config.server.command,
            config.server.args.join(" ")
        );

        Ok(Self {
            root,
            output,
            config_service,
            config,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &LspipeConfig {
        &self.config
    }
}
