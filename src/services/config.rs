//! Configuration service for lspipe

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::ConfigError;
use crate::models::config::LspipeConfig;

#[async_trait]
pub trait ConfigService: Send + Sync {
    async fn load(&self, global_only: bool) -> Result<LspipeConfig, ConfigError>;
    fn config_path(&self, global: bool) -> PathBuf;
    async fn init(&self, global: bool, force: bool) -> Result<PathBuf, ConfigError>;
}

pub struct DefaultConfigService {
    root: PathBuf,
    global_path: PathBuf,
}

impl DefaultConfigService {
    pub fn new(root: &Path) -> Self {
        Self::with_global_path(root, Self::global_config_path())
    }

    pub fn with_global_path(root: &Path, global_path: PathBuf) -> Self {
        Self {
            root: root.to_path_buf(),
            global_path,
        }
    }

    fn global_config_path() -> PathBuf {
        // XDG standard: ~/.config/lspipe/config.toml
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .ok()
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lspipe")
            .join("config.toml")
    }

    fn project_config_path(&self) -> PathBuf {
        self.root.join(".lspipe").join("config.toml")
    }

    async fn load_from_path(path: &Path) -> Result<Option<LspipeConfig>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(path).await?;
        toml::from_str(&content)
            .map(Some)
            .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))
    }

    async fn write_default_config(path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let config = LspipeConfig::default();
        let content =
            toml::to_string_pretty(&config).map_err(|e| ConfigError::Parse(e.to_string()))?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

#[async_trait]
impl ConfigService for DefaultConfigService {
    async fn load(&self, global_only: bool) -> Result<LspipeConfig, ConfigError> {
        let global = Self::load_from_path(&self.global_path).await?;
        if global_only {
            return Ok(global.unwrap_or_default());
        }

        // The project file replaces the global one wholesale
        let project = Self::load_from_path(&self.project_config_path()).await?;
        let config = project.or(global).unwrap_or_default();
        apply_env_overrides(config, |key| std::env::var(key).ok())
    }

    fn config_path(&self, global: bool) -> PathBuf {
        if global {
            self.global_path.clone()
        } else {
            self.project_config_path()
        }
    }

    async fn init(&self, global: bool, force: bool) -> Result<PathBuf, ConfigError> {
        let path = self.config_path(global);

        if path.exists() && !force {
            return Err(ConfigError::InvalidValue {
                key: "config".to_string(),
                message: format!(
                    "Config already exists: {}. Use --force to overwrite.",
                    path.display()
                ),
            });
        }

        Self::write_default_config(&path).await?;
        Ok(path)
    }
}

fn apply_env_overrides<F>(mut config: LspipeConfig, var: F) -> Result<LspipeConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = var("LSPIPE_SERVER_COMMAND") {
        config.server.command = val;
    }
    if let Some(val) = var("LSPIPE_REQUEST_TIMEOUT") {
        config.client.request_timeout_secs = parse_env("LSPIPE_REQUEST_TIMEOUT", &val)?;
    }
    if let Some(val) = var("LSPIPE_STOP_TIMEOUT_MS") {
        config.transport.stop_timeout_ms = parse_env("LSPIPE_STOP_TIMEOUT_MS", &val)?;
    }
    Ok(config)
}

fn parse_env(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("expected a non-negative integer, got {:?}", value),
    })
}
