use anyhow::{Context, Result, bail};
use libfilestore::StoreConfig;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // ip:port the daemon listens on
    pub addr: String,
    // tokio worker threads serving client requests
    #[serde(default = "default_workers")]
    pub workers: usize,
    // connections beyond this many are refused
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub storage: StoreConfig,
}

fn default_workers() -> usize {
    4
}

fn default_max_clients() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.addr.trim().is_empty() {
            bail!("addr must not be empty");
        }
        if self.workers == 0 {
            bail!("workers must be greater than zero");
        }
        if self.max_clients == 0 {
            bail!("max_clients must be greater than zero");
        }
        self.storage
            .validate()
            .context("invalid storage section")?;
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    cfg.validate()?;
    Ok(cfg)
}
