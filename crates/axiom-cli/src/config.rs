use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use axiom_core::CoreConfig;
use axiom_signal::SignalConfig;
use serde::Deserialize;

pub const CONFIG_FILE: &str = "axiom.toml";
pub const DB_FILE: &str = "axiom.db";

/// Everything the binary can be configured with.
///
/// ```toml
/// [core]
/// default_max_results = 100
/// query_timeout_ms = 250
///
/// [core.grid]
/// cell_size = 2.0
///
/// [signal]
/// delivery_timeout_ms = 1000
///
/// [server]
/// bind = "127.0.0.1:7878"
/// ```
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub core: CoreConfig,
    pub signal: SignalConfig,
    pub server: ServerConfig,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7878".to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("invalid config TOML")?;
        config
            .core
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid [core] settings: {e}"))?;
        Ok(config)
    }

    /// `explicit` (from `--config`) must exist; otherwise `AXIOM_CONFIG`,
    /// then `<data_dir>/axiom.toml` if present, else defaults.
    pub fn load(explicit: Option<&Path>, data_dir: &Path) -> Result<Self> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("AXIOM_CONFIG").map(PathBuf::from));
        let path = match path {
            Some(path) => path,
            None => {
                let fallback = data_dir.join(CONFIG_FILE);
                if !fallback.exists() {
                    return Ok(Self::default());
                }
                fallback
            }
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::from_toml(&text)?;
        tracing::debug!("loaded config from {}", path.display());
        Ok(config)
    }
}

/// `AXIOM_DATA_DIR`, else `~/.axiom`.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("AXIOM_DATA_DIR") {
        return PathBuf::from(dir);
    }
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".axiom")
}
