//! Configuration for the ONR language client shim.
//!
//! The file is TOML. The `[onrLsp]` table mirrors the editor settings
//! namespace of the same name:
//!
//! ```toml
//! [onrLsp]
//! serverPath = ""          # empty: bundled binary, then `onr-lsp` on PATH
//! documents = "providers"  # or "all"
//!
//! [onrLsp.settings]        # forwarded to the server
//! format = { indent = 2 }
//!
//! [log]
//! filter = "onr_lsp_client=debug"
//! ```

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use onr_lsp_client::ClientConfig;
use serde::Deserialize;
use toml::de;

/// Overrides `serverPath` when set and non-empty.
pub const SERVER_PATH_ENV: &str = "ONR_LSP_SERVER_PATH";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ShimConfig {
    #[serde(rename = "onrLsp", alias = "onr_lsp")]
    pub client: Option<ClientConfig>,
    pub log: Option<LogConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogConfig {
    /// `tracing` filter directive; `RUST_LOG` wins when set.
    pub filter: Option<String>,
}

impl ShimConfig {
    /// Load from the default location. A missing file is `Ok(None)`.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(None),
        }
    }

    /// Load from `path`. A missing file is `Ok(None)`.
    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(source) => {
                tracing::warn!("Failed to read config at {}: {source}", path.display());
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        Self::parse(&content)
            .map(Some)
            .map_err(|source| {
                tracing::warn!("Failed to parse config at {}: {source}", path.display());
                ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                }
            })
    }

    pub fn parse(content: &str) -> Result<Self, de::Error> {
        toml::from_str(content)
    }

    /// Client settings with the `ONR_LSP_SERVER_PATH` override applied.
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        self.client_config_with(env::var(SERVER_PATH_ENV).ok())
    }

    /// Client settings with `server_path_env` standing in for the
    /// environment variable.
    #[must_use]
    pub fn client_config_with(&self, server_path_env: Option<String>) -> ClientConfig {
        with_server_path_override(self.client.clone().unwrap_or_default(), server_path_env)
    }

    #[must_use]
    pub fn log_filter(&self) -> Option<&str> {
        self.log.as_ref().and_then(|l| l.filter.as_deref())
    }
}

fn with_server_path_override(mut config: ClientConfig, value: Option<String>) -> ClientConfig {
    if let Some(value) = value
        && !value.trim().is_empty()
    {
        tracing::debug!("Using {SERVER_PATH_ENV}={value}");
        config.server_path = value;
    }
    config
}

/// `~/.onr/config.toml`
#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".onr").join("config.toml"))
}
