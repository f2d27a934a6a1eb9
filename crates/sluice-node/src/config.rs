//! Node configuration types.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid YAML for [`Config`].
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the Sluice node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listen address.
    pub listen_addr: SocketAddr,
    /// Location of the repository every request is served from.
    pub repository: String,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Log output format, `pretty` or `json`.
    pub log_format: String,
    /// Largest accepted request body, in bytes, after inflation.
    pub max_body_size: usize,
    /// Deadline for a single fetch or push operation.
    pub request_timeout_secs: Option<u64>,
    /// Branch HEAD points at when the repository is created.
    pub default_branch: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            repository: "/tmp/usertest/test.git".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            max_body_size: 512 * 1024 * 1024,
            request_timeout_secs: None,
            default_branch: "main".to_string(),
        }
    }
}

impl Config {
    /// Reads a YAML configuration file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    /// Parses a YAML document.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Checks values that would make the server unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repository.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "repository location must not be empty".to_string(),
            ));
        }
        if self.max_body_size == 0 {
            return Err(ConfigError::Invalid(
                "max_body_size must be greater than zero".to_string(),
            ));
        }
        if self.default_branch.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "default_branch must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Deadline for delegated operations, if configured.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}
