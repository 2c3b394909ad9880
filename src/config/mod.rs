//! Configuration module
//!
//! Handles loading and saving CodePipe configuration. The pipe endpoint
//! can be overridden from the process environment, which takes
//! precedence over any configuration file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::network::Endpoint;
use crate::protocol::{DEFAULT_ADDRESS, DEFAULT_PORT};

/// Environment variable overriding the pipe address.
pub const ENV_ADDRESS: &str = "CODEPIPE_ADDR";

/// Environment variable overriding the pipe port.
pub const ENV_PORT: &str = "CODEPIPE_PORT";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Pipe endpoint settings
    #[serde(default)]
    pub pipe: PipeConfig,

    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,
}

/// Pipe endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeConfig {
    /// Address to bind or connect to
    #[serde(default = "default_address")]
    pub address: String,

    /// Port to bind or connect to
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_address() -> String {
    DEFAULT_ADDRESS.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
        }
    }
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,

    /// Log file path (optional)
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default locations
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("codepipe/config.toml")),
            Some(PathBuf::from("./codepipe.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply process-environment overrides to the pipe endpoint.
    pub fn apply_env(&mut self) {
        if let Ok(address) = std::env::var(ENV_ADDRESS) {
            if !address.is_empty() {
                self.pipe.address = address;
            }
        }
        if let Ok(port) = std::env::var(ENV_PORT) {
            match port.parse() {
                Ok(port) => self.pipe.port = port,
                Err(_) => tracing::warn!("ignoring invalid {}={}", ENV_PORT, port),
            }
        }
    }

    /// The configured connection target.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(&self.pipe.address, self.pipe.port)
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> String {
    let config = Config {
        pipe: PipeConfig {
            address: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
        },
        general: GeneralConfig {
            verbose: false,
            log_file: None,
        },
    };

    toml::to_string_pretty(&config).unwrap_or_default()
}
