pub mod size;
pub mod tap;

pub use size::parse_human_size;
pub use tap::{Config, KubeConfig, PortPair, ProxyConfig, TapConfig, DEFAULT_SELF_NAMESPACE};

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("{pattern} is not a valid regex: {reason}")]
    InvalidRegex { pattern: String, reason: String },

    #[error("Could not parse size value {0}")]
    InvalidSize(String),
}

/// Folder holding the config file and dumped logs: ~/.tapline
pub fn dot_folder_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tapline")
}

/// Default config file location: ~/.tapline/config.yaml
pub fn default_config_path() -> PathBuf {
    dot_folder_path().join("config.yaml")
}

// ============================================================================
// SBIO: Pure parsing (no I/O)
// ============================================================================

pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    if content.trim().is_empty() {
        return Ok(Config::default());
    }
    serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load the config file; a missing file yields the defaults.
pub fn load_config_file(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}
