use std::path::{Path, PathBuf};

use crate::config::types::PlugletConfig;
use crate::error::{PlugletError, Result};

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "pluglet", "pluglet") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        dirs_fallback().join(".pluglet").join("config.toml")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from file, with defaults for missing values.
///
/// An explicitly requested path must exist; the default path may be absent.
pub fn load_config(config_path: Option<&Path>) -> Result<PlugletConfig> {
    let path = match config_path {
        Some(path) => {
            if !path.exists() {
                return Err(PlugletError::ConfigNotFound {
                    path: path.display().to_string(),
                });
            }
            path.to_path_buf()
        }
        None => {
            let path = get_config_path();
            if !path.exists() {
                return Ok(PlugletConfig::default());
            }
            path
        }
    };

    let content = std::fs::read_to_string(&path)?;
    parse_config(&content)
}

/// Parse a TOML document into a configuration.
pub fn parse_config(content: &str) -> Result<PlugletConfig> {
    let config: PlugletConfig =
        toml::from_str(content).map_err(|e| PlugletError::TomlParse(e.to_string()))?;

    if config.sandbox.memory_limit_mb == 0 {
        return Err(PlugletError::Config(
            "sandbox.memory_limit_mb must be greater than zero".to_string(),
        ));
    }
    if config.sandbox.max_concurrent == 0 {
        return Err(PlugletError::Config(
            "sandbox.max_concurrent must be greater than zero".to_string(),
        ));
    }

    Ok(config)
}
