//! Bootstrap configuration loading
//!
//! Each service reads a small TOML file at startup. The file is located by
//! priority:
//! 1. Command-line argument (highest priority)
//! 2. `AUDIOSYNC_CONFIG` environment variable
//! 3. `<config dir>/audiosync/<module>.toml` if it exists
//! 4. Built-in defaults (no file)
//!
//! A missing file is never fatal: a warning is logged and defaults are used.
//! A file that exists but does not parse is a configuration error.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "AUDIOSYNC_CONFIG";

/// Logging configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full EnvFilter directive
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Locates the bootstrap TOML file for one module
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    module_name: String,
}

impl ConfigResolver {
    pub fn new(module_name: &str) -> Self {
        Self {
            module_name: module_name.to_string(),
        }
    }

    /// Resolve the config file path, if any source names one
    pub fn resolve(&self, cli_arg: Option<&Path>) -> Option<PathBuf> {
        // Priority 1: Command-line argument
        if let Some(path) = cli_arg {
            return Some(path.to_path_buf());
        }

        // Priority 2: Environment variable
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }

        // Priority 3: Platform config directory
        self.default_path().filter(|p| p.exists())
    }

    /// `<config dir>/audiosync/<module>.toml`
    pub fn default_path(&self) -> Option<PathBuf> {
        dirs::config_dir().map(|d| {
            d.join("audiosync")
                .join(format!("{}.toml", self.module_name))
        })
    }
}

/// Load a TOML config, falling back to `T::default()` when no file is available
pub fn load_toml<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = path else {
        info!("No config file found, using built-in defaults");
        return Ok(T::default());
    };

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                "Config file {} not found, using built-in defaults",
                path.display()
            );
            return Ok(T::default());
        }
        Err(e) => return Err(Error::Io(e)),
    };

    let config = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}
