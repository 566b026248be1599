use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File looked up in the working directory when no config path is given.
pub const DEFAULT_CONFIG_FILE: &str = "lifeguard.toml";

/// Prefix of environment variables overriding config values.
pub const ENV_PREFIX: &str = "LIFEGUARD";

/// Top-level configuration loaded from lifeguard.toml.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub app: AppConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "-" or empty for stderr.
    pub file: String,
    /// Include file:line in every record.
    pub caller: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub heartbeat_secs: u64,
    /// Ask for a prolonged shutdown to drain in-flight work.
    pub slow_shutdown: bool,
    pub status_file: PathBuf,
}

// --- Default implementations ---

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: "-".to_string(),
            caller: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 5,
            slow_shutdown: false,
            status_file: PathBuf::from("lifeguard.status"),
        }
    }
}

impl Config {
    /// Load the config file.
    ///
    /// An explicit `path` must exist. Without one, [`DEFAULT_CONFIG_FILE`] in
    /// the working directory is used if present, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound {
                        path: path.to_path_buf(),
                    });
                }
                Self::from_file(path)
            }
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_file(path)
                } else {
                    tracing::debug!("no {DEFAULT_CONFIG_FILE} found, using defaults");
                    Ok(Config::default())
                }
            }
        }
    }

    fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Apply `LIFEGUARD_<SECTION>_<KEY>` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |section: &str, key: &str| {
            let name = format!("{ENV_PREFIX}_{section}_{key}").to_uppercase();
            lookup(&name).map(|value| (name, value))
        };

        if let Some((_, value)) = var("logging", "level") {
            self.logging.level = value;
        }
        if let Some((_, value)) = var("logging", "file") {
            self.logging.file = value;
        }
        if let Some((key, value)) = var("logging", "caller") {
            self.logging.caller = parse_bool(&value).ok_or(ConfigError::Env { key, value })?;
        }
        if let Some((key, value)) = var("app", "heartbeat_secs") {
            self.app.heartbeat_secs = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Env { key, value })?;
        }
        if let Some((key, value)) = var("app", "slow_shutdown") {
            self.app.slow_shutdown = parse_bool(&value).ok_or(ConfigError::Env { key, value })?;
        }
        if let Some((_, value)) = var("app", "status_file") {
            self.app.status_file = PathBuf::from(value);
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
