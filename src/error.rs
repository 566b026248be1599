/// Errors of the startup boundary: config, logging and the application runner.
use std::path::PathBuf;

/// Error type returned by application phases.
pub type AppError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// An explicitly requested config file does not exist.
    NotFound { path: PathBuf },
    /// The config file could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The config file is not valid TOML for our schema.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// An environment override could not be parsed.
    Env { key: String, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NotFound { path } => {
                write!(f, "config file {} does not exist", path.display())
            }
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config file {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config file {}: {}", path.display(), source)
            }
            ConfigError::Env { key, value } => {
                write!(f, "invalid value {value:?} for environment variable {key}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::NotFound { .. } | ConfigError::Env { .. } => None,
        }
    }
}

/// Errors that can occur while installing the logger.
#[derive(Debug)]
pub enum LoggingError {
    UnknownLevel { level: String },
    OpenFile {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A global subscriber was already installed.
    AlreadyInitialized,
}

impl std::fmt::Display for LoggingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoggingError::UnknownLevel { level } => write!(
                f,
                "unknown log level: {level} (should be one of [off, error, warn, info, debug, trace])"
            ),
            LoggingError::OpenFile { path, source } => {
                write!(f, "unable to open log file {}: {}", path.display(), source)
            }
            LoggingError::AlreadyInitialized => write!(f, "logger is already initialized"),
        }
    }
}

impl std::error::Error for LoggingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoggingError::OpenFile { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Errors returned by [`crate::Lifecycle::run`].
#[derive(Debug)]
pub enum RunError {
    /// The init phase failed; the process was told to exit before the
    /// signal watcher started.
    Init(AppError),
    /// The main phase returned an error.
    Main(AppError),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Init(e) => write!(f, "initialization failed: {e}"),
            RunError::Main(e) => write!(f, "application failed: {e}"),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Init(e) | RunError::Main(e) => Some(e.as_ref()),
        }
    }
}
