/// Logger setup: one `tracing-subscriber` fmt layer, configured once at startup.
use crate::config::LoggingConfig;
use crate::error::LoggingError;
use std::path::PathBuf;
use std::str::FromStr;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Local wall-clock timestamps with millisecond precision.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTimestamp;

impl FormatTime for LocalTimestamp {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format(TIMESTAMP_FORMAT))
    }
}

/// Parse a configured level name.
pub fn parse_level(level: &str) -> Result<LevelFilter, LoggingError> {
    LevelFilter::from_str(level.trim()).map_err(|_| LoggingError::UnknownLevel {
        level: level.to_string(),
    })
}

/// Where records go: `None` means stderr.
pub fn log_file(config: &LoggingConfig) -> Option<PathBuf> {
    match config.file.trim() {
        "" | "-" => None,
        path => Some(PathBuf::from(path)),
    }
}

/// Install the global subscriber. `RUST_LOG`, when set, wins over `config.level`.
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let level = parse_level(&config.level)?;

    let writer = match log_file(config) {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| LoggingError::OpenFile { path, source: e })?;
            BoxMakeWriter::new(std::sync::Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(LocalTimestamp)
        .with_target(false)
        .with_file(config.caller)
        .with_line_number(config.caller)
        .with_ansi(log_file(config).is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)?;

    tracing::trace!("logger set");
    Ok(())
}
