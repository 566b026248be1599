/// JSON snapshot of the lifecycle, published on request.
use crate::termination::{TerminationPhase, TerminationStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleStatus {
    pub pid: u32,
    pub phase: TerminationPhase,
    pub shutdown_started: Option<DateTime<Utc>>,
    pub prolonged: bool,
    pub remaining_ms: Option<u64>,
    /// Signals with at least one registered handler, by name.
    pub signals: Vec<String>,
    pub pending_finalizers: usize,
    pub last_update: DateTime<Utc>,
}

impl LifecycleStatus {
    pub fn new(termination: TerminationStatus, signals: Vec<String>, pending_finalizers: usize) -> Self {
        Self {
            pid: std::process::id(),
            phase: termination.phase,
            shutdown_started: termination.started_at,
            prolonged: termination.prolonged,
            remaining_ms: termination.remaining_ms,
            signals,
            pending_finalizers,
            last_update: Utc::now(),
        }
    }
}

/// Failure to publish or withdraw the status file.
#[derive(Debug)]
pub enum StatusError {
    Encode(serde_json::Error),
    Publish { path: PathBuf, source: io::Error },
    Withdraw { path: PathBuf, source: io::Error },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Encode(e) => write!(f, "cannot encode lifecycle status: {e}"),
            StatusError::Publish { path, source } => {
                write!(f, "cannot publish status to {}: {source}", path.display())
            }
            StatusError::Withdraw { path, source } => {
                write!(f, "cannot remove status file {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Encode(e) => Some(e),
            StatusError::Publish { source, .. } | StatusError::Withdraw { source, .. } => {
                Some(source)
            }
        }
    }
}

/// A status file that readers only ever see complete.
#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the file with `status`.
    ///
    /// The JSON goes to a named temp file next to the target, which is then
    /// persisted over it in one rename.
    pub fn write(&self, status: &LifecycleStatus) -> Result<(), StatusError> {
        let publish = |source| StatusError::Publish {
            path: self.path.clone(),
            source,
        };

        let dir = self
            .path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let mut staged = NamedTempFile::new_in(dir).map_err(publish)?;
        serde_json::to_writer_pretty(&mut staged, status).map_err(StatusError::Encode)?;
        staged.flush().map_err(publish)?;
        staged
            .persist(&self.path)
            .map_err(|e| publish(e.error))?;
        Ok(())
    }

    /// Remove the file. A file that is already gone is not an error.
    pub fn remove(&self) -> Result<(), StatusError> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(StatusError::Withdraw {
                path: self.path.clone(),
                source: e,
            }),
            _ => Ok(()),
        }
    }
}
