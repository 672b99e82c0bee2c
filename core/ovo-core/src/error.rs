//! Error types for ovo-core operations.
//!
//! Errors are converted to [`ErrorInfo`] exactly once, at the gateway. Keep
//! `code()` values stable: front-end clients branch on them.

use ovo_protocol::ErrorInfo;
use std::path::PathBuf;

/// All errors that can occur in ovo-core operations.
#[derive(Debug, thiserror::Error)]
pub enum OvoError {
    // ─────────────────────────────────────────────────────────────────────
    // Registry Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("A project with id {0} is already registered")]
    DuplicateId(String),

    #[error("Project registry is corrupted: {path}: {details}")]
    CorruptedRegistry { path: PathBuf, details: String },

    #[error("Unknown project id: {0}")]
    UnknownProjectId(String),

    // ─────────────────────────────────────────────────────────────────────
    // Daemon Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Process manager is not available: {0}")]
    DaemonUnavailable(String),

    #[error("Process manager call failed: {command}: {details}")]
    DaemonCallFailed { command: String, details: String },

    /// The primary side effect was applied; a secondary cleanup step failed.
    #[error("{completed}, but {failed}")]
    PartialFailure {
        completed: String,
        failed: String,
        #[source]
        cause: Box<OvoError>,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Port Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Could not determine whether port {port} is free: {details}")]
    PortProbeIndeterminate { port: u16, details: String },

    #[error("Port {port} is in use by {occupant}")]
    PortOccupied { port: u16, occupant: String },

    // ─────────────────────────────────────────────────────────────────────
    // Request / I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using OvoError.
pub type Result<T> = std::result::Result<T, OvoError>;

impl OvoError {
    pub fn code(&self) -> &'static str {
        match self {
            OvoError::DuplicateId(_) => "duplicate_id",
            OvoError::CorruptedRegistry { .. } => "corrupted_registry",
            OvoError::UnknownProjectId(_) => "unknown_project_id",
            OvoError::DaemonUnavailable(_) => "daemon_unavailable",
            OvoError::DaemonCallFailed { .. } => "daemon_call_failed",
            OvoError::PartialFailure { .. } => "partial_failure",
            OvoError::PortProbeIndeterminate { .. } => "port_probe_indeterminate",
            OvoError::PortOccupied { .. } => "port_occupied",
            OvoError::InvalidRequest(_) => "invalid_request",
            OvoError::Io { .. } => "io_error",
            OvoError::Json { .. } => "json_error",
            OvoError::Internal(_) => "internal_error",
        }
    }

    /// What the user can do about it, when there is something to do.
    pub fn hint(&self) -> Option<String> {
        match self {
            OvoError::DuplicateId(_) => {
                Some("The project is already registered; remove it first or re-add with overwrite.".to_string())
            }
            OvoError::CorruptedRegistry { path, .. } => Some(format!(
                "Fix or move {} aside; it was left untouched.",
                path.display()
            )),
            OvoError::DaemonUnavailable(_) => {
                Some("pm2 is not installed. Install it now? (process.install)".to_string())
            }
            OvoError::DaemonCallFailed { .. } => {
                Some("Check that pm2 is running (process.connect) and try again.".to_string())
            }
            OvoError::PortProbeIndeterminate { .. } => {
                Some("Install lsof or choose a port above 1024.".to_string())
            }
            OvoError::PortOccupied { .. } => {
                Some("Stop the other process or pick a different port.".to_string())
            }
            OvoError::PartialFailure { cause, .. } => cause.hint(),
            _ => None,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        OvoError::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<&OvoError> for ErrorInfo {
    fn from(err: &OvoError) -> Self {
        let info = ErrorInfo::new(err.code(), err.to_string());
        match err.hint() {
            Some(hint) => info.with_hint(hint),
            None => info,
        }
    }
}

impl From<OvoError> for ErrorInfo {
    fn from(err: OvoError) -> Self {
        ErrorInfo::from(&err)
    }
}
