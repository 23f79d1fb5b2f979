//! Workspace-wide error type.

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type LoxoneResult<T> = Result<T, LoxoneError>;

/// Errors surfaced by the exporter's subsystems.
///
/// Everything except [`LoxoneError::ConfigInvalid`] is recoverable: the
/// session runner's supervision loop catches it, logs it, and retries with
/// backoff rather than tearing down the process.
#[derive(Debug, Error)]
pub enum LoxoneError {
    /// The configuration failed validation before any task was started.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The authentication handshake with a Miniserver failed.
    #[error("authentication failed: {reason}")]
    AuthFailed {
        /// Human-readable failure reason, already scrubbed of secrets.
        reason: String,
    },

    /// A frame or payload violated the wire protocol's framing contract.
    #[error("wire protocol violation: {0}")]
    WireProtocol(String),

    /// A transient I/O or network failure; the caller should retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The Miniserver reported itself out of service.
    #[error("miniserver out of service")]
    OutOfService,

    /// The metric projector could not translate a mirror snapshot.
    #[error("metric projection failed: {0}")]
    ProjectionError(String),

    /// An OTLP export attempt failed.
    #[error("otlp export failed: {0}")]
    OtlpExportFailed(String),
}

impl LoxoneError {
    /// True for failures the session runner should retry after backoff
    /// rather than treat as fatal for the whole process.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, LoxoneError::ConfigInvalid(_))
    }
}
