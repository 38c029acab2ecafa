//! Client error types

use revtun_proto::CodecError;
use thiserror::Error;

/// Errors raised by the session, its managers and their collaborators
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlError {
    /// Returns true if this error is non-recoverable and retrying won't help
    pub fn is_non_recoverable(&self) -> bool {
        matches!(
            self,
            ControlError::AuthenticationFailed(_) | ControlError::ConfigError(_)
        )
    }

    /// Returns true if this error is recoverable and retrying might succeed
    pub fn is_recoverable(&self) -> bool {
        !self.is_non_recoverable()
    }
}
