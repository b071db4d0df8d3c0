//! Error types for the connection engine.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by a game transport or one of its connections.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport could not even start a connection attempt.
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// The connection is already closed.
    #[error("Connection closed: {reason}")]
    Closed {
        /// Close reason.
        reason: String,
    },

    /// An outbound action could not be delivered.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The peer sent something we could not understand.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer did not answer in time.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TransportError {
    /// Convenience constructor for a closed connection.
    #[must_use]
    pub fn closed(reason: impl Into<String>) -> Self {
        Self::Closed {
            reason: reason.into(),
        }
    }

    /// Check whether a fresh connection attempt could succeed.
    ///
    /// Every transport failure is retried by the state machine; this only
    /// separates "the remote dropped us" from "we sent garbage".
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Protocol(_) | Self::Json(_))
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors returned to the command layer by the control handle.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    /// The client is not online with tasks initialized.
    #[error("Game client is not online or not fully initialized")]
    NotReady,

    /// The state machine task has stopped.
    #[error("Connection state machine is not running")]
    MachineGone,

    /// The session ended before the request completed.
    #[error("Session ended before the request completed")]
    SessionEnded,

    /// The transport rejected the action.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<TransportError> for ControlError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Result type for control operations.
pub type ControlResult<T> = Result<T, ControlError>;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config {path}: {source}")]
    Read {
        /// Path that was read.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for our schema.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range or inconsistent.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;
