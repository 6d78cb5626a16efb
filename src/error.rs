use std::sync::Arc;

use thiserror::Error;

/// Failure reported by a node connection.
///
/// Only transport-level problems surface here. An error *reply* from the
/// server is a completed round-trip and comes back as `RespValue::Error`.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("communication failure: {0:#}")]
    Communication(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no master endpoint configured")]
    NoMasterConfigured,

    #[error("communication with {alias} failed: {source:#}")]
    Communication {
        alias: Arc<str>,
        #[source]
        source: anyhow::Error,
    },

    #[error("giving up on {alias} after {attempts} attempts: {source:#}")]
    RetriesExhausted {
        alias: Arc<str>,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("{alias} replied with error: {message}")]
    Application { alias: Arc<str>, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("topology discovery failed: {0:#}")]
    Discovery(#[source] anyhow::Error),

    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

impl RouterError {
    /// Whether the retry loop is allowed to handle this error locally.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RouterError::Communication { .. })
    }

    /// Message of an application-level error reply, if this is one.
    pub fn reply_message(&self) -> Option<&str> {
        match self {
            RouterError::Application { message, .. } => Some(message.as_str()),
            _ => None,
        }
    }
}

pub type RouterResult<T> = std::result::Result<T, RouterError>;
