//! Per-message session errors and their conversions.

use std::time::Duration;

use polyfier_core::{ConfigKind, CoreError};
use polyfier_state::StateError;
use thiserror::Error;

pub type SessionResult<T> = Result<T, SessionError>;

/// Per-message failures. None of them tear down the connection.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("configuration space exhausted for {kind}")]
    Exhausted { kind: ConfigKind },

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StateError),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("channel closed")]
    ChannelClosed,

    #[error("encode error: {0}")]
    Encode(String),
}

impl From<CoreError> for SessionError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ExhaustedConfigurationSpace { kind } => SessionError::Exhausted { kind },
            other => SessionError::Encode(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Encode(err.to_string())
    }
}
