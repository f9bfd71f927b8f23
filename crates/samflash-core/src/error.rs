//! Orchestrator error taxonomy.

use std::fmt;

use thiserror::Error;

use crate::channel::ChannelError;
use crate::state::{SessionState, Stage};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlashError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Another operation is already in progress")]
    OperationInProgress,

    #[error("Operation requires a connected device (session is {state})")]
    NotConnected { state: SessionState },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("{stage} failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        stage: Stage,
        attempts: u32,
        #[source]
        source: ChannelError,
    },
}

impl FlashError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FlashError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            FlashError::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            FlashError::OperationInProgress => ErrorKind::OperationInProgress,
            FlashError::NotConnected { .. } => ErrorKind::NotConnected,
            FlashError::Channel(e) => e.kind(),
            FlashError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
        }
    }

    /// Classification of the error that actually happened on the device,
    /// looking through `RetriesExhausted`.
    pub fn underlying(&self) -> ErrorKind {
        match self {
            FlashError::RetriesExhausted { source, .. } => source.kind(),
            other => other.kind(),
        }
    }

    /// Whether the error was raised before any device interaction.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            FlashError::InvalidArgument(_)
                | FlashError::InvalidConfiguration(_)
                | FlashError::OperationInProgress
                | FlashError::NotConnected { .. }
        )
    }
}

/// Flat classification of a [`FlashError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    InvalidConfiguration,
    OperationInProgress,
    NotConnected,
    DeviceUnreachable,
    Timeout,
    ProtocolError,
    VerificationMismatch,
    RetriesExhausted,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::InvalidArgument => write!(f, "invalid argument"),
            ErrorKind::InvalidConfiguration => write!(f, "invalid configuration"),
            ErrorKind::OperationInProgress => write!(f, "operation in progress"),
            ErrorKind::NotConnected => write!(f, "not connected"),
            ErrorKind::DeviceUnreachable => write!(f, "device unreachable"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::ProtocolError => write!(f, "protocol error"),
            ErrorKind::VerificationMismatch => write!(f, "verification mismatch"),
            ErrorKind::RetriesExhausted => write!(f, "retries exhausted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retries_exhausted_underlying() {
        let err = FlashError::RetriesExhausted {
            stage: Stage::Verify,
            attempts: 1,
            source: ChannelError::VerificationMismatch {
                offset: 4,
                expected: 0xAA,
                actual: 0xFF,
            },
        };
        assert_eq!(err.kind(), ErrorKind::RetriesExhausted);
        assert_eq!(err.underlying(), ErrorKind::VerificationMismatch);
        assert!(!err.is_rejection());
        assert!(err.to_string().contains("Verify failed after 1 attempt(s)"));
    }

    #[test]
    fn test_rejections() {
        assert!(FlashError::OperationInProgress.is_rejection());
        assert!(FlashError::invalid_argument("empty").is_rejection());
        assert!(
            FlashError::NotConnected {
                state: SessionState::Disconnected
            }
            .is_rejection()
        );
        assert!(!FlashError::Channel(ChannelError::Timeout { timeout_ms: 10 }).is_rejection());
    }

    #[test]
    fn test_channel_error_kind_passthrough() {
        let err: FlashError = ChannelError::DeviceUnreachable("gone".into()).into();
        assert_eq!(err.kind(), ErrorKind::DeviceUnreachable);
        assert_eq!(err.underlying(), ErrorKind::DeviceUnreachable);
    }
}
