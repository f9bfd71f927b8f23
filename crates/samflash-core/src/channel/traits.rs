//! Device channel capability.
//!
//! Defines the `DeviceChannel` trait the orchestrator drives,
//! allowing different implementations (SAM-BA over USB, mock, etc.).

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::error::ErrorKind;
use crate::transport::TransportError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Device unreachable: {0}")]
    DeviceUnreachable(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error(
        "Verification mismatch at 0x{offset:08X}: expected 0x{expected:02X}, got 0x{actual:02X}"
    )]
    VerificationMismatch { offset: u32, expected: u8, actual: u8 },

    #[error("Channel is not connected")]
    NotConnected,
}

impl ChannelError {
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout {
            timeout_ms: timeout.as_millis().min(u64::MAX as u128) as u64,
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }

    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::DeviceUnreachable(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ChannelError::Timeout { .. } => ErrorKind::Timeout,
            ChannelError::DeviceUnreachable(_) | ChannelError::NotConnected => {
                ErrorKind::DeviceUnreachable
            }
            ChannelError::ProtocolError(_) => ErrorKind::ProtocolError,
            ChannelError::VerificationMismatch { .. } => ErrorKind::VerificationMismatch,
        }
    }
}

impl From<TransportError> for ChannelError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout { timeout_ms } => ChannelError::Timeout { timeout_ms },
            TransportError::DeviceNotFound { .. }
            | TransportError::OpenFailed(_)
            | TransportError::ClaimInterfaceFailed { .. }
            | TransportError::Disconnected => ChannelError::DeviceUnreachable(err.to_string()),
            other => ChannelError::ProtocolError(other.to_string()),
        }
    }
}

/// Device status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Idle,
    Busy,
    Error,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Idle => write!(f, "Idle"),
            DeviceStatus::Busy => write!(f, "Busy"),
            DeviceStatus::Error => write!(f, "Error"),
        }
    }
}

/// Information reported by a device on connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub flash_size: u32,
    pub page_size: u32,
}

/// Abstract device channel.
///
/// Every call is synchronous and receives the per-call timeout; the
/// implementation is responsible for not blocking much longer than that.
/// `write_block` is not assumed to be idempotent.
pub trait DeviceChannel: Send {
    /// Open a session with the identified device.
    fn connect(&mut self, device_id: &str, timeout: Duration) -> Result<DeviceInfo, ChannelError>;

    /// List attached devices this channel could connect to. Needs no
    /// session and leaves any open one alone.
    fn discover(&self) -> Result<Vec<DeviceInfo>, ChannelError>;

    /// Close the session. Closing a closed channel is not an error.
    fn disconnect(&mut self) -> Result<(), ChannelError>;

    /// Erase the whole target memory.
    fn erase_chip(&mut self, timeout: Duration) -> Result<(), ChannelError>;

    /// Program `data` at `offset`.
    fn write_block(&mut self, offset: u32, data: &[u8], timeout: Duration)
    -> Result<(), ChannelError>;

    /// Read `len` bytes starting at `offset`.
    fn read_block(&mut self, offset: u32, len: usize, timeout: Duration)
    -> Result<Vec<u8>, ChannelError>;

    /// Compare device memory from offset 0 against `expected`.
    ///
    /// The default reads back page-sized blocks and compares them.
    fn verify_flash(&mut self, expected: &[u8], timeout: Duration) -> Result<(), ChannelError> {
        let page = self.page_size().max(1);
        let mut offset = 0usize;
        while offset < expected.len() {
            let end = (offset + page).min(expected.len());
            let actual = self.read_block(offset as u32, end - offset, timeout)?;
            if let Some(err) = first_mismatch(offset as u32, &expected[offset..end], &actual) {
                return Err(err);
            }
            offset = end;
        }
        Ok(())
    }

    /// Query the device state.
    fn status(&mut self, timeout: Duration) -> Result<DeviceStatus, ChannelError>;

    /// Preferred read-back granularity.
    fn page_size(&self) -> usize {
        256
    }
}

/// Find the first differing byte between `expected` and `actual`.
///
/// A short read counts as a mismatch at the first missing byte.
pub fn first_mismatch(base: u32, expected: &[u8], actual: &[u8]) -> Option<ChannelError> {
    expected.iter().enumerate().find_map(|(i, &want)| {
        let got = actual.get(i).copied();
        if got == Some(want) {
            None
        } else {
            Some(ChannelError::VerificationMismatch {
                offset: base + i as u32,
                expected: want,
                actual: got.unwrap_or(0xFF),
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_mismatch() {
        assert!(first_mismatch(0, &[1, 2, 3], &[1, 2, 3]).is_none());

        let err = first_mismatch(0x100, &[1, 2, 3], &[1, 9, 3]).unwrap();
        assert_eq!(
            err,
            ChannelError::VerificationMismatch {
                offset: 0x101,
                expected: 2,
                actual: 9
            }
        );

        let err = first_mismatch(0, &[1, 2], &[1]).unwrap();
        assert!(matches!(
            err,
            ChannelError::VerificationMismatch { offset: 1, .. }
        ));
    }

    #[test]
    fn test_transport_error_classification() {
        let err: ChannelError = TransportError::Timeout { timeout_ms: 20 }.into();
        assert_eq!(err, ChannelError::Timeout { timeout_ms: 20 });

        let err: ChannelError = TransportError::Disconnected.into();
        assert_eq!(err.kind(), ErrorKind::DeviceUnreachable);

        let err: ChannelError = TransportError::ReadFailed("short".into()).into();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
    }
}
