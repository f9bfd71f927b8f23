//! Session state machine.

use std::fmt;

/// Current phase of a flashing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No device session.
    #[default]
    Disconnected,
    /// Device connected and idle.
    Connected,
    /// Erase stage in progress.
    Erasing,
    /// Write stage in progress.
    Writing,
    /// Verify stage in progress.
    Verifying,
    /// Last operation failed terminally. A fresh `connect` recovers.
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "Disconnected"),
            SessionState::Connected => write!(f, "Connected"),
            SessionState::Erasing => write!(f, "Erasing"),
            SessionState::Writing => write!(f, "Writing"),
            SessionState::Verifying => write!(f, "Verifying"),
            SessionState::Error => write!(f, "Error"),
        }
    }
}

impl SessionState {
    /// Whether a device operation (flash, erase, verify, status) may start.
    pub fn is_ready(&self) -> bool {
        matches!(self, SessionState::Connected)
    }
}

/// One retried unit of work within an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Erase,
    Write,
    Verify,
    Read,
}

impl Stage {
    /// State the session is in while this stage runs. Reads leave the
    /// session state alone.
    pub fn session_state(&self) -> Option<SessionState> {
        match self {
            Stage::Erase => Some(SessionState::Erasing),
            Stage::Write => Some(SessionState::Writing),
            Stage::Verify => Some(SessionState::Verifying),
            Stage::Read => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Erase => write!(f, "Erase"),
            Stage::Write => write!(f, "Write"),
            Stage::Verify => write!(f, "Verify"),
            Stage::Read => write!(f, "Read"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        assert_eq!(SessionState::default(), SessionState::Disconnected);
        assert!(!SessionState::default().is_ready());
    }

    #[test]
    fn test_stage_states() {
        assert_eq!(Stage::Erase.session_state(), Some(SessionState::Erasing));
        assert_eq!(Stage::Write.session_state(), Some(SessionState::Writing));
        assert_eq!(Stage::Verify.session_state(), Some(SessionState::Verifying));
        assert_eq!(Stage::Read.session_state(), None);
        assert!(!SessionState::Writing.is_ready());
        assert!(!SessionState::Error.is_ready());
    }
}
