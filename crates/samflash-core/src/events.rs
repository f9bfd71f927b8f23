//! Event system for UI decoupling.
//!
//! The orchestrator reports what it does to an injected observer instead of
//! a process-wide logger, so CLI/GUI front ends pick their own sink.

use std::fmt;
use std::sync::Mutex;

use crate::state::{SessionState, Stage};

/// Public orchestrator operations, as named in events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Scan,
    Connect,
    Disconnect,
    Flash,
    Verify,
    Erase,
    Status,
    Read,
    Write,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Scan => write!(f, "scan"),
            Operation::Connect => write!(f, "connect"),
            Operation::Disconnect => write!(f, "disconnect"),
            Operation::Flash => write!(f, "flash"),
            Operation::Verify => write!(f, "verify"),
            Operation::Erase => write!(f, "erase"),
            Operation::Status => write!(f, "status"),
            Operation::Read => write!(f, "read"),
            Operation::Write => write!(f, "write"),
        }
    }
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum FlashEvent {
    /// A public operation was accepted.
    OperationStarted { operation: Operation },
    /// Session state changed.
    StateChanged { from: SessionState, to: SessionState },
    /// Device connected.
    DeviceConnected { device_id: String, name: String },
    /// Device disconnected.
    DeviceDisconnected,
    /// One stage attempt failed.
    AttemptFailed {
        stage: Stage,
        attempt: u32,
        max_attempts: u32,
        error: String,
        will_retry: bool,
    },
    /// Progress update within a stage.
    Progress { stage: Stage, current: u64, total: u64 },
    /// A public operation returned.
    OperationFinished {
        operation: Operation,
        success: bool,
        attempts: u32,
    },
}

/// Observer trait for receiving orchestrator events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait FlashObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &FlashEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FlashObserver for NullObserver {
    fn on_event(&self, _event: &FlashEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::OperationStarted { operation } => {
                tracing::info!(operation = %operation, "Operation started");
            }
            FlashEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "State changed");
            }
            FlashEvent::DeviceConnected { device_id, name } => {
                tracing::info!(device = %device_id, name = %name, "Device connected");
            }
            FlashEvent::DeviceDisconnected => {
                tracing::info!("Device disconnected");
            }
            FlashEvent::AttemptFailed {
                stage,
                attempt,
                max_attempts,
                error,
                will_retry,
            } => {
                if *will_retry {
                    tracing::warn!(stage = %stage, attempt, max_attempts, "Attempt failed, retrying: {}", error);
                } else {
                    tracing::error!(stage = %stage, attempt, max_attempts, "Attempt failed: {}", error);
                }
            }
            FlashEvent::Progress {
                stage,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(stage = %stage, progress = %format!("{}%", pct), "Progress");
            }
            FlashEvent::OperationFinished {
                operation,
                success,
                attempts,
            } => {
                if *success {
                    tracing::info!(operation = %operation, attempts, "Operation succeeded");
                } else {
                    tracing::error!(operation = %operation, attempts, "Operation failed");
                }
            }
        }
    }
}

/// Observer that keeps every event, for tests and post-mortems.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<FlashEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FlashEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// State transitions seen so far, in order.
    pub fn transitions(&self) -> Vec<(SessionState, SessionState)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                FlashEvent::StateChanged { from, to } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl FlashObserver for RecordingObserver {
    fn on_event(&self, event: &FlashEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}
