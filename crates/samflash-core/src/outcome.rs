//! Per-operation outcome values.

use crate::error::{ErrorKind, FlashError};
use crate::state::Stage;

/// How one stage of an operation went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: Stage,
    pub attempts: u32,
    pub succeeded: bool,
}

/// Result of one orchestrator operation.
///
/// `attempts_made` counts the attempts of the last stage executed: that is
/// the stage whose result decided the outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Success {
        attempts_made: u32,
        stages: Vec<StageReport>,
    },
    Failure {
        kind: ErrorKind,
        attempts_made: u32,
        last_error: FlashError,
        stages: Vec<StageReport>,
    },
}

impl OperationOutcome {
    pub(crate) fn success(stages: Vec<StageReport>) -> Self {
        let attempts_made = stages.last().map_or(1, |s| s.attempts);
        Self::Success {
            attempts_made,
            stages,
        }
    }

    pub(crate) fn failure(error: FlashError, stages: Vec<StageReport>) -> Self {
        let attempts_made = match &error {
            FlashError::RetriesExhausted { attempts, .. } => *attempts,
            e if e.is_rejection() => 0,
            _ => stages.last().map_or(1, |s| s.attempts),
        };
        Self::Failure {
            kind: error.kind(),
            attempts_made,
            last_error: error,
            stages,
        }
    }

    /// Failure raised before any device interaction.
    pub(crate) fn rejected(error: FlashError) -> Self {
        Self::failure(error, Vec::new())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OperationOutcome::Success { .. })
    }

    pub fn attempts_made(&self) -> u32 {
        match self {
            OperationOutcome::Success { attempts_made, .. }
            | OperationOutcome::Failure { attempts_made, .. } => *attempts_made,
        }
    }

    pub fn stages(&self) -> &[StageReport] {
        match self {
            OperationOutcome::Success { stages, .. }
            | OperationOutcome::Failure { stages, .. } => stages,
        }
    }

    /// Attempts made by `stage`, if it ran.
    pub fn stage_attempts(&self, stage: Stage) -> Option<u32> {
        self.stages()
            .iter()
            .find(|s| s.stage == stage)
            .map(|s| s.attempts)
    }

    pub fn error(&self) -> Option<&FlashError> {
        match self {
            OperationOutcome::Success { .. } => None,
            OperationOutcome::Failure { last_error, .. } => Some(last_error),
        }
    }

    /// Convert into a `Result`, dropping the stage reports.
    pub fn into_result(self) -> Result<u32, FlashError> {
        match self {
            OperationOutcome::Success { attempts_made, .. } => Ok(attempts_made),
            OperationOutcome::Failure { last_error, .. } => Err(last_error),
        }
    }
}
