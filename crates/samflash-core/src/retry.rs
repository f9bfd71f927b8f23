//! Bounded per-stage retry, and timeout classification of single channel calls.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::channel::ChannelError;
use crate::error::FlashError;
use crate::events::{FlashEvent, FlashObserver};
use crate::outcome::StageReport;
use crate::policy::FlashPolicy;
use crate::state::Stage;

/// Run `attempt` up to `policy.max_attempts()` times.
///
/// `attempt` receives the 1-based attempt number. There is no backoff
/// between attempts. Channel calls inside an attempt go through
/// [`timed_call`], which bounds each call rather than the whole attempt.
pub(crate) fn run_stage<T, O, F>(
    stage: Stage,
    policy: &FlashPolicy,
    observer: &O,
    mut attempt: F,
) -> (Result<T, FlashError>, StageReport)
where
    O: FlashObserver + ?Sized,
    F: FnMut(u32) -> Result<T, ChannelError>,
{
    let max_attempts = policy.max_attempts();
    let mut attempt_no = 0;

    loop {
        attempt_no += 1;
        match attempt(attempt_no) {
            Ok(value) => {
                debug!(stage = %stage, attempt = attempt_no, "Stage succeeded");
                let report = StageReport {
                    stage,
                    attempts: attempt_no,
                    succeeded: true,
                };
                return (Ok(value), report);
            }
            Err(err) => {
                let will_retry = attempt_no < max_attempts;
                observer.on_event(&FlashEvent::AttemptFailed {
                    stage,
                    attempt: attempt_no,
                    max_attempts,
                    error: err.to_string(),
                    will_retry,
                });

                if !will_retry {
                    let report = StageReport {
                        stage,
                        attempts: attempt_no,
                        succeeded: false,
                    };
                    let err = FlashError::RetriesExhausted {
                        stage,
                        attempts: attempt_no,
                        source: err,
                    };
                    return (Err(err), report);
                }
            }
        }
    }
}

/// Run one channel call against `timeout`.
///
/// A failed call that outlived `timeout` is reported as `Timeout` whatever
/// the channel said. A late success is accepted.
pub(crate) fn timed_call<T, F>(timeout: Duration, call: F) -> Result<T, ChannelError>
where
    F: FnOnce() -> Result<T, ChannelError>,
{
    let started = Instant::now();
    let result = call();
    let elapsed = started.elapsed();

    match result {
        Ok(value) => {
            if elapsed > timeout {
                warn!(elapsed_ms = elapsed.as_millis() as u64, "Late reply accepted");
            }
            Ok(value)
        }
        Err(err) => Err(classify(err, elapsed, timeout)),
    }
}

fn classify(err: ChannelError, elapsed: Duration, timeout: Duration) -> ChannelError {
    match err {
        ChannelError::Timeout { .. } => err,
        other if elapsed > timeout => {
            debug!(error = %other, "Call exceeded timeout, classifying as Timeout");
            ChannelError::timeout(timeout)
        }
        other => other,
    }
}
