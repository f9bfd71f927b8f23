//! Flash orchestrator - sequences connect, erase, write and verify against a
//! device channel under a [`FlashPolicy`].
//!
//! One operation runs at a time per orchestrator. A call made while another
//! is in flight fails with [`FlashError::OperationInProgress`] instead of
//! queueing. Each stage is retried as a whole, never block by block.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, instrument, warn};

use crate::channel::{ChannelError, DeviceChannel, DeviceInfo, DeviceStatus};
use crate::error::FlashError;
use crate::events::{FlashEvent, FlashObserver, Operation, TracingObserver};
use crate::image::{Blocks, FirmwareImage};
use crate::outcome::{OperationOutcome, StageReport};
use crate::policy::FlashPolicy;
use crate::retry::{run_stage, timed_call};
use crate::state::{SessionState, Stage};

/// Mutable session data, guarded by a single mutex.
#[derive(Debug, Default)]
struct Session {
    state: SessionState,
    policy: FlashPolicy,
    busy: bool,
    device: Option<DeviceInfo>,
    /// Image written by the last successful write stage of this session.
    last_image: Option<FirmwareImage>,
}

/// What an operation needs from the session before it may start.
#[derive(Debug, Clone, Copy)]
enum Requires {
    Nothing,
    Connected,
}

/// Exclusive right to run one operation. Dropping it frees the session.
struct ActiveOperation<'a, C: DeviceChannel, O: FlashObserver> {
    owner: &'a FlashOrchestrator<C, O>,
    /// Policy snapshot taken when the operation started.
    policy: FlashPolicy,
    channel: MutexGuard<'a, C>,
}

impl<C: DeviceChannel, O: FlashObserver> Drop for ActiveOperation<'_, C, O> {
    fn drop(&mut self) {
        self.owner.session().busy = false;
    }
}

/// Drives a [`DeviceChannel`] through flashing operations.
pub struct FlashOrchestrator<C: DeviceChannel, O: FlashObserver = TracingObserver> {
    session: Mutex<Session>,
    channel: Mutex<C>,
    observer: Arc<O>,
}

impl<C: DeviceChannel> FlashOrchestrator<C, TracingObserver> {
    /// Create an orchestrator that reports events through `tracing`.
    pub fn new(channel: C, policy: FlashPolicy) -> Self {
        Self::with_observer(channel, policy, Arc::new(TracingObserver))
    }
}

impl<C: DeviceChannel, O: FlashObserver> FlashOrchestrator<C, O> {
    /// Create an orchestrator with a custom event sink.
    pub fn with_observer(channel: C, policy: FlashPolicy, observer: Arc<O>) -> Self {
        Self {
            session: Mutex::new(Session {
                policy,
                ..Session::default()
            }),
            channel: Mutex::new(channel),
            observer,
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: FlashEvent) {
        self.observer.on_event(&event);
    }

    /// Replace the active policy. A running operation keeps the policy it
    /// started with.
    pub fn set_config(&self, policy: FlashPolicy) {
        debug!(?policy, "Policy replaced");
        self.session().policy = policy;
    }

    /// Current policy, by value.
    pub fn get_config(&self) -> FlashPolicy {
        self.session().policy.clone()
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.session().state
    }

    /// Device reported by the last successful connect, while connected.
    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.session().device.clone()
    }

    /// Whether an operation is currently in flight.
    pub fn is_busy(&self) -> bool {
        self.session().busy
    }

    fn set_state(&self, to: SessionState) {
        let from = {
            let mut session = self.session();
            std::mem::replace(&mut session.state, to)
        };
        if from != to {
            self.emit(FlashEvent::StateChanged { from, to });
        }
    }

    fn begin(
        &self,
        operation: Operation,
        requires: Requires,
    ) -> Result<ActiveOperation<'_, C, O>, FlashError> {
        let policy = {
            let mut session = self.session();
            if session.busy {
                warn!(operation = %operation, "Rejected: operation in progress");
                return Err(FlashError::OperationInProgress);
            }
            if let Requires::Connected = requires
                && !session.state.is_ready()
            {
                return Err(FlashError::NotConnected {
                    state: session.state,
                });
            }
            session.busy = true;
            session.policy.clone()
        };

        // Only the holder of the busy flag reaches this point.
        let channel = self.channel.lock().unwrap_or_else(|e| e.into_inner());
        self.emit(FlashEvent::OperationStarted { operation });

        Ok(ActiveOperation {
            owner: self,
            policy,
            channel,
        })
    }

    fn finish(&self, operation: Operation, outcome: OperationOutcome) -> OperationOutcome {
        self.emit(FlashEvent::OperationFinished {
            operation,
            success: outcome.is_success(),
            attempts: outcome.attempts_made(),
        });
        outcome
    }

    /// Devices the channel can see. Needs no session and does not change
    /// the session state.
    #[instrument(skip(self))]
    pub fn scan_devices(&self) -> Result<Vec<DeviceInfo>, FlashError> {
        let op = self.begin(Operation::Scan, Requires::Nothing)?;
        let timeout = op.policy.timeout();
        let result = timed_call(timeout, || op.channel.discover()).map_err(FlashError::from);
        drop(op);

        if let Ok(devices) = &result {
            info!(count = devices.len(), "Scan complete");
        }
        self.emit(FlashEvent::OperationFinished {
            operation: Operation::Scan,
            success: result.is_ok(),
            attempts: 1,
        });
        result
    }

    /// Open a session with `device_id`.
    ///
    /// On failure the session is left `Disconnected`.
    #[instrument(skip(self))]
    pub fn connect(&self, device_id: &str) -> OperationOutcome {
        if device_id.trim().is_empty() {
            return OperationOutcome::rejected(FlashError::invalid_argument(
                "device id must not be empty",
            ));
        }
        let mut op = match self.begin(Operation::Connect, Requires::Nothing) {
            Ok(op) => op,
            Err(e) => return OperationOutcome::rejected(e),
        };

        let timeout = op.policy.timeout();
        let outcome = match op.channel.connect(device_id, timeout) {
            Ok(info) => {
                info!(device = %info.id, name = %info.name, "Connected");
                {
                    let mut session = self.session();
                    session.device = Some(info.clone());
                    session.last_image = None;
                }
                self.set_state(SessionState::Connected);
                self.emit(FlashEvent::DeviceConnected {
                    device_id: info.id,
                    name: info.name,
                });
                OperationOutcome::success(Vec::new())
            }
            Err(e) => {
                warn!(device = %device_id, error = %e, "Connect failed");
                self.session().device = None;
                self.set_state(SessionState::Disconnected);
                let err = match e {
                    ChannelError::DeviceUnreachable(_) => e,
                    other => ChannelError::DeviceUnreachable(other.to_string()),
                };
                OperationOutcome::failure(err.into(), Vec::new())
            }
        };

        drop(op);
        self.finish(Operation::Connect, outcome)
    }

    /// Close the session. The session ends `Disconnected` even if the channel
    /// reports an error while closing.
    #[instrument(skip(self))]
    pub fn disconnect(&self) -> OperationOutcome {
        let mut op = match self.begin(Operation::Disconnect, Requires::Nothing) {
            Ok(op) => op,
            Err(e) => return OperationOutcome::rejected(e),
        };

        let result = op.channel.disconnect();
        {
            let mut session = self.session();
            session.device = None;
            session.last_image = None;
        }
        self.set_state(SessionState::Disconnected);
        self.emit(FlashEvent::DeviceDisconnected);

        let outcome = match result {
            Ok(()) => OperationOutcome::success(Vec::new()),
            Err(e) => OperationOutcome::failure(e.into(), Vec::new()),
        };
        drop(op);
        self.finish(Operation::Disconnect, outcome)
    }

    /// Write `image` to the device: erase (if enabled), write, verify (if
    /// enabled). Succeeds only if every enabled stage succeeds.
    #[instrument(skip(self, image), fields(len = image.len()))]
    pub fn flash_firmware(&self, image: &FirmwareImage) -> OperationOutcome {
        if image.is_empty() {
            return OperationOutcome::rejected(FlashError::invalid_argument(
                "firmware image is empty",
            ));
        }
        let mut op = match self.begin(Operation::Flash, Requires::Connected) {
            Ok(op) => op,
            Err(e) => return OperationOutcome::rejected(e),
        };

        if let Err(err) = self.check_range(0, image.len()) {
            drop(op);
            return self.finish(Operation::Flash, OperationOutcome::rejected(err));
        }

        let outcome = self.run_flash(&mut op, image);
        drop(op);
        self.finish(Operation::Flash, outcome)
    }

    fn run_flash(
        &self,
        op: &mut ActiveOperation<'_, C, O>,
        image: &FirmwareImage,
    ) -> OperationOutcome {
        let policy = op.policy.clone();
        let block_size = self.block_size_for(&policy);
        let channel = &mut *op.channel;
        let mut stages = Vec::new();

        if policy.erase_before_write() {
            let (result, report) = self.erase_stage(channel, &policy);
            stages.push(report);
            if let Err(e) = result {
                self.set_state(SessionState::Error);
                return OperationOutcome::failure(e, stages);
            }
        }

        debug!(
            blocks = image.block_count(block_size),
            block_size, "Writing image"
        );
        let (result, report) = self.write_stage(
            channel,
            &policy,
            0,
            image.blocks(block_size),
            image.len(),
            true,
        );
        stages.push(report);
        if let Err(e) = result {
            self.session().last_image = None;
            self.set_state(SessionState::Error);
            return OperationOutcome::failure(e, stages);
        }
        self.session().last_image = Some(image.clone());

        if policy.verify_after_write() {
            let (result, report) = self.verify_stage(channel, &policy, image.as_bytes());
            stages.push(report);
            if let Err(e) = result {
                self.set_state(SessionState::Error);
                return OperationOutcome::failure(e, stages);
            }
        }

        info!(bytes = image.len(), "Firmware flashed");
        self.set_state(SessionState::Connected);
        OperationOutcome::success(stages)
    }

    /// Compare device memory with `expected`, or with the image flashed
    /// earlier in this session when `expected` is `None`.
    #[instrument(skip(self, expected))]
    pub fn verify_firmware(&self, expected: Option<&FirmwareImage>) -> OperationOutcome {
        let mut op = match self.begin(Operation::Verify, Requires::Connected) {
            Ok(op) => op,
            Err(e) => return OperationOutcome::rejected(e),
        };

        let image = match expected.cloned().or_else(|| self.session().last_image.clone()) {
            Some(image) => image,
            None => {
                drop(op);
                let err = FlashError::invalid_argument(
                    "nothing flashed this session; an expected image is required",
                );
                return self.finish(Operation::Verify, OperationOutcome::rejected(err));
            }
        };

        let policy = op.policy.clone();
        let (result, report) = self.verify_stage(&mut *op.channel, &policy, image.as_bytes());
        let outcome = match result {
            Ok(()) => {
                self.set_state(SessionState::Connected);
                OperationOutcome::success(vec![report])
            }
            Err(e) => {
                self.set_state(SessionState::Error);
                OperationOutcome::failure(e, vec![report])
            }
        };
        drop(op);
        self.finish(Operation::Verify, outcome)
    }

    /// Erase target memory, regardless of the policy's erase flag.
    #[instrument(skip(self))]
    pub fn erase_device(&self) -> OperationOutcome {
        let mut op = match self.begin(Operation::Erase, Requires::Connected) {
            Ok(op) => op,
            Err(e) => return OperationOutcome::rejected(e),
        };

        let policy = op.policy.clone();
        let (result, report) = self.erase_stage(&mut *op.channel, &policy);
        let outcome = match result {
            Ok(()) => {
                self.session().last_image = None;
                self.set_state(SessionState::Connected);
                OperationOutcome::success(vec![report])
            }
            Err(e) => {
                self.set_state(SessionState::Error);
                OperationOutcome::failure(e, vec![report])
            }
        };
        drop(op);
        self.finish(Operation::Erase, outcome)
    }

    /// Device status snapshot. Does not change the session state.
    #[instrument(skip(self))]
    pub fn status(&self) -> Result<DeviceStatus, FlashError> {
        let mut op = self.begin(Operation::Status, Requires::Connected)?;
        let timeout = op.policy.timeout();
        let channel = &mut *op.channel;
        let result = timed_call(timeout, || channel.status(timeout)).map_err(FlashError::from);
        drop(op);

        self.emit(FlashEvent::OperationFinished {
            operation: Operation::Status,
            success: result.is_ok(),
            attempts: 1,
        });
        result
    }

    /// Read `len` bytes of device memory at `offset`, retried like a stage.
    #[instrument(skip(self))]
    pub fn read_flash(&self, offset: u32, len: usize) -> Result<Vec<u8>, FlashError> {
        if len == 0 {
            return Err(FlashError::invalid_argument("read length must not be zero"));
        }
        let mut op = self.begin(Operation::Read, Requires::Connected)?;
        let policy = op.policy.clone();
        let channel = &mut *op.channel;
        let (result, report) = run_stage(Stage::Read, &policy, self.observer.as_ref(), |_| {
            timed_call(policy.timeout(), || {
                channel.read_block(offset, len, policy.timeout())
            })
        });
        drop(op);

        self.emit(FlashEvent::OperationFinished {
            operation: Operation::Read,
            success: result.is_ok(),
            attempts: report.attempts,
        });
        result
    }

    /// Write raw `data` at `offset` without erasing first.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub fn write_flash(&self, offset: u32, data: &[u8]) -> OperationOutcome {
        if data.is_empty() {
            return OperationOutcome::rejected(FlashError::invalid_argument(
                "write data must not be empty",
            ));
        }
        let mut op = match self.begin(Operation::Write, Requires::Connected) {
            Ok(op) => op,
            Err(e) => return OperationOutcome::rejected(e),
        };
        if let Err(err) = self.check_range(offset, data.len()) {
            drop(op);
            return self.finish(Operation::Write, OperationOutcome::rejected(err));
        }

        let policy = op.policy.clone();
        let blocks = Blocks::new(data, self.block_size_for(&policy));
        let (result, report) =
            self.write_stage(&mut *op.channel, &policy, offset, blocks, data.len(), false);
        let outcome = match result {
            Ok(()) => {
                self.session().last_image = None;
                self.set_state(SessionState::Connected);
                OperationOutcome::success(vec![report])
            }
            Err(e) => {
                self.set_state(SessionState::Error);
                OperationOutcome::failure(e, vec![report])
            }
        };
        drop(op);
        self.finish(Operation::Write, outcome)
    }

    fn erase_stage(
        &self,
        channel: &mut C,
        policy: &FlashPolicy,
    ) -> (Result<(), FlashError>, StageReport) {
        self.enter_stage(Stage::Erase);
        let timeout = policy.timeout();
        run_stage(Stage::Erase, policy, self.observer.as_ref(), |_| {
            timed_call(timeout, || channel.erase_chip(timeout))
        })
    }

    /// Write `blocks` starting at `base`. A failed block abandons the attempt
    /// and the retry starts over at `base`. When `reerase` is set and the
    /// policy erases before writing, a retry erases again first so it never
    /// programs over partially written memory.
    fn write_stage(
        &self,
        channel: &mut C,
        policy: &FlashPolicy,
        base: u32,
        blocks: Blocks<'_>,
        total: usize,
        reerase: bool,
    ) -> (Result<(), FlashError>, StageReport) {
        self.enter_stage(Stage::Write);
        let timeout = policy.timeout();
        let total = total as u64;

        run_stage(Stage::Write, policy, self.observer.as_ref(), |attempt| {
            if attempt > 1 && reerase && policy.erase_before_write() {
                debug!(attempt, "Re-erasing before rewrite");
                timed_call(timeout, || channel.erase_chip(timeout))?;
            }
            let mut written = 0u64;
            for (relative, block) in blocks.clone() {
                let offset = u32::try_from(relative)
                    .ok()
                    .and_then(|relative| base.checked_add(relative))
                    .ok_or_else(|| {
                        ChannelError::protocol(format!(
                            "block at 0x{base:08X}+0x{relative:X} is outside the address space"
                        ))
                    })?;
                timed_call(timeout, || channel.write_block(offset, block, timeout))?;
                written += block.len() as u64;
                if policy.progress_reporting() {
                    self.emit(FlashEvent::Progress {
                        stage: Stage::Write,
                        current: written,
                        total,
                    });
                }
            }
            Ok(())
        })
    }

    fn verify_stage(
        &self,
        channel: &mut C,
        policy: &FlashPolicy,
        expected: &[u8],
    ) -> (Result<(), FlashError>, StageReport) {
        self.enter_stage(Stage::Verify);
        let timeout = policy.timeout();
        run_stage(Stage::Verify, policy, self.observer.as_ref(), |_| {
            timed_call(timeout, || channel.verify_flash(expected, timeout))
        })
    }

    fn enter_stage(&self, stage: Stage) {
        if let Some(state) = stage.session_state() {
            self.set_state(state);
        }
    }

    /// Policy block size, capped at the connected device's page size.
    fn block_size_for(&self, policy: &FlashPolicy) -> usize {
        let page_size = self.device_info().map_or(0, |d| d.page_size as usize);
        if page_size > 0 && policy.block_size() > page_size {
            debug!(
                block_size = policy.block_size(),
                page_size, "Block size capped at device page size"
            );
            page_size
        } else {
            policy.block_size()
        }
    }

    /// Reject `len` bytes at `base` unless they fit the device flash, or the
    /// 32-bit address space when the device does not report a flash size.
    fn check_range(&self, base: u32, len: usize) -> Result<(), FlashError> {
        let limit = match self.device_info() {
            Some(device) if device.flash_size > 0 => u64::from(device.flash_size),
            _ => 1 << 32,
        };
        let end = u64::from(base).saturating_add(len as u64);
        if end > limit {
            return Err(FlashError::invalid_argument(format!(
                "{len} bytes at 0x{base:08X} do not fit {limit} bytes of flash"
            )));
        }
        Ok(())
    }
}
