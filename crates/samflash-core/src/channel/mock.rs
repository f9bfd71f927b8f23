//! Deterministic in-memory device channel.
//!
//! Used by the tests and by the CLI's simulated device. Failures can be
//! scripted per operation, calls are recorded, and an operation can be held
//! at a gate to simulate a long-running device call.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use super::traits::{ChannelError, DeviceChannel, DeviceInfo, DeviceStatus, first_mismatch};

/// Channel operations, as recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelOp {
    Discover,
    Connect,
    Disconnect,
    EraseChip,
    WriteBlock,
    ReadBlock,
    VerifyFlash,
    Status,
}

pub const MOCK_FLASH_SIZE: usize = 64 * 1024;
pub const MOCK_PAGE_SIZE: usize = 256;
/// Id under which the simulated device is discovered.
pub const MOCK_DEVICE_ID: &str = "sim0";
const MOCK_DEVICE_NAME: &str = "Simulated device";

/// Per-call outcomes queued for one operation; `None` lets a call through.
#[derive(Default)]
struct Script {
    queued: VecDeque<Option<ChannelError>>,
    always: Option<ChannelError>,
}

impl Script {
    fn next_failure(&mut self) -> Option<ChannelError> {
        match self.queued.pop_front() {
            Some(slot) => slot,
            None => self.always.clone(),
        }
    }
}

struct Gate {
    entered: Sender<()>,
    release: Receiver<()>,
}

struct MockState {
    connected: bool,
    memory: Vec<u8>,
    calls: Vec<ChannelOp>,
    scripts: HashMap<ChannelOp, Script>,
    gates: HashMap<ChannelOp, Gate>,
    delays: HashMap<ChannelOp, Duration>,
    status: DeviceStatus,
}

/// Handle controlling a gated mock operation.
pub struct GateHandle {
    entered: Receiver<()>,
    release: Sender<()>,
}

impl GateHandle {
    /// Block until the gated operation has been entered.
    pub fn wait_entered(&self) {
        let _ = self.entered.recv();
    }

    /// Let the gated operation complete.
    pub fn release(&self) {
        let _ = self.release.send(());
    }
}

/// Scriptable mock device channel.
///
/// Clones share state, so a test can keep a handle for inspection after
/// handing the channel to an orchestrator.
#[derive(Clone)]
pub struct MockChannel {
    state: Arc<Mutex<MockState>>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::with_flash_size(MOCK_FLASH_SIZE)
    }

    /// Mock with `size` bytes of erased (0xFF) flash.
    pub fn with_flash_size(size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                connected: false,
                memory: vec![0xFF; size],
                calls: Vec::new(),
                scripts: HashMap::new(),
                gates: HashMap::new(),
                delays: HashMap::new(),
                status: DeviceStatus::Idle,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `times` calls of `op` with `error`, then succeed.
    pub fn fail_times(&self, op: ChannelOp, times: usize, error: ChannelError) {
        let mut state = self.lock();
        let script = state.scripts.entry(op).or_default();
        script
            .queued
            .extend(std::iter::repeat_n(Some(error), times));
    }

    /// Let the next `successes` calls of `op` through, then fail one with
    /// `error`.
    pub fn fail_after(&self, op: ChannelOp, successes: usize, error: ChannelError) {
        let mut state = self.lock();
        let script = state.scripts.entry(op).or_default();
        script.queued.extend(std::iter::repeat_n(None, successes));
        script.queued.push_back(Some(error));
    }

    /// Fail every call of `op` with `error`.
    pub fn fail_always(&self, op: ChannelOp, error: ChannelError) {
        self.lock().scripts.entry(op).or_default().always = Some(error);
    }

    /// Remove all scripted failures for `op`.
    pub fn clear_failures(&self, op: ChannelOp) {
        self.lock().scripts.remove(&op);
    }

    /// Hold the next call of `op` until the returned handle releases it.
    pub fn block_next(&self, op: ChannelOp) -> GateHandle {
        let (entered_tx, entered_rx) = channel();
        let (release_tx, release_rx) = channel();
        self.lock().gates.insert(
            op,
            Gate {
                entered: entered_tx,
                release: release_rx,
            },
        );
        GateHandle {
            entered: entered_rx,
            release: release_tx,
        }
    }

    /// Delay every call of `op`. The delay ignores the caller's timeout,
    /// like a device that answers late.
    pub fn set_delay(&self, op: ChannelOp, delay: Duration) {
        self.lock().delays.insert(op, delay);
    }

    pub fn set_status(&self, status: DeviceStatus) {
        self.lock().status = status;
    }

    /// Overwrite flash contents starting at offset 0.
    pub fn load_memory(&self, bytes: &[u8]) {
        let mut state = self.lock();
        let n = bytes.len().min(state.memory.len());
        state.memory[..n].copy_from_slice(&bytes[..n]);
    }

    pub fn memory(&self) -> Vec<u8> {
        self.lock().memory.clone()
    }

    pub fn calls(&self) -> Vec<ChannelOp> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, op: ChannelOp) -> usize {
        self.lock().calls.iter().filter(|c| **c == op).count()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn device_info(&self, id: &str) -> DeviceInfo {
        DeviceInfo {
            id: id.to_string(),
            name: MOCK_DEVICE_NAME.to_string(),
            flash_size: u32::try_from(self.lock().memory.len()).unwrap_or(u32::MAX),
            page_size: MOCK_PAGE_SIZE as u32,
        }
    }

    /// Record the call, honour gate/delay, then return the scripted failure.
    fn enter(&self, op: ChannelOp, needs_connection: bool) -> Result<(), ChannelError> {
        let (gate, delay) = {
            let mut state = self.lock();
            state.calls.push(op);
            (state.gates.remove(&op), state.delays.get(&op).copied())
        };

        if let Some(gate) = gate {
            let _ = gate.entered.send(());
            let _ = gate.release.recv();
        }
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let mut state = self.lock();
        if needs_connection && !state.connected {
            return Err(ChannelError::NotConnected);
        }
        match state.scripts.get_mut(&op).and_then(Script::next_failure) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceChannel for MockChannel {
    fn discover(&self) -> Result<Vec<DeviceInfo>, ChannelError> {
        self.enter(ChannelOp::Discover, false)?;
        Ok(vec![self.device_info(MOCK_DEVICE_ID)])
    }

    fn connect(&mut self, device_id: &str, _timeout: Duration) -> Result<DeviceInfo, ChannelError> {
        self.enter(ChannelOp::Connect, false)?;
        self.lock().connected = true;
        Ok(self.device_info(device_id))
    }

    fn disconnect(&mut self) -> Result<(), ChannelError> {
        let result = self.enter(ChannelOp::Disconnect, false);
        self.lock().connected = false;
        result
    }

    fn erase_chip(&mut self, _timeout: Duration) -> Result<(), ChannelError> {
        self.enter(ChannelOp::EraseChip, true)?;
        self.lock().memory.fill(0xFF);
        Ok(())
    }

    fn write_block(
        &mut self,
        offset: u32,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<(), ChannelError> {
        self.enter(ChannelOp::WriteBlock, true)?;
        let mut state = self.lock();
        let start = offset as usize;
        let end = start + data.len();
        if end > state.memory.len() {
            return Err(ChannelError::protocol(format!(
                "write of {} bytes at 0x{:08X} exceeds flash size",
                data.len(),
                offset
            )));
        }
        // NOR semantics: programming can only clear bits.
        for (cell, byte) in state.memory[start..end].iter_mut().zip(data) {
            *cell &= *byte;
        }
        Ok(())
    }

    fn read_block(
        &mut self,
        offset: u32,
        len: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, ChannelError> {
        self.enter(ChannelOp::ReadBlock, true)?;
        let state = self.lock();
        let start = (offset as usize).min(state.memory.len());
        let end = (start + len).min(state.memory.len());
        Ok(state.memory[start..end].to_vec())
    }

    fn verify_flash(&mut self, expected: &[u8], _timeout: Duration) -> Result<(), ChannelError> {
        self.enter(ChannelOp::VerifyFlash, true)?;
        let state = self.lock();
        let end = expected.len().min(state.memory.len());
        match first_mismatch(0, expected, &state.memory[..end]) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn status(&mut self, _timeout: Duration) -> Result<DeviceStatus, ChannelError> {
        self.enter(ChannelOp::Status, true)?;
        Ok(self.lock().status)
    }

    fn page_size(&self) -> usize {
        MOCK_PAGE_SIZE
    }
}
