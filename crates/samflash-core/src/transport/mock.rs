//! Mock USB transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::traits::{TransportError, UsbTransport};

/// Mock transport for unit testing channel protocol logic.
///
/// Clones share the same queues, so a test can keep a handle after moving
/// the transport into a channel.
#[derive(Clone)]
pub struct MockTransport {
    /// Queued responses to return on read.
    responses: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Simulated VID/PID.
    vid: u16,
    pid: u16,
    /// Whether device is "connected".
    connected: Arc<Mutex<bool>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_ids(0x03EB, 0x6124)
    }

    pub fn with_ids(vid: u16, pid: u16) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            vid,
            pid,
            connected: Arc::new(Mutex::new(true)),
        }
    }

    /// Queue a response to be returned on a later read.
    pub fn queue_response(&self, bytes: &[u8]) {
        lock(&self.responses).push_back(bytes.to_vec());
    }

    /// Queue the monitor's command acknowledgement.
    pub fn queue_ok(&self) {
        self.queue_response(b"\n\r");
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        lock(&self.write_log).clone()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        lock(&self.write_log).clear();
    }

    /// Number of responses not yet consumed.
    pub fn pending_responses(&self) -> usize {
        lock(&self.responses).len()
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *lock(&self.connected) = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        *lock(&self.connected) = true;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for MockTransport {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        if !*lock(&self.connected) {
            return Err(TransportError::Disconnected);
        }
        lock(&self.write_log).push(data.to_vec());
        Ok(data.len())
    }

    fn read(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !*lock(&self.connected) {
            return Err(TransportError::Disconnected);
        }
        let mut queue = lock(&self.responses);
        let mut next = queue
            .pop_front()
            .ok_or_else(|| TransportError::timeout(timeout))?;
        if next.len() > max_len {
            let rest = next.split_off(max_len);
            queue.push_front(rest);
        }
        Ok(next)
    }

    fn is_connected(&self) -> bool {
        *lock(&self.connected)
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}
