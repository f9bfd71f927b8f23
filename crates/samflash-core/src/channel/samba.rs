//! SAM-BA style monitor dialogue over a raw USB transport.
//!
//! Commands are ASCII, terminated by `#`, addresses and lengths as 8 hex
//! digits. The monitor answers each command with the `\n\r` prompt:
//!
//! | Command            | Meaning                         |
//! |--------------------|---------------------------------|
//! | `#`                | autobaud / sync                 |
//! | `V#`               | version string, then prompt     |
//! | `N#`               | status query (`B` = busy)       |
//! | `X<addr>#`         | erase flash from `addr`         |
//! | `S<addr>,<len>#`   | `len` data bytes follow         |
//! | `R<addr>,<len>#`   | device sends `len` bytes        |
//! | `G<addr>#`         | jump to `addr` (leave monitor)  |

use std::time::Duration;

use tracing::{debug, info, warn};

use super::traits::{ChannelError, DeviceChannel, DeviceInfo, DeviceStatus};
use crate::transport::nusb::parse_usb_id;
use crate::transport::{NusbTransport, TransportError, UsbDeviceEntry, UsbTransport};

const PROMPT: &[u8] = b"\n\r";

/// Flash geometry assumed until the device says otherwise.
pub const DEFAULT_FLASH_SIZE: u32 = 1024 * 1024;
pub const DEFAULT_PAGE_SIZE: u32 = 256;

const MONITOR_NAME: &str = "SAM-BA monitor";

type Opener<T> = Box<dyn Fn(&str) -> Result<T, TransportError> + Send>;
type Lister = Box<dyn Fn() -> Result<Vec<UsbDeviceEntry>, TransportError> + Send>;

/// Device channel speaking the monitor dialogue over `T`.
pub struct SambaChannel<T: UsbTransport> {
    opener: Opener<T>,
    lister: Lister,
    transport: Option<T>,
    device_id: String,
}

impl SambaChannel<NusbTransport> {
    /// Channel over real USB. Device ids are `VID:PID` or `auto`.
    pub fn usb() -> Self {
        Self::with_opener(|device_id| {
            if device_id.eq_ignore_ascii_case("auto") {
                return NusbTransport::open();
            }
            let (vid, pid) = parse_usb_id(device_id).ok_or_else(|| {
                TransportError::OpenFailed(format!("expected VID:PID, got '{device_id}'"))
            })?;
            NusbTransport::open_with_ids(vid, pid)
        })
        .with_lister(NusbTransport::list)
    }
}

impl<T: UsbTransport> SambaChannel<T> {
    /// Channel whose transport is produced by `opener` on each connect.
    /// It discovers nothing until [`with_lister`](Self::with_lister) is set.
    pub fn with_opener<F>(opener: F) -> Self
    where
        F: Fn(&str) -> Result<T, TransportError> + Send + 'static,
    {
        Self {
            opener: Box::new(opener),
            lister: Box::new(|| Ok(Vec::new())),
            transport: None,
            device_id: String::new(),
        }
    }

    /// Use `lister` to enumerate attached monitors.
    pub fn with_lister<F>(mut self, lister: F) -> Self
    where
        F: Fn() -> Result<Vec<UsbDeviceEntry>, TransportError> + Send + 'static,
    {
        self.lister = Box::new(lister);
        self
    }

    fn transport(&self) -> Result<&T, ChannelError> {
        self.transport.as_ref().ok_or(ChannelError::NotConnected)
    }

    fn send(&self, command: &str) -> Result<(), ChannelError> {
        debug!(command = %command, "Monitor command");
        self.transport()?.write(command.as_bytes())?;
        Ok(())
    }

    fn expect_prompt(&self, timeout: Duration) -> Result<Vec<u8>, ChannelError> {
        let reply = self.transport()?.read_until(PROMPT, timeout)?;
        let end = reply
            .windows(PROMPT.len())
            .position(|w| w == PROMPT)
            .unwrap_or(reply.len());
        Ok(reply[..end].to_vec())
    }

    fn command(&self, command: &str, timeout: Duration) -> Result<Vec<u8>, ChannelError> {
        self.send(command)?;
        self.expect_prompt(timeout)
    }
}

impl<T: UsbTransport> DeviceChannel for SambaChannel<T> {
    fn discover(&self) -> Result<Vec<DeviceInfo>, ChannelError> {
        let entries = (self.lister)()?;
        Ok(entries
            .into_iter()
            .map(|entry| DeviceInfo {
                id: format!("{:04x}:{:04x}", entry.vid, entry.pid),
                name: entry.product.unwrap_or_else(|| MONITOR_NAME.to_string()),
                flash_size: DEFAULT_FLASH_SIZE,
                page_size: DEFAULT_PAGE_SIZE,
            })
            .collect())
    }

    fn connect(&mut self, device_id: &str, timeout: Duration) -> Result<DeviceInfo, ChannelError> {
        if self.transport.is_some() {
            warn!(device = %self.device_id, "Already connected, reopening");
            self.disconnect()?;
        }

        let transport = (self.opener)(device_id)?;
        self.transport = Some(transport);

        let handshake = self.command("#", timeout).and_then(|_| self.command("V#", timeout));
        let version = match handshake {
            Ok(v) => v,
            Err(e) => {
                self.transport = None;
                return Err(e);
            }
        };

        let version = String::from_utf8_lossy(&version).trim().to_string();
        if version.is_empty() {
            self.transport = None;
            return Err(ChannelError::protocol("empty version response"));
        }

        info!(device = %device_id, version = %version, "Monitor connected");
        self.device_id = device_id.to_string();
        Ok(DeviceInfo {
            id: device_id.to_string(),
            name: version,
            flash_size: DEFAULT_FLASH_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    fn disconnect(&mut self) -> Result<(), ChannelError> {
        if let Some(transport) = self.transport.take() {
            // The device may reset immediately, so no reply is awaited.
            if let Err(e) = transport.write(b"G00000000#") {
                debug!(error = %e, "Go command not delivered");
            }
            info!(device = %self.device_id, "Monitor disconnected");
        }
        self.device_id.clear();
        Ok(())
    }

    fn erase_chip(&mut self, timeout: Duration) -> Result<(), ChannelError> {
        self.command("X00000000#", timeout)?;
        Ok(())
    }

    fn write_block(
        &mut self,
        offset: u32,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        if data.len() > DEFAULT_PAGE_SIZE as usize {
            return Err(ChannelError::protocol(format!(
                "block of {} bytes exceeds page size {}",
                data.len(),
                DEFAULT_PAGE_SIZE
            )));
        }
        self.send(&format!("S{:08X},{:08X}#", offset, data.len()))?;
        self.transport()?.write(data)?;
        self.expect_prompt(timeout)?;
        Ok(())
    }

    fn read_block(
        &mut self,
        offset: u32,
        len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, ChannelError> {
        self.send(&format!("R{:08X},{:08X}#", offset, len))?;
        Ok(self.transport()?.read_exact(len, timeout)?)
    }

    fn status(&mut self, timeout: Duration) -> Result<DeviceStatus, ChannelError> {
        let reply = self.command("N#", timeout)?;
        Ok(match reply.first() {
            None => DeviceStatus::Idle,
            Some(b'B') => DeviceStatus::Busy,
            Some(_) => DeviceStatus::Error,
        })
    }

    fn page_size(&self) -> usize {
        DEFAULT_PAGE_SIZE as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    const T: Duration = Duration::from_millis(100);

    fn channel(mock: &MockTransport) -> SambaChannel<MockTransport> {
        let mock = mock.clone();
        SambaChannel::with_opener(move |_| Ok(mock.clone()))
    }

    fn connected(mock: &MockTransport) -> SambaChannel<MockTransport> {
        let mut ch = channel(mock);
        mock.queue_ok();
        mock.queue_response(b"v2.0 Nov 2026\n\r");
        ch.connect("03eb:6124", T).unwrap();
        mock.clear_writes();
        ch
    }

    #[test]
    fn test_connect_handshake() {
        let mock = MockTransport::new();
        let mut ch = channel(&mock);
        mock.queue_ok();
        mock.queue_response(b"v2.0 Nov 2026\n\r");

        let info = ch.connect("03eb:6124", T).unwrap();
        assert_eq!(info.name, "v2.0 Nov 2026");
        assert_eq!(info.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(mock.get_writes(), vec![b"#".to_vec(), b"V#".to_vec()]);
    }

    #[test]
    fn test_connect_silent_device_times_out() {
        let mock = MockTransport::new();
        let mut ch = channel(&mock);

        let err = ch.connect("03eb:6124", T).unwrap_err();
        assert!(matches!(err, ChannelError::Timeout { .. }));
        assert!(matches!(
            ch.erase_chip(T),
            Err(ChannelError::NotConnected)
        ));
    }

    #[test]
    fn test_connect_open_failure_is_unreachable() {
        let mut ch: SambaChannel<MockTransport> = SambaChannel::with_opener(|_| {
            Err(TransportError::DeviceNotFound {
                vid: 0x03EB,
                pid: 0x6124,
            })
        });
        let err = ch.connect("03eb:6124", T).unwrap_err();
        assert!(matches!(err, ChannelError::DeviceUnreachable(_)));
    }

    #[test]
    fn test_discover_formats_ids() {
        let ch: SambaChannel<MockTransport> =
            SambaChannel::with_opener(|_| Ok(MockTransport::new())).with_lister(|| {
                Ok(vec![
                    UsbDeviceEntry {
                        vid: 0x03EB,
                        pid: 0x6124,
                        product: None,
                    },
                    UsbDeviceEntry {
                        vid: 0x03EB,
                        pid: 0x6129,
                        product: Some("SAM BA".to_string()),
                    },
                ])
            });

        let devices = ch.discover().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id, "03eb:6124");
        assert_eq!(devices[0].name, MONITOR_NAME);
        assert_eq!(devices[1].name, "SAM BA");
        // Discovered ids are accepted by connect.
        assert_eq!(parse_usb_id(&devices[1].id), Some((0x03EB, 0x6129)));
    }

    #[test]
    fn test_discover_without_lister_is_empty() {
        let mock = MockTransport::new();
        assert!(channel(&mock).discover().unwrap().is_empty());
    }

    #[test]
    fn test_discover_bus_error_is_unreachable() {
        let ch: SambaChannel<MockTransport> =
            SambaChannel::with_opener(|_| Ok(MockTransport::new()))
                .with_lister(|| Err(TransportError::OpenFailed("no usb access".into())));
        assert!(matches!(
            ch.discover(),
            Err(ChannelError::DeviceUnreachable(_))
        ));
    }

    #[test]
    fn test_write_block_framing() {
        let mock = MockTransport::new();
        let mut ch = connected(&mock);
        mock.queue_ok();

        ch.write_block(0x100, &[0xDE, 0xAD], T).unwrap();

        let writes = mock.get_writes();
        assert_eq!(writes[0], b"S00000100,00000002#");
        assert_eq!(writes[1], vec![0xDE, 0xAD]);
    }

    #[test]
    fn test_write_block_oversized() {
        let mock = MockTransport::new();
        let mut ch = connected(&mock);
        let err = ch.write_block(0, &[0u8; 512], T).unwrap_err();
        assert!(matches!(err, ChannelError::ProtocolError(_)));
        assert!(mock.get_writes().is_empty());
    }

    #[test]
    fn test_verify_reads_back() {
        let mock = MockTransport::new();
        let mut ch = connected(&mock);
        mock.queue_response(&[1, 2, 3]);

        ch.verify_flash(&[1, 2, 3], T).unwrap();
        assert_eq!(mock.get_writes(), vec![b"R00000000,00000003#".to_vec()]);

        mock.queue_response(&[1, 0, 3]);
        let err = ch.verify_flash(&[1, 2, 3], T).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::VerificationMismatch { offset: 1, .. }
        ));
    }

    #[test]
    fn test_erase_and_status() {
        let mock = MockTransport::new();
        let mut ch = connected(&mock);

        mock.queue_ok();
        ch.erase_chip(T).unwrap();

        mock.queue_ok();
        assert_eq!(ch.status(T).unwrap(), DeviceStatus::Idle);
        mock.queue_response(b"B\n\r");
        assert_eq!(ch.status(T).unwrap(), DeviceStatus::Busy);

        assert_eq!(
            mock.get_writes(),
            vec![b"X00000000#".to_vec(), b"N#".to_vec(), b"N#".to_vec()]
        );
    }

    #[test]
    fn test_disconnect_sends_go() {
        let mock = MockTransport::new();
        let mut ch = connected(&mock);

        ch.disconnect().unwrap();
        assert_eq!(mock.get_writes(), vec![b"G00000000#".to_vec()]);
        assert!(matches!(ch.status(T), Err(ChannelError::NotConnected)));

        // Second disconnect is a no-op.
        ch.disconnect().unwrap();
    }

    #[test]
    fn test_unplugged_device_is_unreachable() {
        let mock = MockTransport::new();
        let mut ch = connected(&mock);
        mock.disconnect();

        let err = ch.erase_chip(T).unwrap_err();
        assert!(matches!(err, ChannelError::DeviceUnreachable(_)));
    }
}
