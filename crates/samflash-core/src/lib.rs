//! SamFlash-Core: firmware flashing orchestration over an abstract device channel.
//!
//! The crate sequences connect → erase → write → verify against a device,
//! retrying each stage up to a policy bound and reporting a classified
//! outcome per operation.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Transport**: raw USB byte I/O (nusb, mock)
//! - **Channel**: device capability the orchestrator drives (SAM-BA monitor, mock)
//! - **Policy**: retries, per-call timeout, optional erase/verify stages
//! - **Image**: in-memory firmware bytes
//! - **Events**: observer pattern for UI decoupling
//! - **Orchestrator**: session state machine and retry logic
//!
//! # Example
//!
//! ```no_run
//! use samflash_core::{FirmwareImage, FlashOrchestrator, FlashPolicy, SambaChannel};
//!
//! # fn main() -> anyhow::Result<()> {
//! let orchestrator = FlashOrchestrator::new(SambaChannel::usb(), FlashPolicy::default());
//! let image = FirmwareImage::from_bytes(std::fs::read("firmware.bin")?)?;
//!
//! orchestrator.connect("03eb:6124").into_result()?;
//! let outcome = orchestrator.flash_firmware(&image);
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod error;
pub mod events;
pub mod image;
pub mod orchestrator;
pub mod outcome;
pub mod policy;
mod retry;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use channel::{
    ChannelError, ChannelOp, DeviceChannel, DeviceInfo, DeviceStatus, MockChannel, SambaChannel,
};
pub use error::{ErrorKind, FlashError};
pub use events::{
    FlashEvent, FlashObserver, NullObserver, Operation, RecordingObserver, TracingObserver,
};
pub use image::FirmwareImage;
pub use orchestrator::FlashOrchestrator;
pub use outcome::{OperationOutcome, StageReport};
pub use policy::{FlashPolicy, FlashPolicyBuilder};
pub use state::{SessionState, Stage};
pub use transport::{
    MockTransport, NusbTransport, TransportError, UsbDeviceEntry, UsbTransport,
};
