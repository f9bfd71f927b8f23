//! Raw USB transport module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::MockTransport;
pub use nusb::{NusbTransport, UsbDeviceEntry};
pub use traits::{TransportError, UsbTransport};
