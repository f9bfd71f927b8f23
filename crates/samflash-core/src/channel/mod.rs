//! Device channel module.

pub mod mock;
pub mod samba;
pub mod traits;

pub use mock::{ChannelOp, GateHandle, MockChannel};
pub use samba::SambaChannel;
pub use traits::{ChannelError, DeviceChannel, DeviceInfo, DeviceStatus};
