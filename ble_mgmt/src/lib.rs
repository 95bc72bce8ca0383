//! Management channel: adapter power/name/secure-connections/default
//! connection parameters and long-term-key/IRK/link-key upload, bound to
//! the control channel rather than one adapter's raw HCI channel.

pub mod channel;
pub mod error;
pub mod frame;
pub mod opcodes;
pub mod types;

pub use channel::{ManagementChannel, ManagementSocket, ManagementSocketHandle};
pub use error::{ManagementError, ManagementInternalError};
pub use frame::{CommandFrame, EventFrame};
pub use types::{AutoConnectPolicy, DefaultConnParams, IdentityResolvingKey, LinkKey, LongTermKey, SecureConnectionsMode};
