//! L2CAP as a from-scratch software layer over HCI ACL-Data frames: fixed
//! CIDs (ATT, SMP) multiplexed per connection handle, with reassembly,
//! fragmentation, and sized PDU read/write.

pub mod channel;
pub mod cid;
pub mod error;
pub mod frame;
pub mod reassembly;

pub use channel::{L2capChannel, L2capMux, SecurityLevel, ATT_DEFAULT_MTU};
pub use cid::{CID_ATT, CID_SMP};
pub use error::{L2capError, L2capInternalError};
pub use frame::L2capFrame;
