//! HCI transport and engine: framed Command/ACL-Data/Event I/O over a raw
//! socket, outbound command serialization with CommandComplete/Status
//! correlation, LE-meta sub-event classification, connection-handle
//! accounting, and per-handle ACL write-credit pacing.

pub mod credit;
pub mod engine;
pub mod error;
pub mod frame;
pub mod opcodes;
pub mod transport;

pub use credit::CreditTracker;
pub use engine::{CommandReply, HciEngine, HciEngineHandle};
pub use error::{HciError, HciInternalError};
pub use frame::{AclDataFrame, BroadcastFlag, CommandFrame, EventFrame, Frame, Opcode, PacketBoundary};
pub use transport::HciTransport;
