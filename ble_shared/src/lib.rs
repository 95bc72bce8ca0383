//! Primitives shared across the BLE host stack: device addresses and
//! short-UUID expansion, the copy-on-write listener lists backing the
//! public callback-trait surface, internal pub/sub fan-out between
//! background tasks, and graceful shutdown signalling.

pub mod addr;
pub mod listener;
pub mod pubsub;
pub mod shutdown;

pub use addr::{Address, AddressParseError, AddressType, UuidExt};
pub use listener::ListenerList;
pub use pubsub::{PubSubError, SubscriptionReq};
pub use shutdown::Shutdown;
