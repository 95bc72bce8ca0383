//! Adapter and Device lifecycle orchestration: ties the HCI engine,
//! management channel, L2CAP mux, SMP pairing, and GATT client/server
//! crates together behind the Manager/Adapter/Device application surface.

pub mod adapter;
pub mod device;
pub mod error;
pub mod listener;
pub mod manager;

pub use adapter::{Adapter, AdapterHandle};
pub use device::{Device, DeviceDisconnectReason, DeviceRole, DeviceState, ResolvedCharacteristic};
pub use error::HostError;
pub use listener::{AdapterStatusListener, ChangedAdapterSetListener, DiscoveryPolicy};
pub use manager::Manager;
