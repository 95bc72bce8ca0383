pub mod client;
pub mod error;
pub mod pdu;
pub mod server;

pub use client::{DiscoveredCharacteristic, DiscoveredDescriptor, DiscoveredService, GattCharListener, GattClient};
pub use error::{GattError, GattInternalError};
pub use pdu::{error_code, opcode, AttPdu, AttPduError};
pub use server::{
    char_props, AttributeLocation, CharacteristicSpec, DescriptorSpec, GattServer, GattServerBuilder, GattServerListener, GattServerSession,
    ServiceSpec,
};
