//! Security Manager Protocol: pairing state machine over the fixed SMP
//! L2CAP channel, IO-capability driven method selection and key
//! derivation for both LE Legacy Pairing and LE Secure Connections, and
//! versioned key-bin persistence.

pub mod crypto;
pub mod error;
pub mod keybin;
pub mod pdu;
pub mod state;

pub use crypto::{IoCapability, PairingMethod};
pub use error::{SmpError, SmpInternalError};
pub use keybin::{LongTermKeyMaterial, PairingMode, PairingRole, SmpKeyBundle};
pub use pdu::{IdentityAddress, PairingFeatures, SmpPdu};
pub use state::{PairingParams, PairingState, SmpDriver, SmpEventListener};
