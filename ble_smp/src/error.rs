use thiserror::Error;

use crate::pdu::PduError;

#[derive(Error, Debug, Clone)]
pub enum SmpError {
    #[error("pairing failed: reason {0:#04x}")]
    Failed(u8),
    #[error("key distribution watchdog expired")]
    WatchdogExpired,
    #[error("operation is invalid for state {0}")]
    InvalidState(&'static str),
    #[error("internal error: {0}")]
    Internal(#[from] SmpInternalError),
}

#[derive(Error, Debug, Clone)]
pub enum SmpInternalError {
    #[error("l2cap error: {0}")]
    L2cap(#[from] ble_l2cap::L2capError),
    #[error("malformed smp pdu: {0}")]
    Pdu(#[from] PduError),
    #[error("key-bin io error: {0}")]
    KeyBinIo(String),
    #[error("key-bin checksum mismatch")]
    KeyBinCorrupt,
    #[error("key-bin version {0} is unsupported")]
    UnsupportedVersion(u8),
    #[error("pairing callback channel dropped without a reply")]
    CallbackDropped,
}

impl From<ble_l2cap::L2capError> for SmpError {
    fn from(err: ble_l2cap::L2capError) -> Self {
        Self::Internal(SmpInternalError::L2cap(err))
    }
}

impl From<PduError> for SmpError {
    fn from(err: PduError) -> Self {
        Self::Internal(SmpInternalError::Pdu(err))
    }
}
