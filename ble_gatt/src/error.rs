use thiserror::Error;

use crate::pdu::AttPduError;

#[derive(Error, Debug, Clone)]
pub enum GattError {
    #[error("att error response: opcode {opcode:#04x} handle {handle:#06x} code {code:#04x}")]
    AttError { opcode: u8, handle: u16, code: u8 },
    #[error("att request timed out")]
    Timeout,
    #[error("peer closed the att channel")]
    PeerClosed,
    #[error("att transaction already in flight")]
    Busy,
    #[error("internal error: {0}")]
    Internal(#[from] GattInternalError),
}

#[derive(Error, Debug, Clone)]
pub enum GattInternalError {
    #[error("l2cap error: {0}")]
    L2cap(#[from] ble_l2cap::L2capError),
    #[error("malformed att pdu: {0}")]
    Pdu(#[from] AttPduError),
    #[error("unexpected att pdu for request")]
    UnexpectedPdu,
}

impl From<ble_l2cap::L2capError> for GattError {
    fn from(err: ble_l2cap::L2capError) -> Self {
        match err {
            ble_l2cap::L2capError::PeerClosed => Self::PeerClosed,
            ble_l2cap::L2capError::Timeout => Self::Timeout,
            other => Self::Internal(GattInternalError::L2cap(other)),
        }
    }
}

impl From<AttPduError> for GattError {
    fn from(err: AttPduError) -> Self {
        Self::Internal(GattInternalError::Pdu(err))
    }
}
