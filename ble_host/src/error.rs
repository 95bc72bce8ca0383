//! Host-level error taxonomy, spec.md §7: transport faults cascade into
//! device/adapter state changes rather than surfacing to unrelated callers,
//! so this type stays the per-operation surface.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum HostError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("command timed out")]
    CommandTimeout,
    #[error("command failed with status {0:#04x}")]
    CommandFailed(u8),
    #[error("malformed protocol data: {0}")]
    Protocol(String),
    #[error("att error response: opcode {opcode:#04x} handle {handle:#06x} code {code:#04x}")]
    AttError { opcode: u8, handle: u16, code: u8 },
    #[error("pairing failed: reason {0:#04x}")]
    SmpFailed(u8),
    #[error("operation requires a state the device is not in")]
    NotReady,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("operation cancelled by shutdown")]
    Cancelled,
    #[error("no such device")]
    NoSuchDevice,
}

impl From<ble_hci::HciError> for HostError {
    fn from(err: ble_hci::HciError) -> Self {
        match err {
            ble_hci::HciError::CommandTimeout(_) => Self::CommandTimeout,
            ble_hci::HciError::ControllerStatus(status, _) => Self::CommandFailed(status),
            ble_hci::HciError::TransportClosed => Self::Transport("hci transport closed".into()),
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<ble_mgmt::ManagementError> for HostError {
    fn from(err: ble_mgmt::ManagementError) -> Self {
        match err {
            ble_mgmt::ManagementError::CommandTimeout(_) => Self::CommandTimeout,
            ble_mgmt::ManagementError::CommandFailed(status, _) => Self::CommandFailed(status),
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<ble_l2cap::L2capError> for HostError {
    fn from(err: ble_l2cap::L2capError) -> Self {
        match err {
            ble_l2cap::L2capError::PeerClosed | ble_l2cap::L2capError::Closed => Self::Transport("l2cap channel closed".into()),
            ble_l2cap::L2capError::Timeout => Self::CommandTimeout,
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<ble_gatt::GattError> for HostError {
    fn from(err: ble_gatt::GattError) -> Self {
        match err {
            ble_gatt::GattError::AttError { opcode, handle, code } => Self::AttError { opcode, handle, code },
            ble_gatt::GattError::Timeout => Self::CommandTimeout,
            ble_gatt::GattError::PeerClosed => Self::Transport("att channel closed".into()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<ble_smp::SmpError> for HostError {
    fn from(err: ble_smp::SmpError) -> Self {
        match &err {
            ble_smp::SmpError::Failed(reason) => Self::SmpFailed(*reason),
            ble_smp::SmpError::WatchdogExpired => Self::SmpFailed(0x00),
            _ => Self::Protocol(err.to_string()),
        }
    }
}
