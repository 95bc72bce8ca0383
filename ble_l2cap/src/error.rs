use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum L2capError {
    #[error("peer closed the link")]
    PeerClosed,
    #[error("l2cap operation timed out")]
    Timeout,
    #[error("channel already closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(#[from] L2capInternalError),
}

#[derive(Error, Debug, Clone)]
pub enum L2capInternalError {
    #[error("hci engine error: {0}")]
    Hci(#[from] ble_hci::HciError),
    #[error("malformed l2cap frame: declared length {declared} exceeds buffer of {actual}")]
    Malformed { declared: usize, actual: usize },
    #[error("demux task for handle {0:#06x} is gone")]
    DemuxGone(u16),
}

impl From<ble_hci::HciError> for L2capError {
    fn from(err: ble_hci::HciError) -> Self {
        Self::Transport(L2capInternalError::Hci(err))
    }
}
