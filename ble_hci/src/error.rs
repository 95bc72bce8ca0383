use thiserror::Error;

use crate::frame::FrameError;

#[derive(Error, Debug, Clone)]
pub enum HciError {
    #[error("hci command timed out waiting for {0}")]
    CommandTimeout(&'static str),
    #[error("controller returned status {0:#04x} for opcode {1:#06x}")]
    ControllerStatus(u8, u16),
    #[error("hci transport closed")]
    TransportClosed,
    #[error("internal error: {0}")]
    Internal(#[from] HciInternalError),
}

#[derive(Error, Debug, Clone)]
pub enum HciInternalError {
    #[error("io: {kind}; {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },
    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),
    #[error("command queue closed unexpectedly")]
    QueueClosed,
}

impl From<std::io::Error> for HciError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(HciInternalError::Io {
            kind: err.kind(),
            message: err.to_string(),
        })
    }
}

impl From<FrameError> for HciError {
    fn from(err: FrameError) -> Self {
        Self::Internal(HciInternalError::Frame(err))
    }
}
