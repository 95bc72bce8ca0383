use thiserror::Error;

use crate::frame::FrameError;

#[derive(Error, Debug, Clone)]
pub enum ManagementError {
    #[error("management command timed out after {0:?}")]
    CommandTimeout(std::time::Duration),
    #[error("management daemon returned status {0:#04x} for opcode {1:#06x}")]
    CommandFailed(u8, u16),
    #[error("management channel closed")]
    ChannelClosed,
    #[error("internal error: {0}")]
    Internal(#[from] ManagementInternalError),
}

#[derive(Error, Debug, Clone)]
pub enum ManagementInternalError {
    #[error("io: {kind}; {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },
    #[error("malformed management frame: {0}")]
    Frame(#[from] FrameError),
    #[error("reply queue closed unexpectedly")]
    QueueClosed,
}

impl From<std::io::Error> for ManagementError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(ManagementInternalError::Io {
            kind: err.kind(),
            message: err.to_string(),
        })
    }
}

impl From<FrameError> for ManagementError {
    fn from(err: FrameError) -> Self {
        Self::Internal(ManagementInternalError::Frame(err))
    }
}
