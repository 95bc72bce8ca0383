//! Management channel wire framing: a 6-byte header (opcode, adapter index,
//! param length) followed by command or event parameters, carried over the
//! control channel socket rather than the raw per-adapter HCI channel.

use ble_octets::ReadError;
use thiserror::Error;

pub const EVT_CMD_COMPLETE: u16 = 0x0001;
pub const EVT_CMD_STATUS: u16 = 0x0002;

/// No particular adapter; used for commands that configure the whole
/// management interface rather than one controller.
pub const INDEX_NONE: u16 = 0xFFFF;

const HEADER_LEN: usize = 6;

#[derive(Error, Debug, Clone)]
pub enum FrameError {
    #[error("truncated management frame: {0}")]
    Truncated(#[from] ReadError),
    #[error("management frame length field ({declared}) does not match payload ({actual})")]
    LengthMismatch { declared: usize, actual: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub opcode: u16,
    pub index: u16,
    pub len: u16,
}

impl Header {
    fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&self.opcode.to_le_bytes());
        buf[2..4].copy_from_slice(&self.index.to_le_bytes());
        buf[4..6].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    fn parse(buf: &[u8]) -> Result<Self, FrameError> {
        let mut reader = ble_octets::Reader::new(buf);
        let opcode = reader.get_u16_le()?;
        let index = reader.get_u16_le()?;
        let len = reader.get_u16_le()?;
        Ok(Self { opcode, index, len })
    }
}

/// A command sent to the controller (or to the management daemon's adapter
/// index `INDEX_NONE` for global settings).
#[derive(Debug, Clone)]
pub struct CommandFrame {
    pub opcode: u16,
    pub index: u16,
    pub params: Vec<u8>,
}

impl CommandFrame {
    pub fn new(opcode: u16, index: u16, params: Vec<u8>) -> Self {
        Self { opcode, index, params }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let header = Header {
            opcode: self.opcode,
            index: self.index,
            len: self.params.len() as u16,
        };
        let mut out = Vec::with_capacity(HEADER_LEN + self.params.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&self.params);
        out
    }
}

/// An inbound frame: either `CommandComplete`/`CommandStatus` carrying the
/// result of a previously sent command, or an unsolicited adapter event.
#[derive(Debug, Clone)]
pub struct EventFrame {
    pub event: u16,
    pub index: u16,
    pub params: Vec<u8>,
}

impl EventFrame {
    pub fn parse(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::Truncated(ReadError::UnexpectedEof {
                needed: HEADER_LEN,
                remaining: buf.len(),
            }));
        }
        let header = Header::parse(&buf[..HEADER_LEN])?;
        let params = buf[HEADER_LEN..].to_vec();
        if params.len() != header.len as usize {
            return Err(FrameError::LengthMismatch {
                declared: header.len as usize,
                actual: params.len(),
            });
        }
        Ok(Self {
            event: header.opcode,
            index: header.index,
            params,
        })
    }

    /// Splits a `CommandComplete` payload into the original command opcode,
    /// its status byte, and the remaining return parameters.
    pub fn as_cmd_complete(&self) -> Option<(u16, u8, &[u8])> {
        if self.event != EVT_CMD_COMPLETE || self.params.len() < 3 {
            return None;
        }
        let opcode = u16::from_le_bytes([self.params[0], self.params[1]]);
        let status = self.params[2];
        Some((opcode, status, &self.params[3..]))
    }

    /// Splits a `CommandStatus` payload into the original command opcode and
    /// its status byte.
    pub fn as_cmd_status(&self) -> Option<(u16, u8)> {
        if self.event != EVT_CMD_STATUS || self.params.len() < 3 {
            return None;
        }
        let opcode = u16::from_le_bytes([self.params[0], self.params[1]]);
        let status = self.params[2];
        Some((opcode, status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_frame_round_trips_header() {
        let cmd = CommandFrame::new(0x0005, INDEX_NONE, vec![0x01]);
        let bytes = cmd.to_bytes();
        assert_eq!(&bytes[0..2], &0x0005u16.to_le_bytes());
        assert_eq!(&bytes[2..4], &INDEX_NONE.to_le_bytes());
        assert_eq!(&bytes[4..6], &1u16.to_le_bytes());
        assert_eq!(&bytes[6..], &[0x01]);
    }

    #[test]
    fn event_frame_extracts_cmd_complete_fields() {
        let mut params = vec![0x05, 0x00, 0x00];
        params.extend_from_slice(&[0xAA, 0xBB]);
        let evt = EventFrame {
            event: EVT_CMD_COMPLETE,
            index: INDEX_NONE,
            params,
        };
        let (opcode, status, ret) = evt.as_cmd_complete().unwrap();
        assert_eq!(opcode, 0x0005);
        assert_eq!(status, 0x00);
        assert_eq!(ret, &[0xAA, 0xBB]);
    }

    #[test]
    fn event_frame_rejects_length_mismatch() {
        let mut buf = Header {
            opcode: EVT_CMD_COMPLETE,
            index: INDEX_NONE,
            len: 10,
        }
        .to_bytes()
        .to_vec();
        buf.extend_from_slice(&[0x00]);
        assert!(matches!(EventFrame::parse(&buf), Err(FrameError::LengthMismatch { .. })));
    }
}
