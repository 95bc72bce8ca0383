//! HCI packet indicator framing and the three packet kinds the engine
//! exchanges with the controller: Command, ACL-Data, and Event. The
//! transport prefixes each outbound frame with the packet-indicator byte
//! the Bluetooth Core UART/H4 framing uses; the raw HCI socket already
//! demultiplexes by packet type on read, so inbound frames arrive without
//! it and the indicator is only reattached on write via [`Frame::to_bytes`].

use ble_octets::{ReadError, Reader, Writer};
use thiserror::Error;

pub const PACKET_COMMAND: u8 = 0x01;
pub const PACKET_ACL_DATA: u8 = 0x02;
pub const PACKET_EVENT: u8 = 0x04;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("truncated frame: {0}")]
    Truncated(#[from] ReadError),
    #[error("unknown packet indicator {0:#04x}")]
    UnknownPacketType(u8),
}

/// A 16-bit HCI command opcode, `OGF (6 bits) | OCF (10 bits)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Opcode(pub u16);

impl Opcode {
    pub const fn new(ogf: u8, ocf: u16) -> Self {
        Self(((ogf as u16) << 10) | (ocf & 0x03FF))
    }

    pub fn ogf(self) -> u8 {
        (self.0 >> 10) as u8
    }

    pub fn ocf(self) -> u16 {
        self.0 & 0x03FF
    }

    pub const NOP: Opcode = Opcode(0x0000);
}

impl From<u16> for Opcode {
    fn from(v: u16) -> Self {
        Self(v)
    }
}

/// An outbound HCI Command packet.
#[derive(Debug, Clone)]
pub struct CommandFrame {
    pub opcode: Opcode,
    pub params: Vec<u8>,
}

impl CommandFrame {
    pub fn new(opcode: Opcode, params: Vec<u8>) -> Self {
        Self { opcode, params }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(4 + self.params.len());
        w.put_u8(PACKET_COMMAND);
        w.put_u16_le(self.opcode.0);
        w.put_u8(self.params.len() as u8);
        w.put_bytes(&self.params);
        w.into_vec()
    }
}

/// ACL packet-boundary flag (bits 4-5 of the handle/flags field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum PacketBoundary {
    FirstNonAutoFlushable,
    Continuing,
    FirstAutoFlushable,
    Complete,
}

impl PacketBoundary {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0b00 => Self::FirstNonAutoFlushable,
            0b01 => Self::Continuing,
            0b10 => Self::FirstAutoFlushable,
            _ => Self::Complete,
        }
    }

    fn to_bits(self) -> u16 {
        match self {
            Self::FirstNonAutoFlushable => 0b00,
            Self::Continuing => 0b01,
            Self::FirstAutoFlushable => 0b10,
            Self::Complete => 0b11,
        }
    }
}

/// Broadcast flag (bits 6-7 of the handle/flags field); point-to-point for
/// every LE link this stack drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastFlag {
    PointToPoint,
    ActiveSlaveBroadcast,
}

impl BroadcastFlag {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0b00 => Self::PointToPoint,
            _ => Self::ActiveSlaveBroadcast,
        }
    }

    fn to_bits(self) -> u16 {
        match self {
            Self::PointToPoint => 0b00,
            Self::ActiveSlaveBroadcast => 0b01,
        }
    }
}

/// An HCI ACL-Data packet: 12-bit connection handle, packet-boundary and
/// broadcast flags, and the L2CAP-framed payload `ble_l2cap` demultiplexes.
#[derive(Debug, Clone)]
pub struct AclDataFrame {
    pub handle: u16,
    pub boundary: PacketBoundary,
    pub broadcast: BroadcastFlag,
    pub data: Vec<u8>,
}

impl AclDataFrame {
    pub fn new(handle: u16, boundary: PacketBoundary, data: Vec<u8>) -> Self {
        Self {
            handle,
            boundary,
            broadcast: BroadcastFlag::PointToPoint,
            data,
        }
    }

    pub fn parse(mut r: Reader<'_>) -> Result<Self, FrameError> {
        let handle_flags = r.get_u16_le()?;
        let len = r.get_u16_le()?;
        let data = r.get_bytes(len as usize)?.to_vec();
        Ok(Self {
            handle: handle_flags & 0x0FFF,
            boundary: PacketBoundary::from_bits(((handle_flags >> 12) & 0b11) as u8),
            broadcast: BroadcastFlag::from_bits(((handle_flags >> 14) & 0b11) as u8),
            data,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let handle_flags =
            (self.handle & 0x0FFF) | (self.boundary.to_bits() << 12) | (self.broadcast.to_bits() << 14);
        let mut w = Writer::with_capacity(5 + self.data.len());
        w.put_u8(PACKET_ACL_DATA);
        w.put_u16_le(handle_flags);
        w.put_u16_le(self.data.len() as u16);
        w.put_bytes(&self.data);
        w.into_vec()
    }
}

/// An inbound HCI Event packet: event code, optional LE-meta sub-event, and
/// the parameter buffer.
#[derive(Debug, Clone)]
pub struct EventFrame {
    pub code: u8,
    pub params: Vec<u8>,
}

pub const EVT_LE_META: u8 = 0x3E;

impl EventFrame {
    pub fn parse(mut r: Reader<'_>) -> Result<Self, FrameError> {
        let code = r.get_u8()?;
        let len = r.get_u8()?;
        let params = r.get_bytes(len as usize)?.to_vec();
        Ok(Self { code, params })
    }

    /// For an `EVT_LE_META` event, the first parameter byte is the LE
    /// sub-event code; returns it alongside the remaining sub-event params.
    pub fn le_meta_sub_event(&self) -> Option<(u8, &[u8])> {
        if self.code != EVT_LE_META || self.params.is_empty() {
            return None;
        }
        Some((self.params[0], &self.params[1..]))
    }
}

/// An inbound or outbound HCI frame, tagged by the leading packet indicator.
#[derive(Debug, Clone)]
pub enum Frame {
    Command(CommandFrame),
    AclData(AclDataFrame),
    Event(EventFrame),
}

impl Frame {
    pub fn parse(buf: &[u8]) -> Result<Self, FrameError> {
        let mut r = Reader::new(buf);
        let indicator = r.get_u8()?;
        match indicator {
            PACKET_ACL_DATA => Ok(Frame::AclData(AclDataFrame::parse(r)?)),
            PACKET_EVENT => Ok(Frame::Event(EventFrame::parse(r)?)),
            PACKET_COMMAND => {
                let opcode = Opcode(r.get_u16_le()?);
                let len = r.get_u8()?;
                let params = r.get_bytes(len as usize)?.to_vec();
                Ok(Frame::Command(CommandFrame { opcode, params }))
            }
            other => Err(FrameError::UnknownPacketType(other)),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Frame::Command(c) => c.to_bytes(),
            Frame::AclData(a) => a.to_bytes(),
            Frame::Event(e) => {
                let mut w = Writer::with_capacity(3 + e.params.len());
                w.put_u8(PACKET_EVENT);
                w.put_u8(e.code);
                w.put_u8(e.params.len() as u8);
                w.put_bytes(&e.params);
                w.into_vec()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_packs_ogf_and_ocf() {
        let op = Opcode::new(0x08, 0x0006); // LE Connection Update
        assert_eq!(op.ogf(), 0x08);
        assert_eq!(op.ocf(), 0x0006);
    }

    #[test]
    fn acl_frame_round_trips_through_bytes() {
        let frame = AclDataFrame::new(0x0040, PacketBoundary::Complete, vec![0xAA, 0xBB, 0xCC]);
        let bytes = frame.to_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.get_u8().unwrap(), PACKET_ACL_DATA);
        let parsed = AclDataFrame::parse(r).unwrap();
        assert_eq!(parsed.handle, 0x0040);
        assert_eq!(parsed.boundary, PacketBoundary::Complete);
        assert_eq!(parsed.data, vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn event_frame_exposes_le_meta_sub_event() {
        let bytes = [EVT_LE_META, 0x02, 0x01, 0x2A];
        let r = Reader::new(&bytes[1..]);
        let evt = EventFrame::parse(r).unwrap();
        let (sub_code, params) = evt.le_meta_sub_event().unwrap();
        assert_eq!(sub_code, 0x01);
        assert_eq!(params, &[0x2A]);
    }

    #[test]
    fn command_frame_parses_back_through_generic_frame() {
        let cmd = CommandFrame::new(Opcode::new(0x03, 0x0003), vec![]); // Reset
        let bytes = cmd.to_bytes();
        match Frame::parse(&bytes).unwrap() {
            Frame::Command(c) => assert_eq!(c.opcode, cmd.opcode),
            _ => panic!("expected Command frame"),
        }
    }
}
