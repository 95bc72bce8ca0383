//! L2CAP basic (B-frame) header: a 16-bit payload length followed by a
//! 16-bit CID, per Core Spec Vol 3 Part A §3.1. One L2CAP frame may span
//! several ACL-Data packets; reassembly lives in [`crate::reassembly`].

use ble_octets::{Reader, Writer};

use crate::error::L2capInternalError;

const HEADER_LEN: usize = 4;

#[derive(Debug, Clone)]
pub struct L2capFrame {
    pub cid: u16,
    pub payload: Vec<u8>,
}

impl L2capFrame {
    pub fn new(cid: u16, payload: Vec<u8>) -> Self {
        Self { cid, payload }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(HEADER_LEN + self.payload.len());
        w.put_u16_le(self.payload.len() as u16);
        w.put_u16_le(self.cid);
        w.put_bytes(&self.payload);
        w.into_vec()
    }

    /// Parses a complete, reassembled L2CAP frame. Returns the frame and the
    /// declared payload length so callers that reassemble can tell whether
    /// more fragments are still expected.
    pub fn parse_header(buf: &[u8]) -> Result<(u16, u16), L2capInternalError> {
        if buf.len() < HEADER_LEN {
            return Err(L2capInternalError::Malformed {
                declared: HEADER_LEN,
                actual: buf.len(),
            });
        }
        let mut r = Reader::new(buf);
        let len = r.get_u16_le().expect("checked length above");
        let cid = r.get_u16_le().expect("checked length above");
        Ok((cid, len))
    }

    pub fn parse_complete(buf: &[u8]) -> Result<Self, L2capInternalError> {
        let (cid, len) = Self::parse_header(buf)?;
        let payload = &buf[HEADER_LEN..];
        if payload.len() != len as usize {
            return Err(L2capInternalError::Malformed {
                declared: len as usize,
                actual: payload.len(),
            });
        }
        Ok(Self {
            cid,
            payload: payload.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let frame = L2capFrame::new(0x0004, vec![0x01, 0x02, 0x03]);
        let bytes = frame.to_bytes();
        let parsed = L2capFrame::parse_complete(&bytes).unwrap();
        assert_eq!(parsed.cid, 0x0004);
        assert_eq!(parsed.payload, vec![0x01, 0x02, 0x03]);
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut bytes = L2capFrame::new(0x0006, vec![0xAA]).to_bytes();
        bytes.push(0xFF); // trailing byte the header didn't declare
        assert!(L2capFrame::parse_complete(&bytes).is_err());
    }
}
