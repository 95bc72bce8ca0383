//! Zero-copy little-endian reader over an inbound frame. Every `get_*`
//! advances the cursor; slices borrowed via [`Reader::get_bytes`] /
//! [`Reader::remaining`] alias the original buffer rather than copying it —
//! callers that need to retain data past the lifetime of the frame must
//! copy it themselves (see the buffer-ownership rule in `ble_host`'s docs).

use thiserror::Error;
use uuid::Uuid;

use ble_shared::{Address, UuidExt};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    #[error("unexpected end of buffer: needed {needed} bytes, {remaining} remained")]
    UnexpectedEof { needed: usize, remaining: usize },
}

pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn remaining_slice(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn require(&self, n: usize) -> Result<(), ReadError> {
        if self.remaining() < n {
            Err(ReadError::UnexpectedEof {
                needed: n,
                remaining: self.remaining(),
            })
        } else {
            Ok(())
        }
    }

    /// Borrows the next `n` bytes without copying.
    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], ReadError> {
        self.require(n)?;
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, ReadError> {
        Ok(self.get_bytes(1)?[0])
    }

    pub fn get_u16_le(&mut self) -> Result<u16, ReadError> {
        let b = self.get_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn get_u32_le(&mut self) -> Result<u32, ReadError> {
        let b = self.get_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64_le(&mut self) -> Result<u64, ReadError> {
        let b = self.get_bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_i8(&mut self) -> Result<i8, ReadError> {
        Ok(self.get_u8()? as i8)
    }

    /// Reads a 6-octet `BD_ADDR` in HCI (little-endian) order.
    pub fn get_address(&mut self) -> Result<Address, ReadError> {
        let b = self.get_bytes(6)?;
        Ok(Address::from_hci_bytes([b[0], b[1], b[2], b[3], b[4], b[5]]))
    }

    /// Reads a 16-bit UUID and expands it to its 128-bit canonical form.
    pub fn get_uuid16(&mut self) -> Result<Uuid, ReadError> {
        Ok(Uuid::from_u16(self.get_u16_le()?))
    }

    /// Reads a 32-bit UUID and expands it to its 128-bit canonical form.
    pub fn get_uuid32(&mut self) -> Result<Uuid, ReadError> {
        Ok(Uuid::from_u32(self.get_u32_le()?))
    }

    /// Reads a 128-bit UUID, stored little-endian on the wire as ATT/GATT
    /// requires (reverse of the canonical big-endian string form).
    pub fn get_uuid128(&mut self) -> Result<Uuid, ReadError> {
        let b = self.get_bytes(16)?;
        let mut be = [0u8; 16];
        for i in 0..16 {
            be[i] = b[15 - i];
        }
        Ok(Uuid::from_bytes(be))
    }

    /// Reads a UUID whose width (2, 4, or 16 bytes) is known from context,
    /// e.g. an ATT Read By Type response's reported UUID length.
    pub fn get_uuid_sized(&mut self, len: usize) -> Result<Uuid, ReadError> {
        match len {
            2 => self.get_uuid16(),
            4 => self.get_uuid32(),
            16 => self.get_uuid128(),
            _ => {
                self.require(len)?;
                Err(ReadError::UnexpectedEof {
                    needed: 16,
                    remaining: self.remaining(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_little_endian_integers() {
        let buf = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let mut r = Reader::new(&buf);
        assert_eq!(r.get_u8().unwrap(), 0x01);
        assert_eq!(r.get_u16_le().unwrap(), 0x0302);
        assert_eq!(r.get_u32_le().unwrap(), 0x08070605);
    }

    #[test]
    fn eof_reports_shortfall() {
        let buf = [0x01];
        let mut r = Reader::new(&buf);
        let err = r.get_u16_le().unwrap_err();
        assert_eq!(
            err,
            ReadError::UnexpectedEof {
                needed: 2,
                remaining: 1
            }
        );
    }

    #[test]
    fn uuid16_expands_against_base_uuid() {
        let buf = [0x19, 0x2A];
        let mut r = Reader::new(&buf);
        let uuid = r.get_uuid16().unwrap();
        assert_eq!(uuid.to_string(), "00002a19-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn uuid128_is_wire_reversed() {
        let mut buf = [0u8; 16];
        buf[15] = 0x12;
        buf[14] = 0x34;
        let mut r = Reader::new(&buf);
        let uuid = r.get_uuid128().unwrap();
        assert!(uuid.to_string().starts_with("1234"));
    }

    #[test]
    fn get_address_preserves_hci_byte_order() {
        let buf = [0x6F, 0x5E, 0x4D, 0x3C, 0x2B, 0x1A];
        let mut r = Reader::new(&buf);
        let addr = r.get_address().unwrap();
        assert_eq!(addr.to_string(), "1A:2B:3C:4D:5E:6F");
    }
}
