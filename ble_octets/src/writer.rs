//! Little-endian octet writer for outbound HCI/L2CAP/ATT/SMP frames.

use uuid::Uuid;

use ble_shared::{Address, UuidExt};

#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn put_u16_le(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_u32_le(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_u64_le(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn put_address(&mut self, addr: Address) -> &mut Self {
        self.buf.extend_from_slice(&addr.to_hci_bytes());
        self
    }

    /// Writes the short 16-bit form. Caller is responsible for having
    /// checked `uuid.short_form_u16().is_some()` beforehand; this truncates
    /// to the low 16 bits of the short-form field otherwise.
    pub fn put_uuid16(&mut self, uuid: &Uuid) -> &mut Self {
        let short = uuid.short_form_u16().unwrap_or(0);
        self.put_u16_le(short)
    }

    pub fn put_uuid32(&mut self, uuid: &Uuid) -> &mut Self {
        let short = uuid.short_form_u32().unwrap_or(0);
        self.put_u32_le(short)
    }

    /// Writes the full 128-bit UUID, wire-reversed as ATT/GATT requires.
    pub fn put_uuid128(&mut self, uuid: &Uuid) -> &mut Self {
        let be = uuid.as_bytes();
        for i in (0..16).rev() {
            self.buf.push(be[i]);
        }
        self
    }

    /// Writes whichever short form fits, falling back to the full 128-bit
    /// form; returns the byte width actually written (2, 4, or 16).
    pub fn put_uuid_compact(&mut self, uuid: &Uuid) -> usize {
        if let Some(short) = uuid.short_form_u16() {
            self.put_u16_le(short);
            2
        } else if let Some(short) = uuid.short_form_u32() {
            self.put_u32_le(short);
            4
        } else {
            self.put_uuid128(uuid);
            16
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::Reader;

    #[test]
    fn integers_round_trip() {
        let mut w = Writer::new();
        w.put_u8(0xAB).put_u16_le(0x1234).put_u32_le(0xDEADBEEF);
        let bytes = w.into_vec();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.get_u8().unwrap(), 0xAB);
        assert_eq!(r.get_u16_le().unwrap(), 0x1234);
        assert_eq!(r.get_u32_le().unwrap(), 0xDEADBEEF);
    }

    #[test]
    fn uuid_compact_prefers_shortest_form() {
        let battery_level = Uuid::from_u16(0x2A19);
        let mut w = Writer::new();
        let width = w.put_uuid_compact(&battery_level);
        assert_eq!(width, 2);
        let bytes = w.into_vec();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.get_uuid16().unwrap(), battery_level);
    }

    #[test]
    fn uuid128_round_trips_through_wire_order() {
        let custom = Uuid::parse_str("12345678-1234-5678-1234-56789abcdef0").unwrap();
        let mut w = Writer::new();
        w.put_uuid128(&custom);
        let bytes = w.into_vec();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.get_uuid128().unwrap(), custom);
    }

    #[test]
    fn address_round_trips() {
        let addr: Address = "1A:2B:3C:4D:5E:6F".parse().unwrap();
        let mut w = Writer::new();
        w.put_address(addr);
        let bytes = w.into_vec();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.get_address().unwrap(), addr);
    }
}
