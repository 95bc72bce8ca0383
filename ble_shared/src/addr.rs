//! `BD_ADDR` and address-type primitives shared across the HCI, management,
//! L2CAP and host layers, plus the short-UUID to Bluetooth-Base-UUID
//! expansion used by GATT service/characteristic/descriptor lookups.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("invalid BD_ADDR string: {0}")]
    InvalidFormat(String),
}

/// A 48-bit Bluetooth device address, stored network byte order reversed
/// (least-significant octet first) to match the wire/HCI representation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address([u8; 6]);

impl Address {
    pub const ZERO: Address = Address([0; 6]);

    /// Builds an address from six octets already in HCI (little-endian) order.
    pub const fn from_hci_bytes(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub const fn to_hci_bytes(self) -> [u8; 6] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[5], b[4], b[3], b[2], b[1], b[0]
        )
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(AddressParseError::InvalidFormat(s.to_string()));
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            bytes[5 - i] = u8::from_str_radix(part, 16)
                .map_err(|_| AddressParseError::InvalidFormat(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl From<macaddr::MacAddr6> for Address {
    fn from(mac: macaddr::MacAddr6) -> Self {
        let b = mac.into_array();
        Self([b[5], b[4], b[3], b[2], b[1], b[0]])
    }
}

impl From<Address> for macaddr::MacAddr6 {
    fn from(addr: Address) -> Self {
        let b = addr.0;
        macaddr::MacAddr6::new(b[5], b[4], b[3], b[2], b[1], b[0])
    }
}

/// Device address type, as carried on LE advertising reports and connection
/// complete events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum AddressType {
    Public,
    RandomStatic,
    RandomNonResolvable,
    RandomResolvable,
}

impl AddressType {
    /// Maps the single-bit HCI own/peer address type field (0 = public,
    /// 1 = random) to this four-way type, given the two top bits of the
    /// random address itself when `raw == 1`.
    pub fn from_hci_field(raw: u8, random_addr_top_bits: Option<u8>) -> Self {
        if raw == 0 {
            return AddressType::Public;
        }
        match random_addr_top_bits {
            Some(0b11) => AddressType::RandomStatic,
            Some(0b00) => AddressType::RandomNonResolvable,
            Some(0b01) => AddressType::RandomResolvable,
            _ => AddressType::RandomStatic,
        }
    }
}

const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805F9B34FB;
const BASE_MASK_32: u128 = 0xFFFF_FFFF_0000_0000_0000_0000_0000_0000;
const BASE_MASK_16: u128 = 0x0000_FFFF_0000_0000_0000_0000_0000_0000;

/// Expands/narrows short-form Bluetooth UUIDs against the Bluetooth Base
/// UUID (`00000000-0000-1000-8000-00805F9B34FB`).
pub trait UuidExt: Sized {
    fn from_u16(short: u16) -> Self;
    fn from_u32(short: u32) -> Self;
    /// Narrows to a 16-bit short form if this UUID is within the base range
    /// and its low 96 bits match the base exactly.
    fn short_form_u16(&self) -> Option<u16>;
    fn short_form_u32(&self) -> Option<u32>;
}

impl UuidExt for Uuid {
    fn from_u16(short: u16) -> Self {
        Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
    }

    fn from_u32(short: u32) -> Self {
        Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
    }

    fn short_form_u16(&self) -> Option<u16> {
        let v = self.as_u128();
        if v & !BASE_MASK_16 == BASE_UUID {
            Some(((v & BASE_MASK_16) >> 96) as u16)
        } else {
            None
        }
    }

    fn short_form_u32(&self) -> Option<u32> {
        let v = self.as_u128();
        if v & !BASE_MASK_32 == BASE_UUID {
            Some(((v & BASE_MASK_32) >> 96) as u32)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips_through_display_and_from_str() {
        let addr: Address = "1A:2B:3C:4D:5E:6F".parse().unwrap();
        assert_eq!(addr.to_string(), "1A:2B:3C:4D:5E:6F");
    }

    #[test]
    fn address_rejects_malformed_strings() {
        assert!("not-an-address".parse::<Address>().is_err());
        assert!("1A:2B:3C".parse::<Address>().is_err());
    }

    #[test]
    fn uuid_short_form_expands_and_narrows() {
        let battery_level = Uuid::from_u16(0x2A19);
        assert_eq!(battery_level.short_form_u16(), Some(0x2A19));
        assert_eq!(
            battery_level.to_string(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn uuid_without_base_suffix_has_no_short_form() {
        let custom = Uuid::parse_str("12345678-1234-5678-1234-56789abcdef0").unwrap();
        assert_eq!(custom.short_form_u16(), None);
        assert_eq!(custom.short_form_u32(), None);
    }
}
