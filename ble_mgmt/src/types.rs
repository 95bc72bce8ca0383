//! Typed payloads for the management operations this stack drives, plus
//! their wire encodings.

use ble_octets::Writer;
use ble_shared::{Address, AddressType};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum SecureConnectionsMode {
    Disabled,
    Enabled,
    Only,
}

impl SecureConnectionsMode {
    pub fn as_wire_value(self) -> u8 {
        match self {
            Self::Disabled => 0x00,
            Self::Enabled => 0x01,
            Self::Only => 0x02,
        }
    }
}

/// Governs whether and how the controller auto-connects to a whitelisted
/// device once it is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum AutoConnectPolicy {
    /// Added for discovery/allow-list purposes only; no auto-connect.
    Disabled,
    /// Connect directly once in range.
    Direct,
    /// Report the device via discovery but let the host decide.
    Report,
    /// Always attempt to reconnect on disconnection.
    Always,
}

impl AutoConnectPolicy {
    pub fn as_wire_value(self) -> u8 {
        match self {
            Self::Disabled => 0x00,
            Self::Direct => 0x01,
            Self::Report => 0x02,
            Self::Always => 0x03,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultConnParams {
    pub min_interval: u16,
    pub max_interval: u16,
    pub latency: u16,
    pub supervision_timeout: u16,
}

impl DefaultConnParams {
    pub(crate) fn to_params(self) -> Vec<u8> {
        let mut w = Writer::with_capacity(8);
        w.put_u16_le(self.min_interval)
            .put_u16_le(self.max_interval)
            .put_u16_le(self.latency)
            .put_u16_le(self.supervision_timeout);
        w.into_vec()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongTermKey {
    pub address: Address,
    pub address_type: AddressType,
    pub authenticated: bool,
    pub master: bool,
    pub encryption_size: u8,
    pub encrypted_diversifier: u16,
    pub random_number: u64,
    pub value: [u8; 16],
}

impl LongTermKey {
    pub(crate) fn write_into(self, w: &mut Writer) {
        w.put_address(self.address)
            .put_u8(address_type_wire(self.address_type))
            .put_u8(self.authenticated as u8)
            .put_u8(self.master as u8)
            .put_u8(self.encryption_size)
            .put_u16_le(self.encrypted_diversifier)
            .put_u64_le(self.random_number)
            .put_bytes(&self.value);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityResolvingKey {
    pub address: Address,
    pub address_type: AddressType,
    pub value: [u8; 16],
}

impl IdentityResolvingKey {
    pub(crate) fn write_into(self, w: &mut Writer) {
        w.put_address(self.address)
            .put_u8(address_type_wire(self.address_type))
            .put_bytes(&self.value);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkKey {
    pub address: Address,
    pub address_type: AddressType,
    pub key_type: u8,
    pub value: [u8; 16],
    pub pin_length: u8,
}

impl LinkKey {
    pub(crate) fn write_into(self, w: &mut Writer) {
        w.put_address(self.address)
            .put_u8(address_type_wire(self.address_type))
            .put_u8(self.key_type)
            .put_bytes(&self.value)
            .put_u8(self.pin_length);
    }
}

fn address_type_wire(t: AddressType) -> u8 {
    match t {
        AddressType::Public => 0x00,
        AddressType::RandomStatic => 0x01,
        AddressType::RandomNonResolvable => 0x02,
        AddressType::RandomResolvable => 0x03,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_conn_params_encode_four_u16_fields() {
        let params = DefaultConnParams {
            min_interval: 0x0006,
            max_interval: 0x000C,
            latency: 0,
            supervision_timeout: 0x01F4,
        };
        assert_eq!(params.to_params().len(), 8);
    }

    #[test]
    fn long_term_key_writes_fixed_layout() {
        let ltk = LongTermKey {
            address: Address::ZERO,
            address_type: AddressType::RandomStatic,
            authenticated: true,
            master: false,
            encryption_size: 16,
            encrypted_diversifier: 0,
            random_number: 0,
            value: [0xAA; 16],
        };
        let mut w = Writer::new();
        ltk.write_into(&mut w);
        // addr(6) + type(1) + authenticated(1) + master(1) + enc_size(1) + ediv(2) + rand(8) + ltk(16)
        assert_eq!(w.len(), 36);
    }
}
