//! SMP key-bin persistence: one versioned binary file per (local adapter,
//! remote device) pair, holding the derived key bundle and pairing
//! parameters so a later connection can skip pairing (`PrePaired` mode).
//! Writes go through write-temp-then-rename so a crash never leaves a torn
//! file behind.

use std::fs;
use std::path::{Path, PathBuf};

use ble_octets::{Reader, Writer};
use ble_shared::{Address, AddressType};
use strum::{Display, EnumString};

use crate::error::SmpInternalError;

const MAGIC: [u8; 4] = *b"SMPK";
pub const VERSION: u8 = 5;

const FLAG_VALID: u8 = 0b0000_0001;
const FLAG_SC: u8 = 0b0000_0010;
const FLAG_AUTHENTICATED: u8 = 0b0000_0100;

const RECORD_LTK_INITIATOR: u8 = 0x01;
const RECORD_LTK_RESPONDER: u8 = 0x02;
const RECORD_IRK: u8 = 0x03;
const RECORD_CSRK: u8 = 0x04;
const RECORD_LINK_KEY: u8 = 0x05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum PairingRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum PairingMode {
    None,
    JustWorks,
    PasskeyEntry,
    NumericCompare,
    Oob,
    PrePaired,
}

/// LTK plus the legacy-pairing EDIV/Rand pair the peer needs to look it up
/// (both zero for an SC-derived LTK, per the SC-implies-no-EDIV invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongTermKeyMaterial {
    pub value: [u8; 16],
    pub ediv: u16,
    pub rand: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SmpKeyBundle {
    pub local: Option<(Address, AddressType)>,
    pub remote: Option<(Address, AddressType)>,
    pub security_level: u8,
    pub io_capability: u8,
    pub pairing_role: Option<PairingRole>,
    pub pairing_mode: Option<PairingMode>,
    pub valid: bool,
    pub secure_connections: bool,
    pub authenticated: bool,
    pub ltk_initiator: Option<LongTermKeyMaterial>,
    pub ltk_responder: Option<LongTermKeyMaterial>,
    pub irk: Option<[u8; 16]>,
    pub csrk: Option<[u8; 16]>,
    pub link_key: Option<[u8; 16]>,
}

impl SmpKeyBundle {
    /// Invariant: SC implies no EDIV/Rand on either LTK record.
    pub fn check_sc_invariant(&self) -> bool {
        if !self.secure_connections {
            return true;
        }
        let clean = |k: &Option<LongTermKeyMaterial>| k.map_or(true, |k| k.ediv == 0 && k.rand == 0);
        clean(&self.ltk_initiator) && clean(&self.ltk_responder)
    }

    pub fn encode(&self) -> Vec<u8> {
        let local = self.local.expect("local address set before encoding");
        let remote = self.remote.expect("remote address set before encoding");

        let mut flags = 0u8;
        if self.valid {
            flags |= FLAG_VALID;
        }
        if self.secure_connections {
            flags |= FLAG_SC;
        }
        if self.authenticated {
            flags |= FLAG_AUTHENTICATED;
        }

        let mut w = Writer::with_capacity(128);
        w.put_bytes(&MAGIC);
        w.put_u8(VERSION);
        w.put_u8(flags);
        w.put_u16_le(0); // reserved

        w.put_address(local.0);
        w.put_u8(address_type_wire(local.1));
        w.put_address(remote.0);
        w.put_u8(address_type_wire(remote.1));

        w.put_u8(self.security_level);
        w.put_u8(self.io_capability);
        w.put_u8(self.pairing_role.map_or(0xFF, |r| r as u8));
        w.put_u8(self.pairing_mode.map_or(0xFF, |m| m as u8));

        if let Some(ltk) = self.ltk_initiator {
            write_ltk_record(&mut w, RECORD_LTK_INITIATOR, ltk);
        }
        if let Some(ltk) = self.ltk_responder {
            write_ltk_record(&mut w, RECORD_LTK_RESPONDER, ltk);
        }
        if let Some(irk) = self.irk {
            write_record(&mut w, RECORD_IRK, &irk);
        }
        if let Some(csrk) = self.csrk {
            write_record(&mut w, RECORD_CSRK, &csrk);
        }
        if let Some(link_key) = self.link_key {
            write_record(&mut w, RECORD_LINK_KEY, &link_key);
        }

        let body = w.into_vec();
        let crc = crc32fast::hash(&body);
        let mut out = body;
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, SmpInternalError> {
        if buf.len() < 4 + 4 {
            return Err(SmpInternalError::KeyBinCorrupt);
        }
        let (body, crc_bytes) = buf.split_at(buf.len() - 4);
        let expected_crc = u32::from_le_bytes(crc_bytes.try_into().unwrap());
        if crc32fast::hash(body) != expected_crc {
            return Err(SmpInternalError::KeyBinCorrupt);
        }

        let mut r = Reader::new(body);
        let mut magic = [0u8; 4];
        magic.copy_from_slice(r.get_bytes(4).map_err(|_| SmpInternalError::KeyBinCorrupt)?);
        if magic != MAGIC {
            return Err(SmpInternalError::KeyBinCorrupt);
        }
        let version = r.get_u8().map_err(|_| SmpInternalError::KeyBinCorrupt)?;
        if version != VERSION {
            return Err(SmpInternalError::UnsupportedVersion(version));
        }
        let flags = r.get_u8().map_err(|_| SmpInternalError::KeyBinCorrupt)?;
        let _reserved = r.get_u16_le().map_err(|_| SmpInternalError::KeyBinCorrupt)?;

        let local_addr = r.get_address().map_err(|_| SmpInternalError::KeyBinCorrupt)?;
        let local_type = address_type_from_wire(r.get_u8().map_err(|_| SmpInternalError::KeyBinCorrupt)?);
        let remote_addr = r.get_address().map_err(|_| SmpInternalError::KeyBinCorrupt)?;
        let remote_type = address_type_from_wire(r.get_u8().map_err(|_| SmpInternalError::KeyBinCorrupt)?);

        let security_level = r.get_u8().map_err(|_| SmpInternalError::KeyBinCorrupt)?;
        let io_capability = r.get_u8().map_err(|_| SmpInternalError::KeyBinCorrupt)?;
        let pairing_role = pairing_role_from_wire(r.get_u8().map_err(|_| SmpInternalError::KeyBinCorrupt)?);
        let pairing_mode = pairing_mode_from_wire(r.get_u8().map_err(|_| SmpInternalError::KeyBinCorrupt)?);

        let mut bundle = Self {
            local: Some((local_addr, local_type)),
            remote: Some((remote_addr, remote_type)),
            security_level,
            io_capability,
            pairing_role,
            pairing_mode,
            valid: flags & FLAG_VALID != 0,
            secure_connections: flags & FLAG_SC != 0,
            authenticated: flags & FLAG_AUTHENTICATED != 0,
            ..Default::default()
        };

        while !r.is_empty() {
            let record_type = r.get_u8().map_err(|_| SmpInternalError::KeyBinCorrupt)?;
            let len = r.get_u16_le().map_err(|_| SmpInternalError::KeyBinCorrupt)?;
            let data = r.get_bytes(len as usize).map_err(|_| SmpInternalError::KeyBinCorrupt)?;
            match record_type {
                RECORD_LTK_INITIATOR => bundle.ltk_initiator = Some(parse_ltk_record(data)?),
                RECORD_LTK_RESPONDER => bundle.ltk_responder = Some(parse_ltk_record(data)?),
                RECORD_IRK => bundle.irk = Some(parse_fixed_16(data)?),
                RECORD_CSRK => bundle.csrk = Some(parse_fixed_16(data)?),
                RECORD_LINK_KEY => bundle.link_key = Some(parse_fixed_16(data)?),
                _ => tracing::debug!("key-bin record type {:#04x} unrecognized, skipping", record_type),
            }
        }

        Ok(bundle)
    }

    /// `<local_addr>_<remote_addr>.key`, colons stripped and uppercased to
    /// stay within FAT32 long-filename limits.
    pub fn file_name(&self) -> String {
        let local = self.local.expect("local address set");
        let remote = self.remote.expect("remote address set");
        format!("{}_{}.key", strip_colons(&local.0.to_string()), strip_colons(&remote.0.to_string()))
    }

    pub fn write_atomic(&self, dir: &Path) -> Result<PathBuf, SmpInternalError> {
        let path = dir.join(self.file_name());
        let tmp_path = dir.join(format!("{}.tmp", self.file_name()));
        fs::write(&tmp_path, self.encode()).map_err(|e| SmpInternalError::KeyBinIo(e.to_string()))?;
        fs::rename(&tmp_path, &path).map_err(|e| SmpInternalError::KeyBinIo(e.to_string()))?;
        Ok(path)
    }

    pub fn read(path: &Path) -> Result<Self, SmpInternalError> {
        let bytes = fs::read(path).map_err(|e| SmpInternalError::KeyBinIo(e.to_string()))?;
        Self::decode(&bytes)
    }

    pub fn remove(dir: &Path, local: Address, remote: Address) -> Result<(), SmpInternalError> {
        let path = dir.join(format!("{}_{}.key", strip_colons(&local.to_string()), strip_colons(&remote.to_string())));
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SmpInternalError::KeyBinIo(e.to_string())),
        }
    }
}

fn write_record(w: &mut Writer, record_type: u8, value: &[u8; 16]) {
    w.put_u8(record_type);
    w.put_u16_le(16);
    w.put_bytes(value);
}

fn write_ltk_record(w: &mut Writer, record_type: u8, ltk: LongTermKeyMaterial) {
    w.put_u8(record_type);
    w.put_u16_le(26); // value(16) + ediv(2) + rand(8)
    w.put_bytes(&ltk.value);
    w.put_u16_le(ltk.ediv);
    w.put_u64_le(ltk.rand);
}

fn parse_ltk_record(data: &[u8]) -> Result<LongTermKeyMaterial, SmpInternalError> {
    if data.len() != 26 {
        return Err(SmpInternalError::KeyBinCorrupt);
    }
    let mut r = Reader::new(data);
    let mut value = [0u8; 16];
    value.copy_from_slice(r.get_bytes(16).map_err(|_| SmpInternalError::KeyBinCorrupt)?);
    let ediv = r.get_u16_le().map_err(|_| SmpInternalError::KeyBinCorrupt)?;
    let rand = r.get_u64_le().map_err(|_| SmpInternalError::KeyBinCorrupt)?;
    Ok(LongTermKeyMaterial { value, ediv, rand })
}

fn parse_fixed_16(data: &[u8]) -> Result<[u8; 16], SmpInternalError> {
    if data.len() != 16 {
        return Err(SmpInternalError::KeyBinCorrupt);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(data);
    Ok(out)
}

fn address_type_wire(t: AddressType) -> u8 {
    match t {
        AddressType::Public => 0x00,
        AddressType::RandomStatic => 0x01,
        AddressType::RandomNonResolvable => 0x02,
        AddressType::RandomResolvable => 0x03,
    }
}

fn address_type_from_wire(v: u8) -> AddressType {
    match v {
        0x01 => AddressType::RandomStatic,
        0x02 => AddressType::RandomNonResolvable,
        0x03 => AddressType::RandomResolvable,
        _ => AddressType::Public,
    }
}

fn pairing_role_from_wire(v: u8) -> Option<PairingRole> {
    match v {
        0 => Some(PairingRole::Initiator),
        1 => Some(PairingRole::Responder),
        _ => None,
    }
}

fn pairing_mode_from_wire(v: u8) -> Option<PairingMode> {
    match v {
        0 => Some(PairingMode::None),
        1 => Some(PairingMode::JustWorks),
        2 => Some(PairingMode::PasskeyEntry),
        3 => Some(PairingMode::NumericCompare),
        4 => Some(PairingMode::Oob),
        5 => Some(PairingMode::PrePaired),
        _ => None,
    }
}

fn strip_colons(addr: &str) -> String {
    addr.chars().filter(|c| *c != ':').collect::<String>().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bundle() -> SmpKeyBundle {
        SmpKeyBundle {
            local: Some((Address::ZERO, AddressType::Public)),
            remote: Some(("1A:2B:3C:4D:5E:6F".parse().unwrap(), AddressType::RandomStatic)),
            security_level: 3,
            io_capability: 0x01,
            pairing_role: Some(PairingRole::Initiator),
            pairing_mode: Some(PairingMode::NumericCompare),
            valid: true,
            secure_connections: true,
            authenticated: true,
            ltk_initiator: Some(LongTermKeyMaterial {
                value: [0xAA; 16],
                ediv: 0,
                rand: 0,
            }),
            ltk_responder: None,
            irk: Some([0xBB; 16]),
            csrk: None,
            link_key: None,
        }
    }

    #[test]
    fn encode_then_decode_round_trips() {
        let bundle = sample_bundle();
        let bytes = bundle.encode();
        let decoded = SmpKeyBundle::decode(&bytes).unwrap();
        assert_eq!(decoded.security_level, bundle.security_level);
        assert_eq!(decoded.ltk_initiator, bundle.ltk_initiator);
        assert_eq!(decoded.irk, bundle.irk);
        assert!(decoded.check_sc_invariant());
    }

    #[test]
    fn a_flipped_byte_invalidates_the_crc() {
        let bundle = sample_bundle();
        let mut bytes = bundle.encode();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        assert!(matches!(SmpKeyBundle::decode(&bytes), Err(SmpInternalError::KeyBinCorrupt)));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let bundle = sample_bundle();
        let mut bytes = bundle.encode();
        bytes[4] = 4; // version byte
        let crc_start = bytes.len() - 4;
        let fixed_crc = crc32fast::hash(&bytes[..crc_start]);
        bytes[crc_start..].copy_from_slice(&fixed_crc.to_le_bytes());
        assert!(matches!(SmpKeyBundle::decode(&bytes), Err(SmpInternalError::UnsupportedVersion(4))));
    }

    #[test]
    fn file_name_strips_colons_and_uppercases() {
        let bundle = sample_bundle();
        assert!(bundle.file_name().ends_with("1A2B3C4D5E6F.key"));
        assert!(!bundle.file_name().contains(':'));
    }
}
