//! SMP PDU codes and payloads exchanged on the fixed SMP CID (0x0006), per
//! Bluetooth Core Vol 3 Part H §3.

use ble_octets::{ReadError, Reader, Writer};
use ble_shared::Address;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduError {
    #[error("truncated smp pdu: {0}")]
    Truncated(#[from] ReadError),
    #[error("unknown smp opcode {0:#04x}")]
    UnknownOpcode(u8),
}

pub const CODE_PAIRING_REQUEST: u8 = 0x01;
pub const CODE_PAIRING_RESPONSE: u8 = 0x02;
pub const CODE_PAIRING_CONFIRM: u8 = 0x03;
pub const CODE_PAIRING_RANDOM: u8 = 0x04;
pub const CODE_PAIRING_FAILED: u8 = 0x05;
pub const CODE_ENCRYPTION_INFORMATION: u8 = 0x06;
pub const CODE_MASTER_IDENTIFICATION: u8 = 0x07;
pub const CODE_IDENTITY_INFORMATION: u8 = 0x08;
pub const CODE_IDENTITY_ADDRESS_INFORMATION: u8 = 0x09;
pub const CODE_SIGNING_INFORMATION: u8 = 0x0A;
pub const CODE_SECURITY_REQUEST: u8 = 0x0B;
pub const CODE_PAIRING_PUBLIC_KEY: u8 = 0x0C;
pub const CODE_PAIRING_DH_KEY_CHECK: u8 = 0x0D;
pub const CODE_PAIRING_KEYPRESS_NOTIFICATION: u8 = 0x0E;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingFeatures {
    pub io_capability: u8,
    pub oob_data_flag: u8,
    pub auth_req: u8,
    pub max_encryption_key_size: u8,
    pub initiator_key_distribution: u8,
    pub responder_key_distribution: u8,
}

impl PairingFeatures {
    fn write_into(self, w: &mut Writer) {
        w.put_u8(self.io_capability)
            .put_u8(self.oob_data_flag)
            .put_u8(self.auth_req)
            .put_u8(self.max_encryption_key_size)
            .put_u8(self.initiator_key_distribution)
            .put_u8(self.responder_key_distribution);
    }

    fn parse(r: &mut Reader) -> Result<Self, PduError> {
        Ok(Self {
            io_capability: r.get_u8()?,
            oob_data_flag: r.get_u8()?,
            auth_req: r.get_u8()?,
            max_encryption_key_size: r.get_u8()?,
            initiator_key_distribution: r.get_u8()?,
            responder_key_distribution: r.get_u8()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityAddress {
    pub address_type: u8,
    pub address: Address,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SmpPdu {
    PairingRequest(PairingFeatures),
    PairingResponse(PairingFeatures),
    PairingConfirm([u8; 16]),
    PairingRandom([u8; 16]),
    PairingFailed(u8),
    EncryptionInformation([u8; 16]),
    MasterIdentification { ediv: u16, rand: u64 },
    IdentityInformation([u8; 16]),
    IdentityAddressInformation(IdentityAddress),
    SigningInformation([u8; 16]),
    SecurityRequest(u8),
    PairingPublicKey { x: [u8; 32], y: [u8; 32] },
    PairingDhKeyCheck([u8; 16]),
    PairingKeypressNotification(u8),
}

impl SmpPdu {
    pub fn code(&self) -> u8 {
        match self {
            Self::PairingRequest(_) => CODE_PAIRING_REQUEST,
            Self::PairingResponse(_) => CODE_PAIRING_RESPONSE,
            Self::PairingConfirm(_) => CODE_PAIRING_CONFIRM,
            Self::PairingRandom(_) => CODE_PAIRING_RANDOM,
            Self::PairingFailed(_) => CODE_PAIRING_FAILED,
            Self::EncryptionInformation(_) => CODE_ENCRYPTION_INFORMATION,
            Self::MasterIdentification { .. } => CODE_MASTER_IDENTIFICATION,
            Self::IdentityInformation(_) => CODE_IDENTITY_INFORMATION,
            Self::IdentityAddressInformation(_) => CODE_IDENTITY_ADDRESS_INFORMATION,
            Self::SigningInformation(_) => CODE_SIGNING_INFORMATION,
            Self::SecurityRequest(_) => CODE_SECURITY_REQUEST,
            Self::PairingPublicKey { .. } => CODE_PAIRING_PUBLIC_KEY,
            Self::PairingDhKeyCheck(_) => CODE_PAIRING_DH_KEY_CHECK,
            Self::PairingKeypressNotification(_) => CODE_PAIRING_KEYPRESS_NOTIFICATION,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(17);
        w.put_u8(self.code());
        match self {
            Self::PairingRequest(f) | Self::PairingResponse(f) => f.write_into(&mut w),
            Self::PairingConfirm(v) | Self::PairingRandom(v) => {
                w.put_bytes(v);
            }
            Self::PairingFailed(reason) => {
                w.put_u8(*reason);
            }
            Self::EncryptionInformation(ltk) => {
                w.put_bytes(ltk);
            }
            Self::MasterIdentification { ediv, rand } => {
                w.put_u16_le(*ediv).put_u64_le(*rand);
            }
            Self::IdentityInformation(irk) => {
                w.put_bytes(irk);
            }
            Self::IdentityAddressInformation(id) => {
                w.put_u8(id.address_type);
                w.put_address(id.address);
            }
            Self::SigningInformation(csrk) => {
                w.put_bytes(csrk);
            }
            Self::SecurityRequest(auth_req) => {
                w.put_u8(*auth_req);
            }
            Self::PairingPublicKey { x, y } => {
                w.put_bytes(x);
                w.put_bytes(y);
            }
            Self::PairingDhKeyCheck(check) => {
                w.put_bytes(check);
            }
            Self::PairingKeypressNotification(kind) => {
                w.put_u8(*kind);
            }
        }
        w.into_vec()
    }

    pub fn parse(buf: &[u8]) -> Result<Self, PduError> {
        let mut r = Reader::new(buf);
        let code = r.get_u8()?;
        Ok(match code {
            CODE_PAIRING_REQUEST => Self::PairingRequest(PairingFeatures::parse(&mut r)?),
            CODE_PAIRING_RESPONSE => Self::PairingResponse(PairingFeatures::parse(&mut r)?),
            CODE_PAIRING_CONFIRM => Self::PairingConfirm(read_16(&mut r)?),
            CODE_PAIRING_RANDOM => Self::PairingRandom(read_16(&mut r)?),
            CODE_PAIRING_FAILED => Self::PairingFailed(r.get_u8()?),
            CODE_ENCRYPTION_INFORMATION => Self::EncryptionInformation(read_16(&mut r)?),
            CODE_MASTER_IDENTIFICATION => Self::MasterIdentification {
                ediv: r.get_u16_le()?,
                rand: r.get_u64_le()?,
            },
            CODE_IDENTITY_INFORMATION => Self::IdentityInformation(read_16(&mut r)?),
            CODE_IDENTITY_ADDRESS_INFORMATION => Self::IdentityAddressInformation(IdentityAddress {
                address_type: r.get_u8()?,
                address: r.get_address()?,
            }),
            CODE_SIGNING_INFORMATION => Self::SigningInformation(read_16(&mut r)?),
            CODE_SECURITY_REQUEST => Self::SecurityRequest(r.get_u8()?),
            CODE_PAIRING_PUBLIC_KEY => Self::PairingPublicKey {
                x: read_32(&mut r)?,
                y: read_32(&mut r)?,
            },
            CODE_PAIRING_DH_KEY_CHECK => Self::PairingDhKeyCheck(read_16(&mut r)?),
            CODE_PAIRING_KEYPRESS_NOTIFICATION => Self::PairingKeypressNotification(r.get_u8()?),
            other => return Err(PduError::UnknownOpcode(other)),
        })
    }
}

fn read_16(r: &mut Reader) -> Result<[u8; 16], PduError> {
    let mut out = [0u8; 16];
    out.copy_from_slice(r.get_bytes(16)?);
    Ok(out)
}

fn read_32(r: &mut Reader) -> Result<[u8; 32], PduError> {
    let mut out = [0u8; 32];
    out.copy_from_slice(r.get_bytes(32)?);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_request_round_trips() {
        let pdu = SmpPdu::PairingRequest(PairingFeatures {
            io_capability: 0x04,
            oob_data_flag: 0x00,
            auth_req: 0x0D,
            max_encryption_key_size: 16,
            initiator_key_distribution: 0x0F,
            responder_key_distribution: 0x0F,
        });
        let bytes = pdu.to_bytes();
        assert_eq!(bytes.len(), 7);
        match SmpPdu::parse(&bytes).unwrap() {
            SmpPdu::PairingRequest(f) => assert_eq!(f.io_capability, 0x04),
            _ => panic!("expected PairingRequest"),
        }
    }

    #[test]
    fn pairing_public_key_round_trips_64_bytes() {
        let pdu = SmpPdu::PairingPublicKey { x: [0x11; 32], y: [0x22; 32] };
        let bytes = pdu.to_bytes();
        assert_eq!(bytes.len(), 65);
        match SmpPdu::parse(&bytes).unwrap() {
            SmpPdu::PairingPublicKey { x, y } => {
                assert_eq!(x, [0x11; 32]);
                assert_eq!(y, [0x22; 32]);
            }
            _ => panic!("expected PairingPublicKey"),
        }
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert_eq!(SmpPdu::parse(&[0xFF]), Err(PduError::UnknownOpcode(0xFF)));
    }
}
