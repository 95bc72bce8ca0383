//! ATT PDU codec, Bluetooth Core Vol 3 Part F §3.3/§3.4. Every PDU travels
//! as one L2CAP SDU on the fixed ATT CID (0x0004); `ble_l2cap::L2capChannel`
//! already reassembles multi-fragment ACL traffic into that SDU, so this
//! layer only deals in whole PDUs.

use ble_octets::{ReadError, Reader, Writer};
use ble_shared::UuidExt;
use thiserror::Error;
use uuid::Uuid;

pub mod opcode {
    pub const ERROR_RSP: u8 = 0x01;
    pub const EXCHANGE_MTU_REQ: u8 = 0x02;
    pub const EXCHANGE_MTU_RSP: u8 = 0x03;
    pub const FIND_INFORMATION_REQ: u8 = 0x04;
    pub const FIND_INFORMATION_RSP: u8 = 0x05;
    pub const FIND_BY_TYPE_VALUE_REQ: u8 = 0x06;
    pub const FIND_BY_TYPE_VALUE_RSP: u8 = 0x07;
    pub const READ_BY_TYPE_REQ: u8 = 0x08;
    pub const READ_BY_TYPE_RSP: u8 = 0x09;
    pub const READ_REQ: u8 = 0x0A;
    pub const READ_RSP: u8 = 0x0B;
    pub const READ_BLOB_REQ: u8 = 0x0C;
    pub const READ_BLOB_RSP: u8 = 0x0D;
    pub const READ_BY_GROUP_TYPE_REQ: u8 = 0x10;
    pub const READ_BY_GROUP_TYPE_RSP: u8 = 0x11;
    pub const WRITE_REQ: u8 = 0x12;
    pub const WRITE_RSP: u8 = 0x13;
    pub const WRITE_CMD: u8 = 0x52;
    pub const HANDLE_VALUE_NTF: u8 = 0x1B;
    pub const HANDLE_VALUE_IND: u8 = 0x1D;
    pub const HANDLE_VALUE_CNF: u8 = 0x1E;
}

/// Error codes, Core Vol 3 Part F §3.4.1.1.
pub mod error_code {
    pub const INVALID_HANDLE: u8 = 0x01;
    pub const READ_NOT_PERMITTED: u8 = 0x02;
    pub const WRITE_NOT_PERMITTED: u8 = 0x03;
    pub const INVALID_PDU: u8 = 0x04;
    pub const INSUFFICIENT_AUTHENTICATION: u8 = 0x05;
    pub const REQUEST_NOT_SUPPORTED: u8 = 0x06;
    pub const INVALID_OFFSET: u8 = 0x07;
    pub const INSUFFICIENT_AUTHORIZATION: u8 = 0x08;
    pub const PREPARE_QUEUE_FULL: u8 = 0x09;
    pub const ATTRIBUTE_NOT_FOUND: u8 = 0x0A;
    pub const ATTRIBUTE_NOT_LONG: u8 = 0x0B;
    pub const INSUFFICIENT_ENCRYPTION_KEY_SIZE: u8 = 0x0C;
    pub const INVALID_ATTRIBUTE_VALUE_LENGTH: u8 = 0x0D;
    pub const UNLIKELY_ERROR: u8 = 0x0E;
    pub const INSUFFICIENT_ENCRYPTION: u8 = 0x0F;
    pub const UNSUPPORTED_GROUP_TYPE: u8 = 0x10;
    pub const INSUFFICIENT_RESOURCES: u8 = 0x11;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttPduError {
    #[error("truncated att pdu: {0}")]
    Truncated(#[from] ReadError),
    #[error("unknown att opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("att attribute data list has inconsistent element length")]
    InconsistentListLength,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InformationData {
    pub handle: u16,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeAttrData {
    pub handle: u16,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupAttrData {
    pub handle: u16,
    pub end_group_handle: u16,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttPdu {
    ErrorRsp {
        request_opcode: u8,
        handle: u16,
        error_code: u8,
    },
    ExchangeMtuReq {
        mtu: u16,
    },
    ExchangeMtuRsp {
        mtu: u16,
    },
    FindInformationReq {
        start_handle: u16,
        end_handle: u16,
    },
    FindInformationRsp {
        data: Vec<InformationData>,
    },
    FindByTypeValueReq {
        start_handle: u16,
        end_handle: u16,
        attribute_type: u16,
        attribute_value: Vec<u8>,
    },
    FindByTypeValueRsp {
        handles: Vec<(u16, u16)>,
    },
    ReadByTypeReq {
        start_handle: u16,
        end_handle: u16,
        attribute_type: Uuid,
    },
    ReadByTypeRsp {
        data: Vec<TypeAttrData>,
    },
    ReadReq {
        handle: u16,
    },
    ReadRsp {
        value: Vec<u8>,
    },
    ReadBlobReq {
        handle: u16,
        offset: u16,
    },
    ReadBlobRsp {
        value: Vec<u8>,
    },
    ReadByGroupTypeReq {
        start_handle: u16,
        end_handle: u16,
        group_type: Uuid,
    },
    ReadByGroupTypeRsp {
        data: Vec<GroupAttrData>,
    },
    WriteReq {
        handle: u16,
        value: Vec<u8>,
    },
    WriteRsp,
    WriteCmd {
        handle: u16,
        value: Vec<u8>,
    },
    HandleValueNtf {
        handle: u16,
        value: Vec<u8>,
    },
    HandleValueInd {
        handle: u16,
        value: Vec<u8>,
    },
    HandleValueCnf,
}

impl AttPdu {
    pub fn opcode(&self) -> u8 {
        use opcode::*;
        match self {
            Self::ErrorRsp { .. } => ERROR_RSP,
            Self::ExchangeMtuReq { .. } => EXCHANGE_MTU_REQ,
            Self::ExchangeMtuRsp { .. } => EXCHANGE_MTU_RSP,
            Self::FindInformationReq { .. } => FIND_INFORMATION_REQ,
            Self::FindInformationRsp { .. } => FIND_INFORMATION_RSP,
            Self::FindByTypeValueReq { .. } => FIND_BY_TYPE_VALUE_REQ,
            Self::FindByTypeValueRsp { .. } => FIND_BY_TYPE_VALUE_RSP,
            Self::ReadByTypeReq { .. } => READ_BY_TYPE_REQ,
            Self::ReadByTypeRsp { .. } => READ_BY_TYPE_RSP,
            Self::ReadReq { .. } => READ_REQ,
            Self::ReadRsp { .. } => READ_RSP,
            Self::ReadBlobReq { .. } => READ_BLOB_REQ,
            Self::ReadBlobRsp { .. } => READ_BLOB_RSP,
            Self::ReadByGroupTypeReq { .. } => READ_BY_GROUP_TYPE_REQ,
            Self::ReadByGroupTypeRsp { .. } => READ_BY_GROUP_TYPE_RSP,
            Self::WriteReq { .. } => WRITE_REQ,
            Self::WriteRsp => WRITE_RSP,
            Self::WriteCmd { .. } => WRITE_CMD,
            Self::HandleValueNtf { .. } => HANDLE_VALUE_NTF,
            Self::HandleValueInd { .. } => HANDLE_VALUE_IND,
            Self::HandleValueCnf => HANDLE_VALUE_CNF,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(23);
        w.put_u8(self.opcode());
        match self {
            Self::ErrorRsp { request_opcode, handle, error_code } => {
                w.put_u8(*request_opcode).put_u16_le(*handle).put_u8(*error_code);
            }
            Self::ExchangeMtuReq { mtu } | Self::ExchangeMtuRsp { mtu } => {
                w.put_u16_le(*mtu);
            }
            Self::FindInformationReq { start_handle, end_handle } => {
                w.put_u16_le(*start_handle).put_u16_le(*end_handle);
            }
            Self::FindInformationRsp { data } => {
                write_information_data(&mut w, data);
            }
            Self::FindByTypeValueReq { start_handle, end_handle, attribute_type, attribute_value } => {
                w.put_u16_le(*start_handle).put_u16_le(*end_handle).put_u16_le(*attribute_type);
                w.put_bytes(attribute_value);
            }
            Self::FindByTypeValueRsp { handles } => {
                for (found, group_end) in handles {
                    w.put_u16_le(*found).put_u16_le(*group_end);
                }
            }
            Self::ReadByTypeReq { start_handle, end_handle, attribute_type } => {
                w.put_u16_le(*start_handle).put_u16_le(*end_handle);
                w.put_uuid_compact(attribute_type);
            }
            Self::ReadByTypeRsp { data } => {
                write_length_prefixed_list(&mut w, data.iter().map(|d| {
                    let mut item = Vec::with_capacity(2 + d.value.len());
                    item.extend_from_slice(&d.handle.to_le_bytes());
                    item.extend_from_slice(&d.value);
                    item
                }));
            }
            Self::ReadReq { handle } => {
                w.put_u16_le(*handle);
            }
            Self::ReadRsp { value } => {
                w.put_bytes(value);
            }
            Self::ReadBlobReq { handle, offset } => {
                w.put_u16_le(*handle).put_u16_le(*offset);
            }
            Self::ReadBlobRsp { value } => {
                w.put_bytes(value);
            }
            Self::ReadByGroupTypeReq { start_handle, end_handle, group_type } => {
                w.put_u16_le(*start_handle).put_u16_le(*end_handle);
                w.put_uuid_compact(group_type);
            }
            Self::ReadByGroupTypeRsp { data } => {
                write_length_prefixed_list(&mut w, data.iter().map(|d| {
                    let mut item = Vec::with_capacity(4 + d.value.len());
                    item.extend_from_slice(&d.handle.to_le_bytes());
                    item.extend_from_slice(&d.end_group_handle.to_le_bytes());
                    item.extend_from_slice(&d.value);
                    item
                }));
            }
            Self::WriteReq { handle, value } | Self::WriteCmd { handle, value } => {
                w.put_u16_le(*handle);
                w.put_bytes(value);
            }
            Self::WriteRsp => {}
            Self::HandleValueNtf { handle, value } | Self::HandleValueInd { handle, value } => {
                w.put_u16_le(*handle);
                w.put_bytes(value);
            }
            Self::HandleValueCnf => {}
        }
        w.into_vec()
    }

    pub fn parse(buf: &[u8]) -> Result<Self, AttPduError> {
        let mut r = Reader::new(buf);
        let op = r.get_u8()?;
        Ok(match op {
            opcode::ERROR_RSP => Self::ErrorRsp {
                request_opcode: r.get_u8()?,
                handle: r.get_u16_le()?,
                error_code: r.get_u8()?,
            },
            opcode::EXCHANGE_MTU_REQ => Self::ExchangeMtuReq { mtu: r.get_u16_le()? },
            opcode::EXCHANGE_MTU_RSP => Self::ExchangeMtuRsp { mtu: r.get_u16_le()? },
            opcode::FIND_INFORMATION_REQ => Self::FindInformationReq {
                start_handle: r.get_u16_le()?,
                end_handle: r.get_u16_le()?,
            },
            opcode::FIND_INFORMATION_RSP => Self::FindInformationRsp { data: read_information_data(&mut r)? },
            opcode::FIND_BY_TYPE_VALUE_REQ => {
                let start_handle = r.get_u16_le()?;
                let end_handle = r.get_u16_le()?;
                let attribute_type = r.get_u16_le()?;
                let attribute_value = r.remaining_slice().to_vec();
                Self::FindByTypeValueReq { start_handle, end_handle, attribute_type, attribute_value }
            }
            opcode::FIND_BY_TYPE_VALUE_RSP => {
                let mut handles = Vec::new();
                while !r.is_empty() {
                    handles.push((r.get_u16_le()?, r.get_u16_le()?));
                }
                Self::FindByTypeValueRsp { handles }
            }
            opcode::READ_BY_TYPE_REQ => {
                let start_handle = r.get_u16_le()?;
                let end_handle = r.get_u16_le()?;
                let attribute_type = r.get_uuid_sized(r.remaining())?;
                Self::ReadByTypeReq { start_handle, end_handle, attribute_type }
            }
            opcode::READ_BY_TYPE_RSP => {
                let len = r.get_u8()? as usize;
                let mut data = Vec::new();
                while !r.is_empty() {
                    let handle = r.get_u16_le()?;
                    let value = r.get_bytes(len.saturating_sub(2))?.to_vec();
                    data.push(TypeAttrData { handle, value });
                }
                Self::ReadByTypeRsp { data }
            }
            opcode::READ_REQ => Self::ReadReq { handle: r.get_u16_le()? },
            opcode::READ_RSP => Self::ReadRsp { value: r.remaining_slice().to_vec() },
            opcode::READ_BLOB_REQ => Self::ReadBlobReq {
                handle: r.get_u16_le()?,
                offset: r.get_u16_le()?,
            },
            opcode::READ_BLOB_RSP => Self::ReadBlobRsp { value: r.remaining_slice().to_vec() },
            opcode::READ_BY_GROUP_TYPE_REQ => {
                let start_handle = r.get_u16_le()?;
                let end_handle = r.get_u16_le()?;
                let group_type = r.get_uuid_sized(r.remaining())?;
                Self::ReadByGroupTypeReq { start_handle, end_handle, group_type }
            }
            opcode::READ_BY_GROUP_TYPE_RSP => {
                let len = r.get_u8()? as usize;
                let mut data = Vec::new();
                while !r.is_empty() {
                    let handle = r.get_u16_le()?;
                    let end_group_handle = r.get_u16_le()?;
                    let value = r.get_bytes(len.saturating_sub(4))?.to_vec();
                    data.push(GroupAttrData { handle, end_group_handle, value });
                }
                Self::ReadByGroupTypeRsp { data }
            }
            opcode::WRITE_REQ => Self::WriteReq {
                handle: r.get_u16_le()?,
                value: r.remaining_slice().to_vec(),
            },
            opcode::WRITE_RSP => Self::WriteRsp,
            opcode::WRITE_CMD => Self::WriteCmd {
                handle: r.get_u16_le()?,
                value: r.remaining_slice().to_vec(),
            },
            opcode::HANDLE_VALUE_NTF => Self::HandleValueNtf {
                handle: r.get_u16_le()?,
                value: r.remaining_slice().to_vec(),
            },
            opcode::HANDLE_VALUE_IND => Self::HandleValueInd {
                handle: r.get_u16_le()?,
                value: r.remaining_slice().to_vec(),
            },
            opcode::HANDLE_VALUE_CNF => Self::HandleValueCnf,
            other => return Err(AttPduError::UnknownOpcode(other)),
        })
    }
}

fn write_information_data(w: &mut Writer, data: &[InformationData]) {
    let format: u8 = if data.iter().all(|d| d.uuid.short_form_u16().is_some()) { 1 } else { 2 };
    w.put_u8(format);
    for d in data {
        w.put_u16_le(d.handle);
        if format == 1 {
            w.put_uuid16(&d.uuid);
        } else {
            w.put_uuid128(&d.uuid);
        }
    }
}

fn read_information_data(r: &mut Reader) -> Result<Vec<InformationData>, AttPduError> {
    let format = r.get_u8()?;
    let width = if format == 1 { 2 } else { 16 };
    let mut data = Vec::new();
    while !r.is_empty() {
        let handle = r.get_u16_le()?;
        let uuid = r.get_uuid_sized(width)?;
        data.push(InformationData { handle, uuid });
    }
    Ok(data)
}

fn write_length_prefixed_list<I: Iterator<Item = Vec<u8>>>(w: &mut Writer, items: I) {
    let mut items: Vec<Vec<u8>> = items.collect();
    if items.is_empty() {
        return;
    }
    let element_len = items[0].len();
    items.retain(|item| item.len() == element_len);
    w.put_u8(element_len as u8);
    for item in items {
        w.put_bytes(&item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_mtu_round_trips() {
        let pdu = AttPdu::ExchangeMtuReq { mtu: 247 };
        let bytes = pdu.to_bytes();
        assert_eq!(AttPdu::parse(&bytes).unwrap(), pdu);
    }

    #[test]
    fn error_rsp_round_trips() {
        let pdu = AttPdu::ErrorRsp {
            request_opcode: opcode::READ_REQ,
            handle: 0x0012,
            error_code: error_code::INVALID_HANDLE,
        };
        let bytes = pdu.to_bytes();
        assert_eq!(bytes.len(), 5);
        assert_eq!(AttPdu::parse(&bytes).unwrap(), pdu);
    }

    #[test]
    fn read_by_group_type_rsp_round_trips_uniform_length() {
        let pdu = AttPdu::ReadByGroupTypeRsp {
            data: vec![
                GroupAttrData { handle: 1, end_group_handle: 5, value: vec![0x00, 0x18] },
                GroupAttrData { handle: 6, end_group_handle: 10, value: vec![0x01, 0x18] },
            ],
        };
        let bytes = pdu.to_bytes();
        assert_eq!(AttPdu::parse(&bytes).unwrap(), pdu);
    }

    #[test]
    fn find_information_rsp_round_trips_short_uuids() {
        let pdu = AttPdu::FindInformationRsp {
            data: vec![
                InformationData { handle: 3, uuid: Uuid::from_u16(0x2A19) },
                InformationData { handle: 4, uuid: Uuid::from_u16(0x2902) },
            ],
        };
        let bytes = pdu.to_bytes();
        assert_eq!(bytes[1], 1);
        assert_eq!(AttPdu::parse(&bytes).unwrap(), pdu);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert_eq!(AttPdu::parse(&[0xFF]), Err(AttPduError::UnknownOpcode(0xFF)));
    }
}
