// rawble Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! Bit-exact ATT PDU codec (Core Spec Vol 3 Part F).
//!
//! Every PDU the client sends or receives round-trips through [`AttPdu`];
//! the GATT session on top never touches raw opcodes.

use crate::api::bleuuid::WireUuid;
use crate::codec::{ByteReader, CodecError};
use bytes::{BufMut, BytesMut};
use num_derive::FromPrimitive;

pub const ATT_ERROR_RSP: u8 = 0x01;
pub const ATT_EXCHANGE_MTU_REQ: u8 = 0x02;
pub const ATT_EXCHANGE_MTU_RSP: u8 = 0x03;
pub const ATT_FIND_INFORMATION_REQ: u8 = 0x04;
pub const ATT_FIND_INFORMATION_RSP: u8 = 0x05;
pub const ATT_FIND_BY_TYPE_VALUE_REQ: u8 = 0x06;
pub const ATT_FIND_BY_TYPE_VALUE_RSP: u8 = 0x07;
pub const ATT_READ_BY_TYPE_REQ: u8 = 0x08;
pub const ATT_READ_BY_TYPE_RSP: u8 = 0x09;
pub const ATT_READ_REQ: u8 = 0x0a;
pub const ATT_READ_RSP: u8 = 0x0b;
pub const ATT_READ_BLOB_REQ: u8 = 0x0c;
pub const ATT_READ_BLOB_RSP: u8 = 0x0d;
pub const ATT_READ_BY_GROUP_TYPE_REQ: u8 = 0x10;
pub const ATT_READ_BY_GROUP_TYPE_RSP: u8 = 0x11;
pub const ATT_WRITE_REQ: u8 = 0x12;
pub const ATT_WRITE_RSP: u8 = 0x13;
pub const ATT_PREPARE_WRITE_REQ: u8 = 0x16;
pub const ATT_PREPARE_WRITE_RSP: u8 = 0x17;
pub const ATT_EXECUTE_WRITE_REQ: u8 = 0x18;
pub const ATT_EXECUTE_WRITE_RSP: u8 = 0x19;
pub const ATT_HANDLE_VALUE_NTF: u8 = 0x1b;
pub const ATT_HANDLE_VALUE_IND: u8 = 0x1d;
pub const ATT_HANDLE_VALUE_CFM: u8 = 0x1e;
pub const ATT_WRITE_CMD: u8 = 0x52;

/// 16-bit attribute type of the Primary Service declaration.
pub const GATT_PRIMARY_SERVICE_UUID16: u16 = 0x2800;
/// 16-bit attribute type of the Secondary Service declaration.
pub const GATT_SECONDARY_SERVICE_UUID16: u16 = 0x2801;
/// 16-bit attribute type of the Characteristic declaration.
pub const GATT_CHARACTERISTIC_UUID16: u16 = 0x2803;

/// ATT error codes carried in `ERROR_RSP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum AttErrorCode {
    InvalidHandle = 0x01,
    ReadNotPermitted = 0x02,
    WriteNotPermitted = 0x03,
    InvalidPdu = 0x04,
    InsufficientAuthentication = 0x05,
    RequestNotSupported = 0x06,
    InvalidOffset = 0x07,
    InsufficientAuthorization = 0x08,
    PrepareQueueFull = 0x09,
    AttributeNotFound = 0x0a,
    AttributeNotLong = 0x0b,
    InsufficientEncryptionKeySize = 0x0c,
    InvalidAttributeValueLength = 0x0d,
    UnlikelyError = 0x0e,
    InsufficientEncryption = 0x0f,
    UnsupportedGroupType = 0x10,
    InsufficientResources = 0x11,
    /// 0x80..=0x9f, server application defined.
    ApplicationError = 0x80,
}

impl AttErrorCode {
    pub fn from_u8(v: u8) -> AttErrorCode {
        if (0x80..=0x9f).contains(&v) {
            return AttErrorCode::ApplicationError;
        }
        num_traits::FromPrimitive::from_u8(v).unwrap_or(AttErrorCode::UnlikelyError)
    }

    /// Errors that ask for the link security to be raised before a retry.
    pub fn is_security_error(self) -> bool {
        matches!(
            self,
            AttErrorCode::InsufficientAuthentication | AttErrorCode::InsufficientEncryption
        )
    }
}

/// One record of a `READ_BY_GROUP_TYPE_RSP`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub start_handle: u16,
    pub end_handle: u16,
    pub value: Vec<u8>,
}

/// A decoded ATT PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttPdu {
    ErrorRsp {
        request_opcode: u8,
        handle: u16,
        code: AttErrorCode,
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
        /// `(handle, type)` pairs; all entries share one UUID width.
        data: Vec<(u16, WireUuid)>,
    },
    FindByTypeValueReq {
        start_handle: u16,
        end_handle: u16,
        attribute_type: u16,
        value: Vec<u8>,
    },
    FindByTypeValueRsp {
        ranges: Vec<(u16, u16)>,
    },
    ReadByTypeReq {
        start_handle: u16,
        end_handle: u16,
        attribute_type: WireUuid,
    },
    ReadByTypeRsp {
        /// `(handle, value)`; all values share one length.
        records: Vec<(u16, Vec<u8>)>,
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
        group_type: WireUuid,
    },
    ReadByGroupTypeRsp {
        records: Vec<GroupRecord>,
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
    PrepareWriteReq {
        handle: u16,
        offset: u16,
        value: Vec<u8>,
    },
    PrepareWriteRsp {
        handle: u16,
        offset: u16,
        value: Vec<u8>,
    },
    ExecuteWriteReq {
        execute: bool,
    },
    ExecuteWriteRsp,
    HandleValueNtf {
        handle: u16,
        value: Vec<u8>,
    },
    HandleValueInd {
        handle: u16,
        value: Vec<u8>,
    },
    HandleValueCfm,
}

impl AttPdu {
    pub fn opcode(&self) -> u8 {
        match self {
            AttPdu::ErrorRsp { .. } => ATT_ERROR_RSP,
            AttPdu::ExchangeMtuReq { .. } => ATT_EXCHANGE_MTU_REQ,
            AttPdu::ExchangeMtuRsp { .. } => ATT_EXCHANGE_MTU_RSP,
            AttPdu::FindInformationReq { .. } => ATT_FIND_INFORMATION_REQ,
            AttPdu::FindInformationRsp { .. } => ATT_FIND_INFORMATION_RSP,
            AttPdu::FindByTypeValueReq { .. } => ATT_FIND_BY_TYPE_VALUE_REQ,
            AttPdu::FindByTypeValueRsp { .. } => ATT_FIND_BY_TYPE_VALUE_RSP,
            AttPdu::ReadByTypeReq { .. } => ATT_READ_BY_TYPE_REQ,
            AttPdu::ReadByTypeRsp { .. } => ATT_READ_BY_TYPE_RSP,
            AttPdu::ReadReq { .. } => ATT_READ_REQ,
            AttPdu::ReadRsp { .. } => ATT_READ_RSP,
            AttPdu::ReadBlobReq { .. } => ATT_READ_BLOB_REQ,
            AttPdu::ReadBlobRsp { .. } => ATT_READ_BLOB_RSP,
            AttPdu::ReadByGroupTypeReq { .. } => ATT_READ_BY_GROUP_TYPE_REQ,
            AttPdu::ReadByGroupTypeRsp { .. } => ATT_READ_BY_GROUP_TYPE_RSP,
            AttPdu::WriteReq { .. } => ATT_WRITE_REQ,
            AttPdu::WriteRsp => ATT_WRITE_RSP,
            AttPdu::WriteCmd { .. } => ATT_WRITE_CMD,
            AttPdu::PrepareWriteReq { .. } => ATT_PREPARE_WRITE_REQ,
            AttPdu::PrepareWriteRsp { .. } => ATT_PREPARE_WRITE_RSP,
            AttPdu::ExecuteWriteReq { .. } => ATT_EXECUTE_WRITE_REQ,
            AttPdu::ExecuteWriteRsp => ATT_EXECUTE_WRITE_RSP,
            AttPdu::HandleValueNtf { .. } => ATT_HANDLE_VALUE_NTF,
            AttPdu::HandleValueInd { .. } => ATT_HANDLE_VALUE_IND,
            AttPdu::HandleValueCfm => ATT_HANDLE_VALUE_CFM,
        }
    }

    /// True for PDUs that complete the single outstanding request
    /// (responses and `ERROR_RSP`).
    pub fn is_response(&self) -> bool {
        matches!(
            self.opcode(),
            ATT_ERROR_RSP
                | ATT_EXCHANGE_MTU_RSP
                | ATT_FIND_INFORMATION_RSP
                | ATT_FIND_BY_TYPE_VALUE_RSP
                | ATT_READ_BY_TYPE_RSP
                | ATT_READ_RSP
                | ATT_READ_BLOB_RSP
                | ATT_READ_BY_GROUP_TYPE_RSP
                | ATT_WRITE_RSP
                | ATT_PREPARE_WRITE_RSP
                | ATT_EXECUTE_WRITE_RSP
        )
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u8(self.opcode());
        match self {
            AttPdu::ErrorRsp {
                request_opcode,
                handle,
                code,
            } => {
                buf.put_u8(*request_opcode);
                buf.put_u16_le(*handle);
                buf.put_u8(*code as u8);
            }
            AttPdu::ExchangeMtuReq { mtu } | AttPdu::ExchangeMtuRsp { mtu } => {
                buf.put_u16_le(*mtu);
            }
            AttPdu::FindInformationReq {
                start_handle,
                end_handle,
            } => {
                buf.put_u16_le(*start_handle);
                buf.put_u16_le(*end_handle);
            }
            AttPdu::FindInformationRsp { data } => {
                let wide = data
                    .first()
                    .map(|(_, uuid)| uuid.size() == 16)
                    .unwrap_or(false);
                buf.put_u8(if wide { 0x02 } else { 0x01 });
                for (handle, uuid) in data {
                    buf.put_u16_le(*handle);
                    uuid.put(&mut buf);
                }
            }
            AttPdu::FindByTypeValueReq {
                start_handle,
                end_handle,
                attribute_type,
                value,
            } => {
                buf.put_u16_le(*start_handle);
                buf.put_u16_le(*end_handle);
                buf.put_u16_le(*attribute_type);
                buf.put_slice(value);
            }
            AttPdu::FindByTypeValueRsp { ranges } => {
                for (found, end) in ranges {
                    buf.put_u16_le(*found);
                    buf.put_u16_le(*end);
                }
            }
            AttPdu::ReadByTypeReq {
                start_handle,
                end_handle,
                attribute_type,
            } => {
                buf.put_u16_le(*start_handle);
                buf.put_u16_le(*end_handle);
                attribute_type.put(&mut buf);
            }
            AttPdu::ReadByTypeRsp { records } => {
                let value_len = records.first().map(|(_, v)| v.len()).unwrap_or(0);
                buf.put_u8((2 + value_len) as u8);
                for (handle, value) in records {
                    buf.put_u16_le(*handle);
                    buf.put_slice(value);
                }
            }
            AttPdu::ReadReq { handle } => {
                buf.put_u16_le(*handle);
            }
            AttPdu::ReadRsp { value } | AttPdu::ReadBlobRsp { value } => {
                buf.put_slice(value);
            }
            AttPdu::ReadBlobReq { handle, offset } => {
                buf.put_u16_le(*handle);
                buf.put_u16_le(*offset);
            }
            AttPdu::ReadByGroupTypeReq {
                start_handle,
                end_handle,
                group_type,
            } => {
                buf.put_u16_le(*start_handle);
                buf.put_u16_le(*end_handle);
                group_type.put(&mut buf);
            }
            AttPdu::ReadByGroupTypeRsp { records } => {
                let value_len = records.first().map(|r| r.value.len()).unwrap_or(0);
                buf.put_u8((4 + value_len) as u8);
                for record in records {
                    buf.put_u16_le(record.start_handle);
                    buf.put_u16_le(record.end_handle);
                    buf.put_slice(&record.value);
                }
            }
            AttPdu::WriteReq { handle, value } | AttPdu::WriteCmd { handle, value } => {
                buf.put_u16_le(*handle);
                buf.put_slice(value);
            }
            AttPdu::WriteRsp | AttPdu::ExecuteWriteRsp | AttPdu::HandleValueCfm => {}
            AttPdu::PrepareWriteReq {
                handle,
                offset,
                value,
            }
            | AttPdu::PrepareWriteRsp {
                handle,
                offset,
                value,
            } => {
                buf.put_u16_le(*handle);
                buf.put_u16_le(*offset);
                buf.put_slice(value);
            }
            AttPdu::ExecuteWriteReq { execute } => {
                buf.put_u8(*execute as u8);
            }
            AttPdu::HandleValueNtf { handle, value } | AttPdu::HandleValueInd { handle, value } => {
                buf.put_u16_le(*handle);
                buf.put_slice(value);
            }
        }
        buf
    }

    pub fn decode(frame: &[u8]) -> Result<AttPdu, CodecError> {
        let mut r = ByteReader::new(frame);
        let opcode = r.read_u8()?;
        let pdu = match opcode {
            ATT_ERROR_RSP => AttPdu::ErrorRsp {
                request_opcode: r.read_u8()?,
                handle: r.read_u16_le()?,
                code: AttErrorCode::from_u8(r.read_u8()?),
            },
            ATT_EXCHANGE_MTU_REQ => AttPdu::ExchangeMtuReq {
                mtu: r.read_u16_le()?,
            },
            ATT_EXCHANGE_MTU_RSP => AttPdu::ExchangeMtuRsp {
                mtu: r.read_u16_le()?,
            },
            ATT_FIND_INFORMATION_REQ => AttPdu::FindInformationReq {
                start_handle: r.read_u16_le()?,
                end_handle: r.read_u16_le()?,
            },
            ATT_FIND_INFORMATION_RSP => {
                let format = r.read_u8()?;
                let uuid_len = match format {
                    0x01 => 2,
                    0x02 => 16,
                    other => return Err(CodecError::InvalidValue(other as u64)),
                };
                let mut data = Vec::new();
                while r.remaining() >= 2 + uuid_len {
                    let handle = r.read_u16_le()?;
                    data.push((handle, WireUuid::read(&mut r, uuid_len)?));
                }
                AttPdu::FindInformationRsp { data }
            }
            ATT_FIND_BY_TYPE_VALUE_REQ => AttPdu::FindByTypeValueReq {
                start_handle: r.read_u16_le()?,
                end_handle: r.read_u16_le()?,
                attribute_type: r.read_u16_le()?,
                value: r.take_rest().to_vec(),
            },
            ATT_FIND_BY_TYPE_VALUE_RSP => {
                let mut ranges = Vec::new();
                while r.remaining() >= 4 {
                    ranges.push((r.read_u16_le()?, r.read_u16_le()?));
                }
                AttPdu::FindByTypeValueRsp { ranges }
            }
            ATT_READ_BY_TYPE_REQ => {
                let start_handle = r.read_u16_le()?;
                let end_handle = r.read_u16_le()?;
                let uuid_len = r.remaining();
                let attribute_type = WireUuid::read(&mut r, uuid_len)?;
                AttPdu::ReadByTypeReq {
                    start_handle,
                    end_handle,
                    attribute_type,
                }
            }
            ATT_READ_BY_TYPE_RSP => {
                let element_len = r.read_u8()? as usize;
                if element_len < 2 {
                    return Err(CodecError::InvalidLength(element_len));
                }
                let value_len = element_len - 2;
                let mut records = Vec::new();
                while r.remaining() >= element_len {
                    let handle = r.read_u16_le()?;
                    records.push((handle, r.read_slice(value_len)?.to_vec()));
                }
                AttPdu::ReadByTypeRsp { records }
            }
            ATT_READ_REQ => AttPdu::ReadReq {
                handle: r.read_u16_le()?,
            },
            ATT_READ_RSP => AttPdu::ReadRsp {
                value: r.take_rest().to_vec(),
            },
            ATT_READ_BLOB_REQ => AttPdu::ReadBlobReq {
                handle: r.read_u16_le()?,
                offset: r.read_u16_le()?,
            },
            ATT_READ_BLOB_RSP => AttPdu::ReadBlobRsp {
                value: r.take_rest().to_vec(),
            },
            ATT_READ_BY_GROUP_TYPE_REQ => {
                let start_handle = r.read_u16_le()?;
                let end_handle = r.read_u16_le()?;
                let uuid_len = r.remaining();
                let group_type = WireUuid::read(&mut r, uuid_len)?;
                AttPdu::ReadByGroupTypeReq {
                    start_handle,
                    end_handle,
                    group_type,
                }
            }
            ATT_READ_BY_GROUP_TYPE_RSP => {
                let element_len = r.read_u8()? as usize;
                if element_len < 4 {
                    return Err(CodecError::InvalidLength(element_len));
                }
                let value_len = element_len - 4;
                let mut records = Vec::new();
                while r.remaining() >= element_len {
                    records.push(GroupRecord {
                        start_handle: r.read_u16_le()?,
                        end_handle: r.read_u16_le()?,
                        value: r.read_slice(value_len)?.to_vec(),
                    });
                }
                AttPdu::ReadByGroupTypeRsp { records }
            }
            ATT_WRITE_REQ => AttPdu::WriteReq {
                handle: r.read_u16_le()?,
                value: r.take_rest().to_vec(),
            },
            ATT_WRITE_RSP => AttPdu::WriteRsp,
            ATT_WRITE_CMD => AttPdu::WriteCmd {
                handle: r.read_u16_le()?,
                value: r.take_rest().to_vec(),
            },
            ATT_PREPARE_WRITE_REQ => AttPdu::PrepareWriteReq {
                handle: r.read_u16_le()?,
                offset: r.read_u16_le()?,
                value: r.take_rest().to_vec(),
            },
            ATT_PREPARE_WRITE_RSP => AttPdu::PrepareWriteRsp {
                handle: r.read_u16_le()?,
                offset: r.read_u16_le()?,
                value: r.take_rest().to_vec(),
            },
            ATT_EXECUTE_WRITE_REQ => AttPdu::ExecuteWriteReq {
                execute: r.read_u8()? != 0,
            },
            ATT_EXECUTE_WRITE_RSP => AttPdu::ExecuteWriteRsp,
            ATT_HANDLE_VALUE_NTF => AttPdu::HandleValueNtf {
                handle: r.read_u16_le()?,
                value: r.take_rest().to_vec(),
            },
            ATT_HANDLE_VALUE_IND => AttPdu::HandleValueInd {
                handle: r.read_u16_le()?,
                value: r.take_rest().to_vec(),
            },
            ATT_HANDLE_VALUE_CFM => AttPdu::HandleValueCfm,
            other => return Err(CodecError::InvalidValue(other as u64)),
        };
        Ok(pdu)
    }
}
