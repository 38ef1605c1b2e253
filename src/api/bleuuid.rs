// rawble Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! Utilities for dealing with BLE UUIDs, converting to and from their short
//! formats, and the tagged wire representation used by ATT and EIR.

use crate::codec::{ByteReader, CodecError};
use bytes::{BufMut, BytesMut};
use uuid::Uuid;

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const BLUETOOTH_BASE_MASK: u128 = 0x00000000_ffff_ffff_ffff_ffffffffffff;
const BLUETOOTH_BASE_MASK_16: u128 = 0xffff0000_ffff_ffff_ffff_ffffffffffff;

/// Convert a 32-bit BLE short UUID to a full 128-bit UUID by filling in the
/// standard Bluetooth Base UUID.
pub const fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Convert a 16-bit BLE short UUID to a full 128-bit UUID by filling in the
/// standard Bluetooth Base UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    uuid_from_u32(short as u32)
}

/// An extension trait for `Uuid` which provides BLE-specific methods.
pub trait BleUuid {
    /// If the UUID is a valid BLE short UUID then return its short form,
    /// otherwise return `None`.
    fn to_ble_u32(&self) -> Option<u32>;

    /// If the UUID is a valid 16-bit BLE short UUID then return its short
    /// form, otherwise return `None`.
    fn to_ble_u16(&self) -> Option<u16>;

    /// Convert the UUID to a string, using short format if applicable.
    fn to_short_string(&self) -> String;
}

impl BleUuid for Uuid {
    fn to_ble_u32(&self) -> Option<u32> {
        let value = self.as_u128();
        if value & BLUETOOTH_BASE_MASK == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u32)
        } else {
            None
        }
    }

    fn to_ble_u16(&self) -> Option<u16> {
        let value = self.as_u128();
        if value & BLUETOOTH_BASE_MASK_16 == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u16)
        } else {
            None
        }
    }

    fn to_short_string(&self) -> String {
        if let Some(uuid16) = self.to_ble_u16() {
            format!("{:#04x}", uuid16)
        } else if let Some(uuid32) = self.to_ble_u32() {
            format!("{:#06x}", uuid32)
        } else {
            self.to_string()
        }
    }
}

/// The tagged 16/32/128-bit UUID as it travels on the wire.
///
/// The three widths are distinct wire entities (a 16-bit alias occupies 2
/// bytes in an ATT record, its 128-bit expansion 16) but compare equal to
/// their canonical 128-bit expansion for display and lookup purposes, which
/// is what [`WireUuid::to_uuid`] yields.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum WireUuid {
    U16(u16),
    U32(u32),
    U128(Uuid),
}

impl WireUuid {
    /// Number of bytes this UUID occupies on the wire.
    pub fn size(&self) -> usize {
        match self {
            WireUuid::U16(_) => 2,
            WireUuid::U32(_) => 4,
            WireUuid::U128(_) => 16,
        }
    }

    /// Canonical 128-bit expansion via the Bluetooth Base UUID.
    pub fn to_uuid(&self) -> Uuid {
        match *self {
            WireUuid::U16(v) => uuid_from_u16(v),
            WireUuid::U32(v) => uuid_from_u32(v),
            WireUuid::U128(v) => v,
        }
    }

    /// Shrinks a full UUID back to its shortest wire form.
    pub fn from_uuid(uuid: Uuid) -> WireUuid {
        if let Some(v) = uuid.to_ble_u16() {
            WireUuid::U16(v)
        } else if let Some(v) = uuid.to_ble_u32() {
            WireUuid::U32(v)
        } else {
            WireUuid::U128(uuid)
        }
    }

    /// Appends the little-endian wire form.
    pub fn put(&self, buf: &mut BytesMut) {
        match *self {
            WireUuid::U16(v) => buf.put_u16_le(v),
            WireUuid::U32(v) => buf.put_u32_le(v),
            WireUuid::U128(v) => {
                let mut bytes = *v.as_bytes();
                bytes.reverse();
                buf.put_slice(&bytes);
            }
        }
    }

    /// Reads a UUID of the given wire width.
    pub fn read(r: &mut ByteReader<'_>, size: usize) -> Result<WireUuid, CodecError> {
        match size {
            2 => Ok(WireUuid::U16(r.read_u16_le()?)),
            4 => Ok(WireUuid::U32(r.read_u32_le()?)),
            16 => {
                let mut bytes: [u8; 16] = r.read_array()?;
                bytes.reverse();
                Ok(WireUuid::U128(Uuid::from_bytes(bytes)))
            }
            _ => Err(CodecError::InvalidLength(size)),
        }
    }
}

impl std::fmt::Display for WireUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_uuid().to_short_string())
    }
}

impl From<u16> for WireUuid {
    fn from(v: u16) -> Self {
        WireUuid::U16(v)
    }
}

impl From<Uuid> for WireUuid {
    fn from(v: Uuid) -> Self {
        WireUuid::U128(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[test]
    fn uuid_from_u32_test() {
        assert_eq!(
            uuid_from_u32(0x11223344),
            Uuid::parse_str("11223344-0000-1000-8000-00805f9b34fb").unwrap()
        );
    }

    #[test]
    fn uuid_from_u16_test() {
        assert_eq!(
            uuid_from_u16(0x1122),
            Uuid::parse_str("00001122-0000-1000-8000-00805f9b34fb").unwrap()
        );
    }

    #[test]
    fn uuid_to_from_u16_success() {
        let uuid = Uuid::parse_str("00001234-0000-1000-8000-00805f9b34fb").unwrap();
        assert_eq!(uuid_from_u16(uuid.to_ble_u16().unwrap()), uuid);
    }

    #[test]
    fn uuid_to_u16_fail() {
        assert_eq!(
            Uuid::parse_str("12345678-0000-1000-8000-00805f9b34fb")
                .unwrap()
                .to_ble_u16(),
            None
        );
        assert_eq!(Uuid::nil().to_ble_u16(), None);
    }

    #[test]
    fn to_short_string_u16() {
        let uuid = uuid_from_u16(0x1122);
        assert_eq!(uuid.to_short_string(), "0x1122");
    }

    #[test]
    fn wire_roundtrip_all_widths() {
        let mut rng = rand::rng();
        for _ in 0..64 {
            let mut raw = [0u8; 16];
            rng.fill_bytes(&mut raw);
            let cases = [
                WireUuid::U16(u16::from_le_bytes([raw[0], raw[1]])),
                WireUuid::U32(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
                WireUuid::U128(Uuid::from_bytes(raw)),
            ];
            for case in cases {
                let mut buf = BytesMut::new();
                case.put(&mut buf);
                assert_eq!(buf.len(), case.size());
                let mut r = ByteReader::new(&buf);
                let back = WireUuid::read(&mut r, case.size()).unwrap();
                assert_eq!(back, case);
                assert_eq!(r.remaining(), 0);
            }
        }
    }

    #[test]
    fn wire_uuid_16_bit_le_layout() {
        let mut buf = BytesMut::new();
        WireUuid::U16(0x2A1C).put(&mut buf);
        assert_eq!(&buf[..], &[0x1C, 0x2A]);
    }

    #[test]
    fn short_forms_expand_for_display() {
        assert_eq!(
            WireUuid::U16(0x1809).to_uuid(),
            Uuid::parse_str("00001809-0000-1000-8000-00805f9b34fb").unwrap()
        );
        // distinct on the wire, equal after expansion
        assert_ne!(
            WireUuid::U16(0x1809),
            WireUuid::U128(uuid_from_u16(0x1809))
        );
        assert_eq!(
            WireUuid::U16(0x1809).to_uuid(),
            WireUuid::U128(uuid_from_u16(0x1809)).to_uuid()
        );
    }
}
