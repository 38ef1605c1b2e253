// rawble Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! Bit-exact SMP PDU codec (Core Spec Vol 3 Part H).

use crate::api::{AddressType, BDAddr};
use crate::codec::{ByteReader, CodecError};
use bitflags::bitflags;
use bytes::{BufMut, BytesMut};
use num_derive::FromPrimitive;

pub const SMP_PAIRING_REQUEST: u8 = 0x01;
pub const SMP_PAIRING_RESPONSE: u8 = 0x02;
pub const SMP_PAIRING_CONFIRM: u8 = 0x03;
pub const SMP_PAIRING_RANDOM: u8 = 0x04;
pub const SMP_PAIRING_FAILED: u8 = 0x05;
pub const SMP_ENCRYPTION_INFORMATION: u8 = 0x06;
pub const SMP_CENTRAL_IDENTIFICATION: u8 = 0x07;
pub const SMP_IDENTITY_INFORMATION: u8 = 0x08;
pub const SMP_IDENTITY_ADDRESS_INFORMATION: u8 = 0x09;
pub const SMP_SIGNING_INFORMATION: u8 = 0x0a;
pub const SMP_SECURITY_REQUEST: u8 = 0x0b;
pub const SMP_PAIRING_PUBLIC_KEY: u8 = 0x0c;
pub const SMP_PAIRING_DHKEY_CHECK: u8 = 0x0d;
pub const SMP_KEYPRESS_NOTIFICATION: u8 = 0x0e;

bitflags! {
    /// The AuthReq octet of the feature exchange.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AuthRequirements: u8 {
        const BONDING = 0x01;
        const MITM = 0x04;
        const SECURE_CONNECTIONS = 0x08;
        const KEYPRESS = 0x10;
        const CT2 = 0x20;
    }
}

bitflags! {
    /// Key distribution bits of the feature exchange.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KeyDistribution: u8 {
        const ENC_KEY = 0x01;
        const ID_KEY = 0x02;
        const SIGN_KEY = 0x04;
        const LINK_KEY = 0x08;
    }
}

/// Reason codes of `Pairing Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum SmpFailureReason {
    PasskeyEntryFailed = 0x01,
    OobNotAvailable = 0x02,
    AuthenticationRequirements = 0x03,
    ConfirmValueFailed = 0x04,
    PairingNotSupported = 0x05,
    EncryptionKeySize = 0x06,
    CommandNotSupported = 0x07,
    UnspecifiedReason = 0x08,
    RepeatedAttempts = 0x09,
    InvalidParameters = 0x0a,
    DhKeyCheckFailed = 0x0b,
    NumericComparisonFailed = 0x0c,
    BrEdrPairingInProgress = 0x0d,
    CrossTransportKeyNotAllowed = 0x0e,
}

impl SmpFailureReason {
    pub fn from_u8(v: u8) -> SmpFailureReason {
        num_traits::FromPrimitive::from_u8(v).unwrap_or(SmpFailureReason::UnspecifiedReason)
    }
}

/// The feature set sent in Pairing Request and echoed in Pairing Response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingFeatures {
    pub io_capability: u8,
    pub oob_data: bool,
    pub auth_req: AuthRequirements,
    pub max_encryption_key_size: u8,
    pub initiator_key_dist: KeyDistribution,
    pub responder_key_dist: KeyDistribution,
}

impl PairingFeatures {
    /// The 7 raw octets (opcode included) used as `preq`/`pres` input to the
    /// confirm-value computation.
    pub fn to_octets(&self, opcode: u8) -> [u8; 7] {
        [
            opcode,
            self.io_capability,
            self.oob_data as u8,
            self.auth_req.bits(),
            self.max_encryption_key_size,
            self.initiator_key_dist.bits(),
            self.responder_key_dist.bits(),
        ]
    }
}

/// A decoded SMP PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmpPdu {
    PairingRequest(PairingFeatures),
    PairingResponse(PairingFeatures),
    PairingConfirm { value: [u8; 16] },
    PairingRandom { value: [u8; 16] },
    PairingFailed { reason: SmpFailureReason },
    EncryptionInformation { ltk: [u8; 16] },
    CentralIdentification { ediv: u16, rand: u64 },
    IdentityInformation { irk: [u8; 16] },
    IdentityAddressInformation { address_type: AddressType, address: BDAddr },
    SigningInformation { csrk: [u8; 16] },
    SecurityRequest { auth_req: AuthRequirements },
    PairingPublicKey { x: [u8; 32], y: [u8; 32] },
    PairingDhKeyCheck { value: [u8; 16] },
    KeypressNotification { keypress: u8 },
}

impl SmpPdu {
    pub fn opcode(&self) -> u8 {
        match self {
            SmpPdu::PairingRequest(_) => SMP_PAIRING_REQUEST,
            SmpPdu::PairingResponse(_) => SMP_PAIRING_RESPONSE,
            SmpPdu::PairingConfirm { .. } => SMP_PAIRING_CONFIRM,
            SmpPdu::PairingRandom { .. } => SMP_PAIRING_RANDOM,
            SmpPdu::PairingFailed { .. } => SMP_PAIRING_FAILED,
            SmpPdu::EncryptionInformation { .. } => SMP_ENCRYPTION_INFORMATION,
            SmpPdu::CentralIdentification { .. } => SMP_CENTRAL_IDENTIFICATION,
            SmpPdu::IdentityInformation { .. } => SMP_IDENTITY_INFORMATION,
            SmpPdu::IdentityAddressInformation { .. } => SMP_IDENTITY_ADDRESS_INFORMATION,
            SmpPdu::SigningInformation { .. } => SMP_SIGNING_INFORMATION,
            SmpPdu::SecurityRequest { .. } => SMP_SECURITY_REQUEST,
            SmpPdu::PairingPublicKey { .. } => SMP_PAIRING_PUBLIC_KEY,
            SmpPdu::PairingDhKeyCheck { .. } => SMP_PAIRING_DHKEY_CHECK,
            SmpPdu::KeypressNotification { .. } => SMP_KEYPRESS_NOTIFICATION,
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(24);
        buf.put_u8(self.opcode());
        match self {
            SmpPdu::PairingRequest(features) | SmpPdu::PairingResponse(features) => {
                buf.put_u8(features.io_capability);
                buf.put_u8(features.oob_data as u8);
                buf.put_u8(features.auth_req.bits());
                buf.put_u8(features.max_encryption_key_size);
                buf.put_u8(features.initiator_key_dist.bits());
                buf.put_u8(features.responder_key_dist.bits());
            }
            SmpPdu::PairingConfirm { value }
            | SmpPdu::PairingRandom { value }
            | SmpPdu::PairingDhKeyCheck { value } => {
                buf.put_slice(value);
            }
            SmpPdu::PairingFailed { reason } => {
                buf.put_u8(*reason as u8);
            }
            SmpPdu::EncryptionInformation { ltk } => {
                buf.put_slice(ltk);
            }
            SmpPdu::CentralIdentification { ediv, rand } => {
                buf.put_u16_le(*ediv);
                buf.put_u64_le(*rand);
            }
            SmpPdu::IdentityInformation { irk } => {
                buf.put_slice(irk);
            }
            SmpPdu::IdentityAddressInformation {
                address_type,
                address,
            } => {
                buf.put_u8(match address_type {
                    AddressType::LeRandom => 0x01,
                    _ => 0x00,
                });
                buf.put_slice(&address.to_le_bytes());
            }
            SmpPdu::SigningInformation { csrk } => {
                buf.put_slice(csrk);
            }
            SmpPdu::SecurityRequest { auth_req } => {
                buf.put_u8(auth_req.bits());
            }
            SmpPdu::PairingPublicKey { x, y } => {
                buf.put_slice(x);
                buf.put_slice(y);
            }
            SmpPdu::KeypressNotification { keypress } => {
                buf.put_u8(*keypress);
            }
        }
        buf
    }

    pub fn decode(frame: &[u8]) -> Result<SmpPdu, CodecError> {
        let mut r = ByteReader::new(frame);
        let opcode = r.read_u8()?;
        let pdu = match opcode {
            SMP_PAIRING_REQUEST | SMP_PAIRING_RESPONSE => {
                let features = PairingFeatures {
                    io_capability: r.read_u8()?,
                    oob_data: r.read_u8()? != 0,
                    auth_req: AuthRequirements::from_bits_truncate(r.read_u8()?),
                    max_encryption_key_size: r.read_u8()?,
                    initiator_key_dist: KeyDistribution::from_bits_truncate(r.read_u8()?),
                    responder_key_dist: KeyDistribution::from_bits_truncate(r.read_u8()?),
                };
                if opcode == SMP_PAIRING_REQUEST {
                    SmpPdu::PairingRequest(features)
                } else {
                    SmpPdu::PairingResponse(features)
                }
            }
            SMP_PAIRING_CONFIRM => SmpPdu::PairingConfirm {
                value: r.read_array()?,
            },
            SMP_PAIRING_RANDOM => SmpPdu::PairingRandom {
                value: r.read_array()?,
            },
            SMP_PAIRING_FAILED => SmpPdu::PairingFailed {
                reason: SmpFailureReason::from_u8(r.read_u8()?),
            },
            SMP_ENCRYPTION_INFORMATION => SmpPdu::EncryptionInformation {
                ltk: r.read_array()?,
            },
            SMP_CENTRAL_IDENTIFICATION => SmpPdu::CentralIdentification {
                ediv: r.read_u16_le()?,
                rand: r.read_u64_le()?,
            },
            SMP_IDENTITY_INFORMATION => SmpPdu::IdentityInformation {
                irk: r.read_array()?,
            },
            SMP_IDENTITY_ADDRESS_INFORMATION => SmpPdu::IdentityAddressInformation {
                address_type: AddressType::from_le_report(r.read_u8()?),
                address: BDAddr::from_le_bytes(r.read_array()?),
            },
            SMP_SIGNING_INFORMATION => SmpPdu::SigningInformation {
                csrk: r.read_array()?,
            },
            SMP_SECURITY_REQUEST => SmpPdu::SecurityRequest {
                auth_req: AuthRequirements::from_bits_truncate(r.read_u8()?),
            },
            SMP_PAIRING_PUBLIC_KEY => SmpPdu::PairingPublicKey {
                x: r.read_array()?,
                y: r.read_array()?,
            },
            SMP_PAIRING_DHKEY_CHECK => SmpPdu::PairingDhKeyCheck {
                value: r.read_array()?,
            },
            SMP_KEYPRESS_NOTIFICATION => SmpPdu::KeypressNotification {
                keypress: r.read_u8()?,
            },
            other => return Err(CodecError::InvalidValue(other as u64)),
        };
        Ok(pdu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(pdu: SmpPdu) {
        let encoded = pdu.encode();
        let decoded = SmpPdu::decode(&encoded).unwrap();
        assert_eq!(decoded, pdu);
        assert_eq!(decoded.encode(), encoded);
    }

    #[test]
    fn roundtrip_feature_exchange() {
        let features = PairingFeatures {
            io_capability: 0x03,
            oob_data: false,
            auth_req: AuthRequirements::BONDING | AuthRequirements::MITM,
            max_encryption_key_size: 16,
            initiator_key_dist: KeyDistribution::ENC_KEY | KeyDistribution::SIGN_KEY,
            responder_key_dist: KeyDistribution::ENC_KEY,
        };
        roundtrip(SmpPdu::PairingRequest(features));
        roundtrip(SmpPdu::PairingResponse(features));
        assert_eq!(
            features.to_octets(SMP_PAIRING_REQUEST),
            [0x01, 0x03, 0x00, 0x05, 16, 0x05, 0x01]
        );
    }

    #[test]
    fn roundtrip_pairing_and_keys() {
        roundtrip(SmpPdu::PairingConfirm { value: [0xaa; 16] });
        roundtrip(SmpPdu::PairingRandom { value: [0x5a; 16] });
        roundtrip(SmpPdu::PairingFailed {
            reason: SmpFailureReason::ConfirmValueFailed,
        });
        roundtrip(SmpPdu::EncryptionInformation { ltk: [7; 16] });
        roundtrip(SmpPdu::CentralIdentification {
            ediv: 0x1234,
            rand: 0x0102030405060708,
        });
        roundtrip(SmpPdu::IdentityInformation { irk: [3; 16] });
        roundtrip(SmpPdu::IdentityAddressInformation {
            address_type: AddressType::LePublic,
            address: "C0:26:DA:01:DA:B1".parse().unwrap(),
        });
        roundtrip(SmpPdu::SigningInformation { csrk: [9; 16] });
        roundtrip(SmpPdu::SecurityRequest {
            auth_req: AuthRequirements::BONDING,
        });
        roundtrip(SmpPdu::KeypressNotification { keypress: 2 });
    }

    #[test]
    fn central_identification_wire_layout() {
        let frame = SmpPdu::CentralIdentification {
            ediv: 0xbbaa,
            rand: 0x1122334455667788,
        }
        .encode();
        assert_eq!(
            &frame[..],
            &[0x07, 0xaa, 0xbb, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn decode_rejects_unknown_opcode() {
        assert_eq!(
            SmpPdu::decode(&[0x7f, 0x00]),
            Err(CodecError::InvalidValue(0x7f))
        );
    }
}
