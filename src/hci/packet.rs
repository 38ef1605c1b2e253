// rawble Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! Bit-exact HCI frame codec: event decoding and command encoding.
//!
//! Frames on the raw socket are `{packet_type_u8, HCI PDU}`. Only event
//! packets are decoded here; the socket filter excludes everything else.

use super::constants::*;
use crate::api::{AddressType, BDAddr};
use crate::codec::{ByteReader, CodecError};
use bytes::{BufMut, BytesMut};
use log::trace;

/// An LE connection as reported by (Enhanced) Connection Complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeConnectionInfo {
    pub status: HciStatus,
    pub handle: u16,
    /// 0 = central, 1 = peripheral.
    pub role: u8,
    pub peer_address_type: AddressType,
    pub peer_address: BDAddr,
    pub conn_interval: u16,
    pub conn_latency: u16,
    pub supervision_timeout: u16,
    pub master_clock_accuracy: u8,
}

/// One advertising report; an event may carry several.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingInfo {
    pub evt_type: u8,
    pub address_type: AddressType,
    pub address: BDAddr,
    /// Raw AD structures, decoded later by the EIR layer.
    pub data: Vec<u8>,
    pub rssi: i8,
    /// Set when this report came in as a scan response.
    pub scan_response: bool,
}

/// A decoded controller event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HciEvent {
    CommandComplete {
        opcode: u16,
        status: HciStatus,
        /// Return parameters after the status byte.
        payload: Vec<u8>,
    },
    CommandStatus {
        opcode: u16,
        status: HciStatus,
    },
    DisconnectComplete {
        status: HciStatus,
        handle: u16,
        reason: HciStatus,
    },
    EncryptionChange {
        status: HciStatus,
        handle: u16,
        encrypted: bool,
    },
    LeConnectionComplete(LeConnectionInfo),
    LeAdvertisingReport(Vec<AdvertisingInfo>),
    LeConnectionUpdateComplete {
        status: HciStatus,
        handle: u16,
        conn_interval: u16,
        conn_latency: u16,
        supervision_timeout: u16,
    },
    LeReadRemoteFeaturesComplete {
        status: HciStatus,
        handle: u16,
        features: LeFeatures,
    },
    LeLongTermKeyRequest {
        handle: u16,
        rand: u64,
        ediv: u16,
    },
    HardwareError(u8),
    /// Anything the stack has no decoder for; kept raw for listeners.
    Unknown {
        event: u8,
        payload: Vec<u8>,
    },
}

impl HciEvent {
    /// The connection handle carried by this event, if any.
    pub fn handle(&self) -> Option<u16> {
        match self {
            HciEvent::DisconnectComplete { handle, .. }
            | HciEvent::EncryptionChange { handle, .. }
            | HciEvent::LeConnectionUpdateComplete { handle, .. }
            | HciEvent::LeReadRemoteFeaturesComplete { handle, .. }
            | HciEvent::LeLongTermKeyRequest { handle, .. } => Some(*handle),
            HciEvent::LeConnectionComplete(info) => Some(info.handle),
            _ => None,
        }
    }

    /// True for events a command submitter may be blocked on.
    pub(crate) fn is_reply(&self) -> bool {
        !matches!(
            self,
            HciEvent::LeAdvertisingReport(_) | HciEvent::Unknown { .. } | HciEvent::HardwareError(_)
        )
    }

    /// Decodes one full `{packet_type, ...}` frame from the socket.
    pub fn decode(frame: &[u8]) -> Result<HciEvent, CodecError> {
        let mut r = ByteReader::new(frame);
        let packet_type = r.read_u8()?;
        if packet_type != HCI_EVENT_PKT {
            return Err(CodecError::InvalidValue(packet_type as u64));
        }
        let event = r.read_u8()?;
        let plen = r.read_u8()? as usize;
        let payload = r.read_slice(plen)?;
        let mut r = ByteReader::new(payload);

        let decoded = match event {
            EVT_CMD_COMPLETE => {
                let _num_pkts = r.read_u8()?;
                let opcode = r.read_u16_le()?;
                let status = HciStatus::from_u8(r.read_u8()?);
                HciEvent::CommandComplete {
                    opcode,
                    status,
                    payload: r.take_rest().to_vec(),
                }
            }
            EVT_CMD_STATUS => {
                let status = HciStatus::from_u8(r.read_u8()?);
                let _num_pkts = r.read_u8()?;
                let opcode = r.read_u16_le()?;
                HciEvent::CommandStatus { opcode, status }
            }
            EVT_DISCONN_COMPLETE => HciEvent::DisconnectComplete {
                status: HciStatus::from_u8(r.read_u8()?),
                handle: r.read_u16_le()?,
                reason: HciStatus::from_u8(r.read_u8()?),
            },
            EVT_ENCRYPT_CHANGE => HciEvent::EncryptionChange {
                status: HciStatus::from_u8(r.read_u8()?),
                handle: r.read_u16_le()?,
                encrypted: r.read_u8()? != 0,
            },
            EVT_HARDWARE_ERROR => HciEvent::HardwareError(r.read_u8()?),
            EVT_LE_META_EVENT => return decode_le_meta(&mut r),
            other => {
                trace!("undecoded HCI event {:#04x} ({} bytes)", other, plen);
                HciEvent::Unknown {
                    event,
                    payload: r.take_rest().to_vec(),
                }
            }
        };
        Ok(decoded)
    }
}

fn read_bd_addr(r: &mut ByteReader<'_>) -> Result<BDAddr, CodecError> {
    Ok(BDAddr::from_le_bytes(r.read_array()?))
}

fn decode_le_meta(r: &mut ByteReader<'_>) -> Result<HciEvent, CodecError> {
    let subevent = r.read_u8()?;
    let decoded = match subevent {
        EVT_LE_CONN_COMPLETE => HciEvent::LeConnectionComplete(LeConnectionInfo {
            status: HciStatus::from_u8(r.read_u8()?),
            handle: r.read_u16_le()?,
            role: r.read_u8()?,
            peer_address_type: AddressType::from_le_report(r.read_u8()?),
            peer_address: read_bd_addr(r)?,
            conn_interval: r.read_u16_le()?,
            conn_latency: r.read_u16_le()?,
            supervision_timeout: r.read_u16_le()?,
            master_clock_accuracy: r.read_u8()?,
        }),
        EVT_LE_ENHANCED_CONN_COMPLETE => {
            let status = HciStatus::from_u8(r.read_u8()?);
            let handle = r.read_u16_le()?;
            let role = r.read_u8()?;
            let peer_address_type = AddressType::from_le_report(r.read_u8()?);
            let peer_address = read_bd_addr(r)?;
            let _local_rpa = read_bd_addr(r)?;
            let _peer_rpa = read_bd_addr(r)?;
            HciEvent::LeConnectionComplete(LeConnectionInfo {
                status,
                handle,
                role,
                peer_address_type,
                peer_address,
                conn_interval: r.read_u16_le()?,
                conn_latency: r.read_u16_le()?,
                supervision_timeout: r.read_u16_le()?,
                master_clock_accuracy: r.read_u8()?,
            })
        }
        EVT_LE_ADVERTISING_REPORT => {
            let count = r.read_u8()? as usize;
            let mut reports = Vec::with_capacity(count);
            for _ in 0..count {
                let evt_type = r.read_u8()?;
                let address_type = AddressType::from_le_report(r.read_u8()?);
                let address = read_bd_addr(r)?;
                let dlen = r.read_u8()? as usize;
                let data = r.read_slice(dlen)?.to_vec();
                let rssi = r.read_i8()?;
                reports.push(AdvertisingInfo {
                    evt_type,
                    address_type,
                    address,
                    data,
                    rssi,
                    // 0x04 = SCAN_RSP
                    scan_response: evt_type == 0x04,
                });
            }
            HciEvent::LeAdvertisingReport(reports)
        }
        EVT_LE_EXT_ADVERTISING_REPORT => {
            let count = r.read_u8()? as usize;
            let mut reports = Vec::with_capacity(count);
            for _ in 0..count {
                let evt_type = r.read_u16_le()?;
                let address_type = AddressType::from_le_report(r.read_u8()?);
                let address = read_bd_addr(r)?;
                let _primary_phy = r.read_u8()?;
                let _secondary_phy = r.read_u8()?;
                let _adv_sid = r.read_u8()?;
                let _tx_power = r.read_i8()?;
                let rssi = r.read_i8()?;
                let _periodic_interval = r.read_u16_le()?;
                let _direct_address_type = r.read_u8()?;
                let _direct_address = read_bd_addr(r)?;
                let dlen = r.read_u8()? as usize;
                let data = r.read_slice(dlen)?.to_vec();
                reports.push(AdvertisingInfo {
                    evt_type: (evt_type & 0xff) as u8,
                    address_type,
                    address,
                    data,
                    rssi,
                    scan_response: evt_type & 0x0008 != 0,
                });
            }
            HciEvent::LeAdvertisingReport(reports)
        }
        EVT_LE_CONN_UPDATE_COMPLETE => HciEvent::LeConnectionUpdateComplete {
            status: HciStatus::from_u8(r.read_u8()?),
            handle: r.read_u16_le()?,
            conn_interval: r.read_u16_le()?,
            conn_latency: r.read_u16_le()?,
            supervision_timeout: r.read_u16_le()?,
        },
        EVT_LE_READ_REMOTE_FEATURES_COMPLETE => HciEvent::LeReadRemoteFeaturesComplete {
            status: HciStatus::from_u8(r.read_u8()?),
            handle: r.read_u16_le()?,
            features: LeFeatures::from_bits_truncate(r.read_u64_le()?),
        },
        EVT_LE_LTK_REQUEST => HciEvent::LeLongTermKeyRequest {
            handle: r.read_u16_le()?,
            rand: r.read_u64_le()?,
            ediv: r.read_u16_le()?,
        },
        other => {
            trace!("undecoded LE meta subevent {:#04x}", other);
            HciEvent::Unknown {
                event: EVT_LE_META_EVENT,
                payload: r.take_rest().to_vec(),
            }
        }
    };
    Ok(decoded)
}

/// Encodes a command frame: `{0x01, opcode_le, plen, params}`.
pub fn encode_command(opcode: CommandOpcode, params: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4 + params.len());
    buf.put_u8(HCI_COMMAND_PKT);
    buf.put_u16_le(opcode as u16);
    buf.put_u8(params.len() as u8);
    buf.put_slice(params);
    buf
}

/// Parameters for `LE Create Connection`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeConnectParams {
    pub scan_interval: u16,
    pub scan_window: u16,
    /// Use the controller white list instead of `peer_address`.
    pub use_whitelist: bool,
    pub own_address_type: AddressType,
    pub conn_interval_min: u16,
    pub conn_interval_max: u16,
    pub conn_latency: u16,
    pub supervision_timeout: u16,
    pub min_ce_length: u16,
    pub max_ce_length: u16,
}

impl Default for LeConnectParams {
    fn default() -> Self {
        // 1.25 ms units for intervals, 10 ms units for the timeout
        Self {
            scan_interval: 0x0018,
            scan_window: 0x0018,
            use_whitelist: false,
            own_address_type: AddressType::LePublic,
            conn_interval_min: 0x000f,
            conn_interval_max: 0x000f,
            conn_latency: 0x0000,
            supervision_timeout: 0x0c80,
            min_ce_length: 0x0001,
            max_ce_length: 0x0001,
        }
    }
}

pub fn encode_le_create_connection(
    params: &LeConnectParams,
    peer_type: AddressType,
    peer: BDAddr,
) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(25);
    buf.put_u16_le(params.scan_interval);
    buf.put_u16_le(params.scan_window);
    buf.put_u8(params.use_whitelist as u8);
    buf.put_u8(match peer_type {
        AddressType::LeRandom => 0x01,
        _ => 0x00,
    });
    buf.put_slice(&peer.to_le_bytes());
    buf.put_u8(match params.own_address_type {
        AddressType::LeRandom => 0x01,
        _ => 0x00,
    });
    buf.put_u16_le(params.conn_interval_min);
    buf.put_u16_le(params.conn_interval_max);
    buf.put_u16_le(params.conn_latency);
    buf.put_u16_le(params.supervision_timeout);
    buf.put_u16_le(params.min_ce_length);
    buf.put_u16_le(params.max_ce_length);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_advertising_report() {
        let buf = [
            4, 62, 40, 2, 1, 4, 0, 192, 74, 150, 234, 218, 116, 28, 18, 9, 76, 69, 68, 66, 108,
            117, 101, 45, 69, 65, 57, 54, 52, 65, 67, 48, 32, 5, 18, 16, 0, 20, 0, 2, 10, 4, 190,
        ];
        match HciEvent::decode(&buf).unwrap() {
            HciEvent::LeAdvertisingReport(reports) => {
                assert_eq!(reports.len(), 1);
                let rep = &reports[0];
                assert_eq!(rep.evt_type, 4);
                assert!(rep.scan_response);
                assert_eq!(rep.address_type, AddressType::LePublic);
                assert_eq!(rep.address, "74:DA:EA:96:4A:C0".parse().unwrap());
                assert_eq!(rep.rssi, -66);
                assert_eq!(rep.data.len(), 28);
                // payload starts with the complete-local-name structure
                assert_eq!(&rep.data[..2], &[18, 9]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn decode_command_status() {
        let buf = [4, 15, 4, 0, 1, 22, 32];
        assert_eq!(
            HciEvent::decode(&buf).unwrap(),
            HciEvent::CommandStatus {
                opcode: CommandOpcode::LeReadRemoteFeatures as u16,
                status: HciStatus::Success,
            }
        );
    }

    #[test]
    fn decode_command_complete() {
        // Reset command complete, status success
        let buf = [4, 14, 4, 1, 0x03, 0x0c, 0];
        assert_eq!(
            HciEvent::decode(&buf).unwrap(),
            HciEvent::CommandComplete {
                opcode: CommandOpcode::Reset as u16,
                status: HciStatus::Success,
                payload: vec![],
            }
        );
    }

    #[test]
    fn decode_read_remote_features_complete() {
        let buf = [4, 62, 12, 4, 0, 64, 0, 1, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            HciEvent::decode(&buf).unwrap(),
            HciEvent::LeReadRemoteFeaturesComplete {
                status: HciStatus::Success,
                handle: 64,
                features: LeFeatures::LE_ENCRYPTION,
            }
        );
    }

    #[test]
    fn decode_disconnect_complete() {
        let buf = [4, 5, 4, 0, 64, 0, 0x13];
        let ev = HciEvent::decode(&buf).unwrap();
        assert_eq!(
            ev,
            HciEvent::DisconnectComplete {
                status: HciStatus::Success,
                handle: 64,
                reason: HciStatus::RemoteUserTerminatedConnection,
            }
        );
        assert_eq!(ev.handle(), Some(64));
    }

    #[test]
    fn decode_connection_complete() {
        let buf = [
            4, 62, 19, 1, 0, 0x40, 0, 0, 0, 0xb1, 0xda, 0x01, 0xda, 0x26, 0xc0, 0x0f, 0, 0, 0,
            0x80, 0x0c, 1,
        ];
        match HciEvent::decode(&buf).unwrap() {
            HciEvent::LeConnectionComplete(info) => {
                assert_eq!(info.status, HciStatus::Success);
                assert_eq!(info.handle, 0x40);
                assert_eq!(info.peer_address, "C0:26:DA:01:DA:B1".parse().unwrap());
                assert_eq!(info.peer_address_type, AddressType::LePublic);
                assert_eq!(info.conn_interval, 0x000f);
                assert_eq!(info.supervision_timeout, 0x0c80);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn decode_truncated_frame_fails_cleanly() {
        let buf = [4, 62, 19, 1, 0];
        assert_eq!(HciEvent::decode(&buf), Err(CodecError::Eof));
    }

    #[test]
    fn encode_command_frame() {
        let frame = encode_command(CommandOpcode::LeSetScanEnable, &[0x01, 0x00]);
        assert_eq!(&frame[..], &[0x01, 0x0c, 0x20, 0x02, 0x01, 0x00]);
    }

    #[test]
    fn encode_create_connection_layout() {
        let params = LeConnectParams::default();
        let peer: BDAddr = "C0:26:DA:01:DA:B1".parse().unwrap();
        let body = encode_le_create_connection(&params, AddressType::LePublic, peer);
        assert_eq!(body.len(), 25);
        assert_eq!(&body[0..2], &[0x18, 0x00]); // scan interval
        assert_eq!(body[4], 0); // filter policy
        assert_eq!(body[5], 0); // peer addr type public
        assert_eq!(&body[6..12], &peer.to_le_bytes());
    }
}
