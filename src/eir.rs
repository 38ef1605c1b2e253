// rawble Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! Decoding and merging of EIR / advertising-data structures.
//!
//! An advertising report and its scan response each carry a list of typed AD
//! structures. Both decode into one [`EirData`] value; the device merges the
//! pair (and every later report) with [`EirData::update_from`], which
//! returns the set of fields that actually changed so listeners only hear
//! about real updates.

use crate::api::bleuuid::{uuid_from_u16, uuid_from_u32};
use crate::codec::ByteReader;
use bitflags::bitflags;
use log::trace;
use std::collections::HashMap;
use uuid::Uuid;

bitflags! {
    /// Which EIR fields are present in (or changed by) a report.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EirFields: u16 {
        const FLAGS = 1 << 0;
        const NAME = 1 << 1;
        const NAME_SHORT = 1 << 2;
        const TX_POWER = 1 << 3;
        const APPEARANCE = 1 << 4;
        const RSSI = 1 << 5;
        const MANUFACTURER_DATA = 1 << 6;
        const SERVICE_UUIDS = 1 << 7;
        const SERVICE_DATA = 1 << 8;
        const SOLICITED_UUIDS = 1 << 9;
        const CONN_INTERVAL_RANGE = 1 << 10;
    }
}

bitflags! {
    /// The AD `Flags` structure (type 0x01).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AdvertisingFlags: u8 {
        const LE_LIMITED_DISCOVERABLE_MODE = 0x01;
        const LE_GENERAL_DISCOVERABLE_MODE = 0x02;
        const BR_EDR_NOT_SUPPORTED = 0x04;
        const SIMULTANEOUS_LE_BR_EDR_CONTROLLER = 0x08;
        const SIMULTANEOUS_LE_BR_EDR_HOST = 0x10;
    }
}

// AD structure type codes (Core Spec Supplement, Part A).
const AD_FLAGS: u8 = 0x01;
const AD_UUID16_INCOMPLETE: u8 = 0x02;
const AD_UUID16_COMPLETE: u8 = 0x03;
const AD_UUID32_INCOMPLETE: u8 = 0x04;
const AD_UUID32_COMPLETE: u8 = 0x05;
const AD_UUID128_INCOMPLETE: u8 = 0x06;
const AD_UUID128_COMPLETE: u8 = 0x07;
const AD_NAME_SHORT: u8 = 0x08;
const AD_NAME_COMPLETE: u8 = 0x09;
const AD_TX_POWER: u8 = 0x0a;
const AD_CONN_INTERVAL_RANGE: u8 = 0x12;
const AD_SOLICIT16: u8 = 0x14;
const AD_SOLICIT128: u8 = 0x15;
const AD_SERVICE_DATA16: u8 = 0x16;
const AD_APPEARANCE: u8 = 0x19;
const AD_SOLICIT32: u8 = 0x1f;
const AD_SERVICE_DATA32: u8 = 0x20;
const AD_SERVICE_DATA128: u8 = 0x21;
const AD_MANUFACTURER: u8 = 0xff;

/// The typed fields decoded from one or more advertising/scan-response
/// payloads. `present` tracks which fields have been seen.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EirData {
    pub present: EirFields,
    pub flags: AdvertisingFlags,
    pub local_name: Option<String>,
    pub tx_power: Option<i8>,
    pub appearance: Option<u16>,
    pub rssi: Option<i8>,
    pub conn_interval_range: Option<(u16, u16)>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub service_uuids: Vec<Uuid>,
    pub solicited_uuids: Vec<Uuid>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
}

fn uuid128_from_le(bytes: [u8; 16]) -> Uuid {
    let mut be = bytes;
    be.reverse();
    Uuid::from_bytes(be)
}

impl EirData {
    /// Decodes a raw AD-structure list; malformed trailing data is skipped.
    pub fn decode(data: &[u8]) -> EirData {
        let mut eir = EirData::default();
        let mut r = ByteReader::new(data);
        while r.remaining() >= 2 {
            let len = match r.read_u8() {
                Ok(0) | Err(_) => break,
                Ok(len) => len as usize,
            };
            let Ok(body) = r.read_slice(len) else {
                trace!("truncated AD structure (len {})", len);
                break;
            };
            eir.decode_structure(body[0], &body[1..]);
        }
        eir
    }

    fn decode_structure(&mut self, typ: u8, body: &[u8]) {
        let mut r = ByteReader::new(body);
        match typ {
            AD_FLAGS => {
                if let Ok(v) = r.read_u8() {
                    self.flags = AdvertisingFlags::from_bits_truncate(v);
                    self.present |= EirFields::FLAGS;
                }
            }
            AD_UUID16_INCOMPLETE | AD_UUID16_COMPLETE => {
                while let Ok(v) = r.read_u16_le() {
                    self.push_service_uuid(uuid_from_u16(v));
                }
            }
            AD_UUID32_INCOMPLETE | AD_UUID32_COMPLETE => {
                while let Ok(v) = r.read_u32_le() {
                    self.push_service_uuid(uuid_from_u32(v));
                }
            }
            AD_UUID128_INCOMPLETE | AD_UUID128_COMPLETE => {
                while let Ok(v) = r.read_array::<16>() {
                    self.push_service_uuid(uuid128_from_le(v));
                }
            }
            AD_NAME_SHORT | AD_NAME_COMPLETE => {
                self.local_name = Some(String::from_utf8_lossy(body).into_owned());
                self.present |= if typ == AD_NAME_COMPLETE {
                    EirFields::NAME
                } else {
                    EirFields::NAME_SHORT
                };
            }
            AD_TX_POWER => {
                if let Ok(v) = r.read_i8() {
                    self.tx_power = Some(v);
                    self.present |= EirFields::TX_POWER;
                }
            }
            AD_APPEARANCE => {
                if let Ok(v) = r.read_u16_le() {
                    self.appearance = Some(v);
                    self.present |= EirFields::APPEARANCE;
                }
            }
            AD_CONN_INTERVAL_RANGE => {
                if let (Ok(min), Ok(max)) = (r.read_u16_le(), r.read_u16_le()) {
                    self.conn_interval_range = Some((min, max));
                    self.present |= EirFields::CONN_INTERVAL_RANGE;
                }
            }
            AD_SOLICIT16 => {
                while let Ok(v) = r.read_u16_le() {
                    self.push_solicited_uuid(uuid_from_u16(v));
                }
            }
            AD_SOLICIT32 => {
                while let Ok(v) = r.read_u32_le() {
                    self.push_solicited_uuid(uuid_from_u32(v));
                }
            }
            AD_SOLICIT128 => {
                while let Ok(v) = r.read_array::<16>() {
                    self.push_solicited_uuid(uuid128_from_le(v));
                }
            }
            AD_SERVICE_DATA16 => {
                if let Ok(v) = r.read_u16_le() {
                    self.service_data
                        .insert(uuid_from_u16(v), r.take_rest().to_vec());
                    self.present |= EirFields::SERVICE_DATA;
                }
            }
            AD_SERVICE_DATA32 => {
                if let Ok(v) = r.read_u32_le() {
                    self.service_data
                        .insert(uuid_from_u32(v), r.take_rest().to_vec());
                    self.present |= EirFields::SERVICE_DATA;
                }
            }
            AD_SERVICE_DATA128 => {
                if let Ok(v) = r.read_array::<16>() {
                    self.service_data
                        .insert(uuid128_from_le(v), r.take_rest().to_vec());
                    self.present |= EirFields::SERVICE_DATA;
                }
            }
            AD_MANUFACTURER => {
                if let Ok(company) = r.read_u16_le() {
                    self.manufacturer_data
                        .insert(company, r.take_rest().to_vec());
                    self.present |= EirFields::MANUFACTURER_DATA;
                }
            }
            other => {
                trace!("skipping AD structure type {:#04x} ({} bytes)", other, body.len());
            }
        }
    }

    fn push_service_uuid(&mut self, uuid: Uuid) {
        if !self.service_uuids.contains(&uuid) {
            self.service_uuids.push(uuid);
        }
        self.present |= EirFields::SERVICE_UUIDS;
    }

    fn push_solicited_uuid(&mut self, uuid: Uuid) {
        if !self.solicited_uuids.contains(&uuid) {
            self.solicited_uuids.push(uuid);
        }
        self.present |= EirFields::SOLICITED_UUIDS;
    }

    pub fn set_rssi(&mut self, rssi: i8) {
        self.rssi = Some(rssi);
        self.present |= EirFields::RSSI;
    }

    /// Folds `other` into `self`, returning the fields that changed.
    ///
    /// Merging the two halves of a split report (advertisement then scan
    /// response) is commutative and idempotent as long as the halves do not
    /// conflict; the union of the `present` sets is preserved. On a genuine
    /// conflict the newer value wins, except that a shortened name never
    /// replaces a complete one.
    pub fn update_from(&mut self, other: &EirData) -> EirFields {
        let mut changed = EirFields::empty();

        if other.present.contains(EirFields::FLAGS) {
            if !self.present.contains(EirFields::FLAGS) || self.flags != other.flags {
                self.flags = other.flags;
                changed |= EirFields::FLAGS;
            }
            self.present |= EirFields::FLAGS;
        }

        let other_has_name = other
            .present
            .intersects(EirFields::NAME | EirFields::NAME_SHORT);
        if other_has_name {
            let other_complete = other.present.contains(EirFields::NAME);
            let self_complete = self.present.contains(EirFields::NAME);
            let take = if self.local_name.is_none() {
                true
            } else if other_complete {
                self.local_name != other.local_name
            } else {
                // short form only upgrades an absent or short name
                !self_complete && self.local_name != other.local_name
            };
            if take {
                self.local_name = other.local_name.clone();
                changed |= if other_complete {
                    EirFields::NAME
                } else {
                    EirFields::NAME_SHORT
                };
            }
            self.present |= other.present & (EirFields::NAME | EirFields::NAME_SHORT);
        }

        if other.present.contains(EirFields::TX_POWER) {
            if self.tx_power != other.tx_power {
                self.tx_power = other.tx_power;
                changed |= EirFields::TX_POWER;
            }
            self.present |= EirFields::TX_POWER;
        }

        if other.present.contains(EirFields::APPEARANCE) {
            if self.appearance != other.appearance {
                self.appearance = other.appearance;
                changed |= EirFields::APPEARANCE;
            }
            self.present |= EirFields::APPEARANCE;
        }

        if other.present.contains(EirFields::RSSI) {
            if self.rssi != other.rssi {
                self.rssi = other.rssi;
                changed |= EirFields::RSSI;
            }
            self.present |= EirFields::RSSI;
        }

        if other.present.contains(EirFields::CONN_INTERVAL_RANGE) {
            if self.conn_interval_range != other.conn_interval_range {
                self.conn_interval_range = other.conn_interval_range;
                changed |= EirFields::CONN_INTERVAL_RANGE;
            }
            self.present |= EirFields::CONN_INTERVAL_RANGE;
        }

        if other.present.contains(EirFields::MANUFACTURER_DATA) {
            for (company, data) in &other.manufacturer_data {
                if self.manufacturer_data.get(company) != Some(data) {
                    self.manufacturer_data.insert(*company, data.clone());
                    changed |= EirFields::MANUFACTURER_DATA;
                }
            }
            self.present |= EirFields::MANUFACTURER_DATA;
        }

        if other.present.contains(EirFields::SERVICE_UUIDS) {
            for uuid in &other.service_uuids {
                if !self.service_uuids.contains(uuid) {
                    self.service_uuids.push(*uuid);
                    changed |= EirFields::SERVICE_UUIDS;
                }
            }
            self.present |= EirFields::SERVICE_UUIDS;
        }

        if other.present.contains(EirFields::SOLICITED_UUIDS) {
            for uuid in &other.solicited_uuids {
                if !self.solicited_uuids.contains(uuid) {
                    self.solicited_uuids.push(*uuid);
                    changed |= EirFields::SOLICITED_UUIDS;
                }
            }
            self.present |= EirFields::SOLICITED_UUIDS;
        }

        if other.present.contains(EirFields::SERVICE_DATA) {
            for (uuid, data) in &other.service_data {
                if self.service_data.get(uuid) != Some(data) {
                    self.service_data.insert(*uuid, data.clone());
                    changed |= EirFields::SERVICE_DATA;
                }
            }
            self.present |= EirFields::SERVICE_DATA;
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_name_interval_txpower() {
        // complete name + slave conn interval range + tx power
        let raw = [
            18, 0x09, 76, 69, 68, 66, 108, 117, 101, 45, 69, 65, 57, 54, 52, 65, 67, 48, 32, //
            5, 0x12, 16, 0, 20, 0, //
            2, 0x0a, 4,
        ];
        let eir = EirData::decode(&raw);
        assert_eq!(eir.local_name.as_deref(), Some("LEDBlue-EA964AC0 "));
        assert_eq!(eir.conn_interval_range, Some((16, 20)));
        assert_eq!(eir.tx_power, Some(4));
        assert!(eir.present.contains(
            EirFields::NAME | EirFields::CONN_INTERVAL_RANGE | EirFields::TX_POWER
        ));
    }

    #[test]
    fn decode_flags_and_uuid16_list() {
        let raw = [2, 0x01, 6, 7, 0x02, 0xf0, 0xff, 0xe5, 0xff, 0xe0, 0xff];
        let eir = EirData::decode(&raw);
        assert_eq!(
            eir.flags,
            AdvertisingFlags::BR_EDR_NOT_SUPPORTED | AdvertisingFlags::LE_GENERAL_DISCOVERABLE_MODE
        );
        assert_eq!(
            eir.service_uuids,
            vec![
                uuid_from_u16(0xfff0),
                uuid_from_u16(0xffe5),
                uuid_from_u16(0xffe0)
            ]
        );
    }

    #[test]
    fn decode_tolerates_truncated_tail() {
        let raw = [2, 0x0a, 4, 9, 0x09, 76]; // second structure claims 9 bytes, has 2
        let eir = EirData::decode(&raw);
        assert_eq!(eir.tx_power, Some(4));
        assert_eq!(eir.local_name, None);
    }

    #[test]
    fn merge_is_commutative_and_idempotent_without_conflicts() {
        let adv = EirData::decode(&[2, 0x01, 6, 3, 0x02, 0x09, 0x18]);
        let scan_rsp = EirData::decode(&[5, 0x09, 84, 104, 101, 114, 2, 0x0a, 0]);

        let mut ab = adv.clone();
        ab.update_from(&scan_rsp);
        let mut ba = scan_rsp.clone();
        ba.update_from(&adv);

        assert_eq!(ab, ba);
        assert_eq!(ab.present, adv.present | scan_rsp.present);

        // idempotent: merging again changes nothing
        let mut again = ab.clone();
        assert_eq!(again.update_from(&scan_rsp), EirFields::empty());
        assert_eq!(again, ab);
    }

    #[test]
    fn short_name_never_replaces_complete_name() {
        let mut complete = EirData::decode(&[5, 0x09, 84, 104, 101, 114]); // "Ther"
        let short = EirData::decode(&[3, 0x08, 84, 104]); // "Th"
        assert_eq!(complete.update_from(&short), EirFields::empty());
        assert_eq!(complete.local_name.as_deref(), Some("Ther"));
        assert!(complete.present.contains(EirFields::NAME_SHORT));

        let mut short_first = EirData::decode(&[3, 0x08, 84, 104]);
        let full = EirData::decode(&[5, 0x09, 84, 104, 101, 114]);
        assert_eq!(short_first.update_from(&full), EirFields::NAME);
        assert_eq!(short_first.local_name.as_deref(), Some("Ther"));
    }

    #[test]
    fn rssi_updates_are_flagged() {
        let mut eir = EirData::default();
        let mut report = EirData::default();
        report.set_rssi(-60);
        assert_eq!(eir.update_from(&report), EirFields::RSSI);
        assert_eq!(eir.update_from(&report), EirFields::empty());
        report.set_rssi(-70);
        assert_eq!(eir.update_from(&report), EirFields::RSSI);
    }
}
