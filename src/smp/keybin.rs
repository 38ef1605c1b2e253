// rawble Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! On-disk persistence of distributed SMP keys, one fixed-size record per
//! peer.
//!
//! The record is written atomically (temp file + rename) and versioned; a
//! reader rejects any record whose version, size or trailer check does not
//! match. A valid record is all that is needed to take the pre-paired fast
//! path on the next connect.

use crate::api::{AddressType, BDAddr, DeviceId, IoCapability, SecurityLevel};
use crate::codec::{ByteReader, ByteWriter, CodecError};
use crate::{Error, Result};
use bitflags::bitflags;
use log::{debug, warn};
use static_assertions::const_assert_eq;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Alternating bit pattern plus the format revision.
pub const KEY_BIN_VERSION: u16 = 0b0101_0101_0101_0101 + 1;

/// Total record size on disk.
pub const KEY_BIN_SIZE: usize = 113;

const LTK_RECORD_SIZE: usize = 28;
const CSRK_RECORD_SIZE: usize = 17;

const_assert_eq!(
    KEY_BIN_SIZE,
    2 + 7 + 1 + 1 + 2 * LTK_RECORD_SIZE + 2 * CSRK_RECORD_SIZE + 8 + 4
);

bitflags! {
    /// Properties stored with each key record; a clear `VALID` bit marks an
    /// absent record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KeyProps: u8 {
        const VALID = 0x01;
        const AUTHENTICATED = 0x02;
        const SECURE_CONNECTION = 0x04;
    }
}

/// A distributed Long-Term Key with its encryption parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongTermKey {
    pub props: KeyProps,
    pub enc_size: u8,
    pub ediv: u16,
    pub rand: u64,
    pub ltk: [u8; 16],
}

impl LongTermKey {
    fn write(&self, w: &mut ByteWriter<'_>) -> std::result::Result<(), CodecError> {
        w.write_u8(self.props.bits())?;
        w.write_u8(self.enc_size)?;
        w.write_u16_le(self.ediv)?;
        w.write_u64_le(self.rand)?;
        w.write_slice(&self.ltk)
    }

    fn read(r: &mut ByteReader<'_>) -> std::result::Result<Option<LongTermKey>, CodecError> {
        let props = KeyProps::from_bits_truncate(r.read_u8()?);
        let key = LongTermKey {
            props,
            enc_size: r.read_u8()?,
            ediv: r.read_u16_le()?,
            rand: r.read_u64_le()?,
            ltk: r.read_array()?,
        };
        Ok(props.contains(KeyProps::VALID).then_some(key))
    }
}

/// A distributed Connection Signature Resolving Key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureKey {
    pub props: KeyProps,
    pub csrk: [u8; 16],
}

impl SignatureKey {
    fn write(&self, w: &mut ByteWriter<'_>) -> std::result::Result<(), CodecError> {
        w.write_u8(self.props.bits())?;
        w.write_slice(&self.csrk)
    }

    fn read(r: &mut ByteReader<'_>) -> std::result::Result<Option<SignatureKey>, CodecError> {
        let props = KeyProps::from_bits_truncate(r.read_u8()?);
        let key = SignatureKey {
            props,
            csrk: r.read_array()?,
        };
        Ok(props.contains(KeyProps::VALID).then_some(key))
    }
}

/// The persisted key set of one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmpKeyBin {
    pub peer: DeviceId,
    pub sec_level: SecurityLevel,
    pub io_cap: IoCapability,
    pub init_ltk: Option<LongTermKey>,
    pub resp_ltk: Option<LongTermKey>,
    pub init_csrk: Option<SignatureKey>,
    pub resp_csrk: Option<SignatureKey>,
    /// Seconds since the epoch at creation.
    pub created_at: u64,
}

impl SmpKeyBin {
    pub fn new(peer: DeviceId, sec_level: SecurityLevel, io_cap: IoCapability) -> SmpKeyBin {
        SmpKeyBin {
            peer,
            sec_level,
            io_cap,
            init_ltk: None,
            resp_ltk: None,
            init_csrk: None,
            resp_csrk: None,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    /// The key the controller needs for `LE Start Encryption` as initiator.
    pub fn encryption_key(&self) -> Option<LongTermKey> {
        // the responder-distributed LTK encrypts the link we initiate
        self.resp_ltk.or(self.init_ltk)
    }

    /// `bd_<AA_BB_CC_DD_EE_FF>_<type>-smpkey.bin`
    pub fn filename(peer: DeviceId) -> String {
        format!(
            "bd_{}_{}-smpkey.bin",
            peer.address.to_string_underscore(),
            peer.address_type.num()
        )
    }

    pub fn path(dir: &Path, peer: DeviceId) -> PathBuf {
        dir.join(Self::filename(peer))
    }

    pub fn encode(&self) -> [u8; KEY_BIN_SIZE] {
        let mut buf = [0u8; KEY_BIN_SIZE];
        let mut w = ByteWriter::new(&mut buf);
        w.write_u16_le(KEY_BIN_VERSION).expect("fixed frame");
        w.write_slice(&self.peer.address.into_inner()).expect("fixed frame");
        w.write_u8(self.peer.address_type.num()).expect("fixed frame");
        w.write_u8(self.sec_level as u8).expect("fixed frame");
        w.write_u8(self.io_cap as u8).expect("fixed frame");
        let absent_ltk = [0u8; LTK_RECORD_SIZE];
        match &self.init_ltk {
            Some(key) => key.write(&mut w).expect("fixed frame"),
            None => w.write_slice(&absent_ltk).expect("fixed frame"),
        }
        match &self.resp_ltk {
            Some(key) => key.write(&mut w).expect("fixed frame"),
            None => w.write_slice(&absent_ltk).expect("fixed frame"),
        }
        let absent_csrk = [0u8; CSRK_RECORD_SIZE];
        match &self.init_csrk {
            Some(key) => key.write(&mut w).expect("fixed frame"),
            None => w.write_slice(&absent_csrk).expect("fixed frame"),
        }
        match &self.resp_csrk {
            Some(key) => key.write(&mut w).expect("fixed frame"),
            None => w.write_slice(&absent_csrk).expect("fixed frame"),
        }
        w.write_u64_le(self.created_at).expect("fixed frame");
        let check = trailer_check(&buf[..KEY_BIN_SIZE - 4]);
        let mut w = ByteWriter::new(&mut buf[KEY_BIN_SIZE - 4..]);
        w.write_u32_le(check).expect("fixed frame");
        buf
    }

    pub fn decode(data: &[u8]) -> Result<SmpKeyBin> {
        if data.len() != KEY_BIN_SIZE {
            return Err(Error::InvalidArgument(format!(
                "key bin has {} bytes, expected {}",
                data.len(),
                KEY_BIN_SIZE
            )));
        }
        let mut r = ByteReader::new(data);
        let version = r.read_u16_le().map_err(codec_err)?;
        if version != KEY_BIN_VERSION {
            return Err(Error::InvalidArgument(format!(
                "key bin version {:#06x}, expected {:#06x}",
                version, KEY_BIN_VERSION
            )));
        }
        let address = BDAddr::from(r.read_array::<6>().map_err(codec_err)?);
        let address_type = AddressType::from_u8(r.read_u8().map_err(codec_err)?);
        let sec_level = SecurityLevel::from_u8(r.read_u8().map_err(codec_err)?);
        let io_cap = IoCapability::from_u8(r.read_u8().map_err(codec_err)?)
            .unwrap_or(IoCapability::NoInputNoOutput);
        let init_ltk = LongTermKey::read(&mut r).map_err(codec_err)?;
        let resp_ltk = LongTermKey::read(&mut r).map_err(codec_err)?;
        let init_csrk = SignatureKey::read(&mut r).map_err(codec_err)?;
        let resp_csrk = SignatureKey::read(&mut r).map_err(codec_err)?;
        let created_at = r.read_u64_le().map_err(codec_err)?;
        let stored_check = r.read_u32_le().map_err(codec_err)?;
        let check = trailer_check(&data[..KEY_BIN_SIZE - 4]);
        if stored_check != check {
            return Err(Error::InvalidArgument(format!(
                "key bin check {:#010x}, expected {:#010x}",
                stored_check, check
            )));
        }
        Ok(SmpKeyBin {
            peer: DeviceId::new(address, address_type),
            sec_level,
            io_cap,
            init_ltk,
            resp_ltk,
            init_csrk,
            resp_csrk,
            created_at,
        })
    }

    /// Atomically writes the record into `dir`, returning the final path.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = Self::path(dir, self.peer);
        let tmp = path.with_extension("bin.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&self.encode())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        debug!("smpkeybin: wrote {}", path.display());
        Ok(path)
    }

    pub fn read_from(path: &Path) -> Result<SmpKeyBin> {
        let data = fs::read(path)?;
        SmpKeyBin::decode(&data)
    }

    /// Loads the record for `peer` from `dir`, if one exists and is valid.
    pub fn load(dir: &Path, peer: DeviceId) -> Option<SmpKeyBin> {
        let path = Self::path(dir, peer);
        if !path.exists() {
            return None;
        }
        match SmpKeyBin::read_from(&path) {
            Ok(bin) if bin.peer == peer => Some(bin),
            Ok(bin) => {
                warn!(
                    "smpkeybin: {} holds keys for {}, ignoring",
                    path.display(),
                    bin.peer
                );
                None
            }
            Err(err) => {
                warn!("smpkeybin: rejecting {}: {}", path.display(), err);
                None
            }
        }
    }

    pub fn remove(dir: &Path, peer: DeviceId) -> bool {
        let path = Self::path(dir, peer);
        fs::remove_file(&path).is_ok()
    }
}

fn codec_err(err: CodecError) -> Error {
    Error::InvalidArgument(format!("malformed key bin: {}", err))
}

/// Size-and-sum trailer: record size in the low half, a byte sum of the
/// preceding payload in the high half.
fn trailer_check(payload: &[u8]) -> u32 {
    let sum: u16 = payload
        .iter()
        .fold(0u16, |acc, b| acc.wrapping_add(*b as u16));
    (KEY_BIN_SIZE as u32) | ((sum as u32) << 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_peer() -> DeviceId {
        DeviceId::new(
            "C0:26:DA:01:DA:B1".parse().unwrap(),
            AddressType::LePublic,
        )
    }

    fn sample_bin() -> SmpKeyBin {
        let mut bin = SmpKeyBin::new(
            sample_peer(),
            SecurityLevel::Encrypted,
            IoCapability::NoInputNoOutput,
        );
        bin.resp_ltk = Some(LongTermKey {
            props: KeyProps::VALID,
            enc_size: 16,
            ediv: 0x4321,
            rand: 0x1122334455667788,
            ltk: [0x42; 16],
        });
        bin.init_csrk = Some(SignatureKey {
            props: KeyProps::VALID | KeyProps::AUTHENTICATED,
            csrk: [0x24; 16],
        });
        bin
    }

    #[test]
    fn encode_layout_offsets() {
        let bin = sample_bin();
        let data = bin.encode();
        assert_eq!(data.len(), KEY_BIN_SIZE);
        // version magic
        assert_eq!(u16::from_le_bytes([data[0], data[1]]), KEY_BIN_VERSION);
        // address printable-order bytes at offset 2, type at 8
        assert_eq!(&data[2..8], &[0xc0, 0x26, 0xda, 0x01, 0xda, 0xb1]);
        assert_eq!(data[8], 0x01);
        assert_eq!(data[9], SecurityLevel::Encrypted as u8);
        assert_eq!(data[10], IoCapability::NoInputNoOutput as u8);
        // absent initiator LTK is zeroed
        assert!(data[11..11 + 28].iter().all(|b| *b == 0));
        // responder LTK record starts at 39 with its props byte
        assert_eq!(data[39], KeyProps::VALID.bits());
        assert_eq!(data[40], 16);
        assert_eq!(u16::from_le_bytes([data[41], data[42]]), 0x4321);
        // size half of the trailer
        assert_eq!(
            u16::from_le_bytes([data[109], data[110]]),
            KEY_BIN_SIZE as u16
        );
    }

    #[test]
    fn roundtrip() {
        let bin = sample_bin();
        let decoded = SmpKeyBin::decode(&bin.encode()).unwrap();
        assert_eq!(decoded, bin);
        assert_eq!(decoded.encryption_key(), bin.resp_ltk);
    }

    #[test]
    fn version_mismatch_rejected() {
        let bin = sample_bin();
        let mut data = bin.encode();
        data[0] ^= 0xff;
        assert!(matches!(
            SmpKeyBin::decode(&data),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn corruption_rejected_by_trailer() {
        let bin = sample_bin();
        let mut data = bin.encode();
        data[50] ^= 0x01;
        assert!(matches!(
            SmpKeyBin::decode(&data),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn truncated_rejected() {
        let bin = sample_bin();
        let data = bin.encode();
        assert!(SmpKeyBin::decode(&data[..100]).is_err());
    }

    #[test]
    fn filename_convention() {
        assert_eq!(
            SmpKeyBin::filename(sample_peer()),
            "bd_C0_26_DA_01_DA_B1_1-smpkey.bin"
        );
    }

    #[test]
    fn write_read_cycle_and_load() {
        let dir = std::env::temp_dir().join(format!(
            "rawble-keybin-test-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let bin = sample_bin();
        let path = bin.write_to(&dir).unwrap();
        assert!(path.ends_with(SmpKeyBin::filename(sample_peer())));

        let loaded = SmpKeyBin::load(&dir, sample_peer()).unwrap();
        assert_eq!(loaded, bin);

        // unknown peer yields nothing
        let other = DeviceId::new("AA:BB:CC:DD:EE:FF".parse().unwrap(), AddressType::LePublic);
        assert!(SmpKeyBin::load(&dir, other).is_none());

        // a corrupted file is rejected on load
        let mut raw = fs::read(&path).unwrap();
        raw[60] ^= 0xff;
        fs::write(&path, &raw).unwrap();
        assert!(SmpKeyBin::load(&dir, sample_peer()).is_none());

        assert!(SmpKeyBin::remove(&dir, sample_peer()));
        let _ = fs::remove_dir_all(&dir);
    }
}
