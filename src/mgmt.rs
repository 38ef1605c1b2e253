// rawble Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! The kernel management (MGMT) channel: controller enumeration, settings
//! and bonding-state plumbing.
//!
//! One process-wide socket (HCI control channel, `HCI_DEV_NONE`) carries
//! commands and events framed as `{opcode_u16, index_u16, len_u16, payload}`
//! little-endian. The manager submits commands through the reply ring the
//! same way HCI commands work; events fan out to listeners per controller
//! index.

use crate::api::{AdapterSettings, AddressType, BDAddr, DeviceId, ListenerRegistry};
use crate::codec::{ByteReader, CodecError};
use crate::config::Config;
use crate::ring::{RingBuffer, RingError};
use crate::sock::{sys, ReadOutcome, Socket};
use crate::{Error, Result};
use bytes::{BufMut, BytesMut};
use log::{debug, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const INDEX_NONE: u16 = 0xffff;

// Commands.
pub const MGMT_OP_READ_VERSION: u16 = 0x0001;
pub const MGMT_OP_READ_INDEX_LIST: u16 = 0x0003;
pub const MGMT_OP_READ_INFO: u16 = 0x0004;
pub const MGMT_OP_SET_POWERED: u16 = 0x0005;
pub const MGMT_OP_SET_DISCOVERABLE: u16 = 0x0006;
pub const MGMT_OP_SET_CONNECTABLE: u16 = 0x0007;
pub const MGMT_OP_SET_BONDABLE: u16 = 0x0009;
pub const MGMT_OP_SET_LINK_SECURITY: u16 = 0x000a;
pub const MGMT_OP_SET_SSP: u16 = 0x000b;
pub const MGMT_OP_SET_HS: u16 = 0x000c;
pub const MGMT_OP_SET_LE: u16 = 0x000d;
pub const MGMT_OP_SET_BREDR: u16 = 0x002a;
pub const MGMT_OP_SET_LOCAL_NAME: u16 = 0x000f;
pub const MGMT_OP_LOAD_LONG_TERM_KEYS: u16 = 0x0013;
pub const MGMT_OP_DISCONNECT: u16 = 0x0014;
pub const MGMT_OP_SET_IO_CAPABILITY: u16 = 0x0018;
pub const MGMT_OP_PAIR_DEVICE: u16 = 0x0019;
pub const MGMT_OP_UNPAIR_DEVICE: u16 = 0x001b;
pub const MGMT_OP_START_DISCOVERY: u16 = 0x0023;
pub const MGMT_OP_STOP_DISCOVERY: u16 = 0x0024;
pub const MGMT_OP_ADD_DEVICE: u16 = 0x0033;
pub const MGMT_OP_REMOVE_DEVICE: u16 = 0x0034;

// Events.
pub const MGMT_EV_COMMAND_COMPLETE: u16 = 0x0001;
pub const MGMT_EV_COMMAND_STATUS: u16 = 0x0002;
pub const MGMT_EV_CONTROLLER_ERROR: u16 = 0x0003;
pub const MGMT_EV_INDEX_ADDED: u16 = 0x0004;
pub const MGMT_EV_INDEX_REMOVED: u16 = 0x0005;
pub const MGMT_EV_NEW_SETTINGS: u16 = 0x0006;
pub const MGMT_EV_NEW_LONG_TERM_KEY: u16 = 0x000a;
pub const MGMT_EV_DEVICE_CONNECTED: u16 = 0x000b;
pub const MGMT_EV_DEVICE_DISCONNECTED: u16 = 0x000c;
pub const MGMT_EV_CONNECT_FAILED: u16 = 0x000d;
pub const MGMT_EV_DEVICE_FOUND: u16 = 0x0012;
pub const MGMT_EV_DISCOVERING: u16 = 0x0013;
pub const MGMT_EV_DEVICE_UNPAIRED: u16 = 0x0016;

/// A long-term key announced by the kernel after pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MgmtLongTermKey {
    pub peer: DeviceId,
    pub key_type: u8,
    pub central: bool,
    pub enc_size: u8,
    pub ediv: u16,
    pub rand: u64,
    pub value: [u8; 16],
}

/// Controller facts from `READ_INFO`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MgmtAdapterInfo {
    pub address: BDAddr,
    pub version: u8,
    pub manufacturer: u16,
    pub supported_settings: AdapterSettings,
    pub current_settings: AdapterSettings,
    pub name: String,
    pub short_name: String,
}

/// One decoded MGMT event with its controller index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MgmtEvent {
    pub index: u16,
    pub kind: MgmtEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MgmtEventKind {
    CommandComplete {
        opcode: u16,
        status: u8,
        data: Vec<u8>,
    },
    CommandStatus {
        opcode: u16,
        status: u8,
    },
    ControllerError(u8),
    IndexAdded,
    IndexRemoved,
    NewSettings(AdapterSettings),
    NewLongTermKey {
        store_hint: bool,
        key: MgmtLongTermKey,
    },
    DeviceConnected {
        peer: DeviceId,
        flags: u32,
        eir: Vec<u8>,
    },
    DeviceDisconnected {
        peer: DeviceId,
        reason: u8,
    },
    ConnectFailed {
        peer: DeviceId,
        status: u8,
    },
    DeviceFound {
        peer: DeviceId,
        rssi: i8,
        flags: u32,
        eir: Vec<u8>,
    },
    Discovering {
        scan_type: u8,
        discovering: bool,
    },
    DeviceUnpaired {
        peer: DeviceId,
    },
    Unknown {
        event: u16,
        payload: Vec<u8>,
    },
}

fn read_device_id(r: &mut ByteReader<'_>) -> std::result::Result<DeviceId, CodecError> {
    let address = BDAddr::from_le_bytes(r.read_array()?);
    let address_type = AddressType::from_u8(r.read_u8()?);
    Ok(DeviceId::new(address, address_type))
}

impl MgmtEvent {
    /// Decodes one full `{event, index, len, payload}` frame.
    pub fn decode(frame: &[u8]) -> std::result::Result<MgmtEvent, CodecError> {
        let mut r = ByteReader::new(frame);
        let event = r.read_u16_le()?;
        let index = r.read_u16_le()?;
        let len = r.read_u16_le()? as usize;
        let payload = r.read_slice(len)?;
        let mut r = ByteReader::new(payload);

        let kind = match event {
            MGMT_EV_COMMAND_COMPLETE => MgmtEventKind::CommandComplete {
                opcode: r.read_u16_le()?,
                status: r.read_u8()?,
                data: r.take_rest().to_vec(),
            },
            MGMT_EV_COMMAND_STATUS => MgmtEventKind::CommandStatus {
                opcode: r.read_u16_le()?,
                status: r.read_u8()?,
            },
            MGMT_EV_CONTROLLER_ERROR => MgmtEventKind::ControllerError(r.read_u8()?),
            MGMT_EV_INDEX_ADDED => MgmtEventKind::IndexAdded,
            MGMT_EV_INDEX_REMOVED => MgmtEventKind::IndexRemoved,
            MGMT_EV_NEW_SETTINGS => {
                MgmtEventKind::NewSettings(AdapterSettings::from_bits_truncate(r.read_u32_le()?))
            }
            MGMT_EV_NEW_LONG_TERM_KEY => {
                let store_hint = r.read_u8()? != 0;
                let peer = read_device_id(&mut r)?;
                let key_type = r.read_u8()?;
                let central = r.read_u8()? != 0;
                let enc_size = r.read_u8()?;
                let ediv = r.read_u16_le()?;
                let rand = r.read_u64_le()?;
                let value = r.read_array()?;
                MgmtEventKind::NewLongTermKey {
                    store_hint,
                    key: MgmtLongTermKey {
                        peer,
                        key_type,
                        central,
                        enc_size,
                        ediv,
                        rand,
                        value,
                    },
                }
            }
            MGMT_EV_DEVICE_CONNECTED => {
                let peer = read_device_id(&mut r)?;
                let flags = r.read_u32_le()?;
                let eir_len = r.read_u16_le()? as usize;
                MgmtEventKind::DeviceConnected {
                    peer,
                    flags,
                    eir: r.read_slice(eir_len)?.to_vec(),
                }
            }
            MGMT_EV_DEVICE_DISCONNECTED => MgmtEventKind::DeviceDisconnected {
                peer: read_device_id(&mut r)?,
                reason: r.read_u8()?,
            },
            MGMT_EV_CONNECT_FAILED => MgmtEventKind::ConnectFailed {
                peer: read_device_id(&mut r)?,
                status: r.read_u8()?,
            },
            MGMT_EV_DEVICE_FOUND => {
                let peer = read_device_id(&mut r)?;
                let rssi = r.read_i8()?;
                let flags = r.read_u32_le()?;
                let eir_len = r.read_u16_le()? as usize;
                MgmtEventKind::DeviceFound {
                    peer,
                    rssi,
                    flags,
                    eir: r.read_slice(eir_len)?.to_vec(),
                }
            }
            MGMT_EV_DISCOVERING => MgmtEventKind::Discovering {
                scan_type: r.read_u8()?,
                discovering: r.read_u8()? != 0,
            },
            MGMT_EV_DEVICE_UNPAIRED => MgmtEventKind::DeviceUnpaired {
                peer: read_device_id(&mut r)?,
            },
            other => MgmtEventKind::Unknown {
                event: other,
                payload: r.take_rest().to_vec(),
            },
        };
        Ok(MgmtEvent { index, kind })
    }
}

/// Encodes a command frame.
pub fn encode_command(opcode: u16, index: u16, params: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(6 + params.len());
    buf.put_u16_le(opcode);
    buf.put_u16_le(index);
    buf.put_u16_le(params.len() as u16);
    buf.put_slice(params);
    buf
}

fn put_device_id(buf: &mut BytesMut, peer: DeviceId) {
    buf.put_slice(&peer.address.to_le_bytes());
    buf.put_u8(peer.address_type.num());
}

/// Listener for decoded MGMT events, called from the channel's reader
/// thread.
pub trait MgmtEventListener: Send + Sync {
    fn on_event(&self, event: &MgmtEvent);
}

const MGMT_READER_TICK: Duration = Duration::from_millis(250);

struct MgmtInner {
    socket: Socket,
    reply_ring: RingBuffer<MgmtEvent>,
    listeners: ListenerRegistry<dyn MgmtEventListener>,
    closed: AtomicBool,
}

impl MgmtInner {
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reply_ring.interrupt_read();
        self.reply_ring.interrupt_write();
        self.socket.close();
    }
}

/// The process-wide MGMT socket with its reader thread and reply ring.
pub struct MgmtChannel {
    inner: Arc<MgmtInner>,
    cmd_lock: Mutex<()>,
    cmd_timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl MgmtChannel {
    /// Opens the control channel (`HCI_DEV_NONE`).
    pub fn open(config: &Config) -> Result<MgmtChannel> {
        let socket = Socket::open(libc::AF_BLUETOOTH, libc::SOCK_RAW, sys::BTPROTO_HCI)?;
        socket.bind(&sys::sockaddr_hci {
            hci_family: libc::AF_BLUETOOTH as libc::sa_family_t,
            hci_dev: sys::HCI_DEV_NONE,
            hci_channel: sys::HCI_CHANNEL_CONTROL,
        })?;

        let inner = Arc::new(MgmtInner {
            socket,
            reply_ring: RingBuffer::new(config.mgmt_ringsize),
            listeners: ListenerRegistry::new(),
            closed: AtomicBool::new(false),
        });
        let reader = {
            let inner = inner.clone();
            thread::Builder::new()
                .name("mgmt-reader".into())
                .spawn(move || reader_loop(inner))
                .map_err(Error::Io)?
        };
        info!("mgmt: channel open");
        Ok(MgmtChannel {
            inner,
            cmd_lock: Mutex::new(()),
            cmd_timeout: config.mgmt_cmd_timeout,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn MgmtEventListener>) {
        self.inner.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn MgmtEventListener>) -> bool {
        self.inner.listeners.remove(listener)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Submits a command and blocks for its completion, bounded by
    /// `mgmt.cmd.timeout`.
    pub fn send_command(&self, opcode: u16, index: u16, params: &[u8]) -> Result<Vec<u8>> {
        if self.is_closed() {
            return Err(Error::closed("mgmt channel closed"));
        }
        let _serialised = self.cmd_lock.lock().unwrap();
        let frame = encode_command(opcode, index, params);
        trace!("mgmt: > opcode {:#06x} index {}", opcode, index);
        if let Err(err) = self.inner.socket.write_all(&frame) {
            warn!("mgmt: write failed, closing: {}", err);
            self.inner.shutdown();
            return Err(Error::Io(err));
        }
        let reply = self.inner.reply_ring.get_until(
            |ev| {
                ev.index == index
                    && matches!(ev.kind,
                        MgmtEventKind::CommandComplete { opcode: op, .. }
                        | MgmtEventKind::CommandStatus { opcode: op, .. } if op == opcode)
            },
            true,
            self.cmd_timeout,
        );
        match reply {
            Ok(MgmtEvent {
                kind: MgmtEventKind::CommandComplete { status: 0, data, .. },
                ..
            }) => Ok(data),
            Ok(MgmtEvent {
                kind:
                    MgmtEventKind::CommandComplete { status, .. }
                    | MgmtEventKind::CommandStatus { status, .. },
                ..
            }) => Err(mgmt_status_error(status)),
            Ok(other) => Err(Error::InternalFailure(format!(
                "mgmt reply ring yielded {:?}",
                other
            ))),
            Err(RingError::TimedOut) => Err(Error::TimedOut(self.cmd_timeout)),
            Err(RingError::Interrupted) => Err(Error::closed("mgmt channel closed")),
        }
    }

    // --- typed wrappers -------------------------------------------------

    pub fn read_index_list(&self) -> Result<Vec<u16>> {
        let data = self.send_command(MGMT_OP_READ_INDEX_LIST, INDEX_NONE, &[])?;
        let mut r = ByteReader::new(&data);
        let count = r.read_u16_le().map_err(codec_err)? as usize;
        let mut indexes = Vec::with_capacity(count);
        for _ in 0..count {
            indexes.push(r.read_u16_le().map_err(codec_err)?);
        }
        Ok(indexes)
    }

    pub fn read_info(&self, index: u16) -> Result<MgmtAdapterInfo> {
        let data = self.send_command(MGMT_OP_READ_INFO, index, &[])?;
        let mut r = ByteReader::new(&data);
        let address = BDAddr::from_le_bytes(r.read_array().map_err(codec_err)?);
        let version = r.read_u8().map_err(codec_err)?;
        let manufacturer = r.read_u16_le().map_err(codec_err)?;
        let supported = AdapterSettings::from_bits_truncate(r.read_u32_le().map_err(codec_err)?);
        let current = AdapterSettings::from_bits_truncate(r.read_u32_le().map_err(codec_err)?);
        let _dev_class = r.read_array::<3>().map_err(codec_err)?;
        let name_bytes = r.read_slice(249.min(r.remaining())).map_err(codec_err)?;
        let name = c_string(name_bytes);
        let short_name = c_string(r.rest());
        Ok(MgmtAdapterInfo {
            address,
            version,
            manufacturer,
            supported_settings: supported,
            current_settings: current,
            name,
            short_name,
        })
    }

    fn set_mode(&self, opcode: u16, index: u16, on: bool) -> Result<AdapterSettings> {
        let data = self.send_command(opcode, index, &[on as u8])?;
        let mut r = ByteReader::new(&data);
        Ok(AdapterSettings::from_bits_truncate(
            r.read_u32_le().map_err(codec_err)?,
        ))
    }

    pub fn set_powered(&self, index: u16, on: bool) -> Result<AdapterSettings> {
        self.set_mode(MGMT_OP_SET_POWERED, index, on)
    }

    pub fn set_connectable(&self, index: u16, on: bool) -> Result<AdapterSettings> {
        self.set_mode(MGMT_OP_SET_CONNECTABLE, index, on)
    }

    pub fn set_bondable(&self, index: u16, on: bool) -> Result<AdapterSettings> {
        self.set_mode(MGMT_OP_SET_BONDABLE, index, on)
    }

    pub fn set_ssp(&self, index: u16, on: bool) -> Result<AdapterSettings> {
        self.set_mode(MGMT_OP_SET_SSP, index, on)
    }

    pub fn set_le(&self, index: u16, on: bool) -> Result<AdapterSettings> {
        self.set_mode(MGMT_OP_SET_LE, index, on)
    }

    pub fn set_bredr(&self, index: u16, on: bool) -> Result<AdapterSettings> {
        self.set_mode(MGMT_OP_SET_BREDR, index, on)
    }

    pub fn set_io_capability(&self, index: u16, io_cap: u8) -> Result<()> {
        self.send_command(MGMT_OP_SET_IO_CAPABILITY, index, &[io_cap])?;
        Ok(())
    }

    pub fn disconnect(&self, index: u16, peer: DeviceId) -> Result<()> {
        let mut params = BytesMut::with_capacity(7);
        put_device_id(&mut params, peer);
        self.send_command(MGMT_OP_DISCONNECT, index, &params)?;
        Ok(())
    }

    pub fn unpair_device(&self, index: u16, peer: DeviceId) -> Result<()> {
        let mut params = BytesMut::with_capacity(8);
        put_device_id(&mut params, peer);
        params.put_u8(1); // disconnect if connected
        self.send_command(MGMT_OP_UNPAIR_DEVICE, index, &params)
            .map_err(|err| match err {
                Error::TimedOut(t) => Error::TimedOut(t),
                _ => Error::UnpairFailed,
            })?;
        Ok(())
    }

    /// `action`: 0 background-scan, 1 allow-incoming, 2 auto-connect.
    pub fn add_device(&self, index: u16, peer: DeviceId, action: u8) -> Result<()> {
        let mut params = BytesMut::with_capacity(8);
        put_device_id(&mut params, peer);
        params.put_u8(action);
        self.send_command(MGMT_OP_ADD_DEVICE, index, &params)?;
        Ok(())
    }

    pub fn remove_device(&self, index: u16, peer: DeviceId) -> Result<()> {
        let mut params = BytesMut::with_capacity(7);
        put_device_id(&mut params, peer);
        self.send_command(MGMT_OP_REMOVE_DEVICE, index, &params)?;
        Ok(())
    }

    /// Hands persisted LTKs to the kernel so its SMP layer can resume
    /// encrypted sessions.
    pub fn load_long_term_keys(&self, index: u16, keys: &[MgmtLongTermKey]) -> Result<()> {
        let mut params = BytesMut::with_capacity(2 + keys.len() * 36);
        params.put_u16_le(keys.len() as u16);
        for key in keys {
            put_device_id(&mut params, key.peer);
            params.put_u8(key.key_type);
            params.put_u8(key.central as u8);
            params.put_u8(key.enc_size);
            params.put_u16_le(key.ediv);
            params.put_u64_le(key.rand);
            params.put_slice(&key.value);
        }
        self.send_command(MGMT_OP_LOAD_LONG_TERM_KEYS, index, &params)?;
        Ok(())
    }

    /// Idempotent shutdown; wakes pending submitters with `IO_ERROR`.
    pub fn close(&self) {
        self.inner.shutdown();
        if let Some(handle) = self.reader.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.inner.listeners.clear();
        info!("mgmt: channel closed");
    }
}

impl Drop for MgmtChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn reader_loop(inner: Arc<MgmtInner>) {
    let mut buf = [0u8; 1024];
    while !inner.closed.load(Ordering::SeqCst) {
        match inner.socket.read(&mut buf, Some(MGMT_READER_TICK)) {
            ReadOutcome::Data(n) => match MgmtEvent::decode(&buf[..n]) {
                Ok(event) => {
                    trace!("mgmt: < {:?}", event);
                    let is_reply = matches!(
                        event.kind,
                        MgmtEventKind::CommandComplete { .. } | MgmtEventKind::CommandStatus { .. }
                    );
                    if is_reply {
                        // drop-oldest keeps the reader from ever blocking
                        if inner
                            .reply_ring
                            .put_timeout(event.clone(), Duration::ZERO)
                            .is_err()
                        {
                            if let Ok(dropped) = inner.reply_ring.get_timeout(Duration::ZERO) {
                                warn!("mgmt: reply ring full, dropping {:?}", dropped);
                            }
                            let _ = inner.reply_ring.put_timeout(event.clone(), Duration::ZERO);
                        }
                    }
                    for listener in inner.listeners.snapshot() {
                        listener.on_event(&event);
                    }
                }
                Err(err) => warn!(
                    "mgmt: dropping undecodable frame ({:?}): {:02x?}",
                    err,
                    &buf[..n]
                ),
            },
            ReadOutcome::TimedOut | ReadOutcome::Interrupted => continue,
            ReadOutcome::Closed => {
                debug!("mgmt: socket closed, reader exiting");
                inner.shutdown();
                break;
            }
            ReadOutcome::Error(err) => {
                warn!("mgmt: read error, closing: {}", err);
                inner.shutdown();
                break;
            }
        }
    }
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn codec_err(err: CodecError) -> Error {
    Error::InternalFailure(format!("malformed mgmt reply: {}", err))
}

/// MGMT status bytes that matter to callers; everything else is internal.
fn mgmt_status_error(status: u8) -> Error {
    match status {
        0x0c => Error::NotSupported("rejected by controller"),
        0x0d => Error::InvalidArgument("invalid mgmt parameters".into()),
        0x0f => Error::NotPowered,
        0x11 => Error::InvalidArgument("invalid controller index".into()),
        other => Error::InternalFailure(format!("mgmt status {:#04x}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_frame_layout() {
        let frame = encode_command(MGMT_OP_SET_POWERED, 0, &[1]);
        assert_eq!(&frame[..], &[0x05, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01]);
    }

    #[test]
    fn decode_new_settings() {
        // POWERED | LE on controller 0
        let frame = [0x06, 0x00, 0x00, 0x00, 0x04, 0x00, 0x01, 0x02, 0x00, 0x00];
        let event = MgmtEvent::decode(&frame).unwrap();
        assert_eq!(event.index, 0);
        assert_eq!(
            event.kind,
            MgmtEventKind::NewSettings(AdapterSettings::POWERED | AdapterSettings::LE)
        );
    }

    #[test]
    fn decode_command_complete() {
        // read index list reply: one controller, index 0
        let frame = [
            0x01, 0x00, 0xff, 0xff, 0x07, 0x00, 0x03, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00,
        ];
        let event = MgmtEvent::decode(&frame).unwrap();
        assert_eq!(event.index, INDEX_NONE);
        match event.kind {
            MgmtEventKind::CommandComplete {
                opcode,
                status,
                data,
            } => {
                assert_eq!(opcode, MGMT_OP_READ_INDEX_LIST);
                assert_eq!(status, 0);
                assert_eq!(data, vec![0x02, 0x00, 0x00, 0x00]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn decode_device_found() {
        let mut frame = vec![0x12, 0x00, 0x00, 0x00];
        let payload: Vec<u8> = {
            let mut p = vec![0xb1, 0xda, 0x01, 0xda, 0x26, 0xc0, 0x01]; // addr LE + type
            p.push(0xc2_u8); // rssi -62
            p.extend_from_slice(&[0, 0, 0, 0]); // flags
            p.extend_from_slice(&[0x03, 0x00]); // eir len
            p.extend_from_slice(&[0x02, 0x01, 0x06]); // flags AD structure
            p
        };
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(&payload);

        let event = MgmtEvent::decode(&frame).unwrap();
        match event.kind {
            MgmtEventKind::DeviceFound {
                peer, rssi, eir, ..
            } => {
                assert_eq!(peer.address, "C0:26:DA:01:DA:B1".parse().unwrap());
                assert_eq!(peer.address_type, AddressType::LePublic);
                assert_eq!(rssi, -62);
                assert_eq!(eir, vec![0x02, 0x01, 0x06]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn decode_discovering_and_disconnect() {
        let frame = [0x13, 0x00, 0x00, 0x00, 0x02, 0x00, 0x06, 0x01];
        assert_eq!(
            MgmtEvent::decode(&frame).unwrap().kind,
            MgmtEventKind::Discovering {
                scan_type: 6,
                discovering: true
            }
        );

        let frame = [
            0x0c, 0x00, 0x00, 0x00, 0x08, 0x00, 0xb1, 0xda, 0x01, 0xda, 0x26, 0xc0, 0x01, 0x03,
        ];
        match MgmtEvent::decode(&frame).unwrap().kind {
            MgmtEventKind::DeviceDisconnected { peer, reason } => {
                assert_eq!(peer.address_type, AddressType::LePublic);
                assert_eq!(reason, 0x03);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn truncated_event_rejected() {
        let frame = [0x06, 0x00, 0x00, 0x00, 0x04, 0x00, 0x01];
        assert_eq!(MgmtEvent::decode(&frame), Err(CodecError::Eof));
    }
}
