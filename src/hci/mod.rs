// rawble Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! The HCI command/event engine.
//!
//! One [`HciHandler`] owns a raw HCI socket bound to a controller, a reader
//! thread decoding controller events, a bounded reply ring that command
//! submitters block on, and a dispatcher thread fanning events out to
//! listeners outside the reader's critical path.
//!
//! Synchronous request/reply over the asynchronous event bus works like
//! this: submitters serialise per opcode group, write the command frame and
//! pull their matching `Command Complete`/`Command Status` off the reply
//! ring with a bounded predicate scan. Commands that complete through a
//! dedicated event (`LE Create Connection`, `Disconnect`, ...) wait for that
//! event the same way.

pub mod constants;
pub mod packet;

use crate::api::{AddressType, BDAddr, DeviceId, ListenerRegistry};
use crate::config::Config;
use crate::ring::{RingBuffer, RingError};
use crate::sock::{sys, ReadOutcome, Socket};
use crate::{Error, Result};
use bitflags::bitflags;
use bytes::{BufMut, BytesMut};
use constants::*;
use dashmap::DashMap;
use log::{debug, info, trace, warn};
use packet::{encode_command, HciEvent, LeConnectParams, LeConnectionInfo};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub use packet::AdvertisingInfo;

/// Reader poll tick; bounds how fast the reader observes shutdown.
const READER_TICK: Duration = Duration::from_millis(250);

/// Default host event mask plus the LE meta event.
const EVENT_MASK: [u8; 8] = [0xff, 0xff, 0xfb, 0xff, 0x07, 0xf8, 0xbf, 0x3d];
/// LE meta subevents 0x01..=0x0d.
const LE_EVENT_MASK: [u8; 8] = [0xff, 0x1f, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

/// Listener for decoded controller events, called from the dispatcher
/// thread.
pub trait HciEventListener: Send + Sync {
    fn on_event(&self, event: &HciEvent);
}

/// LE scan enable progression; transitions happen only inside
/// [`HciHandler::le_set_scan_enable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Off,
    Starting,
    On,
    Stopping,
}

bitflags! {
    /// Which capability groups completed their bring-up on this handler.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HciCaps: u8 {
        const INIT = 1 << 0;
        const SCAN = 1 << 1;
        const CONN = 1 << 2;
    }
}

/// Status and return parameters of an acknowledged command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub status: HciStatus,
    pub payload: Vec<u8>,
}

impl CommandReply {
    /// Maps a non-success status to the matching error kind.
    pub fn success(self) -> Result<Vec<u8>> {
        match self.status {
            HciStatus::Success => Ok(self.payload),
            HciStatus::UnknownHciCommand => Err(Error::UnknownCommand),
            status => Err(Error::InternalFailure(format!(
                "command failed: {:?}",
                status
            ))),
        }
    }
}

struct Inner {
    dev_id: u16,
    socket: Socket,
    reply_ring: RingBuffer<HciEvent>,
    dispatch_ring: RingBuffer<HciEvent>,
    closed: AtomicBool,
    /// One submission lock per opcode group (OGF range is 6 bits).
    cmd_locks: Vec<Mutex<()>>,
    scan_state: Mutex<ScanState>,
    le_features: Mutex<LeFeatures>,
    caps: Mutex<HciCaps>,
    cmd_complete_timeout: Duration,
    cmd_status_timeout: Duration,
    event_listeners: ListenerRegistry<dyn HciEventListener>,
    handle_listeners: DashMap<u16, Arc<ListenerRegistry<dyn HciEventListener>>>,
}

impl Inner {
    fn route(&self, event: HciEvent) {
        if event.is_reply() {
            self.push_overwriting(&self.reply_ring, event.clone(), "reply");
        }
        self.push_overwriting(&self.dispatch_ring, event, "dispatch");
    }

    /// Bounded put that drops the oldest element instead of blocking the
    /// reader thread.
    fn push_overwriting(&self, ring: &RingBuffer<HciEvent>, event: HciEvent, what: &str) {
        for _ in 0..2 {
            match ring.put_timeout(event.clone(), Duration::ZERO) {
                Ok(()) | Err(RingError::Interrupted) => return,
                Err(RingError::TimedOut) => {
                    if let Ok(dropped) = ring.get_timeout(Duration::ZERO) {
                        warn!(
                            "hci{}: {} ring full, dropping {:?}",
                            self.dev_id, what, dropped
                        );
                    }
                }
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reply_ring.interrupt_read();
        self.reply_ring.interrupt_write();
        self.dispatch_ring.interrupt_read();
        self.dispatch_ring.interrupt_write();
        self.socket.close();
    }
}

/// The per-controller HCI command/event engine.
pub struct HciHandler {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl HciHandler {
    /// Opens the raw HCI channel to controller `dev_id` and starts the
    /// reader and dispatcher threads.
    pub fn open(dev_id: u16, config: &Config) -> Result<HciHandler> {
        let socket = Socket::open(libc::AF_BLUETOOTH, libc::SOCK_RAW, sys::BTPROTO_HCI)?;
        socket.bind(&sys::sockaddr_hci {
            hci_family: libc::AF_BLUETOOTH as libc::sa_family_t,
            hci_dev: dev_id,
            hci_channel: sys::HCI_CHANNEL_RAW,
        })?;

        // Only event packets reach the reader.
        let mut filter = sys::hci_filter::default();
        filter.type_mask = 1 << HCI_EVENT_PKT;
        filter.event_mask[0] = (1 << EVT_DISCONN_COMPLETE)
            | (1 << EVT_ENCRYPT_CHANGE)
            | (1 << EVT_CMD_COMPLETE)
            | (1 << EVT_CMD_STATUS)
            | (1 << EVT_HARDWARE_ERROR);
        filter.event_mask[1] = 1 << (EVT_LE_META_EVENT - 32);
        socket.setsockopt(sys::SOL_HCI, sys::HCI_FILTER, &filter)?;

        let inner = Arc::new(Inner {
            dev_id,
            socket,
            reply_ring: RingBuffer::new(config.hci_ringsize),
            dispatch_ring: RingBuffer::new(config.hci_ringsize),
            closed: AtomicBool::new(false),
            cmd_locks: (0..64).map(|_| Mutex::new(())).collect(),
            scan_state: Mutex::new(ScanState::Off),
            le_features: Mutex::new(LeFeatures::empty()),
            caps: Mutex::new(HciCaps::empty()),
            cmd_complete_timeout: config.hci_cmd_complete_timeout,
            cmd_status_timeout: config.hci_cmd_status_timeout,
            event_listeners: ListenerRegistry::new(),
            handle_listeners: DashMap::new(),
        });

        let reader = {
            let inner = inner.clone();
            thread::Builder::new()
                .name(format!("hci{}-reader", dev_id))
                .spawn(move || reader_loop(inner))
                .map_err(Error::Io)?
        };
        let dispatcher = {
            let inner = inner.clone();
            thread::Builder::new()
                .name(format!("hci{}-dispatcher", dev_id))
                .spawn(move || dispatcher_loop(inner))
                .map_err(Error::Io)?
        };

        info!("hci{}: handler opened", dev_id);
        Ok(HciHandler {
            inner,
            threads: Mutex::new(vec![reader, dispatcher]),
        })
    }

    pub fn dev_id(&self) -> u16 {
        self.inner.dev_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn scan_state(&self) -> ScanState {
        *self.inner.scan_state.lock().unwrap()
    }

    pub fn le_features(&self) -> LeFeatures {
        *self.inner.le_features.lock().unwrap()
    }

    pub fn caps(&self) -> HciCaps {
        *self.inner.caps.lock().unwrap()
    }

    pub fn add_event_listener(&self, listener: Arc<dyn HciEventListener>) {
        self.inner.event_listeners.add(listener);
    }

    pub fn remove_event_listener(&self, listener: &Arc<dyn HciEventListener>) -> bool {
        self.inner.event_listeners.remove(listener)
    }

    /// Registers a listener for events carrying the given connection handle.
    pub fn add_handle_listener(&self, handle: u16, listener: Arc<dyn HciEventListener>) {
        self.inner
            .handle_listeners
            .entry(handle)
            .or_insert_with(|| Arc::new(ListenerRegistry::new()))
            .add(listener);
    }

    pub fn remove_handle_listener(
        &self,
        handle: u16,
        listener: &Arc<dyn HciEventListener>,
    ) -> bool {
        match self.inner.handle_listeners.get(&handle) {
            Some(registry) => registry.remove(listener),
            None => false,
        }
    }

    pub fn clear_handle_listeners(&self, handle: u16) {
        self.inner.handle_listeners.remove(&handle);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.is_closed() {
            Err(Error::closed("hci handler closed"))
        } else {
            Ok(())
        }
    }

    fn ring_err(&self, err: RingError, waited: Duration) -> Error {
        match err {
            RingError::TimedOut => Error::TimedOut(waited),
            RingError::Interrupted => {
                if self.inner.is_closed() {
                    Error::closed("hci handler closed")
                } else {
                    Error::Interrupted
                }
            }
        }
    }

    /// Drops replies left over from a timed-out predecessor of `opcode`.
    fn drain_stale(&self, opcode: CommandOpcode) {
        let want = opcode as u16;
        while let Ok(stale) = self.inner.reply_ring.get_until(
            |ev| {
                matches!(ev,
                    HciEvent::CommandComplete { opcode, .. }
                    | HciEvent::CommandStatus { opcode, .. } if *opcode == want)
            },
            true,
            Duration::ZERO,
        ) {
            debug!("hci{}: dropping late reply {:?}", self.inner.dev_id, stale);
        }
    }

    /// Submits `opcode` and blocks for its `Command Complete` or
    /// `Command Status` acknowledgement.
    ///
    /// Exactly one command per opcode group is in flight at any time;
    /// concurrent submitters of the same group queue on the group lock. A
    /// timeout leaves the handler open and the reply slot clean.
    pub fn send_command(&self, opcode: CommandOpcode, params: &[u8]) -> Result<CommandReply> {
        self.ensure_open()?;
        let _group = self.inner.cmd_locks[opcode.ogf() as usize].lock().unwrap();
        self.drain_stale(opcode);

        let frame = encode_command(opcode, params);
        trace!("hci{}: > {:?} ({} bytes)", self.inner.dev_id, opcode, frame.len());
        if let Err(err) = self.inner.socket.write_all(&frame) {
            if err.raw_os_error() == Some(libc::ENETDOWN) {
                return Err(Error::NotPowered);
            }
            warn!("hci{}: write failed, closing: {}", self.inner.dev_id, err);
            self.inner.shutdown();
            return Err(Error::Io(err));
        }

        let timeout = if opcode.expects_status() {
            self.inner.cmd_status_timeout
        } else {
            self.inner.cmd_complete_timeout
        };
        let want = opcode as u16;
        let reply = self.inner.reply_ring.get_until(
            |ev| {
                matches!(ev,
                    HciEvent::CommandComplete { opcode, .. }
                    | HciEvent::CommandStatus { opcode, .. } if *opcode == want)
            },
            true,
            timeout,
        );
        match reply {
            Ok(HciEvent::CommandComplete { status, payload, .. }) => {
                Ok(CommandReply { status, payload })
            }
            Ok(HciEvent::CommandStatus { status, .. }) => Ok(CommandReply {
                status,
                payload: Vec::new(),
            }),
            Ok(other) => Err(Error::InternalFailure(format!(
                "reply ring yielded {:?}",
                other
            ))),
            Err(err) => {
                if err == RingError::TimedOut {
                    warn!(
                        "hci{}: {:?} timed out after {:?}",
                        self.inner.dev_id, opcode, timeout
                    );
                }
                Err(self.ring_err(err, timeout))
            }
        }
    }

    /// Submits a status-acknowledged command and waits for its completion
    /// event as selected by `matcher`.
    pub fn send_with_reply<F>(
        &self,
        opcode: CommandOpcode,
        params: &[u8],
        timeout: Duration,
        matcher: F,
    ) -> Result<HciEvent>
    where
        F: FnMut(&HciEvent) -> bool,
    {
        let ack = self.send_command(opcode, params)?;
        ack.success()?;
        self.inner
            .reply_ring
            .get_until(matcher, true, timeout)
            .map_err(|err| self.ring_err(err, timeout))
    }

    // --- typed wrappers -------------------------------------------------

    pub fn reset(&self) -> Result<()> {
        self.send_command(CommandOpcode::Reset, &[])?.success()?;
        Ok(())
    }

    /// Bring-up: host and LE event masks plus the controller's LE feature
    /// bitset.
    pub fn initialize(&self) -> Result<()> {
        self.send_command(CommandOpcode::SetEventMask, &EVENT_MASK)?
            .success()?;
        self.send_command(CommandOpcode::LeSetEventMask, &LE_EVENT_MASK)?
            .success()?;
        let features = self.le_read_local_features()?;
        debug!("hci{}: LE features {:?}", self.inner.dev_id, features);
        self.inner.caps.lock().unwrap().insert(HciCaps::INIT);
        Ok(())
    }

    /// `{hci_version, hci_revision, lmp_version, manufacturer, lmp_subversion}`.
    pub fn read_local_version(&self) -> Result<(u8, u16, u8, u16, u16)> {
        let payload = self
            .send_command(CommandOpcode::ReadLocalVersion, &[])?
            .success()?;
        if payload.len() < 8 {
            return Err(Error::InternalFailure("short ReadLocalVersion reply".into()));
        }
        Ok((
            payload[0],
            u16::from_le_bytes([payload[1], payload[2]]),
            payload[3],
            u16::from_le_bytes([payload[4], payload[5]]),
            u16::from_le_bytes([payload[6], payload[7]]),
        ))
    }

    /// The controller's LMP feature pages (classic side).
    pub fn read_local_features(&self) -> Result<[u8; 8]> {
        let payload = self
            .send_command(CommandOpcode::ReadLocalFeatures, &[])?
            .success()?;
        payload
            .get(..8)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| Error::InternalFailure("short ReadLocalFeatures reply".into()))
    }

    pub fn read_bd_addr(&self) -> Result<BDAddr> {
        let payload = self.send_command(CommandOpcode::ReadBdAddr, &[])?.success()?;
        let bytes: [u8; 6] = payload
            .get(..6)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| Error::InternalFailure("short ReadBdAddr reply".into()))?;
        Ok(BDAddr::from_le_bytes(bytes))
    }

    pub fn le_read_local_features(&self) -> Result<LeFeatures> {
        let payload = self
            .send_command(CommandOpcode::LeReadLocalFeatures, &[])?
            .success()?;
        let bytes: [u8; 8] = payload
            .get(..8)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| Error::InternalFailure("short LE features reply".into()))?;
        let features = LeFeatures::from_bits_truncate(u64::from_le_bytes(bytes));
        *self.inner.le_features.lock().unwrap() = features;
        Ok(features)
    }

    pub fn read_rssi(&self, handle: u16) -> Result<i8> {
        let mut params = BytesMut::with_capacity(2);
        params.put_u16_le(handle);
        let payload = self.send_command(CommandOpcode::ReadRssi, &params)?.success()?;
        payload
            .get(2)
            .map(|v| *v as i8)
            .ok_or_else(|| Error::InternalFailure("short ReadRSSI reply".into()))
    }

    /// `scan_type`: 0 passive, 1 active. Units of 0.625 ms.
    pub fn le_set_scan_parameters(
        &self,
        scan_type: u8,
        interval: u16,
        window: u16,
        own_address_type: AddressType,
        filter_policy: u8,
    ) -> Result<()> {
        let mut params = BytesMut::with_capacity(7);
        params.put_u8(scan_type);
        params.put_u16_le(interval);
        params.put_u16_le(window);
        params.put_u8(match own_address_type {
            AddressType::LeRandom => 0x01,
            _ => 0x00,
        });
        params.put_u8(filter_policy);
        self.send_command(CommandOpcode::LeSetScanParameters, &params)?
            .success()?;
        Ok(())
    }

    /// Drives the scan state machine `off → starting → on → stopping → off`.
    /// The new state is committed only on the controller's confirmation.
    pub fn le_set_scan_enable(&self, enable: bool, filter_duplicates: bool) -> Result<()> {
        let previous = {
            let mut state = self.inner.scan_state.lock().unwrap();
            match (*state, enable) {
                (ScanState::On, true) | (ScanState::Off, false) => return Ok(()),
                _ => {}
            }
            let previous = *state;
            *state = if enable {
                ScanState::Starting
            } else {
                ScanState::Stopping
            };
            previous
        };

        let result = self
            .send_command(
                CommandOpcode::LeSetScanEnable,
                &[enable as u8, filter_duplicates as u8],
            )
            .and_then(CommandReply::success);

        let mut state = self.inner.scan_state.lock().unwrap();
        match result {
            Ok(_) => {
                *state = if enable { ScanState::On } else { ScanState::Off };
                if enable {
                    self.inner.caps.lock().unwrap().insert(HciCaps::SCAN);
                }
                Ok(())
            }
            Err(err) => {
                *state = previous;
                Err(err)
            }
        }
    }

    /// Updates the tracked scan state from an out-of-band confirmation
    /// (the kernel stopping scans around its own connection attempts).
    pub(crate) fn note_scan_state(&self, on: bool) {
        let mut state = self.inner.scan_state.lock().unwrap();
        *state = if on { ScanState::On } else { ScanState::Off };
    }

    /// Issues `LE Create Connection` and blocks until the matching
    /// connection-complete event.
    pub fn le_create_connection(
        &self,
        peer: DeviceId,
        params: &LeConnectParams,
    ) -> Result<LeConnectionInfo> {
        let body = packet::encode_le_create_connection(params, peer.address_type, peer.address);
        let timeout = self.inner.cmd_complete_timeout;
        let event = self.send_with_reply(
            CommandOpcode::LeCreateConnection,
            &body,
            timeout,
            move |ev| match ev {
                HciEvent::LeConnectionComplete(info) => {
                    params_match_peer(info, &peer)
                }
                _ => false,
            },
        )?;
        match event {
            HciEvent::LeConnectionComplete(info) if info.status.is_success() => {
                self.inner.caps.lock().unwrap().insert(HciCaps::CONN);
                Ok(info)
            }
            HciEvent::LeConnectionComplete(info) => Err(Error::ConnectionFailed(info.status)),
            other => Err(Error::InternalFailure(format!(
                "unexpected completion {:?}",
                other
            ))),
        }
    }

    pub fn le_create_connection_cancel(&self) -> Result<()> {
        self.send_command(CommandOpcode::LeCreateConnectionCancel, &[])?
            .success()?;
        Ok(())
    }

    /// Disconnects and waits for the controller's Disconnection Complete.
    pub fn disconnect(&self, handle: u16, reason: HciStatus) -> Result<HciStatus> {
        let mut params = BytesMut::with_capacity(3);
        params.put_u16_le(handle);
        params.put_u8(reason as u8);
        let timeout = self.inner.cmd_status_timeout;
        let event = self.send_with_reply(
            CommandOpcode::Disconnect,
            &params,
            timeout,
            move |ev| matches!(ev, HciEvent::DisconnectComplete { handle: h, .. } if *h == handle),
        )?;
        match event {
            HciEvent::DisconnectComplete { reason, .. } => Ok(reason),
            other => Err(Error::InternalFailure(format!(
                "unexpected completion {:?}",
                other
            ))),
        }
    }

    /// Starts LE link-layer encryption with a distributed LTK; resolves on
    /// the Encryption Change event.
    pub fn le_start_encryption(
        &self,
        handle: u16,
        rand: u64,
        ediv: u16,
        ltk: &[u8; 16],
    ) -> Result<bool> {
        let mut params = BytesMut::with_capacity(28);
        params.put_u16_le(handle);
        params.put_u64_le(rand);
        params.put_u16_le(ediv);
        params.put_slice(ltk);
        let timeout = self.inner.cmd_complete_timeout;
        let event = self.send_with_reply(
            CommandOpcode::LeStartEncryption,
            &params,
            timeout,
            move |ev| matches!(ev, HciEvent::EncryptionChange { handle: h, .. } if *h == handle),
        )?;
        match event {
            HciEvent::EncryptionChange {
                status, encrypted, ..
            } => {
                if status.is_success() {
                    Ok(encrypted)
                } else {
                    Err(Error::ConnectionFailed(status))
                }
            }
            other => Err(Error::InternalFailure(format!(
                "unexpected completion {:?}",
                other
            ))),
        }
    }

    /// Requests new connection parameters; resolves on the update-complete
    /// event.
    pub fn le_connection_update(
        &self,
        handle: u16,
        interval_min: u16,
        interval_max: u16,
        latency: u16,
        supervision_timeout: u16,
    ) -> Result<()> {
        let mut params = BytesMut::with_capacity(14);
        params.put_u16_le(handle);
        params.put_u16_le(interval_min);
        params.put_u16_le(interval_max);
        params.put_u16_le(latency);
        params.put_u16_le(supervision_timeout);
        params.put_u16_le(0x0001); // min CE length
        params.put_u16_le(0x0001); // max CE length
        let timeout = self.inner.cmd_complete_timeout;
        let event = self.send_with_reply(
            CommandOpcode::LeConnectionUpdate,
            &params,
            timeout,
            move |ev| {
                matches!(ev,
                    HciEvent::LeConnectionUpdateComplete { handle: h, .. } if *h == handle)
            },
        )?;
        match event {
            HciEvent::LeConnectionUpdateComplete { status, .. } if status.is_success() => Ok(()),
            HciEvent::LeConnectionUpdateComplete { status, .. } => {
                Err(Error::ConnectionFailed(status))
            }
            other => Err(Error::InternalFailure(format!(
                "unexpected completion {:?}",
                other
            ))),
        }
    }

    pub fn le_read_remote_features(&self, handle: u16) -> Result<LeFeatures> {
        let mut params = BytesMut::with_capacity(2);
        params.put_u16_le(handle);
        let timeout = self.inner.cmd_status_timeout;
        let event = self.send_with_reply(
            CommandOpcode::LeReadRemoteFeatures,
            &params,
            timeout,
            move |ev| {
                matches!(ev,
                    HciEvent::LeReadRemoteFeaturesComplete { handle: h, .. } if *h == handle)
            },
        )?;
        match event {
            HciEvent::LeReadRemoteFeaturesComplete { features, .. } => Ok(features),
            other => Err(Error::InternalFailure(format!(
                "unexpected completion {:?}",
                other
            ))),
        }
    }

    pub fn le_add_device_to_white_list(&self, peer: DeviceId) -> Result<()> {
        let mut params = BytesMut::with_capacity(7);
        params.put_u8(match peer.address_type {
            AddressType::LeRandom => 0x01,
            _ => 0x00,
        });
        params.put_slice(&peer.address.to_le_bytes());
        self.send_command(CommandOpcode::LeAddDeviceToWhiteList, &params)?
            .success()?;
        Ok(())
    }

    pub fn le_remove_device_from_white_list(&self, peer: DeviceId) -> Result<()> {
        let mut params = BytesMut::with_capacity(7);
        params.put_u8(match peer.address_type {
            AddressType::LeRandom => 0x01,
            _ => 0x00,
        });
        params.put_slice(&peer.address.to_le_bytes());
        self.send_command(CommandOpcode::LeRemoveDeviceFromWhiteList, &params)?
            .success()?;
        Ok(())
    }

    pub fn le_clear_white_list(&self) -> Result<()> {
        self.send_command(CommandOpcode::LeClearWhiteList, &[])?
            .success()?;
        Ok(())
    }

    /// Idempotent shutdown: interrupts the rings, closes the socket, joins
    /// both threads. Pending waiters return `IO_ERROR`.
    pub fn close(&self) {
        self.inner.shutdown();
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        self.inner.event_listeners.clear();
        self.inner.handle_listeners.clear();
        info!("hci{}: handler closed", self.inner.dev_id);
    }
}

impl Drop for HciHandler {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for HciHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HciHandler")
            .field("dev_id", &self.inner.dev_id)
            .field("closed", &self.inner.is_closed())
            .field("scan_state", &*self.inner.scan_state.lock().unwrap())
            .finish()
    }
}

fn params_match_peer(info: &LeConnectionInfo, peer: &DeviceId) -> bool {
    info.peer_address == peer.address && info.peer_address_type == peer.address_type
}

fn reader_loop(inner: Arc<Inner>) {
    let mut buf = [0u8; 1024];
    while !inner.is_closed() {
        match inner.socket.read(&mut buf, Some(READER_TICK)) {
            ReadOutcome::Data(n) => match HciEvent::decode(&buf[..n]) {
                Ok(event) => {
                    trace!("hci{}: < {:?}", inner.dev_id, event);
                    inner.route(event);
                }
                Err(err) => warn!(
                    "hci{}: dropping undecodable frame ({:?}): {:02x?}",
                    inner.dev_id,
                    err,
                    &buf[..n]
                ),
            },
            ReadOutcome::TimedOut | ReadOutcome::Interrupted => continue,
            ReadOutcome::Closed => {
                debug!("hci{}: socket closed, reader exiting", inner.dev_id);
                inner.shutdown();
                break;
            }
            ReadOutcome::Error(err) => {
                warn!("hci{}: read error, closing: {}", inner.dev_id, err);
                inner.shutdown();
                break;
            }
        }
    }
}

fn dispatcher_loop(inner: Arc<Inner>) {
    loop {
        let event = match inner.dispatch_ring.get() {
            Ok(event) => event,
            Err(_) => break,
        };
        for listener in inner.event_listeners.snapshot() {
            listener.on_event(&event);
        }
        if let Some(handle) = event.handle() {
            let registry = inner.handle_listeners.get(&handle).map(|r| r.clone());
            if let Some(registry) = registry {
                for listener in registry.snapshot() {
                    listener.on_event(&event);
                }
            }
        }
    }
    debug!("hci{}: dispatcher exiting", inner.dev_id);
}
