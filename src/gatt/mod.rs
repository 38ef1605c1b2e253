// rawble Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! The client-side GATT session: a single-outstanding ATT request pipeline
//! over one L2CAP pipe.
//!
//! One reader thread decodes inbound ATT PDUs. Responses complete the one
//! outstanding request through the reply ring; notifications and
//! indications go straight to characteristic listeners (indications are
//! confirmed with `HANDLE_VALUE_CFM` before dispatch). From a caller's
//! perspective submission order equals completion order, and a
//! server-initiated value never lands in the middle of that caller's own
//! round-trip.

use crate::api::bleuuid::{uuid_from_u16, WireUuid};
use crate::api::{
    now_millis, Characteristic, CharacteristicListener, CharPropFlags, Descriptor, DeviceId,
    ListenerRegistry, Service, CCCD_UUID16,
};
use crate::att::{
    AttErrorCode, AttPdu, GroupRecord, GATT_CHARACTERISTIC_UUID16, GATT_PRIMARY_SERVICE_UUID16,
};
use crate::codec::ByteReader;
use crate::config::Config;
use crate::hci::constants::HciStatus;
use crate::l2cap::Transport;
use crate::ring::{RingBuffer, RingError};
use crate::{Error, Result};
use dashmap::DashMap;
use log::{debug, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use uuid::Uuid;

/// ATT default MTU before (or without) an MTU exchange.
pub const ATT_DEFAULT_MTU: u16 = 23;
/// Upper bound we offer in the MTU exchange.
pub const ATT_MAX_MTU: u16 = 512;

/// CCCD bitmap bits.
pub const CCCD_NOTIFY: u16 = 0x0001;
pub const CCCD_INDICATE: u16 = 0x0002;

/// Callback into the security engine when the server demands a higher link
/// security level; returns true once security was raised and the failed
/// request may be retried.
pub type SecurityHook = Box<dyn Fn(AttErrorCode) -> bool + Send + Sync>;

struct GattInner {
    transport: Arc<dyn Transport>,
    peer: DeviceId,
    reply_ring: RingBuffer<AttPdu>,
    /// The single-outstanding request slot; callers serialise here.
    pipeline: Mutex<()>,
    closed: AtomicBool,
    disconnect_reason: Mutex<Option<HciStatus>>,
    /// Effective ATT MTU, `min(local, remote)` after the exchange.
    mtu: Mutex<u16>,
    mtu_exchanged: AtomicBool,
    services: Mutex<Vec<Service>>,
    char_listeners: DashMap<u16, Arc<ListenerRegistry<dyn CharacteristicListener>>>,
    /// Current CCCD bitmap per characteristic value handle.
    cccd_state: DashMap<u16, u16>,
    security_hook: Mutex<Option<SecurityHook>>,
    init_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    reader_timeout: Duration,
    restart_count: u32,
}

impl GattInner {
    fn lookup_characteristic(&self, value_handle: u16) -> Option<Characteristic> {
        let services = self.services.lock().unwrap();
        for service in services.iter() {
            for ch in &service.characteristics {
                if ch.value_handle == value_handle {
                    return Some(ch.clone());
                }
            }
        }
        None
    }

    /// Reader-side handling of one inbound PDU.
    fn handle_inbound(&self, pdu: AttPdu) {
        match pdu {
            AttPdu::HandleValueNtf { handle, value } => {
                self.dispatch_value(handle, &value, false);
            }
            AttPdu::HandleValueInd { handle, value } => {
                // auto-confirm before handing the value to listeners
                let confirmed = match self.transport.write(&AttPdu::HandleValueCfm.encode()) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!("gatt {}: indication confirm failed: {}", self.peer, err);
                        false
                    }
                };
                self.dispatch_value_confirmed(handle, &value, confirmed);
            }
            AttPdu::ExchangeMtuReq { mtu: client_mtu } => {
                // server-initiated exchange on a dual-role peer
                let ours = *self.mtu.lock().unwrap();
                let rsp = AttPdu::ExchangeMtuRsp { mtu: ours.max(ATT_DEFAULT_MTU) };
                if let Err(err) = self.transport.write(&rsp.encode()) {
                    warn!("gatt {}: MTU response failed: {}", self.peer, err);
                } else {
                    let mut mtu = self.mtu.lock().unwrap();
                    *mtu = (*mtu).min(client_mtu.max(ATT_DEFAULT_MTU));
                }
            }
            pdu if pdu.is_response() => {
                if self
                    .reply_ring
                    .put_timeout(pdu, Duration::ZERO)
                    .is_err()
                {
                    // no outstanding request and ring saturated: stale
                    if let Ok(stale) = self.reply_ring.get_timeout(Duration::ZERO) {
                        debug!("gatt {}: dropping stale response {:?}", self.peer, stale);
                    }
                }
            }
            other => {
                trace!("gatt {}: ignoring server PDU {:?}", self.peer, other);
            }
        }
    }

    fn dispatch_value(&self, handle: u16, value: &[u8], _indication: bool) {
        let ch = self.lookup_characteristic(handle).unwrap_or_else(|| {
            // value arrived before discovery; hand out a bare attribute
            Characteristic {
                decl_handle: 0,
                value_handle: handle,
                end_handle: handle,
                properties: CharPropFlags::NOTIFY,
                uuid: Uuid::nil(),
                descriptors: Vec::new(),
            }
        });
        if let Some(registry) = self.char_listeners.get(&handle).map(|r| r.clone()) {
            let t = now_millis();
            for listener in registry.snapshot() {
                listener.notification_received(&ch, value, t);
            }
        } else {
            trace!("gatt {}: unheard notification on {:#06x}", self.peer, handle);
        }
    }

    fn dispatch_value_confirmed(&self, handle: u16, value: &[u8], confirmed: bool) {
        let ch = self.lookup_characteristic(handle).unwrap_or_else(|| Characteristic {
            decl_handle: 0,
            value_handle: handle,
            end_handle: handle,
            properties: CharPropFlags::INDICATE,
            uuid: Uuid::nil(),
            descriptors: Vec::new(),
        });
        if let Some(registry) = self.char_listeners.get(&handle).map(|r| r.clone()) {
            let t = now_millis();
            for listener in registry.snapshot() {
                listener.indication_received(&ch, value, confirmed, t);
            }
        } else {
            trace!("gatt {}: unheard indication on {:#06x}", self.peer, handle);
        }
    }

    fn note_disconnect(&self, reason: HciStatus) {
        {
            let mut stored = self.disconnect_reason.lock().unwrap();
            stored.get_or_insert(reason);
        }
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.reply_ring.interrupt_read();
            self.reply_ring.interrupt_write();
            self.transport.close();
        }
    }

    fn disconnect_error(&self) -> Error {
        let reason = self
            .disconnect_reason
            .lock()
            .unwrap()
            .unwrap_or(HciStatus::ConnectionTimeout);
        Error::Disconnected(reason)
    }
}

/// The per-device GATT client session.
pub struct GattHandler {
    inner: Arc<GattInner>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl GattHandler {
    /// Starts a session (and its reader thread) on an open transport.
    pub fn new(transport: Arc<dyn Transport>, peer: DeviceId, config: &Config) -> GattHandler {
        let inner = Arc::new(GattInner {
            peer,
            reply_ring: RingBuffer::new(config.gatt_ringsize),
            pipeline: Mutex::new(()),
            closed: AtomicBool::new(false),
            disconnect_reason: Mutex::new(None),
            mtu: Mutex::new(ATT_DEFAULT_MTU),
            mtu_exchanged: AtomicBool::new(false),
            services: Mutex::new(Vec::new()),
            char_listeners: DashMap::new(),
            cccd_state: DashMap::new(),
            security_hook: Mutex::new(None),
            init_timeout: config.gatt_cmd_init_timeout,
            read_timeout: config.gatt_cmd_read_timeout,
            write_timeout: config.gatt_cmd_write_timeout,
            reader_timeout: config.l2cap_reader_timeout,
            restart_count: config.l2cap_restart_count,
            transport,
        });
        let reader = {
            let inner = inner.clone();
            thread::Builder::new()
                .name(format!("gatt-{}", peer.address))
                .spawn(move || reader_loop(inner))
                .expect("spawning gatt reader")
        };
        GattHandler {
            inner,
            reader: Mutex::new(Some(reader)),
        }
    }

    pub fn peer(&self) -> DeviceId {
        self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// The effective ATT MTU (23 until the exchange ran).
    pub fn mtu(&self) -> u16 {
        *self.inner.mtu.lock().unwrap()
    }

    /// The discovered attribute tree; empty before
    /// [`GattHandler::discover_services`].
    pub fn services(&self) -> Vec<Service> {
        self.inner.services.lock().unwrap().clone()
    }

    /// Installs the raise-security callback used on ATT security errors.
    pub fn set_security_hook(&self, hook: SecurityHook) {
        *self.inner.security_hook.lock().unwrap() = Some(hook);
    }

    pub fn add_characteristic_listener(
        &self,
        value_handle: u16,
        listener: Arc<dyn CharacteristicListener>,
    ) {
        self.inner
            .char_listeners
            .entry(value_handle)
            .or_insert_with(|| Arc::new(ListenerRegistry::new()))
            .add(listener);
    }

    pub fn remove_characteristic_listener(
        &self,
        value_handle: u16,
        listener: &Arc<dyn CharacteristicListener>,
    ) -> bool {
        match self.inner.char_listeners.get(&value_handle) {
            Some(registry) => registry.remove(listener),
            None => false,
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_closed() {
            Err(self.inner.disconnect_error())
        } else {
            Ok(())
        }
    }

    /// Sends one request and waits for the one response, pipeline slot held
    /// by the caller.
    fn send_and_wait_locked(&self, pdu: &AttPdu, timeout: Duration) -> Result<AttPdu> {
        // a reply to a timed-out predecessor is late: log and drop
        while let Ok(stale) = self.inner.reply_ring.get_timeout(Duration::ZERO) {
            debug!("gatt {}: dropping late reply {:?}", self.inner.peer, stale);
        }
        self.inner.transport.write(&pdu.encode()).map_err(|err| {
            if self.is_closed() {
                self.inner.disconnect_error()
            } else {
                err
            }
        })?;
        match self.inner.reply_ring.get_timeout(timeout) {
            Ok(rsp) => Ok(rsp),
            Err(RingError::TimedOut) => Err(Error::TimedOut(timeout)),
            Err(RingError::Interrupted) => Err(self.inner.disconnect_error()),
        }
    }

    fn exchange_mtu_locked(&self) -> Result<()> {
        if self.inner.mtu_exchanged.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let local = self.inner.transport.mtu().min(ATT_MAX_MTU).max(ATT_DEFAULT_MTU);
        let req = AttPdu::ExchangeMtuReq { mtu: local };
        match self.send_and_wait_locked(&req, self.inner.init_timeout) {
            Ok(AttPdu::ExchangeMtuRsp { mtu: remote }) => {
                let effective = local.min(remote.max(ATT_DEFAULT_MTU));
                *self.inner.mtu.lock().unwrap() = effective;
                info!(
                    "gatt {}: MTU {} (local {}, remote {})",
                    self.inner.peer, effective, local, remote
                );
                Ok(())
            }
            Ok(AttPdu::ErrorRsp { .. }) => {
                // server keeps the default; not an error
                debug!("gatt {}: MTU exchange rejected, staying at 23", self.inner.peer);
                Ok(())
            }
            Ok(other) => Err(Error::InternalFailure(format!(
                "unexpected MTU reply {:?}",
                other
            ))),
            Err(err) => Err(err),
        }
    }

    /// One pipelined request/response round-trip, MTU exchange folded in
    /// front of the first request.
    fn request_raw(&self, pdu: &AttPdu, timeout: Duration) -> Result<AttPdu> {
        self.ensure_connected()?;
        let _slot = self.inner.pipeline.lock().unwrap();
        self.exchange_mtu_locked()?;
        self.send_and_wait_locked(pdu, timeout)
    }

    /// Request with the one-shot security-raise retry on
    /// `INSUFFICIENT_AUTHENTICATION`/`INSUFFICIENT_ENCRYPTION`.
    fn request(&self, pdu: &AttPdu, timeout: Duration) -> Result<AttPdu> {
        match self.request_raw(pdu, timeout)? {
            AttPdu::ErrorRsp {
                code,
                handle,
                request_opcode,
            } if code.is_security_error() => {
                let raised = {
                    let hook = self.inner.security_hook.lock().unwrap();
                    hook.as_ref().map(|h| h(code)).unwrap_or(false)
                };
                if raised {
                    info!(
                        "gatt {}: security raised after {:?}, retrying opcode {:#04x}",
                        self.inner.peer, code, request_opcode
                    );
                    match self.request_raw(pdu, timeout)? {
                        AttPdu::ErrorRsp { code, handle, .. } => Err(att_error(code, handle)),
                        rsp => Ok(rsp),
                    }
                } else {
                    Err(att_error(code, handle))
                }
            }
            AttPdu::ErrorRsp { code, handle, .. } => Err(att_error(code, handle)),
            rsp => Ok(rsp),
        }
    }

    /// Runs (or re-runs) the MTU exchange eagerly.
    pub fn exchange_mtu(&self) -> Result<u16> {
        self.ensure_connected()?;
        let _slot = self.inner.pipeline.lock().unwrap();
        self.exchange_mtu_locked()?;
        Ok(*self.inner.mtu.lock().unwrap())
    }

    /// Discovers primary services with their characteristics and
    /// descriptors; stores and returns the tree.
    pub fn discover_services(&self) -> Result<Vec<Service>> {
        let mut services = self.discover_primary_services()?;
        for service in services.iter_mut() {
            service.characteristics = self.discover_characteristics(service)?;
            let count = service.characteristics.len();
            for idx in 0..count {
                let (value_handle, end_handle) = {
                    let ch = &service.characteristics[idx];
                    (ch.value_handle, ch.end_handle)
                };
                let descriptors = self.discover_descriptors(value_handle, end_handle)?;
                service.characteristics[idx].descriptors = descriptors;
            }
        }
        info!(
            "gatt {}: discovered {} services",
            self.inner.peer,
            services.len()
        );
        *self.inner.services.lock().unwrap() = services.clone();
        Ok(services)
    }

    fn discover_primary_services(&self) -> Result<Vec<Service>> {
        let mut services = Vec::new();
        let mut start = 0x0001u16;
        loop {
            let req = AttPdu::ReadByGroupTypeReq {
                start_handle: start,
                end_handle: 0xffff,
                group_type: WireUuid::U16(GATT_PRIMARY_SERVICE_UUID16),
            };
            let records = match self.request(&req, self.inner.init_timeout) {
                Ok(AttPdu::ReadByGroupTypeRsp { records }) => records,
                Ok(other) => {
                    return Err(Error::InternalFailure(format!(
                        "unexpected discovery reply {:?}",
                        other
                    )))
                }
                Err(Error::Att {
                    code: AttErrorCode::AttributeNotFound,
                    ..
                }) => break,
                Err(err) => return Err(err),
            };
            if records.is_empty() {
                break;
            }
            let mut last_end = start;
            for GroupRecord {
                start_handle,
                end_handle,
                value,
            } in records
            {
                let uuid = match group_value_uuid(&value) {
                    Some(uuid) => uuid,
                    None => {
                        warn!(
                            "gatt {}: service at {:#06x} with {}-byte UUID, skipping",
                            self.inner.peer,
                            start_handle,
                            value.len()
                        );
                        last_end = end_handle;
                        continue;
                    }
                };
                last_end = end_handle;
                services.push(Service {
                    uuid,
                    start_handle,
                    end_handle,
                    primary: true,
                    characteristics: Vec::new(),
                });
            }
            if last_end == 0xffff {
                break;
            }
            start = last_end + 1;
        }
        Ok(services)
    }

    fn discover_characteristics(&self, service: &Service) -> Result<Vec<Characteristic>> {
        let mut chars: Vec<Characteristic> = Vec::new();
        let mut start = service.start_handle;
        loop {
            let req = AttPdu::ReadByTypeReq {
                start_handle: start,
                end_handle: service.end_handle,
                attribute_type: WireUuid::U16(GATT_CHARACTERISTIC_UUID16),
            };
            let records = match self.request(&req, self.inner.init_timeout) {
                Ok(AttPdu::ReadByTypeRsp { records }) => records,
                Ok(other) => {
                    return Err(Error::InternalFailure(format!(
                        "unexpected discovery reply {:?}",
                        other
                    )))
                }
                Err(Error::Att {
                    code: AttErrorCode::AttributeNotFound,
                    ..
                }) => break,
                Err(err) => return Err(err),
            };
            if records.is_empty() {
                break;
            }
            let mut last_decl = start;
            for (decl_handle, value) in records {
                last_decl = decl_handle;
                let mut r = ByteReader::new(&value);
                let (properties, value_handle, uuid) = match (
                    r.read_u8(),
                    r.read_u16_le(),
                ) {
                    (Ok(props), Ok(vh)) => {
                        let uuid_len = r.remaining();
                        match WireUuid::read(&mut r, uuid_len) {
                            Ok(uuid) => (CharPropFlags::from_bits_truncate(props), vh, uuid),
                            Err(_) => {
                                warn!(
                                    "gatt {}: malformed characteristic at {:#06x}",
                                    self.inner.peer, decl_handle
                                );
                                continue;
                            }
                        }
                    }
                    _ => continue,
                };
                chars.push(Characteristic {
                    decl_handle,
                    value_handle,
                    end_handle: service.end_handle,
                    properties,
                    uuid: uuid.to_uuid(),
                    descriptors: Vec::new(),
                });
            }
            if last_decl >= service.end_handle {
                break;
            }
            start = last_decl + 1;
        }
        // each characteristic ends where the next declaration starts
        for idx in 0..chars.len() {
            chars[idx].end_handle = match chars.get(idx + 1) {
                Some(next) => next.decl_handle - 1,
                None => service.end_handle,
            };
        }
        Ok(chars)
    }

    fn discover_descriptors(&self, value_handle: u16, end_handle: u16) -> Result<Vec<Descriptor>> {
        let mut descriptors = Vec::new();
        if value_handle >= end_handle {
            return Ok(descriptors);
        }
        let mut start = value_handle + 1;
        while start <= end_handle {
            let req = AttPdu::FindInformationReq {
                start_handle: start,
                end_handle,
            };
            let data = match self.request(&req, self.inner.init_timeout) {
                Ok(AttPdu::FindInformationRsp { data }) => data,
                Ok(other) => {
                    return Err(Error::InternalFailure(format!(
                        "unexpected discovery reply {:?}",
                        other
                    )))
                }
                Err(Error::Att {
                    code: AttErrorCode::AttributeNotFound,
                    ..
                }) => break,
                Err(err) => return Err(err),
            };
            if data.is_empty() {
                break;
            }
            let mut last = start;
            for (handle, uuid) in data {
                last = handle;
                descriptors.push(Descriptor {
                    handle,
                    uuid: uuid.to_uuid(),
                    value: Vec::new(),
                });
            }
            if last >= end_handle {
                break;
            }
            start = last + 1;
        }
        Ok(descriptors)
    }

    /// Reads an attribute value, following up with a `READ_BLOB` loop when
    /// the first response fills the MTU.
    pub fn read_handle(&self, handle: u16) -> Result<Vec<u8>> {
        let rsp = self.request(&AttPdu::ReadReq { handle }, self.inner.read_timeout)?;
        let mut value = match rsp {
            AttPdu::ReadRsp { value } => value,
            other => {
                return Err(Error::InternalFailure(format!(
                    "unexpected read reply {:?}",
                    other
                )))
            }
        };
        let chunk = (self.mtu() - 1) as usize;
        if value.len() < chunk {
            return Ok(value);
        }
        loop {
            let offset = value.len() as u16;
            let rsp = self.request(
                &AttPdu::ReadBlobReq { handle, offset },
                self.inner.read_timeout,
            );
            match rsp {
                Ok(AttPdu::ReadBlobRsp { value: part }) => {
                    let done = part.len() < chunk;
                    value.extend_from_slice(&part);
                    if done {
                        return Ok(value);
                    }
                }
                Ok(other) => {
                    return Err(Error::InternalFailure(format!(
                        "unexpected blob reply {:?}",
                        other
                    )))
                }
                // a short value of exactly chunk size ends with this
                Err(Error::Att {
                    code: AttErrorCode::AttributeNotLong,
                    ..
                })
                | Err(Error::Att {
                    code: AttErrorCode::InvalidOffset,
                    ..
                }) => return Ok(value),
                Err(err) => return Err(err),
            }
        }
    }

    pub fn read_characteristic(&self, ch: &Characteristic) -> Result<Vec<u8>> {
        self.read_handle(ch.value_handle)
    }

    pub fn read_descriptor(&self, desc: &Descriptor) -> Result<Vec<u8>> {
        self.read_handle(desc.handle)
    }

    /// Writes a value, selecting `WRITE_REQ`/`WRITE_CMD` by the requested
    /// semantics, with the prepare/execute long-write path when the payload
    /// exceeds `MTU - 3`.
    pub fn write_handle(
        &self,
        handle: u16,
        value: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let max_short = (self.mtu() - 3) as usize;
        if !with_response {
            if value.len() > max_short {
                return Err(Error::InvalidArgument(format!(
                    "write-without-response of {} bytes exceeds MTU-3 ({})",
                    value.len(),
                    max_short
                )));
            }
            self.ensure_connected()?;
            let _slot = self.inner.pipeline.lock().unwrap();
            self.exchange_mtu_locked()?;
            return self.inner.transport.write(
                &AttPdu::WriteCmd {
                    handle,
                    value: value.to_vec(),
                }
                .encode(),
            );
        }

        if value.len() <= max_short {
            match self.request(
                &AttPdu::WriteReq {
                    handle,
                    value: value.to_vec(),
                },
                self.inner.write_timeout,
            )? {
                AttPdu::WriteRsp => Ok(()),
                other => Err(Error::InternalFailure(format!(
                    "unexpected write reply {:?}",
                    other
                ))),
            }
        } else {
            self.long_write(handle, value)
        }
    }

    fn long_write(&self, handle: u16, value: &[u8]) -> Result<()> {
        let chunk = (self.mtu() - 5) as usize;
        let mut offset = 0usize;
        while offset < value.len() {
            let end = (offset + chunk).min(value.len());
            let part = &value[offset..end];
            let rsp = self.request(
                &AttPdu::PrepareWriteReq {
                    handle,
                    offset: offset as u16,
                    value: part.to_vec(),
                },
                self.inner.write_timeout,
            )?;
            match rsp {
                AttPdu::PrepareWriteRsp { .. } => {}
                other => {
                    // roll the queue back before surfacing the failure
                    let _ = self.request(
                        &AttPdu::ExecuteWriteReq { execute: false },
                        self.inner.write_timeout,
                    );
                    return Err(Error::InternalFailure(format!(
                        "unexpected prepare reply {:?}",
                        other
                    )));
                }
            }
            offset = end;
        }
        match self.request(
            &AttPdu::ExecuteWriteReq { execute: true },
            self.inner.write_timeout,
        )? {
            AttPdu::ExecuteWriteRsp => Ok(()),
            other => Err(Error::InternalFailure(format!(
                "unexpected execute reply {:?}",
                other
            ))),
        }
    }

    pub fn write_characteristic(
        &self,
        ch: &Characteristic,
        value: &[u8],
        with_response: bool,
    ) -> Result<()> {
        if with_response && !ch.properties.contains(CharPropFlags::WRITE) {
            return Err(Error::NotSupported("characteristic is not writable"));
        }
        if !with_response
            && !ch
                .properties
                .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
        {
            return Err(Error::NotSupported(
                "characteristic does not accept write-without-response",
            ));
        }
        self.write_handle(ch.value_handle, value, with_response)
    }

    /// Writes the CCCD bitmap for a characteristic. Returns false without
    /// touching the wire when the requested state is already set.
    pub fn configure_cccd(&self, ch: &Characteristic, bits: u16) -> Result<bool> {
        if bits & CCCD_NOTIFY != 0 && !ch.properties.contains(CharPropFlags::NOTIFY) {
            return Err(Error::NotSupported("characteristic cannot notify"));
        }
        if bits & CCCD_INDICATE != 0 && !ch.properties.contains(CharPropFlags::INDICATE) {
            return Err(Error::NotSupported("characteristic cannot indicate"));
        }
        let cccd = ch
            .cccd()
            .ok_or(Error::NotSupported("characteristic has no CCCD"))?;

        let current = self
            .inner
            .cccd_state
            .get(&ch.value_handle)
            .map(|v| *v)
            .unwrap_or(0);
        if current == bits {
            debug!(
                "gatt {}: CCCD {:#06x} already {:#06x}",
                self.inner.peer, cccd.handle, bits
            );
            return Ok(false);
        }

        self.write_handle(cccd.handle, &bits.to_le_bytes(), true)?;
        self.inner.cccd_state.insert(ch.value_handle, bits);
        Ok(true)
    }

    pub fn enable_notifications(&self, ch: &Characteristic, enable: bool) -> Result<bool> {
        let current = self
            .inner
            .cccd_state
            .get(&ch.value_handle)
            .map(|v| *v)
            .unwrap_or(0);
        let bits = if enable {
            current | CCCD_NOTIFY
        } else {
            current & !CCCD_NOTIFY
        };
        self.configure_cccd(ch, bits)
    }

    pub fn enable_indications(&self, ch: &Characteristic, enable: bool) -> Result<bool> {
        let current = self
            .inner
            .cccd_state
            .get(&ch.value_handle)
            .map(|v| *v)
            .unwrap_or(0);
        let bits = if enable {
            current | CCCD_INDICATE
        } else {
            current & !CCCD_INDICATE
        };
        self.configure_cccd(ch, bits)
    }

    /// Best-effort liveness probe: a read on the first readable
    /// characteristic. An ATT-level error still proves the peer alive; only
    /// transport-level failures count as dead.
    pub fn ping(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let handle = {
            let services = self.inner.services.lock().unwrap();
            services
                .iter()
                .flat_map(|s| s.characteristics.iter())
                .find(|c| c.properties.contains(CharPropFlags::READ))
                .map(|c| c.value_handle)
        };
        let Some(handle) = handle else {
            // nothing readable; fall back to the transport state
            return !self.inner.transport.is_closed();
        };
        match self.request(&AttPdu::ReadReq { handle }, self.inner.read_timeout) {
            Ok(_) => true,
            Err(Error::Att { .. }) => true,
            Err(err) => {
                info!("gatt {}: ping failed: {}", self.inner.peer, err.kind());
                false
            }
        }
    }

    /// Fails in-flight and future operations with `DISCONNECTED(reason)`.
    pub fn connection_lost(&self, reason: HciStatus) {
        self.inner.note_disconnect(reason);
    }

    /// Local, orderly teardown.
    pub fn close(&self) {
        self.inner
            .note_disconnect(HciStatus::ConnectionTerminatedByLocalHost);
        if let Some(handle) = self.reader.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.inner.char_listeners.clear();
    }
}

impl Drop for GattHandler {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for GattHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GattHandler")
            .field("peer", &self.inner.peer)
            .field("mtu", &self.mtu())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn att_error(code: AttErrorCode, handle: u16) -> Error {
    match code {
        AttErrorCode::InsufficientAuthentication => Error::AuthenticationRequired,
        AttErrorCode::InsufficientEncryption => Error::EncryptionRequired,
        code => Error::Att { code, handle },
    }
}

/// Service UUID out of a `READ_BY_GROUP_TYPE_RSP` record value.
fn group_value_uuid(value: &[u8]) -> Option<Uuid> {
    let mut r = ByteReader::new(value);
    match value.len() {
        2 => r.read_u16_le().ok().map(uuid_from_u16),
        16 => WireUuid::read(&mut r, 16).ok().map(|u| u.to_uuid()),
        _ => None,
    }
}

fn reader_loop(inner: Arc<GattInner>) {
    let mut buf = vec![0u8; 1024];
    let mut restarts = 0u32;
    while !inner.closed.load(Ordering::SeqCst) {
        match inner.transport.read(&mut buf, inner.reader_timeout) {
            Ok(0) => continue,
            Ok(n) => {
                restarts = 0;
                match AttPdu::decode(&buf[..n]) {
                    Ok(pdu) => {
                        trace!("gatt {}: < {:?}", inner.peer, pdu);
                        inner.handle_inbound(pdu);
                    }
                    Err(err) => warn!(
                        "gatt {}: dropping undecodable PDU ({:?}): {:02x?}",
                        inner.peer,
                        err,
                        &buf[..n]
                    ),
                }
            }
            Err(Error::TimedOut(_)) | Err(Error::Interrupted) => continue,
            Err(err) => {
                if restarts < inner.restart_count {
                    restarts += 1;
                    debug!(
                        "gatt {}: reader restart {}/{} after {}",
                        inner.peer,
                        restarts,
                        inner.restart_count,
                        err.kind()
                    );
                    continue;
                }
                if !inner.closed.load(Ordering::SeqCst) {
                    info!("gatt {}: pipe lost ({}), closing", inner.peer, err.kind());
                    inner.note_disconnect(HciStatus::ConnectionTimeout);
                }
                break;
            }
        }
    }
    debug!("gatt {}: reader exiting", inner.peer);
}

#[cfg(test)]
mod tests;
