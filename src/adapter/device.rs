// rawble Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! One remote LE device as seen by its adapter: volatile EIR state while
//! discovered, and the L2CAP/GATT/SMP session stack while connected.

use crate::api::{
    now_millis, AdapterListener, DeviceId, EirFields, IoCapability, PairingMode, PairingState,
    SecurityLevel, Service, Timestamp,
};
use crate::eir::EirData;
use crate::gatt::GattHandler;
use crate::hci::constants::HciStatus;
use crate::hci::packet::LeConnectParams;
use crate::l2cap::{L2capClient, Transport};
use crate::smp::{SmpEngine, SmpKeyBin};
use crate::{Error, Result};
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::Adapter;

/// The open session stack of a connected device.
pub(super) struct Connection {
    pub handle: u16,
    pub att_pipe: Arc<L2capClient>,
    pub smp_pipe: Option<Arc<L2capClient>>,
    pub gatt: Arc<GattHandler>,
    pub smp: Option<Arc<SmpEngine>>,
}

pub struct Device {
    id: DeviceId,
    adapter: Weak<Adapter>,
    pub(super) eir: Mutex<EirData>,
    pub(super) connection: Mutex<Option<Connection>>,
    pub(super) pairing: Mutex<(PairingState, PairingMode)>,
    pub(super) security: Mutex<(SecurityLevel, IoCapability)>,
    /// Persisted keys loaded before connect for the fast path.
    pub(super) preloaded: Mutex<Option<SmpKeyBin>>,
    pub(super) ready: AtomicBool,
    /// The listener that claimed this device in `device_found`.
    pub(super) interest: Mutex<Option<Arc<dyn AdapterListener>>>,
    /// `(interval, latency, supervision_timeout)` of the live link.
    pub(super) conn_params: Mutex<Option<(u16, u16, u16)>>,
    /// First time this device was seen in the current discovery epoch.
    last_discovery: Mutex<Timestamp>,
    /// Last EIR/state change.
    last_update: Mutex<Timestamp>,
}

impl Device {
    pub(super) fn new(adapter: Weak<Adapter>, id: DeviceId, eir: EirData) -> Arc<Device> {
        let now = now_millis();
        Arc::new(Device {
            id,
            adapter,
            eir: Mutex::new(eir),
            connection: Mutex::new(None),
            pairing: Mutex::new((PairingState::None, PairingMode::None)),
            security: Mutex::new((SecurityLevel::None, IoCapability::NoInputNoOutput)),
            preloaded: Mutex::new(None),
            ready: AtomicBool::new(false),
            interest: Mutex::new(None),
            conn_params: Mutex::new(None),
            last_discovery: Mutex::new(now),
            last_update: Mutex::new(now),
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn adapter(&self) -> Option<Arc<Adapter>> {
        self.adapter.upgrade()
    }

    pub fn name(&self) -> Option<String> {
        self.eir.lock().unwrap().local_name.clone()
    }

    pub fn rssi(&self) -> Option<i8> {
        self.eir.lock().unwrap().rssi
    }

    /// A copy of the merged EIR state.
    pub fn eir_data(&self) -> EirData {
        self.eir.lock().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.lock().unwrap().is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn connection_handle(&self) -> Option<u16> {
        self.connection.lock().unwrap().as_ref().map(|c| c.handle)
    }

    pub fn pairing_state(&self) -> (PairingState, PairingMode) {
        *self.pairing.lock().unwrap()
    }

    /// `(interval, latency, supervision_timeout)` of the live link.
    pub fn conn_params(&self) -> Option<(u16, u16, u16)> {
        *self.conn_params.lock().unwrap()
    }

    pub(super) fn set_conn_params(&self, interval: u16, latency: u16, supervision_timeout: u16) {
        *self.conn_params.lock().unwrap() = Some((interval, latency, supervision_timeout));
    }

    /// When this device was (re-)discovered.
    pub fn last_discovery_timestamp(&self) -> Timestamp {
        *self.last_discovery.lock().unwrap()
    }

    /// When any advertised field last changed.
    pub fn last_update_timestamp(&self) -> Timestamp {
        *self.last_update.lock().unwrap()
    }

    /// Folds a new report into the device; returns the changed fields.
    pub(super) fn update_eir(&self, report: &EirData) -> EirFields {
        let changed = self.eir.lock().unwrap().update_from(report);
        if !changed.is_empty() {
            *self.last_update.lock().unwrap() = now_millis();
        }
        changed
    }

    /// Stamps an advertising sighting (every report, changed or not).
    pub(super) fn mark_discovered(&self) {
        *self.last_discovery.lock().unwrap() = now_millis();
    }

    /// Requests the link security to establish on the next connect.
    pub fn set_conn_security(&self, level: SecurityLevel, io_cap: IoCapability) {
        *self.security.lock().unwrap() = (level, io_cap);
    }

    pub fn conn_security(&self) -> (SecurityLevel, IoCapability) {
        *self.security.lock().unwrap()
    }

    /// Connects with default LE parameters.
    pub fn connect_default(self: &Arc<Self>) -> Result<()> {
        self.connect_le(LeConnectParams::default())
    }

    /// Connects with explicit LE parameters.
    pub fn connect_le(self: &Arc<Self>, params: LeConnectParams) -> Result<()> {
        let adapter = self.adapter.upgrade().ok_or(Error::NotConnected)?;
        adapter.connect_device(self, params)
    }

    /// Tears the connection down; listeners observe `device_disconnected`.
    pub fn disconnect(self: &Arc<Self>) -> Result<()> {
        let adapter = self.adapter.upgrade().ok_or(Error::NotConnected)?;
        adapter.disconnect_device(self, HciStatus::RemoteUserTerminatedConnection)
    }

    /// The GATT session, once connected.
    pub fn gatt(&self) -> Option<Arc<GattHandler>> {
        self.connection.lock().unwrap().as_ref().map(|c| c.gatt.clone())
    }

    /// The SMP engine, once connected.
    pub fn smp(&self) -> Option<Arc<SmpEngine>> {
        self.connection
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|c| c.smp.clone())
    }

    /// The discovered service tree, running discovery on first use.
    pub fn get_gatt_services(&self) -> Result<Vec<Service>> {
        let gatt = self.gatt().ok_or(Error::NotConnected)?;
        let services = gatt.services();
        if !services.is_empty() {
            return Ok(services);
        }
        gatt.discover_services()
    }

    /// Liveness probe over the GATT session.
    pub fn ping_gatt(&self) -> bool {
        match self.gatt() {
            Some(gatt) => gatt.ping(),
            None => false,
        }
    }

    pub(super) fn set_pairing(&self, state: PairingState, mode: PairingMode) {
        *self.pairing.lock().unwrap() = (state, mode);
        *self.last_update.lock().unwrap() = now_millis();
    }

    /// Installs the session stack after a completed connection; returns
    /// false if one was already attached (duplicate completion event).
    pub(super) fn attach(&self, connection: Connection) -> bool {
        let mut slot = self.connection.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(connection);
        *self.last_update.lock().unwrap() = now_millis();
        true
    }

    /// Removes and closes the session stack; returns the old handle the
    /// first time, `None` on repeated calls (exactly-once semantics).
    pub(super) fn detach(&self, reason: HciStatus) -> Option<u16> {
        let connection = self.connection.lock().unwrap().take()?;
        self.ready.store(false, Ordering::SeqCst);
        self.set_pairing(PairingState::None, PairingMode::None);
        connection.gatt.connection_lost(reason);
        if let Some(smp) = &connection.smp {
            smp.close();
        }
        connection.att_pipe.close();
        if let Some(pipe) = &connection.smp_pipe {
            pipe.close();
        }
        Some(connection.handle)
    }
}

impl Display for Device {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let name = self.name().unwrap_or_else(|| "(unknown)".to_string());
        let connected = if self.is_connected() { " connected" } else { "" };
        write!(f, "{} {}{}", self.id, name, connected)
    }
}

impl Debug for Device {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("connected", &self.is_connected())
            .field("ready", &self.is_ready())
            .finish()
    }
}
