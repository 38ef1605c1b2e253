// rawble Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! The per-controller adapter: couples the HCI handler and the MGMT view,
//! owns the device registry and the listener surface, and coordinates
//! discovery, connection establishment, security and teardown.

mod device;

pub use device::Device;

use crate::api::{
    now_millis, AdapterListener, AdapterSettings, AddressType, BDAddr, DeviceId, IoCapability,
    ListenerRegistry, PairingMode, PairingState, ScanType, SecurityLevel, WhitelistConnectType,
};
use crate::config::Config;
use crate::eir::EirData;
use crate::gatt::GattHandler;
use crate::hci::constants::HciStatus;
use crate::hci::packet::{AdvertisingInfo, HciEvent, LeConnectParams};
use crate::hci::{HciEventListener, HciHandler, ScanState};
use crate::l2cap::{L2capClient, Transport, ATT_CID, SMP_CID};
use crate::mgmt::{MgmtAdapterInfo, MgmtChannel, MgmtEvent, MgmtEventKind, MgmtLongTermKey};
use crate::smp::{
    KeyProps, LinkEncrypter, LongTermKey, SmpCrypto, SmpEngine, SmpKeyBin, SmpListener,
};
use crate::{Error, Result};
use dashmap::DashMap;
use device::Connection;
use log::{debug, info, trace, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

/// Base delay of the keep-alive rescan backoff.
const KEEP_ALIVE_BACKOFF_BASE: Duration = Duration::from_millis(100);
const KEEP_ALIVE_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// A physical Bluetooth controller driven over its raw HCI socket, with
/// settings and bonding plumbing on the shared MGMT channel.
pub struct Adapter {
    dev_id: u16,
    address: BDAddr,
    hci: HciHandler,
    mgmt: Arc<MgmtChannel>,
    config: Config,
    settings: Mutex<AdapterSettings>,
    scan_type: Mutex<ScanType>,
    devices: DashMap<DeviceId, Arc<Device>>,
    /// Connection handle to device identity, while connected.
    connected: DashMap<u16, DeviceId>,
    whitelist: DashMap<DeviceId, WhitelistConnectType>,
    listeners: ListenerRegistry<dyn AdapterListener>,
    /// Directory for SMPKeyBin records; key persistence off when unset.
    key_dir: Mutex<Option<PathBuf>>,
    crypto: Mutex<Option<Arc<dyn SmpCrypto>>>,
    /// Re-enable scanning whenever the controller stops it on its own.
    keep_alive: AtomicBool,
    /// The application asked for discovery and has not stopped it.
    discovery_requested: AtomicBool,
    keep_alive_failures: AtomicU32,
    /// Power-cycle after every N ready devices; 0 disables.
    reset_each_conn: AtomicU32,
    ready_count: AtomicU32,
    closed: AtomicBool,
    weak_self: Mutex<Weak<Adapter>>,
}

impl Adapter {
    pub(crate) fn new(
        dev_id: u16,
        info: &MgmtAdapterInfo,
        mgmt: Arc<MgmtChannel>,
        config: &Config,
    ) -> Result<Arc<Adapter>> {
        let hci = HciHandler::open(dev_id, config)?;
        if info.current_settings.contains(AdapterSettings::POWERED) {
            if let Err(err) = hci.initialize() {
                warn!("hci{}: bring-up failed: {}", dev_id, err.kind());
            }
        }
        let adapter = Arc::new(Adapter {
            dev_id,
            address: info.address,
            hci,
            mgmt,
            config: config.clone(),
            settings: Mutex::new(info.current_settings),
            scan_type: Mutex::new(ScanType::None),
            devices: DashMap::new(),
            connected: DashMap::new(),
            whitelist: DashMap::new(),
            listeners: ListenerRegistry::new(),
            key_dir: Mutex::new(None),
            crypto: Mutex::new(None),
            keep_alive: AtomicBool::new(false),
            discovery_requested: AtomicBool::new(false),
            keep_alive_failures: AtomicU32::new(0),
            reset_each_conn: AtomicU32::new(0),
            ready_count: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            weak_self: Mutex::new(Weak::new()),
        });
        *adapter.weak_self.lock().unwrap() = Arc::downgrade(&adapter);
        adapter.hci.add_event_listener(Arc::new(AdapterHciListener {
            adapter: Arc::downgrade(&adapter),
        }));
        info!("adapter hci{} at {}", dev_id, info.address);
        Ok(adapter)
    }

    pub fn dev_id(&self) -> u16 {
        self.dev_id
    }

    pub fn address(&self) -> BDAddr {
        self.address
    }

    pub fn local_id(&self) -> DeviceId {
        DeviceId::new(self.address, AddressType::LePublic)
    }

    pub fn settings(&self) -> AdapterSettings {
        *self.settings.lock().unwrap()
    }

    pub fn is_powered(&self) -> bool {
        self.settings().contains(AdapterSettings::POWERED)
    }

    pub fn scan_type(&self) -> ScanType {
        *self.scan_type.lock().unwrap()
    }

    pub fn hci(&self) -> &HciHandler {
        &self.hci
    }

    /// Enables key persistence under `dir` (SMPKeyBin records).
    pub fn set_key_directory(&self, dir: PathBuf) {
        *self.key_dir.lock().unwrap() = Some(dir);
    }

    /// Installs the crypto provider required for interactive pairing; the
    /// pre-paired fast path works without one.
    pub fn set_crypto(&self, crypto: Arc<dyn SmpCrypto>) {
        *self.crypto.lock().unwrap() = Some(crypto);
    }

    /// Power-cycle the controller after every `n` ready devices (0 = off).
    pub fn set_reset_each_conn(&self, n: u32) {
        self.reset_each_conn.store(n, Ordering::SeqCst);
    }

    /// Registers a listener; per contract it immediately receives the
    /// current settings with `old` empty.
    pub fn add_listener(self: &Arc<Self>, listener: Arc<dyn AdapterListener>) {
        let current = self.settings();
        listener.adapter_settings_changed(
            self,
            AdapterSettings::empty(),
            current,
            current,
            now_millis(),
        );
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn AdapterListener>) -> bool {
        self.listeners.remove(listener)
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.iter().map(|e| e.value().clone()).collect()
    }

    pub fn device(&self, id: DeviceId) -> Option<Arc<Device>> {
        self.devices.get(&id).map(|e| e.value().clone())
    }

    pub fn connected_devices(&self) -> Vec<Arc<Device>> {
        self.connected
            .iter()
            .filter_map(|e| self.device(*e.value()))
            .collect()
    }

    /// Drops a disconnected device from the registry.
    pub fn remove_device(&self, id: DeviceId) -> bool {
        match self.devices.remove(&id) {
            Some((_, device)) => {
                if let Some(handle) = device.detach(HciStatus::ConnectionTerminatedByLocalHost) {
                    self.connected.remove(&handle);
                }
                true
            }
            None => false,
        }
    }

    // --- power & settings ----------------------------------------------

    pub fn set_powered(&self, on: bool) -> Result<()> {
        self.mgmt.set_powered(self.dev_id, on)?;
        Ok(())
    }

    /// MGMT `NEW_SETTINGS` and command replies both land here.
    fn apply_settings(self: &Arc<Self>, new: AdapterSettings) {
        let old = {
            let mut settings = self.settings.lock().unwrap();
            let old = *settings;
            *settings = new;
            old
        };
        let changed = old.symmetric_difference(new);
        if changed.is_empty() {
            return;
        }
        debug!("hci{}: settings {:?} -> {:?}", self.dev_id, old, new);
        let t = now_millis();
        for listener in self.listeners.snapshot() {
            listener.adapter_settings_changed(self, old, new, changed, t);
        }
        if changed.contains(AdapterSettings::POWERED) {
            if new.contains(AdapterSettings::POWERED) {
                if let Err(err) = self.hci.initialize() {
                    warn!("hci{}: re-init failed: {}", self.dev_id, err.kind());
                }
                self.resume_discovery_if_needed();
            } else {
                // a controller fault or power-off closes every session
                self.drop_all_connections(HciStatus::HardwareFailure);
            }
        }
    }

    fn drop_all_connections(self: &Arc<Self>, reason: HciStatus) {
        let handles: Vec<u16> = self.connected.iter().map(|e| *e.key()).collect();
        for handle in handles {
            self.handle_disconnect(handle, reason);
        }
    }

    // --- discovery ------------------------------------------------------

    /// Starts LE discovery. With `keep_alive` the adapter re-enables
    /// scanning transparently whenever the controller stops it (connection
    /// attempts do that), until `stop_discovery`.
    pub fn start_discovery(self: &Arc<Self>, keep_alive: bool) -> Result<()> {
        if !self.is_powered() {
            return Err(Error::NotPowered);
        }
        self.keep_alive.store(keep_alive, Ordering::SeqCst);
        self.discovery_requested.store(true, Ordering::SeqCst);
        self.keep_alive_failures.store(0, Ordering::SeqCst);
        if self.hci.scan_state() == ScanState::On {
            return Ok(());
        }
        // active scan, 11.25 ms window every 11.25 ms
        self.hci
            .le_set_scan_parameters(0x01, 0x0012, 0x0012, AddressType::LePublic, 0x00)?;
        self.hci.le_set_scan_enable(true, false)?;
        self.note_discovering(ScanType::Le, true);
        Ok(())
    }

    pub fn stop_discovery(self: &Arc<Self>) -> Result<()> {
        self.discovery_requested.store(false, Ordering::SeqCst);
        self.keep_alive.store(false, Ordering::SeqCst);
        if self.hci.scan_state() == ScanState::Off {
            return Ok(());
        }
        self.hci.le_set_scan_enable(false, false)?;
        self.note_discovering(ScanType::Le, false);
        Ok(())
    }

    fn note_discovering(self: &Arc<Self>, changed: ScanType, enabled: bool) {
        {
            let mut scan = self.scan_type.lock().unwrap();
            *scan = if enabled { changed } else { ScanType::None };
        }
        let keep_alive = self.keep_alive.load(Ordering::SeqCst);
        let current = self.scan_type();
        let t = now_millis();
        for listener in self.listeners.snapshot() {
            listener.discovering_changed(self, current, changed, enabled, keep_alive, t);
        }
    }

    /// Re-issues scan-enable after the controller stopped scanning, rate
    /// limited by an exponential backoff on repeated failure.
    fn resume_discovery_if_needed(self: &Arc<Self>) {
        if !self.keep_alive.load(Ordering::SeqCst)
            || !self.discovery_requested.load(Ordering::SeqCst)
            || self.closed.load(Ordering::SeqCst)
            || self.hci.scan_state() != ScanState::Off
        {
            return;
        }
        let adapter = self.clone();
        thread::spawn(move || {
            let failures = adapter.keep_alive_failures.load(Ordering::SeqCst);
            let delay = KEEP_ALIVE_BACKOFF_BASE
                .saturating_mul(1u32 << failures.min(8))
                .min(KEEP_ALIVE_BACKOFF_CAP);
            thread::sleep(delay);
            if !adapter.keep_alive.load(Ordering::SeqCst)
                || adapter.hci.scan_state() != ScanState::Off
            {
                return;
            }
            match adapter.hci.le_set_scan_enable(true, false) {
                Ok(()) => {
                    adapter.keep_alive_failures.store(0, Ordering::SeqCst);
                    adapter.note_discovering(ScanType::Le, true);
                    debug!("hci{}: keep-alive rescan resumed", adapter.dev_id);
                }
                Err(err) => {
                    adapter.keep_alive_failures.fetch_add(1, Ordering::SeqCst);
                    debug!(
                        "hci{}: keep-alive rescan failed ({}), backing off",
                        adapter.dev_id,
                        err.kind()
                    );
                    adapter.resume_discovery_if_needed();
                }
            }
        });
    }

    /// Advertising reports from the HCI dispatcher.
    fn handle_advertising(self: &Arc<Self>, reports: &[AdvertisingInfo]) {
        for report in reports {
            let id = DeviceId::new(report.address, report.address_type);
            if id.random_type() == crate::api::RandomAddressType::ResolvablePrivate {
                trace!("hci{}: skipping resolvable-private {}", self.dev_id, id);
                continue;
            }
            let mut eir = EirData::decode(&report.data);
            eir.set_rssi(report.rssi);

            if let Some(device) = self.device(id) {
                device.mark_discovered();
                let changed = device.update_eir(&eir);
                if !changed.is_empty() {
                    let t = now_millis();
                    for listener in self.listeners.snapshot() {
                        listener.device_updated(&device, changed, t);
                    }
                }
                continue;
            }

            let device = Device::new(
                Arc::downgrade(self),
                id,
                eir,
            );
            self.devices.insert(id, device.clone());
            let t = now_millis();
            debug!("hci{}: found {}", self.dev_id, device);
            for listener in self.listeners.snapshot() {
                if listener.device_found(&device, t) {
                    let mut interest = device.interest.lock().unwrap();
                    if interest.is_none() {
                        *interest = Some(listener.clone());
                    }
                }
            }
        }
    }

    // --- whitelist ------------------------------------------------------

    /// Delegates background (re-)connection of `id` to the controller.
    pub fn add_to_whitelist(&self, id: DeviceId, ctype: WhitelistConnectType) -> Result<()> {
        self.hci.le_add_device_to_white_list(id)?;
        if let Err(err) = self.mgmt.add_device(self.dev_id, id, whitelist_action(ctype)) {
            debug!("hci{}: mgmt add_device: {}", self.dev_id, err.kind());
        }
        self.whitelist.insert(id, ctype);
        Ok(())
    }

    pub fn remove_from_whitelist(&self, id: DeviceId) -> Result<()> {
        self.whitelist.remove(&id);
        let _ = self.mgmt.remove_device(self.dev_id, id);
        self.hci.le_remove_device_from_white_list(id)
    }

    pub fn whitelist(&self) -> Vec<(DeviceId, WhitelistConnectType)> {
        self.whitelist
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect()
    }

    // --- connection path ------------------------------------------------

    pub(crate) fn connect_device(
        self: &Arc<Self>,
        device: &Arc<Device>,
        params: LeConnectParams,
    ) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::closed("adapter closed"));
        }
        if !self.is_powered() {
            return Err(Error::NotPowered);
        }
        if device.is_connected() {
            return Err(Error::InvalidArgument("device already connected".into()));
        }

        // the controller rejects LE Create Connection while scanning
        if self.hci.scan_state() == ScanState::On {
            self.hci.le_set_scan_enable(false, false)?;
            self.note_discovering(ScanType::Le, false);
        }

        // arm the pre-paired fast path from persisted keys
        if let Some(dir) = self.key_dir.lock().unwrap().clone() {
            if let Some(bin) = SmpKeyBin::load(&dir, device.id()) {
                info!("hci{}: loaded keys for {}", self.dev_id, device.id());
                *device.preloaded.lock().unwrap() = Some(bin);
            }
        }

        let result = self.hci.le_create_connection(device.id(), &params);
        match result {
            Ok(info) => {
                self.establish(device, info.handle);
                Ok(())
            }
            Err(err) => {
                let reason = match &err {
                    Error::ConnectionFailed(status) => *status,
                    Error::TimedOut(_) => {
                        let _ = self.hci.le_create_connection_cancel();
                        HciStatus::ConnectionAcceptTimeout
                    }
                    _ => HciStatus::UnspecifiedError,
                };
                let t = now_millis();
                for listener in self.listeners.snapshot() {
                    listener.device_disconnected(device, reason, 0, t);
                }
                self.resume_discovery_if_needed();
                Err(err)
            }
        }
    }

    /// Builds the session stack on a completed connection and drives
    /// security to `ready`.
    fn establish(self: &Arc<Self>, device: &Arc<Device>, handle: u16) {
        let local = self.local_id();
        let (sec_level, io_cap) = device.conn_security();

        let att_pipe = match L2capClient::open(
            local,
            device.id(),
            0,
            ATT_CID,
            SecurityLevel::None,
        ) {
            Ok(pipe) => Arc::new(pipe),
            Err(err) => {
                warn!(
                    "hci{}: ATT pipe to {} failed: {}",
                    self.dev_id,
                    device.id(),
                    err.kind()
                );
                let _ = self.hci.disconnect(handle, HciStatus::RemoteUserTerminatedConnection);
                let t = now_millis();
                for listener in self.listeners.snapshot() {
                    listener.device_disconnected(device, HciStatus::ConnectionFailedToEstablish, 0, t);
                }
                return;
            }
        };

        let transport: Arc<dyn Transport> = att_pipe.clone();
        let gatt = Arc::new(GattHandler::new(transport, device.id(), &self.config));

        // the SMP fixed channel is unavailable on kernels that reserve it;
        // the fast path then runs purely over HCI
        let smp_pipe = match L2capClient::open(local, device.id(), 0, SMP_CID, SecurityLevel::None)
        {
            Ok(pipe) => Some(Arc::new(pipe)),
            Err(err) => {
                debug!(
                    "hci{}: no SMP channel to {} ({}), kernel keeps SMP",
                    self.dev_id,
                    device.id(),
                    err
                );
                None
            }
        };

        let crypto = self.crypto.lock().unwrap().clone();
        let preloaded = device.preloaded.lock().unwrap().clone();
        let link: Arc<dyn LinkEncrypter> = Arc::new(HciLinkEncrypter {
            adapter: Arc::downgrade(self),
            handle,
        });
        let smp = smp_pipe.as_ref().map(|pipe| {
            let transport: Arc<dyn Transport> = pipe.clone();
            let engine = Arc::new(SmpEngine::new(
                transport,
                local,
                device.id(),
                crypto.clone().unwrap_or_else(|| Arc::new(NullCrypto)),
                link.clone(),
            ));
            engine.set_conn_security(sec_level, io_cap);
            engine.add_listener(Arc::new(DeviceSmpListener {
                adapter: Arc::downgrade(self),
                device: Arc::downgrade(device),
            }));
            engine
        });

        // security errors on ATT raise the link level once and retry
        {
            let weak_device = Arc::downgrade(device);
            gatt.set_security_hook(Box::new(move |code| {
                let Some(device) = weak_device.upgrade() else {
                    return false;
                };
                let Some(engine) = device.smp() else {
                    return false;
                };
                debug!("raising security for {} after {:?}", device.id(), code);
                engine.has_stored_key() && engine.start_encryption_with_stored().is_ok()
            }));
        }

        if !device.attach(Connection {
            handle,
            att_pipe,
            smp_pipe,
            gatt,
            smp: smp.clone(),
        }) {
            debug!("hci{}: duplicate attach for {}", self.dev_id, device.id());
            return;
        }
        self.connected.insert(handle, device.id());

        let t = now_millis();
        for listener in self.listeners.snapshot() {
            listener.device_connected(device, handle, t);
        }

        // drive link security: stored keys first, interactive second
        let mut secured = false;
        if let (Some(engine), Some(bin)) = (&smp, &preloaded) {
            if let Some(key) = bin.encryption_key() {
                engine.set_long_term_key(key);
                match engine.start_encryption_with_stored() {
                    Ok(()) => secured = true,
                    Err(err) => {
                        info!(
                            "hci{}: fast path for {} failed: {}",
                            self.dev_id,
                            device.id(),
                            err.kind()
                        );
                    }
                }
            }
        }
        if !secured && sec_level > SecurityLevel::None {
            if let (Some(engine), Some(_)) = (&smp, &crypto) {
                if let Err(err) = engine.start_pairing() {
                    warn!(
                        "hci{}: pairing with {} failed to start: {}",
                        self.dev_id,
                        device.id(),
                        err.kind()
                    );
                }
                // ready fires from the pairing-state listener
                self.resume_discovery_if_needed();
                return;
            }
            warn!(
                "hci{}: security requested for {} but no SMP path available",
                self.dev_id,
                device.id()
            );
        }
        if !secured {
            self.mark_ready(device);
        }
        // pre-paired path marks ready through the state listener
        self.resume_discovery_if_needed();
    }

    fn mark_ready(self: &Arc<Self>, device: &Arc<Device>) {
        if device.ready.swap(true, Ordering::SeqCst) {
            return;
        }
        let t = now_millis();
        for listener in self.listeners.snapshot() {
            listener.device_ready(device, t);
        }
        let ready = self.ready_count.fetch_add(1, Ordering::SeqCst) + 1;
        let every = self.reset_each_conn.load(Ordering::SeqCst);
        if every > 0 && ready % every == 0 {
            info!(
                "hci{}: {} devices ready, power-cycling per policy",
                self.dev_id, ready
            );
            let adapter = self.clone();
            thread::spawn(move || {
                let _ = adapter.set_powered(false);
                thread::sleep(Duration::from_millis(250));
                let _ = adapter.set_powered(true);
            });
        }
    }

    pub(crate) fn disconnect_device(
        self: &Arc<Self>,
        device: &Arc<Device>,
        reason: HciStatus,
    ) -> Result<()> {
        let handle = device.connection_handle().ok_or(Error::NotConnected)?;
        match self.hci.disconnect(handle, reason) {
            Ok(actual) => {
                // the completion event also lands in the dispatcher; detach
                // here so callers observe the teardown synchronously
                self.handle_disconnect(handle, actual);
                Ok(())
            }
            Err(err) => {
                self.handle_disconnect(handle, HciStatus::ConnectionTimeout);
                Err(err)
            }
        }
    }

    /// Exactly-once teardown path for a lost or closed connection.
    fn handle_disconnect(self: &Arc<Self>, handle: u16, reason: HciStatus) {
        let Some((_, id)) = self.connected.remove(&handle) else {
            return;
        };
        let Some(device) = self.device(id) else {
            return;
        };
        let Some(old_handle) = device.detach(reason) else {
            return;
        };
        self.hci.clear_handle_listeners(old_handle);
        info!(
            "hci{}: {} disconnected ({:?})",
            self.dev_id, id, reason
        );
        let t = now_millis();
        for listener in self.listeners.snapshot() {
            listener.device_disconnected(&device, reason, old_handle, t);
        }
        self.resume_discovery_if_needed();
    }

    /// Removes bonding state in the kernel and on disk.
    pub fn unpair(&self, id: DeviceId) -> Result<()> {
        if let Some(dir) = self.key_dir.lock().unwrap().clone() {
            SmpKeyBin::remove(&dir, id);
        }
        self.mgmt.unpair_device(self.dev_id, id)
    }

    /// MGMT events for this controller, routed by the manager.
    pub(crate) fn handle_mgmt_event(self: &Arc<Self>, event: &MgmtEvent) {
        match &event.kind {
            MgmtEventKind::NewSettings(settings) => self.apply_settings(*settings),
            MgmtEventKind::Discovering {
                scan_type,
                discovering,
            } => {
                // the kernel stops scans around its own connection work
                self.hci.note_scan_state(*discovering);
                let changed = ScanType::from_u8(*scan_type);
                self.note_discovering(changed, *discovering);
                if !discovering {
                    self.resume_discovery_if_needed();
                }
            }
            MgmtEventKind::NewLongTermKey { store_hint, key } if *store_hint => {
                self.store_kernel_ltk(key);
            }
            MgmtEventKind::DeviceDisconnected { peer, reason } => {
                if let Some(device) = self.device(*peer) {
                    if let Some(handle) = device.connection_handle() {
                        self.handle_disconnect(handle, HciStatus::from_u8(*reason));
                    }
                }
            }
            MgmtEventKind::ConnectFailed { peer, status } => {
                if let Some(device) = self.device(*peer) {
                    let t = now_millis();
                    for listener in self.listeners.snapshot() {
                        listener.device_disconnected(
                            &device,
                            HciStatus::from_u8(*status),
                            0,
                            t,
                        );
                    }
                }
            }
            MgmtEventKind::ControllerError(code) => {
                warn!("hci{}: controller error {:#04x}", self.dev_id, code);
            }
            other => {
                trace!("hci{}: mgmt event {:?}", self.dev_id, other);
            }
        }
    }

    /// Persists a kernel-distributed LTK into the device's key bin.
    fn store_kernel_ltk(&self, key: &MgmtLongTermKey) {
        let Some(dir) = self.key_dir.lock().unwrap().clone() else {
            return;
        };
        let mut bin = SmpKeyBin::load(&dir, key.peer).unwrap_or_else(|| {
            SmpKeyBin::new(
                key.peer,
                SecurityLevel::Encrypted,
                IoCapability::NoInputNoOutput,
            )
        });
        let ltk = LongTermKey {
            props: KeyProps::VALID,
            enc_size: key.enc_size,
            ediv: key.ediv,
            rand: key.rand,
            ltk: key.value,
        };
        if key.central {
            bin.init_ltk = Some(ltk);
        } else {
            bin.resp_ltk = Some(ltk);
        }
        if let Err(err) = bin.write_to(&dir) {
            warn!(
                "hci{}: persisting keys for {} failed: {}",
                self.dev_id,
                key.peer,
                err.kind()
            );
        }
    }

    /// Closes every session and the HCI handler; idempotent.
    pub fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.keep_alive.store(false, Ordering::SeqCst);
        self.drop_all_connections(HciStatus::ConnectionTerminatedByLocalHost);
        self.hci.close();
        self.listeners.clear();
        self.devices.clear();
        info!("adapter hci{} closed", self.dev_id);
    }
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("dev_id", &self.dev_id)
            .field("address", &self.address)
            .field("settings", &self.settings())
            .field("devices", &self.devices.len())
            .finish()
    }
}

/// Routes decoded HCI events into the adapter.
struct AdapterHciListener {
    adapter: Weak<Adapter>,
}

impl HciEventListener for AdapterHciListener {
    fn on_event(&self, event: &HciEvent) {
        let Some(adapter) = self.adapter.upgrade() else {
            return;
        };
        match event {
            HciEvent::LeAdvertisingReport(reports) => adapter.handle_advertising(reports),
            HciEvent::DisconnectComplete { handle, reason, .. } => {
                adapter.handle_disconnect(*handle, *reason);
            }
            HciEvent::LeConnectionComplete(info) if info.status.is_success() => {
                // background (whitelist) connections arrive only this way
                let id = DeviceId::new(info.peer_address, info.peer_address_type);
                if let Some(device) = adapter.device(id) {
                    device.set_conn_params(
                        info.conn_interval,
                        info.conn_latency,
                        info.supervision_timeout,
                    );
                    if !device.is_connected() {
                        adapter.establish(&device, info.handle);
                    }
                } else if adapter.whitelist.contains_key(&id) {
                    let device = Device::new(Arc::downgrade(&adapter), id, EirData::default());
                    device.set_conn_params(
                        info.conn_interval,
                        info.conn_latency,
                        info.supervision_timeout,
                    );
                    adapter.devices.insert(id, device.clone());
                    adapter.establish(&device, info.handle);
                }
            }
            HciEvent::LeConnectionUpdateComplete {
                status,
                handle,
                conn_interval,
                conn_latency,
                supervision_timeout,
            } if status.is_success() => {
                if let Some(id) = adapter.connected.get(handle).map(|e| *e.value()) {
                    if let Some(device) = adapter.device(id) {
                        device.set_conn_params(*conn_interval, *conn_latency, *supervision_timeout);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Binds `LE Start Encryption` to one connection handle.
struct HciLinkEncrypter {
    adapter: Weak<Adapter>,
    handle: u16,
}

impl LinkEncrypter for HciLinkEncrypter {
    fn start_encryption(&self, rand: u64, ediv: u16, key: &[u8; 16]) -> Result<bool> {
        let adapter = self
            .adapter
            .upgrade()
            .ok_or_else(|| Error::closed("adapter gone"))?;
        adapter.hci.le_start_encryption(self.handle, rand, ediv, key)
    }
}

/// Forwards SMP progress into the adapter listener surface and persists
/// distributed keys.
struct DeviceSmpListener {
    adapter: Weak<Adapter>,
    device: Weak<Device>,
}

impl SmpListener for DeviceSmpListener {
    fn pairing_state_changed(&self, _peer: DeviceId, state: PairingState, mode: PairingMode) {
        let (Some(adapter), Some(device)) = (self.adapter.upgrade(), self.device.upgrade()) else {
            return;
        };
        device.set_pairing(state, mode);
        let t = now_millis();
        for listener in adapter.listeners.snapshot() {
            listener.device_pairing_state(&device, state, mode, t);
        }
        if state == PairingState::Completed {
            adapter.mark_ready(&device);
        }
    }

    fn keys_distributed(&self, peer: DeviceId, keys: &SmpKeyBin) {
        let Some(adapter) = self.adapter.upgrade() else {
            return;
        };
        let Some(dir) = adapter.key_dir.lock().unwrap().clone() else {
            return;
        };
        match keys.write_to(&dir) {
            Ok(path) => info!("hci{}: keys for {} saved to {}", adapter.dev_id, peer, path.display()),
            Err(err) => warn!(
                "hci{}: persisting keys for {} failed: {}",
                adapter.dev_id,
                peer,
                err.kind()
            ),
        }
    }
}

/// The kernel auto-connect action for a whitelist policy.
fn whitelist_action(ctype: WhitelistConnectType) -> u8 {
    match ctype {
        WhitelistConnectType::Direct => 1,
        WhitelistConnectType::Auto | WhitelistConnectType::Always => 2,
    }
}

/// Placeholder crypto used when no provider is configured; the adapter
/// never starts interactive pairing with it, only the HCI fast path.
struct NullCrypto;

impl SmpCrypto for NullCrypto {
    fn fill_random(&self, out: &mut [u8]) {
        out.fill(0);
    }

    fn c1(
        &self,
        _tk: &[u8; 16],
        _rand: &[u8; 16],
        _preq: &[u8; 7],
        _pres: &[u8; 7],
        _initiator: DeviceId,
        _responder: DeviceId,
    ) -> [u8; 16] {
        [0; 16]
    }

    fn s1(&self, _tk: &[u8; 16], _resp_rand: &[u8; 16], _init_rand: &[u8; 16]) -> [u8; 16] {
        [0; 16]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_connect_type_actions() {
        assert_eq!(whitelist_action(WhitelistConnectType::Direct), 1);
        assert_eq!(whitelist_action(WhitelistConnectType::Auto), 2);
        assert_eq!(whitelist_action(WhitelistConnectType::Always), 2);
    }

    #[test]
    fn keep_alive_backoff_is_bounded() {
        let mut last = Duration::ZERO;
        for failures in 0..16u32 {
            let delay = KEEP_ALIVE_BACKOFF_BASE
                .saturating_mul(1u32 << failures.min(8))
                .min(KEEP_ALIVE_BACKOFF_CAP);
            assert!(delay >= last || delay == KEEP_ALIVE_BACKOFF_CAP);
            assert!(delay <= KEEP_ALIVE_BACKOFF_CAP);
            last = delay;
        }
        assert_eq!(last, KEEP_ALIVE_BACKOFF_CAP);
    }
}
