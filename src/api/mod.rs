// rawble Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! The `api` module contains the data model and the listener traits which
//! make up rawble's public surface: addresses, UUIDs, the GATT attribute
//! tree, adapter settings, pairing state, and the registries applications
//! attach listeners to.

pub(crate) mod bdaddr;
pub mod bleuuid;

use bitflags::bitflags;
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub use self::bdaddr::{BDAddr, BDAddrSub, ParseBDAddrError};
pub use self::bleuuid::{uuid_from_u16, uuid_from_u32, BleUuid, WireUuid};
pub use crate::eir::EirFields;
pub use crate::hci::constants::HciStatus;

/// Type tag carried next to every EUI-48.
///
/// Equality of two devices is over {address, type}: a public and a random
/// address with identical bytes are different devices.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[repr(u8)]
pub enum AddressType {
    /// Classic Bluetooth (BR/EDR) public address.
    BrEdr = 0x00,
    /// LE public address.
    LePublic = 0x01,
    /// LE random address; see [`RandomAddressType`] for the sub-class.
    LeRandom = 0x02,
    Undefined = 0xff,
}

impl AddressType {
    pub fn from_u8(v: u8) -> AddressType {
        match v {
            0x00 => AddressType::BrEdr,
            0x01 => AddressType::LePublic,
            0x02 => AddressType::LeRandom,
            _ => AddressType::Undefined,
        }
    }

    /// The HCI advertising-report address type (0 = public, 1 = random).
    pub fn from_le_report(v: u8) -> AddressType {
        match v {
            0x00 => AddressType::LePublic,
            0x01 => AddressType::LeRandom,
            _ => AddressType::Undefined,
        }
    }

    pub fn num(&self) -> u8 {
        *self as u8
    }
}

impl Default for AddressType {
    fn default() -> Self {
        AddressType::Undefined
    }
}

impl Display for AddressType {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            AddressType::BrEdr => "br/edr",
            AddressType::LePublic => "public",
            AddressType::LeRandom => "random",
            AddressType::Undefined => "undefined",
        };
        write!(f, "{}", s)
    }
}

/// Sub-classification of an LE random address, derived from its two most
/// significant bits.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RandomAddressType {
    Static,
    ResolvablePrivate,
    NonResolvablePrivate,
    Undefined,
}

/// EUI-48 plus its address-type tag; the identity of a [`crate::Device`].
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DeviceId {
    pub address: BDAddr,
    pub address_type: AddressType,
}

impl DeviceId {
    pub const fn new(address: BDAddr, address_type: AddressType) -> Self {
        Self {
            address,
            address_type,
        }
    }

    /// The random-address sub-class, meaningful only for `LeRandom`.
    pub fn random_type(&self) -> RandomAddressType {
        if self.address_type != AddressType::LeRandom {
            return RandomAddressType::Undefined;
        }
        if self.address.is_random_static() {
            RandomAddressType::Static
        } else if self.address.is_random_resolvable() {
            RandomAddressType::ResolvablePrivate
        } else {
            RandomAddressType::NonResolvablePrivate
        }
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.address, self.address_type)
    }
}

bitflags! {
    /// A set of properties that indicate what operations are supported by a
    /// Characteristic.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CharPropFlags: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

bitflags! {
    /// The controller settings bit set announced on the MGMT channel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AdapterSettings: u32 {
        const POWERED = 1 << 0;
        const CONNECTABLE = 1 << 1;
        const FAST_CONNECTABLE = 1 << 2;
        const DISCOVERABLE = 1 << 3;
        const BONDABLE = 1 << 4;
        const LINK_SECURITY = 1 << 5;
        const SSP = 1 << 6;
        const BREDR = 1 << 7;
        const HS = 1 << 8;
        const LE = 1 << 9;
        const ADVERTISING = 1 << 10;
        const SECURE_CONN = 1 << 11;
        const DEBUG_KEYS = 1 << 12;
        const PRIVACY = 1 << 13;
        const CONFIGURATION = 1 << 14;
        const STATIC_ADDRESS = 1 << 15;
    }
}

/// The transport(s) a discovery scan covers.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum ScanType {
    None = 0x00,
    BrEdr = 0x01,
    Le = 0x02,
    Dual = 0x03,
}

impl ScanType {
    pub fn from_u8(v: u8) -> ScanType {
        match v & 0x03 {
            0x01 => ScanType::BrEdr,
            0x02 => ScanType::Le,
            0x03 => ScanType::Dual,
            _ => ScanType::None,
        }
    }
}

/// A GATT service: a UUID plus the inclusive attribute-handle range
/// `[start_handle, end_handle]` owning an ordered list of characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub uuid: Uuid,
    pub start_handle: u16,
    pub end_handle: u16,
    pub primary: bool,
    pub characteristics: Vec<Characteristic>,
}

/// A GATT characteristic: declaration handle, value handle, property bits,
/// value type UUID and the descriptors that follow the value attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    /// Handle of the characteristic declaration attribute.
    pub decl_handle: u16,
    /// Handle of the value attribute.
    pub value_handle: u16,
    /// Last handle belonging to this characteristic (descriptors included).
    pub end_handle: u16,
    pub properties: CharPropFlags,
    pub uuid: Uuid,
    pub descriptors: Vec<Descriptor>,
}

impl Characteristic {
    /// The Client Characteristic Configuration Descriptor, if present.
    pub fn cccd(&self) -> Option<&Descriptor> {
        self.descriptors
            .iter()
            .find(|d| d.uuid == uuid_from_u16(CCCD_UUID16))
    }
}

impl Display for Characteristic {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "handle {:#06x}, uuid: {}, properties: {:?}",
            self.value_handle,
            self.uuid.to_short_string(),
            self.properties
        )
    }
}

/// A GATT descriptor: handle, type UUID and the opaque value last read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub handle: u16,
    pub uuid: Uuid,
    pub value: Vec<u8>,
}

/// 16-bit alias of the Client Characteristic Configuration Descriptor.
pub const CCCD_UUID16: u16 = 0x2902;

/// The type of write operation to use.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteType {
    /// A write operation where the device is expected to respond with a
    /// confirmation or error. Also known as a request.
    WithResponse,
    /// A write-without-response, also known as a command.
    WithoutResponse,
}

/// Link security level requested for (or established on) a connection.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u8)]
pub enum SecurityLevel {
    None = 1,
    Encrypted = 2,
    EncryptedAuthenticated = 3,
    EncryptedAuthenticatedFips = 4,
}

impl SecurityLevel {
    pub fn from_u8(v: u8) -> SecurityLevel {
        match v {
            2 => SecurityLevel::Encrypted,
            3 => SecurityLevel::EncryptedAuthenticated,
            4 => SecurityLevel::EncryptedAuthenticatedFips,
            _ => SecurityLevel::None,
        }
    }
}

/// SMP IO capability announced during feature exchange.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum IoCapability {
    DisplayOnly = 0x00,
    DisplayYesNo = 0x01,
    KeyboardOnly = 0x02,
    NoInputNoOutput = 0x03,
    KeyboardDisplay = 0x04,
}

impl IoCapability {
    pub fn from_u8(v: u8) -> Option<IoCapability> {
        match v {
            0x00 => Some(IoCapability::DisplayOnly),
            0x01 => Some(IoCapability::DisplayYesNo),
            0x02 => Some(IoCapability::KeyboardOnly),
            0x03 => Some(IoCapability::NoInputNoOutput),
            0x04 => Some(IoCapability::KeyboardDisplay),
            _ => None,
        }
    }
}

/// Progress of the SMP engine for one device.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PairingState {
    None,
    FeatureExchangeStarted,
    FeatureExchangeCompleted,
    PasskeyExpected,
    NumericCompareExpected,
    OobExpected,
    KeyDistribution,
    /// A stored long-term key was loaded and encryption started with it.
    PrePaired,
    Completed,
    Failed,
}

/// How the current pairing was (or will be) performed.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PairingMode {
    None,
    JustWorks,
    /// Initiator displays, responder inputs.
    PasskeyEntryDisplay,
    PasskeyEntryInput,
    NumericCompare,
    OutOfBand,
    /// Interactive pairing skipped via a persisted key set.
    PrePaired,
}

/// Whitelist auto-connection policy for one address.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WhitelistConnectType {
    /// Background auto-connection by the controller.
    Auto,
    /// Direct connection attempts by the controller.
    Direct,
    /// Both.
    Always,
}

/// Milliseconds since the Unix epoch; the timestamp handed to listeners.
pub type Timestamp = u64;

/// Current wall-clock in the listener timestamp unit.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Adapter-level listener surface.
///
/// All methods default to no-ops so implementors override only what they
/// need. `device_found` returns whether the listener takes interest in the
/// device; the adapter records the first interested listener.
#[allow(unused_variables)]
pub trait AdapterListener: Send + Sync {
    fn adapter_settings_changed(
        &self,
        adapter: &Arc<crate::Adapter>,
        old: AdapterSettings,
        new: AdapterSettings,
        changed: AdapterSettings,
        t: Timestamp,
    ) {
    }

    fn discovering_changed(
        &self,
        adapter: &Arc<crate::Adapter>,
        current: ScanType,
        changed: ScanType,
        enabled: bool,
        keep_alive: bool,
        t: Timestamp,
    ) {
    }

    fn device_found(&self, device: &Arc<crate::Device>, t: Timestamp) -> bool {
        false
    }

    fn device_updated(&self, device: &Arc<crate::Device>, changed: EirFields, t: Timestamp) {}

    fn device_connected(&self, device: &Arc<crate::Device>, handle: u16, t: Timestamp) {}

    fn device_pairing_state(
        &self,
        device: &Arc<crate::Device>,
        state: PairingState,
        mode: PairingMode,
        t: Timestamp,
    ) {
    }

    fn device_ready(&self, device: &Arc<crate::Device>, t: Timestamp) {}

    fn device_disconnected(
        &self,
        device: &Arc<crate::Device>,
        reason: HciStatus,
        old_handle: u16,
        t: Timestamp,
    ) {
    }
}

/// Listener for server-initiated characteristic value updates.
#[allow(unused_variables)]
pub trait CharacteristicListener: Send + Sync {
    fn notification_received(&self, ch: &Characteristic, value: &[u8], t: Timestamp) {}

    /// `confirmed` tells whether the stack already sent the confirmation.
    fn indication_received(&self, ch: &Characteristic, value: &[u8], confirmed: bool, t: Timestamp) {
    }
}

/// Process-wide listener for adapters appearing and disappearing.
#[allow(unused_variables)]
pub trait ChangedAdapterSetListener: Send + Sync {
    fn adapter_added(&self, adapter: &Arc<crate::Adapter>) {}
    fn adapter_removed(&self, adapter: &Arc<crate::Adapter>) {}
}

/// A registry of shared listeners with copy-on-notify semantics.
///
/// `snapshot` clones the listener list under the lock and releases it before
/// any callback runs, so callbacks may add or remove listeners (including
/// themselves) without deadlocking. Removal is by identity.
pub struct ListenerRegistry<L: ?Sized> {
    listeners: Mutex<Vec<Arc<L>>>,
}

impl<L: ?Sized> Default for ListenerRegistry<L> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<L: ?Sized> ListenerRegistry<L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<L>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Removes by identity; returns true if the listener was registered.
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut guard = self.listeners.lock().unwrap();
        let before = guard.len();
        guard.retain(|l| !Arc::ptr_eq(l, listener));
        guard.len() != before
    }

    pub fn clear(&self) {
        self.listeners.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The copy handed to notifiers; never call listeners under the lock.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.listeners.lock().unwrap().clone()
    }
}

impl<L: ?Sized> Debug for ListenerRegistry<L> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "ListenerRegistry(len={})", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_equality_is_over_both_fields() {
        let addr: BDAddr = "C0:26:DA:01:DA:B1".parse().unwrap();
        let a = DeviceId::new(addr, AddressType::LePublic);
        let b = DeviceId::new(addr, AddressType::LeRandom);
        assert_ne!(a, b);
        assert_eq!(a, DeviceId::new(addr, AddressType::LePublic));
    }

    #[test]
    fn random_subtype_classification() {
        let rpa = DeviceId::new("52:AC:AD:2C:37:37".parse().unwrap(), AddressType::LeRandom);
        assert_eq!(rpa.random_type(), RandomAddressType::ResolvablePrivate);

        let public = DeviceId::new("52:AC:AD:2C:37:37".parse().unwrap(), AddressType::LePublic);
        assert_eq!(public.random_type(), RandomAddressType::Undefined);
    }

    #[test]
    fn settings_diff() {
        let old = AdapterSettings::empty();
        let new = AdapterSettings::POWERED | AdapterSettings::LE;
        let changed = old.symmetric_difference(new);
        assert!(changed.contains(AdapterSettings::POWERED));
        assert!(changed.contains(AdapterSettings::LE));
        assert!(!changed.contains(AdapterSettings::BREDR));
    }

    #[test]
    fn listener_registry_removes_by_identity() {
        let reg: ListenerRegistry<dyn Fn() + Send + Sync> = ListenerRegistry::new();
        let a: Arc<dyn Fn() + Send + Sync> = Arc::new(|| {});
        let b: Arc<dyn Fn() + Send + Sync> = Arc::new(|| {});
        reg.add(a.clone());
        reg.add(b.clone());
        assert_eq!(reg.len(), 2);
        assert!(reg.remove(&a));
        assert!(!reg.remove(&a));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.snapshot().len(), 1);
    }

    #[test]
    fn cccd_lookup() {
        let ch = Characteristic {
            decl_handle: 0x1c,
            value_handle: 0x1d,
            end_handle: 0x1f,
            properties: CharPropFlags::INDICATE,
            uuid: uuid_from_u16(0x2A1C),
            descriptors: vec![Descriptor {
                handle: 0x1e,
                uuid: uuid_from_u16(CCCD_UUID16),
                value: vec![],
            }],
        };
        assert_eq!(ch.cccd().unwrap().handle, 0x1e);
    }
}
