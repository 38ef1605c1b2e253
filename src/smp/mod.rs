// rawble Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! The SMP pairing engine for one LE connection.
//!
//! The engine owns the SMP fixed-channel pipe (CID 0x0006), drives the
//! legacy pairing state machine as initiator, captures the distributed key
//! set, and hands a finished [`SmpKeyBin`] to listeners for persistence.
//!
//! A persisted key set enables the pre-paired fast path: the adapter calls
//! [`SmpEngine::set_long_term_key`] before connecting, and on the completed
//! connection [`SmpEngine::start_encryption_with_stored`] asks the
//! controller to start encryption directly, skipping the interactive
//! exchange entirely.
//!
//! Cryptographic primitives (the confirm-value and short-term-key functions
//! plus a random source) are supplied by the embedder through [`SmpCrypto`].

pub mod keybin;
pub mod pdu;

pub use keybin::{KeyProps, LongTermKey, SignatureKey, SmpKeyBin};
pub use pdu::{AuthRequirements, KeyDistribution, PairingFeatures, SmpFailureReason, SmpPdu};

use crate::api::{
    DeviceId, IoCapability, ListenerRegistry, PairingMode, PairingState, SecurityLevel,
};
use crate::l2cap::Transport;
use crate::{Error, Result};
use log::{debug, info, trace, warn};
use pdu::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Crypto provider seam: AES-128 based confirm/key functions and a random
/// source (Core Spec Vol 3 Part H §2.2).
pub trait SmpCrypto: Send + Sync {
    fn fill_random(&self, out: &mut [u8]);

    /// Legacy confirm value `c1`.
    fn c1(
        &self,
        tk: &[u8; 16],
        rand: &[u8; 16],
        preq: &[u8; 7],
        pres: &[u8; 7],
        initiator: DeviceId,
        responder: DeviceId,
    ) -> [u8; 16];

    /// Legacy short-term key `s1`.
    fn s1(&self, tk: &[u8; 16], resp_rand: &[u8; 16], init_rand: &[u8; 16]) -> [u8; 16];
}

/// The engine's path to `LE Start Encryption`; the device wires this to the
/// HCI handler with the connection handle bound.
pub trait LinkEncrypter: Send + Sync {
    fn start_encryption(&self, rand: u64, ediv: u16, key: &[u8; 16]) -> Result<bool>;
}

/// Pairing progress and key-set delivery.
#[allow(unused_variables)]
pub trait SmpListener: Send + Sync {
    fn pairing_state_changed(&self, peer: DeviceId, state: PairingState, mode: PairingMode) {}

    /// Called once after key distribution with the complete set, ready for
    /// persistence.
    fn keys_distributed(&self, peer: DeviceId, keys: &SmpKeyBin) {}
}

const SMP_READER_TICK: Duration = Duration::from_millis(250);

/// Keys distributed by the responder, collected piecewise.
#[derive(Default)]
struct RespKeys {
    ltk: Option<[u8; 16]>,
    ediv_rand: Option<(u16, u64)>,
    csrk: Option<[u8; 16]>,
    irk: Option<[u8; 16]>,
    identity: Option<DeviceId>,
}

struct PairingCtx {
    state: PairingState,
    mode: PairingMode,
    sec_level: SecurityLevel,
    io_cap: IoCapability,
    preloaded: Option<LongTermKey>,
    req: Option<PairingFeatures>,
    res: Option<PairingFeatures>,
    preq: Option<[u8; 7]>,
    pres: Option<[u8; 7]>,
    tk: Option<[u8; 16]>,
    local_random: Option<[u8; 16]>,
    confirm_sent: bool,
    peer_confirm: Option<[u8; 16]>,
    generated_passkey: Option<u32>,
    resp_keys: RespKeys,
}

impl PairingCtx {
    fn new() -> PairingCtx {
        PairingCtx {
            state: PairingState::None,
            mode: PairingMode::None,
            sec_level: SecurityLevel::None,
            io_cap: IoCapability::NoInputNoOutput,
            preloaded: None,
            req: None,
            res: None,
            preq: None,
            pres: None,
            tk: None,
            local_random: None,
            confirm_sent: false,
            peer_confirm: None,
            generated_passkey: None,
            resp_keys: RespKeys::default(),
        }
    }

    /// True once every key class the responder promised has arrived.
    fn responder_dist_complete(&self) -> bool {
        let Some(res) = &self.res else { return false };
        let dist = res.responder_key_dist;
        if dist.contains(KeyDistribution::ENC_KEY)
            && (self.resp_keys.ltk.is_none() || self.resp_keys.ediv_rand.is_none())
        {
            return false;
        }
        if dist.contains(KeyDistribution::SIGN_KEY) && self.resp_keys.csrk.is_none() {
            return false;
        }
        if dist.contains(KeyDistribution::ID_KEY)
            && (self.resp_keys.irk.is_none() || self.resp_keys.identity.is_none())
        {
            return false;
        }
        true
    }
}

/// Work computed under the context lock, executed outside it.
enum Action {
    Send(SmpPdu),
    Notify(PairingState, PairingMode),
    StartEncryption {
        rand: u64,
        ediv: u16,
        key: [u8; 16],
    },
    DeliverKeys(SmpKeyBin),
}

struct SmpInner {
    transport: Arc<dyn Transport>,
    crypto: Arc<dyn SmpCrypto>,
    link: Arc<dyn LinkEncrypter>,
    local: DeviceId,
    peer: DeviceId,
    listeners: ListenerRegistry<dyn SmpListener>,
    ctx: Mutex<PairingCtx>,
    closed: AtomicBool,
}

impl SmpInner {
    fn notify(&self, state: PairingState, mode: PairingMode) {
        for listener in self.listeners.snapshot() {
            listener.pairing_state_changed(self.peer, state, mode);
        }
    }

    fn set_state(&self, state: PairingState, mode: PairingMode) {
        {
            let mut ctx = self.ctx.lock().unwrap();
            ctx.state = state;
            ctx.mode = mode;
        }
        self.notify(state, mode);
    }

    /// Sends our confirm value once the TK is known.
    fn proceed_confirm(&self, ctx: &mut PairingCtx) -> Vec<Action> {
        let (Some(tk), Some(preq), Some(pres)) = (ctx.tk, ctx.preq, ctx.pres) else {
            return Vec::new();
        };
        let mut rand = [0u8; 16];
        self.crypto.fill_random(&mut rand);
        ctx.local_random = Some(rand);
        let confirm = self.crypto.c1(&tk, &rand, &preq, &pres, self.local, self.peer);
        ctx.confirm_sent = true;
        let mut actions = vec![Action::Send(SmpPdu::PairingConfirm { value: confirm })];
        // the peer may have answered a stalled exchange already
        if ctx.peer_confirm.is_some() {
            actions.push(Action::Send(SmpPdu::PairingRandom { value: rand }));
        }
        actions
    }

    /// Advances the state machine on one inbound PDU.
    fn handle_pdu(&self, pdu: SmpPdu) {
        trace!("smp {}: < {:?}", self.peer, pdu);
        let actions = {
            let mut ctx = self.ctx.lock().unwrap();
            self.advance(&mut ctx, pdu)
        };
        if let Err(err) = self.run(actions) {
            warn!("smp {}: {}", self.peer, err.kind());
        }
    }

    fn advance(&self, ctx: &mut PairingCtx, pdu: SmpPdu) -> Vec<Action> {
        match pdu {
            SmpPdu::SecurityRequest { .. } if ctx.state == PairingState::None => {
                // peripheral nudges us: fast path if we can
                if let Some(key) = ctx.preloaded {
                    ctx.state = PairingState::PrePaired;
                    ctx.mode = PairingMode::PrePaired;
                    vec![
                        Action::Notify(PairingState::PrePaired, PairingMode::PrePaired),
                        Action::StartEncryption {
                            rand: key.rand,
                            ediv: key.ediv,
                            key: key.ltk,
                        },
                    ]
                } else {
                    // the adapter drives start_pairing explicitly
                    debug!("smp {}: security request received", self.peer);
                    Vec::new()
                }
            }

            SmpPdu::PairingResponse(features)
                if ctx.state == PairingState::FeatureExchangeStarted =>
            {
                ctx.res = Some(features);
                ctx.pres = Some(features.to_octets(SMP_PAIRING_RESPONSE));
                ctx.state = PairingState::FeatureExchangeCompleted;
                let mut actions = vec![Action::Notify(
                    PairingState::FeatureExchangeCompleted,
                    ctx.mode,
                )];

                let req = ctx.req.expect("request sent before response");
                let mitm = req.auth_req.contains(AuthRequirements::MITM)
                    && features.auth_req.contains(AuthRequirements::MITM);
                let (mode, next) = negotiate_mode(ctx.io_cap, features.io_capability, mitm);
                ctx.mode = mode;
                match next {
                    MethodStart::JustWorks => {
                        ctx.tk = Some([0u8; 16]);
                        actions.extend(self.proceed_confirm(ctx));
                    }
                    MethodStart::DisplayPasskey => {
                        let mut raw = [0u8; 4];
                        self.crypto.fill_random(&mut raw);
                        let passkey = u32::from_le_bytes(raw) % 1_000_000;
                        ctx.generated_passkey = Some(passkey);
                        ctx.tk = Some(tk_from_passkey(passkey));
                        ctx.state = PairingState::PasskeyExpected;
                        actions.push(Action::Notify(PairingState::PasskeyExpected, mode));
                        // we display, the responder types: nothing to wait for
                        actions.extend(self.proceed_confirm(ctx));
                    }
                    MethodStart::InputPasskey => {
                        ctx.state = PairingState::PasskeyExpected;
                        actions.push(Action::Notify(PairingState::PasskeyExpected, mode));
                    }
                    MethodStart::Oob => {
                        actions.push(Action::Notify(PairingState::OobExpected, mode));
                        // out-of-band data is not sourced by this stack
                        ctx.state = PairingState::Failed;
                        actions.push(Action::Send(SmpPdu::PairingFailed {
                            reason: SmpFailureReason::OobNotAvailable,
                        }));
                        actions.push(Action::Notify(PairingState::Failed, mode));
                    }
                }
                actions
            }

            SmpPdu::PairingConfirm { value } => {
                ctx.peer_confirm = Some(value);
                if ctx.confirm_sent {
                    let rand = ctx.local_random.expect("confirm sent implies random drawn");
                    vec![Action::Send(SmpPdu::PairingRandom { value: rand })]
                } else {
                    Vec::new()
                }
            }

            SmpPdu::PairingRandom { value: peer_random } => {
                let (Some(tk), Some(preq), Some(pres), Some(peer_confirm), Some(local_random)) = (
                    ctx.tk,
                    ctx.preq,
                    ctx.pres,
                    ctx.peer_confirm,
                    ctx.local_random,
                ) else {
                    warn!("smp {}: random out of sequence", self.peer);
                    return fail(ctx, SmpFailureReason::UnspecifiedReason);
                };
                let expected =
                    self.crypto
                        .c1(&tk, &peer_random, &preq, &pres, self.local, self.peer);
                if expected != peer_confirm {
                    info!("smp {}: confirm value mismatch", self.peer);
                    return fail(ctx, SmpFailureReason::ConfirmValueFailed);
                }
                let stk = self.crypto.s1(&tk, &peer_random, &local_random);
                vec![Action::StartEncryption {
                    rand: 0,
                    ediv: 0,
                    key: stk,
                }]
            }

            SmpPdu::EncryptionInformation { ltk } => {
                ctx.resp_keys.ltk = Some(ltk);
                self.maybe_finish_distribution(ctx)
            }
            SmpPdu::CentralIdentification { ediv, rand } => {
                ctx.resp_keys.ediv_rand = Some((ediv, rand));
                self.maybe_finish_distribution(ctx)
            }
            SmpPdu::SigningInformation { csrk } => {
                ctx.resp_keys.csrk = Some(csrk);
                self.maybe_finish_distribution(ctx)
            }
            SmpPdu::IdentityInformation { irk } => {
                ctx.resp_keys.irk = Some(irk);
                self.maybe_finish_distribution(ctx)
            }
            SmpPdu::IdentityAddressInformation {
                address_type,
                address,
            } => {
                ctx.resp_keys.identity = Some(DeviceId::new(address, address_type));
                self.maybe_finish_distribution(ctx)
            }

            SmpPdu::PairingFailed { reason } => {
                info!("smp {}: pairing failed: {:?}", self.peer, reason);
                ctx.state = PairingState::Failed;
                vec![Action::Notify(PairingState::Failed, ctx.mode)]
            }

            other => {
                trace!("smp {}: ignoring {:?}", self.peer, other);
                Vec::new()
            }
        }
    }

    /// Once the responder finished distributing, send our keys and settle.
    fn maybe_finish_distribution(&self, ctx: &mut PairingCtx) -> Vec<Action> {
        if ctx.state != PairingState::KeyDistribution || !ctx.responder_dist_complete() {
            return Vec::new();
        }
        let res = ctx.res.expect("distribution implies feature exchange");
        let authenticated = ctx.mode != PairingMode::JustWorks;
        let mut props = KeyProps::VALID;
        if authenticated {
            props |= KeyProps::AUTHENTICATED;
        }

        let mut actions = Vec::new();
        let mut bin = SmpKeyBin::new(self.peer, ctx.sec_level, ctx.io_cap);

        if let (Some(ltk), Some((ediv, rand))) = (ctx.resp_keys.ltk, ctx.resp_keys.ediv_rand) {
            bin.resp_ltk = Some(LongTermKey {
                props,
                enc_size: res.max_encryption_key_size,
                ediv,
                rand,
                ltk,
            });
        }
        if let Some(csrk) = ctx.resp_keys.csrk {
            bin.resp_csrk = Some(SignatureKey { props, csrk });
        }

        if res.initiator_key_dist.contains(KeyDistribution::ENC_KEY) {
            let mut ltk = [0u8; 16];
            let mut misc = [0u8; 10];
            self.crypto.fill_random(&mut ltk);
            self.crypto.fill_random(&mut misc);
            let ediv = u16::from_le_bytes([misc[0], misc[1]]);
            let rand = u64::from_le_bytes(misc[2..10].try_into().expect("10 byte buffer"));
            bin.init_ltk = Some(LongTermKey {
                props,
                enc_size: 16,
                ediv,
                rand,
                ltk,
            });
            actions.push(Action::Send(SmpPdu::EncryptionInformation { ltk }));
            actions.push(Action::Send(SmpPdu::CentralIdentification { ediv, rand }));
        }
        if res.initiator_key_dist.contains(KeyDistribution::SIGN_KEY) {
            let mut csrk = [0u8; 16];
            self.crypto.fill_random(&mut csrk);
            bin.init_csrk = Some(SignatureKey { props, csrk });
            actions.push(Action::Send(SmpPdu::SigningInformation { csrk }));
        }

        ctx.state = PairingState::Completed;
        actions.push(Action::Notify(PairingState::Completed, ctx.mode));
        actions.push(Action::DeliverKeys(bin));
        actions
    }

    /// Executes actions computed under the context lock.
    fn run(&self, actions: Vec<Action>) -> Result<()> {
        for action in actions {
            match action {
                Action::Send(pdu) => {
                    trace!("smp {}: > {:?}", self.peer, pdu);
                    self.transport.write(&pdu.encode())?;
                }
                Action::Notify(state, mode) => self.notify(state, mode),
                Action::StartEncryption { rand, ediv, key } => {
                    let pre_paired = {
                        let ctx = self.ctx.lock().unwrap();
                        ctx.mode == PairingMode::PrePaired
                    };
                    match self.link.start_encryption(rand, ediv, &key) {
                        Ok(true) => {
                            if pre_paired {
                                self.set_state(PairingState::Completed, PairingMode::PrePaired);
                            } else {
                                let (mode, follow_up) = {
                                    let mut ctx = self.ctx.lock().unwrap();
                                    ctx.state = PairingState::KeyDistribution;
                                    // a peer promising no keys completes here
                                    (ctx.mode, self.maybe_finish_distribution(&mut ctx))
                                };
                                self.notify(PairingState::KeyDistribution, mode);
                                self.run(follow_up)?;
                            }
                        }
                        Ok(false) | Err(_) => {
                            let mode = {
                                let mut ctx = self.ctx.lock().unwrap();
                                ctx.state = PairingState::Failed;
                                ctx.mode
                            };
                            self.notify(PairingState::Failed, mode);
                            return Err(Error::EncryptionRequired);
                        }
                    }
                }
                Action::DeliverKeys(bin) => {
                    for listener in self.listeners.snapshot() {
                        listener.keys_distributed(self.peer, &bin);
                    }
                }
            }
        }
        Ok(())
    }
}

/// The per-connection SMP state machine.
pub struct SmpEngine {
    inner: Arc<SmpInner>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SmpEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        local: DeviceId,
        peer: DeviceId,
        crypto: Arc<dyn SmpCrypto>,
        link: Arc<dyn LinkEncrypter>,
    ) -> SmpEngine {
        let inner = Arc::new(SmpInner {
            transport,
            crypto,
            link,
            local,
            peer,
            listeners: ListenerRegistry::new(),
            ctx: Mutex::new(PairingCtx::new()),
            closed: AtomicBool::new(false),
        });
        let reader = {
            let inner = inner.clone();
            thread::Builder::new()
                .name(format!("smp-{}", peer.address))
                .spawn(move || reader_loop(inner))
                .expect("spawning smp reader")
        };
        SmpEngine {
            inner,
            reader: Mutex::new(Some(reader)),
        }
    }

    pub fn peer(&self) -> DeviceId {
        self.inner.peer
    }

    pub fn add_listener(&self, listener: Arc<dyn SmpListener>) {
        self.inner.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn SmpListener>) -> bool {
        self.inner.listeners.remove(listener)
    }

    pub fn pairing_state(&self) -> (PairingState, PairingMode) {
        let ctx = self.inner.ctx.lock().unwrap();
        (ctx.state, ctx.mode)
    }

    /// The passkey this side generated for display, when the negotiated
    /// mode is passkey-entry with the initiator displaying.
    pub fn generated_passkey(&self) -> Option<u32> {
        self.inner.ctx.lock().unwrap().generated_passkey
    }

    /// Pre-configures the desired security level and IO capability; must be
    /// called before pairing starts.
    pub fn set_conn_security(&self, level: SecurityLevel, io_cap: IoCapability) {
        let mut ctx = self.inner.ctx.lock().unwrap();
        ctx.sec_level = level;
        ctx.io_cap = io_cap;
    }

    /// Pre-loads a persisted LTK so the controller can start encryption
    /// without pairing.
    pub fn set_long_term_key(&self, key: LongTermKey) {
        self.inner.ctx.lock().unwrap().preloaded = Some(key);
    }

    pub fn has_stored_key(&self) -> bool {
        self.inner.ctx.lock().unwrap().preloaded.is_some()
    }

    /// The pre-paired fast path: start link encryption with the stored key
    /// and skip interactive pairing.
    pub fn start_encryption_with_stored(&self) -> Result<()> {
        let key = {
            let mut ctx = self.inner.ctx.lock().unwrap();
            let key = ctx
                .preloaded
                .ok_or_else(|| Error::InvalidArgument("no stored long-term key".into()))?;
            ctx.state = PairingState::PrePaired;
            ctx.mode = PairingMode::PrePaired;
            key
        };
        self.inner
            .notify(PairingState::PrePaired, PairingMode::PrePaired);

        match self
            .inner
            .link
            .start_encryption(key.rand, key.ediv, &key.ltk)
        {
            Ok(true) => {
                self.inner
                    .set_state(PairingState::Completed, PairingMode::PrePaired);
                info!("smp {}: pre-paired encryption established", self.inner.peer);
                Ok(())
            }
            Ok(false) => {
                self.inner
                    .set_state(PairingState::Failed, PairingMode::PrePaired);
                Err(Error::EncryptionRequired)
            }
            Err(err) => {
                self.inner
                    .set_state(PairingState::Failed, PairingMode::PrePaired);
                Err(err)
            }
        }
    }

    /// Starts interactive pairing as initiator (feature exchange first).
    pub fn start_pairing(&self) -> Result<()> {
        let actions = {
            let mut ctx = self.inner.ctx.lock().unwrap();
            if !matches!(ctx.state, PairingState::None | PairingState::Failed) {
                return Err(Error::InvalidArgument("pairing already in progress".into()));
            }
            let mut auth = AuthRequirements::BONDING;
            if ctx.sec_level >= SecurityLevel::EncryptedAuthenticated {
                auth |= AuthRequirements::MITM;
            }
            let features = PairingFeatures {
                io_capability: ctx.io_cap as u8,
                oob_data: false,
                auth_req: auth,
                max_encryption_key_size: 16,
                initiator_key_dist: KeyDistribution::ENC_KEY | KeyDistribution::SIGN_KEY,
                responder_key_dist: KeyDistribution::ENC_KEY
                    | KeyDistribution::SIGN_KEY
                    | KeyDistribution::ID_KEY,
            };
            ctx.req = Some(features);
            ctx.preq = Some(features.to_octets(SMP_PAIRING_REQUEST));
            ctx.state = PairingState::FeatureExchangeStarted;
            vec![
                Action::Send(SmpPdu::PairingRequest(features)),
                Action::Notify(PairingState::FeatureExchangeStarted, ctx.mode),
            ]
        };
        self.inner.run(actions)
    }

    /// Supplies the user-entered passkey for passkey-entry pairing.
    pub fn set_pairing_passkey(&self, passkey: u32) -> Result<()> {
        let actions = {
            let mut ctx = self.inner.ctx.lock().unwrap();
            if ctx.state != PairingState::PasskeyExpected {
                return Err(Error::InvalidArgument("no passkey expected".into()));
            }
            ctx.tk = Some(tk_from_passkey(passkey));
            self.inner.proceed_confirm(&mut ctx)
        };
        self.inner.run(actions)
    }

    /// Supplies the user's numeric-comparison verdict.
    pub fn set_pairing_numeric_compare(&self, equal: bool) -> Result<()> {
        let actions = {
            let mut ctx = self.inner.ctx.lock().unwrap();
            if ctx.state != PairingState::NumericCompareExpected {
                return Err(Error::InvalidArgument("no comparison expected".into()));
            }
            if equal {
                ctx.tk = Some([0u8; 16]);
                self.inner.proceed_confirm(&mut ctx)
            } else {
                ctx.state = PairingState::Failed;
                vec![
                    Action::Send(SmpPdu::PairingFailed {
                        reason: SmpFailureReason::NumericComparisonFailed,
                    }),
                    Action::Notify(PairingState::Failed, ctx.mode),
                ]
            }
        };
        self.inner.run(actions)
    }

    #[cfg(test)]
    fn handle_pdu(&self, pdu: SmpPdu) {
        self.inner.handle_pdu(pdu);
    }

    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.transport.close();
        }
        if let Some(handle) = self.reader.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.inner.listeners.clear();
    }
}

impl Drop for SmpEngine {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SmpEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (state, mode) = self.pairing_state();
        f.debug_struct("SmpEngine")
            .field("peer", &self.inner.peer)
            .field("state", &state)
            .field("mode", &mode)
            .finish()
    }
}

fn fail(ctx: &mut PairingCtx, reason: SmpFailureReason) -> Vec<Action> {
    ctx.state = PairingState::Failed;
    vec![
        Action::Send(SmpPdu::PairingFailed { reason }),
        Action::Notify(PairingState::Failed, ctx.mode),
    ]
}

fn tk_from_passkey(passkey: u32) -> [u8; 16] {
    let mut tk = [0u8; 16];
    tk[..4].copy_from_slice(&passkey.to_le_bytes());
    tk
}

enum MethodStart {
    JustWorks,
    DisplayPasskey,
    InputPasskey,
    Oob,
}

/// Legacy pairing method selection from the IO capability matrix.
fn negotiate_mode(local: IoCapability, remote_raw: u8, mitm: bool) -> (PairingMode, MethodStart) {
    let remote = IoCapability::from_u8(remote_raw).unwrap_or(IoCapability::NoInputNoOutput);
    if !mitm {
        return (PairingMode::JustWorks, MethodStart::JustWorks);
    }
    use IoCapability::*;
    match (local, remote) {
        (NoInputNoOutput, _) | (_, NoInputNoOutput) => {
            (PairingMode::JustWorks, MethodStart::JustWorks)
        }
        (DisplayOnly | DisplayYesNo, KeyboardOnly | KeyboardDisplay) => {
            (PairingMode::PasskeyEntryDisplay, MethodStart::DisplayPasskey)
        }
        (KeyboardOnly, _) => (PairingMode::PasskeyEntryInput, MethodStart::InputPasskey),
        (KeyboardDisplay, KeyboardOnly) => {
            (PairingMode::PasskeyEntryDisplay, MethodStart::DisplayPasskey)
        }
        (KeyboardDisplay, DisplayOnly | DisplayYesNo) => {
            (PairingMode::PasskeyEntryInput, MethodStart::InputPasskey)
        }
        (KeyboardDisplay, KeyboardDisplay) => {
            (PairingMode::PasskeyEntryDisplay, MethodStart::DisplayPasskey)
        }
        (DisplayOnly | DisplayYesNo, DisplayOnly | DisplayYesNo) => {
            (PairingMode::JustWorks, MethodStart::JustWorks)
        }
    }
}

fn reader_loop(inner: Arc<SmpInner>) {
    let mut buf = [0u8; 72];
    while !inner.closed.load(Ordering::SeqCst) {
        match inner.transport.read(&mut buf, SMP_READER_TICK) {
            Ok(0) => continue,
            Ok(n) => match SmpPdu::decode(&buf[..n]) {
                Ok(pdu) => inner.handle_pdu(pdu),
                Err(err) => warn!(
                    "smp {}: dropping undecodable PDU ({:?}): {:02x?}",
                    inner.peer,
                    err,
                    &buf[..n]
                ),
            },
            Err(Error::TimedOut(_)) | Err(Error::Interrupted) => continue,
            Err(err) => {
                if !inner.closed.load(Ordering::SeqCst) {
                    debug!("smp {}: pipe lost ({})", inner.peer, err.kind());
                }
                break;
            }
        }
    }
    debug!("smp {}: reader exiting", inner.peer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{AddressType, BDAddr};
    use std::sync::Mutex;

    /// Transport that records written PDUs and never yields inbound data.
    struct RecordingTransport {
        written: Mutex<Vec<SmpPdu>>,
        closed: AtomicBool,
    }

    impl RecordingTransport {
        fn new() -> Arc<RecordingTransport> {
            Arc::new(RecordingTransport {
                written: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            })
        }

        fn take(&self) -> Vec<SmpPdu> {
            std::mem::take(&mut *self.written.lock().unwrap())
        }
    }

    impl Transport for RecordingTransport {
        fn read(&self, _buf: &mut [u8], timeout: Duration) -> crate::Result<usize> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::closed("pipe closed"));
            }
            std::thread::sleep(timeout.min(Duration::from_millis(10)));
            Err(Error::TimedOut(timeout))
        }

        fn write(&self, data: &[u8]) -> crate::Result<()> {
            self.written
                .lock()
                .unwrap()
                .push(SmpPdu::decode(data).expect("engine wrote garbage"));
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn mtu(&self) -> u16 {
            23
        }
    }

    /// Deterministic stand-in: `c1 = tk ^ rand`, `s1 = halves of the rands`.
    struct FakeCrypto;

    impl SmpCrypto for FakeCrypto {
        fn fill_random(&self, out: &mut [u8]) {
            for (i, b) in out.iter_mut().enumerate() {
                *b = 0xd0 ^ (i as u8);
            }
        }

        fn c1(
            &self,
            tk: &[u8; 16],
            rand: &[u8; 16],
            _preq: &[u8; 7],
            _pres: &[u8; 7],
            _initiator: DeviceId,
            _responder: DeviceId,
        ) -> [u8; 16] {
            let mut out = [0u8; 16];
            for i in 0..16 {
                out[i] = tk[i] ^ rand[i];
            }
            out
        }

        fn s1(&self, _tk: &[u8; 16], resp_rand: &[u8; 16], init_rand: &[u8; 16]) -> [u8; 16] {
            let mut out = [0u8; 16];
            out[..8].copy_from_slice(&resp_rand[..8]);
            out[8..].copy_from_slice(&init_rand[..8]);
            out
        }
    }

    struct FakeLink {
        calls: Mutex<Vec<(u64, u16, [u8; 16])>>,
        answer: bool,
    }

    impl FakeLink {
        fn new(answer: bool) -> Arc<FakeLink> {
            Arc::new(FakeLink {
                calls: Mutex::new(Vec::new()),
                answer,
            })
        }
    }

    impl LinkEncrypter for FakeLink {
        fn start_encryption(&self, rand: u64, ediv: u16, key: &[u8; 16]) -> crate::Result<bool> {
            self.calls.lock().unwrap().push((rand, ediv, *key));
            Ok(self.answer)
        }
    }

    struct StateRecorder {
        states: Mutex<Vec<(PairingState, PairingMode)>>,
        keys: Mutex<Option<SmpKeyBin>>,
    }

    impl StateRecorder {
        fn new() -> Arc<StateRecorder> {
            Arc::new(StateRecorder {
                states: Mutex::new(Vec::new()),
                keys: Mutex::new(None),
            })
        }
    }

    impl SmpListener for StateRecorder {
        fn pairing_state_changed(&self, _peer: DeviceId, state: PairingState, mode: PairingMode) {
            self.states.lock().unwrap().push((state, mode));
        }

        fn keys_distributed(&self, _peer: DeviceId, keys: &SmpKeyBin) {
            *self.keys.lock().unwrap() = Some(keys.clone());
        }
    }

    fn local_id() -> DeviceId {
        DeviceId::new(
            "00:1A:7D:DA:71:13".parse::<BDAddr>().unwrap(),
            AddressType::LePublic,
        )
    }

    fn peer_id() -> DeviceId {
        DeviceId::new(
            "C0:26:DA:01:DA:B1".parse::<BDAddr>().unwrap(),
            AddressType::LePublic,
        )
    }

    fn engine_fixture(
        link_answer: bool,
    ) -> (
        SmpEngine,
        Arc<RecordingTransport>,
        Arc<FakeLink>,
        Arc<StateRecorder>,
    ) {
        let transport = RecordingTransport::new();
        let link = FakeLink::new(link_answer);
        let engine = SmpEngine::new(
            transport.clone(),
            local_id(),
            peer_id(),
            Arc::new(FakeCrypto),
            link.clone(),
        );
        let recorder = StateRecorder::new();
        engine.add_listener(recorder.clone());
        (engine, transport, link, recorder)
    }

    #[test]
    fn pre_paired_fast_path_reaches_completed() {
        let (engine, _transport, link, recorder) = engine_fixture(true);
        engine.set_long_term_key(LongTermKey {
            props: KeyProps::VALID,
            enc_size: 16,
            ediv: 0x4321,
            rand: 0x1122334455667788,
            ltk: [0x42; 16],
        });
        engine.start_encryption_with_stored().unwrap();

        assert_eq!(
            engine.pairing_state(),
            (PairingState::Completed, PairingMode::PrePaired)
        );
        assert_eq!(
            *link.calls.lock().unwrap(),
            vec![(0x1122334455667788, 0x4321, [0x42; 16])]
        );
        assert_eq!(
            *recorder.states.lock().unwrap(),
            vec![
                (PairingState::PrePaired, PairingMode::PrePaired),
                (PairingState::Completed, PairingMode::PrePaired),
            ]
        );
        engine.close();
    }

    #[test]
    fn fast_path_without_key_is_rejected() {
        let (engine, _transport, link, _recorder) = engine_fixture(true);
        assert!(matches!(
            engine.start_encryption_with_stored(),
            Err(Error::InvalidArgument(_))
        ));
        assert!(link.calls.lock().unwrap().is_empty());
        engine.close();
    }

    #[test]
    fn just_works_pairing_distributes_keys() {
        let (engine, transport, link, recorder) = engine_fixture(true);
        engine.set_conn_security(SecurityLevel::Encrypted, IoCapability::NoInputNoOutput);
        engine.start_pairing().unwrap();

        let sent = transport.take();
        let request = match &sent[..] {
            [SmpPdu::PairingRequest(f)] => *f,
            other => panic!("expected pairing request, got {:?}", other),
        };
        assert!(request.auth_req.contains(AuthRequirements::BONDING));
        assert!(!request.auth_req.contains(AuthRequirements::MITM));

        // responder echoes compatible features
        let response = PairingFeatures {
            io_capability: IoCapability::NoInputNoOutput as u8,
            oob_data: false,
            auth_req: AuthRequirements::BONDING,
            max_encryption_key_size: 16,
            initiator_key_dist: KeyDistribution::ENC_KEY | KeyDistribution::SIGN_KEY,
            responder_key_dist: KeyDistribution::ENC_KEY | KeyDistribution::SIGN_KEY,
        };
        engine.handle_pdu(SmpPdu::PairingResponse(response));
        assert_eq!(engine.pairing_state().1, PairingMode::JustWorks);

        // engine sent its confirm (tk = 0 so confirm == its random)
        let sent = transport.take();
        let our_confirm = match &sent[..] {
            [SmpPdu::PairingConfirm { value }] => *value,
            other => panic!("expected confirm, got {:?}", other),
        };

        // responder confirm: with the fake c1, confirm = tk ^ random = random
        let peer_random = [0x33u8; 16];
        engine.handle_pdu(SmpPdu::PairingConfirm { value: peer_random });
        let sent = transport.take();
        match &sent[..] {
            [SmpPdu::PairingRandom { value }] => assert_eq!(*value, our_confirm),
            other => panic!("expected random, got {:?}", other),
        }

        // peer random checks out; STK encryption starts
        engine.handle_pdu(SmpPdu::PairingRandom { value: peer_random });
        assert_eq!(engine.pairing_state().0, PairingState::KeyDistribution);
        assert_eq!(link.calls.lock().unwrap().len(), 1);
        let (rand, ediv, _stk) = link.calls.lock().unwrap()[0];
        assert_eq!((rand, ediv), (0, 0));

        // responder distributes its keys
        engine.handle_pdu(SmpPdu::EncryptionInformation { ltk: [0x42; 16] });
        engine.handle_pdu(SmpPdu::CentralIdentification {
            ediv: 0x4321,
            rand: 0x1122334455667788,
        });
        engine.handle_pdu(SmpPdu::SigningInformation { csrk: [0x24; 16] });

        assert_eq!(
            engine.pairing_state(),
            (PairingState::Completed, PairingMode::JustWorks)
        );
        // we answered with our own ENC and SIGN keys
        let sent = transport.take();
        assert!(matches!(sent[0], SmpPdu::EncryptionInformation { .. }));
        assert!(matches!(sent[1], SmpPdu::CentralIdentification { .. }));
        assert!(matches!(sent[2], SmpPdu::SigningInformation { .. }));

        let bin = recorder
            .keys
            .lock()
            .unwrap()
            .clone()
            .expect("keys delivered");
        assert_eq!(bin.peer, peer_id());
        assert_eq!(
            bin.resp_ltk.unwrap().ltk,
            [0x42; 16],
            "responder LTK preserved for the fast path"
        );
        assert_eq!(bin.resp_ltk.unwrap().ediv, 0x4321);
        assert!(bin.init_ltk.is_some());
        assert!(bin.init_csrk.is_some());

        // the delivered bin round-trips through the persistence layer
        let encoded = bin.encode();
        assert_eq!(SmpKeyBin::decode(&encoded).unwrap(), bin);

        let states: Vec<PairingState> = recorder
            .states
            .lock()
            .unwrap()
            .iter()
            .map(|(s, _)| *s)
            .collect();
        assert_eq!(
            states,
            vec![
                PairingState::FeatureExchangeStarted,
                PairingState::FeatureExchangeCompleted,
                PairingState::KeyDistribution,
                PairingState::Completed,
            ]
        );
        engine.close();
    }

    #[test]
    fn confirm_mismatch_fails_pairing() {
        let (engine, transport, _link, _recorder) = engine_fixture(true);
        engine.set_conn_security(SecurityLevel::Encrypted, IoCapability::NoInputNoOutput);
        engine.start_pairing().unwrap();
        transport.take();

        let response = PairingFeatures {
            io_capability: IoCapability::NoInputNoOutput as u8,
            oob_data: false,
            auth_req: AuthRequirements::BONDING,
            max_encryption_key_size: 16,
            initiator_key_dist: KeyDistribution::ENC_KEY,
            responder_key_dist: KeyDistribution::ENC_KEY,
        };
        engine.handle_pdu(SmpPdu::PairingResponse(response));
        transport.take();

        engine.handle_pdu(SmpPdu::PairingConfirm { value: [0x33; 16] });
        transport.take();
        // random that does not match the confirm
        engine.handle_pdu(SmpPdu::PairingRandom { value: [0x44; 16] });

        assert_eq!(engine.pairing_state().0, PairingState::Failed);
        let sent = transport.take();
        assert!(matches!(
            sent[..],
            [SmpPdu::PairingFailed {
                reason: SmpFailureReason::ConfirmValueFailed
            }]
        ));
        engine.close();
    }

    #[test]
    fn passkey_entry_input_waits_for_user() {
        let (engine, transport, _link, _recorder) = engine_fixture(true);
        engine.set_conn_security(
            SecurityLevel::EncryptedAuthenticated,
            IoCapability::KeyboardOnly,
        );
        engine.start_pairing().unwrap();
        let sent = transport.take();
        match &sent[..] {
            [SmpPdu::PairingRequest(f)] => {
                assert!(f.auth_req.contains(AuthRequirements::MITM))
            }
            other => panic!("expected request, got {:?}", other),
        }

        let response = PairingFeatures {
            io_capability: IoCapability::DisplayOnly as u8,
            oob_data: false,
            auth_req: AuthRequirements::BONDING | AuthRequirements::MITM,
            max_encryption_key_size: 16,
            initiator_key_dist: KeyDistribution::ENC_KEY,
            responder_key_dist: KeyDistribution::ENC_KEY,
        };
        engine.handle_pdu(SmpPdu::PairingResponse(response));
        assert_eq!(
            engine.pairing_state(),
            (PairingState::PasskeyExpected, PairingMode::PasskeyEntryInput)
        );
        // no confirm leaves the engine until the user types the passkey
        assert!(transport.take().is_empty());

        engine.set_pairing_passkey(123456).unwrap();
        let sent = transport.take();
        assert!(matches!(sent[..], [SmpPdu::PairingConfirm { .. }]));
        engine.close();
    }
}
