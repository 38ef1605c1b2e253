// rawble Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! Process-wide adapter enumeration over the MGMT channel.
//!
//! The [`Manager`] is the stack's only singleton: it owns the one MGMT
//! socket a process may reasonably hold, discovers controllers via
//! `READ_INDEX_LIST`/`READ_INFO`, publishes one [`Adapter`] per controller
//! and keeps the set current as controllers come and go. Shutdown closes
//! adapters in LIFO order and is idempotent.

use crate::adapter::Adapter;
use crate::api::{ChangedAdapterSetListener, ListenerRegistry};
use crate::config::{self, Config};
use crate::mgmt::{MgmtChannel, MgmtEvent, MgmtEventKind, MgmtEventListener};
use crate::{Error, Result};
use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

/// Which transports newly added adapters are configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtMode {
    BrEdr,
    Le,
    Dual,
}

impl Default for BtMode {
    fn default() -> Self {
        BtMode::Le
    }
}

static INSTANCE: OnceCell<Arc<Manager>> = OnceCell::new();

pub struct Manager {
    mgmt: Arc<MgmtChannel>,
    config: Config,
    adapters: Mutex<Vec<Arc<Adapter>>>,
    listeners: ListenerRegistry<dyn ChangedAdapterSetListener>,
    default_mode: Mutex<BtMode>,
    closed: AtomicBool,
    weak_self: Mutex<Weak<Manager>>,
}

impl Manager {
    /// The process-wide instance; opened on first touch, thread-safe.
    pub fn get() -> Result<Arc<Manager>> {
        INSTANCE.get_or_try_init(Manager::open).cloned()
    }

    fn open() -> Result<Arc<Manager>> {
        let config = config::global().clone();
        let mgmt = Arc::new(MgmtChannel::open(&config)?);
        let manager = Arc::new(Manager {
            mgmt: mgmt.clone(),
            config,
            adapters: Mutex::new(Vec::new()),
            listeners: ListenerRegistry::new(),
            default_mode: Mutex::new(BtMode::default()),
            closed: AtomicBool::new(false),
            weak_self: Mutex::new(Weak::new()),
        });
        *manager.weak_self.lock().unwrap() = Arc::downgrade(&manager);
        mgmt.add_listener(Arc::new(ManagerMgmtListener {
            manager: Arc::downgrade(&manager),
        }));

        let indexes = manager.mgmt.read_index_list()?;
        info!("manager: {} controller(s) announced", indexes.len());
        for index in indexes {
            if let Err(err) = manager.add_adapter(index) {
                warn!("manager: skipping hci{}: {}", index, err.kind());
            }
        }
        Ok(manager)
    }

    /// The BT mode propagated to each adapter as it is added.
    pub fn set_default_mode(&self, mode: BtMode) {
        *self.default_mode.lock().unwrap() = mode;
    }

    pub fn default_mode(&self) -> BtMode {
        *self.default_mode.lock().unwrap()
    }

    pub fn adapters(&self) -> Vec<Arc<Adapter>> {
        self.adapters.lock().unwrap().clone()
    }

    pub fn adapter(&self, dev_id: u16) -> Option<Arc<Adapter>> {
        self.adapters
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.dev_id() == dev_id)
            .cloned()
    }

    /// Registers a changed-adapter-set listener; it immediately hears about
    /// every adapter already present.
    pub fn add_changed_adapter_set_listener(&self, listener: Arc<dyn ChangedAdapterSetListener>) {
        for adapter in self.adapters() {
            listener.adapter_added(&adapter);
        }
        self.listeners.add(listener);
    }

    pub fn remove_changed_adapter_set_listener(
        &self,
        listener: &Arc<dyn ChangedAdapterSetListener>,
    ) -> bool {
        self.listeners.remove(listener)
    }

    fn add_adapter(self: &Arc<Self>, index: u16) -> Result<()> {
        if self.adapter(index).is_some() {
            return Ok(());
        }
        let info = self.mgmt.read_info(index)?;
        debug!("manager: hci{} is {:?}", index, info);

        // propagate the default transport mode before the adapter powers up
        let mode = self.default_mode();
        let le = matches!(mode, BtMode::Le | BtMode::Dual);
        let bredr = matches!(mode, BtMode::BrEdr | BtMode::Dual);
        if let Err(err) = self.mgmt.set_le(index, le) {
            debug!("manager: hci{} set_le: {}", index, err.kind());
        }
        if let Err(err) = self.mgmt.set_bredr(index, bredr) {
            debug!("manager: hci{} set_bredr: {}", index, err.kind());
        }

        let adapter = Adapter::new(index, &info, self.mgmt.clone(), &self.config)?;
        self.adapters.lock().unwrap().push(adapter.clone());
        for listener in self.listeners.snapshot() {
            listener.adapter_added(&adapter);
        }
        Ok(())
    }

    fn remove_adapter(&self, index: u16) {
        let removed = {
            let mut adapters = self.adapters.lock().unwrap();
            match adapters.iter().position(|a| a.dev_id() == index) {
                Some(pos) => Some(adapters.remove(pos)),
                None => None,
            }
        };
        if let Some(adapter) = removed {
            adapter.close();
            for listener in self.listeners.snapshot() {
                listener.adapter_removed(&adapter);
            }
        }
    }

    /// Idempotent teardown: callbacks unregistered, adapters closed in LIFO
    /// order, MGMT closed last.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.listeners.clear();
        let adapters: Vec<Arc<Adapter>> = {
            let mut guard = self.adapters.lock().unwrap();
            guard.drain(..).collect()
        };
        for adapter in adapters.into_iter().rev() {
            adapter.close();
        }
        self.mgmt.close();
        info!("manager: shut down");
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("adapters", &self.adapters.lock().unwrap().len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

/// Routes MGMT events to the owning adapter, and index changes to the
/// manager itself.
struct ManagerMgmtListener {
    manager: Weak<Manager>,
}

impl MgmtEventListener for ManagerMgmtListener {
    fn on_event(&self, event: &MgmtEvent) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        match &event.kind {
            MgmtEventKind::IndexAdded => {
                // READ_INFO cannot run on the dispatching reader thread:
                // its reply would arrive on this very thread
                let index = event.index;
                let manager = manager.clone();
                thread::spawn(move || {
                    if let Err(err) = manager.add_adapter(index) {
                        warn!("manager: adding hci{} failed: {}", index, err.kind());
                    }
                });
            }
            MgmtEventKind::IndexRemoved => {
                manager.remove_adapter(event.index);
            }
            MgmtEventKind::CommandComplete { .. } | MgmtEventKind::CommandStatus { .. } => {}
            _ => {
                if let Some(adapter) = manager.adapter(event.index) {
                    adapter.handle_mgmt_event(event);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mode_is_le() {
        assert_eq!(BtMode::default(), BtMode::Le);
    }

    #[test]
    fn mode_transport_mapping() {
        for (mode, le, bredr) in [
            (BtMode::Le, true, false),
            (BtMode::BrEdr, false, true),
            (BtMode::Dual, true, true),
        ] {
            assert_eq!(matches!(mode, BtMode::Le | BtMode::Dual), le);
            assert_eq!(matches!(mode, BtMode::BrEdr | BtMode::Dual), bredr);
        }
    }
}
