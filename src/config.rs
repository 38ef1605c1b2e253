// rawble Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! Environment-style runtime options.
//!
//! Every tunable is a `rawble.<prefix>.<option>` name/value pair read from
//! the process environment once at first touch, e.g.
//! `rawble.hci.cmd.complete.timeout=5000`. Handlers copy the values they
//! care about at construction, so tests can build handlers from an explicit
//! [`Config`] without touching the environment.

use bitflags::bitflags;
use log::{info, warn};
use once_cell::sync::Lazy;
use std::time::Duration;

bitflags! {
    /// Extra wire-level debug logging, enabled per subsystem via the
    /// `rawble.debug` option (comma-separated names, or `all`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DebugFlags: u8 {
        const ADAPTER_EVENT = 1 << 0;
        const GATT_DATA = 1 << 1;
        const HCI_EVENT = 1 << 2;
        const HCI_SCAN_AD_EIR = 1 << 3;
        const MGMT_EVENT = 1 << 4;
    }
}

impl DebugFlags {
    fn parse(value: &str) -> DebugFlags {
        let mut flags = DebugFlags::empty();
        for name in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match name {
                "all" | "true" => flags = DebugFlags::all(),
                "adapter.event" => flags |= DebugFlags::ADAPTER_EVENT,
                "gatt.data" => flags |= DebugFlags::GATT_DATA,
                "hci.event" => flags |= DebugFlags::HCI_EVENT,
                "hci.scan_ad_eir" => flags |= DebugFlags::HCI_SCAN_AD_EIR,
                "mgmt.event" => flags |= DebugFlags::MGMT_EVENT,
                other => warn!("unknown debug flag '{}'", other),
            }
        }
        flags
    }
}

/// All recognised options with their defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub mgmt_cmd_timeout: Duration,
    pub mgmt_ringsize: usize,

    pub hci_cmd_complete_timeout: Duration,
    pub hci_cmd_status_timeout: Duration,
    pub hci_ringsize: usize,

    pub gatt_cmd_read_timeout: Duration,
    pub gatt_cmd_write_timeout: Duration,
    pub gatt_cmd_init_timeout: Duration,
    pub gatt_ringsize: usize,

    pub l2cap_reader_timeout: Duration,
    pub l2cap_restart_count: u32,

    pub debug: DebugFlags,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mgmt_cmd_timeout: Duration::from_millis(3000),
            mgmt_ringsize: 64,
            hci_cmd_complete_timeout: Duration::from_millis(10000),
            hci_cmd_status_timeout: Duration::from_millis(3000),
            hci_ringsize: 64,
            gatt_cmd_read_timeout: Duration::from_millis(500),
            gatt_cmd_write_timeout: Duration::from_millis(500),
            gatt_cmd_init_timeout: Duration::from_millis(2500),
            gatt_ringsize: 128,
            l2cap_reader_timeout: Duration::from_millis(10000),
            l2cap_restart_count: 0,
            debug: DebugFlags::empty(),
        }
    }
}

impl Config {
    /// Reads the full option table from the environment.
    pub fn from_env() -> Config {
        let mut cfg = Config::default();
        cfg.mgmt_cmd_timeout = env_ms("mgmt.cmd.timeout", cfg.mgmt_cmd_timeout);
        cfg.mgmt_ringsize = env_usize("mgmt.ringsize", cfg.mgmt_ringsize);
        cfg.hci_cmd_complete_timeout =
            env_ms("hci.cmd.complete.timeout", cfg.hci_cmd_complete_timeout);
        cfg.hci_cmd_status_timeout = env_ms("hci.cmd.status.timeout", cfg.hci_cmd_status_timeout);
        cfg.hci_ringsize = env_usize("hci.ringsize", cfg.hci_ringsize);
        cfg.gatt_cmd_read_timeout = env_ms("gatt.cmd.read.timeout", cfg.gatt_cmd_read_timeout);
        cfg.gatt_cmd_write_timeout = env_ms("gatt.cmd.write.timeout", cfg.gatt_cmd_write_timeout);
        cfg.gatt_cmd_init_timeout = env_ms("gatt.cmd.init.timeout", cfg.gatt_cmd_init_timeout);
        cfg.gatt_ringsize = env_usize("gatt.ringsize", cfg.gatt_ringsize);
        cfg.l2cap_reader_timeout = env_ms("l2cap.reader.timeout", cfg.l2cap_reader_timeout);
        cfg.l2cap_restart_count = env_u32("l2cap.restart.count", cfg.l2cap_restart_count);
        if let Ok(value) = std::env::var("rawble.debug") {
            cfg.debug = DebugFlags::parse(&value);
            info!("debug flags: {:?}", cfg.debug);
        }
        cfg
    }

    pub fn debug_enabled(&self, flag: DebugFlags) -> bool {
        self.debug.contains(flag)
    }
}

fn env_raw(option: &str) -> Option<String> {
    std::env::var(format!("rawble.{}", option)).ok()
}

fn env_ms(option: &str, default: Duration) -> Duration {
    match env_raw(option).map(|v| v.parse::<u64>()) {
        Some(Ok(ms)) => Duration::from_millis(ms),
        Some(Err(_)) => {
            warn!("ignoring malformed option rawble.{}", option);
            default
        }
        None => default,
    }
}

fn env_usize(option: &str, default: usize) -> usize {
    match env_raw(option).map(|v| v.parse::<usize>()) {
        Some(Ok(v)) if v > 0 => v,
        Some(_) => {
            warn!("ignoring malformed option rawble.{}", option);
            default
        }
        None => default,
    }
}

fn env_u32(option: &str, default: u32) -> u32 {
    match env_raw(option).map(|v| v.parse::<u32>()) {
        Some(Ok(v)) => v,
        Some(Err(_)) => {
            warn!("ignoring malformed option rawble.{}", option);
            default
        }
        None => default,
    }
}

static GLOBAL: Lazy<Config> = Lazy::new(Config::from_env);

/// The process-wide configuration, resolved once at first touch.
pub fn global() -> &'static Config {
    &GLOBAL
}
