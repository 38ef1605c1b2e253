// rawble Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! System native types and constants for the kernel's Bluetooth sockets.
#![allow(dead_code, non_camel_case_types)]

use libc::sa_family_t;

pub const BTPROTO_L2CAP: i32 = 0;
pub const BTPROTO_HCI: i32 = 1;

pub const SOL_HCI: i32 = 0;
pub const SOL_L2CAP: i32 = 6;
pub const SOL_BLUETOOTH: i32 = 274;

pub const HCI_FILTER: i32 = 2;

pub const HCI_CHANNEL_RAW: u16 = 0;
pub const HCI_CHANNEL_USER: u16 = 1;
pub const HCI_CHANNEL_MONITOR: u16 = 2;
pub const HCI_CHANNEL_CONTROL: u16 = 3;

/// `hci_dev` value binding a control (MGMT) channel to no controller.
pub const HCI_DEV_NONE: u16 = 0xffff;

/// HCI socket address.
#[repr(C)]
#[derive(Clone)]
pub struct sockaddr_hci {
    pub hci_family: sa_family_t,
    pub hci_dev: u16,
    pub hci_channel: u16,
}

/// HCI socket filter (`SOL_HCI`/`HCI_FILTER`).
#[repr(C)]
#[derive(Clone, Default)]
pub struct hci_filter {
    pub type_mask: u32,
    pub event_mask: [u32; 2],
    pub opcode: u16,
}

/// Bluetooth address in kernel wire order (LSB first).
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct bdaddr_t {
    pub b: [u8; 6],
}

pub const BDADDR_BREDR: u8 = 0x00;
pub const BDADDR_LE_PUBLIC: u8 = 0x01;
pub const BDADDR_LE_RANDOM: u8 = 0x02;

/// L2CAP socket address.
#[repr(C)]
#[derive(Clone)]
pub struct sockaddr_l2 {
    pub l2_family: sa_family_t,
    pub l2_psm: u16,
    pub l2_bdaddr: bdaddr_t,
    pub l2_cid: u16,
    pub l2_bdaddr_type: u8,
}

/// Bluetooth security socket option (`SOL_BLUETOOTH`/`BT_SECURITY`).
#[repr(C)]
#[derive(Clone)]
pub struct bt_security {
    pub level: u8,
    pub key_size: u8,
}

pub const BT_SECURITY: i32 = 4;
pub const BT_SECURITY_SDP: u8 = 0;
pub const BT_SECURITY_LOW: u8 = 1;
pub const BT_SECURITY_MEDIUM: u8 = 2;
pub const BT_SECURITY_HIGH: u8 = 3;
pub const BT_SECURITY_FIPS: u8 = 4;

pub const L2CAP_OPTIONS: i32 = 0x01;
pub const L2CAP_CONNINFO: i32 = 0x02;

/// Classic L2CAP socket options, read back for the negotiated MTUs.
#[repr(C)]
#[derive(Clone, Debug)]
pub struct l2cap_options {
    pub omtu: u16,
    pub imtu: u16,
    pub flush_to: u16,
    pub mode: u8,
    pub fcs: u8,
    pub max_tx: u8,
    pub txwin_size: u16,
}

impl Default for l2cap_options {
    fn default() -> Self {
        Self {
            omtu: 0,
            imtu: 672,
            flush_to: 65535,
            mode: 0,
            fcs: 0x01,
            max_tx: 3,
            txwin_size: 63,
        }
    }
}

/// L2CAP connection information (`SOL_L2CAP`/`L2CAP_CONNINFO`).
#[repr(C)]
#[derive(Clone, Debug, Default)]
pub struct l2cap_conninfo {
    pub hci_handle: u16,
    pub dev_class: [u8; 3],
}
