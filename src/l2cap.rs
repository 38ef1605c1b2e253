// rawble Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! Per-connection L2CAP client socket.
//!
//! Each connected device owns one pipe per fixed channel: ATT on CID 0x0004
//! and SMP on CID 0x0006. The socket is bound to the adapter's own address
//! and connected to the peer, which attaches it to the existing LE link the
//! HCI handler negotiated.

use crate::api::{AddressType, DeviceId, SecurityLevel};
use crate::sock::{sys, ReadOutcome, Socket};
use crate::{Error, Result};
use log::{debug, info, warn};
use std::sync::Mutex;
use std::time::Duration;

/// Fixed channel carrying ATT.
pub const ATT_CID: u16 = 0x0004;
/// Fixed channel carrying SMP.
pub const SMP_CID: u16 = 0x0006;

/// Default LE ATT MTU when the kernel reports nothing better.
pub const DEFAULT_MTU: u16 = 672;

/// The byte-pipe seam the GATT and SMP sessions run over; production code
/// uses [`L2capClient`], tests substitute an in-process pair.
pub trait Transport: Send + Sync {
    /// Reads one inbound frame, waiting at most `timeout`.
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Writes one outbound frame completely.
    fn write(&self, data: &[u8]) -> Result<()>;

    /// Idempotent close; wakes a blocked reader.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Receive-side MTU of this pipe.
    fn mtu(&self) -> u16;
}

fn bdaddr_type(address_type: AddressType) -> u8 {
    match address_type {
        AddressType::BrEdr => sys::BDADDR_BREDR,
        AddressType::LePublic => sys::BDADDR_LE_PUBLIC,
        AddressType::LeRandom => sys::BDADDR_LE_RANDOM,
        AddressType::Undefined => sys::BDADDR_LE_PUBLIC,
    }
}

fn sockaddr(id: DeviceId, psm: u16, cid: u16) -> sys::sockaddr_l2 {
    sys::sockaddr_l2 {
        l2_family: libc::AF_BLUETOOTH as libc::sa_family_t,
        l2_psm: psm.to_le(),
        l2_bdaddr: sys::bdaddr_t {
            b: id.address.to_le_bytes(),
        },
        l2_cid: cid.to_le(),
        l2_bdaddr_type: bdaddr_type(id.address_type),
    }
}

/// A connected L2CAP pipe bound to
/// `{local BDADDR+type, remote BDADDR+type, PSM, CID}`.
pub struct L2capClient {
    socket: Socket,
    local: DeviceId,
    remote: DeviceId,
    psm: u16,
    cid: u16,
    imtu: u16,
    omtu: u16,
    hci_handle: u16,
    /// At most one concurrent read and one concurrent write.
    read_lock: Mutex<()>,
    write_lock: Mutex<()>,
}

impl L2capClient {
    /// Opens, binds and connects the pipe. Succeeds once the kernel has
    /// attached it to the completed LE connection.
    pub fn open(
        local: DeviceId,
        remote: DeviceId,
        psm: u16,
        cid: u16,
        security: SecurityLevel,
    ) -> Result<L2capClient> {
        let socket = Socket::open(
            libc::AF_BLUETOOTH,
            libc::SOCK_SEQPACKET,
            sys::BTPROTO_L2CAP,
        )?;
        socket.bind(&sockaddr(local, 0, cid))?;

        if security > SecurityLevel::None {
            let sec = sys::bt_security {
                level: security as u8,
                key_size: 0,
            };
            socket.setsockopt(sys::SOL_BLUETOOTH, sys::BT_SECURITY, &sec)?;
        }

        socket.connect(&sockaddr(remote, psm, cid))?;

        let (imtu, omtu) = match socket.getsockopt::<sys::l2cap_options>(
            sys::SOL_L2CAP,
            sys::L2CAP_OPTIONS,
        ) {
            Ok(opts) => (opts.imtu, opts.omtu),
            Err(err) => {
                // LE fixed channels on newer kernels reject L2CAP_OPTIONS
                debug!("l2cap {}: no L2CAP_OPTIONS ({}), using defaults", remote, err);
                (DEFAULT_MTU, DEFAULT_MTU)
            }
        };
        let hci_handle = match socket
            .getsockopt::<sys::l2cap_conninfo>(sys::SOL_L2CAP, sys::L2CAP_CONNINFO)
        {
            Ok(info) => info.hci_handle,
            Err(err) => {
                warn!("l2cap {}: no CONNINFO: {}", remote, err);
                0
            }
        };

        info!(
            "l2cap {}: open cid {:#06x} psm {} imtu {} handle {:#06x}",
            remote, cid, psm, imtu, hci_handle
        );
        Ok(L2capClient {
            socket,
            local,
            remote,
            psm,
            cid,
            imtu,
            omtu,
            hci_handle,
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
        })
    }

    pub fn local(&self) -> DeviceId {
        self.local
    }

    pub fn remote(&self) -> DeviceId {
        self.remote
    }

    pub fn cid(&self) -> u16 {
        self.cid
    }

    pub fn psm(&self) -> u16 {
        self.psm
    }

    pub fn imtu(&self) -> u16 {
        self.imtu
    }

    pub fn omtu(&self) -> u16 {
        self.omtu
    }

    /// The HCI connection handle this pipe rides on.
    pub fn hci_handle(&self) -> u16 {
        self.hci_handle
    }

    /// Raises the link security level on the open socket.
    pub fn set_security(&self, level: SecurityLevel) -> Result<()> {
        let sec = sys::bt_security {
            level: level as u8,
            key_size: 0,
        };
        self.socket
            .setsockopt(sys::SOL_BLUETOOTH, sys::BT_SECURITY, &sec)?;
        Ok(())
    }
}

impl Transport for L2capClient {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let _one_reader = self.read_lock.lock().unwrap();
        match self.socket.read(buf, Some(timeout)) {
            ReadOutcome::Data(n) => Ok(n),
            ReadOutcome::TimedOut => Err(Error::TimedOut(timeout)),
            ReadOutcome::Interrupted => Err(Error::Interrupted),
            ReadOutcome::Closed => Err(Error::closed("l2cap pipe closed")),
            ReadOutcome::Error(err) => Err(Error::Io(err)),
        }
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        let _one_writer = self.write_lock.lock().unwrap();
        self.socket.write_all(data).map_err(Error::Io)
    }

    fn close(&self) {
        if !self.socket.is_closed() {
            info!("l2cap {}: closing cid {:#06x}", self.remote, self.cid);
        }
        self.socket.close();
    }

    fn is_closed(&self) -> bool {
        self.socket.is_closed()
    }

    fn mtu(&self) -> u16 {
        self.imtu
    }
}

impl Drop for L2capClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for L2capClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("L2capClient")
            .field("remote", &self.remote)
            .field("cid", &self.cid)
            .field("psm", &self.psm)
            .field("imtu", &self.imtu)
            .field("hci_handle", &self.hci_handle)
            .field("closed", &self.socket.is_closed())
            .finish()
    }
}
