// rawble Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! A user-space Bluetooth Low Energy central host stack for Linux.
//!
//! `rawble` talks to the kernel's raw Bluetooth sockets directly: the MGMT
//! control channel for adapter enumeration and settings, a raw HCI socket
//! per controller for LE discovery and connection management, and per-device
//! L2CAP sockets carrying ATT/GATT and SMP. No daemon is involved.
//!
//! The entry point is [`Manager::get()`], which enumerates the controllers
//! announced on MGMT and publishes one [`Adapter`] per controller. Adapters
//! discover [`Device`]s; a connected device owns a GATT session for service
//! discovery, reads, writes and notifications, and an SMP engine that
//! negotiates link security and persists long-term keys so later sessions
//! skip pairing.
//!
//! All engines are thread-based: one reader thread per kernel socket, plus a
//! dispatcher per HCI handler. Every blocking call is bounded by a
//! configurable timeout (see [`config`]).

use std::time::Duration;

pub mod adapter;
pub mod api;
pub mod att;
pub mod codec;
pub mod config;
pub mod eir;
pub mod gatt;
pub mod hci;
pub mod l2cap;
pub mod manager;
pub mod mgmt;
pub mod ring;
pub mod smp;
mod sock;

pub use adapter::{Adapter, Device};
pub use manager::Manager;

use att::AttErrorCode;
use hci::constants::HciStatus;

/// The error type returned by every fallible operation in the stack.
///
/// Variants are failure *kinds*, not sources: a timeout waiting on the HCI
/// reply ring and a timeout waiting on an ATT response both surface as
/// [`Error::TimedOut`]. The short classification string returned by
/// [`Error::kind`] is stable and log-friendly.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),

    /// A blocked call was woken by component shutdown.
    #[error("operation interrupted")]
    Interrupted,

    #[error("adapter is not powered")]
    NotPowered,

    #[error("not supported: {0}")]
    NotSupported(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The peer's ATT server answered with `ERROR_RSP`.
    #[error("ATT error {code:?} on handle {handle:#06x}")]
    Att { code: AttErrorCode, handle: u16 },

    #[error("authentication required")]
    AuthenticationRequired,

    #[error("encryption required")]
    EncryptionRequired,

    #[error("unpair failed")]
    UnpairFailed,

    #[error("connection failed: {0:?}")]
    ConnectionFailed(HciStatus),

    #[error("disconnected: {0:?}")]
    Disconnected(HciStatus),

    #[error("device not connected")]
    NotConnected,

    /// The controller rejected the opcode as unknown.
    #[error("unknown HCI command")]
    UnknownCommand,

    #[error("internal failure: {0}")]
    InternalFailure(String),
}

impl Error {
    /// Stable classification string for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "IO_ERROR",
            Error::TimedOut(_) => "TIMEOUT",
            Error::Interrupted => "INTERRUPTED",
            Error::NotPowered => "NOT_POWERED",
            Error::NotSupported(_) => "NOT_SUPPORTED",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::Att { .. } => "ATT_ERROR",
            Error::AuthenticationRequired => "AUTHENTICATION_REQUIRED",
            Error::EncryptionRequired => "ENCRYPTION_REQUIRED",
            Error::UnpairFailed => "UNPAIR_FAILED",
            Error::ConnectionFailed(_) => "CONNECTION_FAILED",
            Error::Disconnected(_) => "DISCONNECTED",
            Error::NotConnected => "NOT_CONNECTED",
            Error::UnknownCommand => "UNKNOWN_COMMAND",
            Error::InternalFailure(_) => "INTERNAL_FAILURE",
        }
    }

    /// Fresh `IO_ERROR` for fan-out to multiple pending waiters.
    pub(crate) fn closed(what: &'static str) -> Error {
        Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, what))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_strings_are_stable() {
        assert_eq!(Error::NotPowered.kind(), "NOT_POWERED");
        assert_eq!(
            Error::TimedOut(Duration::from_millis(500)).kind(),
            "TIMEOUT"
        );
        assert_eq!(
            Error::Att {
                code: AttErrorCode::AttributeNotFound,
                handle: 0x2a
            }
            .kind(),
            "ATT_ERROR"
        );
        assert_eq!(Error::closed("hci socket closed").kind(), "IO_ERROR");
    }
}
