// rawble Source Code File
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! Non-blocking-free socket base: open, bounded read, full write, idempotent
//! close. The HCI, MGMT and L2CAP channels are all built on [`Socket`].
//!
//! Reads are bounded with `poll(2)` so a reader thread can observe its stop
//! flag; `close` shuts the socket down first, which wakes a reader blocked
//! in `poll` on another thread.

pub mod sys;

use libc::{c_int, c_void, sockaddr, socklen_t};
use log::warn;
use std::io::{Error, ErrorKind, Result};
use std::mem::{size_of, MaybeUninit};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Outcome of one bounded read.
#[derive(Debug)]
pub enum ReadOutcome {
    /// `n` bytes were read into the buffer.
    Data(usize),
    TimedOut,
    /// The call was interrupted by a signal.
    Interrupted,
    /// End of stream: the peer hung up or the socket was closed locally.
    Closed,
    Error(Error),
}

/// A connected or bound kernel socket with idempotent close.
#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
    closed: AtomicBool,
}

impl Socket {
    /// Creates a socket of the given family/type/protocol.
    pub fn open(family: c_int, ty: c_int, proto: c_int) -> Result<Socket> {
        let fd = unsafe { libc::socket(family, ty | libc::SOCK_CLOEXEC, proto) };
        if fd < 0 {
            return Err(Error::last_os_error());
        }
        Ok(Socket {
            fd,
            closed: AtomicBool::new(false),
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Binds to a raw socket address structure.
    pub fn bind<SA>(&self, sa: &SA) -> Result<()> {
        let rc = unsafe {
            libc::bind(
                self.fd,
                sa as *const SA as *const sockaddr,
                size_of::<SA>() as socklen_t,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(Error::last_os_error())
        }
    }

    /// Connects to a raw socket address structure (blocking).
    pub fn connect<SA>(&self, sa: &SA) -> Result<()> {
        let rc = unsafe {
            libc::connect(
                self.fd,
                sa as *const SA as *const sockaddr,
                size_of::<SA>() as socklen_t,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(Error::last_os_error())
        }
    }

    pub fn setsockopt<T>(&self, level: c_int, optname: c_int, optval: &T) -> Result<()> {
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                level,
                optname,
                optval as *const T as *const c_void,
                size_of::<T>() as socklen_t,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(Error::last_os_error())
        }
    }

    pub fn getsockopt<T>(&self, level: c_int, optname: c_int) -> Result<T> {
        let mut optval: MaybeUninit<T> = MaybeUninit::uninit();
        let mut optlen: socklen_t = size_of::<T>() as socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.fd,
                level,
                optname,
                optval.as_mut_ptr() as *mut c_void,
                &mut optlen,
            )
        };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        if optlen != size_of::<T>() as socklen_t {
            return Err(Error::new(ErrorKind::InvalidInput, "invalid optlen"));
        }
        Ok(unsafe { optval.assume_init() })
    }

    /// Reads once, waiting at most `timeout` for readability.
    ///
    /// `None` waits indefinitely (still woken by [`Socket::close`]).
    pub fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> ReadOutcome {
        if self.is_closed() {
            return ReadOutcome::Closed;
        }

        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms: c_int = match timeout {
            Some(t) => t.as_millis().min(c_int::MAX as u128) as c_int,
            None => -1,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc == 0 {
            return ReadOutcome::TimedOut;
        }
        if rc < 0 {
            let err = Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EINTR) => ReadOutcome::Interrupted,
                _ => ReadOutcome::Error(err),
            };
        }
        if self.is_closed() {
            return ReadOutcome::Closed;
        }

        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        match n {
            0 => ReadOutcome::Closed,
            n if n > 0 => ReadOutcome::Data(n as usize),
            _ => {
                let err = Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => ReadOutcome::Interrupted,
                    Some(libc::EAGAIN) => ReadOutcome::TimedOut,
                    Some(libc::EBADF) | Some(libc::ECONNRESET) => ReadOutcome::Closed,
                    _ => ReadOutcome::Error(err),
                }
            }
        }
    }

    /// Writes the whole buffer, looping on short writes and `EINTR`.
    pub fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            if self.is_closed() {
                return Err(Error::new(ErrorKind::BrokenPipe, "socket closed"));
            }
            let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const c_void, buf.len()) };
            if n < 0 {
                let err = Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }
            buf = &buf[n as usize..];
        }
        Ok(())
    }

    /// Idempotent close; wakes a reader blocked on another thread.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        unsafe {
            if libc::shutdown(self.fd, libc::SHUT_RDWR) < 0 {
                // raw HCI sockets reject shutdown; close alone wakes poll
                let err = Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOTCONN) {
                    warn!("socket shutdown failed: {}", err);
                }
            }
            libc::close(self.fd);
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn socketpair() -> (Socket, Socket) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0, "socketpair failed: {}", Error::last_os_error());
        (
            Socket {
                fd: fds[0],
                closed: AtomicBool::new(false),
            },
            Socket {
                fd: fds[1],
                closed: AtomicBool::new(false),
            },
        )
    }

    #[test]
    fn read_returns_written_datagram() {
        let (a, b) = socketpair();
        a.write_all(&[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 16];
        match b.read(&mut buf, Some(Duration::from_secs(1))) {
            ReadOutcome::Data(4) => assert_eq!(&buf[..4], &[1, 2, 3, 4]),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn read_times_out() {
        let (_a, b) = socketpair();
        let begin = Instant::now();
        let mut buf = [0u8; 16];
        match b.read(&mut buf, Some(Duration::from_millis(50))) {
            ReadOutcome::TimedOut => {}
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(begin.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn close_wakes_blocked_reader() {
        let (a, b) = socketpair();
        let b = Arc::new(b);
        let reader = {
            let b = b.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 16];
                b.read(&mut buf, Some(Duration::from_secs(10)))
            })
        };
        thread::sleep(Duration::from_millis(30));
        b.close();
        match reader.join().unwrap() {
            ReadOutcome::Closed => {}
            other => panic!("unexpected outcome {:?}", other),
        }
        // close is idempotent
        b.close();
        drop(a);
    }

    #[test]
    fn peer_hangup_reads_closed() {
        let (a, b) = socketpair();
        drop(a);
        let mut buf = [0u8; 16];
        match b.read(&mut buf, Some(Duration::from_secs(1))) {
            ReadOutcome::Closed => {}
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
