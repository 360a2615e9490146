//! Privilege-separated socket binder, grounded on `binder.c`. A child
//! process is forked before the parent drops privileges; parent and child
//! talk over a `SOCK_STREAM` socketpair using the framing spec §4.7/§6
//! describe: the parent sends `{addr_len, addr bytes}`, the child replies
//! with either an `SCM_RIGHTS` ancillary message carrying one bound (not
//! listening) file descriptor, or a plain-text error line.
//!
//! The original encodes the request as a raw `struct sockaddr`; this port
//! encodes it as the address's canonical display string (spec §4.2) since
//! there is no C peer to stay byte-compatible with, and a UTF-8 string is
//! far less fiddly to get right than reconstructing a platform `sockaddr`
//! by hand. Socket creation and `SO_REUSEADDR` use `socket2`, which both
//! the listener (§4.8) and the binder child share for that reason.

use std::io;
use std::io::{IoSlice, IoSliceMut};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::str::FromStr;

use nix::cmsg_space;
use nix::sys::socket::{self, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType};
use nix::unistd::{self, ForkResult, Pid};
use socket2::{Domain, Socket, Type};

use crate::address::Address;
use crate::listener::Protocol;

const MAX_REQUEST_LEN: usize = 256;

/// Which socket type to create for a bind request, since TLS/HTTP listeners
/// need `SOCK_STREAM` and DTLS needs `SOCK_DGRAM` (spec §4.1's "minimally
/// DTLS" over UDP).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockKind {
    Stream,
    Dgram,
}

impl From<Protocol> for SockKind {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Tls | Protocol::Http => SockKind::Stream,
            Protocol::Dtls => SockKind::Dgram,
        }
    }
}

impl SockKind {
    fn to_wire(self) -> u8 {
        match self {
            SockKind::Stream => 0,
            SockKind::Dgram => 1,
        }
    }

    fn from_wire(b: u8) -> Option<Self> {
        match b {
            0 => Some(SockKind::Stream),
            1 => Some(SockKind::Dgram),
            _ => None,
        }
    }
}

/// Handle held by the parent process after [`Binder::start`].
pub struct Binder {
    sock: OwnedFd,
    child_pid: Pid,
}

impl Binder {
    /// Fork a child dedicated to binding privileged sockets, matching
    /// `start_binder`'s "spawned before the parent drops privileges."
    pub fn start() -> io::Result<Self> {
        let (parent_sock, child_sock) =
            socket::socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty())
                .map_err(to_io_error)?;

        match unsafe { unistd::fork() }.map_err(to_io_error)? {
            ForkResult::Child => {
                drop(parent_sock);
                close_other_fds(child_sock.as_raw_fd());
                binder_main(child_sock);
            }
            ForkResult::Parent { child } => {
                drop(child_sock);
                Ok(Binder {
                    sock: parent_sock,
                    child_pid: child,
                })
            }
        }
    }

    /// Ask the child to bind `addr` as the given socket kind, returning the
    /// bound (but not listening) socket fd on success.
    pub fn bind(&self, addr: &Address, kind: SockKind) -> io::Result<OwnedFd> {
        let sock_addr = addr
            .socket_addr()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "address has no sockaddr encoding"))?;
        request_bind(self.sock.as_raw_fd(), sock_addr, kind)
    }

    /// Close the parent's end and reap the child, per `stop_binder`.
    pub fn stop(self) -> io::Result<()> {
        drop(self.sock);
        nix::sys::wait::waitpid(self.child_pid, None).map_err(to_io_error)?;
        Ok(())
    }
}

fn request_bind(sock: RawFd, addr: SocketAddr, kind: SockKind) -> io::Result<OwnedFd> {
    let encoded = addr.to_string();
    let mut request = Vec::with_capacity(9 + encoded.len());
    request.push(kind.to_wire());
    request.extend_from_slice(&(encoded.len() as u64).to_ne_bytes());
    request.extend_from_slice(encoded.as_bytes());
    unistd::write(sock, &request).map_err(to_io_error)?;

    let mut data_buf = [0u8; MAX_REQUEST_LEN];
    let mut cmsg_buf = cmsg_space!([RawFd; 1]);
    let mut iov = [IoSliceMut::new(&mut data_buf)];
    let msg = socket::recvmsg::<()>(sock, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())
        .map_err(to_io_error)?;

    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }

    let text = String::from_utf8_lossy(&data_buf[..msg.bytes]).to_string();
    Err(io::Error::new(io::ErrorKind::AddrInUse, text))
}

/// Child-process main loop: repeatedly bind what the parent asks for and
/// send back either an `SCM_RIGHTS` fd or a diagnostic line, matching
/// `binder_main`. Never returns.
fn binder_main(sock: OwnedFd) -> ! {
    let fd = sock.as_raw_fd();
    loop {
        let mut buf = [0u8; MAX_REQUEST_LEN];
        let n = match unistd::read(fd, &mut buf) {
            Ok(0) => std::process::exit(0),
            Ok(n) => n,
            Err(_) => std::process::exit(1),
        };
        if n < 9 {
            let _ = unistd::write(fd, b"incomplete request");
            continue;
        }

        let Some(kind) = SockKind::from_wire(buf[0]) else {
            let _ = unistd::write(fd, b"malformed request");
            continue;
        };
        let addr_len = u64::from_ne_bytes(buf[1..9].try_into().unwrap()) as usize;
        if addr_len == 0 || 9 + addr_len > n {
            let _ = unistd::write(fd, b"malformed request");
            continue;
        }

        match std::str::from_utf8(&buf[9..9 + addr_len])
            .ok()
            .and_then(|s| SocketAddr::from_str(s).ok())
        {
            None => {
                let _ = unistd::write(fd, b"malformed address");
            }
            Some(addr) => match bind_one(addr, kind) {
                Ok(bound_fd) => {
                    let cmsg = [ControlMessage::ScmRights(&[bound_fd])];
                    let iov = [IoSlice::new(b"ok")];
                    let _ = socket::sendmsg::<()>(fd, &iov, &cmsg, MsgFlags::empty(), None);
                    let _ = unistd::close(bound_fd);
                }
                Err(e) => {
                    let msg = e.to_string();
                    let _ = unistd::write(fd, msg.as_bytes());
                }
            },
        }
    }
}

/// Create, set `SO_REUSEADDR` on, and bind (but do not listen on) a socket
/// for `addr`. Returns the raw fd; caller owns it.
fn bind_one(addr: SocketAddr, kind: SockKind) -> io::Result<RawFd> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let sock_type = match kind {
        SockKind::Stream => Type::STREAM,
        SockKind::Dgram => Type::DGRAM,
    };
    let socket = Socket::new(domain, sock_type, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into_raw_fd())
}

/// Close every fd except the one the child needs to keep talking to the
/// parent, per `binder_main`'s "don't leak file descriptors to the child."
fn close_other_fds(keep: RawFd) {
    if let Ok(entries) = std::fs::read_dir("/proc/self/fd") {
        for entry in entries.flatten() {
            if let Ok(fd) = entry.file_name().to_string_lossy().parse::<RawFd>() {
                if fd != keep && fd > 2 {
                    let _ = unistd::close(fd);
                }
            }
        }
    }
}

fn to_io_error(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}
