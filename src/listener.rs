//! Listener accept loop, grounded on `listener.c`. The original arms a
//! level-triggered `ev_io` read watcher on the listening fd and re-enables
//! it after an `EMFILE`/`ENFILE` backoff timer; under `tokio` the
//! equivalent is a plain `loop { listener.accept().await }` with the same
//! backoff sleep on resource exhaustion, since `accept().await` only
//! resolves when the fd is readable (tokio's reactor parks the task rather
//! than busy-polling, which is the async analogue of "level-triggered").

use std::io;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::sleep;

use crate::address::Address;
use crate::connection::Connection;
use crate::logger::Logger;
use crate::reactor::Reactor;
use crate::table::TableHandle;

/// How long an accept loop backs off after `EMFILE`/`ENFILE`, per spec §4.8.
const ACCEPT_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tls,
    Http,
    Dtls,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Tls => 443,
            Protocol::Http => 80,
            Protocol::Dtls => 443,
        }
    }
}

/// One configured listening endpoint, per spec §3. Held by every
/// [`Connection`] it spawns via `Arc` so it outlives them (spec invariant:
/// "A Listener held by any Connection outlives that Connection").
pub struct Listener {
    pub bind_address: Address,
    pub protocol: Protocol,
    pub table: Arc<TableHandle>,
    pub fallback_address: Option<Address>,
    pub source_address: Option<Address>,
    pub transparent_proxy: bool,
    pub access_log: Option<Arc<Logger>>,
    pub log_bad_requests: bool,
    /// A socket already bound by the privilege-separated [`crate::binder`]
    /// child, if one was obtained before this listener's accept loop
    /// starts (spec §4.7). Taken (and replaced with `None`) the first time
    /// the accept loop runs; absent, the loop binds for itself.
    bound_fd: Mutex<Option<OwnedFd>>,
    stopping: AtomicBool,
}

impl Listener {
    pub fn new(
        bind_address: Address,
        protocol: Protocol,
        table: Arc<TableHandle>,
        fallback_address: Option<Address>,
        source_address: Option<Address>,
        transparent_proxy: bool,
        access_log: Option<Arc<Logger>>,
        log_bad_requests: bool,
    ) -> Arc<Self> {
        Self::with_bound_fd(
            bind_address,
            protocol,
            table,
            fallback_address,
            source_address,
            transparent_proxy,
            access_log,
            log_bad_requests,
            None,
        )
    }

    /// Like [`new`](Self::new), but pre-seeded with a socket the
    /// privilege-separated binder already bound on the caller's behalf.
    #[allow(clippy::too_many_arguments)]
    pub fn with_bound_fd(
        bind_address: Address,
        protocol: Protocol,
        table: Arc<TableHandle>,
        fallback_address: Option<Address>,
        source_address: Option<Address>,
        transparent_proxy: bool,
        access_log: Option<Arc<Logger>>,
        log_bad_requests: bool,
        bound_fd: Option<OwnedFd>,
    ) -> Arc<Self> {
        Arc::new(Listener {
            bind_address,
            protocol,
            table,
            fallback_address,
            source_address,
            transparent_proxy,
            access_log,
            log_bad_requests,
            bound_fd: Mutex::new(bound_fd),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Relaxed);
    }

    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::Relaxed)
    }

    /// Take the binder-provided socket, if any, so the caller can finish
    /// setting it up (`listen()` for TCP, nothing extra for UDP). Only the
    /// first caller -- the listener's own accept loop -- ever sees `Some`.
    pub(crate) fn take_bound_fd(&self) -> Option<OwnedFd> {
        self.bound_fd.lock().unwrap().take()
    }

    /// Run the accept loop until [`stop`](Self::stop) is called. For
    /// `Tls`/`Http` this accepts stream sockets and spawns one
    /// [`Connection`] task per client; for `Dtls` it runs the datagram
    /// demultiplexer in [`dtls`].
    pub async fn run(self: Arc<Self>, reactor: Arc<Reactor>) -> io::Result<()> {
        match self.protocol {
            Protocol::Tls | Protocol::Http => self.run_stream(reactor).await,
            Protocol::Dtls => crate::dtls_listener::run(self, reactor).await,
        }
    }

    async fn run_stream(self: Arc<Self>, reactor: Arc<Reactor>) -> io::Result<()> {
        let local = self
            .bind_address
            .socket_addr()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "listener address is not a sockaddr"))?;
        let socket = match self.take_bound_fd() {
            Some(fd) => tcp_listener_from_bound_fd(fd)?,
            None => bind_tcp(local)?,
        };
        info!("listening on {} ({:?})", local, self.protocol);

        loop {
            if self.stopping() {
                return Ok(());
            }
            match socket.accept().await {
                Ok((stream, peer)) => {
                    let listener = Arc::clone(&self);
                    let reactor = Arc::clone(&reactor);
                    tokio::spawn(async move {
                        Connection::new(stream, peer, local, listener, reactor)
                            .run()
                            .await;
                    });
                }
                Err(e) if is_fd_exhaustion(&e) => {
                    warn!(
                        "accept() on {} failed ({}); pausing accept loop for {:?}",
                        local, e, ACCEPT_BACKOFF
                    );
                    sleep(ACCEPT_BACKOFF).await;
                }
                Err(e) => {
                    warn!("accept() on {} failed: {}", local, e);
                }
            }
        }
    }
}

fn bind_tcp(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

/// Finish setting up a socket the binder child already created and bound
/// (spec §4.7): the binder only binds, so `listen()` still happens here,
/// in the process that will actually accept connections.
fn tcp_listener_from_bound_fd(fd: OwnedFd) -> io::Result<TcpListener> {
    use std::os::fd::{FromRawFd, IntoRawFd};
    let socket = unsafe { socket2::Socket::from_raw_fd(fd.into_raw_fd()) };
    socket.set_nonblocking(true)?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

/// Same as [`tcp_listener_from_bound_fd`] but for the DTLS listener's
/// `SOCK_DGRAM` socket, which never needs a `listen()` call.
pub(crate) fn udp_socket_from_bound_fd(fd: OwnedFd) -> io::Result<UdpSocket> {
    use std::os::fd::{FromRawFd, IntoRawFd};
    let socket = unsafe { socket2::Socket::from_raw_fd(fd.into_raw_fd()) };
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

pub(crate) fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(code) if code == libc::EMFILE || code == libc::ENFILE
    )
}

/// Open an outbound connection to `target`, binding to `source` first when
/// transparent-proxy mode is requested (spec §4.4 "Connect semantics").
pub async fn connect_backend(
    target: SocketAddr,
    source: Option<SocketAddr>,
    transparent: bool,
) -> io::Result<TcpStream> {
    if !transparent && source.is_none() {
        return TcpStream::connect(target).await;
    }

    let domain = if target.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, None)?;
    socket.set_nonblocking(true)?;

    if transparent {
        set_transparent(&socket)?;
    }
    if let Some(src) = source {
        socket.set_reuse_address(true)?;
        socket.bind(&src.into())?;
    }

    match socket.connect(&target.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    let std_stream: std::net::TcpStream = socket.into();
    let stream = TcpStream::from_std(std_stream)?;
    stream.writable().await?;
    if let Some(err) = stream.take_error()? {
        return Err(err);
    }
    Ok(stream)
}

#[cfg(target_os = "linux")]
fn set_transparent(socket: &socket2::Socket) -> io::Result<()> {
    use std::os::fd::AsRawFd;
    let fd = socket.as_raw_fd();
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_IP,
            libc::IP_TRANSPARENT,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_transparent(_socket: &socket2::Socket) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "transparent proxy mode is only supported on Linux",
    ))
}

/// Bind a UDP socket for the DTLS listener, sharing the same
/// `SO_REUSEADDR` convention as the stream listeners.
pub(crate) fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic check for the §4.8/§8 "FD exhaustion" classification,
    /// without actually driving the process's fd table to exhaustion (which
    /// would be flaky shared across the whole test binary).
    #[test]
    fn emfile_and_enfile_are_fd_exhaustion() {
        assert!(is_fd_exhaustion(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(is_fd_exhaustion(&io::Error::from_raw_os_error(libc::ENFILE)));
        assert!(!is_fd_exhaustion(&io::Error::from_raw_os_error(
            libc::ECONNRESET
        )));
    }

    #[test]
    fn default_ports_match_conventional_values() {
        assert_eq!(Protocol::Tls.default_port(), 443);
        assert_eq!(Protocol::Http.default_port(), 80);
        assert_eq!(Protocol::Dtls.default_port(), 443);
    }
}
