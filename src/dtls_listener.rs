//! DTLS datagram demultiplexer, grounded on `dtls.c`'s use from `listener.c`.
//! UDP has no `accept()`, so a single bound socket must demultiplex by
//! source address itself: the first datagram from a new peer is parsed for
//! its ClientHello SNI the same way a TCP `Connection` parses its first
//! bytes, then a dedicated backend `UdpSocket` is `connect()`ed and a
//! forwarding task relays datagrams both ways for that flow. There is no
//! per-flow TCP-style half-close; a flow is retired after an idle timeout.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::address::Address;
use crate::error::ResolveErrorKind;
use crate::listener::{bind_udp, Listener};
use crate::parse::{dtls::DtlsParser, HandshakeParser};
use crate::reactor::Reactor;
use crate::resolver::LookupMode;

/// Retire a flow's backend socket after this much inactivity.
const FLOW_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

struct Flow {
    backend: Arc<UdpSocket>,
    last_active: Instant,
}

pub async fn run(listener: Arc<Listener>, reactor: Arc<Reactor>) -> io::Result<()> {
    let local = listener
        .bind_address
        .socket_addr()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "DTLS listener needs a sockaddr"))?;
    let socket = Arc::new(match listener.take_bound_fd() {
        Some(fd) => crate::listener::udp_socket_from_bound_fd(fd)?,
        None => bind_udp(local)?,
    });
    log::info!("listening on {} (Dtls)", local);

    let flows: Arc<Mutex<HashMap<SocketAddr, Flow>>> = Arc::new(Mutex::new(HashMap::new()));
    let mut buf = [0u8; 4096];

    loop {
        let (n, peer) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) if crate::listener::is_fd_exhaustion(&e) => {
                warn!("recv_from on {} failed ({}); pausing", local, e);
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }
            Err(e) => {
                warn!("recv_from on {} failed: {}", local, e);
                continue;
            }
        };

        reap_idle_flows(&flows).await;

        let mut flows_guard = flows.lock().await;
        if let Some(flow) = flows_guard.get_mut(&peer) {
            flow.last_active = Instant::now();
            let backend = Arc::clone(&flow.backend);
            drop(flows_guard);
            if let Err(e) = backend.send(&buf[..n]).await {
                debug!("forwarding datagram from {} failed: {}", peer, e);
            }
            continue;
        }
        drop(flows_guard);

        match DtlsParser::parse(&buf[..n]) {
            crate::error::ParseOutcome::Ok { hostname, .. } => {
                match open_flow(&listener, &reactor, hostname.as_deref()).await {
                    Ok(backend) => {
                        if let Err(e) = backend.send(&buf[..n]).await {
                            debug!("forwarding first datagram from {} failed: {}", peer, e);
                        }
                        let backend = Arc::new(backend);
                        flows.lock().await.insert(
                            peer,
                            Flow {
                                backend: Arc::clone(&backend),
                                last_active: Instant::now(),
                            },
                        );
                        spawn_return_path(Arc::clone(&socket), peer, backend);
                    }
                    Err(reason) => {
                        debug!("dropping DTLS flow from {}: {}", peer, reason);
                        send_abort(&socket, peer).await;
                    }
                }
            }
            // A ClientHello fragmented across multiple datagrams would
            // legitimately need more bytes, but this demultiplexer treats
            // each first datagram as the whole handshake (no reassembly);
            // `Incomplete` here means the peer's first flight genuinely
            // won't complete, same as a terminal parse error.
            crate::error::ParseOutcome::Err(crate::error::ParseError::Incomplete) => {
                debug!("incomplete ClientHello fragment from {}", peer);
            }
            crate::error::ParseOutcome::Err(e) => {
                if listener.log_bad_requests {
                    warn!("{} sent a bad ClientHello: {}", peer, e);
                }
                send_abort(&socket, peer).await;
            }
        }
    }
}

/// A configured port of `0` means "use the protocol default", mirroring
/// `Connection::effective_port` on the TCP side.
fn effective_port(listener: &Listener, configured: u16) -> u16 {
    if configured != 0 {
        configured
    } else {
        listener.protocol.default_port()
    }
}

/// Resolve a backend for `hostname` (or the listener's fallback) and
/// connect a UDP socket to it, mirroring the TCP `Connection` lookup logic
/// but collapsed into a single call since there is no separate RESOLVING
/// state to expose for datagram flows.
async fn open_flow(
    listener: &Arc<Listener>,
    reactor: &Arc<Reactor>,
    hostname: Option<&str>,
) -> Result<UdpSocket, String> {
    let table = listener.table.current();

    let target = hostname
        .and_then(|h| table.lookup(h).ok().map(|b| (h, b)))
        .map(|(h, b)| {
            if b.target.is_wildcard() {
                let port = effective_port(listener, b.target.port());
                Address::parse(h)
                    .map(|mut a| {
                        a.set_port(port);
                        a
                    })
                    .unwrap_or_else(|| b.target.clone())
            } else {
                b.target.clone()
            }
        })
        .or_else(|| listener.fallback_address.clone())
        .ok_or_else(|| "no matching backend and no fallback".to_string())?;

    let addr = match target {
        Address::Sockaddr(_) => target.socket_addr().ok_or("target has no sockaddr")?,
        Address::Hostname { name, port } => {
            let resolved = reactor
                .resolver
                .resolve(&name, LookupMode::Default)
                .await
                .map_err(|e| ResolveErrorKind::from(&e))
                .map_err(|e| format!("{:?}", e))?;
            let mut a = resolved;
            a.set_port(effective_port(listener, port));
            a.socket_addr().ok_or("resolved address has no sockaddr")?
        }
        Address::Wildcard { .. } => return Err("wildcard target requires a hostname".to_string()),
    };

    let unspecified: SocketAddr = if addr.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    let backend = UdpSocket::bind(unspecified).await.map_err(|e| e.to_string())?;
    backend.connect(addr).await.map_err(|e| e.to_string())?;
    Ok(backend)
}

/// Forward datagrams from the backend back to the original client address
/// until the backend socket goes idle/errors, matching the original's
/// symmetrical treatment of both legs of a proxied flow.
fn spawn_return_path(client_socket: Arc<UdpSocket>, peer: SocketAddr, backend: Arc<UdpSocket>) {
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match tokio::time::timeout(FLOW_IDLE_TIMEOUT, backend.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    if client_socket.send_to(&buf[..n], peer).await.is_err() {
                        break;
                    }
                }
                Ok(Err(_)) | Err(_) => break,
            }
        }
    });
}

/// Send the DTLS Alert abort datagram (spec §4.1/§6) directly back to
/// `peer` -- there is no per-flow socket yet at this point, so this goes
/// out on the shared listening socket the same way a reply datagram would
/// for any other UDP protocol.
async fn send_abort(socket: &UdpSocket, peer: SocketAddr) {
    if let Err(e) = socket.send_to(DtlsParser::abort_message(), peer).await {
        debug!("failed to send DTLS abort to {}: {}", peer, e);
    }
}

async fn reap_idle_flows(flows: &Arc<Mutex<HashMap<SocketAddr, Flow>>>) {
    let mut guard = flows.lock().await;
    let now = Instant::now();
    guard.retain(|_, flow| now.duration_since(flow.last_active) < FLOW_IDLE_TIMEOUT);
}
