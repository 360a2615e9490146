//! The per-client connection state machine, grounded on `connection.c`. The
//! original drives `NEW -> ACCEPTED -> PARSED -> RESOLVING/RESOLVED ->
//! CONNECTED -> SERVER_CLOSED/CLIENT_CLOSED -> CLOSED` one `ev_io` callback
//! at a time off a single-threaded reactor; here each connection is one
//! `tokio` task and the same states are just the points between `.await`s,
//! so the "state" field exists purely for logging and the SIGUSR1 dump
//! (`stats.c`), not to gate which code path runs next.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::address::Address;
use crate::buffer::Buffer;
use crate::error::{AbortReason, LookupError, ResolveErrorKind};
use crate::listener::{connect_backend, Listener, Protocol};
use crate::parse::{dtls::DtlsParser, http::HttpParser, tls::TlsParser, HandshakeParser};
use crate::reactor::Reactor;
use crate::resolver::LookupMode;

/// Upper bound on how much unparsed handshake data we'll buffer before
/// giving up, per spec §4.1/§4.4 ("buffer full" -> abort).
const MAX_HANDSHAKE_LEN: usize = 16 * 1024;

/// Mirrors spec §4.4's state enum. Kept `Copy` so the SIGUSR1 connection
/// dump (`stats.c`) can snapshot it without touching the connection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    New,
    Accepted,
    Parsed,
    Resolving,
    Resolved,
    Connected,
    ServerClosed,
    ClientClosed,
    Closed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::New => "NEW",
            State::Accepted => "ACCEPTED",
            State::Parsed => "PARSED",
            State::Resolving => "RESOLVING",
            State::Resolved => "RESOLVED",
            State::Connected => "CONNECTED",
            State::ServerClosed => "SERVER_CLOSED",
            State::ClientClosed => "CLIENT_CLOSED",
            State::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// One accepted client connection and (once resolved) its backend leg.
pub struct Connection {
    client: TcpStream,
    client_addr: SocketAddr,
    local_addr: SocketAddr,
    listener: Arc<Listener>,
    reactor: Arc<Reactor>,
    state: State,
    hostname: Option<String>,
    opened: Instant,
    /// Id in [`Reactor`]'s connection table, assigned once `run` registers
    /// this connection; used by the SIGUSR1 dump (spec §5/§6).
    conn_id: u64,
}

impl Connection {
    pub fn new(
        client: TcpStream,
        client_addr: SocketAddr,
        local_addr: SocketAddr,
        listener: Arc<Listener>,
        reactor: Arc<Reactor>,
    ) -> Self {
        Connection {
            client,
            client_addr,
            local_addr,
            listener,
            reactor,
            state: State::New,
            hostname: None,
            opened: Instant::now(),
            conn_id: 0,
        }
    }

    /// Move to `state`, propagating the transition to the reactor's
    /// connection table for the SIGUSR1 dump.
    fn set_state(&mut self, state: State) {
        self.state = state;
        self.reactor
            .update_connection(self.conn_id, &state.to_string(), self.hostname.as_deref());
    }

    /// Drive the connection through every state to `Closed`, logging an
    /// access-log line on the way out (spec §6).
    pub async fn run(mut self) {
        self.conn_id = self
            .reactor
            .track_connection_start(self.client_addr, self.local_addr);
        self.set_state(State::Accepted);

        let mut client_buf = Buffer::with_max_size(MAX_HANDSHAKE_LEN);
        let result = self.accept_parse_connect(&mut client_buf).await;

        match result {
            Ok(mut server) => {
                self.set_state(State::Connected);
                let counts = self.relay(&mut client_buf, &mut server).await;
                self.log_access(Some(&server), counts, None);
            }
            Err(reason) => {
                self.abort(reason, client_buf.coalesce()).await;
                self.log_access(None, RelayCounts::default(), Some(reason));
            }
        }

        self.set_state(State::Closed);
        self.reactor.untrack_connection(self.conn_id);
    }

    /// ACCEPTED -> PARSED -> RESOLVING/RESOLVED -> CONNECTED, per spec §4.4.
    async fn accept_parse_connect(
        &mut self,
        client_buf: &mut Buffer,
    ) -> Result<TcpStream, AbortReason> {
        let consumed = self.parse_handshake(client_buf).await?;
        self.set_state(State::Parsed);
        let _ = consumed;

        let backend = self.lookup()?;
        let target = self.resolve_target(&backend).await?;
        self.set_state(State::Resolved);

        let source = self.listener.source_address.as_ref().and_then(Address::socket_addr);
        let server = connect_backend(target, source, self.listener.transparent_proxy)
            .await
            .map_err(|_| AbortReason::Connect)?;

        if backend.use_proxy_header {
            self.send_proxy_header(&server, target).await.ok();
        }

        Ok(server)
    }

    /// Read and incrementally parse the client's handshake, growing
    /// `client_buf` until a parser returns `Ok`, a terminal error, or the
    /// buffer fills up (spec §4.1 "Incomplete" loop).
    async fn parse_handshake(&mut self, client_buf: &mut Buffer) -> Result<usize, AbortReason> {
        loop {
            let outcome = match self.listener.protocol {
                Protocol::Tls => TlsParser::parse(client_buf.coalesce()),
                Protocol::Http => HttpParser::parse(client_buf.coalesce()),
                Protocol::Dtls => DtlsParser::parse(client_buf.coalesce()),
            };

            match outcome {
                crate::error::ParseOutcome::Ok { hostname, consumed } => {
                    self.hostname = hostname;
                    return Ok(consumed);
                }
                crate::error::ParseOutcome::Err(crate::error::ParseError::Incomplete) => {
                    let mut chunk = [0u8; 4096];
                    let n = self
                        .client
                        .read(&mut chunk)
                        .await
                        .map_err(|_| AbortReason::Parse(crate::error::ParseError::Malformed))?;
                    if n == 0 {
                        return Err(AbortReason::Parse(crate::error::ParseError::Incomplete));
                    }
                    client_buf.note_recv(n, Instant::now());
                    // `push` grows the ring on demand up to `client_buf`'s
                    // configured max (spec §4.5); only a buffer that's genuinely
                    // full at its max size (spec §4.4 "buffer full") fails here
                    // -- the initial 4 KiB allocation growing toward
                    // `MAX_HANDSHAKE_LEN` is not that case.
                    if !client_buf.push(&chunk[..n]) {
                        return Err(AbortReason::Parse(crate::error::ParseError::Malformed));
                    }
                }
                crate::error::ParseOutcome::Err(e) => return Err(AbortReason::Parse(e)),
            }
        }
    }

    /// PARSED -> backend rule, using the fallback address when there's no
    /// hostname or no rule matches (spec §4.3/§4.4).
    fn lookup(&self) -> Result<ResolvedBackend, AbortReason> {
        let table = self.listener.table.current();

        if let Some(host) = &self.hostname {
            match table.lookup(host) {
                Ok(backend) => {
                    let target = if backend.target.is_wildcard() {
                        Address::parse(host)
                            .map(|mut a| {
                                a.set_port(self.effective_port(backend.target.port()));
                                a
                            })
                            .unwrap_or_else(|| backend.target.clone())
                    } else {
                        backend.target.clone()
                    };
                    return Ok(ResolvedBackend {
                        target,
                        use_proxy_header: backend.use_proxy_header,
                    });
                }
                Err(LookupError::NoMatch) => {}
            }
        }

        match &self.listener.fallback_address {
            Some(addr) => Ok(ResolvedBackend {
                target: addr.clone(),
                use_proxy_header: table.use_proxy_header_default,
            }),
            None => Err(AbortReason::Lookup(LookupError::NoMatch)),
        }
    }

    fn effective_port(&self, configured: u16) -> u16 {
        if configured != 0 {
            configured
        } else {
            self.listener.protocol.default_port()
        }
    }

    /// RESOLVING (if the target is a hostname) -> a concrete [`SocketAddr`].
    async fn resolve_target(&mut self, backend: &ResolvedBackend) -> Result<SocketAddr, AbortReason> {
        match &backend.target {
            Address::Sockaddr(_) => backend
                .target
                .socket_addr()
                .ok_or(AbortReason::Connect),
            Address::Hostname { name, port } => {
                self.set_state(State::Resolving);
                let resolved = self
                    .reactor
                    .resolver
                    .resolve(name, LookupMode::Default)
                    .await
                    .map_err(|e| AbortReason::Resolve(ResolveErrorKind::from(&e)))?;
                let mut addr = resolved;
                addr.set_port(self.effective_port(*port));
                addr.socket_addr().ok_or(AbortReason::Connect)
            }
            Address::Wildcard { .. } => Err(AbortReason::Connect),
        }
    }

    async fn send_proxy_header(&self, server: &TcpStream, dest: SocketAddr) -> std::io::Result<()> {
        let family = if self.client_addr.is_ipv4() && dest.is_ipv4() {
            "TCP4"
        } else {
            "TCP6"
        };
        let header = format!(
            "PROXY {} {} {} {} {}\r\n",
            family,
            self.client_addr.ip(),
            dest.ip(),
            self.client_addr.port(),
            dest.port()
        );
        loop {
            server.writable().await?;
            match server.try_write(header.as_bytes()) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// CONNECTED: bidirectional relay until either side closes, then drain
    /// the other direction before moving to CLOSED, matching the half-close
    /// ordering of spec §4.4 (SERVER_CLOSED/CLIENT_CLOSED).
    ///
    /// Returns the four independent socket counters the access log line
    /// (spec §6) is built from: bytes written to / read from the server
    /// socket, then bytes written to / read from the client socket.
    async fn relay(&mut self, client_buf: &mut Buffer, server: &mut TcpStream) -> RelayCounts {
        // Flush whatever handshake bytes are already buffered before
        // interleaving with live traffic.
        let pending = client_buf.coalesce().to_vec();
        if !pending.is_empty() && server.write_all(&pending).await.is_err() {
            self.set_state(State::ServerClosed);
            return RelayCounts {
                tx_to_server: 0,
                rx_from_server: 0,
                tx_to_client: 0,
                rx_from_client: pending.len() as u64,
            };
        }
        client_buf.advance_read(pending.len());
        let mut tx_to_server: u64 = pending.len() as u64;
        let mut rx_from_server: u64 = 0;
        let mut tx_to_client: u64 = 0;
        let mut rx_from_client: u64 = 0;

        // Split borrows `self.client` for the rest of this function, so the
        // state transitions below go straight to the reactor's connection
        // table (which only needs `&Reactor`, not `&mut self`) instead of
        // through `set_state`, which would need to reborrow all of `self`.
        let reactor = Arc::clone(&self.reactor);
        let conn_id = self.conn_id;
        let note_state = |state: State| reactor.update_connection(conn_id, &state.to_string(), None);

        let (mut client_rd, mut client_wr) = self.client.split();
        let (mut server_rd, mut server_wr) = server.split();

        let mut c2s = [0u8; 16 * 1024];
        let mut s2c = [0u8; 16 * 1024];

        // Each direction runs as its own future, driven concurrently by
        // `tokio::join!` rather than interleaved in a single `select!` --
        // the teacher's `copy_all`/`tokio::join!` pair avoids exactly this:
        // a `write_all` blocked on a slow reader on one side must never
        // stall the other side's reads and writes.
        let client_to_server = async {
            let mut rx: u64 = 0;
            let mut tx: u64 = 0;
            loop {
                match client_rd.read(&mut c2s).await {
                    Ok(0) | Err(_) => {
                        note_state(State::ClientClosed);
                        let _ = server_wr.shutdown().await;
                        break;
                    }
                    Ok(n) => {
                        rx += n as u64;
                        if server_wr.write_all(&c2s[..n]).await.is_err() {
                            note_state(State::ServerClosed);
                            break;
                        }
                        tx += n as u64;
                    }
                }
            }
            (rx, tx)
        };

        let server_to_client = async {
            let mut rx: u64 = 0;
            let mut tx: u64 = 0;
            loop {
                match server_rd.read(&mut s2c).await {
                    Ok(0) | Err(_) => {
                        note_state(State::ServerClosed);
                        let _ = client_wr.shutdown().await;
                        break;
                    }
                    Ok(n) => {
                        rx += n as u64;
                        if client_wr.write_all(&s2c[..n]).await.is_err() {
                            note_state(State::ClientClosed);
                            break;
                        }
                        tx += n as u64;
                    }
                }
            }
            (rx, tx)
        };

        let ((c2s_rx, c2s_tx), (s2c_rx, s2c_tx)) = tokio::join!(client_to_server, server_to_client);
        rx_from_client += c2s_rx;
        tx_to_server += c2s_tx;
        rx_from_server += s2c_rx;
        tx_to_client += s2c_tx;

        RelayCounts {
            tx_to_server,
            rx_from_server,
            tx_to_client,
            rx_from_client,
        }
    }

    /// Send the protocol-appropriate abort message (spec §4.1/§6) and close,
    /// without ever opening a backend connection. `log_bad_requests` only
    /// gates the extra diagnostic logging, never whether the wire-level
    /// abort message itself gets sent (spec §4.4's "optionally log hex
    /// dump" is about the log line, not the abort).
    async fn abort(&mut self, reason: AbortReason, unparsed: &[u8]) {
        debug!("{} -> aborting ({})", self.client_addr, reason);
        if self.listener.log_bad_requests {
            warn!(
                "{} sent a bad request ({}): {}",
                self.client_addr,
                reason,
                hex_dump(unparsed)
            );
        }
        let message: &[u8] = match self.listener.protocol {
            Protocol::Tls => TlsParser::abort_message(),
            Protocol::Http => HttpParser::abort_message(),
            Protocol::Dtls => DtlsParser::abort_message(),
        };
        if let Err(e) = self.client.write_all(message).await {
            warn!("failed writing abort message to {}: {}", self.client_addr, e);
        }
    }

    /// Stable access-log line (spec §6). `result` only reaches the line when
    /// the connection was aborted before ever reaching the server, since a
    /// relayed-then-closed connection has no separate "outcome" of its own.
    fn log_access(&self, server: Option<&TcpStream>, counts: RelayCounts, abort: Option<AbortReason>) {
        let Some(log) = &self.listener.access_log else {
            return;
        };
        let server_addr = server
            .and_then(|s| s.peer_addr().ok())
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string());
        let hostname = self.hostname.as_deref().unwrap_or("-");
        let mut line = format!(
            "{} -> {} -> {} [{}] {}/{} bytes tx {}/{} bytes rx {:.0}",
            self.client_addr,
            self.local_addr,
            server_addr,
            hostname,
            counts.tx_to_server,
            counts.rx_from_server,
            counts.tx_to_client,
            counts.rx_from_client,
            self.opened.elapsed().as_secs_f64(),
        );
        if let Some(reason) = abort {
            line.push_str(&format!(" ({})", reason));
        }
        log.access(&line);
    }
}

/// The four independent socket byte counters the access log line is built
/// from: how much this process wrote to / read from each side.
#[derive(Debug, Default, Clone, Copy)]
struct RelayCounts {
    tx_to_server: u64,
    rx_from_server: u64,
    tx_to_client: u64,
    rx_from_client: u64,
}

struct ResolvedBackend {
    target: Address,
    use_proxy_header: bool,
}

/// Render up to the first 64 bytes of `data` as a hex string, for the
/// `log_bad_requests` diagnostic line (spec §4.4's "optionally log hex
/// dump").
fn hex_dump(data: &[u8]) -> String {
    let capped = &data[..data.len().min(64)];
    capped.iter().map(|b| format!("{:02x}", b)).collect()
}
