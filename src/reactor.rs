//! The explicit context object that replaces the original's single-threaded
//! `ev_loop` plus process-wide globals (`sniproxy.c`'s static `listeners`,
//! `tables`, and signal state). Per SPEC_FULL.md §5, this crate runs on
//! multi-threaded `tokio`, so "the reactor" becomes a plain struct threaded
//! through every [`crate::listener::Listener`] and
//! [`crate::connection::Connection`] rather than a thread-local.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::path::PathBuf;

use log::{info, warn};
use tokio::signal::unix::{signal, SignalKind};

use crate::address::Address;
use crate::config::Config;
use crate::listener::Listener;
use crate::logger::Logger;
use crate::resolver::Resolver;
use crate::table::{Backend, Table, TableHandle};

/// A point-in-time view of one live connection, held in [`Reactor`]'s
/// connection table for the SIGUSR1 dump (spec §5/§6, `stats.c`'s
/// connection walk).
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub client_addr: SocketAddr,
    pub listener_addr: SocketAddr,
    pub hostname: Option<String>,
    pub state: String,
}

/// Shared state every listener/connection holds a clone of. Grounded on
/// `sniproxy.c`'s globals, made explicit instead of static.
pub struct Reactor {
    pub resolver: Resolver,
    active_connections: AtomicU64,
    total_connections: AtomicU64,
    next_connection_id: AtomicU64,
    connections: Mutex<HashMap<u64, ConnectionSnapshot>>,
}

impl Reactor {
    pub fn new(resolver: Resolver) -> Arc<Self> {
        Arc::new(Reactor {
            resolver,
            active_connections: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            next_connection_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        })
    }

    /// Register a newly accepted connection, returning the id later passed
    /// to [`update_connection`](Self::update_connection) and
    /// [`untrack_connection`](Self::untrack_connection).
    pub(crate) fn track_connection_start(
        &self,
        client_addr: SocketAddr,
        listener_addr: SocketAddr,
    ) -> u64 {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.connections.lock().unwrap().insert(
            id,
            ConnectionSnapshot {
                client_addr,
                listener_addr,
                hostname: None,
                state: "ACCEPTED".to_string(),
            },
        );
        id
    }

    /// Update a tracked connection's state/hostname as it moves through the
    /// state machine (spec §4.4), for the SIGUSR1 dump.
    pub(crate) fn update_connection(&self, id: u64, state: &str, hostname: Option<&str>) {
        if let Some(snapshot) = self.connections.lock().unwrap().get_mut(&id) {
            snapshot.state = state.to_string();
            if let Some(h) = hostname {
                snapshot.hostname = Some(h.to_string());
            }
        }
    }

    pub(crate) fn untrack_connection(&self, id: u64) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.connections.lock().unwrap().remove(&id);
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// A snapshot of every currently tracked connection, for the SIGUSR1
    /// dump.
    pub fn connection_snapshots(&self) -> Vec<ConnectionSnapshot> {
        self.connections.lock().unwrap().values().cloned().collect()
    }
}

/// Build one [`Listener`] plus its [`TableHandle`] per entry in `config`,
/// then drive their accept loops until a shutdown signal arrives. SIGHUP
/// reloads every table in place and reopens the access log (`logger.c`'s
/// `logger_reopen`); SIGUSR1 dumps connection state (`stats.c`); SIGINT/
/// SIGTERM trigger graceful shutdown; SIGPIPE is ignored so a backend or
/// client RST never kills the process.
pub async fn run(
    config: Config,
    config_path: PathBuf,
    bound_sockets: Vec<(Address, OwnedFd)>,
) -> std::io::Result<()> {
    let resolver = Resolver::new(&config.resolver.nameservers, &config.resolver.search_domains);
    let reactor = Reactor::new(resolver);

    let access_log = config
        .listeners
        .iter()
        .find_map(|l| l.access_log.clone())
        .map(|path| Logger::open(&path).map(Arc::new))
        .transpose()?;

    let mut bound_sockets: HashMap<Address, OwnedFd> = bound_sockets.into_iter().collect();
    let mut listeners = build_listeners(&config, access_log.clone(), &mut bound_sockets)?;
    listeners.sort_by(|a, b| a.bind_address.cmp(&b.bind_address));

    let mut tasks = Vec::new();
    for listener in &listeners {
        let listener = Arc::clone(listener);
        let reactor = Arc::clone(&reactor);
        tasks.push(tokio::spawn(async move {
            if let Err(e) = listener.run(reactor).await {
                warn!("listener {} exited: {}", listener.bind_address, e);
            }
        }));
    }

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    ignore_sigpipe();

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("SIGHUP received: reloading tables and reopening access log");
                if let Err(e) = reload(&config_path, &listeners) {
                    warn!("reload failed: {}", e);
                }
                if let Some(log) = &access_log {
                    if let Err(e) = log.reopen() {
                        warn!("failed to reopen access log: {}", e);
                    }
                }
            }
            _ = sigusr1.recv() => {
                if let Err(e) = dump_connections(&reactor) {
                    warn!("failed to write connection dump: {}", e);
                }
            }
            _ = sigint.recv() => {
                info!("SIGINT received: shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received: shutting down");
                break;
            }
        }
    }

    for listener in &listeners {
        listener.stop();
    }
    for task in tasks {
        task.abort();
    }
    Ok(())
}

fn build_listeners(
    config: &Config,
    access_log: Option<Arc<Logger>>,
    bound_sockets: &mut HashMap<Address, OwnedFd>,
) -> std::io::Result<Vec<Arc<Listener>>> {
    let mut out = Vec::new();
    for lc in &config.listeners {
        let table_config = config
            .tables
            .iter()
            .find(|t| t.name.as_deref() == lc.table.as_deref())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("listener references undefined table {:?}", lc.table),
                )
            })?;
        let table = build_table(table_config)?;
        let bound_fd = bound_sockets.remove(&lc.address);
        let listener = Listener::with_bound_fd(
            lc.address.clone(),
            lc.protocol,
            TableHandle::new(table),
            lc.fallback_address.clone(),
            lc.source_address.clone(),
            lc.transparent_proxy,
            access_log.clone(),
            lc.log_bad_requests,
            bound_fd,
        );
        out.push(listener);
    }
    Ok(out)
}

fn build_table(tc: &crate::config::TableConfig) -> std::io::Result<Table> {
    let mut backends = Vec::with_capacity(tc.backends.len());
    for bc in &tc.backends {
        let backend = Backend::new(&bc.pattern, bc.target.clone(), bc.use_proxy_header)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
        backends.push(backend);
    }
    Ok(Table::new(tc.name.clone(), backends, tc.use_proxy_header_default))
}

fn reload(config_path: &PathBuf, listeners: &[Arc<Listener>]) -> std::io::Result<()> {
    let config = Config::load(config_path)?;
    for lc in &config.listeners {
        let Some(listener) = listeners.iter().find(|l| l.bind_address == lc.address) else {
            continue;
        };
        let table_config = config
            .tables
            .iter()
            .find(|t| t.name.as_deref() == lc.table.as_deref());
        if let Some(tc) = table_config {
            let table = build_table(tc)?;
            listener.table.swap(table);
        }
    }
    Ok(())
}

/// Write one line per live connection plus a summary header to a
/// `mkstemp`-style temp file, matching `stats.c`'s connection walk (spec
/// §5 "SIGUSR1 dumps current connections to a temp file").
fn dump_connections(reactor: &Arc<Reactor>) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = tempfile_in_tmp()?;
    writeln!(
        file,
        "active={} total={}",
        reactor.active_connections(),
        reactor.total_connections()
    )?;
    for snapshot in reactor.connection_snapshots() {
        writeln!(
            file,
            "{} -> {} [{}] {}",
            snapshot.client_addr,
            snapshot.listener_addr,
            snapshot.hostname.as_deref().unwrap_or("-"),
            snapshot.state,
        )?;
    }
    Ok(())
}

/// `mkstemp`-style unique temp file, matching spec §5/§6's "dumps current
/// connections to a mkstemp'd file under /tmp".
fn tempfile_in_tmp() -> std::io::Result<std::fs::File> {
    let template = std::env::temp_dir().join("sniproxy.XXXXXX");
    let (fd, path) = nix::unistd::mkstemp(&template)
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    info!("dumping connection table to {}", path.display());
    Ok(unsafe { <std::fs::File as std::os::fd::FromRawFd>::from_raw_fd(fd) })
}

#[cfg(target_os = "linux")]
fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[cfg(not(target_os = "linux"))]
fn ignore_sigpipe() {}
