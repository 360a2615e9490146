//! Entry point: parse arguments, load configuration, optionally daemonize,
//! drop privileges, then hand off to the reactor. Grounded on `sniproxy.c`'s
//! `main` and the `anyhow`-at-the-top/`thiserror`-underneath split used by
//! `zonblade-mini-gateway-rs` and `catwithtudou-socket_proxy`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use sniproxy::cli::{exit_code, Args};
use sniproxy::config::Config;

fn main() {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(exit_code::RUNTIME_ERROR);
        }
    }
}

fn run(args: Args) -> Result<i32> {
    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load config {}: {}", args.config.display(), e);
            return Ok(exit_code::CONFIG_ERROR);
        }
    };

    info!("loaded configuration from {}", args.config.display());

    // The binder child is forked before we drop privileges or daemonize, so
    // it still holds whatever capability let it bind privileged ports.
    let binder = sniproxy::binder::Binder::start().context("failed to start privilege-separated binder")?;

    // Every listener address is bound now, through the child, while we
    // still have whatever privilege let it bind low ports (spec §4.7).
    let mut bound_sockets = Vec::with_capacity(config.listeners.len());
    for lc in &config.listeners {
        let kind = sniproxy::binder::SockKind::from(lc.protocol);
        let fd = binder
            .bind(&lc.address, kind)
            .with_context(|| format!("failed to bind listener address {}", lc.address))?;
        bound_sockets.push((lc.address.clone(), fd));
    }

    // A command-line `-n` overrides the config file's `max_nofiles` (spec §6).
    if let Some(max_nofiles) = args.max_nofiles.or(config.max_nofiles) {
        raise_nofile_limit(max_nofiles)?;
    }

    if !args.foreground {
        daemonize().context("failed to daemonize")?;
    }

    if let Some(pidfile) = &config.pidfile {
        write_pidfile(pidfile)?;
    }

    drop_privileges(config.user.as_deref(), config.group.as_deref())?;

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let config_path = args.config.clone();
    let result = runtime.block_on(sniproxy::reactor::run(config, config_path, bound_sockets));

    binder.stop().ok();

    result.context("reactor exited with an error")?;
    Ok(exit_code::OK)
}

fn raise_nofile_limit(requested: u64) -> Result<()> {
    nix::sys::resource::setrlimit(
        nix::sys::resource::Resource::RLIMIT_NOFILE,
        requested,
        requested,
    )
    .context("failed to raise RLIMIT_NOFILE")
}

/// Double-fork daemonization, grounded on `sniproxy.c`'s `daemonize`. The
/// teacher corpus has no dedicated daemonization crate, so this uses `nix`
/// directly the same way it's already used for the binder.
fn daemonize() -> Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};

    match unsafe { fork() }.context("first fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid().context("setsid failed")?;

    match unsafe { fork() }.context("second fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    nix::unistd::chdir("/").ok();
    Ok(())
}

fn write_pidfile(path: &PathBuf) -> Result<()> {
    std::fs::write(path, format!("{}\n", std::process::id()))
        .with_context(|| format!("failed to write pidfile {}", path.display()))
}

fn drop_privileges(user: Option<&str>, group: Option<&str>) -> Result<()> {
    if let Some(group) = group {
        let group = nix::unistd::Group::from_name(group)
            .context("failed to look up group")?
            .with_context(|| format!("no such group: {}", group))?;
        nix::unistd::setgid(group.gid).context("setgid failed")?;
    }
    if let Some(user) = user {
        let user = nix::unistd::User::from_name(user)
            .context("failed to look up user")?
            .with_context(|| format!("no such user: {}", user))?;
        nix::unistd::setuid(user.uid).context("setuid failed")?;
    }
    Ok(())
}
