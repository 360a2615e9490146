//! Command-line argument parsing, grounded on spec §6's exit codes and the
//! `clap` derive usage in `catwithtudou-socket_proxy`/`zonblade-mini-gateway-rs`.
//! Argument-parsing internals beyond this surface are a named Non-goal
//! (delegated entirely to `clap`).

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "sniproxy", version, about = "Transparent SNI/HTTP/DTLS reverse proxy")]
pub struct Args {
    /// Path to the YAML configuration file (default `/etc/sniproxy.conf`).
    #[arg(short = 'c', long = "config", value_name = "PATH", default_value = "/etc/sniproxy.conf")]
    pub config: PathBuf,

    /// Stay in the foreground instead of daemonizing.
    #[arg(short = 'f', long = "foreground")]
    pub foreground: bool,

    /// Maximum number of open file descriptors, overriding the config
    /// file's `max_nofiles` (spec §6).
    #[arg(short = 'n', long = "max-nofiles", value_name = "N")]
    pub max_nofiles: Option<u64>,
}

/// Exit codes, per spec §6: 0 success, 1 config error, 2 runtime/startup
/// error.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const CONFIG_ERROR: i32 = 1;
    pub const RUNTIME_ERROR: i32 = 2;
}
