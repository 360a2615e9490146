//! Error taxonomy for the proxy core, grounded on the original's informal
//! return-code conventions (`tls.c`'s negative `parse_tls_header` codes,
//! `resolv.c`'s NXDOMAIN/timeout split) but expressed as the tagged `enum`s
//! idiomatic Rust error handling calls for instead of magic integers.

use std::fmt;
use thiserror::Error;

/// Failure modes a handshake parser can return, per spec §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    /// More bytes could still complete the parse.
    #[error("incomplete handshake")]
    Incomplete,
    /// The handshake parsed but carried no usable hostname.
    #[error("no hostname present")]
    NoHostname,
    /// The input violates the protocol's framing rules.
    #[error("malformed handshake")]
    Malformed,
    /// Recognizable but not something this parser handles.
    #[error("unsupported protocol")]
    Unsupported,
}

/// Outcome of a single `parse()` call, per spec §4.1's `ParseOutcome`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Ok {
        hostname: Option<String>,
        consumed: usize,
    },
    Err(ParseError),
}

impl From<ParseError> for ParseOutcome {
    fn from(e: ParseError) -> Self {
        ParseOutcome::Err(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("no backend rule matched")]
    NoMatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("domain does not exist")]
    NxDomain,
    #[error("resolution timed out")]
    Timeout,
    #[error("transient resolver failure: {0}")]
    Transient(String),
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connection refused")]
    Refused,
    #[error("host unreachable")]
    Unreachable,
    #[error("transparent proxy mode unsupported on this platform")]
    TransparentUnsupported,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// The reason a connection moved to its abort pseudo-transition (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Parse(ParseError),
    Lookup(LookupError),
    Resolve(ResolveErrorKind),
    Connect,
}

/// A `Copy`-friendly mirror of [`ResolveError`] for use inside [`AbortReason`],
/// which must stay `Copy` so it can be embedded in connection-state structs
/// without an extra allocation per abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveErrorKind {
    NxDomain,
    Timeout,
    Transient,
}

impl From<&ResolveError> for ResolveErrorKind {
    fn from(e: &ResolveError) -> Self {
        match e {
            ResolveError::NxDomain => ResolveErrorKind::NxDomain,
            ResolveError::Timeout => ResolveErrorKind::Timeout,
            ResolveError::Transient(_) => ResolveErrorKind::Transient,
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Parse(e) => write!(f, "parse error: {}", e),
            AbortReason::Lookup(e) => write!(f, "lookup error: {}", e),
            AbortReason::Resolve(e) => write!(f, "resolve error: {:?}", e),
            AbortReason::Connect => write!(f, "connect error"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("listener {0:?} references undefined table {1:?}")]
    MissingTable(String, String),
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}
