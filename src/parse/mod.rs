//! Handshake parsers: bounded, untrusted-input byte scanners that extract a
//! destination hostname from the first bytes of a client connection. Each
//! one is grounded on a corresponding file under `examples/original_source`
//! (`tls.c`, `dtls.c`, `http.c`) plus `sni.c`'s shared SNI-extension walk,
//! reworked as safe slice-indexing instead of raw pointer arithmetic.

pub mod dtls;
pub mod http;
pub mod tls;

use crate::error::{ParseError, ParseOutcome};

/// Shared contract for every handshake parser (spec §4.1).
///
/// Implementations MUST NOT read past `data.len()`, MUST NOT panic on any
/// input, and return [`ParseError::Incomplete`] only when more bytes could
/// still yield a complete parse.
pub trait HandshakeParser {
    /// Try to extract a destination hostname from `data`.
    fn parse(data: &[u8]) -> ParseOutcome;

    /// The protocol-appropriate message to send a client whose connection
    /// this proxy cannot honor (spec §4.1, §6).
    fn abort_message() -> &'static [u8];
}

/// Read a big-endian `u16` at `data[at..at+2]`, or `None` if out of bounds.
pub(crate) fn u16_be(data: &[u8], at: usize) -> Option<u16> {
    data.get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
}


pub(crate) fn err(e: ParseError) -> ParseOutcome {
    ParseOutcome::Err(e)
}
