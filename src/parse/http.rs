//! HTTP/1.x request header parser, grounded on `http.c`. The original's
//! `get_header` calls `strncmp("Host: ", data, MIN(5, len))` against a
//! 6-character literal -- comparing only 5 of its 6 bytes, which lets a
//! header named `"Host"` (no colon) through. Per spec §9's open question,
//! this port matches the full `Host:` literal case-insensitively, with
//! optional whitespace before the value, rather than carrying the bug
//! forward.

use super::HandshakeParser;
use crate::error::{ParseError, ParseOutcome};

/// Header line length beyond which we give up waiting for more data and
/// call the input malformed rather than risk buffering an unbounded line.
const MAX_LINE_LEN: usize = 8192;
/// Maximum length of the extracted `Host` value (spec §4.1).
const MAX_HOST_LEN: usize = 255;

pub const ABORT_MESSAGE: &[u8] = b"HTTP/1.1 503 Service Temporarily Unavailable\r\n\
Content-Type: text/plain\r\n\
Connection: close\r\n\
\r\n\
Service Temporarily Unavailable";

pub struct HttpParser;

impl HandshakeParser for HttpParser {
    fn abort_message() -> &'static [u8] {
        ABORT_MESSAGE
    }

    fn parse(data: &[u8]) -> ParseOutcome {
        let mut pos = 0;
        let mut host_value: Option<String> = None;

        loop {
            match find_crlf(&data[pos..]) {
                None => {
                    if data.len() - pos > MAX_LINE_LEN {
                        return ParseOutcome::Err(ParseError::Malformed);
                    }
                    return ParseOutcome::Err(ParseError::Incomplete);
                }
                Some(idx) => {
                    let line = &data[pos..pos + idx];
                    let consumed = pos + idx + 2;

                    if line.is_empty() {
                        return match host_value {
                            Some(h) => ParseOutcome::Ok {
                                hostname: Some(strip_port(&h).to_string()),
                                consumed,
                            },
                            None => ParseOutcome::Err(ParseError::NoHostname),
                        };
                    }

                    if let Some(value) = parse_host_header(line) {
                        if value.len() > MAX_HOST_LEN {
                            return ParseOutcome::Err(ParseError::Malformed);
                        }
                        host_value = Some(value.to_string());
                    }

                    pos = consumed;
                }
            }
        }
    }
}

/// Find the offset of the first `\r\n` in `data`, if any.
fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

/// Match a header line against the full `Host:` literal, case-insensitive,
/// and return the value with leading blanks trimmed.
fn parse_host_header(line: &[u8]) -> Option<&str> {
    const NAME: &[u8] = b"Host:";
    if line.len() < NAME.len() || !line[..NAME.len()].eq_ignore_ascii_case(NAME) {
        return None;
    }
    let mut rest = &line[NAME.len()..];
    while matches!(rest.first(), Some(b' ') | Some(b'\t')) {
        rest = &rest[1..];
    }
    std::str::from_utf8(rest).ok()
}

/// Strip a trailing `:port` from a Host header value, per spec §4.1.
fn strip_port(host: &str) -> &str {
    match host.rfind(':') {
        Some(idx) if host[idx + 1..].bytes().all(|b| b.is_ascii_digit()) => &host[..idx],
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_header_with_port_is_stripped() {
        let req = b"GET / HTTP/1.1\r\nHost: localhost:8080\r\n\r\n";
        match HttpParser::parse(req) {
            ParseOutcome::Ok { hostname, consumed } => {
                assert_eq!(hostname.as_deref(), Some("localhost"));
                assert_eq!(consumed, req.len());
            }
            other => panic!("expected Ok, got {:?}", other),
        }
    }

    #[test]
    fn host_header_without_port() {
        let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        match HttpParser::parse(req) {
            ParseOutcome::Ok { hostname, .. } => {
                assert_eq!(hostname.as_deref(), Some("example.com"));
            }
            other => panic!("expected Ok, got {:?}", other),
        }
    }

    #[test]
    fn case_insensitive_header_name() {
        let req = b"GET / HTTP/1.1\r\nhOsT: example.com\r\n\r\n";
        match HttpParser::parse(req) {
            ParseOutcome::Ok { hostname, .. } => assert_eq!(hostname.as_deref(), Some("example.com")),
            other => panic!("expected Ok, got {:?}", other),
        }
    }

    #[test]
    fn header_named_host_without_colon_does_not_match() {
        // Regression guard for the original's off-by-one: "Host" without a
        // trailing colon must not be treated as the Host header.
        let req = b"GET / HTTP/1.1\r\nHostX: example.com\r\n\r\n";
        assert_eq!(
            HttpParser::parse(req),
            ParseOutcome::Err(ParseError::NoHostname)
        );
    }

    #[test]
    fn missing_blank_line_is_incomplete() {
        let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n";
        assert_eq!(
            HttpParser::parse(req),
            ParseOutcome::Err(ParseError::Incomplete)
        );
    }

    #[test]
    fn blank_line_without_host_is_no_hostname() {
        let req = b"GET / HTTP/1.1\r\nUser-Agent: test\r\n\r\n";
        assert_eq!(
            HttpParser::parse(req),
            ParseOutcome::Err(ParseError::NoHostname)
        );
    }

    #[test]
    fn truncated_byte_by_byte_becomes_ok_at_exact_boundary() {
        let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        for len in 0..req.len() {
            assert_eq!(
                HttpParser::parse(&req[..len]),
                ParseOutcome::Err(ParseError::Incomplete),
                "prefix of length {} should be Incomplete",
                len
            );
        }
        assert!(matches!(HttpParser::parse(req), ParseOutcome::Ok { .. }));
    }

    #[test]
    fn oversized_host_value_is_malformed() {
        let mut req = b"GET / HTTP/1.1\r\nHost: ".to_vec();
        req.extend(std::iter::repeat(b'a').take(300));
        req.extend_from_slice(b"\r\n\r\n");
        assert_eq!(
            HttpParser::parse(&req),
            ParseOutcome::Err(ParseError::Malformed)
        );
    }
}
