//! TLS ClientHello parser, grounded on `tls.c`/`sni.c`. The original walks
//! the record with raw pointer arithmetic and a small set of negative
//! return codes; this keeps the same byte layout but expresses each step as
//! a bounds-checked slice read that can never walk off the end of `data`.

use super::{u16_be, HandshakeParser};
use crate::error::{ParseError, ParseOutcome};

const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_CONTENT_TYPE: u8 = 0x16;
const CLIENT_HELLO: u8 = 0x01;
const FIXED_PREFIX_LEN: usize = 38; // handshake type(1)+length(3)+version(2)+random(32)
const EXT_SERVER_NAME: u16 = 0x0000;
const SNI_HOST_NAME_TYPE: u8 = 0x00;

/// `15 03 01 00 02 02 28`: fatal handshake_failure alert.
pub const ABORT_MESSAGE: [u8; 7] = [0x15, 0x03, 0x01, 0x00, 0x02, 0x02, 0x28];

pub struct TlsParser;

impl HandshakeParser for TlsParser {
    fn abort_message() -> &'static [u8] {
        &ABORT_MESSAGE
    }

    fn parse(data: &[u8]) -> ParseOutcome {
        if data.len() < RECORD_HEADER_LEN {
            return ParseOutcome::Err(ParseError::Incomplete);
        }
        if data[0] != HANDSHAKE_CONTENT_TYPE {
            return ParseOutcome::Err(ParseError::Malformed);
        }
        let (major, minor) = (data[1], data[2]);
        if major < 3 || (major == 3 && minor < 1) {
            return ParseOutcome::Err(ParseError::Malformed);
        }

        let record_len = match u16_be(data, 3) {
            Some(n) => n as usize,
            None => return ParseOutcome::Err(ParseError::Incomplete),
        };
        if data.len() < RECORD_HEADER_LEN + record_len {
            return ParseOutcome::Err(ParseError::Incomplete);
        }
        let consumed = RECORD_HEADER_LEN + record_len;
        let body = &data[RECORD_HEADER_LEN..consumed];

        if body.is_empty() || body[0] != CLIENT_HELLO {
            return ParseOutcome::Err(ParseError::Malformed);
        }

        if body.len() < FIXED_PREFIX_LEN {
            return ParseOutcome::Err(ParseError::Malformed);
        }
        let mut pos = FIXED_PREFIX_LEN;

        pos = match skip_length_prefixed(body, pos, 1) {
            Some(p) => p,
            None => return ParseOutcome::Err(ParseError::Malformed),
        };
        pos = match skip_length_prefixed(body, pos, 2) {
            Some(p) => p,
            None => return ParseOutcome::Err(ParseError::Malformed),
        };
        pos = match skip_length_prefixed(body, pos, 1) {
            Some(p) => p,
            None => return ParseOutcome::Err(ParseError::Malformed),
        };

        // Extensions are optional in pre-TLS-1.3 ClientHellos: if there's no
        // room left for even the 2-byte extensions length, there's no SNI.
        let ext_total_len = match u16_be(body, pos) {
            Some(n) => n as usize,
            None => return ParseOutcome::Err(ParseError::NoHostname),
        };
        pos += 2;
        if pos + ext_total_len > body.len() {
            return ParseOutcome::Err(ParseError::Malformed);
        }
        let ext_end = pos + ext_total_len;

        while pos < ext_end {
            if pos + 4 > ext_end {
                return ParseOutcome::Err(ParseError::Malformed);
            }
            let ext_type = u16_be(body, pos).unwrap();
            pos += 2;
            let ext_len = u16_be(body, pos).unwrap() as usize;
            pos += 2;
            if pos + ext_len > ext_end {
                return ParseOutcome::Err(ParseError::Malformed);
            }

            if ext_type == EXT_SERVER_NAME {
                return parse_server_name_extension(&body[pos..pos + ext_len], consumed);
            }

            pos += ext_len;
        }

        ParseOutcome::Err(ParseError::NoHostname)
    }
}

/// Skip a `length_bytes`-wide length-prefixed field (session id, cipher
/// suites, or compression methods), returning the new position.
fn skip_length_prefixed(body: &[u8], pos: usize, length_bytes: usize) -> Option<usize> {
    let len = match length_bytes {
        1 => *body.get(pos)? as usize,
        2 => u16_be(body, pos)? as usize,
        _ => unreachable!(),
    };
    let pos = pos + length_bytes;
    if pos + len > body.len() {
        return None;
    }
    Some(pos + len)
}

fn parse_server_name_extension(ext_body: &[u8], consumed: usize) -> ParseOutcome {
    if ext_body.len() < 2 {
        return ParseOutcome::Err(ParseError::Malformed);
    }
    let list_len = u16_be(ext_body, 0).unwrap() as usize;
    if 2 + list_len > ext_body.len() {
        return ParseOutcome::Err(ParseError::Malformed);
    }
    let list_end = 2 + list_len;
    let mut p = 2;

    while p < list_end {
        if p + 3 > list_end {
            return ParseOutcome::Err(ParseError::Malformed);
        }
        let name_type = ext_body[p];
        p += 1;
        let name_len = u16_be(ext_body, p).unwrap() as usize;
        p += 2;
        if p + name_len > list_end {
            return ParseOutcome::Err(ParseError::Malformed);
        }

        if name_type == SNI_HOST_NAME_TYPE {
            let capped = name_len.min(255);
            return match std::str::from_utf8(&ext_body[p..p + capped]) {
                Ok(s) => ParseOutcome::Ok {
                    hostname: Some(s.to_ascii_lowercase()),
                    consumed,
                },
                Err(_) => ParseOutcome::Err(ParseError::Malformed),
            };
        }

        p += name_len;
    }

    // RFC 6066 §3: "The ServerNameList MUST NOT contain more than one name
    // of the same name_type", and there's exactly one server_name
    // extension allowed, so no host-type entry here means there's
    // definitely no SNI hostname in this ClientHello.
    ParseOutcome::Err(ParseError::NoHostname)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u16b(n: u16) -> [u8; 2] {
        n.to_be_bytes()
    }

    /// Build a minimal ClientHello record carrying a single server_name
    /// extension with `host`, for use as a golden input across tests.
    fn client_hello_with_sni(host: &[u8]) -> Vec<u8> {
        let mut server_name_entry = Vec::new();
        server_name_entry.push(0u8); // name_type: host_name
        server_name_entry.extend_from_slice(&u16b(host.len() as u16));
        server_name_entry.extend_from_slice(host);

        let mut server_name_list = Vec::new();
        server_name_list.extend_from_slice(&u16b(server_name_entry.len() as u16));
        server_name_list.extend_from_slice(&server_name_entry);

        let mut sni_ext = Vec::new();
        sni_ext.extend_from_slice(&u16b(0x0000)); // extension type: server_name
        sni_ext.extend_from_slice(&u16b(server_name_list.len() as u16));
        sni_ext.extend_from_slice(&server_name_list);

        let mut hello_body = Vec::new();
        hello_body.extend_from_slice(&[0x03, 0x03]); // legacy_version
        hello_body.extend_from_slice(&[0u8; 32]); // random
        hello_body.push(0); // session id length
        hello_body.extend_from_slice(&u16b(2)); // cipher suites length
        hello_body.extend_from_slice(&[0x13, 0x01]);
        hello_body.push(1); // compression methods length
        hello_body.push(0);
        hello_body.extend_from_slice(&u16b(sni_ext.len() as u16)); // extensions length
        hello_body.extend_from_slice(&sni_ext);

        let mut handshake = Vec::new();
        handshake.push(0x01); // ClientHello
        let len = hello_body.len() as u32;
        handshake.extend_from_slice(&len.to_be_bytes()[1..]); // 3-byte length
        handshake.extend_from_slice(&hello_body);

        let mut record = Vec::new();
        record.push(0x16);
        record.extend_from_slice(&[0x03, 0x01]);
        record.extend_from_slice(&u16b(handshake.len() as u16));
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn extracts_sni_hostname() {
        let record = client_hello_with_sni(b"nginx1.umbrella.com");
        match TlsParser::parse(&record) {
            ParseOutcome::Ok { hostname, consumed } => {
                assert_eq!(hostname.as_deref(), Some("nginx1.umbrella.com"));
                assert_eq!(consumed, record.len());
            }
            other => panic!("expected Ok, got {:?}", other),
        }
    }

    #[test]
    fn truncated_prefixes_are_incomplete_until_exact_boundary() {
        let record = client_hello_with_sni(b"www.example.com");
        for len in 0..record.len() {
            assert_eq!(
                TlsParser::parse(&record[..len]),
                ParseOutcome::Err(ParseError::Incomplete),
                "prefix of length {} should be Incomplete",
                len
            );
        }
        match TlsParser::parse(&record) {
            ParseOutcome::Ok { hostname, consumed } => {
                assert_eq!(hostname.as_deref(), Some("www.example.com"));
                assert_eq!(consumed, record.len());
            }
            other => panic!("expected Ok, got {:?}", other),
        }
    }

    #[test]
    fn missing_sni_extension_is_no_hostname() {
        let mut hello_body = Vec::new();
        hello_body.extend_from_slice(&[0x03, 0x03]);
        hello_body.extend_from_slice(&[0u8; 32]);
        hello_body.push(0);
        hello_body.extend_from_slice(&u16b(2));
        hello_body.extend_from_slice(&[0x13, 0x01]);
        hello_body.push(1);
        hello_body.push(0);
        hello_body.extend_from_slice(&u16b(0)); // no extensions

        let mut handshake = vec![0x01];
        let len = hello_body.len() as u32;
        handshake.extend_from_slice(&len.to_be_bytes()[1..]);
        handshake.extend_from_slice(&hello_body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&u16b(handshake.len() as u16));
        record.extend_from_slice(&handshake);

        assert_eq!(
            TlsParser::parse(&record),
            ParseOutcome::Err(ParseError::NoHostname)
        );
    }

    #[test]
    fn wrong_content_type_is_malformed() {
        let mut record = client_hello_with_sni(b"x.com");
        record[0] = 0x17; // application_data, not handshake
        assert_eq!(
            TlsParser::parse(&record),
            ParseOutcome::Err(ParseError::Malformed)
        );
    }

    #[test]
    fn empty_input_is_incomplete() {
        assert_eq!(
            TlsParser::parse(&[]),
            ParseOutcome::Err(ParseError::Incomplete)
        );
    }
}
