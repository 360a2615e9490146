//! DTLS ClientHello parser, grounded on `dtls.c`. Same extension-walking
//! logic as the TLS parser but with the wider DTLS record/handshake headers
//! (message sequence, fragment offset, fragment length) and a cookie field
//! the TLS handshake doesn't have.

use super::{u16_be, HandshakeParser};
use crate::error::{ParseError, ParseOutcome};

const RECORD_HEADER_LEN: usize = 13;
const HANDSHAKE_CONTENT_TYPE: u8 = 0x16;
const CLIENT_HELLO: u8 = 0x01;
// handshake type(1)+length(3)+message_seq(2)+fragment_offset(3)+
// fragment_length(3)+legacy_version(2)+random(32) = 46
const FIXED_PREFIX_LEN: usize = 46;
const EXT_SERVER_NAME: u16 = 0x0000;
const SNI_HOST_NAME_TYPE: u8 = 0x00;

/// `15 fe fd 00 02 02 28`: fatal handshake_failure alert, DTLS framing.
pub const ABORT_MESSAGE: [u8; 7] = [0x15, 0xfe, 0xfd, 0x00, 0x02, 0x02, 0x28];

pub struct DtlsParser;

impl HandshakeParser for DtlsParser {
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
        if data[1] != 0xfe || data[2] != 0xfd {
            return ParseOutcome::Err(ParseError::Malformed);
        }

        let record_len = match u16_be(data, 11) {
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
            // session id
            Some(p) => p,
            None => return ParseOutcome::Err(ParseError::Malformed),
        };
        pos = match skip_length_prefixed(body, pos, 1) {
            // cookie
            Some(p) => p,
            None => return ParseOutcome::Err(ParseError::Malformed),
        };
        pos = match skip_length_prefixed(body, pos, 2) {
            // cipher suites
            Some(p) => p,
            None => return ParseOutcome::Err(ParseError::Malformed),
        };
        pos = match skip_length_prefixed(body, pos, 1) {
            // compression methods
            Some(p) => p,
            None => return ParseOutcome::Err(ParseError::Malformed),
        };

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

    ParseOutcome::Err(ParseError::NoHostname)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u16b(n: u16) -> [u8; 2] {
        n.to_be_bytes()
    }

    fn client_hello_with_sni(host: &[u8]) -> Vec<u8> {
        let mut server_name_entry = vec![0u8];
        server_name_entry.extend_from_slice(&u16b(host.len() as u16));
        server_name_entry.extend_from_slice(host);

        let mut server_name_list = Vec::new();
        server_name_list.extend_from_slice(&u16b(server_name_entry.len() as u16));
        server_name_list.extend_from_slice(&server_name_entry);

        let mut sni_ext = Vec::new();
        sni_ext.extend_from_slice(&u16b(0x0000));
        sni_ext.extend_from_slice(&u16b(server_name_list.len() as u16));
        sni_ext.extend_from_slice(&server_name_list);

        let mut hello_body = Vec::new();
        hello_body.extend_from_slice(&u16b(1)); // message_seq
        hello_body.extend_from_slice(&[0, 0, 0]); // fragment_offset
        // fragment_length filled in below once we know the rest
        let mut rest = Vec::new();
        rest.extend_from_slice(&[0x03, 0x03]); // legacy_version (DTLS 1.2 wire value differs but unused here)
        rest.extend_from_slice(&[0u8; 32]); // random
        rest.push(0); // session id length
        rest.push(0); // cookie length
        rest.extend_from_slice(&u16b(2)); // cipher suites length
        rest.extend_from_slice(&[0x13, 0x01]);
        rest.push(1); // compression methods length
        rest.push(0);
        rest.extend_from_slice(&u16b(sni_ext.len() as u16));
        rest.extend_from_slice(&sni_ext);

        hello_body.extend_from_slice(&(rest.len() as u32).to_be_bytes()[1..]); // fragment_length
        hello_body.extend_from_slice(&rest);

        let mut handshake = vec![0x01];
        let len = rest.len() as u32; // length of the ClientHello body itself
        handshake.extend_from_slice(&len.to_be_bytes()[1..]);
        handshake.extend_from_slice(&hello_body);

        let mut record = vec![0x16, 0xfe, 0xfd];
        record.extend_from_slice(&[0, 0]); // epoch
        record.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // sequence number
        record.extend_from_slice(&u16b(handshake.len() as u16));
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn extracts_sni_hostname() {
        let record = client_hello_with_sni(b"dtls.example.com");
        match DtlsParser::parse(&record) {
            ParseOutcome::Ok { hostname, consumed } => {
                assert_eq!(hostname.as_deref(), Some("dtls.example.com"));
                assert_eq!(consumed, record.len());
            }
            other => panic!("expected Ok, got {:?}", other),
        }
    }

    #[test]
    fn wrong_version_is_malformed() {
        let mut record = client_hello_with_sni(b"x.com");
        record[1] = 0xfe;
        record[2] = 0xfe; // not DTLS 1.2
        assert_eq!(
            DtlsParser::parse(&record),
            ParseOutcome::Err(ParseError::Malformed)
        );
    }

    #[test]
    fn truncated_is_incomplete() {
        let record = client_hello_with_sni(b"x.example.com");
        for len in 0..record.len() {
            assert_eq!(
                DtlsParser::parse(&record[..len]),
                ParseOutcome::Err(ParseError::Incomplete)
            );
        }
    }

    #[test]
    fn empty_input_is_incomplete() {
        assert_eq!(
            DtlsParser::parse(&[]),
            ParseOutcome::Err(ParseError::Incomplete)
        );
    }
}
