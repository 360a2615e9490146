//! Standalone diagnostic: read a single TLS ClientHello from stdin, print
//! the SNI hostname it carries. Supersedes the teacher's `sniproxy-hostname`
//! (which normalized a hostname given directly on the command line); this
//! version exercises the actual wire parser instead, which is more useful
//! for checking what a given ClientHello byte capture will route to.

use std::io::{self, Read};

use sniproxy::parse::{tls::TlsParser, HandshakeParser};

fn main() {
    let mut data = Vec::new();
    if io::stdin().read_to_end(&mut data).is_err() {
        eprintln!("usage: sni-probe < client_hello.bin");
        std::process::exit(2);
    }

    match TlsParser::parse(&data) {
        sniproxy::error::ParseOutcome::Ok { hostname: Some(host), .. } => {
            let mut hostname = host;

            #[cfg(feature = "hashed")]
            {
                use blake2::{Blake2s, Digest};
                let hash = Blake2s::digest(hostname.as_bytes());
                hostname = base64::encode_config(&hash, base64::URL_SAFE_NO_PAD);
            }

            println!("{}", hostname);
        }
        sniproxy::error::ParseOutcome::Ok { hostname: None, .. } => {
            eprintln!("ClientHello parsed but carried no hostname");
            std::process::exit(1);
        }
        sniproxy::error::ParseOutcome::Err(e) => {
            eprintln!("failed to parse ClientHello: {}", e);
            std::process::exit(1);
        }
    }
}
