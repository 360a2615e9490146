//! The tagged-union `Address` type, grounded on `address.c`/`address.h`. The
//! original stores a flexible-array-member struct (`enum tag` + trailing
//! bytes) because C has no sum types; per spec §9 ("Design notes") this
//! becomes a plain Rust `enum` with one variant per address kind instead.

use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// `1..=63` bytes, `[A-Za-z0-9_-]`, no leading/trailing hyphen.
fn valid_label(label: &str) -> bool {
    if label.is_empty() || label.len() > 63 {
        return false;
    }
    if label.starts_with('-') || label.ends_with('-') {
        return false;
    }
    label
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Validate a DNS hostname per spec §3: 1-255 bytes total, each label 1-63
/// bytes of `[A-Za-z0-9_-]`, no empty labels (so no leading/trailing dot and
/// no `..`).
pub fn valid_hostname(hostname: &str) -> bool {
    if hostname.is_empty() || hostname.len() > 255 {
        return false;
    }
    if hostname.starts_with('.') {
        return false;
    }
    hostname.split('.').all(valid_label)
}

/// A target or bind address, per spec §3.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// A validated, lowercased DNS name plus an optional port (0 = unset).
    Hostname { name: String, port: u16 },
    /// An IPv4, IPv6, or Unix-path socket address.
    Sockaddr(SockAddr),
    /// "Use the client-requested hostname as the target."
    Wildcard { port: u16 },
}

/// The non-hostname half of [`Address::Sockaddr`]; kept as its own type so
/// ordering/encoding can match the original's "variant tag, then
/// lexicographic on encoded bytes" rule without borrowing `std::net`'s own
/// (different) ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SockAddr {
    Inet(SocketAddr),
    Unix(String),
}

impl Address {
    /// Parse one of the forms in spec §3/§4.2. Tries, in order: bracketed
    /// `[IPv6]`, raw IPv6, `unix:`-prefixed path, wildcard `*`, `host:port`
    /// split on the last `:` if the tail is fully numeric, IPv4, validated
    /// hostname.
    pub fn parse(s: &str) -> Option<Address> {
        if s.is_empty() {
            return None;
        }

        // bracketed IPv6, optionally with :port
        if let Some(rest) = s.strip_prefix('[') {
            let close = rest.find(']')?;
            let (ip_part, tail) = rest.split_at(close);
            let ip: Ipv6Addr = ip_part.parse().ok()?;
            let tail = &tail[1..]; // drop ']'
            let port = if let Some(p) = tail.strip_prefix(':') {
                p.parse::<u16>().ok()?
            } else if tail.is_empty() {
                0
            } else {
                return None;
            };
            return Some(Address::Sockaddr(SockAddr::Inet(SocketAddr::new(
                IpAddr::V6(ip),
                port,
            ))));
        }

        // raw IPv6 (colon-containing but not host:port, since that's
        // ambiguous with IPv6 -- try IPv6 parse first, same as the original
        // trying inet_pton(AF_INET6, ...) before checking for a trailing
        // port)
        if let Ok(ip) = Ipv6Addr::from_str(s) {
            return Some(Address::Sockaddr(SockAddr::Inet(SocketAddr::new(
                IpAddr::V6(ip),
                0,
            ))));
        }

        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return None;
            }
            return Some(Address::Sockaddr(SockAddr::Unix(path.to_string())));
        }

        if s == "*" {
            return Some(Address::Wildcard { port: 0 });
        }

        // host:port, where the tail after the last ':' is fully numeric
        if let Some(idx) = s.rfind(':') {
            let (head, tail) = (&s[..idx], &s[idx + 1..]);
            if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(port) = tail.parse::<u16>() {
                    if let Some(mut addr) = Address::parse(head) {
                        addr.set_port(port);
                        return Some(addr);
                    }
                }
            }
        }

        if let Ok(ip) = Ipv4Addr::from_str(s) {
            return Some(Address::Sockaddr(SockAddr::Inet(SocketAddr::new(
                IpAddr::V4(ip),
                0,
            ))));
        }

        // Accept Unicode hostnames by normalizing to their ASCII/Punycode
        // form first (RFC 5891), the same conversion the teacher's
        // `sniproxy-hostname` diagnostic used `idna` for.
        let ascii = idna::domain_to_ascii_strict(s).unwrap_or_else(|_| s.to_ascii_lowercase());
        if valid_hostname(&ascii) {
            return Some(Address::Hostname {
                name: ascii,
                port: 0,
            });
        }

        None
    }

    pub fn is_hostname(&self) -> bool {
        matches!(self, Address::Hostname { .. })
    }

    pub fn is_sockaddr(&self) -> bool {
        matches!(self, Address::Sockaddr(_))
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Address::Wildcard { .. })
    }

    pub fn hostname(&self) -> Option<&str> {
        match self {
            Address::Hostname { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Address::Sockaddr(SockAddr::Inet(sa)) => Some(*sa),
            _ => None,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Hostname { port, .. } => *port,
            Address::Wildcard { port } => *port,
            Address::Sockaddr(SockAddr::Inet(sa)) => sa.port(),
            Address::Sockaddr(SockAddr::Unix(_)) => 0,
        }
    }

    /// Late-binding port assignment: updates both the tag-side port field
    /// and the embedded sockaddr port when present, per spec §4.2.
    pub fn set_port(&mut self, port: u16) {
        match self {
            Address::Hostname { port: p, .. } => *p = port,
            Address::Wildcard { port: p } => *p = port,
            Address::Sockaddr(SockAddr::Inet(sa)) => sa.set_port(port),
            Address::Sockaddr(SockAddr::Unix(_)) => {}
        }
    }

    fn variant_tag(&self) -> u8 {
        match self {
            Address::Hostname { .. } => 0,
            Address::Sockaddr(_) => 1,
            Address::Wildcard { .. } => 2,
        }
    }

    fn encoded_bytes(&self) -> Vec<u8> {
        match self {
            Address::Hostname { name, .. } => name.as_bytes().to_vec(),
            Address::Wildcard { .. } => Vec::new(),
            Address::Sockaddr(SockAddr::Unix(p)) => p.as_bytes().to_vec(),
            Address::Sockaddr(SockAddr::Inet(SocketAddr::V4(sa))) => {
                sa.ip().octets().to_vec()
            }
            Address::Sockaddr(SockAddr::Inet(SocketAddr::V6(sa))) => {
                sa.ip().octets().to_vec()
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Hostname { name, port } => {
                if *port != 0 {
                    write!(f, "{}:{}", name, port)
                } else {
                    write!(f, "{}", name)
                }
            }
            Address::Wildcard { port } => {
                if *port != 0 {
                    write!(f, "*:{}", port)
                } else {
                    write!(f, "*")
                }
            }
            Address::Sockaddr(SockAddr::Unix(p)) => write!(f, "unix:{}", p),
            Address::Sockaddr(SockAddr::Inet(SocketAddr::V4(sa))) => {
                if sa.port() != 0 {
                    write!(f, "{}:{}", sa.ip(), sa.port())
                } else {
                    write!(f, "{}", sa.ip())
                }
            }
            Address::Sockaddr(SockAddr::Inet(SocketAddr::V6(sa))) => {
                if sa.port() != 0 {
                    write!(f, "[{}]:{}", sa.ip(), sa.port())
                } else {
                    write!(f, "[{}]", sa.ip())
                }
            }
        }
    }
}

/// Ordering (for listener insertion), per spec §3: by variant tag, then
/// lexicographic on encoded bytes, then by port.
impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        self.variant_tag()
            .cmp(&other.variant_tag())
            .then_with(|| self.encoded_bytes().cmp(&other.encoded_bytes()))
            .then_with(|| self.port().cmp(&other.port()))
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl serde::Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Address::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid address: {:?}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(s: &str) -> String {
        Address::parse(s).unwrap_or_else(|| panic!("failed to parse {:?}", s)).to_string()
    }

    #[test]
    fn canonical_roundtrips() {
        assert_eq!(roundtrip("192.0.2.10"), "192.0.2.10");
        assert_eq!(roundtrip("192.0.2.10:80"), "192.0.2.10:80");
        assert_eq!(roundtrip("::1"), "[::1]");
        assert_eq!(roundtrip("[2001:db8::1]:65535"), "[2001:db8::1]:65535");
        assert_eq!(roundtrip("unix:/tmp/foo.sock"), "unix:/tmp/foo.sock");
        assert_eq!(roundtrip("*"), "*");
        assert_eq!(roundtrip("www.example.com"), "www.example.com");
    }

    #[test]
    fn rejects_bad_input() {
        assert!(Address::parse("").is_none());
        assert!(Address::parse("www..example.com").is_none());
        assert!(Address::parse("1n\\/l1|>|-|0$T|\\|4M").is_none());
    }

    #[test]
    fn hostname_is_a_hostname_variant() {
        match Address::parse("www.example.com").unwrap() {
            Address::Hostname { name, port } => {
                assert_eq!(name, "www.example.com");
                assert_eq!(port, 0);
            }
            other => panic!("expected Hostname, got {:?}", other),
        }
    }

    #[test]
    fn hostname_lowercased() {
        let addr = Address::parse("WWW.Example.COM").unwrap();
        assert_eq!(addr.hostname(), Some("www.example.com"));
    }

    #[test]
    fn set_port_updates_embedded_sockaddr() {
        let mut addr = Address::parse("192.0.2.10").unwrap();
        addr.set_port(8443);
        assert_eq!(addr.to_string(), "192.0.2.10:8443");
        assert_eq!(addr.socket_addr().unwrap().port(), 8443);
    }

    #[test]
    fn ordering_by_variant_then_bytes_then_port() {
        let a = Address::parse("example.com").unwrap();
        let b = Address::parse("192.0.2.1").unwrap();
        let c = Address::parse("*").unwrap();
        assert!(a < b);
        assert!(b < c);
    }
}
