//! Optional request extensions.
//!
//! Extensions follow the command inside the (possibly decrypted) request:
//!
//! ```text
//! +------+--------+-----------------+
//! | type | length | payload         |
//! | u8   | u32 LE | length bytes    |
//! +------+--------+-----------------+
//! ```
//!
//! Parsing stops at the first unknown or malformed entry; everything parsed
//! before it is kept.

use bytes::{BufMut, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const EXT_HEADER_SIZE: usize = 5;

const EXT_SOURCE_DOMAIN: u8 = b'd';
const EXT_SOURCE_IP4: u8 = b'4';
const EXT_SOURCE_IP6: u8 = b'6';

/// A single request extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    /// Domain of the message sender, used for per-domain accounting.
    SourceDomain(String),
    SourceIp4(Ipv4Addr),
    SourceIp6(Ipv6Addr),
}

impl Extension {
    pub fn type_byte(&self) -> u8 {
        match self {
            Extension::SourceDomain(_) => EXT_SOURCE_DOMAIN,
            Extension::SourceIp4(_) => EXT_SOURCE_IP4,
            Extension::SourceIp6(_) => EXT_SOURCE_IP6,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Extension::SourceDomain(domain) => domain.as_bytes().to_vec(),
            Extension::SourceIp4(ip) => ip.octets().to_vec(),
            Extension::SourceIp6(ip) => ip.octets().to_vec(),
        }
    }

    fn parse(ty: u8, payload: &[u8]) -> Option<Self> {
        match ty {
            EXT_SOURCE_DOMAIN => std::str::from_utf8(payload)
                .ok()
                .filter(|d| !d.is_empty())
                .map(|d| Extension::SourceDomain(d.to_string())),
            EXT_SOURCE_IP4 => {
                let octets: [u8; 4] = payload.try_into().ok()?;
                Some(Extension::SourceIp4(Ipv4Addr::from(octets)))
            }
            EXT_SOURCE_IP6 => {
                let octets: [u8; 16] = payload.try_into().ok()?;
                Some(Extension::SourceIp6(Ipv6Addr::from(octets)))
            }
            _ => None,
        }
    }
}

impl From<IpAddr> for Extension {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Extension::SourceIp4(v4),
            IpAddr::V6(v6) => Extension::SourceIp6(v6),
        }
    }
}

/// The extension chain of one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extensions(Vec<Extension>);

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses as many well-formed entries as the buffer holds.
    pub fn parse(mut buf: &[u8]) -> Self {
        let mut items = Vec::new();

        while buf.len() >= EXT_HEADER_SIZE {
            let ty = buf[0];
            let len = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
            let rest = &buf[EXT_HEADER_SIZE..];
            if len > rest.len() {
                break;
            }

            let (payload, tail) = rest.split_at(len);
            match Extension::parse(ty, payload) {
                Some(ext) => items.push(ext),
                None => break,
            }
            buf = tail;
        }

        Extensions(items)
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        for ext in &self.0 {
            let payload = ext.payload();
            buf.put_u8(ext.type_byte());
            buf.put_u32_le(payload.len() as u32);
            buf.put_slice(&payload);
        }
        buf
    }

    pub fn push(&mut self, ext: Extension) {
        self.0.push(ext);
    }

    pub fn with(mut self, ext: Extension) -> Self {
        self.push(ext);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Extension> {
        self.0.iter()
    }

    /// First source domain in the chain.
    pub fn source_domain(&self) -> Option<&str> {
        self.0.iter().find_map(|ext| match ext {
            Extension::SourceDomain(d) => Some(d.as_str()),
            _ => None,
        })
    }

    /// First source address in the chain.
    pub fn source_ip(&self) -> Option<IpAddr> {
        self.0.iter().find_map(|ext| match ext {
            Extension::SourceIp4(ip) => Some(IpAddr::V4(*ip)),
            Extension::SourceIp6(ip) => Some(IpAddr::V6(*ip)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chain() {
        let exts = Extensions::new()
            .with(Extension::SourceDomain("example.com".into()))
            .with(Extension::SourceIp4(Ipv4Addr::new(192, 0, 2, 1)));
        let bytes = exts.encode();

        assert_eq!(bytes[0], b'd');
        assert_eq!(&bytes[1..5], &11u32.to_le_bytes());

        let parsed = Extensions::parse(&bytes);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.source_domain(), Some("example.com"));
        assert_eq!(parsed.source_ip(), Some("192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn test_ipv6_extension() {
        let ip: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let bytes = Extensions::new().with(Extension::SourceIp6(ip)).encode();
        assert_eq!(bytes.len(), EXT_HEADER_SIZE + 16);
        assert_eq!(Extensions::parse(&bytes).source_ip(), Some(IpAddr::V6(ip)));
    }

    #[test]
    fn test_stops_at_unknown_type() {
        let mut bytes = Extensions::new()
            .with(Extension::SourceDomain("a.org".into()))
            .encode()
            .to_vec();
        bytes.extend_from_slice(&[b'z', 1, 0, 0, 0, 0]);
        bytes.extend_from_slice(&Extensions::new().with(Extension::SourceIp4(Ipv4Addr::LOCALHOST)).encode());

        let parsed = Extensions::parse(&bytes);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.source_ip(), None);
    }

    #[test]
    fn test_stops_at_malformed_entry() {
        // Declared length runs past the end of the buffer
        let mut bytes = Extensions::new()
            .with(Extension::SourceDomain("a.org".into()))
            .encode()
            .to_vec();
        bytes.extend_from_slice(&[b'd', 100, 0, 0, 0, b'x']);
        assert_eq!(Extensions::parse(&bytes).len(), 1);

        // IPv4 payload with the wrong width
        let bytes = [b'4', 3, 0, 0, 0, 1, 2, 3];
        assert!(Extensions::parse(&bytes).is_empty());

        // Trailing garbage shorter than a header
        assert!(Extensions::parse(&[b'd', 1]).is_empty());
        assert!(Extensions::parse(&[]).is_empty());
    }

    #[test]
    fn test_from_ip_addr() {
        let ext: Extension = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)).into();
        assert_eq!(ext.type_byte(), b'4');
    }
}
