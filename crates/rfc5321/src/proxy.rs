//! The text form (version 1) of the HAProxy PROXY protocol:
//! `PROXY TCP4|TCP6 <src-ip> <dst-ip> <src-port> <dst-port>`
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyFamily {
    Tcp4,
    Tcp6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    pub family: ProxyFamily,
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    #[error("Couldn't decode the command.")]
    Malformed,
    #[error("Invalid protocol {0}")]
    Protocol(String),
    #[error("Couldn't parse source address {0}")]
    SourceAddress(String),
    #[error("Couldn't parse destination address {0}")]
    DestinationAddress(String),
    #[error("Couldn't parse source port {0}")]
    SourcePort(String),
    #[error("Couldn't parse destination port {0}")]
    DestinationPort(String),
}

impl ProxyHeader {
    pub fn parse(line: &str) -> Result<Self, ProxyError> {
        let fields: Vec<&str> = line.split_ascii_whitespace().collect();
        Self::from_fields(&fields)
    }

    /// Builds the header from an already tokenized line; the first
    /// field is the `PROXY` verb itself.
    pub fn from_fields<S: AsRef<str>>(fields: &[S]) -> Result<Self, ProxyError> {
        let fields: Vec<&str> = fields.iter().map(AsRef::as_ref).collect();
        let [verb, family, src, dst, src_port, dst_port] = fields[..] else {
            return Err(ProxyError::Malformed);
        };
        if !verb.eq_ignore_ascii_case("PROXY") {
            return Err(ProxyError::Malformed);
        }

        let family = match family {
            "TCP4" => ProxyFamily::Tcp4,
            "TCP6" => ProxyFamily::Tcp6,
            other => return Err(ProxyError::Protocol(other.to_string())),
        };

        let source = parse_ip(family, src).ok_or_else(|| ProxyError::SourceAddress(src.to_string()))?;
        let destination =
            parse_ip(family, dst).ok_or_else(|| ProxyError::DestinationAddress(dst.to_string()))?;
        let source_port = parse_port(src_port)
            .ok_or_else(|| ProxyError::SourcePort(src_port.to_string()))?;
        let destination_port = parse_port(dst_port)
            .ok_or_else(|| ProxyError::DestinationPort(dst_port.to_string()))?;

        Ok(Self {
            family,
            source: SocketAddr::new(source, source_port),
            destination: SocketAddr::new(destination, destination_port),
        })
    }
}

fn parse_ip(family: ProxyFamily, text: &str) -> Option<IpAddr> {
    match family {
        ProxyFamily::Tcp4 => text.parse::<Ipv4Addr>().ok().map(IpAddr::V4),
        ProxyFamily::Tcp6 => text.parse::<Ipv6Addr>().ok().map(IpAddr::V6),
    }
}

fn parse_port(text: &str) -> Option<u16> {
    // Leading zeros and signs are not permitted by the protocol
    if text.is_empty() || text.len() > 5 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if text.len() > 1 && text.starts_with('0') {
        return None;
    }
    text.parse().ok()
}
