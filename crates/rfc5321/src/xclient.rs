//! Postfix style XCLIENT attributes.
//! <https://www.postfix.org/XCLIENT_README.html>
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// The attribute names we understand, as advertised in EHLO
pub const XCLIENT_ATTRIBUTES: &str = "NAME ADDR PORT PROTO HELO LOGIN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XClientProto {
    Smtp,
    Esmtp,
}

impl FromStr for XClientProto {
    type Err = XClientError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("SMTP") {
            Ok(Self::Smtp)
        } else if s.eq_ignore_ascii_case("ESMTP") {
            Ok(Self::Esmtp)
        } else {
            Err(XClientError::InvalidProto(s.to_string()))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XClientAttributes {
    pub addr: Option<IpAddr>,
    pub port: Option<u16>,
    pub proto: Option<XClientProto>,
    pub helo: Option<String>,
    pub login: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XClientError {
    #[error("Couldn't decode the command.")]
    Empty,
    #[error("Couldn't decode attribute {0}")]
    Malformed(String),
    #[error("Unsupported attribute {0}")]
    UnknownAttribute(String),
    #[error("Couldn't parse address {0}")]
    InvalidAddress(String),
    #[error("Couldn't parse port {0}")]
    InvalidPort(String),
    #[error("Unsupported protocol {0}")]
    InvalidProto(String),
}

impl XClientAttributes {
    /// Parse the `key=value` pairs that follow the `XCLIENT` verb
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self, XClientError> {
        if args.is_empty() {
            return Err(XClientError::Empty);
        }

        let mut attrs = Self::default();
        for arg in args {
            let arg = arg.as_ref();
            let (key, value) = arg
                .split_once('=')
                .ok_or_else(|| XClientError::Malformed(arg.to_string()))?;
            let key = key.to_ascii_uppercase();
            let value = decode_xtext(value).ok_or_else(|| XClientError::Malformed(arg.to_string()))?;

            let available = !matches!(value.as_str(), "[UNAVAILABLE]" | "[TEMPUNAVAIL]");

            match key.as_str() {
                // The proxy's idea of the client's hostname is not
                // trusted; the server looks the address up itself
                "NAME" => {}
                "ADDR" => {
                    if available {
                        let addr = value
                            .strip_prefix("IPV6:")
                            .or_else(|| value.strip_prefix("ipv6:"))
                            .unwrap_or(&value);
                        let addr = addr
                            .parse::<IpAddr>()
                            .map_err(|_| XClientError::InvalidAddress(value.clone()))?;
                        attrs.addr = Some(addr);
                    }
                }
                "PORT" => {
                    if available {
                        let port = value
                            .parse::<u16>()
                            .map_err(|_| XClientError::InvalidPort(value.clone()))?;
                        attrs.port = Some(port);
                    }
                }
                "PROTO" => {
                    if available {
                        attrs.proto = Some(value.parse()?);
                    }
                }
                "HELO" => {
                    if available {
                        attrs.helo = Some(value);
                    }
                }
                "LOGIN" => {
                    if available {
                        attrs.login = Some(value);
                    }
                }
                _ => return Err(XClientError::UnknownAttribute(key)),
            }
        }
        Ok(attrs)
    }
}

/// Decode RFC 3461 xtext, where `+XX` encodes a byte as hex
fn decode_xtext(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'+' {
            let hex = bytes.get(idx + 1..idx + 3)?;
            if !hex.iter().all(u8::is_ascii_hexdigit) {
                return None;
            }
            let hex = std::str::from_utf8(hex).ok()?;
            result.push(u8::from_str_radix(hex, 16).ok()?);
            idx += 3;
        } else {
            result.push(bytes[idx]);
            idx += 1;
        }
    }
    String::from_utf8(result).ok()
}
