//! Decoding for the two SASL mechanisms we offer over AUTH
use data_encoding::BASE64;
use std::str::FromStr;
use thiserror::Error;

/// Base64 of `Username:`
pub const LOGIN_USERNAME_CHALLENGE: &str = "VXNlcm5hbWU6";
/// Base64 of `Password:`
pub const LOGIN_PASSWORD_CHALLENGE: &str = "UGFzc3dvcmQ6";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    Plain,
    Login,
}

impl SaslMechanism {
    /// As listed in the EHLO `AUTH` extension
    pub const ADVERTISED: &'static str = "PLAIN LOGIN";
}

impl FromStr for SaslMechanism {
    type Err = SaslError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("PLAIN") {
            Ok(Self::Plain)
        } else if s.eq_ignore_ascii_case("LOGIN") {
            Ok(Self::Login)
        } else {
            Err(SaslError::UnsupportedMechanism(s.to_string()))
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SaslError {
    #[error("Unsupported authentication mechanism {0}")]
    UnsupportedMechanism(String),
    #[error("Couldn't decode your credentials.")]
    InvalidBase64,
    #[error("Couldn't decode your credentials.")]
    InvalidUtf8,
    #[error("Couldn't decode your credentials.")]
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainCredentials {
    pub authzid: String,
    pub username: String,
    pub password: String,
}

/// Decodes a PLAIN response: base64 of `authzid\0authcid\0password`
pub fn decode_plain(response: &str) -> Result<PlainCredentials, SaslError> {
    let decoded = decode_utf8(response)?;
    let mut parts = decoded.split('\0');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(authzid), Some(username), Some(password), None) if !username.is_empty() => {
            Ok(PlainCredentials {
                authzid: authzid.to_string(),
                username: username.to_string(),
                password: password.to_string(),
            })
        }
        _ => Err(SaslError::Malformed),
    }
}

/// Decodes one of the LOGIN responses (username or password)
pub fn decode_login(response: &str) -> Result<String, SaslError> {
    decode_utf8(response)
}

pub fn encode_plain(authzid: &str, username: &str, password: &str) -> String {
    BASE64.encode(format!("{authzid}\0{username}\0{password}").as_bytes())
}

pub fn encode_login(value: &str) -> String {
    BASE64.encode(value.as_bytes())
}

fn decode_utf8(response: &str) -> Result<String, SaslError> {
    let bytes = BASE64
        .decode(response.trim().as_bytes())
        .map_err(|_| SaslError::InvalidBase64)?;
    String::from_utf8(bytes).map_err(|_| SaslError::InvalidUtf8)
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn plain() {
        let encoded = encode_plain("", "joe", "s3cret");
        assert_equal!(
            decode_plain(&encoded),
            Ok(PlainCredentials {
                authzid: "".to_string(),
                username: "joe".to_string(),
                password: "s3cret".to_string(),
            })
        );
        // "\0user\0pass" produced by a typical client
        assert_equal!(
            decode_plain("AHVzZXIAcGFzcw==").map(|c| c.username),
            Ok("user".to_string())
        );
    }

    #[test]
    fn plain_errors() {
        assert_equal!(decode_plain("!!!"), Err(SaslError::InvalidBase64));
        assert_equal!(
            decode_plain(&encode_login("no separators")),
            Err(SaslError::Malformed)
        );
        assert_equal!(
            decode_plain(&encode_login("a\0b\0c\0d")),
            Err(SaslError::Malformed)
        );
        assert_equal!(
            decode_plain(&BASE64.encode(&[0, 0xff, 0, 0x41])),
            Err(SaslError::InvalidUtf8)
        );
    }

    #[test]
    fn login() {
        assert_equal!(decode_login(LOGIN_USERNAME_CHALLENGE), Ok("Username:".to_string()));
        assert_equal!(decode_login(LOGIN_PASSWORD_CHALLENGE), Ok("Password:".to_string()));
    }

    #[test]
    fn mechanisms() {
        assert_equal!("plain".parse::<SaslMechanism>(), Ok(SaslMechanism::Plain));
        assert_equal!("LOGIN".parse::<SaslMechanism>(), Ok(SaslMechanism::Login));
        assert_equal!(
            "CRAM-MD5".parse::<SaslMechanism>(),
            Err(SaslError::UnsupportedMechanism("CRAM-MD5".to_string()))
        );
    }
}
