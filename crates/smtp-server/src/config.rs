use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

/// Settings for an `SmtpServer`. Every field has a default, so an
/// empty TOML table is a valid configuration.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SmtpServerConfig {
    /// The name we present in the banner and in EHLO.
    /// Defaults to the local host name.
    #[serde(default)]
    pub hostname: Option<String>,

    /// Text that follows the hostname in the 220 banner
    #[serde(default = "SmtpServerConfig::default_banner")]
    pub banner: String,

    #[serde(default = "SmtpServerConfig::default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default = "SmtpServerConfig::default_max_recipients")]
    pub max_recipients: usize,

    /// 0 selects the default limit, a negative value removes it
    #[serde(default)]
    pub max_connections: i64,

    #[serde(
        default = "SmtpServerConfig::default_read_timeout",
        with = "duration_format"
    )]
    pub read_timeout: Duration,

    #[serde(
        default = "SmtpServerConfig::default_write_timeout",
        with = "duration_format"
    )]
    pub write_timeout: Duration,

    /// Bounds the whole of the DATA phase
    #[serde(
        default = "SmtpServerConfig::default_data_timeout",
        with = "duration_format"
    )]
    pub data_timeout: Duration,

    /// Bounds the reverse lookup performed before the banner
    #[serde(
        default = "SmtpServerConfig::default_dns_timeout",
        with = "duration_format"
    )]
    pub dns_timeout: Duration,

    /// Refuse MAIL until STARTTLS has been negotiated
    #[serde(default)]
    pub require_tls: bool,

    /// Perform the TLS handshake as soon as the connection is
    /// accepted, rather than waiting for STARTTLS
    #[serde(default)]
    pub implicit_tls: bool,

    #[serde(default)]
    pub enable_xclient: bool,

    #[serde(default)]
    pub enable_proxy_protocol: bool,

    #[serde(default)]
    pub skip_reverse_dns: bool,
}

impl Default for SmtpServerConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            banner: Self::default_banner(),
            max_message_size: Self::default_max_message_size(),
            max_recipients: Self::default_max_recipients(),
            max_connections: 0,
            read_timeout: Self::default_read_timeout(),
            write_timeout: Self::default_write_timeout(),
            data_timeout: Self::default_data_timeout(),
            dns_timeout: Self::default_dns_timeout(),
            require_tls: false,
            implicit_tls: false,
            enable_xclient: false,
            enable_proxy_protocol: false,
            skip_reverse_dns: false,
        }
    }
}

impl SmtpServerConfig {
    fn default_banner() -> String {
        "ESMTP ready.".to_string()
    }

    fn default_max_message_size() -> usize {
        10_240_000
    }

    fn default_max_recipients() -> usize {
        100
    }

    fn default_read_timeout() -> Duration {
        Duration::from_secs(60)
    }

    fn default_write_timeout() -> Duration {
        Duration::from_secs(60)
    }

    fn default_data_timeout() -> Duration {
        Duration::from_secs(5 * 60)
    }

    fn default_dns_timeout() -> Duration {
        Duration::from_secs(5)
    }

    /// The configured hostname, or the name of the local machine
    pub fn effective_hostname(&self) -> String {
        match &self.hostname {
            Some(name) if !name.is_empty() => name.clone(),
            _ => gethostname::gethostname()
                .to_str()
                .unwrap_or("localhost")
                .to_string(),
        }
    }

    /// How many transactions may be served concurrently,
    /// or None when unlimited
    pub fn connection_limit(&self) -> Option<usize> {
        match self.max_connections {
            0 => Some(DEFAULT_MAX_CONNECTIONS),
            n if n < 0 => None,
            n => Some(usize::try_from(n).unwrap_or(usize::MAX)),
        }
    }
}

/// Durations are written as humantime strings such as `"30s"` or
/// `"5m"`; a bare integer is taken as a number of seconds.
mod duration_format {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Seconds(u64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Repr::Text(text) => humantime::parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }
}
