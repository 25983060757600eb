use anyhow::Context;
use serde::Deserialize;
use smtp_server::SmtpServerConfig;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The daemon's configuration file. The engine settings sit at the
/// top level alongside the daemon's own keys.
#[derive(Deserialize, Debug, Default)]
pub struct DaemonConfig {
    #[serde(flatten)]
    pub server: SmtpServerConfig,

    /// Addresses to accept SMTP connections on
    #[serde(default)]
    pub listen: Vec<String>,

    /// Where to serve `/metrics`
    #[serde(default)]
    pub metrics_listen: Option<String>,

    #[serde(default)]
    pub tls_certificate: Option<PathBuf>,
    #[serde(default)]
    pub tls_private_key: Option<PathBuf>,
    /// Client certificates verified against this CA mark the
    /// transaction as secured
    #[serde(default)]
    pub tls_client_ca: Option<PathBuf>,

    /// When non-empty, clients must AUTH as one of these users
    #[serde(default)]
    pub users: BTreeMap<String, String>,

    /// Accepted messages are written here, one file per message.
    /// Without it, messages are only logged.
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }
}
