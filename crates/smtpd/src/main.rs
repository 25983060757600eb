use crate::config::DaemonConfig;
use crate::logging::{DiagnosticFormat, LoggingConfig};
use crate::policy::{AddReceivedLine, Deliver, LogClose, StaticAuthenticator};
use anyhow::Context;
use clap::Parser;
use smtp_server::{ServerError, SmtpServer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::SignalKind;

mod config;
mod http;
mod logging;
mod policy;
mod tls;

/// A programmable SMTP server
#[derive(Debug, Parser)]
#[command(about, version)]
struct Opt {
    /// Load settings from this TOML file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Accept SMTP connections on this address. May be repeated.
    /// Replaces the `listen` list from the config file.
    #[arg(long)]
    listen: Vec<String>,

    /// Serve prometheus metrics at /metrics on this address
    #[arg(long)]
    metrics_listen: Option<String>,

    /// The name to announce in the banner and in EHLO
    #[arg(long)]
    hostname: Option<String>,

    /// PEM encoded certificate chain for STARTTLS
    #[arg(long)]
    tls_certificate: Option<PathBuf>,

    /// PEM encoded private key for STARTTLS. When neither this nor
    /// the config file provide a key, a self-signed certificate is
    /// generated.
    #[arg(long)]
    tls_private_key: Option<PathBuf>,

    /// PEM encoded CA used to verify client certificates
    #[arg(long)]
    tls_client_ca: Option<PathBuf>,

    /// Refuse MAIL until the client has issued STARTTLS
    #[arg(long)]
    require_tls: bool,

    /// Write accepted messages into this directory
    #[arg(long)]
    spool_dir: Option<PathBuf>,

    /// Write diagnostic logs into this directory, rotating hourly,
    /// rather than to stderr
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    /// How to format diagnostic logs
    #[arg(long, value_enum, default_value = "full")]
    diag_format: DiagnosticFormat,
}

impl Opt {
    fn apply(&self, config: &mut DaemonConfig) {
        if !self.listen.is_empty() {
            config.listen = self.listen.clone();
        }
        if let Some(addr) = &self.metrics_listen {
            config.metrics_listen.replace(addr.clone());
        }
        if let Some(hostname) = &self.hostname {
            config.server.hostname.replace(hostname.clone());
        }
        if let Some(path) = &self.tls_certificate {
            config.tls_certificate.replace(path.clone());
        }
        if let Some(path) = &self.tls_private_key {
            config.tls_private_key.replace(path.clone());
        }
        if let Some(path) = &self.tls_client_ca {
            config.tls_client_ca.replace(path.clone());
        }
        if let Some(path) = &self.spool_dir {
            config.spool_dir.replace(path.clone());
        }
        if self.require_tls {
            config.server.require_tls = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    let _log_guard = LoggingConfig {
        log_dir: opts.diag_log_dir.clone(),
        filter_env_var: "SMTPD_LOG",
        default_filter: "smtpd=info,smtp_server=info",
        diag_format: opts.diag_format,
    }
    .init()?;

    if let Err(err) = run(opts).await {
        tracing::error!("{err:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    let mut config = match &opts.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };
    opts.apply(&mut config);

    if config.listen.is_empty() {
        anyhow::bail!(
            "No listeners defined! use the --listen option or the `listen` \
             config setting to specify at least one!"
        );
    }

    let hostname = config.server.effective_hostname();
    let tls_config = tls::make_server_config(
        &hostname,
        &config.tls_private_key,
        &config.tls_certificate,
        &config.tls_client_ca,
    )
    .await?;

    let mut builder = SmtpServer::builder(config.server.clone())
        .tls_config(tls_config)
        .data_checker(Arc::new(AddReceivedLine))
        .handler(Arc::new(Deliver::new(config.spool_dir.clone())))
        .close_checker(Arc::new(LogClose));
    if !config.users.is_empty() {
        builder = builder.authenticator(Arc::new(StaticAuthenticator::new(config.users.clone())));
    }
    let server = builder.build()?;

    if let Some(dir) = &config.spool_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating spool directory {}", dir.display()))?;
    }

    let mut listeners = vec![];
    for endpoint in &config.listen {
        let listener = TcpListener::bind(endpoint)
            .await
            .with_context(|| format!("failed to bind to {endpoint}"))?;
        let server = server.clone();
        listeners.push(tokio::spawn(async move { server.serve(listener).await }));
    }

    if let Some(listen) = &config.metrics_listen {
        http::start(listen, server.clone()).await?;
    }

    wait_for_signal().await?;
    tracing::info!("Shutdown requested, waiting for in-flight transactions to complete");
    server.shutdown(true).await?;

    for listener in listeners {
        match listener.await {
            Ok(Ok(())) | Ok(Err(ServerError::Closed)) => {}
            Ok(Err(err)) => tracing::error!("listener failed: {err:#}"),
            Err(err) => tracing::error!("listener task failed: {err:#}"),
        }
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() -> anyhow::Result<()> {
    let mut sig_term =
        tokio::signal::unix::signal(SignalKind::terminate()).context("listen for SIGTERM")?;
    tokio::select! {
        _ = sig_term.recv() => {}
        result = tokio::signal::ctrl_c() => result.context("listen for SIGINT")?,
    };
    Ok(())
}
