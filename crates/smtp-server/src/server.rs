use crate::checker::{Authenticator, Checker, Pipelines, RecipientChecker};
use crate::config::SmtpServerConfig;
use crate::lifecycle::{Activity, LifeCycle};
use crate::metrics::ServerCounters;
use crate::resolver::{default_resolver, Resolver};
use crate::session::Session;
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

#[derive(Error, Debug)]
pub enum ServerError {
    /// The server has been shut down and will not accept connections
    #[error("server closed")]
    Closed,
    #[error("shutdown has not been initiated")]
    NotShuttingDown,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to set up metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub(crate) struct ServerInner {
    pub config: SmtpServerConfig,
    pub hostname: String,
    pub pipelines: Pipelines,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub tls: Option<TlsAcceptor>,
    pub resolver: Arc<dyn Resolver>,
    /// Admission gate; None when the connection cap is disabled
    gate: Option<Arc<Semaphore>>,
    life_cycle: LifeCycle,
    pub counters: ServerCounters,
}

/// Assembles an `SmtpServer` from its configuration and the
/// checkers that make up its policy.
pub struct SmtpServerBuilder {
    config: SmtpServerConfig,
    pipelines: Pipelines,
    authenticator: Option<Arc<dyn Authenticator>>,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    resolver: Option<Arc<dyn Resolver>>,
}

impl SmtpServerBuilder {
    pub fn new(config: SmtpServerConfig) -> Self {
        Self {
            config,
            pipelines: Pipelines::default(),
            authenticator: None,
            tls_config: None,
            resolver: None,
        }
    }

    pub fn connection_checker(mut self, checker: Arc<dyn Checker>) -> Self {
        self.pipelines.connection.push(checker);
        self
    }

    pub fn helo_checker(mut self, checker: Arc<dyn Checker>) -> Self {
        self.pipelines.helo.push(checker);
        self
    }

    pub fn sender_checker(mut self, checker: Arc<dyn Checker>) -> Self {
        self.pipelines.sender.push(checker);
        self
    }

    pub fn recipient_checker(mut self, checker: Arc<dyn RecipientChecker>) -> Self {
        self.pipelines.recipient.push(checker);
        self
    }

    /// Validates the message after it has been received
    pub fn data_checker(mut self, checker: Arc<dyn Checker>) -> Self {
        self.pipelines.data.push(checker);
        self
    }

    /// Takes responsibility for a validated message
    pub fn handler(mut self, handler: Arc<dyn Checker>) -> Self {
        self.pipelines.handlers.push(handler);
        self
    }

    /// Runs when the connection ends, however it ends
    pub fn close_checker(mut self, checker: Arc<dyn Checker>) -> Self {
        self.pipelines.close.push(checker);
        self
    }

    /// Replace all of the pipelines at once
    pub fn pipelines(mut self, pipelines: Pipelines) -> Self {
        self.pipelines = pipelines;
        self
    }

    /// Once set, AUTH is offered and MAIL requires authentication
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator.replace(authenticator);
        self
    }

    pub fn tls_config(mut self, tls_config: Arc<rustls::ServerConfig>) -> Self {
        self.tls_config.replace(tls_config);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver.replace(resolver);
        self
    }

    pub fn build(self) -> Result<SmtpServer, ServerError> {
        if self.tls_config.is_none() {
            if self.config.require_tls {
                return Err(ServerError::Config(
                    "require_tls is set but no TLS configuration was provided".to_string(),
                ));
            }
            if self.config.implicit_tls {
                return Err(ServerError::Config(
                    "implicit_tls is set but no TLS configuration was provided".to_string(),
                ));
            }
        }

        let gate = self
            .config
            .connection_limit()
            .map(|limit| Arc::new(Semaphore::new(limit.min(Semaphore::MAX_PERMITS))));

        Ok(SmtpServer {
            inner: Arc::new(ServerInner {
                hostname: self.config.effective_hostname(),
                config: self.config,
                pipelines: self.pipelines,
                authenticator: self.authenticator,
                tls: self.tls_config.map(TlsAcceptor::from),
                resolver: self.resolver.unwrap_or_else(default_resolver),
                gate,
                life_cycle: LifeCycle::new(),
                counters: ServerCounters::new()?,
            }),
        })
    }
}

/// A running (or runnable) SMTP server. Cloning produces another
/// handle on the same server.
#[derive(Clone)]
pub struct SmtpServer {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for SmtpServer {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("SmtpServer")
            .field("hostname", &self.inner.hostname)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl SmtpServer {
    pub fn builder(config: SmtpServerConfig) -> SmtpServerBuilder {
        SmtpServerBuilder::new(config)
    }

    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    pub fn config(&self) -> &SmtpServerConfig {
        &self.inner.config
    }

    /// Bind to `addr` and serve until shut down
    pub async fn listen_and_serve(&self, addr: impl ToSocketAddrs) -> Result<(), ServerError> {
        if self.is_shutting_down() {
            return Err(ServerError::Closed);
        }
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accept connections from `listener` until the server is shut
    /// down, at which point the listener is dropped and `Closed` is
    /// returned. Several listeners may be served concurrently.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut stop = self.inner.life_cycle.subscribe();
        if self.is_shutting_down() {
            return Err(ServerError::Closed);
        }

        if let Ok(addr) = listener.local_addr() {
            tracing::info!("smtp listener on {addr:?}");
        }

        loop {
            tokio::select! {
                // The watch guard must not live across the select
                _ = async { stop.wait_for(|stopping| *stopping).await.map(|_| ()) } => {
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => self.inner.clone().admit(socket, peer),
                    Err(err) => {
                        // Typically out of file descriptors; back off
                        // rather than spinning
                        tracing::error!("accept failed: {err:#}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }

        if let Ok(addr) = listener.local_addr() {
            tracing::info!("smtp listener on {addr:?} stopped");
        }
        Err(ServerError::Closed)
    }

    /// Stop accepting connections. When `wait` is true, also wait for
    /// the transactions that are in flight to complete. Calling this
    /// more than once is harmless.
    pub async fn shutdown(&self, wait: bool) -> Result<(), ServerError> {
        if self.inner.life_cycle.initiate_shutdown() {
            tracing::info!("shutting down");
        }
        if wait {
            self.wait().await?;
        }
        Ok(())
    }

    /// Wait for in-flight transactions to complete after shutdown
    /// has been initiated.
    pub async fn wait(&self) -> Result<(), ServerError> {
        if !self.is_shutting_down() {
            return Err(ServerError::NotShuttingDown);
        }
        self.inner.life_cycle.wait_for_activities().await;
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.life_cycle.is_shutting_down()
    }

    pub fn bytes_read(&self) -> u64 {
        self.inner.counters.bytes_read.get()
    }

    pub fn bytes_written(&self) -> u64 {
        self.inner.counters.bytes_written.get()
    }

    /// Number of connections that have been admitted
    pub fn transactions_total(&self) -> u64 {
        self.inner.counters.transactions.get()
    }

    pub fn messages_accepted(&self) -> u64 {
        self.inner.counters.messages_accepted.get()
    }

    /// Number of connections turned away by the connection cap
    pub fn rejected_busy(&self) -> u64 {
        self.inner.counters.rejected_busy.get()
    }

    pub fn active_transactions(&self) -> i64 {
        self.inner.counters.active()
    }

    pub fn metrics_registry(&self) -> &Registry {
        self.inner.counters.registry()
    }

    /// The prometheus text exposition of this server's counters
    pub fn render_metrics(&self) -> anyhow::Result<String> {
        self.inner.counters.render()
    }
}

impl ServerInner {
    fn admit(self: Arc<Self>, socket: TcpStream, peer: SocketAddr) {
        let Some(activity) = self.life_cycle.activity() else {
            tracing::debug!("shutting down, dropping connection from {peer}");
            return;
        };

        let permit = match self.gate.clone() {
            None => None,
            Some(gate) => match gate.try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    self.counters.rejected_busy.inc();
                    tracing::debug!("too many connections, turning away {peer}");
                    tokio::spawn(self.turn_away(socket, activity));
                    return;
                }
            },
        };

        tokio::spawn(async move {
            Session::serve_connection(self, socket, peer).await;
            drop(permit);
            drop(activity);
        });
    }

    async fn turn_away(self: Arc<Self>, mut socket: TcpStream, activity: Activity) {
        let reply = rfc5321::format_reply(421, "Too busy. Try again later.");
        let result = timeout(self.config.write_timeout, async {
            socket.write_all(reply.as_bytes()).await?;
            socket.shutdown().await
        })
        .await;
        match result {
            Ok(Ok(())) => self.counters.bytes_written.inc_by(reply.len() as u64),
            Ok(Err(err)) => tracing::debug!("failed to send busy reply: {err:#}"),
            Err(_) => tracing::debug!("timed out sending busy reply"),
        }
        drop(activity);
    }
}
