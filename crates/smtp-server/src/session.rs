use crate::checker::{CheckError, Stage};
use crate::karma;
use crate::server::ServerInner;
use crate::transaction::{Protocol, Transaction};
use rfc5321::{
    format_reply, BoxedAsyncReadAndWrite, CommandLine, ForwardPath, ReversePath, SaslMechanism,
    XCLIENT_ATTRIBUTES,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::Instrument;

/// Longest command line we are prepared to buffer, CRLF included
const MAX_LINE_LEN: usize = 4096;

#[derive(Error, Debug)]
pub(crate) enum SessionError {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("timed out after {0:?} while reading message data")]
    DataTimedOut(Duration),
    #[error("client disconnected")]
    Disconnected,
    #[error("connection is no longer available")]
    NotConnected,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What to do after a command has been handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Next {
    Continue,
    Close,
}

pub(crate) enum Line {
    Text(String),
    TooLong,
}

pub(crate) struct Session {
    pub server: Arc<ServerInner>,
    pub tx: Transaction,
    /// None only while STARTTLS is swapping the stream
    pub stream: Option<BufReader<BoxedAsyncReadAndWrite>>,
    /// Number of commands dispatched so far
    pub commands: usize,
}

impl Session {
    pub async fn serve_connection(server: Arc<ServerInner>, socket: TcpStream, peer: SocketAddr) {
        let local = match socket.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                tracing::debug!("unable to determine local address for {peer}: {err:#}");
                return;
            }
        };
        if let Err(err) = socket.set_nodelay(true) {
            tracing::debug!("failed to set TCP_NODELAY for {peer}: {err:#}");
        }

        let tx = Transaction::new(
            server.hostname.clone(),
            local,
            peer,
            server.resolver.clone(),
        );
        let span = tracing::info_span!("smtp", id = %tx.id(), peer = %peer);
        let stream: BoxedAsyncReadAndWrite = Box::new(socket);
        let session = Session {
            server,
            tx,
            stream: Some(BufReader::new(stream)),
            commands: 0,
        };
        session.run().instrument(span).await;
    }

    async fn run(mut self) {
        let _active = self.server.counters.begin_transaction();
        tracing::debug!("accepted connection");

        match self.serve().await {
            Ok(()) => {}
            Err(err @ SessionError::TimedOut(_)) => {
                tracing::debug!("{err:#}");
                if let Err(err) = self.reply(421, "Connection timed out.").await {
                    tracing::trace!("unable to report timeout: {err:#}");
                }
            }
            Err(SessionError::Disconnected) => tracing::debug!("client disconnected"),
            Err(err) => tracing::debug!("session ended: {err:#}"),
        }

        let server = self.server.clone();
        if let Err(err) = server.pipelines.run(Stage::Close, &mut self.tx).await {
            tracing::warn!("close pipeline failed: {err:#}");
        }

        if let Some(mut stream) = self.stream.take() {
            timeout(self.server.config.write_timeout, stream.shutdown())
                .await
                .ok();
        }
        tracing::debug!(karma = self.tx.karma(), "transaction complete");
    }

    async fn serve(&mut self) -> Result<(), SessionError> {
        if self.server.config.implicit_tls && !self.implicit_handshake().await? {
            return Ok(());
        }

        self.lookup_ptrs().await;

        let server = self.server.clone();
        if let Err(err) = server.pipelines.run(Stage::Connection, &mut self.tx).await {
            self.reply_error(&err).await?;
            return Ok(());
        }

        self.greet().await?;

        loop {
            let line = match self.read_line(self.server.config.read_timeout).await? {
                Line::Text(line) => line,
                Line::TooLong => {
                    self.tx.penalize(karma::MISSING_PARAMETER_PENALTY);
                    self.reply(500, "5.5.2 Line too long").await?;
                    continue;
                }
            };

            let cmd = CommandLine::parse(&line);
            let span = tracing::debug_span!("command", action = %cmd.action);
            let next = self.dispatch(cmd).instrument(span).await?;
            self.commands += 1;
            if next == Next::Close {
                return Ok(());
            }
        }
    }

    async fn dispatch(&mut self, cmd: CommandLine) -> Result<Next, SessionError> {
        match cmd.action.as_str() {
            // Credentials may follow the verb
            "AUTH" => tracing::debug!("AUTH"),
            _ => tracing::debug!("{}", cmd.fields.join(" ")),
        }

        match cmd.action.as_str() {
            "HELO" => self.handle_helo(&cmd, Protocol::Smtp).await,
            "EHLO" => self.handle_helo(&cmd, Protocol::Esmtp).await,
            "MAIL" => self.handle_mail(&cmd).await,
            "RCPT" => self.handle_rcpt(&cmd).await,
            "DATA" => self.handle_data().await,
            "RSET" => {
                self.tx.reset_envelope();
                self.reply_continue(250, "Go ahead.").await
            }
            "NOOP" => self.reply_continue(250, "Go ahead.").await,
            "QUIT" => {
                let message = format!("OK, bye, see you soon! (transaction {})", self.tx.id());
                self.reply(221, message).await?;
                Ok(Next::Close)
            }
            "STARTTLS" => self.handle_starttls().await,
            "AUTH" => self.handle_auth(&cmd).await,
            "PROXY" => self.handle_proxy(&cmd).await,
            "XCLIENT" => self.handle_xclient(&cmd).await,
            _ => {
                self.tx.penalize(karma::UNKNOWN_COMMAND_PENALTY);
                self.reply_continue(502, "Unsupported command.").await
            }
        }
    }

    pub(crate) async fn greet(&mut self) -> Result<(), SessionError> {
        let banner = format!("{} {}", self.server.hostname, self.server.config.banner);
        self.reply(220, banner).await
    }

    /// Fill in the reverse DNS names for the current remote address
    pub(crate) async fn lookup_ptrs(&mut self) {
        self.tx.ptrs.clear();
        if self.server.config.skip_reverse_dns {
            return;
        }
        let ip = self.tx.remote_addr.ip();
        let resolver = self.tx.resolver().clone();
        let dns_timeout = self.server.config.dns_timeout;
        match timeout(dns_timeout, resolver.reverse_lookup(ip)).await {
            Ok(Ok(names)) => self.tx.ptrs = names,
            Ok(Err(err)) => tracing::debug!("reverse lookup for {ip} failed: {err:#}"),
            Err(_) => tracing::debug!("reverse lookup for {ip} timed out after {dns_timeout:?}"),
        }
    }

    async fn handle_helo(
        &mut self,
        cmd: &CommandLine,
        protocol: Protocol,
    ) -> Result<Next, SessionError> {
        let Some(name) = cmd.argument() else {
            self.tx.penalize(karma::MISSING_PARAMETER_PENALTY);
            return self.reply_continue(502, "Missing parameter").await;
        };

        let previous = (self.tx.helo.replace(name.to_string()), self.tx.protocol);
        self.tx.protocol = protocol;

        let server = self.server.clone();
        if let Err(err) = server.pipelines.run(Stage::Helo, &mut self.tx).await {
            (self.tx.helo, self.tx.protocol) = previous;
            return self.reply_error_continue(&err).await;
        }

        self.tx.reset_envelope();
        self.tx.reward(karma::COMMAND_EXECUTED_PROPERLY);

        match protocol {
            Protocol::Smtp => self.reply_continue(250, "Go ahead").await,
            Protocol::Esmtp => {
                let extensions = self.ehlo_extensions();
                self.reply_continue(250, extensions).await
            }
        }
    }

    fn ehlo_extensions(&self) -> String {
        let mut lines = vec![
            self.server.hostname.clone(),
            format!("SIZE {}", self.server.config.max_message_size),
            "8BITMIME".to_string(),
            "PIPELINING".to_string(),
        ];
        if self.server.config.enable_xclient {
            lines.push(format!("XCLIENT {XCLIENT_ATTRIBUTES}"));
        }
        if self.server.tls.is_some() && !self.tx.encrypted {
            lines.push("STARTTLS".to_string());
        }
        if self.server.authenticator.is_some() && self.tx.encrypted {
            lines.push(format!("AUTH {}", SaslMechanism::ADVERTISED));
        }
        lines.join("\n")
    }

    async fn handle_mail(&mut self, cmd: &CommandLine) -> Result<Next, SessionError> {
        if self.tx.helo.is_none() {
            self.tx.penalize(karma::ORDER_VIOLATION_PENALTY);
            return self
                .reply_continue(502, "Please introduce yourself first.")
                .await;
        }
        if self.server.config.require_tls && !self.tx.encrypted {
            self.tx.penalize(karma::ORDER_VIOLATION_PENALTY);
            return self
                .reply_continue(502, "Please turn on TLS by issuing a STARTTLS command.")
                .await;
        }
        if self.server.authenticator.is_some() && !self.tx.is_authenticated() {
            self.tx.penalize(karma::ORDER_VIOLATION_PENALTY);
            return self.reply_continue(530, "Authentication Required.").await;
        }
        if self.tx.mail_from.is_some() {
            self.tx.penalize(karma::ORDER_VIOLATION_PENALTY);
            return self.reply_continue(502, "Duplicate MAIL").await;
        }

        let path = match (cmd.keyword().as_deref(), cmd.path_argument()) {
            (Some("FROM"), Some(path)) => path,
            _ => {
                self.tx.penalize(karma::MISSING_PARAMETER_PENALTY);
                return self.reply_continue(502, "Invalid syntax.").await;
            }
        };

        let sender = match ReversePath::parse(&path) {
            Ok(sender) => sender,
            Err(err) => {
                tracing::debug!("rejecting sender {path:?}: {err}");
                self.tx.penalize(karma::MISSING_PARAMETER_PENALTY);
                return self.reply_continue(502, "Malformed e-mail address").await;
            }
        };

        if let Some(declared) = declared_size(cmd.esmtp_parameters()) {
            if declared > self.server.config.max_message_size {
                self.tx.penalize(karma::TOO_BIG_MESSAGE_PENALTY);
                let message = format!(
                    "Message exceeded max message size of {} bytes",
                    self.server.config.max_message_size
                );
                return self.reply_continue(552, message).await;
            }
        }

        self.tx.mail_from = Some(sender);

        let server = self.server.clone();
        if let Err(err) = server.pipelines.run(Stage::Sender, &mut self.tx).await {
            self.tx.mail_from = None;
            return self.reply_error_continue(&err).await;
        }

        self.tx.reward(karma::COMMAND_EXECUTED_PROPERLY);
        self.reply_continue(250, "Go ahead").await
    }

    async fn handle_rcpt(&mut self, cmd: &CommandLine) -> Result<Next, SessionError> {
        if self.tx.mail_from.is_none() {
            self.tx.penalize(karma::ORDER_VIOLATION_PENALTY);
            return self.reply_continue(502, "Missing MAIL FROM command.").await;
        }
        if self.tx.rcpt_to.len() >= self.server.config.max_recipients {
            self.tx.penalize(karma::TOO_MANY_RECIPIENTS_PENALTY);
            return self.reply_continue(452, "Too many recipients").await;
        }

        let path = match (cmd.keyword().as_deref(), cmd.path_argument()) {
            (Some("TO"), Some(path)) => path,
            _ => {
                self.tx.penalize(karma::MISSING_PARAMETER_PENALTY);
                return self.reply_continue(502, "Invalid syntax.").await;
            }
        };

        let recipient = match ForwardPath::parse(&path) {
            Ok(recipient) => recipient,
            Err(err) => {
                tracing::debug!("rejecting recipient {path:?}: {err}");
                self.tx.penalize(karma::MISSING_PARAMETER_PENALTY);
                return self.reply_continue(502, "Malformed e-mail address").await;
            }
        };

        let server = self.server.clone();
        if let Err(err) = server
            .pipelines
            .run_recipient(&mut self.tx, &recipient)
            .await
        {
            self.tx.penalize(karma::RECIPIENT_REJECTED_PENALTY);
            return self.reply_error_continue(&err).await;
        }

        // Only the first recipient earns karma, otherwise a
        // client could inflate its score by adding recipients
        if self.tx.rcpt_to.is_empty() {
            self.tx.reward(karma::COMMAND_EXECUTED_PROPERLY);
        }
        self.tx.rcpt_to.push(recipient);
        self.reply_continue(250, "Go ahead").await
    }

    pub(crate) async fn reply(
        &mut self,
        code: u16,
        message: impl AsRef<str>,
    ) -> Result<(), SessionError> {
        let text = format_reply(code, message.as_ref());
        let write_timeout = self.server.config.write_timeout;
        let stream = self.stream.as_mut().ok_or(SessionError::NotConnected)?;

        match timeout(write_timeout, async {
            stream.write_all(text.as_bytes()).await?;
            stream.flush().await
        })
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(SessionError::TimedOut(write_timeout)),
        }

        self.server
            .counters
            .bytes_written
            .inc_by(text.len() as u64);
        tracing::trace!("replied {code} {}", message.as_ref());
        Ok(())
    }

    pub(crate) async fn reply_continue(
        &mut self,
        code: u16,
        message: impl AsRef<str>,
    ) -> Result<Next, SessionError> {
        self.reply(code, message).await?;
        Ok(Next::Continue)
    }

    pub(crate) async fn reply_error(&mut self, err: &CheckError) -> Result<(), SessionError> {
        self.reply(err.code(), err.message()).await
    }

    pub(crate) async fn reply_error_continue(
        &mut self,
        err: &CheckError,
    ) -> Result<Next, SessionError> {
        self.reply_error(err).await?;
        Ok(Next::Continue)
    }

    /// Read one line, bounded by `MAX_LINE_LEN` and by `duration`
    pub(crate) async fn read_line(&mut self, duration: Duration) -> Result<Line, SessionError> {
        match timeout(duration, self.read_line_unbounded()).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::TimedOut(duration)),
        }
    }

    async fn read_line_unbounded(&mut self) -> Result<Line, SessionError> {
        let mut line = Vec::new();
        let mut too_long = false;

        loop {
            let stream = self.stream.as_mut().ok_or(SessionError::NotConnected)?;
            let buf = stream.fill_buf().await?;
            if buf.is_empty() {
                return Err(SessionError::Disconnected);
            }

            let (chunk, done) = match memchr::memchr(b'\n', buf) {
                Some(idx) => (&buf[..=idx], true),
                None => (buf, false),
            };
            let consumed = chunk.len();

            if !too_long {
                if line.len() + consumed > MAX_LINE_LEN {
                    // Keep discarding until the end of the line
                    too_long = true;
                    line.clear();
                } else {
                    line.extend_from_slice(chunk);
                }
            }

            stream.consume(consumed);
            self.server.counters.bytes_read.inc_by(consumed as u64);

            if done {
                break;
            }
        }

        if too_long {
            return Ok(Line::TooLong);
        }

        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        Ok(Line::Text(String::from_utf8_lossy(&line).into_owned()))
    }
}

/// The value of a `SIZE=` ESMTP parameter, if present and numeric
fn declared_size(params: &[String]) -> Option<usize> {
    params.iter().find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.eq_ignore_ascii_case("SIZE") {
            value.parse().ok()
        } else {
            None
        }
    })
}
