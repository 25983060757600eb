use crate::karma;
use crate::session::{Next, Session, SessionError};
use crate::transaction::{Protocol, TlsInfo};
use rfc5321::BoxedAsyncReadAndWrite;
use tokio::io::BufReader;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

impl Session {
    pub(crate) async fn handle_starttls(&mut self) -> Result<Next, SessionError> {
        if self.tx.encrypted {
            self.tx.penalize(karma::STARTTLS_NOT_POSSIBLE_PENALTY);
            return self.reply_continue(502, "Already running in TLS").await;
        }
        let Some(acceptor) = self.server.tls.clone() else {
            self.tx.penalize(karma::STARTTLS_NOT_POSSIBLE_PENALTY);
            return self.reply_continue(502, "TLS not supported").await;
        };

        self.reply(220, "Go ahead").await?;

        let reader = self.stream.take().ok_or(SessionError::NotConnected)?;
        // Plaintext that was pipelined after STARTTLS must not be
        // interpreted as if it had arrived over the secure channel
        let pipelined = reader.buffer().len();
        if pipelined > 0 {
            tracing::warn!("discarding {pipelined} bytes pipelined after STARTTLS");
        }

        if !self.handshake(acceptor, reader.into_inner()).await? {
            self.tx.penalize(karma::TLS_HANDSHAKE_FAILED_PENALTY);
            self.reply(550, "Handshake error").await?;
            return Ok(Next::Close);
        }

        // The client has to introduce itself again
        self.tx.reset_envelope();
        self.tx.helo = None;
        self.tx.protocol = Protocol::Smtp;
        Ok(Next::Continue)
    }

    /// TLS from the first byte, for servers configured with implicit TLS.
    /// Returns false if the handshake failed.
    pub(crate) async fn implicit_handshake(&mut self) -> Result<bool, SessionError> {
        let Some(acceptor) = self.server.tls.clone() else {
            return Ok(true);
        };
        let reader = self.stream.take().ok_or(SessionError::NotConnected)?;
        let ok = self.handshake(acceptor, reader.into_inner()).await?;
        if !ok {
            self.tx.penalize(karma::TLS_HANDSHAKE_FAILED_PENALTY);
        }
        Ok(ok)
    }

    /// On failure the plaintext stream is put back so that the
    /// caller can still reply on it.
    async fn handshake(
        &mut self,
        acceptor: TlsAcceptor,
        stream: BoxedAsyncReadAndWrite,
    ) -> Result<bool, SessionError> {
        let read_timeout = self.server.config.read_timeout;
        let stream = match timeout(read_timeout, acceptor.accept(stream).into_fallible()).await {
            Ok(Ok(stream)) => stream,
            Ok(Err((err, stream))) => {
                tracing::debug!("TLS handshake failed: {err:#}");
                self.stream.replace(BufReader::new(stream));
                return Ok(false);
            }
            Err(_) => return Err(SessionError::TimedOut(read_timeout)),
        };

        let (_, conn) = stream.get_ref();
        let info = TlsInfo {
            protocol_version: match conn.protocol_version() {
                Some(version) => version.as_str().unwrap_or("UNKNOWN").to_string(),
                None => String::new(),
            },
            cipher: match conn.negotiated_cipher_suite() {
                Some(suite) => suite.suite().as_str().unwrap_or("UNKNOWN").to_string(),
                None => String::new(),
            },
        };
        self.tx.secured = conn
            .peer_certificates()
            .is_some_and(|certs| !certs.is_empty());
        tracing::debug!(
            version = %info.protocol_version,
            cipher = %info.cipher,
            secured = self.tx.secured,
            "TLS established"
        );
        self.tx.tls = Some(info);
        self.tx.encrypted = true;

        let stream: BoxedAsyncReadAndWrite = Box::new(stream);
        self.stream.replace(BufReader::new(stream));
        Ok(true)
    }
}
