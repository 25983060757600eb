use anyhow::Context;
use rfc5321::{BoxedAsyncReadAndWrite, Response, ResponseBuilder};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use smtp_server::{
    checker_fn, Checker, Protocol, ServerError, SmtpServer, SmtpServerBuilder, SmtpServerConfig,
    Transaction, UnavailableResolver,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

pub const HOSTNAME: &str = "mx.example.com";
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// A configuration with short timeouts and no DNS
pub fn test_config() -> SmtpServerConfig {
    SmtpServerConfig {
        hostname: Some(HOSTNAME.to_string()),
        skip_reverse_dns: true,
        read_timeout: Duration::from_secs(10),
        write_timeout: Duration::from_secs(10),
        data_timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

pub fn builder(config: SmtpServerConfig) -> SmtpServerBuilder {
    SmtpServer::builder(config).resolver(Arc::new(UnavailableResolver))
}

pub fn self_signed_tls() -> anyhow::Result<Arc<rustls::ServerConfig>> {
    let key = rcgen::generate_simple_self_signed(vec![HOSTNAME.to_string()])?;
    let certificates = vec![key.cert.der().clone()];
    let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.key_pair.serialize_der()));
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)?;
    Ok(Arc::new(config))
}

/// A server listening on an ephemeral port of the loopback interface
pub struct TestServer {
    pub server: SmtpServer,
    pub addr: SocketAddr,
    serving: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    pub async fn start(builder: SmtpServerBuilder) -> anyhow::Result<Self> {
        let server = builder.build()?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let serving = tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener).await }
        });
        Ok(Self {
            server,
            addr,
            serving,
        })
    }

    pub async fn client(&self) -> anyhow::Result<TestClient> {
        TestClient::connect(self.addr).await
    }

    /// Connect and consume the 220 banner
    pub async fn greeted_client(&self) -> anyhow::Result<TestClient> {
        let mut client = self.client().await?;
        let banner = client.read_response().await?;
        anyhow::ensure!(banner.code == 220, "unexpected banner {banner:?}");
        Ok(client)
    }

    pub async fn stop(self) -> anyhow::Result<()> {
        self.server.shutdown(true).await?;
        match timeout(CLIENT_TIMEOUT, self.serving).await?? {
            Err(ServerError::Closed) => Ok(()),
            other => anyhow::bail!("serve returned {other:?}"),
        }
    }
}

/// A deliberately simple client that speaks the protocol line by
/// line, so that tests can send things a real client never would.
pub struct TestClient {
    stream: Option<BufReader<BoxedAsyncReadAndWrite>>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream: BoxedAsyncReadAndWrite = Box::new(TcpStream::connect(addr).await?);
        Ok(Self {
            stream: Some(BufReader::new(stream)),
        })
    }

    fn stream(&mut self) -> anyhow::Result<&mut BufReader<BoxedAsyncReadAndWrite>> {
        self.stream.as_mut().context("connection is not available")
    }

    pub async fn read_response(&mut self) -> anyhow::Result<Response> {
        let mut builder = ResponseBuilder::default();
        loop {
            let mut line = String::new();
            let n = timeout(CLIENT_TIMEOUT, self.stream()?.read_line(&mut line))
                .await
                .context("timed out waiting for a response")??;
            anyhow::ensure!(n > 0, "connection closed while waiting for a response");
            if let Some(response) = builder.add_line(&line)? {
                return Ok(response);
            }
        }
    }

    pub async fn send_raw(&mut self, data: impl AsRef<[u8]>) -> anyhow::Result<()> {
        let stream = self.stream()?;
        stream.write_all(data.as_ref()).await?;
        stream.flush().await?;
        Ok(())
    }

    pub async fn command(&mut self, line: &str) -> anyhow::Result<Response> {
        self.send_raw(format!("{line}\r\n")).await?;
        self.read_response().await
    }

    /// Everything the server sends until it closes the connection
    pub async fn read_to_close(&mut self) -> anyhow::Result<String> {
        let mut data = vec![];
        timeout(CLIENT_TIMEOUT, self.stream()?.read_to_end(&mut data))
            .await
            .context("timed out waiting for the server to close")??;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    pub async fn ehlo(&mut self) -> anyhow::Result<Response> {
        let response = self.command("EHLO client.example.com").await?;
        anyhow::ensure!(response.code == 250, "EHLO failed: {response:?}");
        Ok(response)
    }

    pub async fn starttls(&mut self) -> anyhow::Result<()> {
        let response = self.command("STARTTLS").await?;
        anyhow::ensure!(response.code == 220, "STARTTLS refused: {response:?}");
        self.upgrade().await
    }

    /// Perform a TLS handshake, trusting whatever the server presents
    pub async fn upgrade(&mut self) -> anyhow::Result<()> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(rustls::DEFAULT_VERSIONS)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification::new(
                provider,
            )))
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let stream = self
            .stream
            .take()
            .context("connection is not available")?
            .into_inner();
        let server_name = ServerName::try_from(HOSTNAME.to_string())?;
        let stream = timeout(CLIENT_TIMEOUT, connector.connect(server_name, stream)).await??;
        let stream: BoxedAsyncReadAndWrite = Box::new(stream);
        self.stream.replace(BufReader::new(stream));
        Ok(())
    }

    /// MAIL, RCPT and DATA for a single recipient, returning the
    /// reply to the final dot
    pub async fn send_message(
        &mut self,
        sender: &str,
        recipient: &str,
        body: &str,
    ) -> anyhow::Result<Response> {
        let response = self.command(&format!("MAIL FROM:<{sender}>")).await?;
        anyhow::ensure!(response.code == 250, "MAIL failed: {response:?}");
        let response = self.command(&format!("RCPT TO:<{recipient}>")).await?;
        anyhow::ensure!(response.code == 250, "RCPT failed: {response:?}");
        let response = self.command("DATA").await?;
        anyhow::ensure!(response.code == 354, "DATA failed: {response:?}");
        self.send_raw(format!("{body}.\r\n")).await?;
        self.read_response().await
    }
}

/// What the close stage saw of a transaction
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: String,
    pub karma: i64,
    pub helo: Option<String>,
    pub protocol: Protocol,
    pub remote_addr: SocketAddr,
    pub ptrs: Vec<String>,
    pub encrypted: bool,
    pub secured: bool,
    pub tls_version: Option<String>,
    pub username: Option<String>,
    pub facts: HashMap<String, String>,
}

impl Snapshot {
    fn capture(tx: &Transaction) -> Self {
        Self {
            id: tx.id().to_string(),
            karma: tx.karma(),
            helo: tx.helo.clone(),
            protocol: tx.protocol,
            remote_addr: tx.remote_addr,
            ptrs: tx.ptrs.clone(),
            encrypted: tx.encrypted,
            secured: tx.secured,
            tls_version: tx.tls.as_ref().map(|info| info.protocol_version.clone()),
            username: tx.username.clone(),
            facts: tx.facts(),
        }
    }
}

pub struct Recorder {
    rx: UnboundedReceiver<Snapshot>,
}

impl Recorder {
    /// Returns a close checker that reports to the recorder
    pub fn new() -> (Arc<dyn Checker>, Self) {
        let (tx, rx) = unbounded_channel();
        let checker = checker_fn(move |t| {
            let tx = tx.clone();
            Box::pin(async move {
                tx.send(Snapshot::capture(t)).ok();
                Ok(())
            })
        });
        (checker, Self { rx })
    }

    pub async fn next(&mut self) -> anyhow::Result<Snapshot> {
        timeout(CLIENT_TIMEOUT, self.rx.recv())
            .await
            .context("timed out waiting for the close stage")?
            .context("recorder channel closed")
    }
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::DigitallySignedStruct;
    use std::sync::Arc;

    #[derive(Debug)]
    pub struct NoCertificateVerification(Arc<CryptoProvider>);

    impl NoCertificateVerification {
        pub fn new(provider: Arc<CryptoProvider>) -> Self {
            Self(provider)
        }
    }

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
