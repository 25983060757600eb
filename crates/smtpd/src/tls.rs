use anyhow::Context;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;

async fn read(path: &Path) -> anyhow::Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))
}

fn read_trust_anchor(trust_anchor: &[u8]) -> anyhow::Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    let mut added = 0;
    for cert in CertificateDer::pem_slice_iter(trust_anchor) {
        store.add(cert?)?;
        added += 1;
    }

    if added == 0 {
        anyhow::bail!("failed to parse certs");
    }

    Ok(store)
}

/// Build the STARTTLS configuration. Without a private key, a
/// self-signed certificate is generated for `hostname`.
/// Client certificates are requested when a client CA is given,
/// but they are optional; a client that presents one that verifies
/// is marked as secured.
pub async fn make_server_config(
    hostname: &str,
    tls_private_key: &Option<PathBuf>,
    tls_certificate: &Option<PathBuf>,
    client_ca: &Option<PathBuf>,
) -> anyhow::Result<Arc<ServerConfig>> {
    let mut certificates = vec![];
    let private_key = match tls_private_key {
        Some(key) => PrivateKeyDer::from_pem_slice(&read(key).await?)
            .with_context(|| format!("loading private key from {}", key.display()))?,
        None => {
            tracing::info!("no TLS key configured, generating a self-signed certificate");
            let key = rcgen::generate_simple_self_signed(vec![hostname.to_string()])?;
            certificates.push(key.cert.der().clone());
            PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.key_pair.serialize_der()))
        }
    };

    if let Some(cert_file) = tls_certificate {
        let data = read(cert_file).await?;
        certificates = CertificateDer::pem_slice_iter(&data)
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("loading certificates from {}", cert_file.display()))?;
    }

    let config = ServerConfig::builder();
    let config = match client_ca {
        Some(client_ca) => {
            let ca = read(client_ca).await?;
            let verifier = WebPkiClientVerifier::builder(read_trust_anchor(&ca)?.into())
                .allow_unauthenticated()
                .build()?;
            config.with_client_cert_verifier(verifier)
        }
        None => config.with_no_client_auth(),
    };
    let config = config.with_single_cert(certificates, private_key)?;

    Ok(Arc::new(config))
}
