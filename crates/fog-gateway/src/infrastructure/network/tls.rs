//! Mutually authenticated TLS for platform connections.
//!
//! Both directions use the same material: the gateway's own certificate and
//! key, and the CA chain that platform certificates must chain to.  The
//! acceptor verifies client certificates against the CA; the dialer
//! verifies the provider's server certificate against it and presents the
//! gateway's certificate in return.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::{self, PemObject};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::{VerifierBuilderError, WebPkiClientVerifier};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use super::session::{BoxedStream, Dialer};
use crate::infrastructure::storage::config::TlsSettings;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("cannot read {what} from {path}: {source}")]
    Pem {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: pem::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("CA certificate rejected: {0}")]
    CaCert(#[source] rustls::Error),

    #[error("cannot build client verifier: {0}")]
    Verifier(#[from] VerifierBuilderError),

    #[error("invalid TLS configuration: {0}")]
    Config(#[from] rustls::Error),
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

// ── PEM loading ───────────────────────────────────────────────────────────────

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem_err = |source| TlsError::Pem {
        what: "certificates",
        path: path.to_path_buf(),
        source,
    };
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(pem_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(pem_err)?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    PrivateKeyDer::from_pem_file(path).map_err(|source| TlsError::Pem {
        what: "private key",
        path: path.to_path_buf(),
        source,
    })
}

fn load_roots(path: &Path) -> Result<Arc<RootCertStore>, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert).map_err(TlsError::CaCert)?;
    }
    Ok(Arc::new(roots))
}

// ── Configs ───────────────────────────────────────────────────────────────────

/// Server-side config for the acceptor.
///
/// With `require_client_cert` set, handshakes without a certificate signed
/// by the CA chain fail.  Otherwise anonymous clients are let through, but a
/// presented certificate must still verify.
pub fn server_config(settings: &TlsSettings) -> Result<Arc<ServerConfig>, TlsError> {
    let provider = provider();
    let roots = load_roots(&settings.ca_cert)?;

    let mut verifier = WebPkiClientVerifier::builder_with_provider(roots, Arc::clone(&provider));
    if !settings.require_client_cert {
        verifier = verifier.allow_unauthenticated();
    }
    let verifier = verifier.build()?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(&settings.cert)?, load_private_key(&settings.key)?)?;

    info!(
        "TLS server config loaded (cert {}, client certs {})",
        settings.cert.display(),
        if settings.require_client_cert { "required" } else { "optional" }
    );
    Ok(Arc::new(config))
}

/// Client-side config for dialling provider platforms.
pub fn client_config(settings: &TlsSettings) -> Result<Arc<ClientConfig>, TlsError> {
    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(load_roots(&settings.ca_cert)?)
        .with_client_auth_cert(load_certs(&settings.cert)?, load_private_key(&settings.key)?)?;
    Ok(Arc::new(config))
}

// ── Dialer ────────────────────────────────────────────────────────────────────

/// Connects to provider platforms over TCP + TLS.
pub struct TlsDialer {
    connector: TlsConnector,
    connect_timeout: Duration,
}

impl TlsDialer {
    pub fn new(config: Arc<ClientConfig>, connect_timeout: Duration) -> Self {
        Self {
            connector: TlsConnector::from(config),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, address: &str) -> io::Result<BoxedStream> {
        let name = server_name(address)?;
        let tcp = timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect to {address} timed out")))??;
        tcp.set_nodelay(true)?;

        let tls = timeout(self.connect_timeout, self.connector.connect(name, tcp))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("TLS handshake with {address} timed out")))??;
        debug!("TLS session established with {address}");
        Ok(Box::new(tls))
    }
}

/// Extracts the host part of `host:port` (IPv6 hosts in brackets) as the
/// name the server certificate must match.
fn server_name(address: &str) -> io::Result<ServerName<'static>> {
    let host = match address.rsplit_once(':') {
        Some((host, _port)) => host,
        None => address,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string()).map_err(|e| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("invalid server name {host:?}: {e}"))
    })
}
