//! Mutual TLS for the broker transport
//!
//! With TLS enabled both ends present a certificate signed by the configured
//! CA: the broker verifies every worker and producer, and they verify the
//! broker. Plain TCP stays the default.

use crate::{Error, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use serde::{Deserialize, Serialize};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

pub use rustls::pki_types::ServerName;
pub use tokio_rustls::{TlsAcceptor, TlsConnector};

/// A byte stream the framing layer can run over: plain TCP or TLS
pub trait Transport: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// TLS settings for one end of the transport
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Enable TLS
    #[serde(default)]
    pub enabled: bool,

    /// CA certificate (PEM) the peer's certificate must chain to
    pub ca: Option<PathBuf>,

    /// Own certificate chain (PEM)
    pub cert: Option<PathBuf>,

    /// Private key for `cert` (PEM)
    pub key: Option<PathBuf>,

    /// Name the broker certificate must carry; defaults to the host of the
    /// broker address. Ignored by the broker.
    pub server_name: Option<String>,
}

impl TlsConfig {
    /// Mutual TLS with the given CA and own identity
    pub fn mtls(
        ca: impl Into<PathBuf>,
        cert: impl Into<PathBuf>,
        key: impl Into<PathBuf>,
    ) -> Self {
        Self {
            enabled: true,
            ca: Some(ca.into()),
            cert: Some(cert.into()),
            key: Some(key.into()),
            server_name: None,
        }
    }

    /// Check that every file mutual TLS needs is configured and present
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        for (name, path) in [("ca", &self.ca), ("cert", &self.cert), ("key", &self.key)] {
            match path {
                Some(path) if !path.exists() => {
                    return Err(Error::Tls(format!("{} file not found: {}", name, path.display())))
                }
                Some(_) => {}
                None => return Err(Error::Tls(format!("TLS is enabled but {} is not set", name))),
            }
        }
        Ok(())
    }

    fn paths(&self) -> Result<(&Path, &Path, &Path)> {
        self.validate()?;
        match (&self.ca, &self.cert, &self.key) {
            (Some(ca), Some(cert), Some(key)) => Ok((ca.as_path(), cert.as_path(), key.as_path())),
            _ => Err(Error::Tls("TLS is not enabled".to_string())),
        }
    }
}

/// Acceptor for the broker listener, `None` when TLS is off
pub fn acceptor(tls: &TlsConfig) -> Result<Option<TlsAcceptor>> {
    if !tls.enabled {
        return Ok(None);
    }
    Ok(Some(TlsAcceptor::from(server_config(tls)?)))
}

/// Connector for services and producers, `None` when TLS is off
pub fn connector(tls: &TlsConfig) -> Result<Option<TlsConnector>> {
    if !tls.enabled {
        return Ok(None);
    }
    Ok(Some(TlsConnector::from(client_config(tls)?)))
}

/// Server side: own certificate, client certificates required
pub fn server_config(tls: &TlsConfig) -> Result<Arc<ServerConfig>> {
    let (ca, cert, key) = tls.paths()?;
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(load_roots(ca)?), provider.clone())
            .build()
            .map_err(|e| Error::Tls(format!("client verifier: {}", e)))?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(cert)?, load_key(key)?)
        .map_err(tls_error)?;

    Ok(Arc::new(config))
}

/// Client side: verifies the broker and presents a client certificate
pub fn client_config(tls: &TlsConfig) -> Result<Arc<ClientConfig>> {
    let (ca, cert, key) = tls.paths()?;
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?
        .with_root_certificates(load_roots(ca)?)
        .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
        .map_err(tls_error)?;

    Ok(Arc::new(config))
}

/// Name to verify the broker certificate against
pub fn server_name(tls: &TlsConfig, broker_addr: &str) -> Result<ServerName<'static>> {
    let name = match &tls.server_name {
        Some(name) => name.clone(),
        None => host_of(broker_addr).to_string(),
    };
    ServerName::try_from(name.clone())
        .map_err(|_| Error::Tls(format!("invalid server name: {}", name)))
}

fn host_of(addr: &str) -> &str {
    let host = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);
    host.trim_start_matches('[').trim_end_matches(']')
}

fn tls_error(err: rustls::Error) -> Error {
    Error::Tls(err.to_string())
}

fn open(path: &Path) -> Result<BufReader<std::fs::File>> {
    std::fs::File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::Tls(format!("cannot open {}: {}", path.display(), e)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("bad certificate in {}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificate in {}", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| Error::Tls(format!("bad private key in {}: {}", path.display(), e)))?
        .ok_or_else(|| Error::Tls(format!("no private key in {}", path.display())))
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert).map_err(tls_error)?;
    }
    Ok(roots)
}
