//! TLS domains selected by URL scheme
//!
//! The container never performs a handshake itself. It only decides which
//! rustls configuration travels with a connect or listen request.

use std::fmt;
use std::io::{BufReader, Cursor};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::error::ContainerError;

/// Opaque TLS configuration handed to the reactor
#[derive(Clone)]
pub enum TlsDomain {
    Client(Arc<ClientConfig>),
    Server(Arc<ServerConfig>),
}

impl TlsDomain {
    pub fn is_client(&self) -> bool {
        matches!(self, TlsDomain::Client(_))
    }

    pub fn is_server(&self) -> bool {
        matches!(self, TlsDomain::Server(_))
    }

    /// Pointer identity, used to tell domains apart in logs and tests
    pub fn same_as(&self, other: &TlsDomain) -> bool {
        match (self, other) {
            (TlsDomain::Client(a), TlsDomain::Client(b)) => Arc::ptr_eq(a, b),
            (TlsDomain::Server(a), TlsDomain::Server(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for TlsDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsDomain::Client(_) => f.write_str("TlsDomain::Client"),
            TlsDomain::Server(_) => f.write_str("TlsDomain::Server"),
        }
    }
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn webpki_roots() -> RootCertStore {
    RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect(),
    }
}

fn read_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, ContainerError> {
    let mut reader = BufReader::new(Cursor::new(pem));
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ContainerError::tls_error(format!("invalid certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(ContainerError::tls_error("no certificate found in PEM input"));
    }
    Ok(certs)
}

fn read_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, ContainerError> {
    let mut reader = BufReader::new(Cursor::new(pem));
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ContainerError::tls_error(format!("invalid key PEM: {}", e)))?
        .ok_or_else(|| ContainerError::tls_error("no private key found in PEM input"))
}

fn read_file(path: &Path) -> Result<Vec<u8>, ContainerError> {
    std::fs::read(path)
        .map_err(|e| ContainerError::tls_error(format!("cannot read {}: {}", path.display(), e)))
}

/// Default client and server TLS domains of a container
///
/// The client side trusts the webpki roots out of the box. The server side
/// stays empty until credentials are supplied.
#[derive(Debug, Clone)]
pub struct SslConfig {
    roots: RootCertStore,
    client: Option<TlsDomain>,
    server: Option<TlsDomain>,
}

impl SslConfig {
    pub fn new() -> Result<Self, ContainerError> {
        let roots = webpki_roots();
        let client = Self::build_client(roots.clone(), None)?;
        Ok(Self {
            roots,
            client: Some(client),
            server: None,
        })
    }

    /// No TLS at all; `amqps` URLs will fail
    pub fn disabled() -> Self {
        Self {
            roots: RootCertStore::empty(),
            client: None,
            server: None,
        }
    }

    pub fn client(&self) -> Option<&TlsDomain> {
        self.client.as_ref()
    }

    pub fn server(&self) -> Option<&TlsDomain> {
        self.server.as_ref()
    }

    fn build_client(
        roots: RootCertStore,
        identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
    ) -> Result<TlsDomain, ContainerError> {
        let builder = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots);
        let config = match identity {
            Some((certs, key)) => builder.with_client_auth_cert(certs, key)?,
            None => builder.with_no_client_auth(),
        };
        Ok(TlsDomain::Client(Arc::new(config)))
    }

    fn build_server(certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Result<TlsDomain, ContainerError> {
        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(TlsDomain::Server(Arc::new(config)))
    }

    /// Install the same certificate chain and key on both sides
    pub fn set_credentials_pem(&mut self, cert_pem: &[u8], key_pem: &[u8]) -> Result<(), ContainerError> {
        let certs = read_certs(cert_pem)?;
        let key = read_key(key_pem)?;
        self.server = Some(Self::build_server(certs.clone(), key.clone_key())?);
        self.client = Some(Self::build_client(self.roots.clone(), Some((certs, key)))?);
        Ok(())
    }

    /// Same as `set_credentials_pem`, reading PEM files
    pub fn set_credentials(&mut self, cert_file: impl AsRef<Path>, key_file: impl AsRef<Path>) -> Result<(), ContainerError> {
        let cert = read_file(cert_file.as_ref())?;
        let key = read_file(key_file.as_ref())?;
        self.set_credentials_pem(&cert, &key)
    }

    /// Trust the CA certificates in `pem` instead of the webpki roots
    pub fn set_trusted_ca_pem(&mut self, pem: &[u8]) -> Result<(), ContainerError> {
        let mut roots = RootCertStore::empty();
        for cert in read_certs(pem)? {
            roots.add(cert)?;
        }
        self.roots = roots;
        self.client = Some(Self::build_client(self.roots.clone(), None)?);
        Ok(())
    }

    pub fn set_trusted_ca_db(&mut self, path: impl AsRef<Path>) -> Result<(), ContainerError> {
        let pem = read_file(path.as_ref())?;
        self.set_trusted_ca_pem(&pem)
    }
}
