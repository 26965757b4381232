use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio_rustls::rustls::{
    self, ClientConfig, RootCertStore,
    pki_types::{CertificateDer, PrivateKeyDer},
};

/// Errors that can occur while building a TLS config
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to open file {0}")]
    CertFileIo(std::io::Error),
    #[error("failed to read certificate PEM")]
    CertPem(std::io::Error),
    #[error("failed to parse private key PEM")]
    KeyPem(std::io::Error),
    #[error("no private keys found in {0}")]
    NoPrivateKey(PathBuf),
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),
    #[error("failed to add root CA certificate")]
    RootCertError(rustls::Error),
    #[error("failed to build client config")]
    ClientConfigError(rustls::Error),
    #[error("client certificate and key must be configured together")]
    IncompleteClientAuth,
}

/// TLS settings for the feed connection.
///
/// Every field is optional: with nothing configured the connector falls back to
/// the platform's native root store.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    /// PEM bundle of extra root certificates to trust instead of the native
    /// store.
    pub root_ca: Option<PathBuf>,
    /// PEM client certificate chain, for vendors that require mutual TLS.
    pub cert: Option<PathBuf>,
    /// PEM private key matching `cert`.
    pub key: Option<PathBuf>,
}

impl TlsConfig {
    pub fn is_default(&self) -> bool {
        self.root_ca.is_none() && self.cert.is_none() && self.key.is_none()
    }
}

/// Builds a rustls client config from `config`, or `None` when the native
/// root store should be used unchanged.
pub fn client_config(config: &TlsConfig) -> Result<Option<ClientConfig>, TlsError> {
    if config.is_default() {
        return Ok(None);
    }

    let Some(root_ca) = &config.root_ca else {
        return Err(TlsError::ClientConfigError(rustls::Error::General(
            "client authentication requires an explicit root_ca".into(),
        )));
    };

    let mut root_store = RootCertStore::empty();
    for cert in read_certs(root_ca)? {
        root_store.add(cert).map_err(TlsError::RootCertError)?;
    }

    let builder = ClientConfig::builder().with_root_certificates(root_store);

    let client_config = match (&config.cert, &config.key) {
        (Some(cert), Some(key)) => {
            let cert_chain = read_certs(cert)?;
            let key = read_key(key)?;
            // with_client_auth_cert automatically handles presenting the cert to the server
            builder
                .with_client_auth_cert(cert_chain, key)
                .map_err(TlsError::ClientConfigError)?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => return Err(TlsError::IncompleteClientAuth),
    };

    Ok(Some(client_config))
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(TlsError::CertFileIo)?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(TlsError::CertPem)?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }

    Ok(certs)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(TlsError::CertFileIo)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(TlsError::KeyPem)?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}
