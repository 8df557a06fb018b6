//! TLS settings for `Https` endpoints.

use crate::negotiate::VersionPolicy;
use crate::Error;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fmt;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// ALPN id of HTTP/2.
pub const ALPN_H2: &[u8] = b"h2";

/// ALPN id of HTTP/1.1.
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Server side TLS configuration.
#[derive(Clone)]
pub struct TlsConfig {
    inner: Arc<rustls::ServerConfig>,
}

impl TlsConfig {
    /// Use a prepared rustls config as is.
    pub fn new(config: rustls::ServerConfig) -> Self {
        TlsConfig {
            inner: Arc::new(config),
        }
    }

    /// Build from a DER certificate chain and PKCS#8 key, offering ALPN ids
    /// according to the version policy.
    pub fn from_der(certs: Vec<Vec<u8>>, key: Vec<u8>, policy: VersionPolicy) -> Result<Self, Error> {
        let certs: Vec<CertificateDer<'static>> = certs.into_iter().map(CertificateDer::from).collect();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key));

        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        config.alpn_protocols = alpn_protocols(policy);

        Ok(TlsConfig::new(config))
    }

    pub fn server_config(&self) -> &Arc<rustls::ServerConfig> {
        &self.inner
    }

    pub(crate) fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.inner.clone())
    }
}

/// ALPN ids offered for a policy, in order of preference.
pub fn alpn_protocols(policy: VersionPolicy) -> Vec<Vec<u8>> {
    match policy {
        VersionPolicy::ForceHttp1 => vec![ALPN_HTTP11.to_vec()],
        VersionPolicy::ForceHttp2 => vec![ALPN_H2.to_vec()],
        VersionPolicy::Negotiate => vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()],
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TlsConfig alpn: {:?}", self.inner.alpn_protocols)
    }
}
