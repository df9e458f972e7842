//! TLS interception of CONNECT tunnels
//!
//! The client handshake is terminated with a leaf certificate for the
//! requested domain, signed by the configured root CA. A second handshake is
//! made to the real upstream over the already dialed stream. Both plaintext
//! sides are returned to the pump.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, instrument, warn};

use crate::error::{JunctionError, Result};
use crate::models::MitmConfig;
use crate::proxy::conn::Connection;

/// Crypto provider used for every TLS config built by the proxy
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Client config trusting the bundled webpki roots
pub fn webpki_client_config() -> Result<Arc<ClientConfig>> {
    let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    client_config_with_roots(roots)
}

pub fn client_config_with_roots(roots: RootCertStore) -> Result<Arc<ClientConfig>> {
    let config = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Certificate and key presented to an intercepted client
pub struct LeafCertificate {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivatePkcs8KeyDer<'static>,
}

impl LeafCertificate {
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(self.chain.clone(), PrivateKeyDer::Pkcs8(self.key.clone_key()))?;
        Ok(Arc::new(config))
    }
}

pub trait CertificateIssuer: Send + Sync {
    fn issue_leaf(&self, domain: &str) -> Result<Arc<LeafCertificate>>;
}

/// Default number of cached leaf certificates
pub const DEFAULT_LEAF_CACHE_SIZE: usize = 1024;

/// Root CA that signs leaf certificates, cached per domain
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    ca_der: CertificateDer<'static>,
    leaves: DashMap<String, Arc<LeafCertificate>>,
    max_leaves: usize,
}

impl CertificateAuthority {
    /// Generate a fresh in-memory CA
    pub fn generate() -> Result<Self> {
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "Junction");
        dn.push(DnType::CommonName, "Junction Interception CA");
        params.distinguished_name = dn;

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;
        let ca_der = cert.der().clone();

        Ok(Self {
            issuer: Issuer::new(params, key_pair),
            ca_der,
            leaves: DashMap::new(),
            max_leaves: DEFAULT_LEAF_CACHE_SIZE,
        })
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let ca_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| JunctionError::InvalidConfig("no certificate in CA file".to_string()))??;
        let key_pair = KeyPair::from_pem(key_pem)?;
        let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)?;

        Ok(Self {
            issuer,
            ca_der,
            leaves: DashMap::new(),
            max_leaves: DEFAULT_LEAF_CACHE_SIZE,
        })
    }

    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let read = |path: &Path| {
            std::fs::read_to_string(path).map_err(|e| {
                JunctionError::InvalidConfig(format!("failed to read {}: {}", path.display(), e))
            })
        };
        Self::from_pem(&read(cert_path)?, &read(key_path)?)
    }

    /// Load the configured CA, or generate an ephemeral one when none is set
    pub fn from_config(config: &MitmConfig) -> Result<Self> {
        match (&config.ca_cert, &config.ca_key) {
            (Some(cert), Some(key)) => {
                let ca = Self::load(cert, key)?;
                info!("Loaded interception CA from {}", cert.display());
                Ok(ca)
            }
            (None, None) => {
                warn!("No interception CA configured; generated an ephemeral one for this run");
                Self::generate()
            }
            _ => Err(JunctionError::InvalidConfig(
                "mitm requires both ca_cert and ca_key".to_string(),
            )),
        }
    }

    /// The cache is flushed once it holds `max_leaves` entries
    pub fn with_leaf_cache_size(mut self, max_leaves: usize) -> Self {
        self.max_leaves = max_leaves.max(1);
        self
    }

    pub fn ca_der(&self) -> &CertificateDer<'static> {
        &self.ca_der
    }

    pub fn cached_leaves(&self) -> usize {
        self.leaves.len()
    }
}

impl CertificateIssuer for CertificateAuthority {
    fn issue_leaf(&self, domain: &str) -> Result<Arc<LeafCertificate>> {
        let domain = domain.to_lowercase();
        if let Some(leaf) = self.leaves.get(&domain) {
            return Ok(leaf.clone());
        }

        let mut params = CertificateParams::new(vec![domain.clone()])?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, domain.as_str());
        params.distinguished_name = dn;

        let key_pair = KeyPair::generate()?;
        let cert = params.signed_by(&key_pair, &self.issuer)?;
        let leaf = Arc::new(LeafCertificate {
            chain: vec![cert.der().clone(), self.ca_der.clone()],
            key: PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
        });
        debug!(domain = %domain, "Issued interception certificate");

        if self.leaves.len() >= self.max_leaves {
            debug!(cached = self.leaves.len(), "Flushing interception certificate cache");
            self.leaves.clear();
        }
        Ok(self.leaves.entry(domain).or_insert(leaf).clone())
    }
}

/// Performs both TLS handshakes of an intercepted tunnel
pub struct MitmInterceptor {
    issuer: Arc<dyn CertificateIssuer>,
    connector: TlsConnector,
    timeout: Duration,
}

impl MitmInterceptor {
    pub fn new(
        issuer: Arc<dyn CertificateIssuer>,
        upstream_config: Arc<ClientConfig>,
        timeout: Duration,
    ) -> Self {
        Self {
            issuer,
            connector: TlsConnector::from(upstream_config),
            timeout,
        }
    }

    pub fn with_webpki_roots(issuer: Arc<dyn CertificateIssuer>, timeout: Duration) -> Result<Self> {
        Ok(Self::new(issuer, webpki_client_config()?, timeout))
    }

    /// Terminate TLS on both sides and return `(client, upstream)` plaintext streams.
    ///
    /// Connection ids and metadata carry over to the returned streams.
    #[instrument(skip_all, fields(conn_id = client.id(), domain = %domain))]
    pub async fn intercept(
        &self,
        client: Connection,
        upstream: Connection,
        domain: &str,
    ) -> Result<(Connection, Connection)> {
        let leaf = self.issuer.issue_leaf(domain)?;
        let acceptor = TlsAcceptor::from(leaf.server_config()?);

        let client_id = client.id();
        let client_meta = client.meta_handle();
        let client_tls = tokio::time::timeout(self.timeout, acceptor.accept(client))
            .await
            .map_err(|_| JunctionError::Timeout("MITM client handshake"))?
            .map_err(|e| JunctionError::Mitm(format!("client handshake failed: {}", e)))?;
        debug!("Client TLS handshake complete");

        let server_name = ServerName::try_from(domain.to_string())
            .map_err(|e| JunctionError::Mitm(format!("invalid server name {}: {}", domain, e)))?;
        let upstream_id = upstream.id();
        let upstream_meta = upstream.meta_handle();
        let upstream_tls =
            tokio::time::timeout(self.timeout, self.connector.connect(server_name, upstream))
                .await
                .map_err(|_| JunctionError::Timeout("MITM upstream handshake"))?
                .map_err(|e| JunctionError::Mitm(format!("upstream handshake failed: {}", e)))?;
        debug!("Upstream TLS handshake complete");

        Ok((
            Connection::layered(client_id, client_meta, client_tls),
            Connection::layered(upstream_id, upstream_meta, upstream_tls),
        ))
    }
}
