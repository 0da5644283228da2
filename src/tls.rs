//! Dynamic certificate minting for TLS interception. Each SNI name gets a
//! leaf certificate signed by the configured root CA, memoized so repeated
//! handshakes for the same host never pay the minting cost twice.

use std::sync::Arc;

use anyhow::Context as _;
use moka::sync::Cache;
use rustls::ServerConfig;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;

use crate::time_util::epoch_millis;

const CERT_ORGANIZATION: &str = "Json Pi";
const CERT_COUNTRY: &str = "AU";
const CERT_VALIDITY_DAYS: i64 = 100;

/// Hosts are few in dev use; this is effectively unbounded.
const CERT_CACHE_CAPACITY: u64 = 128;

/// Name used when a ClientHello carries no SNI extension.
const FALLBACK_SERVER_NAME: &str = "localhost";

/// The root certificate authority that signs minted leaf certificates.
pub struct RootCa {
    issuer: rcgen::Issuer<'static, rcgen::KeyPair>,
}

impl RootCa {
    /// Parses a PEM private key and certificate pair into a signing CA.
    pub fn load(key_pem: &str, cert_pem: &str) -> anyhow::Result<Self> {
        let key_pair =
            rcgen::KeyPair::from_pem(key_pem).context("failed to parse root CA private key")?;
        let issuer = rcgen::Issuer::from_ca_cert_pem(cert_pem, key_pair)
            .context("failed to parse root CA certificate")?;
        Ok(Self { issuer })
    }

    /// Mints a leaf certificate whose CommonName and SubjectAltName are
    /// `name`, valid for 100 days, signed by this CA.
    fn mint(&self, name: &str) -> anyhow::Result<CertifiedKey> {
        let mut params = rcgen::CertificateParams::new(vec![name.to_string()])
            .with_context(|| format!("invalid server name for certificate: {name}"))?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, name);
        params
            .distinguished_name
            .push(rcgen::DnType::OrganizationName, CERT_ORGANIZATION);
        params
            .distinguished_name
            .push(rcgen::DnType::CountryName, CERT_COUNTRY);
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(CERT_VALIDITY_DAYS);
        // A millisecond timestamp keeps serials unique within a run.
        params.serial_number = Some(rcgen::SerialNumber::from(
            epoch_millis().to_be_bytes().to_vec(),
        ));

        let key_pair = rcgen::KeyPair::generate()?;
        let cert = params
            .signed_by(&key_pair, &self.issuer)
            .with_context(|| format!("failed to sign leaf certificate for {name}"))?;

        let key_der = PrivatePkcs8KeyDer::from(key_pair.serialize_der());
        let signing_key = any_supported_type(&PrivateKeyDer::from(key_der))
            .context("unsupported leaf key type")?;
        Ok(CertifiedKey::new(vec![cert.der().clone()], signing_key))
    }
}

/// Resolves server certificates from the ClientHello SNI name, minting and
/// caching on first sight.
pub(crate) struct SniCertResolver {
    ca: Arc<RootCa>,
    certs: Cache<String, Arc<CertifiedKey>>,
}

impl SniCertResolver {
    pub(crate) fn new(ca: Arc<RootCa>) -> Self {
        Self {
            ca,
            certs: Cache::new(CERT_CACHE_CAPACITY),
        }
    }

    fn certified_key(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        let result = self
            .certs
            .try_get_with(name.to_string(), || self.ca.mint(name).map(Arc::new));
        match result {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::error!(name, e = %e, "failed to mint leaf certificate");
                None
            }
        }
    }
}

impl std::fmt::Debug for SniCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello
            .server_name()
            .unwrap_or(FALLBACK_SERVER_NAME)
            .to_string();
        self.certified_key(&name)
    }
}

/// Server config for the internal TLS listener. ALPN is pinned to HTTP/1.1;
/// h2 negotiation is refused.
pub(crate) fn server_config(ca: Arc<RootCa>) -> ServerConfig {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniCertResolver::new(ca)));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}
