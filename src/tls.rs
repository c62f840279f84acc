//! TLS Credential Management Module
//!
//! This module handles the server identity used by the bootstrap handshake:
//! - Self-signed RSA certificate generation (organization-tagged, 1 year)
//! - Persisting the certificate/key pair so repeated runs reuse it
//! - Building rustls configurations for both ends of the session
//!
//! ## Identity lifecycle
//!
//! The credential is an explicit [`TlsCredential`] value handed to the
//! bootstrap by a [`CredentialProvider`]. The file-backed provider loads
//! `server.crt`/`server.key` from a working directory and only generates a
//! fresh pair when those files are missing or unreadable.
//!
//! ## Trust model
//!
//! The client never consults a CA bundle. It trusts exactly the certificate
//! it received during the plaintext phase, so the TLS handshake that
//! follows proves the peer holds the matching private key.

use std::fs;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::crypto::{self, RSA_KEY_BITS};
use crate::error::{Result, TransferError};

/// Organization written into generated certificates
pub const DEFAULT_ORGANIZATION: &str = "EternalStorage";

/// Validity of generated certificates
pub const DEFAULT_VALIDITY_DAYS: i64 = 365;

/// Largest certificate PEM a client reads during the bootstrap
pub const BOOTSTRAP_PEM_LIMIT: usize = 2048;

/// File names used inside the credential working directory
pub const CERT_FILE_NAME: &str = "server.crt";
pub const KEY_FILE_NAME: &str = "server.key";

/// Parameters for generating a new credential
#[derive(Debug, Clone)]
pub struct CredentialParams {
    pub organization: String,
    pub validity_days: i64,
    pub key_bits: usize,
    /// DNS names and IP addresses the certificate is valid for
    pub subject_alt_names: Vec<String>,
}

impl Default for CredentialParams {
    fn default() -> Self {
        Self {
            organization: DEFAULT_ORGANIZATION.to_string(),
            validity_days: DEFAULT_VALIDITY_DAYS,
            key_bits: RSA_KEY_BITS,
            subject_alt_names: vec!["localhost".to_string(), "127.0.0.1".to_string()],
        }
    }
}

/// Self-signed certificate and private key, both PEM encoded
#[derive(Clone)]
pub struct TlsCredential {
    pub cert_pem: String,
    pub key_pem: String,
}

impl std::fmt::Debug for TlsCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsCredential")
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

impl TlsCredential {
    /// Generate a self-signed certificate
    ///
    /// # Security Notes
    /// - The certificate is its own trust anchor; clients pin it rather than
    ///   chaining to a CA
    /// - The subject carries only the organization; hostname checks rely on
    ///   the subject alternative names
    pub fn generate(params: &CredentialParams) -> Result<Self> {
        info!(
            "Generating self-signed certificate for {} ({}-bit RSA)",
            params.organization, params.key_bits
        );

        let private_key = crypto::generate_private_key(params.key_bits)?;
        let key_pem = crypto::private_key_to_pem(&private_key)?;
        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| TransferError::Crypto(format!("failed to load generated key: {}", e)))?;

        let mut cert_params = CertificateParams::default();

        let mut subject = DistinguishedName::new();
        subject.push(DnType::OrganizationName, params.organization.as_str());
        cert_params.distinguished_name = subject;

        let now = OffsetDateTime::now_utc();
        cert_params.not_before = now;
        cert_params.not_after = now + time::Duration::days(params.validity_days);

        cert_params.is_ca = IsCa::ExplicitNoCa;
        cert_params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        cert_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        cert_params.subject_alt_names = params
            .subject_alt_names
            .iter()
            .map(|name| subject_alt_name(name))
            .collect::<Result<Vec<_>>>()?;

        let cert = cert_params.self_signed(&key_pair).map_err(|e| {
            TransferError::Certificate(format!("failed to sign certificate: {}", e))
        })?;

        let credential = Self {
            cert_pem: cert.pem(),
            key_pem,
        };
        credential.check_bootstrap_size()?;

        info!("✓ Generated self-signed certificate");
        info!("  Subject: O={}", params.organization);
        info!("  SANs: {:?}", params.subject_alt_names);

        Ok(credential)
    }

    /// Wrap PEM strings after checking that both parse
    pub fn from_pem(cert_pem: String, key_pem: String) -> Result<Self> {
        load_certs_from_pem(&cert_pem)?;
        load_private_key_from_pem(&key_pem)?;
        let credential = Self { cert_pem, key_pem };
        credential.check_bootstrap_size()?;
        Ok(credential)
    }

    /// The certificate PEM must fit the client's fixed bootstrap buffer
    pub fn check_bootstrap_size(&self) -> Result<()> {
        if self.cert_pem.len() > BOOTSTRAP_PEM_LIMIT {
            return Err(TransferError::Certificate(format!(
                "certificate PEM exceeds {}-byte bootstrap buffer ({} bytes)",
                BOOTSTRAP_PEM_LIMIT,
                self.cert_pem.len()
            )));
        }
        Ok(())
    }

    /// Load a persisted credential
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = fs::read_to_string(cert_path)?;
        let key_pem = fs::read_to_string(key_path)?;
        Self::from_pem(cert_pem, key_pem)
    }

    /// Save certificate and key to files, restricting the key to its owner
    pub fn save(&self, cert_path: &Path, key_path: &Path) -> Result<()> {
        fs::write(cert_path, &self.cert_pem)?;
        info!("Saved certificate to {:?}", cert_path);

        fs::write(key_path, &self.key_pem)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut permissions = fs::metadata(key_path)?.permissions();
            permissions.set_mode(0o600);
            fs::set_permissions(key_path, permissions)?;
        }

        info!("Saved private key to {:?} (permissions: 600)", key_path);
        Ok(())
    }

    /// DER encoding of the leaf certificate
    pub fn certificate_der(&self) -> Result<CertificateDer<'static>> {
        let mut certs = load_certs_from_pem(&self.cert_pem)?;
        Ok(certs.remove(0))
    }
}

/// Supplies the server identity to the bootstrap
pub trait CredentialProvider: Send + Sync {
    fn credential(&self) -> Result<TlsCredential>;
}

/// Load-or-generate provider backed by two PEM files
pub struct FileCredentialProvider {
    cert_path: PathBuf,
    key_path: PathBuf,
    params: CredentialParams,
}

impl FileCredentialProvider {
    pub fn new(cert_path: PathBuf, key_path: PathBuf, params: CredentialParams) -> Self {
        Self {
            cert_path,
            key_path,
            params,
        }
    }

    /// Use `server.crt` and `server.key` inside `dir`
    pub fn in_dir(dir: &Path, params: CredentialParams) -> Self {
        Self::new(dir.join(CERT_FILE_NAME), dir.join(KEY_FILE_NAME), params)
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }
}

impl CredentialProvider for FileCredentialProvider {
    fn credential(&self) -> Result<TlsCredential> {
        match TlsCredential::load(&self.cert_path, &self.key_path) {
            Ok(credential) => {
                info!("Loaded TLS credential from {:?}", self.cert_path);
                Ok(credential)
            }
            Err(e) => {
                warn!("Stored TLS credential unusable ({}), generating a new one", e);
                let credential = TlsCredential::generate(&self.params)?;
                credential.save(&self.cert_path, &self.key_path)?;
                Ok(credential)
            }
        }
    }
}

/// Provider that always hands out the same in-memory credential
pub struct StaticCredentialProvider(TlsCredential);

impl StaticCredentialProvider {
    pub fn new(credential: TlsCredential) -> Self {
        Self(credential)
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn credential(&self) -> Result<TlsCredential> {
        Ok(self.0.clone())
    }
}

/// TLS configuration for the server
pub struct ServerTlsConfig {
    pub config: Arc<ServerConfig>,
}

impl ServerTlsConfig {
    /// Build a server config presenting `credential`
    pub fn from_credential(credential: &TlsCredential) -> Result<Self> {
        let certs = load_certs_from_pem(&credential.cert_pem)?;
        let key = load_private_key_from_pem(&credential.key_pem)?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| {
                TransferError::Certificate(format!("failed to build server TLS config: {}", e))
            })?;

        // one transfer per connection, nothing to resume
        config.send_tls13_tickets = 0;

        Ok(Self {
            config: Arc::new(config),
        })
    }
}

/// TLS configuration for the client
pub struct ClientTlsConfig {
    pub config: Arc<ClientConfig>,
    pub server_name: ServerName<'static>,
}

impl ClientTlsConfig {
    /// Trust exactly `cert` and nothing else
    pub fn trusting(cert: CertificateDer<'static>, server_name: &str) -> Result<Self> {
        let mut root_store = RootCertStore::empty();
        root_store.add(cert).map_err(|e| {
            TransferError::Certificate(format!("failed to add certificate to trust store: {}", e))
        })?;

        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let server_name = ServerName::try_from(server_name.to_owned()).map_err(|e| {
            TransferError::Certificate(format!("invalid server name {:?}: {}", server_name, e))
        })?;

        Ok(Self {
            config: Arc::new(config),
            server_name,
        })
    }
}

fn subject_alt_name(name: &str) -> Result<SanType> {
    if let Ok(ip) = name.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }

    name.try_into()
        .map(SanType::DnsName)
        .map_err(|e| TransferError::Certificate(format!("invalid DNS name {:?}: {}", name, e)))
}

/// Load certificates from PEM string
fn load_certs_from_pem(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem.as_bytes());

    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TransferError::Certificate(format!("failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(TransferError::Certificate(
            "no certificates found in PEM data".to_string(),
        ));
    }

    Ok(certs)
}

/// Load a private key from PEM string
fn load_private_key_from_pem(pem: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem.as_bytes());

    private_key(&mut reader)
        .map_err(|e| TransferError::Certificate(format!("failed to read private key: {}", e)))?
        .ok_or_else(|| TransferError::Certificate("no private key found in PEM data".to_string()))
}
