//! Bootstrap Server Module
//!
//! The receiving side of a transfer. A server hands its certificate to the
//! first client in the clear, then upgrades that same client to TLS:
//!
//! ```text
//! Client                                    Server
//!   |                                          |  ListeningPlain
//!   |-------- TCP connect ----------------->   |  AcceptedPlain
//!   |<------- certificate PEM, FIN --------    |  CertSent
//!   |                                          |  ListeningTLS (same address)
//!   |-------- TCP connect (same local addr) -> |  AcceptedTLS
//!   |                                          |    session-binding check
//!   |======== TLS Handshake ===============   |  HandshakeDone
//!   |-------- framed packet, FIN ---------->   |
//! ```
//!
//! The session-binding check is what ties the two phases together: the TLS
//! connection must come from the peer that received the certificate. A
//! mismatch, or any handshake failure, ends the bootstrap; nothing is
//! retried on the server side.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TransferError};
use crate::packet::PacketMetadata;
use crate::protocol::{PacketFramer, DEFAULT_IO_TIMEOUT};
use crate::runtime::{bounded, run_blocking, with_deadline};
use crate::session::SecureSession;
use crate::tls::{CredentialProvider, ServerTlsConfig};

/// How the TLS-phase peer is matched against the plaintext-phase peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionBinding {
    /// Same IP address and port
    #[default]
    Exact,
    /// Same IP address, any port
    PeerIp,
}

impl SessionBinding {
    pub fn matches(&self, plain: SocketAddr, tls: SocketAddr) -> bool {
        match self {
            SessionBinding::Exact => plain == tls,
            SessionBinding::PeerIp => plain.ip() == tls.ip(),
        }
    }
}

/// Deadlines for the steps of the bootstrap handshake
#[derive(Debug, Clone, Copy)]
pub struct BootstrapTimeouts {
    /// Dialing the server, per attempt
    pub connect: Duration,
    /// Producing and delivering the certificate, including key generation
    pub certificate: Duration,
    /// Waiting for the TLS-phase connection once the certificate is out
    pub reconnect: Duration,
    /// TLS handshake
    pub handshake: Duration,
}

impl Default for BootstrapTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            certificate: Duration::from_secs(120),
            reconnect: Duration::from_secs(30),
            handshake: Duration::from_secs(30),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to; port 0 picks a free port for both phases
    pub bind_addr: SocketAddr,
    pub binding: SessionBinding,
    pub timeouts: BootstrapTimeouts,
    /// Per read/write deadline once the session is established
    pub io_timeout: Option<Duration>,
    /// Draw a progress bar while receiving
    pub show_progress: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8443)),
            binding: SessionBinding::default(),
            timeouts: BootstrapTimeouts::default(),
            io_timeout: Some(DEFAULT_IO_TIMEOUT),
            show_progress: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum BootstrapState {
    ListeningPlain,
    AcceptedPlain,
    CertSent,
    ListeningTls,
    AcceptedTls,
    HandshakeDone,
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootstrapState::ListeningPlain => "listening-plain",
            BootstrapState::AcceptedPlain => "accepted-plain",
            BootstrapState::CertSent => "cert-sent",
            BootstrapState::ListeningTls => "listening-tls",
            BootstrapState::AcceptedTls => "accepted-tls",
            BootstrapState::HandshakeDone => "handshake-done",
        };
        f.write_str(name)
    }
}

fn enter(state: BootstrapState) {
    debug!(state = %state, "bootstrap");
}

/// A bound server waiting for one bootstrap
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
    provider: Arc<dyn CredentialProvider>,
}

impl Server {
    /// Bind the plaintext listener
    pub async fn bind(config: ServerConfig, provider: Arc<dyn CredentialProvider>) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(TransferError::transport("bind"))?;
        let local_addr = listener
            .local_addr()
            .map_err(TransferError::transport("bind"))?;

        enter(BootstrapState::ListeningPlain);
        info!("🔒 Listening for bootstrap on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            config,
            provider,
        })
    }

    /// The address actually bound, used again for the TLS phase
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the bootstrap for the next client and return the secured session
    pub async fn accept_session(self) -> Result<SecureSession<TlsStream<TcpStream>>> {
        let Server {
            listener,
            local_addr,
            config,
            provider,
        } = self;
        let timeouts = config.timeouts;

        let (mut plain, plain_peer) = listener
            .accept()
            .await
            .map_err(TransferError::transport("accept"))?;
        drop(listener);
        enter(BootstrapState::AcceptedPlain);
        info!("📥 Bootstrap connection from {}", plain_peer);

        let credential = bounded(
            Some(timeouts.certificate),
            "credential",
            run_blocking(move || provider.credential()),
        )
        .await?;
        credential.check_bootstrap_size()?;
        let tls_config = ServerTlsConfig::from_credential(&credential)?;

        with_deadline(Some(timeouts.certificate), async {
            plain.write_all(credential.cert_pem.as_bytes()).await?;
            plain.shutdown().await
        })
        .await
        .map_err(TransferError::transport("certificate delivery"))?;
        drop(plain);
        enter(BootstrapState::CertSent);
        debug!(
            "Sent certificate to {} ({} bytes)",
            plain_peer,
            credential.cert_pem.len()
        );

        let listener = TcpListener::bind(local_addr)
            .await
            .map_err(TransferError::transport("rebind"))?;
        enter(BootstrapState::ListeningTls);

        let (stream, tls_peer) = with_deadline(Some(timeouts.reconnect), listener.accept())
            .await
            .map_err(TransferError::transport("accept"))?;
        drop(listener);
        enter(BootstrapState::AcceptedTls);

        if !config.binding.matches(plain_peer, tls_peer) {
            warn!(
                "Rejecting {}: certificate was delivered to {}",
                tls_peer, plain_peer
            );
            drop(stream);
            return Err(TransferError::Certificate(format!(
                "session binding mismatch: certificate sent to {}, TLS connection from {}",
                plain_peer, tls_peer
            )));
        }

        let acceptor = TlsAcceptor::from(tls_config.config);
        let tls_stream = with_deadline(Some(timeouts.handshake), acceptor.accept(stream))
            .await
            .map_err(TransferError::transport("TLS handshake"))?;
        enter(BootstrapState::HandshakeDone);

        info!("🔐 TLS handshake successful with {}", tls_peer);
        let (_, conn_info) = tls_stream.get_ref();
        if let Some(protocol) = conn_info.protocol_version() {
            debug!("  Protocol: {:?}", protocol);
        }
        if let Some(cipher) = conn_info.negotiated_cipher_suite() {
            debug!("  Cipher: {:?}", cipher.suite());
        }

        let mut framer = PacketFramer::new().with_timeout(config.io_timeout);
        if config.show_progress {
            framer = framer.with_progress(create_progress_bar(0));
        }
        Ok(SecureSession::new(tls_stream, tls_peer, framer))
    }

    /// Bootstrap one client and store the file it sends under `storage_dir`
    pub async fn receive_once(
        config: ServerConfig,
        provider: Arc<dyn CredentialProvider>,
        storage_dir: &Path,
    ) -> Result<(PacketMetadata, PathBuf)> {
        setup_storage_directory(storage_dir).await?;
        let server = Server::bind(config, provider).await?;
        let session = server.accept_session().await?;
        session.receive_file(storage_dir).await
    }

    /// Receive files one session at a time until an unrecoverable bind error
    pub async fn serve(
        config: ServerConfig,
        provider: Arc<dyn CredentialProvider>,
        storage_dir: &Path,
    ) -> Result<()> {
        setup_storage_directory(storage_dir).await?;
        info!("📁 Storage directory: {:?}", storage_dir);

        let mut bind_addr = config.bind_addr;
        loop {
            let session_config = ServerConfig {
                bind_addr,
                ..config.clone()
            };
            let server = Server::bind(session_config, provider.clone()).await?;
            bind_addr = server.local_addr();

            let session = match server.accept_session().await {
                Ok(session) => session,
                Err(e) => {
                    error!("Bootstrap failed: {}", e);
                    continue;
                }
            };

            let peer = session.peer_addr();
            match session.receive_file(storage_dir).await {
                Ok((metadata, path)) => {
                    debug!("Stored {} from {} at {:?}", metadata.file_name, peer, path)
                }
                Err(e) => warn!("Transfer from {} failed: {}", peer, e),
            }
        }
    }
}

/// Set up storage directory with proper permissions
async fn setup_storage_directory(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir).await?;
        info!("Created storage directory: {:?}", dir);
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut permissions = fs::metadata(dir).await?.permissions();
        permissions.set_mode(0o700); // Owner only
        fs::set_permissions(dir, permissions).await?;
    }

    Ok(())
}

/// Create progress bar for transfers
pub fn create_progress_bar(total_size: u64) -> ProgressBar {
    let pb = ProgressBar::new(total_size);
    if let Ok(style) = ProgressStyle::default_bar().template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
    ) {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{receive_cert, Client, ClientConfig};
    use crate::compression::CompressionKind;
    use crate::integrity::calculate_hash;
    use crate::tls::test_support::credential;
    use crate::tls::{StaticCredentialProvider, TlsCredential};
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;

    fn local_config(binding: SessionBinding) -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            binding,
            ..ServerConfig::default()
        }
    }

    fn provider() -> Arc<dyn CredentialProvider> {
        Arc::new(StaticCredentialProvider::new(credential()))
    }

    async fn connect_with_retry(addr: SocketAddr) -> TcpStream {
        for _ in 0..100 {
            if let Ok(stream) = TcpStream::connect(addr).await {
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("server never came back on {}", addr);
    }

    #[test]
    fn test_session_binding_policies() {
        let a: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let b: SocketAddr = "10.0.0.1:5001".parse().unwrap();
        let c: SocketAddr = "10.0.0.2:5000".parse().unwrap();

        assert!(SessionBinding::Exact.matches(a, a));
        assert!(!SessionBinding::Exact.matches(a, b));
        assert!(SessionBinding::PeerIp.matches(a, b));
        assert!(!SessionBinding::PeerIp.matches(a, c));
        assert_eq!(SessionBinding::default(), SessionBinding::Exact);
    }

    #[tokio::test]
    async fn test_bootstrap_and_transfer_hello() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let path = src.path().join("hello.txt");
        std::fs::write(&path, b"hello").unwrap();

        let server = Server::bind(local_config(SessionBinding::PeerIp), provider())
            .await
            .unwrap();
        let addr = server.local_addr();
        let storage = dst.path().to_path_buf();
        let receiver = tokio::spawn(async move {
            let session = server.accept_session().await?;
            session.receive_file(&storage).await
        });

        let client = Client::new(ClientConfig::new(addr));
        let session = client.connect().await.unwrap();
        let sent = session
            .send_file(&path, CompressionKind::Gzip)
            .await
            .unwrap();

        let (metadata, saved) = receiver.await.unwrap().unwrap();
        assert_eq!(sent, metadata);
        assert_eq!(metadata.size, 5);
        assert_eq!(metadata.compress_type, CompressionKind::Gzip);
        assert_eq!(metadata.file_hash, calculate_hash(b"hello"));
        assert_eq!(std::fs::read(saved).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_bootstrap_exact_binding() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let path = src.path().join("hello.txt");
        std::fs::write(&path, b"hello").unwrap();

        let config = local_config(ServerConfig::default().binding);
        assert_eq!(config.binding, SessionBinding::Exact);

        let server = Server::bind(config, provider()).await.unwrap();
        let addr = server.local_addr();
        let storage = dst.path().to_path_buf();
        let receiver = tokio::spawn(async move {
            let session = server.accept_session().await?;
            session.receive_file(&storage).await
        });

        let session = Client::new(ClientConfig::new(addr)).connect().await.unwrap();
        session
            .send_file(&path, CompressionKind::Gzip)
            .await
            .unwrap();

        let (metadata, saved) = receiver.await.unwrap().unwrap();
        assert_eq!(metadata.file_hash, calculate_hash(b"hello"));
        assert_eq!(std::fs::read(saved).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_oversized_certificate_is_never_sent() {
        let cred = credential();
        let oversized = TlsCredential {
            cert_pem: format!("{}{}", cred.cert_pem, "\n".repeat(4096)),
            key_pem: cred.key_pem,
        };
        let provider: Arc<dyn CredentialProvider> =
            Arc::new(StaticCredentialProvider::new(oversized));

        let server = Server::bind(local_config(SessionBinding::Exact), provider)
            .await
            .unwrap();
        let addr = server.local_addr();
        let bootstrap = tokio::spawn(async move { server.accept_session().await });

        let mut plain = TcpStream::connect(addr).await.unwrap();
        let mut received = Vec::new();
        let _ = plain.read_to_end(&mut received).await;
        assert!(received.is_empty());

        let result = bootstrap.await.unwrap();
        assert!(matches!(result, Err(TransferError::Certificate(_))));
    }

    #[tokio::test]
    async fn test_bootstrap_multi_chunk_file() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let content: Vec<u8> = (0..200_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let path = src.path().join("numbers.bin");
        std::fs::write(&path, &content).unwrap();

        let server = Server::bind(local_config(SessionBinding::PeerIp), provider())
            .await
            .unwrap();
        let addr = server.local_addr();
        let receiver = tokio::spawn(async move { server.accept_session().await });

        let client = Client::new(ClientConfig::new(addr));
        let sender = client.connect().await.unwrap();
        let receiving = receiver.await.unwrap().unwrap();

        let storage = dst.path().to_path_buf();
        let stored = tokio::spawn(async move { receiving.receive_file(&storage).await });
        sender
            .send_file(&path, CompressionKind::Snappy)
            .await
            .unwrap();

        let (_, saved) = stored.await.unwrap().unwrap();
        assert_eq!(std::fs::read(saved).unwrap(), content);
    }

    #[tokio::test]
    async fn test_rejects_tls_connection_from_other_address() {
        let server = Server::bind(local_config(SessionBinding::Exact), provider())
            .await
            .unwrap();
        let addr = server.local_addr();
        let bootstrap = tokio::spawn(async move { server.accept_session().await });

        // keep the plaintext socket open so the next connection gets a new port
        let mut plain = TcpStream::connect(addr).await.unwrap();
        assert!(receive_cert(&mut plain, "localhost").await.is_ok());

        let mut intruder = connect_with_retry(addr).await;
        assert_ne!(
            intruder.local_addr().unwrap(),
            plain.local_addr().unwrap()
        );

        let result = bootstrap.await.unwrap();
        assert!(matches!(result, Err(TransferError::Certificate(_))));

        let mut buf = [0u8; 16];
        match intruder.read(&mut buf).await {
            Ok(n) => assert_eq!(n, 0, "server spoke to a rejected peer"),
            Err(_) => {}
        }
    }

    #[tokio::test]
    async fn test_receive_once_with_file_provider() {
        let workdir = tempdir().unwrap();
        let src = tempdir().unwrap();
        let storage_root = tempdir().unwrap();
        let storage = storage_root.path().join("incoming");
        let path = src.path().join("notes.md");
        std::fs::write(&path, "# notes\n".repeat(50)).unwrap();

        let stored = crate::tls::FileCredentialProvider::in_dir(
            workdir.path(),
            crate::tls::test_support::fast_params(),
        );
        credential()
            .save(stored.cert_path(), stored.key_path())
            .unwrap();
        let provider: Arc<dyn CredentialProvider> = Arc::new(stored);

        // find a free port first so both sides agree on it
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let config = ServerConfig {
            bind_addr: addr,
            ..local_config(SessionBinding::PeerIp)
        };
        let storage_dir = storage.clone();
        let receiver =
            tokio::spawn(async move { Server::receive_once(config, provider, &storage_dir).await });

        let client = Client::new(ClientConfig::new(addr));
        let mut session = None;
        for _ in 0..100 {
            match client.connect().await {
                Ok(connected) => {
                    session = Some(connected);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        let session = session.expect("server never accepted");
        session.send_file(&path, CompressionKind::Zlib).await.unwrap();

        let (metadata, saved) = receiver.await.unwrap().unwrap();
        assert_eq!(metadata.file_name, "notes.md");
        assert_eq!(metadata.file_type, ".md");
        assert_eq!(saved, storage.join("notes.md"));
    }
}
