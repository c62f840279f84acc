//! Bootstrap Client Module
//!
//! The sending side of a transfer. The client learns the server's
//! certificate over a plaintext connection and then trusts exactly that
//! certificate for the TLS connection that follows.
//!
//! ## Reconnecting for the TLS phase
//!
//! The server only accepts a TLS connection from the peer it delivered the
//! certificate to. With the default exact binding that means the same IP
//! address *and* port, so the client binds its second socket to the local
//! address of the first one (`SO_REUSEADDR`) and keeps retrying the connect
//! for a bounded number of attempts while the server re-binds its listener.

use std::net::SocketAddr;
use std::time::Duration;

use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};
use x509_parser::pem::parse_x509_pem;

use crate::error::{Result, TransferError};
use crate::protocol::{PacketFramer, DEFAULT_IO_TIMEOUT};
use crate::runtime::{bounded, with_deadline};
use crate::server::{create_progress_bar, BootstrapTimeouts};
use crate::session::SecureSession;
use crate::tls::{ClientTlsConfig, BOOTSTRAP_PEM_LIMIT};

/// Size of the buffer the certificate PEM is read into
pub const CERT_BUFFER_SIZE: usize = BOOTSTRAP_PEM_LIMIT;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address to connect to
    pub server_addr: SocketAddr,
    /// Server hostname for TLS verification
    pub server_name: String,
    pub timeouts: BootstrapTimeouts,
    /// Connect attempts for the TLS phase while the server re-binds
    pub connect_attempts: u32,
    pub retry_delay: Duration,
    /// Dial the TLS phase from the plaintext phase's local address
    pub reuse_local_addr: bool,
    /// Per read/write deadline once the session is established
    pub io_timeout: Option<Duration>,
    /// Draw a progress bar while sending
    pub show_progress: bool,
}

impl ClientConfig {
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            server_name: "localhost".to_string(),
            timeouts: BootstrapTimeouts::default(),
            connect_attempts: 50,
            retry_delay: Duration::from_millis(100),
            reuse_local_addr: true,
            io_timeout: Some(DEFAULT_IO_TIMEOUT),
            show_progress: false,
        }
    }
}

/// Read the server's certificate from the plaintext connection.
///
/// Reads until the server closes the connection or [`CERT_BUFFER_SIZE`]
/// bytes arrived, decodes the first PEM block, which must be a
/// `CERTIFICATE`, and returns a client configuration trusting only it.
pub async fn receive_cert<R>(reader: &mut R, server_name: &str) -> Result<ClientTlsConfig>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CERT_BUFFER_SIZE];
    let mut filled = 0;

    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await.map_err(|e| {
            TransferError::Certificate(format!("failed to read certificate: {}", e))
        })?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    debug!("Read {} bytes of certificate data", filled);
    let cert = parse_certificate(&buf[..filled])?;
    ClientTlsConfig::trusting(cert, server_name)
}

fn parse_certificate(data: &[u8]) -> Result<CertificateDer<'static>> {
    let (_, pem) = parse_x509_pem(data)
        .map_err(|e| TransferError::Certificate(format!("no PEM block received: {}", e)))?;

    if pem.label != "CERTIFICATE" {
        return Err(TransferError::Certificate(format!(
            "expected a CERTIFICATE block, got {:?}",
            pem.label
        )));
    }

    {
        let cert = pem.parse_x509().map_err(|e| {
            TransferError::Certificate(format!("invalid X.509 certificate: {}", e))
        })?;
        info!("📜 Received server certificate");
        debug!("  Subject: {}", cert.subject());
        debug!("  Expires: {}", cert.validity().not_after);
    }

    Ok(CertificateDer::from(pem.contents))
}

/// Bootstrap client
pub struct Client {
    config: ClientConfig,
}

impl Client {
    /// Create a new client instance
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Run both bootstrap phases and return the secured session
    pub async fn connect(&self) -> Result<SecureSession<TlsStream<TcpStream>>> {
        let server_addr = self.config.server_addr;
        let timeouts = self.config.timeouts;
        info!("🔗 Connecting to {}...", server_addr);

        let mut plain = with_deadline(Some(timeouts.connect), self.dial(None))
            .await
            .map_err(TransferError::transport("connect"))?;
        let local_addr = plain
            .local_addr()
            .map_err(TransferError::transport("connect"))?;
        debug!("Plaintext connection established from {}", local_addr);

        let tls_config = bounded(
            Some(timeouts.certificate),
            "certificate read",
            receive_cert(&mut plain, &self.config.server_name),
        )
        .await?;
        drop(plain);

        let rebind = self.config.reuse_local_addr.then_some(local_addr);
        let stream = self.reconnect(rebind).await?;

        let connector = TlsConnector::from(tls_config.config.clone());
        let tls_stream = with_deadline(
            Some(timeouts.handshake),
            connector.connect(tls_config.server_name.clone(), stream),
        )
        .await
        .map_err(TransferError::transport("TLS handshake"))?;

        info!("🔐 TLS connection established");

        let (_, conn_info) = tls_stream.get_ref();
        if let Some(protocol) = conn_info.protocol_version() {
            info!("  Protocol: {:?}", protocol);
        }
        if let Some(cipher) = conn_info.negotiated_cipher_suite() {
            info!("  Cipher: {:?}", cipher.suite());
        }

        let mut framer = PacketFramer::new().with_timeout(self.config.io_timeout);
        if self.config.show_progress {
            framer = framer.with_progress(create_progress_bar(0));
        }
        Ok(SecureSession::new(tls_stream, server_addr, framer))
    }

    async fn reconnect(&self, local_addr: Option<SocketAddr>) -> Result<TcpStream> {
        let attempts = self.config.connect_attempts.max(1);
        let mut attempt = 1;

        loop {
            match with_deadline(Some(self.config.timeouts.connect), self.dial(local_addr)).await {
                Ok(stream) => {
                    debug!("TLS-phase connection established on attempt {}", attempt);
                    return Ok(stream);
                }
                Err(e) if attempt < attempts => {
                    debug!("Reconnect attempt {}/{} failed: {}", attempt, attempts, e);
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => return Err(TransferError::transport("reconnect")(e)),
            }
        }
    }

    async fn dial(&self, local_addr: Option<SocketAddr>) -> std::io::Result<TcpStream> {
        let server_addr = self.config.server_addr;
        let socket = if server_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        if let Some(local_addr) = local_addr {
            socket.bind(local_addr)?;
        }
        socket.connect(server_addr).await
    }
}

/// Format file size for display
pub fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} B", size)
    }
}
