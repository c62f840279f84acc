//! Eternal Packet
//!
//! Single-file transfer over a bootstrap-secured TLS connection.
//!
//! ## Features
//! - Plaintext certificate delivery followed by a TLS upgrade on the same
//!   address, bound to the peer that received the certificate
//! - Self-signed RSA credentials, persisted and reused across runs
//! - gzip, zlib or snappy compression of the payload
//! - SHA-256 verification of the bytes actually written to disk
//! - Progress bars for transfers
//!
//! ## Usage
//!
//! ```bash
//! # Generate a credential up front (optional, `serve` creates one on demand)
//! etp cert generate --output ./work
//!
//! # Receive files into ./received
//! etp serve --bind 0.0.0.0:8443 --workdir ./work --output ./received
//!
//! # Send a file
//! etp send --server 127.0.0.1:8443 --compression gzip report.pdf
//! ```

pub mod client;
pub mod compression;
pub mod crypto;
pub mod error;
pub mod integrity;
pub mod packet;
pub mod protocol;
mod runtime;
pub mod server;
pub mod session;
pub mod tls;

pub use client::{receive_cert, Client, ClientConfig};
pub use compression::CompressionKind;
pub use error::{Result, TransferError};
pub use packet::{Packet, PacketMetadata};
pub use protocol::PacketFramer;
pub use server::{BootstrapTimeouts, Server, ServerConfig, SessionBinding};
pub use session::SecureSession;
pub use tls::{
    ClientTlsConfig, CredentialParams, CredentialProvider, FileCredentialProvider,
    ServerTlsConfig, StaticCredentialProvider, TlsCredential,
};
