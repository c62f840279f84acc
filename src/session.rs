//! Secured Transfer Sessions
//!
//! A [`SecureSession`] owns one established connection and performs exactly
//! one transfer over it. Both operations consume the session, so a stream
//! can never carry a second packet.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info};

use crate::compression::CompressionKind;
use crate::error::{Result, TransferError};
use crate::packet::{Packet, PacketMetadata};
use crate::protocol::PacketFramer;
use crate::runtime::{run_blocking, with_deadline};

/// An established connection ready for a single transfer
pub struct SecureSession<S> {
    stream: S,
    peer: SocketAddr,
    framer: PacketFramer,
}

impl<S> SecureSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, peer: SocketAddr, framer: PacketFramer) -> Self {
        Self {
            stream,
            peer,
            framer,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Compress `path` with `compression` and send it
    pub async fn send_file(self, path: &Path, compression: CompressionKind) -> Result<PacketMetadata> {
        let path = path.to_path_buf();
        let packet = run_blocking(move || Packet::from_file_with(&path, compression)).await?;
        self.send_packet(packet).await
    }

    /// Send a prepared packet, then close the write side
    pub async fn send_packet(mut self, packet: Packet) -> Result<PacketMetadata> {
        let mut writer = BufWriter::new(&mut self.stream);
        self.framer.write_packet(&mut writer, &packet).await?;
        drop(writer);

        let io_timeout = self.framer.io_timeout();
        with_deadline(io_timeout, self.stream.shutdown())
            .await
            .map_err(TransferError::transport("shutdown"))?;

        self.linger().await;
        info!(
            "✓ Sent {} to {} ({} bytes)",
            packet.metadata.file_name, self.peer, packet.metadata.size
        );
        Ok(packet.metadata)
    }

    /// Read the peer's packet without touching the filesystem
    pub async fn receive_packet(mut self) -> Result<Packet> {
        let mut reader = BufReader::new(&mut self.stream);
        self.framer.read_packet(&mut reader).await
    }

    /// Receive a packet and persist it under `dest_dir`, verifying its hash
    pub async fn receive_file(self, dest_dir: &Path) -> Result<(PacketMetadata, PathBuf)> {
        let peer = self.peer;
        let packet = self.receive_packet().await?;
        let dest_dir = dest_dir.to_path_buf();

        let (metadata, saved) = run_blocking(move || {
            let saved = packet.save_to(&dest_dir)?;
            Ok((packet.metadata, saved))
        })
        .await?;

        info!("✓ Received {} from {} -> {:?}", metadata.file_name, peer, saved);
        Ok((metadata, saved))
    }

    /// Wait for the peer to close its side so queued bytes are not reset away
    async fn linger(&mut self) {
        let mut scratch = [0u8; 1024];
        let io_timeout = self.framer.io_timeout();
        loop {
            match with_deadline(io_timeout, self.stream.read(&mut scratch)).await {
                Ok(0) => break,
                Ok(n) => debug!("Discarded {} trailing bytes from {}", n, self.peer),
                Err(e) => {
                    debug!("Peer {} closed: {}", self.peer, e);
                    break;
                }
            }
        }
    }
}
