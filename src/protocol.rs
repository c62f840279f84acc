//! Wire Framing Module
//!
//! One [`Packet`] per connection, framed as a length-prefixed JSON header
//! followed by length-prefixed payload chunks:
//!
//! ```text
//! +---------------+-----------------+---------------+------------+-----
//! | MetaLen (u32) | Metadata (JSON) | ChunkLen(i32) | Chunk data | ...
//! +---------------+-----------------+---------------+------------+-----
//!   little-endian                     little-endian
//! ```
//!
//! There is no chunk count and no end marker. The sender closes its side of
//! the stream after the last chunk and the receiver treats a clean
//! end-of-stream at a chunk boundary as the end of the body. Because a
//! stalled peer looks the same as a slow one, every read and write is
//! bounded by the framer's I/O deadline.
//!
//! The JSON header carries `file_name`, `file_type`, `file_hash`,
//! `file_mode`, `compressed_size`, `size` and `compress_type`.

use std::path::Path;
use std::time::Duration;

use indicatif::ProgressBar;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::error::{Result, TransferError};
use crate::packet::{Packet, PacketMetadata};
use crate::runtime::{run_blocking, with_deadline};

/// Payload bytes per chunk on the wire (32 KB)
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Largest metadata header accepted (1 MB)
pub const MAX_METADATA_SIZE: u32 = 1024 * 1024;

/// Largest single chunk accepted (16 MB) - prevents memory exhaustion
pub const MAX_CHUNK_SIZE: i32 = 16 * 1024 * 1024;

/// Default deadline for each read or write
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on the up-front payload allocation, whatever the header claims
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

/// Reads and writes framed packets
#[derive(Clone)]
pub struct PacketFramer {
    io_timeout: Option<Duration>,
    progress: Option<ProgressBar>,
}

impl Default for PacketFramer {
    fn default() -> Self {
        Self {
            io_timeout: Some(DEFAULT_IO_TIMEOUT),
            progress: None,
        }
    }
}

impl PacketFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deadline applied to every individual read and write; `None` disables it
    pub fn with_timeout(mut self, io_timeout: Option<Duration>) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout
    }

    /// Advance `progress` by the payload bytes of every chunk
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Write one packet: header, then the payload in [`CHUNK_SIZE`] chunks
    pub async fn write_packet<W>(&self, writer: &mut W, packet: &Packet) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let meta = serde_json::to_vec(&packet.metadata)?;
        let meta_len = u32::try_from(meta.len())
            .ok()
            .filter(|len| *len <= MAX_METADATA_SIZE)
            .ok_or_else(|| {
                TransferError::Framing(format!(
                    "metadata too large: {} bytes (max: {})",
                    meta.len(),
                    MAX_METADATA_SIZE
                ))
            })?;

        info!(
            "Sending packet: {} ({} bytes compressed)",
            packet.metadata.file_name,
            packet.payload.len()
        );

        self.write(writer, &meta_len.to_le_bytes(), "metadata length")
            .await?;
        self.write(writer, &meta, "metadata").await?;
        debug!("Sent metadata ({} bytes)", meta_len);

        if let Some(pb) = &self.progress {
            pb.set_length(packet.payload.len() as u64);
        }

        let mut chunks = 0usize;
        for chunk in packet.payload.chunks(CHUNK_SIZE) {
            // CHUNK_SIZE fits in i32
            let chunk_len = chunk.len() as i32;
            self.write(writer, &chunk_len.to_le_bytes(), "chunk length")
                .await?;
            self.write(writer, chunk, "chunk").await?;

            chunks += 1;
            if let Some(pb) = &self.progress {
                pb.inc(chunk.len() as u64);
            }
        }

        with_deadline(self.io_timeout, writer.flush())
            .await
            .map_err(TransferError::transport("flush"))?;

        debug!("Sent {} chunk(s)", chunks);
        Ok(())
    }

    /// Read one packet, accumulating chunks until the peer closes the stream
    pub async fn read_packet<R>(&self, reader: &mut R) -> Result<Packet>
    where
        R: AsyncRead + Unpin,
    {
        let meta_len = match self.read_prefix(reader, "metadata length").await? {
            Some(prefix) => u32::from_le_bytes(prefix),
            None => {
                return Err(TransferError::Framing(
                    "connection closed before metadata".to_string(),
                ))
            }
        };

        if meta_len > MAX_METADATA_SIZE {
            return Err(TransferError::Framing(format!(
                "metadata too large: {} bytes (max: {})",
                meta_len, MAX_METADATA_SIZE
            )));
        }

        let mut meta = vec![0u8; meta_len as usize];
        self.read_body(reader, &mut meta, "metadata").await?;
        let metadata: PacketMetadata = serde_json::from_slice(&meta)?;
        debug!("Received metadata: {:?}", metadata);

        if let Some(pb) = &self.progress {
            pb.set_length(metadata.compressed_size);
        }

        let declared = metadata.compressed_size;
        let mut payload = Vec::with_capacity(declared.min(MAX_PREALLOCATION) as usize);

        while let Some(prefix) = self.read_prefix(reader, "chunk length").await? {
            let chunk_len = i32::from_le_bytes(prefix);
            if chunk_len < 0 {
                return Err(TransferError::Framing(format!(
                    "negative chunk length: {}",
                    chunk_len
                )));
            }
            if chunk_len > MAX_CHUNK_SIZE {
                return Err(TransferError::Framing(format!(
                    "chunk too large: {} bytes (max: {})",
                    chunk_len, MAX_CHUNK_SIZE
                )));
            }

            let start = payload.len();
            let end = start + chunk_len as usize;
            if end as u64 > declared {
                return Err(TransferError::SizeMismatch {
                    expected: declared,
                    actual: end as u64,
                });
            }

            payload.resize(end, 0);
            self.read_body(reader, &mut payload[start..], "chunk").await?;

            if let Some(pb) = &self.progress {
                pb.inc(chunk_len as u64);
            }
        }

        if payload.len() as u64 != declared {
            return Err(TransferError::SizeMismatch {
                expected: declared,
                actual: payload.len() as u64,
            });
        }

        info!(
            "Received packet: {} ({} bytes compressed)",
            metadata.file_name,
            payload.len()
        );
        Ok(Packet::new(metadata, payload))
    }

    /// Read one packet and immediately decompress it to `dest`
    pub async fn receive_packet<R>(&self, reader: &mut R, dest: &Path) -> Result<Packet>
    where
        R: AsyncRead + Unpin,
    {
        let packet = self.read_packet(reader).await?;
        let dest = dest.to_path_buf();

        run_blocking(move || {
            packet.decompress_to_file(&dest)?;
            Ok(packet)
        })
        .await
    }

    async fn write<W>(&self, writer: &mut W, bytes: &[u8], what: &'static str) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        with_deadline(self.io_timeout, writer.write_all(bytes))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::WriteZero => {
                    TransferError::Framing(format!("short write of {}", what))
                }
                _ => TransferError::Transport {
                    context: what,
                    source: e,
                },
            })
    }

    /// Read a 4-byte prefix. `None` means the stream ended cleanly before it.
    async fn read_prefix<R>(&self, reader: &mut R, what: &'static str) -> Result<Option<[u8; 4]>>
    where
        R: AsyncRead + Unpin,
    {
        let mut prefix = [0u8; 4];
        let mut filled = 0;

        while filled < prefix.len() {
            let n = with_deadline(self.io_timeout, reader.read(&mut prefix[filled..]))
                .await
                .map_err(TransferError::transport(what))?;

            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(TransferError::Framing(format!(
                    "truncated {}: got {} of 4 bytes",
                    what, filled
                )));
            }
            filled += n;
        }

        Ok(Some(prefix))
    }

    async fn read_body<R>(&self, reader: &mut R, buf: &mut [u8], what: &'static str) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let expected = buf.len();
        with_deadline(self.io_timeout, reader.read_exact(buf))
            .await
            .map(|_| ())
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => TransferError::Framing(format!(
                    "truncated {}: expected {} bytes",
                    what, expected
                )),
                _ => TransferError::Transport {
                    context: what,
                    source: e,
                },
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionKind;
    use crate::integrity::{calculate_hash, hash_path};
    use tempfile::tempdir;

    fn raw_packet(payload: Vec<u8>) -> Packet {
        Packet::new(
            PacketMetadata {
                file_name: "testfile.bin".to_string(),
                file_type: ".bin".to_string(),
                file_hash: calculate_hash(&payload),
                file_mode: 0o644,
                compressed_size: payload.len() as u64,
                size: payload.len() as u64,
                compress_type: CompressionKind::Snappy,
            },
            payload,
        )
    }

    async fn send_and_receive(packet: Packet) -> Packet {
        let (mut sender, mut receiver) = tokio::io::duplex(64 * 1024);
        let sent = packet.clone();

        let writer = tokio::spawn(async move {
            PacketFramer::new()
                .write_packet(&mut sender, &sent)
                .await
                .unwrap();
            // dropping the sender half is the end-of-body signal
        });

        let received = PacketFramer::new().read_packet(&mut receiver).await.unwrap();
        writer.await.unwrap();
        received
    }

    fn header_bytes(packet: &Packet) -> Vec<u8> {
        let meta = serde_json::to_vec(&packet.metadata).unwrap();
        let mut bytes = (meta.len() as u32).to_le_bytes().to_vec();
        bytes.extend_from_slice(&meta);
        bytes
    }

    #[tokio::test]
    async fn test_roundtrip_across_chunk_boundaries() {
        for size in [0usize, 1, 32767, 32768, 32769, 1048576] {
            let payload: Vec<u8> = (0..size).map(|i| (i * 31 % 251) as u8).collect();
            let packet = raw_packet(payload);

            let received = send_and_receive(packet.clone()).await;
            assert_eq!(received.metadata, packet.metadata, "size {}", size);
            assert_eq!(received.payload, packet.payload, "size {}", size);
        }
    }

    #[tokio::test]
    async fn test_wire_layout() {
        let packet = raw_packet(vec![0xAB; CHUNK_SIZE + 10]);
        let mut wire: Vec<u8> = Vec::new();
        PacketFramer::new()
            .write_packet(&mut wire, &packet)
            .await
            .unwrap();

        let meta_len = u32::from_le_bytes(wire[0..4].try_into().unwrap()) as usize;
        let meta: serde_json::Value = serde_json::from_slice(&wire[4..4 + meta_len]).unwrap();
        assert_eq!(meta["file_name"], "testfile.bin");
        assert_eq!(meta["compress_type"], "snappy");

        let mut offset = 4 + meta_len;
        let first = i32::from_le_bytes(wire[offset..offset + 4].try_into().unwrap());
        assert_eq!(first, CHUNK_SIZE as i32);
        offset += 4 + CHUNK_SIZE;

        let second = i32::from_le_bytes(wire[offset..offset + 4].try_into().unwrap());
        assert_eq!(second, 10);
        offset += 4 + 10;
        assert_eq!(offset, wire.len());
    }

    #[tokio::test]
    async fn test_negative_chunk_length() {
        let packet = raw_packet(vec![1, 2, 3]);
        let mut wire = header_bytes(&packet);
        wire.extend_from_slice(&(-1i32).to_le_bytes());

        let result = PacketFramer::new().read_packet(&mut &wire[..]).await;
        assert!(matches!(result, Err(TransferError::Framing(_))));
    }

    #[tokio::test]
    async fn test_truncated_chunk() {
        let packet = raw_packet(vec![9; 10]);
        let mut wire = header_bytes(&packet);
        wire.extend_from_slice(&10i32.to_le_bytes());
        wire.extend_from_slice(&[9, 9, 9]);

        let result = PacketFramer::new().read_packet(&mut &wire[..]).await;
        assert!(matches!(result, Err(TransferError::Framing(_))));
    }

    #[tokio::test]
    async fn test_truncated_prefix() {
        let packet = raw_packet(vec![9; 10]);
        let mut wire = header_bytes(&packet);
        wire.extend_from_slice(&[10, 0]);

        let result = PacketFramer::new().read_packet(&mut &wire[..]).await;
        assert!(matches!(result, Err(TransferError::Framing(_))));
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let wire: Vec<u8> = Vec::new();
        let result = PacketFramer::new().read_packet(&mut &wire[..]).await;
        assert!(matches!(result, Err(TransferError::Framing(_))));
    }

    #[tokio::test]
    async fn test_malformed_metadata() {
        let json = b"{\"file_name\": 42}";
        let mut wire = (json.len() as u32).to_le_bytes().to_vec();
        wire.extend_from_slice(json);

        let result = PacketFramer::new().read_packet(&mut &wire[..]).await;
        assert!(matches!(result, Err(TransferError::Metadata(_))));
    }

    #[tokio::test]
    async fn test_oversized_metadata_prefix() {
        let wire = (MAX_METADATA_SIZE + 1).to_le_bytes().to_vec();
        let result = PacketFramer::new().read_packet(&mut &wire[..]).await;
        assert!(matches!(result, Err(TransferError::Framing(_))));
    }

    #[tokio::test]
    async fn test_body_shorter_than_declared() {
        let mut packet = raw_packet(vec![5; 100]);
        packet.metadata.compressed_size = 200;

        let mut wire: Vec<u8> = Vec::new();
        PacketFramer::new()
            .write_packet(&mut wire, &packet)
            .await
            .unwrap();

        let result = PacketFramer::new().read_packet(&mut &wire[..]).await;
        assert!(matches!(
            result,
            Err(TransferError::SizeMismatch {
                expected: 200,
                actual: 100
            })
        ));
    }

    #[tokio::test]
    async fn test_stalled_peer_times_out() {
        let (_sender, mut receiver) = tokio::io::duplex(1024);
        let framer = PacketFramer::new().with_timeout(Some(Duration::from_millis(50)));

        let err = framer.read_packet(&mut receiver).await.unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {}", err);
    }

    #[tokio::test]
    async fn test_receive_hello_gzip() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("hello.txt");
        std::fs::write(&source, b"hello").unwrap();

        let packet = Packet::from_file(&source, "gzip").unwrap();
        assert_eq!(packet.metadata.size, 5);

        let (mut sender, mut receiver) = tokio::io::duplex(8 * 1024);
        let writer = tokio::spawn(async move {
            PacketFramer::new()
                .write_packet(&mut sender, &packet)
                .await
                .unwrap();
        });

        let dest = dir.path().join("received.txt");
        let received = PacketFramer::new()
            .receive_packet(&mut receiver, &dest)
            .await
            .unwrap();
        writer.await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"hello");
        assert_eq!(received.metadata.compress_type, CompressionKind::Gzip);
        assert_eq!(hash_path(&dest).unwrap(), received.metadata.file_hash);
    }

    #[tokio::test]
    async fn test_progress_tracks_payload() {
        let packet = raw_packet(vec![3; 70_000]);
        let pb = ProgressBar::hidden();

        let mut wire: Vec<u8> = Vec::new();
        PacketFramer::new()
            .with_progress(pb.clone())
            .write_packet(&mut wire, &packet)
            .await
            .unwrap();

        assert_eq!(pb.position(), 70_000);
        assert_eq!(pb.length(), Some(70_000));
    }
}
