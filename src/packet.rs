//! Packet Data Model
//!
//! A [`Packet`] pairs [`PacketMetadata`] with a compressed payload. It is
//! built from a source file on the sending side, rebuilt from wire bytes on
//! the receiving side, and consumed by decompressing it to a destination.
//!
//! Invariants:
//! - `metadata.size` is the byte count produced by decompressing `payload`
//! - `metadata.file_hash` is computed over the original bytes, never the
//!   compressed ones

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::compression::CompressionKind;
use crate::error::{Result, TransferError};
use crate::integrity::{hash_file_and_rewind, hash_path, verify_hash};

const DECODE_BUFFER_SIZE: usize = 64 * 1024;

/// Transfer metadata, serialized as the JSON header on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketMetadata {
    pub file_name: String,
    /// Extension including the leading dot, empty when there is none
    pub file_type: String,
    /// Hex SHA-256 of the original content
    pub file_hash: String,
    /// Permission bits of the source file
    pub file_mode: u32,
    pub compressed_size: u64,
    pub size: u64,
    pub compress_type: CompressionKind,
}

/// Metadata plus compressed file content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub metadata: PacketMetadata,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(metadata: PacketMetadata, payload: Vec<u8>) -> Self {
        Self { metadata, payload }
    }

    /// Build a packet from a file, resolving the scheme from its tag.
    ///
    /// An empty or unknown tag compresses with snappy.
    pub fn from_file(path: impl AsRef<Path>, compress_type: &str) -> Result<Self> {
        Self::from_file_with(path, CompressionKind::from_tag(compress_type))
    }

    /// Build a packet from a file with an explicit scheme
    pub fn from_file_with(path: impl AsRef<Path>, kind: CompressionKind) -> Result<Self> {
        let path = path.as_ref();

        let mut file = File::open(path)?;
        let info = file.metadata()?;
        if info.is_dir() {
            return Err(TransferError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot package a directory: {:?}", path),
            )));
        }

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| {
                TransferError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("path has no file name: {:?}", path),
                ))
            })?;

        let file_hash = hash_file_and_rewind(&mut file)?;

        let mut encoder = kind.encoder(Vec::new());
        let bytes_read = io::copy(&mut file, &mut encoder)?;
        if bytes_read != info.len() {
            return Err(TransferError::SizeMismatch {
                expected: info.len(),
                actual: bytes_read,
            });
        }
        let payload = encoder.finish()?;

        let packet = Packet {
            metadata: PacketMetadata {
                file_type: file_extension(&file_name),
                file_name,
                file_hash,
                file_mode: permission_bits(&info),
                compressed_size: payload.len() as u64,
                size: info.len(),
                compress_type: kind,
            },
            payload,
        };
        packet.log_summary();

        Ok(packet)
    }

    /// Decompress the payload into `dest`, applying the recorded permissions
    ///
    /// On failure the partially written file is removed.
    pub fn decompress_to_file(&self, dest: &Path) -> Result<u64> {
        let result = self
            .write_decoded(dest)
            .and_then(|written| self.apply_mode(dest).map(|_| written));

        match result {
            Ok(written) => {
                info!("Decompressed to {:?} ({} bytes)", dest, written);
                Ok(written)
            }
            Err(e) => {
                warn!("Discarding {:?}: {}", dest, e);
                let _ = fs::remove_file(dest);
                Err(e)
            }
        }
    }

    /// Persist the content under its recorded file name inside `dir` and
    /// verify the persisted bytes against the recorded hash.
    ///
    /// On any failure the partially written file is removed.
    pub fn save_to(&self, dir: &Path) -> Result<PathBuf> {
        let safe_name = validate_file_name(&self.metadata.file_name)?;
        let dest = dir.join(safe_name);

        let result = self
            .write_decoded(&dest)
            .and_then(|_| hash_path(&dest).map_err(TransferError::from))
            .and_then(|actual| verify_hash(&self.metadata.file_hash, &actual))
            .and_then(|_| self.apply_mode(&dest));

        if let Err(e) = result {
            warn!("Discarding {:?}: {}", dest, e);
            let _ = fs::remove_file(&dest);
            return Err(e);
        }

        info!(
            "✅ Saved {:?} ({} bytes, hash: {})",
            dest, self.metadata.size, self.metadata.file_hash
        );
        Ok(dest)
    }

    /// Stream the decoded payload into `sink`, returning the byte count.
    ///
    /// A payload the decoder rejects, or one that expands beyond the
    /// declared size, is an integrity failure. Coming up short is a size
    /// mismatch.
    pub fn decode_into<W: Write>(&self, sink: &mut W) -> Result<u64> {
        let kind = self.metadata.compress_type;
        let mut decoder = kind.decoder(&self.payload[..]);
        let mut buffer = vec![0u8; DECODE_BUFFER_SIZE];
        let mut total: u64 = 0;

        loop {
            let n = match decoder.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(TransferError::Integrity(format!(
                        "payload is not a valid {} stream: {}",
                        kind, e
                    )))
                }
            };

            total += n as u64;
            if total > self.metadata.size {
                return Err(TransferError::Integrity(format!(
                    "payload expands beyond the declared {} bytes",
                    self.metadata.size
                )));
            }
            sink.write_all(&buffer[..n])?;
        }

        if total != self.metadata.size {
            return Err(TransferError::SizeMismatch {
                expected: self.metadata.size,
                actual: total,
            });
        }
        Ok(total)
    }

    fn write_decoded(&self, dest: &Path) -> Result<u64> {
        let file = create_private(dest)?;
        let mut writer = BufWriter::new(file);
        let written = self.decode_into(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(written)
    }

    #[cfg(unix)]
    fn apply_mode(&self, dest: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let mode = self.metadata.file_mode & 0o7777;
        if mode != 0 {
            fs::set_permissions(dest, fs::Permissions::from_mode(mode))?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn apply_mode(&self, _dest: &Path) -> Result<()> {
        Ok(())
    }

    fn log_summary(&self) {
        let meta = &self.metadata;
        debug!(
            file_name = %meta.file_name,
            file_type = %meta.file_type,
            compress_type = %meta.compress_type,
            size = meta.size,
            compressed_size = meta.compressed_size,
            file_hash = %meta.file_hash,
            file_mode = %format!("{:o}", meta.file_mode),
            "Packet built"
        );
    }
}

/// Validate a received file name before joining it onto a directory
///
/// # Security
/// The name comes from the remote peer; anything that could escape the
/// destination directory is refused.
pub fn validate_file_name(file_name: &str) -> Result<&str> {
    if file_name.is_empty() {
        return Err(TransferError::Integrity("empty file name".to_string()));
    }

    if file_name == "." || file_name.contains("..") {
        return Err(TransferError::Integrity(format!(
            "path traversal in file name: {:?}",
            file_name
        )));
    }

    if file_name.contains('/') || file_name.contains('\\') || file_name.contains('\0') {
        return Err(TransferError::Integrity(format!(
            "file name must be a single path component: {:?}",
            file_name
        )));
    }

    Ok(file_name)
}

/// Everything from the last dot, matching what the sender records
fn file_extension(file_name: &str) -> String {
    file_name
        .rfind('.')
        .map(|idx| file_name[idx..].to_string())
        .unwrap_or_default()
}

#[cfg(unix)]
fn permission_bits(info: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    info.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(info: &fs::Metadata) -> u32 {
    if info.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Create (or truncate) a file only the owner can access until the final
/// mode is applied
fn create_private(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    options.open(path)
}
