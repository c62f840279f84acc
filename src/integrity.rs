//! Integrity Verification
//!
//! Content hashes are lower-case hex SHA-256 digests of the *original*,
//! uncompressed bytes. They are computed once when a packet is built and
//! recomputed over the persisted file on the receiving side.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{Result, TransferError};

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Calculate SHA-256 hash of data
pub fn calculate_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Streaming hash calculator for large files
pub struct StreamingHasher {
    hasher: Sha256,
    bytes_processed: u64,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            bytes_processed: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_processed += data.len() as u64;
    }

    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash everything left in `reader`, returning the digest and byte count
pub fn hash_reader<R: Read>(reader: &mut R) -> io::Result<(String, u64)> {
    let mut hasher = StreamingHasher::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..n]);
    }

    let bytes = hasher.bytes_processed();
    Ok((hasher.finalize(), bytes))
}

/// Hash an open file from the start and rewind it afterwards
pub fn hash_file_and_rewind(file: &mut File) -> io::Result<String> {
    file.seek(SeekFrom::Start(0))?;
    let (hash, _) = hash_reader(file)?;
    file.seek(SeekFrom::Start(0))?;
    Ok(hash)
}

/// Hash the file at `path`
pub fn hash_path(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let (hash, _) = hash_reader(&mut file)?;
    Ok(hash)
}

/// Compare a recorded hash against a freshly computed one
pub fn verify_hash(expected: &str, actual: &str) -> Result<()> {
    if expected.eq_ignore_ascii_case(actual) {
        Ok(())
    } else {
        Err(TransferError::Integrity(format!(
            "hash mismatch: expected {}, got {}",
            expected, actual
        )))
    }
}
