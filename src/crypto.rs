//! RSA Helpers
//!
//! Stateless RSA operations: key generation and OAEP (SHA-256, no label)
//! encryption/decryption. Failures surface as [`TransferError::Crypto`];
//! callers do not retry.
//!
//! The same key generator backs TLS credential creation in [`crate::tls`].

use rand::rngs::OsRng;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::error::{Result, TransferError};

/// Default RSA modulus size
pub const RSA_KEY_BITS: usize = 4096;

/// Ephemeral RSA keypair
pub struct SessionKeypair {
    pub private: RsaPrivateKey,
    pub public: RsaPublicKey,
}

impl SessionKeypair {
    /// Largest plaintext a single OAEP/SHA-256 block can carry for this key
    pub fn max_plaintext_len(&self) -> usize {
        use rsa::traits::PublicKeyParts;
        // k - 2*hLen - 2
        self.public.size().saturating_sub(2 * 32 + 2)
    }
}

/// Generate an RSA-4096 keypair
pub fn generate_keypair() -> Result<SessionKeypair> {
    generate_keypair_with_bits(RSA_KEY_BITS)
}

/// Generate an RSA keypair with a custom modulus size
pub fn generate_keypair_with_bits(bits: usize) -> Result<SessionKeypair> {
    let private = generate_private_key(bits)?;
    let public = RsaPublicKey::from(&private);
    Ok(SessionKeypair { private, public })
}

pub(crate) fn generate_private_key(bits: usize) -> Result<RsaPrivateKey> {
    let mut rng = OsRng;
    RsaPrivateKey::new(&mut rng, bits)
        .map_err(|e| TransferError::Crypto(format!("key generation failed: {}", e)))
}

/// PKCS#8 PEM encoding of a private key
pub(crate) fn private_key_to_pem(key: &RsaPrivateKey) -> Result<String> {
    key.to_pkcs8_pem(LineEnding::LF)
        .map(|pem| pem.to_string())
        .map_err(|e| TransferError::Crypto(format!("key encoding failed: {}", e)))
}

/// Encrypt data with RSA public key using OAEP padding
pub fn encrypt(public: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>> {
    let mut rng = OsRng;
    let padding = Oaep::new::<Sha256>();

    public
        .encrypt(&mut rng, padding, data)
        .map_err(|e| TransferError::Crypto(format!("encryption failed: {}", e)))
}

/// Decrypt data with RSA private key
pub fn decrypt(private: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>> {
    let padding = Oaep::new::<Sha256>();

    private
        .decrypt(padding, data)
        .map_err(|e| TransferError::Crypto(format!("decryption failed: {}", e)))
}
