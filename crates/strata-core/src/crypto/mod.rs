pub mod hybrid;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use hybrid::HybridCipher;

/// Per-blob key material recorded in the manifest entry, never in the blob.
///
/// Keeping the wrapped key out of the blob makes key revelation strictly
/// local to one manifest entry; the manifest is already integrity-critical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEnvelope {
    /// Per-blob AES-256 key, wrapped with the set's RSA public key (OAEP).
    pub wrapped_key: Vec<u8>,
    /// AES-GCM nonce used for this blob.
    pub nonce: Vec<u8>,
}

/// Per-blob encryption pipeline, applied after compression.
pub trait BlobCipher: Send + Sync {
    /// Encrypt `plaintext` under a fresh symmetric key. Returns the
    /// ciphertext and the wrapped key material for the manifest entry.
    fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Option<KeyEnvelope>)>;

    /// Decrypt data produced by `encrypt` using the recorded key material.
    fn decrypt(&self, data: &[u8], envelope: Option<&KeyEnvelope>) -> Result<Vec<u8>>;

    /// Whether this pipeline actually encrypts data.
    /// `PlaintextCipher` returns false; the hybrid pipeline returns true.
    fn is_encrypting(&self) -> bool;
}

/// No-encryption pipeline: blobs are stored as produced by compression and
/// the manifest records no key material.
pub struct PlaintextCipher;

impl BlobCipher for PlaintextCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Option<KeyEnvelope>)> {
        Ok((plaintext.to_vec(), None))
    }

    fn decrypt(&self, data: &[u8], _envelope: Option<&KeyEnvelope>) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn is_encrypting(&self) -> bool {
        false
    }
}
