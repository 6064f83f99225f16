use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use super::{BlobCipher, KeyEnvelope};
use crate::error::{Result, StrataError};

const AES_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Hybrid encryption pipeline: a fresh AES-256-GCM key and nonce per blob,
/// the key wrapped with the set's RSA public key using OAEP/SHA-256.
pub struct HybridCipher {
    public: RsaPublicKey,
    private: RsaPrivateKey,
}

impl HybridCipher {
    pub fn new(private: RsaPrivateKey) -> Self {
        Self {
            public: RsaPublicKey::from(&private),
            private,
        }
    }

    /// Load the set's private key from a PEM file (PKCS#8 or PKCS#1).
    pub fn from_key_file(path: &str) -> Result<Self> {
        let pem = std::fs::read_to_string(path).map_err(|e| {
            StrataError::Config(format!("cannot read private key '{path}': {e}"))
        })?;
        let private = parse_private_key_pem(&pem)
            .map_err(|e| StrataError::Config(format!("invalid private key '{path}': {e}")))?;
        Ok(Self::new(private))
    }
}

fn parse_private_key_pem(pem: &str) -> std::result::Result<RsaPrivateKey, String> {
    if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(pem) {
        return Ok(key);
    }
    RsaPrivateKey::from_pkcs1_pem(pem).map_err(|e| e.to_string())
}

impl BlobCipher for HybridCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Option<KeyEnvelope>)> {
        let mut rng = rand::thread_rng();
        let mut key_bytes = [0u8; AES_KEY_LEN];
        rng.fill_bytes(&mut key_bytes);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce_bytes);

        let cipher =
            Aes256Gcm::new_from_slice(&key_bytes).expect("valid 32-byte key for AES-256-GCM");
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| StrataError::Other(format!("AES-GCM encrypt: {e}")))?;

        let wrapped_key = self
            .public
            .encrypt(&mut rng, Oaep::new::<Sha256>(), &key_bytes)
            .map_err(|e| StrataError::Other(format!("RSA key wrap: {e}")))?;

        Ok((
            ciphertext,
            Some(KeyEnvelope {
                wrapped_key,
                nonce: nonce_bytes.to_vec(),
            }),
        ))
    }

    fn decrypt(&self, data: &[u8], envelope: Option<&KeyEnvelope>) -> Result<Vec<u8>> {
        let envelope = envelope.ok_or(StrataError::CryptoAuth)?;
        let key_bytes = self
            .private
            .decrypt(Oaep::new::<Sha256>(), &envelope.wrapped_key)
            .map_err(|_| StrataError::CryptoAuth)?;
        if key_bytes.len() != AES_KEY_LEN || envelope.nonce.len() != NONCE_LEN {
            return Err(StrataError::CryptoAuth);
        }

        let cipher =
            Aes256Gcm::new_from_slice(&key_bytes).expect("valid 32-byte key for AES-256-GCM");
        cipher
            .decrypt(Nonce::from_slice(&envelope.nonce), data)
            .map_err(|_| StrataError::CryptoAuth)
    }

    fn is_encrypting(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PlaintextCipher;
    use crate::testutil::test_rsa_key;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let cipher = HybridCipher::new(test_rsa_key().clone());
        let (ciphertext, envelope) = cipher.encrypt(b"secret payload").unwrap();
        assert_ne!(ciphertext, b"secret payload");
        let plaintext = cipher.decrypt(&ciphertext, envelope.as_ref()).unwrap();
        assert_eq!(plaintext, b"secret payload");
    }

    #[test]
    fn each_blob_gets_fresh_key_material() {
        let cipher = HybridCipher::new(test_rsa_key().clone());
        let (c1, e1) = cipher.encrypt(b"same input").unwrap();
        let (c2, e2) = cipher.encrypt(b"same input").unwrap();
        assert_ne!(c1, c2);
        assert_ne!(e1.unwrap().wrapped_key, e2.unwrap().wrapped_key);
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let cipher = HybridCipher::new(test_rsa_key().clone());
        let (mut ciphertext, envelope) = cipher.encrypt(b"payload").unwrap();
        ciphertext[0] ^= 0x01;
        let err = cipher.decrypt(&ciphertext, envelope.as_ref()).unwrap_err();
        assert!(matches!(err, StrataError::CryptoAuth));
    }

    #[test]
    fn wrong_private_key_fails_auth() {
        let cipher = HybridCipher::new(test_rsa_key().clone());
        let (ciphertext, envelope) = cipher.encrypt(b"payload").unwrap();

        let other =
            RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("generate throwaway key");
        let other_cipher = HybridCipher::new(other);
        let err = other_cipher
            .decrypt(&ciphertext, envelope.as_ref())
            .unwrap_err();
        assert!(matches!(err, StrataError::CryptoAuth));
    }

    #[test]
    fn missing_envelope_fails_auth() {
        let cipher = HybridCipher::new(test_rsa_key().clone());
        let (ciphertext, _) = cipher.encrypt(b"payload").unwrap();
        assert!(matches!(
            cipher.decrypt(&ciphertext, None).unwrap_err(),
            StrataError::CryptoAuth
        ));
    }

    #[test]
    fn plaintext_cipher_is_identity() {
        let cipher = PlaintextCipher;
        let (data, envelope) = cipher.encrypt(b"clear").unwrap();
        assert_eq!(data, b"clear");
        assert!(envelope.is_none());
        assert_eq!(cipher.decrypt(&data, None).unwrap(), b"clear");
        assert!(!cipher.is_encrypting());
    }
}
