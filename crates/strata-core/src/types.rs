use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StrataError;

/// Content address of a blob: the SHA-256 of its plaintext, uncompressed,
/// unencrypted content.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sha256Digest(pub [u8; 32]);

impl Sha256Digest {
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Storage key for the blob: `<hex[..2]>/<hex[2..]>`.
    pub fn storage_key(&self) -> String {
        let h = self.to_hex();
        format!("{}/{}", &h[..2], &h[2..])
    }
}

impl fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha256Digest({})", self.to_hex())
    }
}

impl FromStr for Sha256Digest {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|e| StrataError::Other(format!("invalid blob address '{s}': {e}")))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| StrataError::Other(format!("invalid blob address length: '{s}'")))?;
        Ok(Self(arr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_matches_known_vector() {
        // SHA-256("hello")
        let digest = Sha256Digest::compute(b"hello");
        assert_eq!(
            digest.to_hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn storage_key_shards_on_first_byte() {
        let digest = Sha256Digest::compute(b"hello");
        let key = digest.storage_key();
        assert!(key.starts_with("2c/"));
        assert_eq!(key.len(), 65);
    }

    #[test]
    fn hex_roundtrip() {
        let digest = Sha256Digest::compute(b"roundtrip");
        let parsed: Sha256Digest = digest.to_hex().parse().unwrap();
        assert_eq!(parsed, digest);
    }

    #[test]
    fn from_str_rejects_bad_input() {
        assert!("not-hex".parse::<Sha256Digest>().is_err());
        assert!("abcd".parse::<Sha256Digest>().is_err());
    }
}
