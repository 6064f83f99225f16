use std::collections::HashMap;

use tracing::debug;

use crate::compress::{self, Compression};
use crate::config::BackupSetConfig;
use crate::crypto::{BlobCipher, HybridCipher, KeyEnvelope, PlaintextCipher};
use crate::diff;
use crate::error::{Result, StrataError};
use crate::manifest::{Manifest, ManifestEntry};
use crate::platform;
use crate::store::{self, BlobStore};
use crate::types::Sha256Digest;

/// Result of publishing one blob.
#[derive(Debug)]
pub struct SavedBlob {
    pub sha: Sha256Digest,
    pub key_envelope: Option<KeyEnvelope>,
    /// True when an already-stored blob was reused instead of written.
    pub reused: bool,
}

/// Facade over a [`BlobStore`] that owns the per-set encode/decode
/// pipeline (compress → encrypt → publish) and manifest persistence.
///
/// `compression: None` stores payload bytes untouched; `Some` routes them
/// through the tagged codec, so a set that switches algorithms can still
/// decode blobs written under the previous one.
pub struct BackupStore {
    store: Box<dyn BlobStore>,
    cipher: Box<dyn BlobCipher>,
    compression: Option<Compression>,
    max_manifest_versions: u32,
}

impl BackupStore {
    /// Open the store a backup set is bound to.
    pub fn open(set: &BackupSetConfig) -> Result<Self> {
        let store = store::store_from_config(&set.protocol)?;
        let cipher: Box<dyn BlobCipher> = if set.options.use_encryption {
            let key_file = set.private_key_filename.as_deref().ok_or_else(|| {
                StrataError::Config("encryption enabled but no private_key_filename".into())
            })?;
            Box::new(HybridCipher::from_key_file(key_file)?)
        } else {
            Box::new(PlaintextCipher)
        };
        let compression = if set.options.use_compression {
            Some(Compression::from_config(
                &set.options.compression_algorithm,
                set.options.zstd_level,
            )?)
        } else {
            None
        };
        Ok(Self::with_parts(
            store,
            cipher,
            compression,
            set.options.max_manifest_versions,
        ))
    }

    /// Assemble a store from explicit parts (custom backends, tests).
    pub fn with_parts(
        store: Box<dyn BlobStore>,
        cipher: Box<dyn BlobCipher>,
        compression: Option<Compression>,
        max_manifest_versions: u32,
    ) -> Self {
        Self {
            store,
            cipher,
            compression,
            max_manifest_versions,
        }
    }

    pub fn store(&self) -> &dyn BlobStore {
        self.store.as_ref()
    }

    pub fn is_encrypting(&self) -> bool {
        self.cipher.is_encrypting()
    }

    // ------------------------------------------------------------------
    // Blob encode/decode
    // ------------------------------------------------------------------

    /// Publish `plaintext` under `sha`, or reuse the stored blob.
    ///
    /// `known_envelope` is the key material of an existing manifest row
    /// already referencing `sha`, when the caller found one. A stored blob
    /// with no surviving key material is unreferenced leftovers from an
    /// interrupted run and is replaced wholesale.
    pub fn save(
        &self,
        sha: &Sha256Digest,
        plaintext: &[u8],
        known_envelope: Option<&KeyEnvelope>,
    ) -> Result<SavedBlob> {
        if self.store.exists(sha)? {
            if let Some(envelope) = known_envelope {
                return Ok(SavedBlob {
                    sha: *sha,
                    key_envelope: Some(envelope.clone()),
                    reused: true,
                });
            }
            if !self.cipher.is_encrypting() {
                let existing = self.store.get(sha)?;
                let matches = self
                    .decode_payload(&existing)
                    .map(|stored| stored == plaintext)
                    .unwrap_or(false);
                if matches {
                    return Ok(SavedBlob {
                        sha: *sha,
                        key_envelope: None,
                        reused: true,
                    });
                }
            }
            debug!(blob = %sha, "replacing unreferenced blob");
            self.store.delete(sha)?;
        }

        let compressed = self.encode_payload(plaintext)?;
        let (ciphertext, key_envelope) = self.cipher.encrypt(&compressed)?;
        self.store.put(sha, &ciphertext)?;
        Ok(SavedBlob {
            sha: *sha,
            key_envelope,
            reused: false,
        })
    }

    /// Load and decode a base blob, verifying its address (fails `Corrupt`
    /// on mismatch). Diff blobs are verified after patch application; use
    /// [`BackupStore::resolve_content`] for those.
    pub fn load(&self, sha: &Sha256Digest, envelope: Option<&KeyEnvelope>) -> Result<Vec<u8>> {
        let raw = self.store.get(sha)?;
        let plaintext = self.decode_blob(&raw, envelope)?;
        if Sha256Digest::compute(&plaintext) != *sha {
            return Err(StrataError::Corrupt(format!(
                "blob {sha}: content does not match its address"
            )));
        }
        Ok(plaintext)
    }

    fn decode_blob(&self, raw: &[u8], envelope: Option<&KeyEnvelope>) -> Result<Vec<u8>> {
        let compressed = self.cipher.decrypt(raw, envelope)?;
        self.decode_payload(&compressed)
    }

    fn encode_payload(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match self.compression {
            None => Ok(plaintext.to_vec()),
            Some(codec) => compress::compress(codec, plaintext),
        }
    }

    fn decode_payload(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self.compression {
            None => Ok(data.to_vec()),
            Some(_) => compress::decompress(data),
        }
    }

    // ------------------------------------------------------------------
    // Diff chain resolution
    // ------------------------------------------------------------------

    /// Reconstruct the plaintext addressed by `sha`, following `base_sha`
    /// links down to a base blob and applying patches upward.
    ///
    /// Every intermediate plaintext is checked against its address, so a
    /// broken link surfaces as `Corrupt` at the first bad step. `cache`
    /// holds resolved plaintexts for the duration of a restore, collapsing
    /// shared chain prefixes to one resolution.
    pub fn resolve_content(
        &self,
        manifest: &Manifest,
        sha: &Sha256Digest,
        cache: &mut HashMap<Sha256Digest, Vec<u8>>,
    ) -> Result<Vec<u8>> {
        if let Some(hit) = cache.get(sha) {
            return Ok(hit.clone());
        }

        // Walk parent links until a base entry or an already-resolved blob.
        let mut chain: Vec<(Sha256Digest, ManifestEntry)> = Vec::new();
        let mut content: Option<Vec<u8>> = None;
        let mut cursor = *sha;
        loop {
            if let Some(hit) = cache.get(&cursor) {
                content = Some(hit.clone());
                break;
            }
            let entry = manifest.entry_for_sha(&cursor).cloned().ok_or_else(|| {
                StrataError::Corrupt(format!("no manifest entry references blob {cursor}"))
            })?;
            let parent = entry.base_sha;
            chain.push((cursor, entry));
            match parent {
                None => break,
                Some(parent) => {
                    if chain.iter().any(|(s, _)| *s == parent) {
                        return Err(StrataError::Corrupt(format!(
                            "diff chain cycle at blob {parent}"
                        )));
                    }
                    cursor = parent;
                }
            }
        }

        // Apply the chain from the base upward.
        for (blob_sha, entry) in chain.into_iter().rev() {
            let raw = self.store.get(&blob_sha)?;
            let decoded = self.decode_blob(&raw, entry.key_envelope.as_ref())?;
            let next = match (&content, entry.base_sha) {
                (None, None) => decoded,
                (Some(parent), Some(_)) => diff::patch(parent, &decoded)?,
                (None, Some(parent)) => {
                    return Err(StrataError::Corrupt(format!(
                        "diff blob {blob_sha} resolved without its parent {parent}"
                    )));
                }
                (Some(_), None) => {
                    return Err(StrataError::Corrupt(format!(
                        "base blob {blob_sha} appeared mid-chain"
                    )));
                }
            };
            if Sha256Digest::compute(&next) != blob_sha {
                return Err(StrataError::Corrupt(format!(
                    "blob {blob_sha}: content does not match its address"
                )));
            }
            cache.insert(blob_sha, next.clone());
            content = Some(next);
        }

        content.ok_or_else(|| StrataError::Corrupt(format!("empty diff chain for blob {sha}")))
    }

    // ------------------------------------------------------------------
    // Manifest persistence
    // ------------------------------------------------------------------

    /// Load the last committed manifest, or an empty one for a new set.
    pub fn load_manifest(&self) -> Result<Manifest> {
        let Some(name) = self.store.latest_manifest_name()? else {
            return Ok(Manifest::new());
        };
        let raw = self.store.manifest_get(Some(&name))?;
        let (envelope, body) = split_manifest_header(&raw)?;
        let plaintext = self.decode_blob(body, envelope.as_ref())?;
        Manifest::from_bytes(&plaintext)
    }

    /// Serialize and atomically publish the manifest, retaining older
    /// versions up to `max_manifest_versions`.
    ///
    /// The manifest has no outer row to carry its key material, so the
    /// wrapped key and nonce are prepended to the stored object.
    pub fn save_manifest(&self, manifest: &mut Manifest) -> Result<String> {
        let bytes = manifest.to_bytes()?;
        let compressed = self.encode_payload(&bytes)?;
        let (ciphertext, envelope) = self.cipher.encrypt(&compressed)?;
        let payload = prepend_manifest_header(&envelope, &ciphertext)?;

        let name = store::manifest_name(platform::unix_nanos_now());
        self.store
            .manifest_put(&name, &payload, self.max_manifest_versions)?;
        manifest.mark_clean();
        Ok(name)
    }
}

fn prepend_manifest_header(
    envelope: &Option<KeyEnvelope>,
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let header = rmp_serde::to_vec(envelope)?;
    let mut payload = Vec::with_capacity(4 + header.len() + ciphertext.len());
    payload.extend_from_slice(&(header.len() as u32).to_le_bytes());
    payload.extend_from_slice(&header);
    payload.extend_from_slice(ciphertext);
    Ok(payload)
}

fn split_manifest_header(raw: &[u8]) -> Result<(Option<KeyEnvelope>, &[u8])> {
    if raw.len() < 4 {
        return Err(StrataError::Corrupt("manifest object truncated".into()));
    }
    let header_len = u32::from_le_bytes(raw[..4].try_into().expect("4-byte slice")) as usize;
    let body_start = 4usize
        .checked_add(header_len)
        .filter(|&e| e <= raw.len())
        .ok_or_else(|| StrataError::Corrupt("manifest header truncated".into()))?;
    let envelope: Option<KeyEnvelope> = rmp_serde::from_slice(&raw[4..body_start])?;
    Ok((envelope, &raw[body_start..]))
}
