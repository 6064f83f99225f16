pub mod local;
pub mod s3;

use crate::config::Protocol;
use crate::error::{Result, StrataError};
use crate::types::Sha256Digest;

pub const MANIFEST_PREFIX: &str = "manifest.";
pub const MANIFEST_ALIAS: &str = "manifest";

fn blob_key(sha: &Sha256Digest) -> String {
    sha.storage_key()
}

/// Inverse of [`Sha256Digest::storage_key`]: `ab/cd…` back to an address.
fn parse_blob_key(key: &str) -> Option<Sha256Digest> {
    let (shard, rest) = key.split_once('/')?;
    if shard.len() != 2 || rest.len() != 62 || rest.contains('/') {
        return None;
    }
    format!("{shard}{rest}").parse().ok()
}

/// Content-addressed storage for one backup set.
///
/// Backends implement the five raw object primitives over `/`-separated
/// string keys; blob addressing and manifest retention are layered on top
/// as provided methods. `put_raw` must publish atomically: `exists_raw`
/// may not return true until the full payload is durable, and a partial
/// stage left by a crash must never satisfy it.
pub trait BlobStore: Send + Sync {
    fn put_raw(&self, key: &str, data: &[u8]) -> Result<()>;

    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn exists_raw(&self, key: &str) -> Result<bool>;

    fn delete_raw(&self, key: &str) -> Result<()>;

    /// List all keys under a prefix. Returns full key paths.
    fn list_raw(&self, prefix: &str) -> Result<Vec<String>>;

    // ------------------------------------------------------------------
    // Blob operations
    // ------------------------------------------------------------------

    fn exists(&self, sha: &Sha256Digest) -> Result<bool> {
        self.exists_raw(&blob_key(sha))
    }

    /// Publish `data` under `sha`. Idempotent when the stored payload is
    /// byte-identical; a same-address payload mismatch is `Corrupt`.
    fn put(&self, sha: &Sha256Digest, data: &[u8]) -> Result<()> {
        let key = blob_key(sha);
        if let Some(existing) = self.get_raw(&key)? {
            if existing == data {
                return Ok(());
            }
            return Err(StrataError::Corrupt(format!(
                "blob {sha} already exists with different content"
            )));
        }
        self.put_raw(&key, data)
    }

    /// Read a blob. Fails with `NotFound` when absent.
    fn get(&self, sha: &Sha256Digest) -> Result<Vec<u8>> {
        self.get_raw(&blob_key(sha))?
            .ok_or_else(|| StrataError::NotFound(format!("blob {sha}")))
    }

    /// List stored blob addresses whose hex form starts with `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<Sha256Digest>> {
        // Narrow the raw listing to one shard directory when the prefix
        // pins the first byte.
        let raw_prefix = if prefix.len() >= 2 && prefix.is_ascii() {
            format!("{}/", &prefix[..2])
        } else {
            String::new()
        };
        let mut shas = Vec::new();
        for key in self.list_raw(&raw_prefix)? {
            if let Some(sha) = parse_blob_key(&key) {
                if sha.to_hex().starts_with(prefix) {
                    shas.push(sha);
                }
            }
        }
        shas.sort();
        Ok(shas)
    }

    /// Remove a blob. Used to reclaim unreferenced blobs; never called for
    /// a blob a committed manifest entry still points at.
    fn delete(&self, sha: &Sha256Digest) -> Result<()> {
        self.delete_raw(&blob_key(sha))
    }

    // ------------------------------------------------------------------
    // Manifest operations
    // ------------------------------------------------------------------

    /// Publish a manifest version, update the `manifest` alias, then prune
    /// versions beyond `max_versions`, oldest first.
    fn manifest_put(&self, name: &str, data: &[u8], max_versions: u32) -> Result<()> {
        if !name.starts_with(MANIFEST_PREFIX) {
            return Err(StrataError::Other(format!(
                "manifest name '{name}' must start with '{MANIFEST_PREFIX}'"
            )));
        }
        self.put_raw(name, data)?;
        self.put_raw(MANIFEST_ALIAS, name.as_bytes())?;

        let mut versions = self.manifest_names()?;
        let keep = (max_versions.max(1)) as usize;
        if versions.len() > keep {
            let prune = versions.len() - keep;
            for old in versions.drain(..prune) {
                self.delete_raw(&old)?;
            }
        }
        Ok(())
    }

    /// Read a manifest version by name, or the latest when `None`.
    fn manifest_get(&self, name: Option<&str>) -> Result<Vec<u8>> {
        let name = match name {
            Some(n) => n.to_string(),
            None => self
                .latest_manifest_name()?
                .ok_or_else(|| StrataError::NotFound("manifest".into()))?,
        };
        self.get_raw(&name)?
            .ok_or_else(|| StrataError::NotFound(format!("manifest '{name}'")))
    }

    /// Timestamp-ordered names of all retained manifest versions.
    fn manifest_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .list_raw(MANIFEST_PREFIX)?
            .into_iter()
            .filter(|k| {
                k.strip_prefix(MANIFEST_PREFIX)
                    .is_some_and(|ts| !ts.is_empty() && ts.bytes().all(|b| b.is_ascii_digit()))
            })
            .collect();
        // Zero-padded fixed-width timestamps, so lexicographic order is
        // chronological order.
        names.sort();
        Ok(names)
    }

    /// Name of the most recent manifest version, if any.
    ///
    /// The alias object is preferred; a missing or dangling alias falls
    /// back to scanning the timestamped names.
    fn latest_manifest_name(&self) -> Result<Option<String>> {
        if let Some(alias) = self.get_raw(MANIFEST_ALIAS)? {
            if let Ok(name) = String::from_utf8(alias) {
                if self.exists_raw(&name)? {
                    return Ok(Some(name));
                }
            }
        }
        Ok(self.manifest_names()?.pop())
    }
}

/// Build the storage backend a set's `protocol` section names.
pub fn store_from_config(protocol: &Protocol) -> Result<Box<dyn BlobStore>> {
    match protocol {
        Protocol::Local { location } => Ok(Box::new(local::LocalStore::new(location)?)),
        Protocol::S3 {
            bucket,
            endpoint,
            region,
            access_key_id,
            secret_access_key,
            prefix,
        } => Ok(Box::new(s3::S3Store::new(
            bucket,
            endpoint,
            region,
            access_key_id,
            secret_access_key,
            prefix,
        )?)),
    }
}

/// A manifest object name carrying the commit wall clock, zero-padded so
/// that name order is commit order.
pub fn manifest_name(unix_nanos: i64) -> String {
    format!("{MANIFEST_PREFIX}{:020}", unix_nanos.max(0))
}
