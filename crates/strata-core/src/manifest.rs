use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::crypto::KeyEnvelope;
use crate::error::Result;
use crate::platform::{self, FileStat};
use crate::types::Sha256Digest;

pub const MANIFEST_VERSION: u32 = 2;

/// One row of a path's history: how the path looked at one commit time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Plaintext address of the path's content; `None` is a tombstone.
    pub sha: Option<Sha256Digest>,
    /// For diff blobs, the address of the parent content the stored patch
    /// applies to; `None` for base blobs.
    pub base_sha: Option<Sha256Digest>,
    /// Wrapped symmetric key + nonce for the blob; `None` when encryption
    /// is off or for tombstones.
    pub key_envelope: Option<KeyEnvelope>,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime_ns: i64,
}

impl ManifestEntry {
    pub fn base(sha: Sha256Digest, key_envelope: Option<KeyEnvelope>, stat: &FileStat) -> Self {
        Self {
            sha: Some(sha),
            base_sha: None,
            key_envelope,
            mode: stat.mode,
            uid: stat.uid,
            gid: stat.gid,
            size: stat.size,
            mtime_ns: stat.mtime_ns,
        }
    }

    pub fn diff(
        sha: Sha256Digest,
        base_sha: Sha256Digest,
        key_envelope: Option<KeyEnvelope>,
        stat: &FileStat,
    ) -> Self {
        Self {
            base_sha: Some(base_sha),
            ..Self::base(sha, key_envelope, stat)
        }
    }

    pub fn tombstone() -> Self {
        Self {
            sha: None,
            base_sha: None,
            key_envelope: None,
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            mtime_ns: 0,
        }
    }

    /// Same content refs, fresh stat: records a metadata-only change.
    pub fn with_stat(&self, stat: &FileStat) -> Self {
        Self {
            sha: self.sha,
            base_sha: self.base_sha,
            key_envelope: self.key_envelope.clone(),
            mode: stat.mode,
            uid: stat.uid,
            gid: stat.gid,
            size: stat.size,
            mtime_ns: stat.mtime_ns,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.sha.is_none()
    }

    pub fn metadata_matches(&self, stat: &FileStat) -> bool {
        self.mode == stat.mode
            && self.uid == stat.uid
            && self.gid == stat.gid
            && self.size == stat.size
            && self.mtime_ns == stat.mtime_ns
    }
}

/// A match produced by [`Manifest::search`].
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub path: String,
    pub commit_ns: i64,
    pub entry: ManifestEntry,
}

/// The per-set index: every path's commit-time-ordered history.
///
/// Held in memory as an ordered table and serialized to MessagePack for
/// persistence; point-in-time queries binary-search each path's history.
/// Rows are append-only: a newer entry supersedes, nothing is rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    /// path → (commit_time_ns, entry), ascending in commit time.
    contents: BTreeMap<String, Vec<(i64, ManifestEntry)>>,
    /// Highest commit time handed out; keeps commit times strictly
    /// monotonic within the manifest even across clock steps.
    last_commit_ns: i64,
    #[serde(skip)]
    dirty: bool,
}

impl Manifest {
    pub fn new() -> Self {
        Self {
            version: MANIFEST_VERSION,
            contents: BTreeMap::new(),
            last_commit_ns: 0,
            dirty: false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    fn next_commit_time(&mut self) -> i64 {
        let now = platform::unix_nanos_now();
        self.last_commit_ns = now.max(self.last_commit_ns + 1);
        self.last_commit_ns
    }

    /// Latest entry for `path` at or before `at` (`None` = now).
    pub fn get_entry(&self, path: &str, at: Option<i64>) -> Option<&ManifestEntry> {
        let history = self.contents.get(path)?;
        match at {
            None => history.last().map(|(_, e)| e),
            Some(t) => {
                let idx = history.partition_point(|(commit, _)| *commit <= t);
                history[..idx].last().map(|(_, e)| e)
            }
        }
    }

    /// Full history of a path, oldest first.
    pub fn history(&self, path: &str) -> &[(i64, ManifestEntry)] {
        self.contents.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Append a new entry for `path` with a fresh commit time.
    pub fn insert(&mut self, path: &str, entry: ManifestEntry) -> i64 {
        let commit_ns = self.next_commit_time();
        self.contents
            .entry(path.to_string())
            .or_default()
            .push((commit_ns, entry));
        self.dirty = true;
        commit_ns
    }

    /// Record that `path` no longer exists.
    pub fn tombstone(&mut self, path: &str) -> i64 {
        self.insert(path, ManifestEntry::tombstone())
    }

    /// Paths whose latest entry is live (not a tombstone).
    pub fn tracked_paths(&self) -> Vec<String> {
        self.contents
            .iter()
            .filter(|(_, history)| history.last().is_some_and(|(_, e)| !e.is_tombstone()))
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Snapshot of all live paths as of `at`.
    pub fn state_at(&self, at: Option<i64>) -> BTreeMap<&str, &ManifestEntry> {
        self.contents
            .keys()
            .filter_map(|path| {
                self.get_entry(path, at)
                    .filter(|e| !e.is_tombstone())
                    .map(|e| (path.as_str(), e))
            })
            .collect()
    }

    /// Live entries as of `at` whose path matches `pattern`.
    pub fn search(&self, pattern: &Regex, at: Option<i64>) -> Vec<SearchHit> {
        let mut hits = Vec::new();
        for (path, history) in &self.contents {
            if !pattern.is_match(path) {
                continue;
            }
            let found = match at {
                None => history.last(),
                Some(t) => {
                    let idx = history.partition_point(|(commit, _)| *commit <= t);
                    history[..idx].last()
                }
            };
            if let Some((commit_ns, entry)) = found {
                if !entry.is_tombstone() {
                    hits.push(SearchHit {
                        path: path.clone(),
                        commit_ns: *commit_ns,
                        entry: entry.clone(),
                    });
                }
            }
        }
        hits
    }

    /// Any entry referencing `sha`, used to reuse key material and blob
    /// kind when deduplicating against already-stored content.
    pub fn entry_for_sha(&self, sha: &Sha256Digest) -> Option<&ManifestEntry> {
        self.contents.values().flatten().find_map(|(_, entry)| {
            if entry.sha == Some(*sha) {
                Some(entry)
            } else {
                None
            }
        })
    }

    /// Iterate every path with its full history.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &[(i64, ManifestEntry)])> {
        self.contents.iter().map(|(p, h)| (p, h.as_slice()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let manifest: Self = rmp_serde::from_slice(data)?;
        if manifest.version > MANIFEST_VERSION {
            return Err(crate::error::StrataError::Corrupt(format!(
                "manifest schema version {} is newer than supported version {MANIFEST_VERSION}",
                manifest.version
            )));
        }
        Ok(manifest)
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}
