use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::AtomicBool;

use regex::Regex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::backup_store::BackupStore;
use crate::commands::check_interrupted;
use crate::config::{self, BackupSetConfig};
use crate::diff;
use crate::error::{Result, StrataError};
use crate::lock;
use crate::manifest::{Manifest, ManifestEntry};
use crate::platform::{self, FileStat};
use crate::scratch::{self, ScratchDir};
use crate::store::BlobStore;
use crate::types::Sha256Digest;

/// Bounded retries when a file keeps changing underneath the copy.
const MAX_FILE_ATTEMPTS: u32 = 3;

#[derive(Debug, Default)]
pub struct BackupStats {
    pub files_examined: u64,
    pub files_new: u64,
    pub files_changed: u64,
    pub files_metadata: u64,
    pub files_unchanged: u64,
    pub files_excluded: u64,
    pub files_failed: u64,
    pub tombstones: u64,
    pub blobs_written: u64,
    pub blobs_reused: u64,
}

/// How a walked file relates to its manifest history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Classification {
    New,
    Unchanged,
    MetadataOnly,
    Changed,
}

/// Pure dispatch over (prior entry, current stat, current content address).
pub(crate) fn classify(
    prior: Option<&ManifestEntry>,
    stat: &FileStat,
    sha: &Sha256Digest,
) -> Classification {
    match prior {
        None => Classification::New,
        Some(p) if p.is_tombstone() => Classification::New,
        Some(p) if p.sha == Some(*sha) => {
            if p.metadata_matches(stat) {
                Classification::Unchanged
            } else {
                Classification::MetadataOnly
            }
        }
        Some(_) => Classification::Changed,
    }
}

/// Capture a snapshot of one backup set.
pub fn run(
    set_name: &str,
    set: &BackupSetConfig,
    shutdown: Option<&AtomicBool>,
) -> Result<BackupStats> {
    let exclusions = config::compile_exclusions(&set.exclusions)?;
    let store = BackupStore::open(set)?;

    let guard = lock::acquire_lock(store.store())?;
    let outcome = run_locked(set_name, set, &store, &exclusions, shutdown);
    let released = lock::release_lock(store.store(), guard);

    let stats = outcome?;
    released?;
    Ok(stats)
}

pub(crate) fn run_locked(
    set_name: &str,
    set: &BackupSetConfig,
    store: &BackupStore,
    exclusions: &[Regex],
    shutdown: Option<&AtomicBool>,
) -> Result<BackupStats> {
    let scratch = ScratchDir::new()?;
    let mut manifest = store.load_manifest()?;
    let previously_tracked = manifest.tracked_paths();

    let run = SnapshotRun {
        store,
        scratch: &scratch,
        discard_diff_percentage: set.options.discard_diff_percentage,
    };

    let mut seen: HashSet<String> = HashSet::new();
    let mut stats = BackupStats::default();
    let mut since_checkpoint: u64 = 0;

    for root in &set.directories {
        if !Path::new(root).is_dir() {
            return Err(StrataError::Config(format!(
                "backup set '{set_name}': root '{root}' does not exist"
            )));
        }
        info!(set = set_name, root = %root, "walking backup root");

        for entry in WalkDir::new(root).sort_by_file_name() {
            check_interrupted(shutdown)?;

            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    if is_soft_walk_error(&e) {
                        warn!(error = %e, "skipping entry (walk error)");
                        stats.files_failed += 1;
                        continue;
                    }
                    return Err(StrataError::Other(format!(
                        "walk error under '{root}': {e}"
                    )));
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let abs_str = entry.path().to_string_lossy().to_string();
            if config::is_excluded(&abs_str, exclusions) {
                debug!(path = %abs_str, "matched exclusion pattern; skipping");
                stats.files_excluded += 1;
                continue;
            }

            // Mark the path as seen so the deletion pass leaves it alone.
            seen.insert(abs_str.clone());
            stats.files_examined += 1;

            match run.process_file(&mut manifest, entry.path(), &abs_str, &mut stats) {
                Ok(()) => {}
                Err(e) if e.is_per_file() => {
                    warn!(path = %abs_str, error = %e, "skipping file");
                    stats.files_failed += 1;
                }
                Err(e) => return Err(e),
            }

            since_checkpoint += 1;
            if set.options.checkpoint_interval > 0
                && since_checkpoint >= set.options.checkpoint_interval
                && manifest.is_dirty()
            {
                store.save_manifest(&mut manifest)?;
                debug!(set = set_name, "manifest checkpoint committed");
                since_checkpoint = 0;
            }
        }
    }

    // Paths tracked before this run but never walked no longer exist:
    // record a tombstone, keep the history.
    for path in previously_tracked {
        if !seen.contains(&path) {
            info!(path = %path, "recording deletion");
            manifest.tombstone(&path);
            stats.tombstones += 1;
        }
    }

    if manifest.is_dirty() {
        store.save_manifest(&mut manifest)?;
    }

    info!(
        set = set_name,
        new = stats.files_new,
        changed = stats.files_changed,
        unchanged = stats.files_unchanged,
        deleted = stats.tombstones,
        failed = stats.files_failed,
        "backup finished"
    );
    Ok(stats)
}

fn is_soft_io_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::NotFound
    )
}

fn is_soft_walk_error(e: &walkdir::Error) -> bool {
    e.io_error().is_some_and(is_soft_io_error)
}

struct SnapshotRun<'a> {
    store: &'a BackupStore,
    scratch: &'a ScratchDir,
    discard_diff_percentage: Option<f64>,
}

impl SnapshotRun<'_> {
    fn process_file(
        &self,
        manifest: &mut Manifest,
        abs_path: &Path,
        abs_str: &str,
        stats: &mut BackupStats,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_process_file(manifest, abs_path, abs_str, stats) {
                Err(StrataError::FileRace(path)) if attempt < MAX_FILE_ATTEMPTS => {
                    debug!(path = %path, attempt, "file changed during copy; retrying");
                }
                other => return other,
            }
        }
    }

    fn try_process_file(
        &self,
        manifest: &mut Manifest,
        abs_path: &Path,
        abs_str: &str,
        stats: &mut BackupStats,
    ) -> Result<()> {
        let before = platform::stat_file(abs_path)?;

        // Matching size and mtime short-circuit content hashing; the
        // content address is authoritative everywhere else.
        if let Some(prior) = manifest.get_entry(abs_str, None) {
            if !prior.is_tombstone()
                && prior.size == before.size
                && prior.mtime_ns == before.mtime_ns
            {
                if prior.metadata_matches(&before) {
                    debug!(path = %abs_str, "up to date");
                    stats.files_unchanged += 1;
                } else {
                    let entry = prior.with_stat(&before);
                    debug!(path = %abs_str, "metadata change only");
                    manifest.insert(abs_str, entry);
                    stats.files_metadata += 1;
                }
                return Ok(());
            }
        }

        // Copy into scratch while hashing, so the digest describes exactly
        // the bytes that will be encoded. A stat mismatch afterwards means
        // the file was written to mid-copy.
        let scratch_path = self.scratch.next_path();
        let copied = scratch::copy_and_hash(abs_path, &scratch_path);
        let result = copied.and_then(|(sha, _)| {
            let after = platform::stat_file(abs_path)?;
            if after.size != before.size || after.mtime_ns != before.mtime_ns {
                return Err(StrataError::FileRace(abs_str.to_string()));
            }
            self.process_content(manifest, abs_str, &scratch_path, sha, &after, stats)
        });
        let _ = std::fs::remove_file(&scratch_path);
        result
    }

    fn process_content(
        &self,
        manifest: &mut Manifest,
        abs_str: &str,
        scratch_path: &Path,
        sha: Sha256Digest,
        stat: &FileStat,
        stats: &mut BackupStats,
    ) -> Result<()> {
        let prior = manifest.get_entry(abs_str, None).cloned();
        match classify(prior.as_ref(), stat, &sha) {
            Classification::Unchanged => {
                debug!(path = %abs_str, "content unchanged");
                stats.files_unchanged += 1;
            }
            Classification::MetadataOnly => {
                // classify only returns MetadataOnly with a live prior entry
                let entry = prior.unwrap().with_stat(stat);
                debug!(path = %abs_str, "metadata change only");
                manifest.insert(abs_str, entry);
                stats.files_metadata += 1;
            }
            Classification::New => {
                let plaintext = std::fs::read(scratch_path)?;
                let entry = self.encode_base(manifest, &sha, &plaintext, stat, stats)?;
                manifest.insert(abs_str, entry);
                info!(path = %abs_str, "backed up (new)");
                stats.files_new += 1;
            }
            Classification::Changed => {
                // classify only returns Changed with a live prior entry
                let prior_entry = prior.unwrap();
                let plaintext = std::fs::read(scratch_path)?;
                let entry =
                    self.encode_changed(manifest, &prior_entry, &sha, &plaintext, stat, stats)?;
                manifest.insert(abs_str, entry);
                info!(path = %abs_str, "backed up (changed)");
                stats.files_changed += 1;
            }
        }
        Ok(())
    }

    /// Store full content, deduplicating against any blob the manifest
    /// already references.
    fn encode_base(
        &self,
        manifest: &Manifest,
        sha: &Sha256Digest,
        plaintext: &[u8],
        stat: &FileStat,
        stats: &mut BackupStats,
    ) -> Result<ManifestEntry> {
        if let Some(existing) = self.reusable_entry(manifest, sha)? {
            debug!(blob = %sha, "reusing existing blob");
            stats.blobs_reused += 1;
            return Ok(existing.with_stat(stat));
        }
        let saved = self.store.save(sha, plaintext, None)?;
        if saved.reused {
            stats.blobs_reused += 1;
        } else {
            stats.blobs_written += 1;
        }
        Ok(ManifestEntry::base(*sha, saved.key_envelope, stat))
    }

    /// Store changed content as a patch against the prior version when the
    /// patch is small enough, otherwise as a fresh base blob.
    fn encode_changed(
        &self,
        manifest: &Manifest,
        prior: &ManifestEntry,
        sha: &Sha256Digest,
        plaintext: &[u8],
        stat: &FileStat,
        stats: &mut BackupStats,
    ) -> Result<ManifestEntry> {
        if let Some(existing) = self.reusable_entry(manifest, sha)? {
            debug!(blob = %sha, "reusing existing blob");
            stats.blobs_reused += 1;
            return Ok(existing.with_stat(stat));
        }

        let Some(prior_sha) = prior.sha else {
            return Err(StrataError::Corrupt(
                "live manifest entry carries no blob address".into(),
            ));
        };

        let mut chain_cache = HashMap::new();
        let prior_plaintext = self
            .store
            .resolve_content(manifest, &prior_sha, &mut chain_cache)?;
        let patch = diff::diff(&prior_plaintext, plaintext);

        let worth_keeping = match self.discard_diff_percentage {
            None => true,
            Some(pct) => (patch.len() as f64) <= (plaintext.len() as f64) * pct,
        };
        let (payload, entry) = if worth_keeping {
            debug!(
                patch_bytes = patch.len(),
                content_bytes = plaintext.len(),
                "storing diff blob"
            );
            (
                patch,
                ManifestEntry::diff(*sha, prior_sha, None, stat),
            )
        } else {
            debug!(
                patch_bytes = patch.len(),
                content_bytes = plaintext.len(),
                "patch too large; storing base blob"
            );
            (plaintext.to_vec(), ManifestEntry::base(*sha, None, stat))
        };

        let saved = self.store.save(sha, &payload, None)?;
        if saved.reused {
            stats.blobs_reused += 1;
        } else {
            stats.blobs_written += 1;
        }
        Ok(ManifestEntry {
            key_envelope: saved.key_envelope,
            ..entry
        })
    }

    /// An existing row for `sha` whose blob is still stored lets a new
    /// entry share the blob, its kind, and its key material.
    fn reusable_entry(
        &self,
        manifest: &Manifest,
        sha: &Sha256Digest,
    ) -> Result<Option<ManifestEntry>> {
        match manifest.entry_for_sha(sha) {
            Some(entry) if self.store.store().exists(sha)? => Ok(Some(entry.clone())),
            _ => Ok(None),
        }
    }
}
