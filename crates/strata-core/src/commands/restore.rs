use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use tracing::{info, warn};

use crate::backup_store::BackupStore;
use crate::config::BackupSetConfig;
use crate::error::{Result, StrataError};
use crate::manifest::{Manifest, SearchHit};
use crate::platform;
use crate::types::Sha256Digest;

#[derive(Debug, Default)]
pub struct RestoreStats {
    pub files: u64,
    pub bytes: u64,
    pub errors: u64,
}

/// Restore every path matching `pattern` as of `before` (`None` = latest)
/// into `dest`.
pub fn run(
    set_name: &str,
    set: &BackupSetConfig,
    pattern: &str,
    before: Option<i64>,
    dest: &str,
) -> Result<RestoreStats> {
    let pattern = Regex::new(pattern)
        .map_err(|e| StrataError::Config(format!("invalid path pattern '{pattern}': {e}")))?;
    let store = BackupStore::open(set)?;
    let manifest = store.load_manifest()?;

    let hits = manifest.search(&pattern, before);
    let mut stats = RestoreStats::default();
    if hits.is_empty() {
        info!(set = set_name, "no matching paths to restore");
        return Ok(stats);
    }

    let dest_root = Path::new(dest);
    std::fs::create_dir_all(dest_root)?;

    // Plaintexts resolved once per run; chains that share a prefix (or
    // whole blobs, for deduplicated paths) are only decoded once.
    let mut chain_cache: HashMap<Sha256Digest, Vec<u8>> = HashMap::new();

    for hit in hits {
        match restore_one(&store, &manifest, &hit, dest_root, &mut chain_cache) {
            Ok(written) => {
                stats.files += 1;
                stats.bytes += written;
            }
            Err(e) => {
                // A bad path does not stop the rest of the restore.
                warn!(path = %hit.path, error = %e, "restore failed");
                stats.errors += 1;
            }
        }
    }

    info!(
        set = set_name,
        files = stats.files,
        bytes = stats.bytes,
        errors = stats.errors,
        "restore finished"
    );
    Ok(stats)
}

fn restore_one(
    store: &BackupStore,
    manifest: &Manifest,
    hit: &SearchHit,
    dest_root: &Path,
    chain_cache: &mut HashMap<Sha256Digest, Vec<u8>>,
) -> Result<u64> {
    let Some(sha) = hit.entry.sha else {
        // search() never yields tombstones
        return Err(StrataError::Corrupt(format!(
            "search hit for '{}' has no blob address",
            hit.path
        )));
    };

    // Chain resolution verifies every intermediate plaintext against its
    // address, the target included.
    let content = store.resolve_content(manifest, &sha, chain_cache)?;

    let target = dest_root.join(relative_dest_path(&hit.path)?);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&target, &content)?;

    if let Err(e) = platform::apply_mode(&target, hit.entry.mode) {
        warn!(path = %target.display(), error = %e, "could not restore mode");
    }
    if let Err(e) = platform::apply_owner(&target, hit.entry.uid, hit.entry.gid) {
        warn!(path = %target.display(), error = %e, "could not restore ownership");
    }
    let (secs, nanos) = platform::split_unix_nanos(hit.entry.mtime_ns);
    if let Err(e) = platform::set_file_mtime(&target, secs, nanos) {
        warn!(path = %target.display(), error = %e, "could not restore mtime");
    }

    info!(path = %hit.path, dest = %target.display(), "restored");
    Ok(content.len() as u64)
}

/// Map an absolute source path to a destination-relative one, refusing
/// anything that could escape the destination.
fn relative_dest_path(source_path: &str) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(source_path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(StrataError::Corrupt(format!(
                    "refusing to restore unsafe path: {source_path}"
                )));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(StrataError::Corrupt(format!(
            "refusing to restore empty path: {source_path}"
        )));
    }
    Ok(out)
}
