use regex::Regex;

use crate::backup_store::BackupStore;
use crate::config::BackupSetConfig;
use crate::error::{Result, StrataError};
use crate::types::Sha256Digest;

/// One manifest row, ready for display.
#[derive(Debug, Clone)]
pub struct ListRow {
    pub path: String,
    pub commit_ns: i64,
    /// `None` marks a deletion.
    pub sha: Option<Sha256Digest>,
    pub is_diff: bool,
    pub size: u64,
    pub mtime_ns: i64,
}

/// List manifest history for every path matching `pattern`, bounded by
/// commit-time window and an optional blob address prefix.
pub fn run(
    set: &BackupSetConfig,
    pattern: &str,
    sha_prefix: Option<&str>,
    before: Option<i64>,
    after: Option<i64>,
) -> Result<Vec<ListRow>> {
    let pattern = Regex::new(pattern)
        .map_err(|e| StrataError::Config(format!("invalid path pattern '{pattern}': {e}")))?;
    let store = BackupStore::open(set)?;
    let manifest = store.load_manifest()?;

    let mut rows = Vec::new();
    for (path, history) in manifest.iter() {
        if !pattern.is_match(path) {
            continue;
        }
        for (commit_ns, entry) in history {
            if before.is_some_and(|b| *commit_ns > b) || after.is_some_and(|a| *commit_ns < a) {
                continue;
            }
            if let Some(prefix) = sha_prefix {
                let matches = entry
                    .sha
                    .map(|sha| sha.to_hex().starts_with(prefix))
                    .unwrap_or(false);
                if !matches {
                    continue;
                }
            }
            rows.push(ListRow {
                path: path.clone(),
                commit_ns: *commit_ns,
                sha: entry.sha,
                is_diff: entry.base_sha.is_some(),
                size: entry.size,
                mtime_ns: entry.mtime_ns,
            });
        }
    }
    Ok(rows)
}
