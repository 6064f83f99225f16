use std::collections::HashMap;

use regex::Regex;
use tracing::{info, warn};

use crate::backup_store::BackupStore;
use crate::config::BackupSetConfig;
use crate::error::{Result, StrataError};
use crate::types::Sha256Digest;

/// Outcome of verifying one path.
#[derive(Debug, Clone)]
pub struct VerifyRow {
    pub path: String,
    pub sha: Sha256Digest,
    pub error: Option<String>,
}

/// Read back every matching path through the full decode pipeline and
/// check it against its recorded address. Read-only.
pub fn run(
    set_name: &str,
    set: &BackupSetConfig,
    pattern: &str,
    before: Option<i64>,
) -> Result<Vec<VerifyRow>> {
    let pattern = Regex::new(pattern)
        .map_err(|e| StrataError::Config(format!("invalid path pattern '{pattern}': {e}")))?;
    let store = BackupStore::open(set)?;
    let manifest = store.load_manifest()?;

    let mut chain_cache: HashMap<Sha256Digest, Vec<u8>> = HashMap::new();
    let mut rows = Vec::new();

    for hit in manifest.search(&pattern, before) {
        let Some(sha) = hit.entry.sha else {
            continue;
        };
        // resolve_content re-checks every link of the diff chain.
        let error = store
            .resolve_content(&manifest, &sha, &mut chain_cache)
            .err()
            .map(|e| e.to_string());
        if let Some(ref msg) = error {
            warn!(path = %hit.path, error = %msg, "verification failed");
        }
        rows.push(VerifyRow {
            path: hit.path,
            sha,
            error,
        });
    }

    let bad = rows.iter().filter(|r| r.error.is_some()).count();
    info!(
        set = set_name,
        verified = rows.len(),
        corrupt = bad,
        "verification finished"
    );
    Ok(rows)
}
