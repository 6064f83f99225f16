use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};
use crate::store::BlobStore;

/// A simple advisory lock stored in `locks/<timestamp>-<uuid>.json`.
///
/// Two concurrent backups of the same set are unsupported; the lock
/// serializes them. Sets with disjoint backends are unaffected.
#[derive(Debug, Serialize, Deserialize)]
struct LockEntry {
    hostname: String,
    pid: u32,
    time: String,
}

const LOCKS_PREFIX: &str = "locks/";
const DEFAULT_STALE_LOCK_SECS: i64 = 6 * 60 * 60; // 6 hours

/// Handle to an acquired lock.
#[derive(Debug)]
pub struct LockGuard {
    key: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Acquire the advisory lock for a backup set.
pub fn acquire_lock(store: &dyn BlobStore) -> Result<LockGuard> {
    cleanup_stale_locks(store, Duration::seconds(DEFAULT_STALE_LOCK_SECS))?;

    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let now = Utc::now();
    let entry = LockEntry {
        hostname,
        pid: std::process::id(),
        time: now.to_rfc3339(),
    };

    let uuid = format!("{:032x}", rand::random::<u128>());
    // Timestamp prefix keeps older lock keys sorted first.
    let ts = now.timestamp_micros();
    let key = format!("{LOCKS_PREFIX}{ts:020}-{uuid}.json");
    let data = serde_json::to_vec(&entry)
        .map_err(|e| StrataError::Other(format!("lock serialize: {e}")))?;

    store.put_raw(&key, &data)?;

    // Determine the lock winner deterministically: oldest key wins.
    let mut keys = list_lock_keys(store)?;
    keys.sort();
    if keys.first() != Some(&key) {
        // Best-effort cleanup of the lock we just wrote.
        let _ = store.delete_raw(&key);
        let holder = keys
            .first()
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        return Err(StrataError::Locked(holder));
    }

    Ok(LockGuard { key })
}

/// Release an advisory lock.
pub fn release_lock(store: &dyn BlobStore, guard: LockGuard) -> Result<()> {
    store.delete_raw(&guard.key)
}

fn list_lock_keys(store: &dyn BlobStore) -> Result<Vec<String>> {
    let mut keys = store.list_raw(LOCKS_PREFIX)?;
    keys.retain(|k| k.starts_with(LOCKS_PREFIX) && k.ends_with(".json"));
    Ok(keys)
}

/// Remove lock files older than `max_age`, left behind by killed processes.
fn cleanup_stale_locks(store: &dyn BlobStore, max_age: Duration) -> Result<()> {
    let now = Utc::now();
    for key in list_lock_keys(store)? {
        let Some(data) = store.get_raw(&key)? else {
            continue;
        };
        let Ok(entry) = serde_json::from_slice::<LockEntry>(&data) else {
            continue;
        };
        let Ok(acquired) = chrono::DateTime::parse_from_rfc3339(&entry.time) else {
            continue;
        };
        if now.signed_duration_since(acquired.with_timezone(&Utc)) > max_age {
            let _ = store.delete_raw(&key);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryStore;

    #[test]
    fn acquire_and_release() {
        let store = MemoryStore::new();
        let guard = acquire_lock(&store).unwrap();
        assert!(guard.key().starts_with(LOCKS_PREFIX));
        release_lock(&store, guard).unwrap();
        assert!(list_lock_keys(&store).unwrap().is_empty());
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let store = MemoryStore::new();
        let guard = acquire_lock(&store).unwrap();
        let err = acquire_lock(&store).unwrap_err();
        assert!(matches!(err, StrataError::Locked(_)));
        // The loser must not leave its own lock object behind.
        assert_eq!(list_lock_keys(&store).unwrap().len(), 1);
        release_lock(&store, guard).unwrap();
    }

    #[test]
    fn acquire_succeeds_after_release() {
        let store = MemoryStore::new();
        let guard = acquire_lock(&store).unwrap();
        release_lock(&store, guard).unwrap();
        let guard = acquire_lock(&store).unwrap();
        release_lock(&store, guard).unwrap();
    }

    #[test]
    fn stale_locks_are_cleaned_up() {
        let store = MemoryStore::new();
        let old = LockEntry {
            hostname: "ghost".into(),
            pid: 1,
            time: (Utc::now() - Duration::hours(12)).to_rfc3339(),
        };
        store
            .put_raw(
                &format!("{LOCKS_PREFIX}00000000000000000001-dead.json"),
                &serde_json::to_vec(&old).unwrap(),
            )
            .unwrap();

        let guard = acquire_lock(&store).unwrap();
        assert_eq!(list_lock_keys(&store).unwrap().len(), 1);
        release_lock(&store, guard).unwrap();
    }

    #[test]
    fn fresh_foreign_lock_blocks_acquisition() {
        let store = MemoryStore::new();
        let fresh = LockEntry {
            hostname: "other-host".into(),
            pid: 42,
            time: Utc::now().to_rfc3339(),
        };
        store
            .put_raw(
                &format!("{LOCKS_PREFIX}00000000000000000001-beef.json"),
                &serde_json::to_vec(&fresh).unwrap(),
            )
            .unwrap();

        assert!(matches!(
            acquire_lock(&store).unwrap_err(),
            StrataError::Locked(_)
        ));
    }
}
