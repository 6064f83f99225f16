use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use rand::RngCore;

use crate::error::{Result, StrataError};
use crate::store::BlobStore;

/// Directory the stage files live in; publishes rename out of here into
/// the final key path, so a crash can only ever leave garbage under
/// `.stage`, never a half-written object at a live key.
const STAGE_DIR: &str = ".stage";

/// Local-filesystem backend rooted at one directory.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: &str) -> Result<Self> {
        let root_path = PathBuf::from(root);
        fs::create_dir_all(&root_path)?;
        fs::create_dir_all(root_path.join(STAGE_DIR))?;
        // Canonicalize for correct strip_prefix behavior with symlinked roots.
        let root = fs::canonicalize(&root_path)?;
        Ok(Self { root })
    }

    /// Reject storage keys that could escape the store root.
    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(StrataError::Other("unsafe storage key: empty".into()));
        }
        if key.starts_with('/') || key.contains('\\') {
            return Err(StrataError::Other(format!(
                "unsafe storage key: '{key}'"
            )));
        }
        for component in Path::new(key).components() {
            if component == Component::ParentDir {
                return Err(StrataError::Other(format!(
                    "unsafe storage key: parent traversal '{key}'"
                )));
            }
        }
        Ok(())
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        Self::validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn list_recursive(&self, dir: &Path, keys: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if dir == self.root && entry.file_name() == STAGE_DIR {
                    continue;
                }
                self.list_recursive(&entry.path(), keys)?;
            } else if file_type.is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    keys.push(key);
                }
            }
        }
        Ok(())
    }
}

impl BlobStore for LocalStore {
    fn put_raw(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let stage = self
            .root
            .join(STAGE_DIR)
            .join(format!("{:016x}", rand::thread_rng().next_u64()));
        let publish = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&stage)?;
            file.write_all(data)?;
            file.sync_all()?;
            fs::rename(&stage, &path)
        })();
        if publish.is_err() {
            let _ = fs::remove_file(&stage);
        }
        publish.map_err(StrataError::Io)
    }

    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn exists_raw(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_raw(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_raw(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.resolve(prefix.trim_end_matches('/'))?
        };
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => {
                let mut keys = Vec::new();
                self.list_recursive(&dir, &mut keys)?;
                if !prefix.is_empty() {
                    keys.retain(|k| k.starts_with(prefix.trim_end_matches('/')));
                }
                Ok(keys)
            }
            // A non-directory prefix names at most the file itself.
            Ok(_) => Ok(vec![prefix.trim_end_matches('/').to_string()]),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Flat prefixes like "manifest." match files in the root.
                if !prefix.contains('/') {
                    let mut keys = Vec::new();
                    for entry in fs::read_dir(&self.root)? {
                        let entry = entry?;
                        if entry.file_type()?.is_file() {
                            let name = entry.file_name().to_string_lossy().to_string();
                            if name.starts_with(prefix) {
                                keys.push(name);
                            }
                        }
                    }
                    Ok(keys)
                } else {
                    Ok(Vec::new())
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().to_str().unwrap()).unwrap();
        (dir, store)
    }

    #[test]
    fn validate_key_rejects_unsafe_keys() {
        assert!(LocalStore::validate_key("/etc/passwd").is_err());
        assert!(LocalStore::validate_key("../../outside").is_err());
        assert!(LocalStore::validate_key("foo/../../etc/passwd").is_err());
        assert!(LocalStore::validate_key("foo\\bar").is_err());
        assert!(LocalStore::validate_key("").is_err());
    }

    #[test]
    fn validate_key_accepts_safe_keys() {
        assert!(LocalStore::validate_key("ab/cdef0123").is_ok());
        assert!(LocalStore::validate_key("manifest.000123").is_ok());
        assert!(LocalStore::validate_key("locks/xyz.json").is_ok());
    }

    #[test]
    fn put_then_get_roundtrips() {
        let (_dir, store) = store();
        store.put_raw("ab/cd", b"payload").unwrap();
        assert_eq!(store.get_raw("ab/cd").unwrap().unwrap(), b"payload");
        assert!(store.exists_raw("ab/cd").unwrap());
    }

    #[test]
    fn get_missing_returns_none() {
        let (_dir, store) = store();
        assert!(store.get_raw("no/such").unwrap().is_none());
        assert!(!store.exists_raw("no/such").unwrap());
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, store) = store();
        store.put_raw("ab/cd", b"x").unwrap();
        store.delete_raw("ab/cd").unwrap();
        store.delete_raw("ab/cd").unwrap();
        assert!(!store.exists_raw("ab/cd").unwrap());
    }

    #[test]
    fn list_skips_stage_area() {
        let (dir, store) = store();
        store.put_raw("ab/cd", b"x").unwrap();
        std::fs::write(dir.path().join(STAGE_DIR).join("leftover"), b"partial").unwrap();

        let keys = store.list_raw("").unwrap();
        assert_eq!(keys, vec!["ab/cd".to_string()]);
    }

    #[test]
    fn list_flat_prefix_matches_root_files() {
        let (_dir, store) = store();
        store.put_raw("manifest.00000000000000000001", b"m1").unwrap();
        store.put_raw("manifest.00000000000000000002", b"m2").unwrap();
        store.put_raw("manifest", b"alias").unwrap();

        let mut keys = store.list_raw("manifest.").unwrap();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "manifest.00000000000000000001".to_string(),
                "manifest.00000000000000000002".to_string(),
            ]
        );
    }

    #[test]
    fn stage_failure_leaves_no_partial_object() {
        let (dir, store) = store();
        // A directory occupying the final path makes the rename fail.
        std::fs::create_dir_all(dir.path().join("ab/cd")).unwrap();
        assert!(store.put_raw("ab/cd", b"x").is_err());
        // The stage area holds nothing afterwards.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join(STAGE_DIR))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn traversal_is_rejected_at_every_operation() {
        let (_dir, store) = store();
        assert!(store.get_raw("../../etc/passwd").is_err());
        assert!(store.put_raw("../escape", b"bad").is_err());
        assert!(store.delete_raw("/absolute").is_err());
    }
}
