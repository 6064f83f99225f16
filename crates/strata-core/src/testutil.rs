use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use rsa::RsaPrivateKey;

use crate::error::Result;
use crate::platform::FileStat;
use crate::store::BlobStore;

/// In-memory storage backend for testing. Thread-safe via Mutex.
pub struct MemoryStore {
    data: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }
}

impl BlobStore for MemoryStore {
    fn put_raw(&self, key: &str, data: &[u8]) -> Result<()> {
        let mut map = self.data.lock().unwrap();
        map.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let map = self.data.lock().unwrap();
        Ok(map.get(key).cloned())
    }

    fn exists_raw(&self, key: &str) -> Result<bool> {
        let map = self.data.lock().unwrap();
        Ok(map.contains_key(key))
    }

    fn delete_raw(&self, key: &str) -> Result<()> {
        let mut map = self.data.lock().unwrap();
        map.remove(key);
        Ok(())
    }

    fn list_raw(&self, prefix: &str) -> Result<Vec<String>> {
        let map = self.data.lock().unwrap();
        Ok(map
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// A process-wide RSA key for tests. 2048 bits keeps key generation fast;
/// the pipeline itself is key-size agnostic.
pub fn test_rsa_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("generate test RSA key")
    })
}

pub fn stat_fixture() -> FileStat {
    FileStat {
        mode: 0o100644,
        uid: 1000,
        gid: 1000,
        size: 5,
        mtime_ns: 1_700_000_000_000_000_000,
    }
}
