use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};
use tempfile::TempDir;

use crate::error::Result;
use crate::types::Sha256Digest;

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Per-run scratch area for intermediate plaintext and patch bytes.
///
/// The directory is acquired before any work begins and removed when the
/// run object is dropped, on every exit path.
pub struct ScratchDir {
    dir: TempDir,
    counter: AtomicU64,
}

impl ScratchDir {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: TempDir::with_prefix("strata-")?,
            counter: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Reserve a fresh file path inside the scratch area.
    pub fn next_path(&self) -> PathBuf {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        self.dir.path().join(format!("work-{n:08}"))
    }
}

/// Copy `src` into `dest`, hashing exactly the bytes that are written.
///
/// The returned digest therefore describes the scratch copy, not whatever
/// the source file contains by the time the copy finishes; the caller
/// re-checks the source stat to detect concurrent modification.
pub fn copy_and_hash(src: &Path, dest: &Path) -> Result<(Sha256Digest, u64)> {
    let mut input = File::open(src)?;
    let mut output = File::create(dest)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total: u64 = 0;
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        output.write_all(&buf[..n])?;
        total += n as u64;
    }
    output.flush()?;
    Ok((Sha256Digest(hasher.finalize().into()), total))
}
