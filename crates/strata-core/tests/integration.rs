//! End-to-end scenarios over a local on-disk store.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;

use strata_core::commands::{backup, list, restore, verify};
use strata_core::config::{BackupSetConfig, Protocol, SetOptions};
use strata_core::error::StrataError;
use strata_core::platform;
use strata_core::types::Sha256Digest;

struct Fixture {
    _root: tempfile::TempDir,
    source: PathBuf,
    store_location: PathBuf,
    dest: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let source = root.path().join("source");
        let store_location = root.path().join("store");
        let dest = root.path().join("dest");
        std::fs::create_dir_all(&source).unwrap();
        Self {
            _root: root,
            source,
            store_location,
            dest,
        }
    }

    fn set(&self, exclusions: &[&str]) -> BackupSetConfig {
        BackupSetConfig {
            private_key_filename: None,
            exclusions: exclusions.iter().map(|s| s.to_string()).collect(),
            directories: vec![self.source.to_string_lossy().to_string()],
            protocol: Protocol::Local {
                location: self.store_location.to_string_lossy().to_string(),
            },
            options: SetOptions {
                use_encryption: false,
                use_compression: false,
                ..Default::default()
            },
        }
    }

    fn encrypted_set(&self, key_file: &Path) -> BackupSetConfig {
        let mut set = self.set(&[]);
        set.options.use_encryption = true;
        set.options.use_compression = true;
        set.private_key_filename = Some(key_file.to_string_lossy().to_string());
        set
    }

    fn write(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.source.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn blob_path(&self, sha: &Sha256Digest) -> PathBuf {
        let hex = sha.to_hex();
        self.store_location.join(&hex[..2]).join(&hex[2..])
    }

    fn restored(&self, source_file: &Path) -> PathBuf {
        let rel = source_file.strip_prefix("/").unwrap_or(source_file);
        self.dest.join(rel)
    }
}

fn test_key_pem() -> &'static str {
    static PEM: OnceLock<String> = OnceLock::new();
    PEM.get_or_init(|| {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string()
    })
}

#[test]
fn backup_stores_plaintext_blob_at_its_address() {
    let fx = Fixture::new();
    let file = fx.write("a", b"hello");
    let set = fx.set(&[]);

    backup::run("s1", &set, None).unwrap();

    // One entry for the file, addressed by SHA-256 of its content.
    let rows = list::run(&set, ".*", None, None, None).unwrap();
    let expected = Sha256Digest::compute(b"hello");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].path, file.to_string_lossy());
    assert_eq!(rows[0].sha, Some(expected));

    // With compression and encryption off, the blob on disk is the
    // content itself, sharded under its address.
    let stored = std::fs::read(fx.blob_path(&expected)).unwrap();
    assert_eq!(stored, b"hello");
}

#[test]
fn modify_restore_latest_and_historical() {
    let fx = Fixture::new();
    let file = fx.write("a", b"hello");
    let set = fx.set(&[]);

    backup::run("s1", &set, None).unwrap();
    fx.write("a", b"hellothere");
    backup::run("s1", &set, None).unwrap();

    let rows = list::run(&set, ".*", None, None, None).unwrap();
    assert_eq!(rows.len(), 2);
    let (v1, v2) = (&rows[0], &rows[1]);
    assert!(!v1.is_diff);
    assert!(v2.is_diff);

    // Latest restore yields the new content.
    let stats = restore::run("s1", &set, ".*", None, fx.dest.to_str().unwrap()).unwrap();
    assert_eq!(stats.files, 1);
    assert_eq!(stats.errors, 0);
    assert_eq!(std::fs::read(fx.restored(&file)).unwrap(), b"hellothere");

    // Restore at the first commit yields the original bytes.
    std::fs::remove_dir_all(&fx.dest).unwrap();
    restore::run("s1", &set, ".*", Some(v1.commit_ns), fx.dest.to_str().unwrap()).unwrap();
    assert_eq!(std::fs::read(fx.restored(&file)).unwrap(), b"hello");
}

#[test]
fn deletion_tombstones_but_history_remains_restorable() {
    let fx = Fixture::new();
    let file = fx.write("a", b"short-lived");
    let set = fx.set(&[]);

    backup::run("s1", &set, None).unwrap();
    std::fs::remove_file(&file).unwrap();
    backup::run("s1", &set, None).unwrap();

    let rows = list::run(&set, ".*", None, None, None).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows[1].sha.is_none(), "second entry is a tombstone");

    // Restoring the latest state produces nothing.
    let stats = restore::run("s1", &set, ".*", None, fx.dest.to_str().unwrap()).unwrap();
    assert_eq!(stats.files, 0);
    assert!(!fx.restored(&file).exists());

    // Restoring before the deletion still yields the content.
    restore::run(
        "s1",
        &set,
        ".*",
        Some(rows[0].commit_ns),
        fx.dest.to_str().unwrap(),
    )
    .unwrap();
    assert_eq!(std::fs::read(fx.restored(&file)).unwrap(), b"short-lived");
}

#[test]
fn excluded_path_never_produces_blobs_or_entries() {
    let fx = Fixture::new();
    fx.write("keep.txt", b"kept");
    fx.write("noise.tmp", b"generation 1");
    let set = fx.set(&[r".*\.tmp$"]);

    backup::run("s1", &set, None).unwrap();
    fx.write("noise.tmp", b"generation 2, different");
    backup::run("s1", &set, None).unwrap();

    let rows = list::run(&set, ".*", None, None, None).unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].path.ends_with("keep.txt"));
    // The only blob in the store is keep.txt's.
    assert!(fx.blob_path(&Sha256Digest::compute(b"kept")).exists());
    assert!(!fx
        .blob_path(&Sha256Digest::compute(b"generation 1"))
        .exists());
    assert!(!fx
        .blob_path(&Sha256Digest::compute(b"generation 2, different"))
        .exists());
}

#[test]
fn encrypted_backup_roundtrips_and_rejects_wrong_key() {
    let fx = Fixture::new();
    let file = fx.write("a", b"X");

    let key_file = fx.source.parent().unwrap().join("set.pem");
    std::fs::write(&key_file, test_key_pem()).unwrap();
    let set = fx.encrypted_set(&key_file);

    backup::run("s1", &set, None).unwrap();

    // The blob on disk is ciphertext.
    let sha = Sha256Digest::compute(b"X");
    let stored = std::fs::read(fx.blob_path(&sha)).unwrap();
    assert_ne!(stored, b"X");

    // Restore with the right key yields the plaintext.
    let stats = restore::run("s1", &set, ".*", None, fx.dest.to_str().unwrap()).unwrap();
    assert_eq!(stats.files, 1);
    assert_eq!(std::fs::read(fx.restored(&file)).unwrap(), b"X");

    // A different private key cannot unwrap the manifest, let alone blobs.
    let other_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
    let other_file = fx.source.parent().unwrap().join("other.pem");
    std::fs::write(
        &other_file,
        other_key.to_pkcs8_pem(LineEnding::LF).unwrap().as_bytes(),
    )
    .unwrap();
    let mut wrong = set.clone();
    wrong.private_key_filename = Some(other_file.to_string_lossy().to_string());

    std::fs::remove_dir_all(&fx.dest).unwrap();
    let err = restore::run("s1", &wrong, ".*", None, fx.dest.to_str().unwrap()).unwrap_err();
    assert!(matches!(err, StrataError::CryptoAuth));
}

#[test]
fn interrupted_run_converges_on_rerun() {
    let fx = Fixture::new();
    fx.write("a", b"durable");
    let set = fx.set(&[]);

    // Simulate a crash after the blob put but before any manifest commit:
    // place the blob by hand, commit nothing.
    let sha = Sha256Digest::compute(b"durable");
    let blob_path = fx.blob_path(&sha);
    std::fs::create_dir_all(blob_path.parent().unwrap()).unwrap();
    std::fs::write(&blob_path, b"durable").unwrap();

    let stats = backup::run("s1", &set, None).unwrap();
    assert_eq!(stats.files_new, 1);
    // The pre-existing identical blob satisfied the put.
    assert_eq!(stats.blobs_reused, 1);
    assert_eq!(stats.blobs_written, 0);

    let rows = list::run(&set, ".*", None, None, None).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].sha, Some(sha));

    restore::run("s1", &set, ".*", None, fx.dest.to_str().unwrap()).unwrap();
    assert_eq!(
        std::fs::read(fx.dest.join(fx.source.strip_prefix("/").unwrap()).join("a")).unwrap(),
        b"durable"
    );
}

#[test]
fn concurrent_backup_of_same_set_is_locked_out() {
    let fx = Fixture::new();
    fx.write("a", b"contended");
    let set = fx.set(&[]);

    let store = strata_core::store::store_from_config(&set.protocol).unwrap();
    let guard = strata_core::lock::acquire_lock(store.as_ref()).unwrap();

    let err = backup::run("s1", &set, None).unwrap_err();
    assert!(matches!(err, StrataError::Locked(_)));

    strata_core::lock::release_lock(store.as_ref(), guard).unwrap();
    backup::run("s1", &set, None).unwrap();
}

#[cfg(unix)]
#[test]
fn restore_applies_recorded_metadata() {
    use std::os::unix::fs::PermissionsExt;

    let fx = Fixture::new();
    let file = fx.write("a", b"metadata matters");
    std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o640)).unwrap();
    platform::set_file_mtime(&file, 1_600_000_000, 123_456_789).unwrap();
    let source_stat = platform::stat_file(&file).unwrap();

    let set = fx.set(&[]);
    backup::run("s1", &set, None).unwrap();
    restore::run("s1", &set, ".*", None, fx.dest.to_str().unwrap()).unwrap();

    let restored_stat = platform::stat_file(&fx.restored(&file)).unwrap();
    assert_eq!(restored_stat.mode & 0o7777, 0o640);
    assert_eq!(restored_stat.mtime_ns, source_stat.mtime_ns);
    assert_eq!(restored_stat.size, source_stat.size);
}

#[test]
fn verify_reports_tampered_blobs() {
    let fx = Fixture::new();
    fx.write("good", b"intact content");
    fx.write("bad", b"soon to be damaged");
    let set = fx.set(&[]);
    backup::run("s1", &set, None).unwrap();

    // Flip bytes of one stored blob.
    let victim = fx.blob_path(&Sha256Digest::compute(b"soon to be damaged"));
    std::fs::write(&victim, b"soon to be damaged!!").unwrap();

    let rows = verify::run("s1", &set, ".*", None).unwrap();
    assert_eq!(rows.len(), 2);
    let bad = rows.iter().find(|r| r.path.ends_with("/bad")).unwrap();
    let good = rows.iter().find(|r| r.path.ends_with("/good")).unwrap();
    assert!(bad.error.is_some());
    assert!(good.error.is_none());
}

#[test]
fn manifest_versions_are_retained_up_to_limit() {
    let fx = Fixture::new();
    fx.write("a", b"v1");
    let mut set = fx.set(&[]);
    set.options.max_manifest_versions = 2;

    backup::run("s1", &set, None).unwrap();
    fx.write("a", b"v2 longer");
    backup::run("s1", &set, None).unwrap();
    fx.write("a", b"v3 even longer");
    backup::run("s1", &set, None).unwrap();

    let manifests: Vec<_> = std::fs::read_dir(&fx.store_location)
        .unwrap()
        .filter_map(|e| {
            let name = e.unwrap().file_name().to_string_lossy().to_string();
            name.starts_with("manifest.").then_some(name)
        })
        .collect();
    assert_eq!(manifests.len(), 2);

    // The alias names the newest retained version and full history is
    // still queryable from it.
    let rows = list::run(&set, ".*", None, None, None).unwrap();
    assert_eq!(rows.len(), 3);
}

#[test]
fn sha_prefix_filter_narrows_list() {
    let fx = Fixture::new();
    fx.write("a", b"alpha content");
    fx.write("b", b"beta content");
    let set = fx.set(&[]);
    backup::run("s1", &set, None).unwrap();

    let target = Sha256Digest::compute(b"alpha content");
    let rows = list::run(&set, ".*", Some(&target.to_hex()[..8]), None, None).unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].path.ends_with("/a"));
}
