use std::collections::BTreeMap;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

/// Top-level configuration file: named backup sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub backups: BTreeMap<String, BackupSetConfig>,
}

/// One named backup set: what to back up, where to, and how.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSetConfig {
    /// RSA private key (PEM). Required unless `options.use_encryption` is
    /// false. The public half wraps per-blob keys during backup; the
    /// private half unwraps them during restore.
    #[serde(default)]
    pub private_key_filename: Option<String>,

    /// A path is excluded when any of these regexes matches its absolute
    /// path.
    #[serde(default)]
    pub exclusions: Vec<String>,

    /// Absolute root directories to walk.
    pub directories: Vec<String>,

    pub protocol: Protocol,

    #[serde(default)]
    pub options: SetOptions,
}

/// Storage backend binding for a set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Protocol {
    Local {
        location: String,
    },
    S3 {
        bucket: String,
        endpoint: String,
        #[serde(default = "default_s3_region")]
        region: String,
        access_key_id: String,
        secret_access_key: String,
        #[serde(default)]
        prefix: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetOptions {
    #[serde(default = "default_max_manifest_versions")]
    pub max_manifest_versions: u32,
    #[serde(default = "default_true")]
    pub use_encryption: bool,
    #[serde(default = "default_true")]
    pub use_compression: bool,
    /// Codec applied when `use_compression` is on: "lz4", "zstd", "none".
    #[serde(default = "default_compression_algorithm")]
    pub compression_algorithm: String,
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,
    /// When set, a patch is kept only while it is at most this fraction of
    /// the new content's size; an oversized patch falls back to a fresh
    /// base blob. Unset keeps every patch.
    #[serde(default)]
    pub discard_diff_percentage: Option<f64>,
    /// Commit the manifest after this many processed files. 0 disables
    /// intermediate checkpoints.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            max_manifest_versions: default_max_manifest_versions(),
            use_encryption: true,
            use_compression: true,
            compression_algorithm: default_compression_algorithm(),
            zstd_level: default_zstd_level(),
            discard_diff_percentage: None,
            checkpoint_interval: default_checkpoint_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_manifest_versions() -> u32 {
    5
}

fn default_compression_algorithm() -> String {
    "lz4".to_string()
}

fn default_zstd_level() -> i32 {
    3
}

fn default_checkpoint_interval() -> u64 {
    100
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

/// Load and validate a configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        StrataError::Config(format!("cannot read config '{}': {e}", path.display()))
    })?;
    let config: Config = serde_yaml::from_str(&raw).map_err(|e| {
        StrataError::Config(format!("cannot parse config '{}': {e}", path.display()))
    })?;
    for (name, set) in &config.backups {
        validate_set(name, set)?;
    }
    Ok(config)
}

fn validate_set(name: &str, set: &BackupSetConfig) -> Result<()> {
    if set.directories.is_empty() {
        return Err(StrataError::Config(format!(
            "backup set '{name}' has no directories"
        )));
    }
    for dir in &set.directories {
        if !Path::new(dir).is_absolute() {
            return Err(StrataError::Config(format!(
                "backup set '{name}': directory '{dir}' is not absolute"
            )));
        }
    }
    if set.options.use_encryption && set.private_key_filename.is_none() {
        return Err(StrataError::Config(format!(
            "backup set '{name}' enables encryption but names no private_key_filename"
        )));
    }
    if let Some(pct) = set.options.discard_diff_percentage {
        if !(0.0..=1.0).contains(&pct) {
            return Err(StrataError::Config(format!(
                "backup set '{name}': discard_diff_percentage must be within [0, 1]"
            )));
        }
    }
    compile_exclusions(&set.exclusions)?;
    Ok(())
}

impl Config {
    /// Look up a set by name, or fail naming the set.
    pub fn set(&self, name: &str) -> Result<&BackupSetConfig> {
        self.backups.get(name).ok_or_else(|| {
            StrataError::Config(format!("no backup set named '{name}' in configuration"))
        })
    }
}

/// Compile exclusion patterns. Matching is a pure function of the absolute
/// path string and this list.
pub fn compile_exclusions(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p)
                .map_err(|e| StrataError::Config(format!("invalid exclusion pattern '{p}': {e}")))
        })
        .collect()
}

pub fn is_excluded(path: &str, exclusions: &[Regex]) -> bool {
    exclusions.iter().any(|re| re.is_match(path))
}
