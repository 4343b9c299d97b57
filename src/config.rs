//! Configuration file model.
//!
//! The configuration is a TOML file. Every section has sensible defaults
//! so a minimal file only needs to list targets:
//!
//! ```toml
//! [[target]]
//! name = "home"
//! mount_point = "/home"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::transfer::TransferTuning;

const DEFAULT_CACHE_ROOT: &str = "/var/cache/incr-backup";
const DEFAULT_STORE_ROOT: &str = "/srv/backups";

#[derive(Debug, serde::Serialize, serde::Deserialize)]
/// Top-level configuration.
pub struct BackupConfig {
    /// Root of the per-target capture state directories.
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,

    /// Destination object store.
    #[serde(default)]
    pub store: StoreConfig,

    /// Transfer engine tuning.
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Capture stream encryption.
    #[serde(default)]
    pub encryption: EncryptionConfig,

    /// Directory trees to capture.
    #[serde(default, rename = "target")]
    pub targets: Vec<TargetConfig>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            store: StoreConfig::default(),
            transfer: TransferConfig::default(),
            encryption: EncryptionConfig::default(),
            targets: Vec::new(),
        }
    }
}

fn default_cache_root() -> PathBuf {
    PathBuf::from(DEFAULT_CACHE_ROOT)
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
/// One backup target.
pub struct TargetConfig {
    /// Name used in destination keys and for the state subdirectory.
    pub name: String,

    /// Stable mount point of the directory tree to capture.
    pub mount_point: PathBuf,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
/// Destination object store.
pub struct StoreConfig {
    /// Root directory of the filesystem store backend.
    #[serde(default = "default_store_root")]
    pub root: PathBuf,

    /// Destination subdirectory within the store. Defaults to the machine
    /// hostname.
    #[serde(default)]
    pub subdir: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_store_root(),
            subdir: None,
        }
    }
}

fn default_store_root() -> PathBuf {
    PathBuf::from(DEFAULT_STORE_ROOT)
}

impl StoreConfig {
    /// Destination subdirectory, falling back to the machine hostname.
    pub fn subdir(&self) -> String {
        match &self.subdir {
            Some(subdir) => subdir.clone(),
            None => hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
/// Transfer engine tuning.
pub struct TransferConfig {
    /// Size of one uploaded part, in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Upper bound on a single destination object, in bytes. A capture
    /// exceeding it rolls over into additional objects.
    #[serde(default = "default_max_object_size")]
    pub max_object_size: u64,

    /// Pause between reconnect attempts, in seconds.
    #[serde(default = "default_retry_timeout")]
    pub retry_timeout_secs: u64,

    /// Wall-clock budget for one unbroken run of transient failures, in
    /// seconds. Exhausting it fails the transfer.
    #[serde(default = "default_failure_timeout")]
    pub failure_timeout_secs: u64,

    /// Highest incremental level before the cycle wraps back to a full
    /// capture.
    #[serde(default = "default_max_level")]
    pub max_level: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_object_size: default_max_object_size(),
            retry_timeout_secs: default_retry_timeout(),
            failure_timeout_secs: default_failure_timeout(),
            max_level: default_max_level(),
        }
    }
}

impl TransferConfig {
    pub fn tuning(&self) -> TransferTuning {
        TransferTuning {
            chunk_size: self.chunk_size as usize,
            max_object_size: self.max_object_size,
            retry_timeout: Duration::from_secs(self.retry_timeout_secs),
            failure_timeout: Duration::from_secs(self.failure_timeout_secs),
        }
    }
}

fn default_chunk_size() -> u64 {
    32 * 1024 * 1024
}
fn default_max_object_size() -> u64 {
    1 << 40
}
fn default_retry_timeout() -> u64 {
    60
}
fn default_failure_timeout() -> u64 {
    3600
}
fn default_max_level() -> u32 {
    9
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
/// Capture stream encryption.
pub struct EncryptionConfig {
    /// Encrypt capture streams instead of compressing them.
    #[serde(default)]
    pub encrypt: bool,

    /// Recipients the stream is encrypted to. At least one has to resolve
    /// to a usable key when encryption is enabled.
    #[serde(default)]
    pub recipients: Vec<String>,
}
