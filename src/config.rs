//! Resolved runtime configuration.
//!
//! The CLI (or an embedding frontend) populates `SyncConfig` once at startup;
//! every component receives it by reference. All defaulting happens in
//! `Default`, all validation in `validate`, before any network activity.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{SyncError, SyncResult};

pub const DEFAULT_MAX_CONCURRENCY: usize = 48;
pub const DEFAULT_DELETE_WARNING_THRESHOLD: usize = 50;
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(3 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Directory being kept in sync with the bucket.
    pub local_directory: PathBuf,
    /// URL of the hash manifest endpoint.
    pub manifest_url: String,
    pub bucket: String,
    /// Object-store host; objects are addressed as `https://{bucket}.{host}/{path}`.
    pub host: String,
    pub access_key: String,
    pub secret_key: String,
    /// Maximum simultaneous transfers.
    pub max_concurrency: usize,
    /// Aggregate download cap in bytes per second; `None` = unlimited.
    pub max_bytes_per_sec: Option<u64>,
    /// Deleting more files than this requires confirmation.
    pub max_files_removed_without_warning: usize,
    /// Delete without ever asking for confirmation.
    pub delete_without_asking: bool,
    /// Never delete redundant local files.
    pub no_delete: bool,
    /// Also delete files that were never seen in a previous manifest.
    pub delete_all: bool,
    /// Rehash every file instead of trusting the size+mtime shortcut.
    pub verify: bool,
    /// Top-level directory excluded from both downloads and deletion.
    pub exclude_dir: Option<String>,
    /// Stop after the first successful cycle instead of re-arming the timer.
    pub once: bool,
    /// Skip the running-process gate.
    pub ignore_running: bool,
    /// Create the local directory if it does not exist.
    pub create_directory: bool,
    /// Location of the persisted sync cache.
    pub cache_path: PathBuf,
    /// Delay between periodic re-checks in watch mode.
    pub check_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            local_directory: PathBuf::new(),
            manifest_url: String::new(),
            bucket: String::new(),
            host: "s3.amazonaws.com".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_bytes_per_sec: None,
            max_files_removed_without_warning: DEFAULT_DELETE_WARNING_THRESHOLD,
            delete_without_asking: false,
            no_delete: false,
            delete_all: false,
            verify: false,
            exclude_dir: None,
            once: false,
            ignore_running: false,
            create_directory: false,
            cache_path: default_cache_path(),
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

pub fn default_cache_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hashsync")
        .join("cache.dat")
}

impl SyncConfig {
    /// Checks the configuration before any network activity and creates the
    /// target directory when asked to. Every failure carries its own
    /// user-facing message.
    pub fn validate(&self) -> SyncResult<()> {
        if self.access_key.is_empty() {
            return Err(SyncError::Config(
                "access key is missing; pass --access-key or set it in your configuration".into(),
            ));
        }
        if self.secret_key.is_empty() {
            return Err(SyncError::Config(
                "secret key is missing; pass --secret-key or set it in your configuration".into(),
            ));
        }
        if self.bucket.is_empty() {
            return Err(SyncError::Config(
                "bucket is missing; pass --bucket or set it in your configuration".into(),
            ));
        }
        if self.manifest_url.is_empty() {
            return Err(SyncError::Config("manifest URL is missing; pass --manifest-url".into()));
        }
        if self.local_directory.as_os_str().is_empty() {
            return Err(SyncError::Config("local directory is missing; pass --dir".into()));
        }
        if !self.local_directory.is_dir() {
            if self.create_directory {
                std::fs::create_dir_all(&self.local_directory)?;
            } else {
                return Err(SyncError::Config(format!(
                    "the local directory '{}' does not exist; create it or pass --create-dir",
                    self.local_directory.display()
                )));
            }
        }
        if self.max_concurrency == 0 {
            return Err(SyncError::Config("concurrency must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_config(dir: &std::path::Path) -> SyncConfig {
        SyncConfig {
            local_directory: dir.to_path_buf(),
            manifest_url: "http://example.test/hashes.txt".into(),
            bucket: "build".into(),
            access_key: "AK".into(),
            secret_key: "SK".into(),
            ..SyncConfig::default()
        }
    }

    #[test]
    fn missing_credentials_are_rejected_before_any_network_use() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = complete_config(tmp.path());
        config.access_key.clear();
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));

        let mut config = complete_config(tmp.path());
        config.secret_key.clear();
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn missing_directory_is_created_only_with_create_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("game");

        let mut config = complete_config(&target);
        assert!(config.validate().is_err());
        assert!(!target.exists());

        config.create_directory = true;
        config.validate().unwrap();
        assert!(target.is_dir());
    }
}
