//! Cache configuration.
//!
//! Deserialized from the mount configuration by the embedding application;
//! everything here has a usable default.

use std::path::PathBuf;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};

use crate::pool::DEFAULT_WORKER_COUNT;

/// The smallest part the object-store protocol accepts in a multi-part
/// upload (except the final part).
pub const PROTOCOL_MIN_PART_SIZE: ByteSize = ByteSize::mib(5);

/// The cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheConfig {
    /// Directory holding the sparse cache files.
    pub cache_dir: PathBuf,

    /// Directory holding the stats sidecars.
    pub stats_dir: PathBuf,

    /// Minimum multi-part upload part size. Must not be below the protocol
    /// minimum of 5 MiB.
    pub min_part_size: ByteSize,

    /// Maximum multi-part upload part size.
    pub max_part_size: ByteSize,

    /// Number of worker threads executing object-store jobs.
    pub worker_count: usize,

    /// Reconcile the recorded page table against the cache file's physical
    /// hole/data map when a file is opened.
    pub check_cache_on_open: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let cache_dir = PathBuf::from("/var/cache/blobfs");
        Self {
            stats_dir: cache_dir.join(".stats"),
            cache_dir,
            min_part_size: PROTOCOL_MIN_PART_SIZE,
            max_part_size: ByteSize::gib(5),
            worker_count: DEFAULT_WORKER_COUNT,
            check_cache_on_open: false,
        }
    }
}

impl CacheConfig {
    /// Validate the configuration, collecting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.min_part_size < PROTOCOL_MIN_PART_SIZE {
            errors.push(format!(
                "min-part-size {} is below the protocol minimum of {}",
                self.min_part_size, PROTOCOL_MIN_PART_SIZE
            ));
        }
        if self.max_part_size.as_u64() < self.min_part_size.as_u64() * 2 {
            errors.push(format!(
                "max-part-size {} must be at least twice min-part-size {}",
                self.max_part_size, self.min_part_size
            ));
        }
        if self.worker_count == 0 {
            errors.push("worker-count must be positive".to_owned());
        }
        if self.cache_dir.as_os_str().is_empty() {
            errors.push("cache-dir must not be empty".to_owned());
        }
        if self.stats_dir.as_os_str().is_empty() {
            errors.push("stats-dir must not be empty".to_owned());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    pub fn min_part_bytes(&self) -> i64 {
        self.min_part_size.as_u64() as i64
    }

    pub fn max_part_bytes(&self) -> i64 {
        self.max_part_size.as_u64() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        CacheConfig::default().validate().expect("defaults must be valid");
    }

    #[test]
    fn undersized_min_part_is_rejected() {
        let config = CacheConfig {
            min_part_size: ByteSize::mib(1),
            ..CacheConfig::default()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("protocol minimum")));
    }

    #[test]
    fn max_must_leave_room_to_split() {
        let config = CacheConfig {
            min_part_size: ByteSize::mib(5),
            max_part_size: ByteSize::mib(8),
            ..CacheConfig::default()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("twice")));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = CacheConfig {
            worker_count: 0,
            ..CacheConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
