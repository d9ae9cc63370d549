//! Store configuration: wires the CLI flags into the typed knobs the rest
//! of the crate takes. Builder shape modeled on
//! `vector_buffers::disk_v2::common::DiskBufferConfig` — fields with
//! documented defaults, a `Builder` that validates before constructing the
//! final struct rather than the struct validating itself lazily.

use crate::error::{Error, Result};
use crate::writer::{FsyncPolicy, OverflowPolicy, WriterConfig};
use std::path::PathBuf;
use std::time::Duration;

/// Default decoded-block cache budget when `--cache-max-mb` is not given.
pub const DEFAULT_CACHE_MAX_BYTES: u64 = 64 * 1024 * 1024;
/// Default retention window: 7 days.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);
/// Default query executor concurrency cap.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 64;
/// Default shutdown deadline.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub segment_target_bytes: u64,
    pub retention: Duration,
    pub max_concurrent_requests: usize,
    pub cache_max_bytes: u64,
    pub watcher_config_path: Option<PathBuf>,
    pub api_port: u16,
    pub import_path: Option<PathBuf>,
    pub fsync_policy: FsyncPolicy,
    pub overflow_policy: OverflowPolicy,
    pub shutdown_timeout: Duration,
}

impl StoreConfig {
    pub fn builder(data_dir: impl Into<PathBuf>) -> StoreConfigBuilder {
        StoreConfigBuilder::new(data_dir)
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            segment_target_bytes: self.segment_target_bytes,
            fsync_policy: self.fsync_policy,
            overflow_policy: self.overflow_policy,
            channel_capacity: 4096,
        }
    }
}

pub struct StoreConfigBuilder {
    data_dir: PathBuf,
    segment_target_bytes: u64,
    retention: Duration,
    max_concurrent_requests: usize,
    cache_max_bytes: u64,
    watcher_config_path: Option<PathBuf>,
    api_port: u16,
    import_path: Option<PathBuf>,
    fsync_policy: FsyncPolicy,
    overflow_policy: OverflowPolicy,
    shutdown_timeout: Duration,
}

impl StoreConfigBuilder {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            segment_target_bytes: crate::storage::partition::DEFAULT_SEGMENT_TARGET_BYTES,
            retention: DEFAULT_RETENTION,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            cache_max_bytes: DEFAULT_CACHE_MAX_BYTES,
            watcher_config_path: None,
            api_port: 8080,
            import_path: None,
            fsync_policy: FsyncPolicy::PerBatch(64),
            overflow_policy: OverflowPolicy::Block,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn segment_target_bytes(mut self, bytes: u64) -> Self {
        self.segment_target_bytes = bytes;
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn max_concurrent_requests(mut self, n: usize) -> Self {
        self.max_concurrent_requests = n;
        self
    }

    /// `0` disables the decoded-block cache entirely.
    pub fn cache_max_mb(mut self, mb: u64) -> Self {
        self.cache_max_bytes = mb * 1024 * 1024;
        self
    }

    pub fn watcher_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.watcher_config_path = path;
        self
    }

    pub fn api_port(mut self, port: u16) -> Self {
        self.api_port = port;
        self
    }

    pub fn import_path(mut self, path: Option<PathBuf>) -> Self {
        self.import_path = path;
        self
    }

    pub fn fsync_policy(mut self, policy: FsyncPolicy) -> Self {
        self.fsync_policy = policy;
        self
    }

    pub fn overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Validate and build. Rejects a zero segment target (would rotate
    /// every single append) and a data dir that exists but isn't a
    /// directory — both `ConfigInvalid`, so the store refuses to start.
    pub fn build(self) -> Result<StoreConfig> {
        if self.segment_target_bytes == 0 {
            return Err(Error::ConfigInvalid("segment-size must be greater than zero".to_string()));
        }
        if self.max_concurrent_requests == 0 {
            return Err(Error::ConfigInvalid(
                "max-concurrent-requests must be greater than zero".to_string(),
            ));
        }
        if self.data_dir.exists() && !self.data_dir.is_dir() {
            return Err(Error::ConfigInvalid(format!(
                "data-dir {:?} exists and is not a directory",
                self.data_dir
            )));
        }
        Ok(StoreConfig {
            data_dir: self.data_dir,
            segment_target_bytes: self.segment_target_bytes,
            retention: self.retention,
            max_concurrent_requests: self.max_concurrent_requests,
            cache_max_bytes: self.cache_max_bytes,
            watcher_config_path: self.watcher_config_path,
            api_port: self.api_port,
            import_path: self.import_path,
            fsync_policy: self.fsync_policy,
            overflow_policy: self.overflow_policy,
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build_successfully() {
        let config = StoreConfig::builder("/tmp/kaudit-does-not-need-to-exist").build().unwrap();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.cache_max_bytes, DEFAULT_CACHE_MAX_BYTES);
    }

    #[test]
    fn zero_segment_size_is_rejected() {
        let result = StoreConfig::builder("/tmp/x").segment_target_bytes(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn cache_max_mb_zero_disables_cache() {
        let config = StoreConfig::builder("/tmp/x").cache_max_mb(0).build().unwrap();
        assert_eq!(config.cache_max_bytes, 0);
    }

    #[test]
    fn data_dir_that_is_a_file_is_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let result = StoreConfig::builder(file.path()).build();
        assert!(result.is_err());
    }
}
