//! CLI flags.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

fn parse_duration_secs(s: &str) -> Result<Duration, String> {
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| format!("invalid duration {s:?}, expected a number of seconds"))
}

#[derive(Parser, Debug)]
#[command(name = "kaudit-store")]
#[command(about = "Time-partitioned event store for a Kubernetes audit/event monitor")]
pub struct Cli {
    /// Root directory the store writes hour partitions, manifest, and
    /// recovery artifacts under.
    #[arg(long, value_name = "PATH")]
    pub data_dir: PathBuf,

    /// Seal an active segment once its raw size reaches this many bytes.
    #[arg(long, value_name = "BYTES", default_value_t = crate::storage::partition::DEFAULT_SEGMENT_TARGET_BYTES)]
    pub segment_size: u64,

    /// How long, in seconds, a sealed hour partition is kept before
    /// `enforce_retention` deletes it.
    #[arg(long, value_name = "SECONDS", value_parser = parse_duration_secs, default_value = "604800")]
    pub retention: Duration,

    /// Maximum number of `Search`/`GetEvent` requests the query executor
    /// services concurrently.
    #[arg(long, value_name = "N", default_value_t = crate::config::DEFAULT_MAX_CONCURRENT_REQUESTS)]
    pub max_concurrent_requests: usize,

    /// Decoded-block cache budget in megabytes. `0` disables the cache.
    #[arg(long, value_name = "MB", default_value_t = crate::config::DEFAULT_CACHE_MAX_BYTES / (1024 * 1024))]
    pub cache_max_mb: u64,

    /// Path to a JSON `WatcherConfig` document describing the watch targets
    /// to configure the source with at startup.
    #[arg(long, value_name = "PATH")]
    pub watcher_config: Option<PathBuf>,

    /// Port the query/HTTP interface listens on.
    #[arg(long, value_name = "PORT", default_value_t = 8080)]
    pub api_port: u16,

    /// Path to a JSON import document to load before
    /// accepting live traffic.
    #[arg(long, value_name = "PATH")]
    pub import: Option<PathBuf>,
}
