//! Background compactor.
//!
//! Rewrites a sealed `Raw` segment into a block-compressed `Zstd` one. Runs
//! with bounded concurrency so compaction never competes with the writer or
//! query path for all available I/O at once, and defers any segment a
//! reader currently holds open rather than racing a rename under it.

use crate::error::{Error, Result};
use crate::storage::segment::SegmentStats;
use crate::storage::segment_file::{SegmentCodec, SegmentReader, SegmentWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Tracks segments a reader currently has open, so the compactor can defer
/// rather than rewrite out from under an in-flight scan.
#[derive(Clone, Default)]
pub struct ReaderRegistry {
    counts: Arc<dashmap::DashMap<PathBuf, AtomicUsize>>,
}

pub struct ReaderGuard {
    registry: ReaderRegistry,
    path: PathBuf,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        if let Some(counter) = self.registry.counts.get(&self.path) {
            counter.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl ReaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, path: &Path) -> ReaderGuard {
        self.counts
            .entry(path.to_path_buf())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::AcqRel);
        ReaderGuard { registry: self.clone(), path: path.to_path_buf() }
    }

    pub fn is_open(&self, path: &Path) -> bool {
        self.counts
            .get(path)
            .map(|c| c.load(Ordering::Acquire) > 0)
            .unwrap_or(false)
    }
}

pub struct Compactor {
    semaphore: Arc<Semaphore>,
    readers: ReaderRegistry,
}

/// Result of compacting one segment: its final path, replacing `original`.
pub struct CompactionOutcome {
    pub original: PathBuf,
    pub compacted: PathBuf,
    pub stats: SegmentStats,
}

impl Compactor {
    pub fn new(max_concurrent: usize, readers: ReaderRegistry) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))), readers }
    }

    /// Compact one sealed `Raw` segment at `path` into a new `Zstd` segment
    /// in the same directory, then delete the original. Deferred (returns
    /// `Ok(None)`) if a reader currently has `path` open. Aborts without
    /// touching the original if the recompressed segment's event count
    /// doesn't match the source.
    pub async fn compact(&self, path: PathBuf) -> Result<Option<CompactionOutcome>> {
        if self.readers.is_open(&path) {
            info!(segment = %path.display(), "compaction deferred: segment has an open reader");
            return Ok(None);
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::Storage("compactor semaphore closed".to_string()))?;

        let path2 = path.clone();
        let outcome = tokio::task::spawn_blocking(move || compact_blocking(&path2))
            .await
            .map_err(|e| Error::Storage(format!("compactor task panicked: {e}")))??;

        Ok(Some(outcome))
    }
}

fn compact_blocking(path: &Path) -> Result<CompactionOutcome> {
    let dir = path.parent().ok_or_else(|| Error::Storage("segment path has no parent dir".to_string()))?;

    let mut reader = SegmentReader::open(path)?;
    if reader.codec() == SegmentCodec::Zstd {
        return Err(Error::Storage(format!("{} is already compressed", path.display())));
    }
    let source_stats = reader.stat();
    if source_stats.quarantined {
        return Err(Error::Storage(format!("refusing to compact quarantined segment {}", path.display())));
    }

    let mut writer = SegmentWriter::create(dir, SegmentCodec::Zstd, source_stats.first_ts)?;
    let mut rewritten = 0u64;
    reader.scan_all(|event| {
        // append() is fallible only on I/O error; a mid-scan failure here
        // surfaces as a short write that the count check below catches.
        if writer.append(&event).is_ok() {
            rewritten += 1;
        }
    })?;

    if rewritten != source_stats.count {
        let _ = writer.seal();
        return Err(Error::Storage(format!(
            "compaction of {} produced {rewritten} events, expected {}",
            path.display(),
            source_stats.count
        )));
    }

    let (compacted_path, stats) = writer.seal()?;

    let mut verify = SegmentReader::open(&compacted_path)?;
    let verify_stats = verify.stat();
    if verify_stats.count != source_stats.count
        || verify_stats.first_ts != source_stats.first_ts
        || verify_stats.last_ts != source_stats.last_ts
    {
        let _ = std::fs::remove_file(&compacted_path);
        return Err(Error::Storage(format!(
            "compacted segment {} failed verification against {}",
            compacted_path.display(),
            path.display()
        )));
    }

    std::fs::remove_file(path)?;
    warn_if_smaller_than_expected(&stats, &source_stats, path);

    Ok(CompactionOutcome { original: path.to_path_buf(), compacted: compacted_path, stats })
}

fn warn_if_smaller_than_expected(compacted: &SegmentStats, source: &SegmentStats, path: &Path) {
    if compacted.file_size >= source.file_size {
        warn!(
            segment = %path.display(),
            raw_size = source.file_size,
            compacted_size = compacted.file_size,
            "compaction did not reduce segment size"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{Event, EventKind, ResourceRef};
    use crate::core::timestamp::Timestamp;
    use crate::storage::partition::HourPartition;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn event(ts: i64, i: u64) -> Event {
        let resource = ResourceRef::new("", "v1", "Pod", "default", format!("p{i}"), format!("u{i}"));
        Event::new(Timestamp::from_nanos(ts), EventKind::Create, resource, Bytes::from_static(b"{}"))
    }

    fn sealed_raw_segment(dir: &TempDir) -> PathBuf {
        let mut partition = HourPartition::open(dir.path().to_path_buf(), 10 * 1024 * 1024).unwrap();
        for i in 0..50u64 {
            partition.ingest(event(1_700_000_000_000_000_000 + i as i64, i)).unwrap();
        }
        partition.seal().unwrap();
        partition.sealed_segments()[0].0.clone()
    }

    #[tokio::test]
    async fn compacts_raw_segment_to_zstd_preserving_event_count() {
        let dir = TempDir::new().unwrap();
        let path = sealed_raw_segment(&dir);
        let compactor = Compactor::new(2, ReaderRegistry::new());

        let outcome = compactor.compact(path.clone()).await.unwrap().expect("not deferred");
        assert!(!path.exists());
        assert!(outcome.compacted.exists());
        assert_eq!(outcome.stats.count, 50);
        assert_eq!(outcome.stats.codec, SegmentCodec::Zstd);

        let mut reader = SegmentReader::open(&outcome.compacted).unwrap();
        let mut count = 0u64;
        reader.scan_all(|_| count += 1).unwrap();
        assert_eq!(count, 50);
    }

    #[tokio::test]
    async fn defers_compaction_while_a_reader_is_open() {
        let dir = TempDir::new().unwrap();
        let path = sealed_raw_segment(&dir);
        let readers = ReaderRegistry::new();
        let _guard = readers.acquire(&path);
        let compactor = Compactor::new(2, readers);

        let outcome = compactor.compact(path.clone()).await.unwrap();
        assert!(outcome.is_none());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn refuses_to_recompact_an_already_compressed_segment() {
        let dir = TempDir::new().unwrap();
        let path = sealed_raw_segment(&dir);
        let compactor = Compactor::new(2, ReaderRegistry::new());
        let outcome = compactor.compact(path).await.unwrap().unwrap();

        let second = compactor.compact(outcome.compacted.clone()).await;
        assert!(second.is_err());
        assert!(outcome.compacted.exists());
    }
}
