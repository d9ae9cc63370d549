//! Store: the orchestrator wiring every subsystem together, and the
//! query/HTTP interface contract the shell drives.
//!
//! An `Arc`-shared object handed to callers, with read-through queries
//! backed by a maintained aggregate guarded by a lock so metadata lookups
//! never have to rescan the partitions on disk.

use crate::compactor::{Compactor, ReaderRegistry};
use crate::config::StoreConfig;
use crate::core::event::{Event, EventId, EventKind, ResourceRef};
use crate::core::timestamp::Timestamp;
use crate::error::{Error, Result};
use crate::query::cache::BlockCache;
use crate::query::executor::{self, Cursor, SearchResult};
use crate::query::filter::QueryFilter;
use crate::storage::manifest::Manifest;
use crate::storage::partition::HourPartition;
use crate::storage::segment_file::{SegmentCodec, SegmentReader};
use crate::writer::{self, PartitionKey, PartitionMap, WriteHandle};
use chrono::{NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::RwLock;
use tracing::{info, warn};

const HOUR_NANOS: i64 = 3_600_000_000_000;

/// Copy-on-write snapshot the query path reads without blocking the writer.
/// The writer publishes a fresh `Arc` rather than mutating shared state in
/// place, so a reader's clone is never torn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    pub namespaces: BTreeSet<String>,
    pub kinds: BTreeSet<String>,
    pub total_events: u64,
    pub first_ts: Option<i64>,
    pub last_ts: Option<i64>,
}

impl MetadataSnapshot {
    fn with_event(&self, event: &Event) -> Self {
        let mut next = self.clone();
        next.namespaces.insert(event.resource.namespace.clone());
        next.kinds.insert(event.resource.kind.clone());
        next.total_events += 1;
        let ts = event.timestamp.as_nanos();
        next.first_ts = Some(next.first_ts.map_or(ts, |f| f.min(ts)));
        next.last_ts = Some(next.last_ts.map_or(ts, |l| l.max(ts)));
        next
    }
}

/// Per-record outcome of `ImportBatch`.
#[derive(Debug, Clone, Serialize)]
pub struct ImportFailure {
    pub id: Option<String>,
    pub reason: String,
}

/// `ImportBatch(events, options) -> report`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub inserted: u64,
    pub merged: u64,
    pub skipped: u64,
    pub failed: Vec<ImportFailure>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOptions {
    pub validate: bool,
    pub overwrite: bool,
}

/// The wire/import JSON envelope: `{ "events": [...] }`.
#[derive(Debug, Deserialize)]
pub struct ImportDocument {
    pub events: Vec<ImportEvent>,
}

/// One event as it appears on the wire: the same shape as `Event`, plus the
/// raw `data` object the enrichment rule inspects before it's flattened
/// into the opaque blob the core stores.
#[derive(Debug, Deserialize)]
pub struct ImportEvent {
    pub id: Option<String>,
    pub timestamp: Option<i64>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub resource: Option<ImportResource>,
    pub data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct ImportResource {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    pub uid: String,
    #[serde(rename = "involvedObjectUid", default)]
    pub involved_object_uid: Option<String>,
}

fn parse_kind(s: &str) -> Option<EventKind> {
    match s {
        "Create" => Some(EventKind::Create),
        "Update" => Some(EventKind::Update),
        "Delete" => Some(EventKind::Delete),
        _ => None,
    }
}

/// The object the shell drives: holds the writer handle, the partition
/// table, the compactor, and the maintained metadata aggregate. Not itself
/// a `lifecycle::Component` — `main.rs` wraps its collaborators in small
/// adapters that are, so the store stays usable directly in tests without
/// the lifecycle manager in the loop.
pub struct Store {
    config: StoreConfig,
    partitions: PartitionMap,
    write: WriteHandle,
    metadata: StdRwLock<Arc<MetadataSnapshot>>,
    readers: ReaderRegistry,
    compactor: Compactor,
    dedup: RwLock<std::collections::HashSet<EventId>>,
    /// Decoded-block cache shared across every query. `--cache-max-mb 0`
    /// (`config.cache_max_bytes == 0`) makes every lookup a pass-through, per
    /// `BlockCache::new`'s own budget-of-zero convention.
    cache: Arc<BlockCache>,
}

impl Store {
    /// Open (or create) the store at `config.data_dir`: recovers every
    /// existing hour partition, rebuilds the metadata aggregate
    /// from what recovery found, and spawns the writer's serializer task.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let manifest_path = config.data_dir.join("manifest.json");
        let manifest = Manifest::load(&manifest_path)?.unwrap_or(Manifest {
            retention_secs: config.retention.as_secs(),
            last_seen_hour: None,
        });

        let mut partitions_map = HashMap::new();
        let mut snapshot = MetadataSnapshot::default();
        for (key, dir) in discover_partition_dirs(&config.data_dir) {
            let partition = HourPartition::recover(dir, config.segment_target_bytes)?;
            rebuild_metadata_from_partition(&partition, &mut snapshot)?;
            partitions_map.insert(key, partition);
        }

        Manifest { retention_secs: config.retention.as_secs(), last_seen_hour: manifest.last_seen_hour }
            .save(&manifest_path)?;

        let partitions: PartitionMap = Arc::new(RwLock::new(partitions_map));
        let write = writer::spawn(config.data_dir.clone(), config.writer_config(), partitions.clone());
        let readers = ReaderRegistry::new();
        let compactor = Compactor::new(1, readers.clone());

        let cache = Arc::new(BlockCache::new(config.cache_max_bytes));

        Ok(Self {
            config,
            partitions,
            write,
            metadata: StdRwLock::new(Arc::new(snapshot)),
            readers,
            compactor,
            dedup: RwLock::new(std::collections::HashSet::new()),
            cache,
        })
    }

    fn snapshot(&self) -> Arc<MetadataSnapshot> {
        self.metadata.read().expect("metadata snapshot lock poisoned").clone()
    }

    fn publish(&self, event: &Event) {
        let mut guard = self.metadata.write().expect("metadata snapshot lock poisoned");
        *guard = Arc::new(guard.with_event(event));
    }

    /// Durably append one event and fold it into the metadata aggregate.
    /// Returns once the frame is durable per the writer's fsync cadence.
    pub async fn ingest(&self, event: Event) -> Result<()> {
        event.validate()?;
        {
            let mut seen = self.dedup.write().await;
            if !seen.insert(event.id) {
                return Err(Error::ValidationError(format!("duplicate event id {}", event.id)));
            }
        }
        self.write.write(event.clone()).await?;
        self.publish(&event);
        Ok(())
    }

    pub fn write_handle(&self) -> WriteHandle {
        self.write.clone()
    }

    /// Flush every partition's active segment to durable storage.
    pub async fn flush(&self) -> Result<()> {
        self.write.flush().await
    }

    /// Load (recovering if necessary) every on-disk partition whose hour
    /// overlaps `[from_ts, to_ts]` that isn't already in the in-memory
    /// table, then return every overlapping key in ascending order.
    async fn partitions_for_range(&self, from_ts: Timestamp, to_ts: Timestamp) -> Vec<PartitionKey> {
        for (key, dir) in discover_partition_dirs(&self.config.data_dir) {
            let Ok((start, end)) = key_hour_range(key) else { continue };
            if start > to_ts.as_nanos() || end <= from_ts.as_nanos() {
                continue;
            }
            if self.partitions.read().await.contains_key(&key) {
                continue;
            }
            let mut partitions = self.partitions.write().await;
            if let std::collections::hash_map::Entry::Vacant(e) = partitions.entry(key) {
                match HourPartition::recover(dir, self.config.segment_target_bytes) {
                    Ok(partition) => {
                        e.insert(partition);
                    }
                    Err(err) => warn!(partition = ?key, error = %err, "failed to recover partition for read"),
                }
            }
        }

        let partitions = self.partitions.read().await;
        let mut keys: Vec<PartitionKey> = partitions
            .keys()
            .copied()
            .filter(|key| match key_hour_range(*key) {
                Ok((start, end)) => start <= to_ts.as_nanos() && end > from_ts.as_nanos(),
                Err(_) => false,
            })
            .collect();
        keys.sort();
        keys
    }

    /// `Search(filter, limit, cursor) -> (events, nextCursor, warnings)`.
    pub async fn search(&self, filter: &QueryFilter, limit: usize, cursor: Option<&Cursor>) -> Result<SearchResult> {
        let (from_ts, to_ts) = filter.time_range();
        let keys = self.partitions_for_range(from_ts, to_ts).await;
        let partitions = self.partitions.read().await;
        let refs: Vec<&HourPartition> = keys.iter().filter_map(|k| partitions.get(k)).collect();
        executor::execute(&refs, filter, limit, cursor, Some(&self.cache))
    }

    /// `GetEvent(id) -> event | NotFound`.
    pub async fn get_event(&self, id: EventId) -> Result<Event> {
        let keys = self.partitions_for_range(Timestamp::MIN, Timestamp::MAX).await;
        let partitions = self.partitions.read().await;
        let refs: Vec<&HourPartition> = keys.iter().filter_map(|k| partitions.get(k)).collect();
        executor::get_event(&refs, id, Some(&self.cache))?.ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// `Metadata(optionalTimeRange) -> (namespaces[], kinds[], totalEvents,
    /// firstTs, lastTs)`, served from the maintained aggregate
    /// rather than a fresh scan. A `timeRange` narrows which partitions'
    /// footers are tallied for `totalEvents`/`firstTs`/`lastTs`, but
    /// `namespaces`/`kinds` are always the whole-store set — the aggregate
    /// doesn't bucket those by time, since nothing downstream needs it to.
    pub async fn metadata(&self, time_range: Option<(Timestamp, Timestamp)>) -> MetadataSnapshot {
        let snapshot = self.snapshot();
        match time_range {
            None => (*snapshot).clone(),
            Some((from, to)) => {
                let keys = self.partitions_for_range(from, to).await;
                let partitions = self.partitions.read().await;
                let refs: Vec<&HourPartition> = keys.iter().filter_map(|k| partitions.get(k)).collect();
                let (total, first, last) = executor::footer_metadata(&refs);
                MetadataSnapshot {
                    namespaces: snapshot.namespaces.clone(),
                    kinds: snapshot.kinds.clone(),
                    total_events: total,
                    first_ts: first.map(|t| t.as_nanos()),
                    last_ts: last.map(|t| t.as_nanos()),
                }
            }
        }
    }

    /// `ImportBatch(events, options) -> report`. Writes are
    /// routed through the same `ingest` path so every store invariant
    /// (unique id, positive timestamp) holds for imported data exactly as
    /// it does for live capture.
    pub async fn import_batch(&self, document: ImportDocument, options: ImportOptions) -> Result<ImportReport> {
        let mut report = ImportReport::default();

        for raw in document.events {
            match self.import_one(raw, options).await {
                Ok(Outcome::Inserted) => report.inserted += 1,
                Ok(Outcome::Merged) => report.merged += 1,
                Ok(Outcome::Skipped) => report.skipped += 1,
                Err((id, reason)) => report.failed.push(ImportFailure { id, reason }),
            }
        }
        Ok(report)
    }

    async fn import_one(&self, raw: ImportEvent, options: ImportOptions) -> std::result::Result<Outcome, (Option<String>, String)> {
        let id_str = raw.id.clone();
        let event = build_event_with_enrichment(raw).map_err(|e| (id_str.clone(), e))?;

        if self.get_event(event.id).await.is_ok() {
            // The append-only log has no update-in-place; a re-import of an
            // existing id is idempotent rather than destructive whichever
            // way `overwrite` is set.
            return Ok(if options.overwrite { Outcome::Merged } else { Outcome::Skipped });
        }

        if options.validate {
            event.validate().map_err(|e| (Some(event.id.to_string()), e.to_string()))?;
        }

        self.ingest(event).await.map_err(|e| (id_str, e.to_string()))?;
        Ok(Outcome::Inserted)
    }

    /// Delete any hour partition whose entire event range is older than the
    /// configured retention window. Runs as an
    /// explicit operation rather than a background loop so callers (the
    /// lifecycle manager, a cron-style shell task, or a test) control its
    /// cadence.
    pub async fn enforce_retention(&self, now: Timestamp) -> Result<Vec<PathBuf>> {
        let cutoff = now.as_nanos() - self.config.retention.as_nanos() as i64;
        let mut removed = Vec::new();

        let mut partitions = self.partitions.write().await;
        let expired: Vec<PartitionKey> = partitions
            .iter()
            .filter_map(|(key, partition)| {
                let last = partition.last_ts()?;
                (last.as_nanos() < cutoff).then_some(*key)
            })
            .collect();

        for key in expired {
            let dir = self.config.data_dir.join(format!("{:04}/{:02}/{:02}/{:02}", key.0, key.1, key.2, key.3));
            partitions.remove(&key);
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
                info!(partition = ?key, "retention removed expired partition");
                removed.push(dir);
            }
        }
        Ok(removed)
    }

    /// Compact every sealed `Raw` segment across all known partitions once.
    /// Exposed for the compactor's background task (spawned by `main`) and
    /// for tests; not invoked automatically by `ingest`.
    pub async fn compact_once(&self) -> Result<usize> {
        let partitions = self.partitions.read().await;
        let mut candidates = Vec::new();
        for (key, partition) in partitions.iter() {
            for (path, stats) in partition.sealed_segments() {
                if stats.codec == SegmentCodec::Raw {
                    candidates.push((*key, path.clone()));
                }
            }
        }
        drop(partitions);

        let mut compacted = 0;
        for (key, path) in candidates {
            if let Some(outcome) = self.compactor.compact(path).await? {
                info!(
                    segment = %outcome.compacted.display(),
                    state = ?outcome.stats.state(),
                    "segment compacted"
                );
                let mut partitions = self.partitions.write().await;
                if let Some(partition) = partitions.get_mut(&key) {
                    partition.replace_sealed(&outcome.original, outcome.compacted, outcome.stats);
                }
                compacted += 1;
            }
        }
        Ok(compacted)
    }

    pub fn reader_registry(&self) -> ReaderRegistry {
        self.readers.clone()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

enum Outcome {
    Inserted,
    Merged,
    Skipped,
}

/// Builds an `Event` from the wire format, applying the Kubernetes `Event`
/// enrichment rule: if `resource.kind == "Event"` and
/// `data.involvedObject.uid` exists, it is copied into
/// `resource.involvedObjectUid`; a conflicting pre-existing value fails the
/// record with a validation error rather than silently overwriting it.
fn build_event_with_enrichment(raw: ImportEvent) -> std::result::Result<Event, String> {
    let id = raw.id.as_deref().ok_or("missing id")?;
    let id = EventId::parse(id).map_err(|e| e.to_string())?;
    let timestamp = raw.timestamp.ok_or("missing timestamp")?;
    let timestamp = Timestamp::from_nanos(timestamp);
    if !timestamp.is_positive() {
        return Err(format!("non-positive timestamp {}", timestamp.as_nanos()));
    }
    let kind = raw.kind.as_deref().and_then(parse_kind).ok_or("missing or unknown type")?;
    let resource = raw.resource.ok_or("missing resource")?;

    let mut involved_object_uid = resource.involved_object_uid.clone();
    if resource.kind == "Event" {
        if let Some(uid) = raw.data.get("involvedObject").and_then(|v| v.get("uid")).and_then(|v| v.as_str()) {
            match &involved_object_uid {
                Some(existing) if existing != uid => {
                    return Err(format!(
                        "resource.involvedObjectUid {existing:?} conflicts with data.involvedObject.uid {uid:?}"
                    ));
                }
                _ => involved_object_uid = Some(uid.to_string()),
            }
        }
    }

    let resource = ResourceRef {
        group: resource.group,
        version: resource.version,
        kind: resource.kind,
        namespace: resource.namespace,
        name: resource.name,
        uid: resource.uid,
        involved_object_uid,
    };

    let data = serde_json::to_vec(&raw.data).map_err(|e| e.to_string())?;
    Ok(Event { id, timestamp, kind, resource, data: bytes::Bytes::from(data) })
}

fn discover_partition_dirs(data_dir: &Path) -> Vec<(PartitionKey, PathBuf)> {
    let mut found = Vec::new();
    let Ok(years) = std::fs::read_dir(data_dir) else { return found };
    for year in years.flatten() {
        let Ok(y) = year.file_name().to_string_lossy().parse::<i32>() else { continue };
        let Ok(months) = std::fs::read_dir(year.path()) else { continue };
        for month in months.flatten() {
            let Ok(m) = month.file_name().to_string_lossy().parse::<u32>() else { continue };
            let Ok(days) = std::fs::read_dir(month.path()) else { continue };
            for day in days.flatten() {
                let Ok(d) = day.file_name().to_string_lossy().parse::<u32>() else { continue };
                let Ok(hours) = std::fs::read_dir(day.path()) else { continue };
                for hour in hours.flatten() {
                    let Ok(h) = hour.file_name().to_string_lossy().parse::<u32>() else { continue };
                    found.push(((y, m, d, h), hour.path()));
                }
            }
        }
    }
    found
}

fn key_hour_range(key: PartitionKey) -> Result<(i64, i64)> {
    let (y, m, d, h) = key;
    let date = NaiveDate::from_ymd_opt(y, m, d).ok_or_else(|| Error::Storage(format!("invalid partition key {key:?}")))?;
    let datetime = date.and_hms_opt(h, 0, 0).ok_or_else(|| Error::Storage(format!("invalid partition key {key:?}")))?;
    let start = Utc.from_utc_datetime(&datetime).timestamp_nanos_opt().unwrap_or(0);
    Ok((start, start + HOUR_NANOS))
}

fn rebuild_metadata_from_partition(partition: &HourPartition, snapshot: &mut MetadataSnapshot) -> Result<()> {
    for (path, _) in partition.sealed_segments() {
        let mut reader = SegmentReader::open(path)?;
        reader.scan_all(|event| {
            *snapshot = snapshot.with_event(&event);
        })?;
    }
    Ok(())
}
