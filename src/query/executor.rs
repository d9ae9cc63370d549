//! Query executor.
//!
//! Partition selection (picking which `HourPartition`s overlap a filter's
//! time range) is the caller's job — it only needs hour-bucket arithmetic,
//! which `HourPartition`/`Timestamp` already expose. This module covers the
//! rest of the pipeline: segment selection via footers, header-prefiltered
//! frame scan, k-way merge, and the filter engine pass.

use crate::core::event::{Event, EventId};
use crate::core::timestamp::Timestamp;
use crate::error::Result;
use crate::query::cache::BlockCache;
use crate::query::filter::QueryFilter;
use crate::storage::partition::HourPartition;
use crate::storage::segment_file::SegmentReader;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

fn open_segment(path: &std::path::Path, cache: Option<&Arc<BlockCache>>) -> Result<SegmentReader> {
    match cache {
        Some(cache) => SegmentReader::open_cached(path, cache.clone()),
        None => SegmentReader::open(path),
    }
}

/// Resume point for paginated search.
/// Opaque to callers beyond equality; orders the same way events do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub last_ts: i64,
    pub last_id: String,
}

impl Cursor {
    fn from_event(event: &Event) -> Self {
        Self {
            last_ts: event.timestamp.as_nanos(),
            last_id: event.id.to_string(),
        }
    }

    fn already_returned(&self, event: &Event) -> bool {
        (event.timestamp.as_nanos(), event.id.to_string()) <= (self.last_ts, self.last_id.clone())
    }
}

#[derive(Debug, Default)]
pub struct SearchResult {
    pub events: Vec<Event>,
    pub next_cursor: Option<Cursor>,
    pub warnings: Vec<String>,
}

/// One decoded, not-yet-filtered candidate, tagged with its source segment
/// for quarantine attribution and merge ordering.
struct Candidate {
    event: Event,
}

impl Candidate {
    fn merge_key(&self) -> (i64, String) {
        (self.event.timestamp.as_nanos(), self.event.id.to_string())
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.merge_key() == other.merge_key()
    }
}
impl Eq for Candidate {}
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the smallest key out first.
        other.merge_key().cmp(&self.merge_key())
    }
}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Run the filter's time range and segment-level scans against every
/// partition in `partitions`, k-way merge the results, apply the filter
/// engine, and paginate by `(limit, cursor)`.
pub fn execute(
    partitions: &[&HourPartition],
    filter: &QueryFilter,
    limit: usize,
    cursor: Option<&Cursor>,
    cache: Option<&Arc<BlockCache>>,
) -> Result<SearchResult> {
    let (from_ts, to_ts) = filter.time_range();
    let mut warnings = Vec::new();
    let mut heap: BinaryHeap<Candidate> = BinaryHeap::new();

    for partition in partitions {
        for path in partition.open_for_read(from_ts, to_ts) {
            let mut reader = match open_segment(&path, cache) {
                Ok(r) => r,
                Err(e) => {
                    warnings.push(format!("segment {} unreadable: {e}", path.display()));
                    continue;
                }
            };
            let is_active = path.extension().and_then(|e| e.to_str()) == Some("part");
            if reader.is_quarantined() && !is_active {
                warnings.push(format!("segment {} quarantined: footer missing or corrupt", path.display()));
            }
            reader.scan(from_ts, to_ts, |event| heap.push(Candidate { event }))?;
        }
    }

    let mut events = Vec::with_capacity(limit.min(heap.len()));
    while let Some(Candidate { event }) = heap.pop() {
        if let Some(cursor) = cursor {
            if cursor.already_returned(&event) {
                continue;
            }
        }
        if !filter.matches(&event) {
            continue;
        }
        events.push(event);
        if events.len() >= limit {
            break;
        }
    }

    let next_cursor = if events.len() == limit {
        events.last().map(Cursor::from_event)
    } else {
        None
    };

    Ok(SearchResult { events, next_cursor, warnings })
}

/// `GetEvent(id)`: scan every segment in every given partition for an exact
/// id match. Linear in the number of candidate segments — acceptable since
/// by-id lookup is not the hot path `Search` is optimized for.
pub fn get_event(partitions: &[&HourPartition], id: EventId, cache: Option<&Arc<BlockCache>>) -> Result<Option<Event>> {
    for partition in partitions {
        for path in partition.open_for_read(Timestamp::MIN, Timestamp::MAX) {
            let mut reader = open_segment(&path, cache)?;
            let mut found = None;
            reader.scan_all(|event| {
                if found.is_none() && event.id == id {
                    found = Some(event);
                }
            })?;
            if found.is_some() {
                return Ok(found);
            }
        }
    }
    Ok(None)
}

/// Footer-only aggregate: total event count and time span across the given
/// partitions' sealed segments, without decoding a single frame. Namespace
/// and kind enumeration isn't derivable from the footer alone; callers that
/// need it read the store's maintained aggregate instead.
pub fn footer_metadata(partitions: &[&HourPartition]) -> (u64, Option<Timestamp>, Option<Timestamp>) {
    let mut total = 0u64;
    let mut first: Option<Timestamp> = None;
    let mut last: Option<Timestamp> = None;
    for partition in partitions {
        for (_, stats) in partition.sealed_segments() {
            total += stats.count;
            first = Some(first.map_or(stats.first_ts, |f| f.min(stats.first_ts)));
            last = Some(last.map_or(stats.last_ts, |l| l.max(stats.last_ts)));
        }
    }
    (total, first, last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{EventKind, ResourceRef};
    use bytes::Bytes;
    use tempfile::TempDir;

    fn event(ts: i64, ns: &str, i: u64) -> Event {
        let resource = ResourceRef::new("", "v1", "Pod", ns, format!("p{i}"), format!("u{i}"));
        Event::new(Timestamp::from_nanos(ts), EventKind::Create, resource, Bytes::from_static(b"{}"))
    }

    fn seeded_partition(dir: &TempDir) -> HourPartition {
        let mut partition = HourPartition::open(dir.path().to_path_buf(), 10 * 1024 * 1024).unwrap();
        for i in 0..10u64 {
            let ns = if i % 2 == 0 { "default" } else { "kube-system" };
            partition.ingest(event(1_700_000_000_000_000_000 + i as i64, ns, i)).unwrap();
        }
        partition.seal().unwrap();
        partition
    }

    #[test]
    fn execute_returns_events_in_timestamp_order() {
        let dir = TempDir::new().unwrap();
        let partition = seeded_partition(&dir);
        let result = execute(&[&partition], &QueryFilter::default(), 100, None, None).unwrap();
        assert_eq!(result.events.len(), 10);
        assert!(result.events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn execute_applies_namespace_filter() {
        let dir = TempDir::new().unwrap();
        let partition = seeded_partition(&dir);
        let filter = QueryFilter { namespace: Some("default".to_string()), ..Default::default() };
        let result = execute(&[&partition], &filter, 100, None, None).unwrap();
        assert_eq!(result.events.len(), 5);
        assert!(result.events.iter().all(|e| e.resource.namespace == "default"));
    }

    #[test]
    fn execute_paginates_with_limit_and_cursor() {
        let dir = TempDir::new().unwrap();
        let partition = seeded_partition(&dir);
        let first_page = execute(&[&partition], &QueryFilter::default(), 4, None, None).unwrap();
        assert_eq!(first_page.events.len(), 4);
        let cursor = first_page.next_cursor.expect("page was full, cursor expected");

        let second_page = execute(&[&partition], &QueryFilter::default(), 4, Some(&cursor), None).unwrap();
        assert_eq!(second_page.events.len(), 4);
        assert!(second_page.events[0].timestamp > first_page.events.last().unwrap().timestamp);
    }

    #[test]
    fn get_event_finds_by_id() {
        let dir = TempDir::new().unwrap();
        let partition = seeded_partition(&dir);
        let all = execute(&[&partition], &QueryFilter::default(), 100, None, None).unwrap();
        let target = all.events[3].id;
        let found = get_event(&[&partition], target, None).unwrap();
        assert_eq!(found.unwrap().id, target);
    }

    #[test]
    fn get_event_returns_none_for_unknown_id() {
        let dir = TempDir::new().unwrap();
        let partition = seeded_partition(&dir);
        let found = get_event(&[&partition], EventId::new(), None).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn footer_metadata_counts_without_decoding() {
        let dir = TempDir::new().unwrap();
        let partition = seeded_partition(&dir);
        let (total, first, last) = footer_metadata(&[&partition]);
        assert_eq!(total, 10);
        assert!(first.unwrap() <= last.unwrap());
    }
}
