//! Decoded-block cache for the query executor.
//!
//! Keyed by `(segment path, block offset)`, bounded by a byte budget rather
//! than an entry count since decompressed blocks vary widely in size.
//! `DashMap`'s per-shard locking gives single-flight insertion for free: two
//! concurrent misses on the same key serialize on the entry call, so the
//! second one observes the first's result instead of decoding twice.

use bytes::Bytes;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub segment: PathBuf,
    pub block_offset: u64,
}

pub struct BlockCache {
    entries: DashMap<BlockKey, Bytes>,
    order: Mutex<VecDeque<BlockKey>>,
    max_bytes: u64,
    current_bytes: AtomicU64,
}

impl BlockCache {
    /// `max_bytes == 0` disables caching: `get_or_insert` always recomputes
    /// and nothing is retained, matching `--cache-max-mb 0`.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            max_bytes,
            current_bytes: AtomicU64::new(0),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub fn get_or_insert<E>(
        &self,
        key: BlockKey,
        decode: impl FnOnce() -> Result<Bytes, E>,
    ) -> Result<Bytes, E> {
        if self.max_bytes == 0 {
            return decode();
        }
        if let Some(existing) = self.entries.get(&key) {
            return Ok(existing.clone());
        }
        let value = decode()?;
        self.insert(key, value.clone());
        Ok(value)
    }

    fn insert(&self, key: BlockKey, value: Bytes) {
        let added = value.len() as u64;
        if self.entries.insert(key.clone(), value).is_none() {
            self.current_bytes.fetch_add(added, Ordering::Relaxed);
            self.order.lock().expect("cache order mutex poisoned").push_back(key);
        }
        self.evict_to_budget();
    }

    fn evict_to_budget(&self) {
        let mut order = self.order.lock().expect("cache order mutex poisoned");
        while self.current_bytes.load(Ordering::Relaxed) > self.max_bytes {
            let Some(oldest) = order.pop_front() else { break };
            if let Some((_, bytes)) = self.entries.remove(&oldest) {
                self.current_bytes.fetch_sub(bytes.len() as u64, Ordering::Relaxed);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(offset: u64) -> BlockKey {
        BlockKey { segment: PathBuf::from("seg.zst"), block_offset: offset }
    }

    #[test]
    fn caches_decoded_value_across_calls() {
        let cache = BlockCache::new(1024);
        let mut decodes = 0;
        for _ in 0..3 {
            let _: Result<Bytes, ()> = cache.get_or_insert(key(0), || {
                decodes += 1;
                Ok(Bytes::from_static(b"abc"))
            });
        }
        assert_eq!(decodes, 1);
    }

    #[test]
    fn disabled_cache_never_retains_anything() {
        let cache = BlockCache::disabled();
        let _: Result<Bytes, ()> = cache.get_or_insert(key(0), || Ok(Bytes::from_static(b"abc")));
        assert!(cache.is_empty());
    }

    #[test]
    fn evicts_oldest_entries_past_budget() {
        let cache = BlockCache::new(10);
        let _: Result<Bytes, ()> = cache.get_or_insert(key(0), || Ok(Bytes::from(vec![0u8; 6])));
        let _: Result<Bytes, ()> = cache.get_or_insert(key(1), || Ok(Bytes::from(vec![0u8; 6])));
        assert!(cache.len() <= 1);
    }
}
