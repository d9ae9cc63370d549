//! Writer: single serializer task per hour partition.
//!
//! A single serializer task owns every `HourPartition` and drains a bounded
//! channel that producers enqueue onto; this is the "single-writer per
//! partition" model — backpressure from the bounded channel is the primary
//! flow-control mechanism, generalized from a single `Arc<RwLock<dyn
//! EventJournal>>` guard to per-hour-partition granularity.

use crate::core::event::Event;
use crate::core::timestamp::Timestamp;
use crate::error::{Error, Result};
use crate::storage::partition::HourPartition;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::warn;

pub type PartitionKey = (i32, u32, u32, u32);
pub type PartitionMap = Arc<RwLock<HashMap<PartitionKey, HourPartition>>>;

/// When to fsync the active segment after an append.
#[derive(Debug, Clone, Copy)]
pub enum FsyncPolicy {
    PerWrite,
    PerBatch(usize),
    PerInterval(Duration),
}

/// What happens when the bounded ingest channel is full. `Block` (default)
/// makes producers wait, which is the primary flow-control mechanism.
/// `Drop` instead rejects the event immediately and counts it, for callers
/// that prefer shedding load over blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    Block,
    Drop,
}

#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    pub segment_target_bytes: u64,
    pub fsync_policy: FsyncPolicy,
    pub overflow_policy: OverflowPolicy,
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            segment_target_bytes: crate::storage::partition::DEFAULT_SEGMENT_TARGET_BYTES,
            fsync_policy: FsyncPolicy::PerBatch(64),
            overflow_policy: OverflowPolicy::Block,
            channel_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriteAck {
    pub offset: u64,
    pub partition_key: PartitionKey,
}

enum WriterMsg {
    Write(Event, oneshot::Sender<Result<WriteAck>>),
    Flush(oneshot::Sender<Result<()>>),
    Reload(u64, oneshot::Sender<Result<()>>),
}

/// Producer-facing handle. Cheap to clone; every clone enqueues onto the
/// same bounded channel the serializer task drains.
#[derive(Clone)]
pub struct WriteHandle {
    tx: mpsc::Sender<WriterMsg>,
    overflow_policy: OverflowPolicy,
    dropped: Arc<AtomicU64>,
}

impl WriteHandle {
    /// `Write(event) -> ack`. Synchronous after the frame is
    /// durably in the OS buffer, per the writer's fsync policy.
    pub async fn write(&self, event: Event) -> Result<WriteAck> {
        let (ack_tx, ack_rx) = oneshot::channel();
        match self.overflow_policy {
            OverflowPolicy::Block => {
                self.tx
                    .send(WriterMsg::Write(event, ack_tx))
                    .await
                    .map_err(|_| Error::Storage("writer task is no longer running".to_string()))?;
            }
            OverflowPolicy::Drop => {
                if let Err(err) = self.tx.try_send(WriterMsg::Write(event, ack_tx)) {
                    return match err {
                        mpsc::error::TrySendError::Full(_) => {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            Err(Error::Capacity("ingest channel full, event dropped".to_string()))
                        }
                        mpsc::error::TrySendError::Closed(_) => {
                            Err(Error::Storage("writer task is no longer running".to_string()))
                        }
                    };
                }
            }
        }
        ack_rx
            .await
            .map_err(|_| Error::Storage("writer task dropped without acking".to_string()))?
    }

    /// `Flush()`: blocks until all buffered events are durable.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WriterMsg::Flush(tx))
            .await
            .map_err(|_| Error::Storage("writer task is no longer running".to_string()))?;
        rx.await.map_err(|_| Error::Storage("writer task dropped without acking".to_string()))?
    }

    /// `Reload(generation)`: flushes everything durable so no
    /// event from the previous generation is lost before the new
    /// generation's events start arriving.
    pub async fn reload(&self, generation: u64) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WriterMsg::Reload(generation, tx))
            .await
            .map_err(|_| Error::Storage("writer task is no longer running".to_string()))?;
        rx.await.map_err(|_| Error::Storage("writer task dropped without acking".to_string()))?
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct WriterActor {
    data_dir: PathBuf,
    partitions: PartitionMap,
    config: WriterConfig,
    last_ts_per_partition: HashMap<PartitionKey, Timestamp>,
    /// Count of timestamps silently bumped forward to preserve monotonicity.
    /// Exposed as a counter rather than logged per-occurrence, since
    /// out-of-order timestamps are routine under concurrent producers.
    adjustments: u64,
    pending_since_fsync: usize,
}

impl WriterActor {
    async fn handle_write(&mut self, mut event: Event) -> Result<WriteAck> {
        event.validate()?;

        let key = event.timestamp.hour_bucket();
        if let Some(last) = self.last_ts_per_partition.get(&key).copied() {
            if event.timestamp < last {
                event.timestamp = last.next();
                self.adjustments += 1;
            }
        }
        self.last_ts_per_partition.insert(key, event.timestamp);

        let mut partitions = self.partitions.write().await;
        let partition = match partitions.entry(key) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let dir = HourPartition::dir_for(&self.data_dir, event.timestamp);
                let opened = HourPartition::recover(dir, self.config.segment_target_bytes)?;
                e.insert(opened)
            }
        };

        let offset = match partition.ingest(event) {
            Ok(offset) => offset,
            Err(err) => {
                // I/O errors are fatal for the current segment: seal it
                // short and surface the failure; the next write opens a
                // fresh segment in the same partition.
                if let Err(seal_err) = partition.seal() {
                    warn!(error = %seal_err, "failed to seal segment short after a write error");
                }
                return Err(err);
            }
        };

        self.pending_since_fsync += 1;
        match self.config.fsync_policy {
            FsyncPolicy::PerWrite => partition.sync_active()?,
            FsyncPolicy::PerBatch(n) if self.pending_since_fsync >= n => {
                partition.sync_active()?;
                self.pending_since_fsync = 0;
            }
            _ => {}
        }

        Ok(WriteAck { offset, partition_key: key })
    }

    async fn handle_flush(&mut self) -> Result<()> {
        let mut partitions = self.partitions.write().await;
        for partition in partitions.values_mut() {
            partition.sync_active()?;
        }
        self.pending_since_fsync = 0;
        Ok(())
    }

    async fn run(mut self, mut rx: mpsc::Receiver<WriterMsg>) {
        let mut interval = match self.config.fsync_policy {
            FsyncPolicy::PerInterval(d) => Some(tokio::time::interval(d)),
            _ => None,
        };

        loop {
            let tick = async {
                match interval.as_mut() {
                    Some(iv) => {
                        iv.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(WriterMsg::Write(event, ack)) => {
                            let result = self.handle_write(event).await;
                            let _ = ack.send(result);
                        }
                        Some(WriterMsg::Flush(ack)) => {
                            let result = self.handle_flush().await;
                            let _ = ack.send(result);
                        }
                        Some(WriterMsg::Reload(_generation, ack)) => {
                            let result = self.handle_flush().await;
                            let _ = ack.send(result);
                        }
                        None => break,
                    }
                }
                _ = tick => {
                    if let Err(err) = self.handle_flush().await {
                        warn!(error = %err, "interval fsync failed");
                    }
                }
            }
        }
    }
}

/// Spawn the writer's serializer task and return the handle producers use.
pub fn spawn(data_dir: PathBuf, config: WriterConfig, partitions: PartitionMap) -> WriteHandle {
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let actor = WriterActor {
        data_dir,
        partitions,
        config,
        last_ts_per_partition: HashMap::new(),
        adjustments: 0,
        pending_since_fsync: 0,
    };
    tokio::spawn(actor.run(rx));
    WriteHandle {
        tx,
        overflow_policy: config.overflow_policy,
        dropped: Arc::new(AtomicU64::new(0)),
    }
}
