//! kaudit-store: time-partitioned, segment-compressed event store for a
//! Kubernetes audit/event monitor.
//!
//! # Core Concepts
//!
//! - **Events**: immutable, append-only observations of Kubernetes resources
//! - **Hour partitions**: one directory per UTC hour, holding a sequence of
//!   segment files
//! - **Segments**: append-only binary frame logs, sealed and optionally
//!   compacted into block-compressed form once immutable
//! - **Store**: the orchestrator tying ingestion, query, compaction, and
//!   retention together behind a single handle
//!
//! # Example
//!
//! ```no_run
//! use kaudit_store::config::StoreConfig;
//! use kaudit_store::core::event::{Event, EventKind, ResourceRef};
//! use kaudit_store::core::timestamp::Timestamp;
//! use kaudit_store::query::filter::QueryFilter;
//! use kaudit_store::store::Store;
//!
//! # async fn example() -> kaudit_store::error::Result<()> {
//! let config = StoreConfig::builder("/var/lib/kaudit-store").build()?;
//! let store = Store::open(config).await?;
//!
//! let resource = ResourceRef::new("", "v1", "Pod", "default", "web-0", "uid-1");
//! let event = Event::new(Timestamp::now(), EventKind::Create, resource, bytes::Bytes::new());
//! store.ingest(event).await?;
//!
//! let result = store.search(&QueryFilter::default(), 100, None).await?;
//! println!("{} events", result.events.len());
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod codec;
pub mod compactor;
pub mod config;
pub mod core;
pub mod error;
pub mod lifecycle;
pub mod query;
pub mod storage;
pub mod store;
pub mod watcher;
pub mod writer;

/// Common imports for building against the store directly.
pub mod prelude {
    pub use crate::config::StoreConfig;
    pub use crate::core::event::{Event, EventId, EventKind, ResourceRef};
    pub use crate::core::timestamp::Timestamp;
    pub use crate::error::{Error, Result};
    pub use crate::query::filter::QueryFilter;
    pub use crate::store::Store;
}
