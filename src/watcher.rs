//! Watcher interface: external collaborator contract — the shell's
//! Kubernetes informer client implements `Source`; the core only ever
//! consumes events through it.
//!
//! Uses the same async-trait-object pattern (`#[async_trait] pub trait
//! ... : Send + Sync`) as `storage::EventJournal`/`MaterializedView`,
//! generalized from a storage backend trait to a producer-side one.

use crate::core::event::Event;
use crate::error::Result;
use crate::writer::WriteHandle;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// One `(group/version/kind, optional namespace, optional label selector)`
/// watch target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchTarget {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
}

/// Polling/backoff parameters that accompany a set of watch targets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

/// Immutable once loaded; a reload produces a new `Generation` rather than
/// mutating this struct in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatcherConfig {
    pub targets: Vec<WatchTarget>,
    pub backoff: BackoffPolicy,
}

impl WatcherConfig {
    /// Rejects an empty target list and duplicate `(group, version, kind,
    /// namespace)` tuples — a config with either would leave `Source`
    /// unable to route deterministically.
    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(crate::error::Error::ConfigInvalid(
                "watcher config must declare at least one target".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for target in &self.targets {
            let key = (
                &target.group,
                &target.version,
                &target.kind,
                &target.namespace,
            );
            if !seen.insert(key) {
                return Err(crate::error::Error::ConfigInvalid(format!(
                    "duplicate watch target {}/{}/{} ns={:?}",
                    target.group, target.version, target.kind, target.namespace
                )));
            }
        }
        Ok(())
    }

    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let config: WatcherConfig = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }
}

/// Monotonically increasing identifier of a watcher configuration revision.
/// The writer and source coordinate reloads on this
/// value; a query result spanning a reload must never show generation N+1
/// events before generation N events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(pub u64);

impl Generation {
    pub const INITIAL: Generation = Generation(0);

    pub fn next(&self) -> Self {
        Generation(self.0 + 1)
    }
}

/// The data-plane callback `Subscribe` hands to a `Source`: one call per
/// observed event. `WriteHandle` implements this directly, so a source
/// subscribed with the store's write handle pushes straight onto the
/// writer's ingest channel with no intermediate buffering.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> Result<()>;
}

#[async_trait]
impl EventHandler for WriteHandle {
    async fn handle(&self, event: Event) -> Result<()> {
        self.write(event).await?;
        Ok(())
    }
}

/// Contract the core requires from the shell's Kubernetes informer client.
/// The core treats the source purely as an opaque event
/// producer: `subscribe` hands it the callback it pushes observed events
/// through, so the core never depends on a concrete source implementation.
#[async_trait]
pub trait Source: Send + Sync {
    /// Initialise or reload watched kinds. Must not return until the new
    /// configuration is either fully applied or rejected — the core relies
    /// on this to guarantee it never observes partial reconfiguration.
    async fn configure(&self, config: WatcherConfig) -> Result<Generation>;

    /// Register the callback the source pushes every observed event
    /// through. The core calls this once, before `configure`, so the first
    /// generation's events have somewhere to land as soon as the initial
    /// list+sync completes.
    async fn subscribe(&self, handler: Arc<dyn EventHandler>) -> Result<()>;

    /// True once the initial list+sync is complete for the current
    /// generation.
    async fn is_ready(&self) -> bool;

    /// Acknowledges that a reload requested via `configure` has completed:
    /// the source has drained events from the prior generation and is now
    /// emitting only the new one.
    async fn on_reload(&self, generation: Generation) -> Result<()>;
}

/// A `Source` double useful for tests and for demo wiring where no real
/// Kubernetes informer is available. Always ready, always accepts
/// configuration, generation counter only. `push` drives the subscribed
/// handler directly, standing in for whatever informer callback a real
/// source would invoke on a list/watch event.
pub struct StaticSource {
    generation: std::sync::atomic::AtomicU64,
    handler: Mutex<Option<Arc<dyn EventHandler>>>,
}

impl Default for StaticSource {
    fn default() -> Self {
        Self {
            generation: std::sync::atomic::AtomicU64::new(0),
            handler: Mutex::new(None),
        }
    }
}

impl StaticSource {
    /// Push one observed event through the subscribed handler, as a real
    /// source would on a list/watch callback. Returns `Capacity`-shaped
    /// errors from the writer unchanged if no handler is subscribed yet.
    pub async fn push(&self, event: Event) -> Result<()> {
        let handler = self.handler.lock().expect("handler lock poisoned").clone();
        match handler {
            Some(handler) => handler.handle(event).await,
            None => Err(crate::error::Error::Storage("no handler subscribed".to_string())),
        }
    }
}

#[async_trait]
impl Source for StaticSource {
    async fn configure(&self, config: WatcherConfig) -> Result<Generation> {
        config.validate()?;
        let next = self.generation.fetch_add(1, std::sync::atomic::Ordering::AcqRel) + 1;
        Ok(Generation(next))
    }

    async fn subscribe(&self, handler: Arc<dyn EventHandler>) -> Result<()> {
        *self.handler.lock().expect("handler lock poisoned") = Some(handler);
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        true
    }

    async fn on_reload(&self, _generation: Generation) -> Result<()> {
        Ok(())
    }
}

pub type SharedSource = Arc<dyn Source>;
