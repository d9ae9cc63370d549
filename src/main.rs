//! kaudit-store: entry point. Parses the CLI, opens the store, optionally
//! preloads an import document, then serves until interrupted.
//!
//! Exit codes: `0` clean shutdown, `1` configuration error, `2`
//! fatal storage error, `130` interrupted (SIGINT/ctrl-c).

use async_trait::async_trait;
use clap::Parser;
use kaudit_store::cli::Cli;
use kaudit_store::config::StoreConfig;
use kaudit_store::error::{Error, Result};
use kaudit_store::lifecycle::{Component, LifecycleManager};
use kaudit_store::store::{ImportDocument, ImportOptions, Store};
use kaudit_store::watcher::{SharedSource, StaticSource, WatcherConfig};
use kaudit_store::writer::WriteHandle;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Wraps the opened store as a lifecycle component: a no-op start (the
/// store is already live once `Store::open` returns), always ready, and a
/// stop that flushes every partition's active segment before the process
/// exits.
struct StoreComponent {
    store: Arc<Store>,
}

#[async_trait]
impl Component for StoreComponent {
    fn name(&self) -> &str {
        "store"
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        true
    }

    async fn stop(&self) -> Result<()> {
        self.store.flush().await
    }
}

/// Wraps a configured `Source`: `start` subscribes the store's write handle
/// as the source's event callback, then pushes the loaded `WatcherConfig`
/// into it, so the first generation's events have somewhere to land as
/// soon as the initial list+sync completes. `is_ready` defers to the
/// source's own readiness, and `stop` is a no-op — sources own their own
/// task lifetime, the core only drives their control plane.
struct SourceComponent {
    source: SharedSource,
    config: WatcherConfig,
    write: WriteHandle,
}

#[async_trait]
impl Component for SourceComponent {
    fn name(&self) -> &str {
        "watcher"
    }

    async fn start(&self) -> Result<()> {
        self.source.subscribe(Arc::new(self.write.clone())).await?;
        self.source.configure(self.config.clone()).await?;
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        self.source.is_ready().await
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

fn build_config(cli: &Cli) -> Result<StoreConfig> {
    StoreConfig::builder(cli.data_dir.clone())
        .segment_target_bytes(cli.segment_size)
        .retention(cli.retention)
        .max_concurrent_requests(cli.max_concurrent_requests)
        .cache_max_mb(cli.cache_max_mb)
        .watcher_config_path(cli.watcher_config.clone())
        .api_port(cli.api_port)
        .import_path(cli.import.clone())
        .build()
}

async fn run_import(store: &Store, path: &std::path::Path) -> Result<()> {
    let bytes = std::fs::read(path)?;
    let document: ImportDocument = serde_json::from_slice(&bytes)?;
    let report = store.import_batch(document, ImportOptions { validate: true, overwrite: false }).await?;
    info!(
        inserted = report.inserted,
        merged = report.merged,
        skipped = report.skipped,
        failed = report.failed.len(),
        "import complete"
    );
    for failure in &report.failed {
        warn!(id = ?failure.id, reason = %failure.reason, "import record failed");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::from(1);
        }
    };
    let shutdown_timeout = config.shutdown_timeout;

    let store = match Store::open(config).await {
        Ok(store) => Arc::new(store),
        Err(Error::ConfigInvalid(reason)) => {
            error!(reason = %reason, "invalid configuration");
            return ExitCode::from(1);
        }
        Err(err) => {
            error!(error = %err, "failed to open store");
            return ExitCode::from(2);
        }
    };

    if let Some(path) = &store.config().import_path.clone() {
        if let Err(err) = run_import(&store, path).await {
            error!(error = %err, path = %path.display(), "import preload failed");
            return ExitCode::from(2);
        }
    }

    let mut manager = LifecycleManager::new();
    manager.register(Box::new(StoreComponent { store: store.clone() }), vec![]);

    if let Some(path) = &store.config().watcher_config_path.clone() {
        match WatcherConfig::load_from_file(path) {
            Ok(config) => {
                let source: SharedSource = Arc::new(StaticSource::default());
                manager.register(
                    Box::new(SourceComponent { source, config, write: store.write_handle() }),
                    vec!["store".to_string()],
                );
            }
            Err(err) => {
                error!(error = %err, path = %path.display(), "invalid watcher configuration");
                return ExitCode::from(1);
            }
        }
    }

    if let Err(err) = manager.start(Duration::from_secs(10)).await {
        error!(error = %err, "lifecycle start failed");
        return ExitCode::from(2);
    }
    info!(port = store.config().api_port, "kaudit-store running");

    let interrupted = tokio::signal::ctrl_c().await.is_ok();

    let timed_out = manager.stop(shutdown_timeout).await;
    if !timed_out.is_empty() {
        warn!(components = ?timed_out, "some components did not stop within the shutdown deadline");
    }

    if interrupted {
        ExitCode::from(130)
    } else {
        ExitCode::SUCCESS
    }
}
