//! Lifecycle manager: starts and stops the store's components in
//! dependency order.
//!
//! Dependency-ordered start, reverse-ordered stop. `main.rs` previously
//! wired its collaborators (`EventJournal`, `MaterializedView`) by hand;
//! this generalizes that trait-object-component idiom into an explicit
//! dependency graph so a watcher can depend on the store being up before
//! it starts pushing events.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

/// Where a registered component sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Registered,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// A component the lifecycle manager can start and stop. Implementations
/// drive one of the store's subsystems (writer, compactor, source) behind a
/// uniform start/ready/stop surface.
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    /// Begin starting. Returning `Ok(())` does not imply readiness — the
    /// manager polls `is_ready` afterward.
    async fn start(&self) -> Result<()>;

    /// Whether the component has finished initializing and is serving.
    async fn is_ready(&self) -> bool;

    /// Begin stopping. Expected to signal cancellation and return promptly;
    /// actual draining happens before this returns, bounded by the
    /// manager's shutdown deadline via `tokio::time::timeout` around the
    /// call, not by the component itself.
    async fn stop(&self) -> Result<()>;
}

struct Registration {
    component: Box<dyn Component>,
    deps: Vec<String>,
    state: ComponentState,
}

/// Registers components with their dependencies, starts them in
/// topological order (each blocks until ready or a timeout elapses), and
/// stops them in reverse order with a deadline, continuing past any
/// component that fails to stop in time.
pub struct LifecycleManager {
    registrations: HashMap<String, Registration>,
    order: Vec<String>,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self { registrations: HashMap::new(), order: Vec::new() }
    }

    /// Register `component`, which must not start until every name in
    /// `deps` has itself started successfully.
    pub fn register(&mut self, component: Box<dyn Component>, deps: Vec<String>) {
        let name = component.name().to_string();
        self.order.push(name.clone());
        self.registrations.insert(
            name,
            Registration { component, deps, state: ComponentState::Registered },
        );
    }

    fn topological_order(&self) -> Result<Vec<String>> {
        let mut result = Vec::with_capacity(self.registrations.len());
        let mut visited = HashSet::new();
        let mut visiting = HashSet::new();

        fn visit(
            name: &str,
            registrations: &HashMap<String, Registration>,
            visited: &mut HashSet<String>,
            visiting: &mut HashSet<String>,
            result: &mut Vec<String>,
        ) -> Result<()> {
            if visited.contains(name) {
                return Ok(());
            }
            if !visiting.insert(name.to_string()) {
                return Err(Error::ConfigInvalid(format!(
                    "lifecycle dependency cycle detected at component {name:?}"
                )));
            }
            let reg = registrations.get(name).ok_or_else(|| {
                Error::ConfigInvalid(format!("component {name:?} depends on unregistered component"))
            })?;
            for dep in &reg.deps {
                visit(dep, registrations, visited, visiting, result)?;
            }
            visiting.remove(name);
            visited.insert(name.to_string());
            result.push(name.to_string());
            Ok(())
        }

        // Preserve registration order among components with no relative
        // dependency so startup is deterministic across runs.
        for name in &self.order {
            visit(name, &self.registrations, &mut visited, &mut visiting, &mut result)?;
        }
        Ok(result)
    }

    /// Start every registered component in dependency order. Each
    /// component's `start` is invoked, then `is_ready` is polled until it
    /// returns true or `ready_timeout` elapses, in which case startup fails
    /// fast without starting the remaining components.
    pub async fn start(&mut self, ready_timeout: Duration) -> Result<()> {
        let order = self.topological_order()?;
        for name in order {
            let reg = self.registrations.get_mut(&name).expect("topological_order only returns known names");
            reg.state = ComponentState::Starting;
            info!(component = %name, "starting");
            if let Err(err) = reg.component.start().await {
                reg.state = ComponentState::Failed;
                return Err(err);
            }

            let deadline = tokio::time::Instant::now() + ready_timeout;
            loop {
                if reg.component.is_ready().await {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    reg.state = ComponentState::Failed;
                    return Err(Error::ConfigInvalid(format!(
                        "component {name:?} did not become ready within {ready_timeout:?}"
                    )));
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            reg.state = ComponentState::Running;
            info!(component = %name, "running");
        }
        Ok(())
    }

    /// Stop every component in reverse start order, each bounded by
    /// `deadline`. A component that fails to stop in time is recorded and
    /// skipped; the manager proceeds to stop the rest rather than aborting.
    pub async fn stop(&mut self, deadline: Duration) -> Vec<String> {
        let order = self.topological_order().unwrap_or_default();
        let mut timed_out = Vec::new();

        for name in order.into_iter().rev() {
            let Some(reg) = self.registrations.get_mut(&name) else { continue };
            if reg.state != ComponentState::Running {
                continue;
            }
            reg.state = ComponentState::Stopping;
            match timeout(deadline, reg.component.stop()).await {
                Ok(Ok(())) => {
                    reg.state = ComponentState::Stopped;
                    info!(component = %name, "stopped");
                }
                Ok(Err(err)) => {
                    reg.state = ComponentState::Failed;
                    warn!(component = %name, error = %err, "failed to stop cleanly");
                }
                Err(_) => {
                    reg.state = ComponentState::Failed;
                    timed_out.push(name.clone());
                    warn!(component = %name, deadline = ?deadline, "shutdown timed out");
                }
            }
        }
        timed_out
    }

    pub fn state_of(&self, name: &str) -> Option<ComponentState> {
        self.registrations.get(name).map(|r| r.state)
    }
}
