use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::health::{HealthHandle, LifecycleState, OrchestratorHealth};
use crate::runner::CollectorRunner;

struct Entry {
    health: HealthHandle,
    stop: CancellationToken,
    /// Present until started
    runner: Option<CollectorRunner>,
    task: Option<JoinHandle<()>>,
}

/// Read-only view over the registered collectors' health cells
#[derive(Clone, Default)]
pub struct HealthView {
    handles: Arc<Vec<HealthHandle>>,
}

impl HealthView {
    pub fn new(handles: Vec<HealthHandle>) -> Self {
        Self {
            handles: Arc::new(handles),
        }
    }

    pub fn snapshot(&self) -> OrchestratorHealth {
        OrchestratorHealth::from_snapshots(self.handles.iter().map(HealthHandle::snapshot))
    }
}

/// Owns the named collectors and starts/stops them as a group.
#[derive(Default)]
pub struct Orchestrator {
    collectors: BTreeMap<String, Entry>,
    stop_timeout: Option<Duration>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound `stop_all`'s wait per collector; tasks still running afterwards are aborted
    pub fn with_stop_timeout(mut self, stop_timeout: Option<Duration>) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Store a collector by name. Replaces an unstarted collector of the same name.
    pub fn register(&mut self, runner: CollectorRunner) {
        let name = runner.name().to_string();
        if let Some(existing) = self.collectors.get(&name) {
            if existing.task.is_some() {
                warn!(collector = %name, "Collector already running, registration ignored");
                return;
            }
            warn!(collector = %name, "Replacing registered collector");
        }
        self.collectors.insert(
            name,
            Entry {
                health: runner.health_handle(),
                stop: runner.stop_token(),
                runner: Some(runner),
                task: None,
            },
        );
    }

    pub fn names(&self) -> Vec<String> {
        self.collectors.keys().cloned().collect()
    }

    /// Initialize and spawn every registered collector. Returns how many started.
    pub async fn start_all(&mut self) -> usize {
        let mut started = 0;
        for (name, entry) in self.collectors.iter_mut() {
            let Some(mut runner) = entry.runner.take() else {
                continue;
            };
            if let Err(e) = runner.initialize().await {
                error!(collector = %name, error = %e, "Failed to initialize collector");
                entry.health.record_failure(0, e.to_string());
                entry.health.set_state(LifecycleState::Stopped);
                continue;
            }
            entry.task = Some(tokio::spawn(async move {
                runner.run().await;
            }));
            started += 1;
        }
        info!(started, total = self.collectors.len(), "Collectors started");
        started
    }

    /// Signal every collector, then wait for their tasks to finish.
    pub async fn stop_all(&mut self) {
        for entry in self.collectors.values() {
            entry.stop.cancel();
        }

        let stop_timeout = self.stop_timeout;
        for (name, entry) in self.collectors.iter_mut() {
            let Some(mut task) = entry.task.take() else {
                continue;
            };
            let joined = match stop_timeout {
                Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(collector = %name, timeout = ?limit, "Collector did not stop in time, aborting");
                        task.abort();
                        entry.health.set_state(LifecycleState::Stopped);
                        continue;
                    }
                },
                None => task.await,
            };
            if let Err(e) = joined {
                error!(collector = %name, error = %e, "Collector task panicked");
            }
        }
        info!("All collectors stopped");
    }

    pub fn health(&self) -> OrchestratorHealth {
        self.health_view().snapshot()
    }

    pub fn health_view(&self) -> HealthView {
        HealthView::new(self.collectors.values().map(|e| e.health.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RetryPolicy;
    use crate::test_helpers::{ScriptedAdapter, Step};
    use std::sync::atomic::Ordering;
    use tickhub_store::MemoryStore;

    fn runner(name: &str, script: Vec<Step>, store: Arc<MemoryStore>) -> CollectorRunner {
        CollectorRunner::new(name, Box::new(ScriptedAdapter::new(script)), store, RetryPolicy::default())
    }

    #[tokio::test]
    async fn test_register_has_no_side_effect() {
        let mut orchestrator = Orchestrator::new();
        orchestrator.register(runner("a", vec![], Arc::new(MemoryStore::new())));

        let health = orchestrator.health();
        assert_eq!(health.total_collectors, 1);
        assert_eq!(health.collectors["a"].lifecycle_state, LifecycleState::Idle);
    }

    #[tokio::test]
    async fn test_start_and_stop_all() {
        let store = Arc::new(MemoryStore::new());
        let a = ScriptedAdapter::new(vec![Step::CollectUntilStop]);
        let b = ScriptedAdapter::new(vec![Step::CollectUntilStop]);
        let (ca, cb) = (a.counters(), b.counters());

        let mut orchestrator = Orchestrator::new();
        orchestrator.register(CollectorRunner::new("a", Box::new(a), store.clone(), RetryPolicy::default()));
        orchestrator.register(CollectorRunner::new("b", Box::new(b), store, RetryPolicy::default()));

        assert_eq!(orchestrator.start_all().await, 2);
        while orchestrator.health().running_collectors < 2 {
            tokio::task::yield_now().await;
        }

        orchestrator.stop_all().await;
        let health = orchestrator.health();
        assert_eq!(health.running_collectors, 0);
        assert!(health
            .collectors
            .values()
            .all(|h| h.lifecycle_state == LifecycleState::Stopped));
        assert_eq!(ca.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(cb.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_initialize_failure_does_not_block_others() {
        let broken = Arc::new(MemoryStore::new());
        broken.set_unavailable(true);

        let mut orchestrator = Orchestrator::new();
        orchestrator.register(runner("broken", vec![], broken));
        orchestrator.register(runner("ok", vec![Step::CollectUntilStop], Arc::new(MemoryStore::new())));

        assert_eq!(orchestrator.start_all().await, 1);
        let health = orchestrator.health();
        assert_eq!(health.collectors["broken"].lifecycle_state, LifecycleState::Stopped);
        assert!(health.collectors["broken"].last_error.is_some());

        orchestrator.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_timeout_aborts_unresponsive_collector() {
        let mut orchestrator =
            Orchestrator::new().with_stop_timeout(Some(Duration::from_secs(2)));
        orchestrator.register(runner("stuck", vec![Step::CollectForever], Arc::new(MemoryStore::new())));

        orchestrator.start_all().await;
        while orchestrator.health().running_collectors < 1 {
            tokio::task::yield_now().await;
        }

        orchestrator.stop_all().await;
        assert_eq!(
            orchestrator.health().collectors["stuck"].lifecycle_state,
            LifecycleState::Stopped
        );
    }

    #[tokio::test]
    async fn test_health_view_reads_without_orchestrator() {
        let mut orchestrator = Orchestrator::new();
        orchestrator.register(runner("a", vec![Step::CollectUntilStop], Arc::new(MemoryStore::new())));
        let view = orchestrator.health_view();

        orchestrator.start_all().await;
        while view.snapshot().running_collectors < 1 {
            tokio::task::yield_now().await;
        }
        orchestrator.stop_all().await;
        assert_eq!(view.snapshot().running_collectors, 0);
    }
}
