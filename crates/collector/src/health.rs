use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Starting,
    Running,
    Error,
    Stopping,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Error => "error",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        }
    }

    /// Numeric value exported on the state gauge
    pub fn as_gauge(&self) -> i64 {
        match self {
            LifecycleState::Idle => 0,
            LifecycleState::Starting => 1,
            LifecycleState::Running => 2,
            LifecycleState::Error => 3,
            LifecycleState::Stopping => 4,
            LifecycleState::Stopped => 5,
        }
    }
}

/// Point-in-time view of one collector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectorHealth {
    pub name: String,
    pub exchange: String,
    pub lifecycle_state: LifecycleState,
    pub healthy: bool,
    pub last_collection_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub topic_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorHealth {
    pub collectors: BTreeMap<String, CollectorHealth>,
    pub total_collectors: usize,
    pub running_collectors: usize,
}

impl OrchestratorHealth {
    pub fn from_snapshots(snapshots: impl IntoIterator<Item = CollectorHealth>) -> Self {
        let collectors: BTreeMap<String, CollectorHealth> = snapshots
            .into_iter()
            .map(|h| (h.name.clone(), h))
            .collect();
        let running_collectors = collectors
            .values()
            .filter(|h| h.lifecycle_state == LifecycleState::Running)
            .count();
        Self {
            total_collectors: collectors.len(),
            running_collectors,
            collectors,
        }
    }
}

struct HealthState {
    lifecycle: LifecycleState,
    retry_count: u32,
    last_error: Option<String>,
    topic_count: usize,
}

struct HealthInner {
    name: String,
    exchange: String,
    state: Mutex<HealthState>,
    last_write_epoch_secs: Arc<AtomicU64>,
}

/// Health cell shared between a runner (writer) and its readers.
///
/// The lock only guards plain field copies, so readers never wait on a
/// running collector.
#[derive(Clone)]
pub struct HealthHandle {
    inner: Arc<HealthInner>,
}

impl HealthHandle {
    pub fn new(name: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(HealthInner {
                name: name.into(),
                exchange: exchange.into(),
                state: Mutex::new(HealthState {
                    lifecycle: LifecycleState::Idle,
                    retry_count: 0,
                    last_error: None,
                    topic_count: 0,
                }),
                last_write_epoch_secs: Arc::new(AtomicU64::new(0)),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HealthState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().lifecycle
    }

    pub fn activity_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.inner.last_write_epoch_secs)
    }

    pub(crate) fn set_state(&self, lifecycle: LifecycleState) {
        self.lock().lifecycle = lifecycle;
    }

    pub(crate) fn set_topic_count(&self, count: usize) {
        self.lock().topic_count = count;
    }

    pub(crate) fn record_failure(&self, retry_count: u32, error: String) {
        let mut state = self.lock();
        state.retry_count = retry_count;
        state.last_error = Some(error);
    }

    pub(crate) fn reset_failures(&self) {
        self.lock().retry_count = 0;
    }

    pub fn snapshot(&self) -> CollectorHealth {
        let last_write = self.inner.last_write_epoch_secs.load(Ordering::SeqCst);
        let state = self.lock();
        CollectorHealth {
            name: self.inner.name.clone(),
            exchange: self.inner.exchange.clone(),
            lifecycle_state: state.lifecycle,
            healthy: state.lifecycle == LifecycleState::Running,
            last_collection_time: (last_write > 0)
                .then(|| DateTime::from_timestamp(last_write as i64, 0))
                .flatten(),
            retry_count: state.retry_count,
            last_error: state.last_error.clone(),
            topic_count: state.topic_count,
        }
    }
}
