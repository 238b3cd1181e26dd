//! Async façade over [`ProcessSupervisor`]
//!
//! The supervisor blocks; async callers must not. Every operation runs on
//! tokio's blocking pool, serialized by one mutex, so there is never more
//! than one start/stop in flight. State snapshots come from a watch channel
//! and never wait on that mutex.

use crate::config::MonitorPolicy;
use crate::error::SupervisorError;
use crate::monitor::{self, FailureTracker};
use crate::supervisor::{
    HealthReport, IndexRequest, ProcessSupervisor, SearchRequest, StateTransition, SupervisorState,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct SupervisorService {
    supervisor: Arc<Mutex<ProcessSupervisor>>,
    tracker: Arc<Mutex<FailureTracker>>,
    state: watch::Receiver<SupervisorState>,
    policy: MonitorPolicy,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SupervisorService {
    pub fn new(supervisor: ProcessSupervisor) -> Self {
        let policy = supervisor.config().monitor;
        let state = supervisor.watch_state();
        Self {
            supervisor: Arc::new(Mutex::new(supervisor)),
            tracker: Arc::new(Mutex::new(FailureTracker::new(policy))),
            state,
            policy,
        }
    }

    pub fn policy(&self) -> MonitorPolicy {
        self.policy
    }

    pub fn state(&self) -> SupervisorState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.clone()
    }

    pub async fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.blocking(|s| s.subscribe()).await
    }

    pub async fn health(&self) -> Option<HealthReport> {
        self.blocking(|s| s.health().cloned()).await
    }

    pub async fn pid(&self) -> Option<u32> {
        self.blocking(|s| s.pid()).await
    }

    async fn blocking<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut ProcessSupervisor) -> R + Send + 'static,
        R: Send + 'static,
    {
        let supervisor = self.supervisor.clone();
        let task = tokio::task::spawn_blocking(move || f(&mut lock(&supervisor)));
        match task.await {
            Ok(r) => r,
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }

    pub(crate) fn tracker<R>(&self, f: impl FnOnce(&mut FailureTracker) -> R) -> R {
        f(&mut lock(&self.tracker))
    }

    /// User-initiated start: re-arms the automatic restart budget
    pub async fn start(&self) -> Result<(), SupervisorError> {
        self.tracker(|t| t.rearm());
        self.blocking(|s| s.start()).await
    }

    pub async fn stop(&self) {
        self.blocking(|s| s.stop()).await
    }

    pub async fn restart(&self) -> Result<(), SupervisorError> {
        self.tracker(|t| t.rearm());
        self.blocking(|s| s.restart()).await
    }

    /// Restart on the monitor's behalf, spending from the budget
    pub(crate) async fn restart_supervised(&self) -> Result<(), SupervisorError> {
        self.blocking(|s| s.restart()).await
    }

    pub(crate) async fn fail(&self, reason: String) {
        self.blocking(move |s| s.fail(reason)).await
    }

    pub async fn probe(&self) -> Result<HealthReport, SupervisorError> {
        self.blocking(|s| s.probe()).await
    }

    pub async fn search(&self, request: SearchRequest) -> Result<serde_json::Value, SupervisorError> {
        self.blocking(move |s| s.search(&request)).await
    }

    pub async fn index(&self, request: IndexRequest) -> Result<serde_json::Value, SupervisorError> {
        self.blocking(move |s| s.index(&request)).await
    }

    /// Run the health monitor until `shutdown` flips to `true`
    pub fn spawn_monitor(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(monitor::run(self.clone(), shutdown))
    }
}
