//! Recurring health checks
//!
//! Policy: `failure_threshold` consecutive probe failures (3 by default)
//! demote the backend to `Error`. The monitor then restarts it once, after
//! `restart_backoff` times the restart number. When the restart budget
//! (`max_auto_restarts`, 1 by default) is spent the error sticks until the
//! user starts the backend again, which re-arms the budget.

use crate::config::MonitorPolicy;
use crate::service::SupervisorService;
use crate::supervisor::SupervisorState;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    /// Failed, but below the threshold
    Degraded { consecutive: u32 },
    /// Threshold reached, restart after the backoff
    Restart { after: Duration, attempt: u32 },
    /// Threshold reached and no restarts left
    GiveUp,
}

/// Counts consecutive failures and spends the restart budget
#[derive(Debug, Clone)]
pub struct FailureTracker {
    policy: MonitorPolicy,
    consecutive: u32,
    restarts: u32,
}

impl FailureTracker {
    pub fn new(policy: MonitorPolicy) -> Self {
        Self {
            policy,
            consecutive: 0,
            restarts: 0,
        }
    }

    pub fn record_success(&mut self) -> Verdict {
        self.consecutive = 0;
        Verdict::Healthy
    }

    pub fn record_failure(&mut self) -> Verdict {
        self.consecutive += 1;
        if self.consecutive < self.policy.failure_threshold {
            return Verdict::Degraded {
                consecutive: self.consecutive,
            };
        }
        self.consecutive = 0;
        if self.restarts < self.policy.max_auto_restarts {
            self.restarts += 1;
            Verdict::Restart {
                after: self.policy.restart_backoff * self.restarts,
                attempt: self.restarts,
            }
        } else {
            Verdict::GiveUp
        }
    }

    /// A user-initiated start gets a fresh budget
    pub fn rearm(&mut self) {
        self.consecutive = 0;
        self.restarts = 0;
    }
}

/// Probe every `interval` until `shutdown` flips to `true`
pub async fn run(service: SupervisorService, mut shutdown: watch::Receiver<bool>) {
    let policy = service.policy();
    let mut ticker = tokio::time::interval(policy.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick fires immediately; start() has just checked health
    ticker.tick().await;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Health monitor stopping");
                    return;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        if service.state() != SupervisorState::Healthy {
            continue;
        }

        let verdict = match service.probe().await {
            Ok(report) => {
                debug!(index_count = report.index_count, "Health probe ok");
                service.tracker(|t| t.record_success())
            }
            Err(e) => {
                warn!(error = %e, "Health probe failed");
                service.tracker(|t| t.record_failure())
            }
        };

        match verdict {
            Verdict::Healthy | Verdict::Degraded { .. } => {}
            Verdict::Restart { after, attempt } => {
                let reason = format!(
                    "{} consecutive health checks failed",
                    policy.failure_threshold
                );
                service.fail(reason).await;
                info!(?after, attempt, "Restarting backend after backoff");
                tokio::select! {
                    _ = tokio::time::sleep(after) => {}
                    _ = shutdown.changed() => return,
                }
                if let Err(e) = service.restart_supervised().await {
                    error!(error = %e, "Automatic restart failed; backend stays down");
                }
            }
            Verdict::GiveUp => {
                let reason = format!(
                    "{} consecutive health checks failed and automatic restarts are exhausted",
                    policy.failure_threshold
                );
                error!("{reason}");
                service.fail(reason).await;
            }
        }
    }
}
