//! Lifecycle reaper
//!
//! Background task that sweeps the context registry on a fixed interval:
//! idle contexts past the TTL are destroyed, then the global load is checked
//! against the soft and hard thresholds.

use crate::context::{ContextManager, LoadLevel};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What one sweep did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub reaped: usize,
    pub load: LoadLevel,
}

pub struct LifecycleReaper {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl LifecycleReaper {
    /// Start sweeping every `interval`; the first sweep runs one interval
    /// after spawning.
    pub fn spawn(contexts: Arc<ContextManager>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = sweep(&contexts).await;
                        tracing::debug!(reaped = report.reaped, load = ?report.load, "Reaper sweep finished");
                    }
                }
            }
            tracing::debug!("Lifecycle reaper stopped");
        });

        tracing::info!(interval = ?interval, "Lifecycle reaper started");
        Self { cancel, task }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop ticking and wait for an in-progress sweep to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Lifecycle reaper ended abnormally");
        }
    }
}

/// One sweep: routine idle reaping, then load evaluation.
pub async fn sweep(contexts: &ContextManager) -> SweepReport {
    let reaped = contexts.reap_idle().await;
    let load = contexts.evaluate_load(None).await;
    SweepReport { reaped, load }
}
