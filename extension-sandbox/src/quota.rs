//! Admission control
//!
//! Fixed one-minute windows aligned to wall-clock minute boundaries, keyed by
//! (user, extension). State is in-memory and owned solely by the controller.
//! The per-extension context ceiling is a pure check the context manager
//! applies while it holds its registry lock.

use crate::error::AdmissionError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Window map size above which stale windows are pruned
const PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    user_id: String,
    extension_id: String,
    minute: i64,
}

/// Quota configuration
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    pub enabled: bool,
    pub executions_per_minute: u32,
    pub max_contexts_per_extension: usize,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            executions_per_minute: 10,
            max_contexts_per_extension: 3,
        }
    }
}

pub struct QuotaController {
    windows: Arc<RwLock<HashMap<WindowKey, u32>>>,
    config: QuotaConfig,
}

impl QuotaController {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            windows: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Count one execution for (user, extension) or reject it.
    pub async fn check_execution(&self, user_id: &str, extension_id: &str) -> Result<(), AdmissionError> {
        self.check_execution_at(user_id, extension_id, Utc::now()).await
    }

    pub async fn check_execution_at(
        &self,
        user_id: &str,
        extension_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AdmissionError> {
        if !self.config.enabled {
            return Ok(());
        }

        let minute = minute_of(now);
        let mut windows = self.windows.write().await;

        if windows.len() > PRUNE_THRESHOLD {
            windows.retain(|key, _| key.minute >= minute);
        }

        let count = windows
            .entry(WindowKey {
                user_id: user_id.to_string(),
                extension_id: extension_id.to_string(),
                minute,
            })
            .or_insert(0);

        if *count >= self.config.executions_per_minute {
            let retry_after = until_next_minute(now);
            tracing::warn!(
                user_id,
                extension_id,
                limit = self.config.executions_per_minute,
                retry_after_ms = retry_after.as_millis() as u64,
                "Execution rate limit exceeded"
            );
            return Err(AdmissionError::RateLimited {
                extension_id: extension_id.to_string(),
                limit: self.config.executions_per_minute,
                retry_after,
            });
        }

        *count += 1;
        Ok(())
    }

    /// Executions left for (user, extension) in the current window
    pub async fn remaining(&self, user_id: &str, extension_id: &str) -> u32 {
        self.remaining_at(user_id, extension_id, Utc::now()).await
    }

    pub async fn remaining_at(&self, user_id: &str, extension_id: &str, now: DateTime<Utc>) -> u32 {
        let key = WindowKey {
            user_id: user_id.to_string(),
            extension_id: extension_id.to_string(),
            minute: minute_of(now),
        };
        let windows = self.windows.read().await;
        let used = windows.get(&key).copied().unwrap_or(0);
        self.config.executions_per_minute.saturating_sub(used)
    }

    /// Forget every window of (user, extension)
    pub async fn reset(&self, user_id: &str, extension_id: &str) {
        let mut windows = self.windows.write().await;
        windows.retain(|key, _| !(key.user_id == user_id && key.extension_id == extension_id));
    }

    /// Reject a new context once the extension already has `active` live ones.
    pub fn admit_context(&self, extension_id: &str, active: usize) -> Result<(), AdmissionError> {
        if active >= self.config.max_contexts_per_extension {
            return Err(AdmissionError::ContextLimitReached {
                extension_id: extension_id.to_string(),
                limit: self.config.max_contexts_per_extension,
            });
        }
        Ok(())
    }

    #[cfg(test)]
    async fn window_count(&self) -> usize {
        self.windows.read().await.len()
    }
}

fn minute_of(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(60)
}

fn until_next_minute(now: DateTime<Utc>) -> Duration {
    let next_boundary_ms = (minute_of(now) + 1) * 60_000;
    let remaining_ms = next_boundary_ms - now.timestamp_millis();
    Duration::from_millis(u64::try_from(remaining_ms).unwrap_or(0))
}
