//! Stats & health aggregation
//!
//! Global and per-extension counters. Context counters are only changed by
//! the context manager while it holds its registry lock, so
//! `active_contexts` always equals the number of live contexts.

use crate::error::SandboxErrorKind;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Error rate above which the service reports itself degraded
pub const DEGRADED_ERROR_RATE: f64 = 0.5;

/// Executions needed before the error rate counts towards health
pub const MIN_EXECUTIONS_FOR_ERROR_RATE: u64 = 10;

/// Per-extension usage statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionStats {
    pub executions: u64,
    pub errors: u64,
    #[serde(with = "humantime_serde")]
    pub average_execution_time: Duration,
    pub memory_usage: u64,
    pub active_contexts: usize,
    pub total_contexts: u64,
    #[serde(skip)]
    total_execution_time: Duration,
}

impl ExtensionStats {
    fn record(&mut self, elapsed: Duration, memory_delta: i64, failed: bool) {
        self.executions += 1;
        if failed {
            self.errors += 1;
        }
        self.total_execution_time += elapsed;
        self.average_execution_time = mean(self.total_execution_time, self.executions);
        self.memory_usage += positive(memory_delta);
    }
}

/// Aggregate view returned by `get_stats`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStats {
    pub total_contexts: u64,
    pub active_contexts: usize,
    pub total_executions: u64,
    #[serde(with = "humantime_serde")]
    pub average_execution_time: Duration,
    pub memory_usage: u64,
    pub error_rate: f64,
    pub total_errors: u64,
    pub errors_by_kind: BTreeMap<SandboxErrorKind, u64>,
    #[serde(with = "humantime_serde")]
    pub uptime: Duration,
    pub extensions: BTreeMap<String, ExtensionStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub active_contexts: usize,
    pub soft_limit: usize,
    pub hard_limit: usize,
    pub error_rate: f64,
}

#[derive(Debug, Default)]
struct Totals {
    total_contexts: u64,
    active_contexts: usize,
    total_executions: u64,
    total_execution_time: Duration,
    memory_usage: u64,
    total_errors: u64,
    errors_by_kind: BTreeMap<SandboxErrorKind, u64>,
    extensions: HashMap<String, ExtensionStats>,
}

impl Totals {
    fn error_rate(&self) -> f64 {
        if self.total_executions == 0 {
            0.0
        } else {
            self.total_errors as f64 / self.total_executions as f64
        }
    }
}

#[derive(Debug)]
pub struct StatsAggregator {
    totals: Mutex<Totals>,
    started_at: Instant,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsAggregator {
    pub fn new() -> Self {
        let totals = Totals {
            errors_by_kind: SandboxErrorKind::ALL.iter().map(|kind| (*kind, 0)).collect(),
            ..Default::default()
        };
        Self {
            totals: Mutex::new(totals),
            started_at: Instant::now(),
        }
    }

    /// Register a new live context; creates the extension bucket lazily.
    pub(crate) fn context_created(&self, extension_id: &str) {
        let mut totals = self.totals.lock();
        totals.total_contexts += 1;
        totals.active_contexts += 1;
        let bucket = totals.extensions.entry(extension_id.to_string()).or_default();
        bucket.total_contexts += 1;
        bucket.active_contexts += 1;
    }

    /// Must be called exactly once per created context.
    pub(crate) fn context_destroyed(&self, extension_id: &str) {
        let mut totals = self.totals.lock();
        totals.active_contexts = totals.active_contexts.saturating_sub(1);
        if let Some(bucket) = totals.extensions.get_mut(extension_id) {
            bucket.active_contexts = bucket.active_contexts.saturating_sub(1);
        }
    }

    /// Record one finished execution, successful or not.
    pub(crate) fn record_execution(
        &self,
        extension_id: &str,
        elapsed: Duration,
        memory_delta: i64,
        failure: Option<SandboxErrorKind>,
    ) {
        let mut totals = self.totals.lock();
        totals.total_executions += 1;
        totals.total_execution_time += elapsed;
        totals.memory_usage += positive(memory_delta);
        if let Some(kind) = failure {
            totals.total_errors += 1;
            *totals.errors_by_kind.entry(kind).or_insert(0) += 1;
        }
        totals
            .extensions
            .entry(extension_id.to_string())
            .or_default()
            .record(elapsed, memory_delta, failure.is_some());
    }

    pub fn active_contexts(&self) -> usize {
        self.totals.lock().active_contexts
    }

    pub fn extension(&self, extension_id: &str) -> Option<ExtensionStats> {
        self.totals.lock().extensions.get(extension_id).cloned()
    }

    pub fn snapshot(&self) -> SandboxStats {
        let totals = self.totals.lock();
        SandboxStats {
            total_contexts: totals.total_contexts,
            active_contexts: totals.active_contexts,
            total_executions: totals.total_executions,
            average_execution_time: mean(totals.total_execution_time, totals.total_executions),
            memory_usage: totals.memory_usage,
            error_rate: totals.error_rate(),
            total_errors: totals.total_errors,
            errors_by_kind: totals.errors_by_kind.clone(),
            uptime: self.started_at.elapsed(),
            extensions: totals
                .extensions
                .iter()
                .map(|(id, stats)| (id.clone(), stats.clone()))
                .collect(),
        }
    }

    pub fn health(&self, soft_limit: usize, hard_limit: usize) -> HealthReport {
        let totals = self.totals.lock();
        let error_rate = totals.error_rate();
        let active = totals.active_contexts;

        let status = if active >= hard_limit {
            HealthStatus::Critical
        } else if active >= soft_limit
            || (totals.total_executions >= MIN_EXECUTIONS_FOR_ERROR_RATE
                && error_rate > DEGRADED_ERROR_RATE)
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            active_contexts: active,
            soft_limit,
            hard_limit,
            error_rate,
        }
    }
}

fn mean(total: Duration, count: u64) -> Duration {
    match u32::try_from(count) {
        Ok(0) => Duration::ZERO,
        Ok(count) => total / count,
        Err(_) => Duration::from_secs_f64(total.as_secs_f64() / count as f64),
    }
}

fn positive(delta: i64) -> u64 {
    u64::try_from(delta).unwrap_or(0)
}
