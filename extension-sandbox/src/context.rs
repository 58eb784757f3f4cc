//! Context manager
//!
//! Owns every live [`ContextSlot`]. The registry only ever holds active
//! contexts: destroying one removes it, flips its `active` flag and
//! decrements the aggregate counters in the same critical section, so a
//! second destroy finds nothing and returns `false`.
//!
//! Lock order is registry, then slot state, then stats.

use crate::config::{ContextOptions, SandboxConfig, SandboxOptions};
use crate::error::{AdmissionError, SandboxError, SandboxResult};
use crate::events::{ContextSummary, DestroyReason, EventBus, LifecycleEvent};
use crate::isolate::{Isolate, RunBudget, RunOutput};
use crate::policy::CapabilityPolicy;
use crate::quota::QuotaController;
use crate::stats::StatsAggregator;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Mutable bookkeeping of one context
#[derive(Debug)]
struct ContextState {
    active: bool,
    executing: bool,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    last_activity_at: Instant,
    execution_count: u64,
    memory_used: u64,
    cpu_time: Duration,
    errors: VecDeque<SandboxError>,
}

impl ContextState {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            active: true,
            executing: false,
            created_at: now,
            last_activity: now,
            last_activity_at: Instant::now(),
            execution_count: 0,
            memory_used: 0,
            cpu_time: Duration::ZERO,
            errors: VecDeque::new(),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
        self.last_activity_at = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity_at.elapsed()
    }
}

/// One isolated execution environment bound to a single extension
pub struct ContextSlot {
    id: String,
    extension_id: String,
    user_id: Option<String>,
    options: SandboxOptions,
    created: Instant,
    max_errors: usize,
    state: Mutex<ContextState>,
    isolate: Arc<Mutex<Isolate>>,
    budget: Arc<RunBudget>,
    /// Serializes executions on this context
    exec_lock: tokio::sync::Mutex<()>,
    /// Run that outlived its timeout and still owns the interpreter
    abandoned: Mutex<Option<JoinHandle<RunOutput>>>,
}

impl std::fmt::Debug for ContextSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextSlot")
            .field("id", &self.id)
            .field("extension_id", &self.extension_id)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl ContextSlot {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn options(&self) -> &SandboxOptions {
        &self.options
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub(crate) fn isolate(&self) -> &Arc<Mutex<Isolate>> {
        &self.isolate
    }

    pub(crate) fn budget(&self) -> &Arc<RunBudget> {
        &self.budget
    }

    pub(crate) async fn serialize(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.exec_lock.lock().await
    }

    pub(crate) fn park_abandoned(&self, handle: JoinHandle<RunOutput>) {
        *self.abandoned.lock() = Some(handle);
    }

    /// Wait for a timed-out run to release the interpreter.
    pub(crate) async fn settle_abandoned(&self) {
        let handle = self.abandoned.lock().take();
        if let Some(handle) = handle {
            if handle.await.is_err() {
                tracing::warn!(context_id = %self.id, "Abandoned execution ended abnormally");
            }
            self.budget.disarm();
        }
    }

    /// Mark the start of an execution; refuses destroyed contexts.
    pub(crate) fn begin_execution(&self) -> Result<(), AdmissionError> {
        let mut state = self.state.lock();
        if !state.active {
            return Err(AdmissionError::ContextInactive(self.id.clone()));
        }
        state.executing = true;
        state.touch();
        Ok(())
    }

    fn retire(&self) -> ContextSummary {
        let mut state = self.state.lock();
        state.active = false;
        ContextSummary {
            execution_count: state.execution_count,
            memory_used: state.memory_used,
            cpu_time: state.cpu_time,
            error_count: state.errors.len(),
            lifetime: self.created.elapsed(),
        }
    }

    fn snapshot(&self) -> SandboxContext {
        let state = self.state.lock();
        SandboxContext {
            id: self.id.clone(),
            extension_id: self.extension_id.clone(),
            user_id: self.user_id.clone(),
            is_active: state.active,
            created_at: state.created_at,
            last_activity: state.last_activity,
            execution_count: state.execution_count,
            memory_used: state.memory_used,
            cpu_time: state.cpu_time,
            errors: state.errors.iter().cloned().collect(),
            options: self.options.clone(),
        }
    }
}

/// Defensive copy of a context handed to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxContext {
    pub id: String,
    pub extension_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub execution_count: u64,
    pub memory_used: u64,
    #[serde(with = "humantime_serde")]
    pub cpu_time: Duration,
    pub errors: Vec<SandboxError>,
    pub options: SandboxOptions,
}

/// Outcome of one finished execution, as the manager books it
#[derive(Debug)]
pub(crate) struct ExecutionRecord {
    pub elapsed: Duration,
    pub memory_delta: i64,
    pub error: Option<SandboxError>,
}

/// Load level observed by [`ContextManager::evaluate_load`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadLevel {
    Normal,
    /// Soft threshold reached; warning only
    High,
    /// Hard threshold reached; emergency cleanup ran
    Critical { destroyed: usize },
}

pub struct ContextManager {
    contexts: RwLock<HashMap<String, Arc<ContextSlot>>>,
    config: Arc<SandboxConfig>,
    policy: CapabilityPolicy,
    quota: Arc<QuotaController>,
    stats: Arc<StatsAggregator>,
    events: EventBus,
}

impl ContextManager {
    pub fn new(
        config: Arc<SandboxConfig>,
        policy: CapabilityPolicy,
        quota: Arc<QuotaController>,
        stats: Arc<StatsAggregator>,
        events: EventBus,
    ) -> Self {
        Self {
            contexts: RwLock::new(HashMap::new()),
            config,
            policy,
            quota,
            stats,
            events,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Create a context for `extension_id` and return its id.
    ///
    /// Load thresholds are evaluated for the requesting extension first.
    /// The per-extension ceiling is checked under the registry write lock
    /// so parallel creates cannot overshoot it.
    pub async fn create_context(
        &self,
        extension_id: &str,
        user_id: Option<&str>,
        overrides: &ContextOptions,
    ) -> SandboxResult<String> {
        self.evaluate_load(Some(extension_id)).await;

        {
            let contexts = self.contexts.read().await;
            self.quota
                .admit_context(extension_id, count_for(&contexts, extension_id))?;
        }

        let id = Uuid::new_v4().to_string();
        let options = self.config.resolve_options(overrides);
        let env = self.policy.build(extension_id, &id, &options);
        let budget = Arc::new(RunBudget::new());
        let isolate = Isolate::new(&env, options.memory_limit, budget.clone())?;

        let slot = Arc::new(ContextSlot {
            id: id.clone(),
            extension_id: extension_id.to_string(),
            user_id: user_id.map(str::to_string),
            options,
            created: Instant::now(),
            max_errors: self.config.max_errors_per_context,
            state: Mutex::new(ContextState::new()),
            isolate: Arc::new(Mutex::new(isolate)),
            budget,
            exec_lock: tokio::sync::Mutex::new(()),
            abandoned: Mutex::new(None),
        });

        {
            let mut contexts = self.contexts.write().await;
            self.quota
                .admit_context(extension_id, count_for(&contexts, extension_id))?;
            contexts.insert(id.clone(), slot);
            self.stats.context_created(extension_id);
        }

        tracing::info!(context_id = %id, extension_id, "Sandbox context created");
        self.events.publish(LifecycleEvent::ContextCreated {
            context_id: id.clone(),
            extension_id: extension_id.to_string(),
            timestamp: Utc::now(),
        });

        Ok(id)
    }

    /// Destroy one context. Returns `false` for unknown or already
    /// destroyed ids.
    pub async fn destroy_context(&self, context_id: &str, reason: DestroyReason) -> bool {
        let retired = {
            let mut contexts = self.contexts.write().await;
            match contexts.remove(context_id) {
                Some(slot) => {
                    let summary = slot.retire();
                    self.stats.context_destroyed(&slot.extension_id);
                    Some((slot, summary))
                }
                None => None,
            }
        };

        match retired {
            Some((slot, summary)) => {
                self.announce_destroyed(&slot, reason, summary);
                true
            }
            None => false,
        }
    }

    /// Live slot for the engine; unknown ids are an admission rejection.
    pub async fn slot(&self, context_id: &str) -> Result<Arc<ContextSlot>, AdmissionError> {
        self.contexts
            .read()
            .await
            .get(context_id)
            .cloned()
            .ok_or_else(|| AdmissionError::ContextNotFound(context_id.to_string()))
    }

    pub async fn get_context(&self, context_id: &str) -> Option<SandboxContext> {
        self.contexts
            .read()
            .await
            .get(context_id)
            .map(|slot| slot.snapshot())
    }

    pub async fn get_active_contexts(&self) -> Vec<SandboxContext> {
        let contexts = self.contexts.read().await;
        let mut snapshots: Vec<_> = contexts.values().map(|slot| slot.snapshot()).collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        snapshots
    }

    pub async fn get_extension_contexts(&self, extension_id: &str) -> Vec<SandboxContext> {
        self.get_active_contexts()
            .await
            .into_iter()
            .filter(|context| context.extension_id == extension_id)
            .collect()
    }

    pub async fn active_count(&self) -> usize {
        self.contexts.read().await.len()
    }

    /// Destroy every context of one extension, e.g. when it is disabled.
    pub async fn kill_extension_contexts(&self, extension_id: &str) -> usize {
        let destroyed = self
            .destroy_where(DestroyReason::ExtensionKilled, |slot, _| {
                slot.extension_id == extension_id
            })
            .await;
        if destroyed > 0 {
            tracing::info!(extension_id, destroyed, "Killed all contexts of extension");
        }
        destroyed
    }

    /// Destroy contexts idle (and not executing) for longer than the idle TTL.
    pub async fn reap_idle(&self) -> usize {
        let ttl = self.config.idle_ttl;
        let reaped = self
            .destroy_where(DestroyReason::Idle, |_, state| {
                !state.executing && state.idle_for() > ttl
            })
            .await;
        if reaped > 0 {
            tracing::info!(reaped, idle_ttl = ?ttl, "Reaped idle sandbox contexts");
        }
        reaped
    }

    /// Compare global load to the soft and hard thresholds.
    ///
    /// Above the hard threshold the idle contexts of `target` (or of the
    /// extension holding the most contexts when `None`) are destroyed.
    pub async fn evaluate_load(&self, target: Option<&str>) -> LoadLevel {
        let active = self.stats.active_contexts();

        if active >= self.config.hard_context_limit {
            let extension_id = match target {
                Some(extension_id) => Some(extension_id.to_string()),
                None => self.most_loaded_extension().await,
            };
            let Some(extension_id) = extension_id else {
                return LoadLevel::Critical { destroyed: 0 };
            };
            tracing::error!(
                active,
                hard_limit = self.config.hard_context_limit,
                extension_id = %extension_id,
                "Sandbox context count above hard limit, running emergency cleanup"
            );
            let destroyed = self.emergency_cleanup(&extension_id).await;
            return LoadLevel::Critical { destroyed };
        }

        if active >= self.config.soft_context_limit {
            tracing::warn!(
                active,
                soft_limit = self.config.soft_context_limit,
                extension_id = target.unwrap_or("-"),
                "High sandbox load"
            );
            return LoadLevel::High;
        }

        LoadLevel::Normal
    }

    /// Destroy contexts of `extension_id` idle past the emergency window.
    pub async fn emergency_cleanup(&self, extension_id: &str) -> usize {
        let window = self.config.emergency_idle;
        self.destroy_where(DestroyReason::Emergency, |slot, state| {
            slot.extension_id == extension_id && !state.executing && state.idle_for() > window
        })
        .await
    }

    /// Destroy every context, aborting in-flight executions.
    pub async fn emergency_stop(&self) -> usize {
        let drained: Vec<(Arc<ContextSlot>, ContextSummary)> = {
            let mut contexts = self.contexts.write().await;
            contexts
                .drain()
                .map(|(_, slot)| {
                    slot.budget.terminate();
                    let summary = slot.retire();
                    self.stats.context_destroyed(&slot.extension_id);
                    (slot, summary)
                })
                .collect()
        };

        let destroyed = drained.len();
        for (slot, summary) in drained {
            self.announce_destroyed(&slot, DestroyReason::EmergencyStop, summary);
        }

        tracing::error!(destroyed, "Emergency stop destroyed all sandbox contexts");
        self.events.publish(LifecycleEvent::EmergencyStop {
            destroyed,
            timestamp: Utc::now(),
        });
        destroyed
    }

    /// Single bookkeeping step for a finished execution, reached from the
    /// success and the failure path alike. A context destroyed meanwhile
    /// makes this a no-op that reports the context as inactive.
    pub(crate) fn finalize_execution(
        &self,
        slot: &ContextSlot,
        record: ExecutionRecord,
    ) -> Result<(), AdmissionError> {
        {
            let mut state = slot.state.lock();
            state.executing = false;
            if !state.active {
                return Err(AdmissionError::ContextInactive(slot.id.clone()));
            }
            state.execution_count += 1;
            state.cpu_time += record.elapsed;
            state.memory_used += u64::try_from(record.memory_delta).unwrap_or(0);
            state.touch();
            if let Some(error) = &record.error {
                if slot.max_errors > 0 {
                    while state.errors.len() >= slot.max_errors {
                        state.errors.pop_front();
                    }
                    state.errors.push_back(error.clone());
                }
            }
        }

        self.stats.record_execution(
            &slot.extension_id,
            record.elapsed,
            record.memory_delta,
            record.error.as_ref().map(|error| error.kind),
        );
        Ok(())
    }

    async fn destroy_where<F>(&self, reason: DestroyReason, select: F) -> usize
    where
        F: Fn(&ContextSlot, &ContextState) -> bool,
    {
        let retired: Vec<(Arc<ContextSlot>, ContextSummary)> = {
            let mut contexts = self.contexts.write().await;
            let chosen: Vec<String> = contexts
                .values()
                .filter(|slot| {
                    let state = slot.state.lock();
                    state.active && select(slot, &state)
                })
                .map(|slot| slot.id.clone())
                .collect();

            chosen
                .iter()
                .filter_map(|id| contexts.remove(id))
                .map(|slot| {
                    let summary = slot.retire();
                    self.stats.context_destroyed(&slot.extension_id);
                    (slot, summary)
                })
                .collect()
        };

        let count = retired.len();
        for (slot, summary) in retired {
            self.announce_destroyed(&slot, reason, summary);
        }
        count
    }

    async fn most_loaded_extension(&self) -> Option<String> {
        let contexts = self.contexts.read().await;
        let mut per_extension: BTreeMap<&str, usize> = BTreeMap::new();
        for slot in contexts.values() {
            *per_extension.entry(slot.extension_id.as_str()).or_insert(0) += 1;
        }
        per_extension
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(extension_id, _)| extension_id.to_string())
    }

    fn announce_destroyed(&self, slot: &ContextSlot, reason: DestroyReason, summary: ContextSummary) {
        tracing::info!(
            context_id = %slot.id,
            extension_id = %slot.extension_id,
            reason = reason.as_str(),
            executions = summary.execution_count,
            errors = summary.error_count,
            "Sandbox context destroyed"
        );
        self.events.publish(LifecycleEvent::ContextDestroyed {
            context_id: slot.id.clone(),
            extension_id: slot.extension_id.clone(),
            reason,
            summary,
        });
    }
}

fn count_for(contexts: &HashMap<String, Arc<ContextSlot>>, extension_id: &str) -> usize {
    contexts
        .values()
        .filter(|slot| slot.extension_id == extension_id)
        .count()
}
