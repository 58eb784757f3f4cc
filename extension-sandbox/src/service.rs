//! Sandbox service
//!
//! Composition root for the engine. Transport layers hold one
//! [`SandboxService`] and call into it; every collaborator (registry, quota
//! windows, stats, event bus, reaper) is owned here rather than living in
//! global state.

use crate::classifier::RawFailure;
use crate::config::{ContextOptions, SandboxConfig};
use crate::context::{ContextManager, SandboxContext};
use crate::engine::{ExecutionEngine, SandboxExecutionResult};
use crate::error::{AdmissionError, SandboxResult, SandboxRuntimeError};
use crate::events::{DestroyReason, EventBus, LifecycleEvent};
use crate::host::{ExtensionStorage, HttpGateway, ReqwestGateway};
use crate::isolate::CodeUnit;
use crate::loader::{read_entry_blocking, ExtensionDescriptor};
use crate::policy::CapabilityPolicy;
use crate::quota::{QuotaConfig, QuotaController};
use crate::reaper::LifecycleReaper;
use crate::stats::{HealthReport, SandboxStats, StatsAggregator};
use logger_redacted::PiiRedactor;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Rate-limit key for contexts created without a user
pub const ANONYMOUS_USER: &str = "anonymous";

pub struct SandboxServiceBuilder {
    config: SandboxConfig,
    gateway: Option<Arc<dyn HttpGateway>>,
    storage: Option<Arc<ExtensionStorage>>,
    redactor: Option<PiiRedactor>,
    start_reaper: bool,
}

impl SandboxServiceBuilder {
    pub fn config(mut self, config: SandboxConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default `reqwest` gateway used by `sandbox.http.fetch`.
    pub fn gateway(mut self, gateway: Arc<dyn HttpGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn storage(mut self, storage: Arc<ExtensionStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn redactor(mut self, redactor: PiiRedactor) -> Self {
        self.redactor = Some(redactor);
        self
    }

    /// Whether to run the background reaper (on by default).
    pub fn reaper(mut self, enabled: bool) -> Self {
        self.start_reaper = enabled;
        self
    }

    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> SandboxResult<SandboxService> {
        self.config.validate()?;
        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            SandboxRuntimeError::InitializationFailed(format!("no Tokio runtime available: {e}"))
        })?;

        let config = Arc::new(self.config);
        let events = EventBus::new(config.event_channel_capacity);
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(ExtensionStorage::with_limits(config.storage_limits())));
        let gateway: Arc<dyn HttpGateway> = match self.gateway {
            Some(gateway) => gateway,
            None => Arc::new(
                ReqwestGateway::new(handle, config.max_output_size)
                    .map_err(|e| SandboxRuntimeError::Gateway(e.to_string()))?,
            ),
        };

        let mut policy = CapabilityPolicy::new(storage.clone(), gateway, events.clone());
        if let Some(redactor) = self.redactor {
            policy = policy.with_redactor(redactor);
        }

        let quota = Arc::new(QuotaController::new(QuotaConfig {
            enabled: config.rate_limit_enabled,
            executions_per_minute: config.rate_limit_per_minute,
            max_contexts_per_extension: config.max_contexts_per_extension,
        }));
        let stats = Arc::new(StatsAggregator::new());
        let contexts = Arc::new(ContextManager::new(
            config.clone(),
            policy,
            quota.clone(),
            stats.clone(),
            events.clone(),
        ));
        let engine = ExecutionEngine::new(contexts.clone(), events.clone());

        let reaper = self
            .start_reaper
            .then(|| LifecycleReaper::spawn(contexts.clone(), config.reap_interval));

        tracing::info!(
            timeout = ?config.timeout,
            memory_limit = config.memory_limit,
            max_contexts_per_extension = config.max_contexts_per_extension,
            rate_limit_per_minute = config.rate_limit_per_minute,
            "Sandbox service initialized"
        );

        Ok(SandboxService {
            config,
            contexts,
            engine,
            quota,
            stats,
            events,
            storage,
            reaper: Mutex::new(reaper),
        })
    }
}

pub struct SandboxService {
    config: Arc<SandboxConfig>,
    contexts: Arc<ContextManager>,
    engine: ExecutionEngine,
    quota: Arc<QuotaController>,
    stats: Arc<StatsAggregator>,
    events: EventBus,
    storage: Arc<ExtensionStorage>,
    reaper: Mutex<Option<LifecycleReaper>>,
}

impl SandboxService {
    pub fn builder() -> SandboxServiceBuilder {
        SandboxServiceBuilder {
            config: SandboxConfig::default(),
            gateway: None,
            storage: None,
            redactor: None,
            start_reaper: true,
        }
    }

    /// Service with the given configuration and default collaborators.
    pub fn new(config: SandboxConfig) -> SandboxResult<Self> {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<ExtensionStorage> {
        &self.storage
    }

    pub async fn create_context(
        &self,
        extension_id: &str,
        user_id: Option<&str>,
        options: ContextOptions,
    ) -> SandboxResult<String> {
        self.contexts
            .create_context(extension_id, user_id, &options)
            .await
    }

    /// Create a context for an installed extension; its permission set
    /// replaces any permissions in `options`.
    pub async fn create_context_for(
        &self,
        descriptor: &ExtensionDescriptor,
        user_id: Option<&str>,
        options: ContextOptions,
    ) -> SandboxResult<String> {
        if !descriptor.enabled {
            return Err(AdmissionError::ExtensionDisabled(descriptor.extension_id.clone()).into());
        }
        let options = options.with_permissions(descriptor.permissions.iter().cloned());
        self.create_context(&descriptor.extension_id, user_id, options)
            .await
    }

    /// Count one execution against the (user, extension) window.
    pub async fn admit_execution(&self, user_id: &str, extension_id: &str) -> Result<(), AdmissionError> {
        self.quota.check_execution(user_id, extension_id).await
    }

    /// Executions left in the current window for (user, extension)
    pub async fn remaining_executions(&self, user_id: &str, extension_id: &str) -> u32 {
        self.quota.remaining(user_id, extension_id).await
    }

    /// Run `code` as a function body; `args` must be a JSON object (or null).
    pub async fn execute(
        &self,
        context_id: &str,
        code: &str,
        args: serde_json::Value,
    ) -> Result<SandboxExecutionResult, AdmissionError> {
        let args = match args {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                return Err(AdmissionError::InvalidRequest(format!(
                    "args must be a JSON object, got {}",
                    json_type(&other)
                )))
            }
        };
        let unit = CodeUnit::function(code, &args)
            .map_err(|e| AdmissionError::InvalidRequest(e.to_string()))?;

        let slot = self.contexts.slot(context_id).await?;
        self.admit_for(slot.user_id(), slot.extension_id()).await?;
        self.engine.execute(&slot, unit).await
    }

    /// Read the entry file under `install_path` and run it at global scope.
    pub async fn load_extension(
        &self,
        context_id: &str,
        install_path: &Path,
    ) -> Result<SandboxExecutionResult, AdmissionError> {
        self.load_entry(context_id, install_path, None).await
    }

    /// Like [`Self::load_extension`], honouring the descriptor's entry point.
    pub async fn load_descriptor(
        &self,
        context_id: &str,
        descriptor: &ExtensionDescriptor,
    ) -> Result<SandboxExecutionResult, AdmissionError> {
        if !descriptor.enabled {
            return Err(AdmissionError::ExtensionDisabled(descriptor.extension_id.clone()));
        }
        self.load_entry(
            context_id,
            &descriptor.install_path,
            descriptor.entry_point.as_deref(),
        )
        .await
    }

    /// Admission happens before the entry file is read, so a load that fails
    /// on disk still consumes a rate-limit slot and is booked as a failed
    /// execution. The read itself runs on the blocking pool.
    async fn load_entry(
        &self,
        context_id: &str,
        install_path: &Path,
        entry_point: Option<&str>,
    ) -> Result<SandboxExecutionResult, AdmissionError> {
        let slot = self.contexts.slot(context_id).await?;
        self.admit_for(slot.user_id(), slot.extension_id()).await?;

        let read = read_entry_blocking(
            install_path.to_path_buf(),
            entry_point.map(str::to_owned),
            self.config.max_code_size,
        )
        .await;
        match read {
            Ok(source) => {
                tracing::info!(
                    context_id,
                    extension_id = slot.extension_id(),
                    bytes = source.len(),
                    "Loading extension entry"
                );
                self.engine.execute(&slot, CodeUnit::script(source)).await
            }
            Err(e) => {
                self.engine
                    .reject(&slot, RawFailure::new(format!("Failed to load extension: {e}")))
                    .await
            }
        }
    }

    /// Call a function defined by a previously loaded unit. `module.exports`
    /// is searched first, then the global scope. An array `args` is spread
    /// into positional arguments; any other value is passed as the single
    /// argument.
    pub async fn call_function(
        &self,
        context_id: &str,
        function_name: &str,
        args: serde_json::Value,
    ) -> Result<SandboxExecutionResult, AdmissionError> {
        let name = serde_json::to_string(function_name)
            .map_err(|e| AdmissionError::InvalidRequest(e.to_string()))?;
        let call_args = match args {
            serde_json::Value::Array(values) => values,
            serde_json::Value::Null => Vec::new(),
            value => vec![value],
        };

        let code = format!(
            "const exported = module !== null && typeof module === 'object' ? module.exports : undefined;\n\
             const owner = exported != null && typeof exported[{name}] === 'function' ? exported : globalThis;\n\
             const target = owner[{name}];\n\
             if (typeof target !== 'function') {{\n\
             \x20 throw new TypeError('Function ' + {name} + ' is not defined');\n\
             }}\n\
             return target.apply(owner, callArgs);"
        );

        let mut bindings = serde_json::Map::new();
        bindings.insert("callArgs".to_string(), serde_json::Value::Array(call_args));
        let unit = CodeUnit::function(&code, &bindings)
            .map_err(|e| AdmissionError::InvalidRequest(e.to_string()))?;

        let slot = self.contexts.slot(context_id).await?;
        self.admit_for(slot.user_id(), slot.extension_id()).await?;
        self.engine.execute(&slot, unit).await
    }

    pub async fn destroy_context(&self, context_id: &str) -> bool {
        self.contexts
            .destroy_context(context_id, DestroyReason::Explicit)
            .await
    }

    pub fn get_stats(&self) -> SandboxStats {
        self.stats.snapshot()
    }

    pub fn health(&self) -> HealthReport {
        self.stats
            .health(self.config.soft_context_limit, self.config.hard_context_limit)
    }

    pub async fn get_context(&self, context_id: &str) -> Option<SandboxContext> {
        self.contexts.get_context(context_id).await
    }

    pub async fn get_active_contexts(&self) -> Vec<SandboxContext> {
        self.contexts.get_active_contexts().await
    }

    pub async fn get_extension_contexts(&self, extension_id: &str) -> Vec<SandboxContext> {
        self.contexts.get_extension_contexts(extension_id).await
    }

    pub async fn kill_extension_contexts(&self, extension_id: &str) -> usize {
        self.contexts.kill_extension_contexts(extension_id).await
    }

    pub async fn emergency_stop(&self) -> usize {
        self.contexts.emergency_stop().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Stop the reaper. Live contexts are left to the caller.
    pub async fn shutdown(&self) {
        let reaper = self.reaper.lock().take();
        if let Some(reaper) = reaper {
            reaper.shutdown().await;
            tracing::info!("Sandbox service shut down");
        }
    }

    async fn admit_for(&self, user_id: Option<&str>, extension_id: &str) -> Result<(), AdmissionError> {
        self.quota
            .check_execution(user_id.unwrap_or(ANONYMOUS_USER), extension_id)
            .await
    }
}

fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
