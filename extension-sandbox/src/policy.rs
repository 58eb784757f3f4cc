//! Capability policy
//!
//! Builds the restricted environment a context runs in. QuickJS starts with
//! no filesystem, process or network primitives at all; the policy then:
//!
//! - prunes every global that is not a core language built-in or explicitly
//!   allow-listed,
//! - installs denial stubs for ambient Node-style globals and for every
//!   module that is not allow-listed, so touching them fails at call time
//!   with a `SecurityError`,
//! - exposes the `sandbox` API, whose storage, events and HTTP parts are
//!   backed by host functions only when the matching permission is granted.

use crate::config::SandboxOptions;
use crate::events::{EventBus, ExtensionEvent, LifecycleEvent};
use crate::host::{host_allowed, ExtensionStorage, GatewayError, HttpGateway, HttpRequest};
use crate::isolate::RunBudget;
use chrono::Utc;
use logger_redacted::PiiRedactor;
use rquickjs::{Ctx, Function, Object};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Permission gating `sandbox.storage`
pub const PERMISSION_STORAGE: &str = "storage";
/// Permission gating `sandbox.events`
pub const PERMISSION_EVENTS: &str = "events";
/// Permission gating `sandbox.http`
pub const PERMISSION_NETWORK: &str = "network";

/// Modules that are denied even when configuration lists them
pub const ALWAYS_DENIED_MODULES: &[&str] = &[
    "fs",
    "fs/promises",
    "child_process",
    "cluster",
    "net",
    "http",
    "https",
    "http2",
    "dgram",
    "dns",
    "tls",
    "os",
    "process",
    "vm",
    "v8",
    "worker_threads",
    "inspector",
    "module",
];

const PRELUDE: &str = include_str!("prelude.js");

const MAX_CONSOLE_LINE_CHARS: usize = 4096;

/// Builds per-context environments from shared host services
#[derive(Clone)]
pub struct CapabilityPolicy {
    storage: Arc<ExtensionStorage>,
    gateway: Arc<dyn HttpGateway>,
    events: EventBus,
    redactor: Arc<PiiRedactor>,
}

impl CapabilityPolicy {
    pub fn new(
        storage: Arc<ExtensionStorage>,
        gateway: Arc<dyn HttpGateway>,
        events: EventBus,
    ) -> Self {
        Self {
            storage,
            gateway,
            events,
            redactor: Arc::new(PiiRedactor::default()),
        }
    }

    pub fn with_redactor(mut self, redactor: PiiRedactor) -> Self {
        self.redactor = Arc::new(redactor);
        self
    }

    /// Resolve what a context for `extension_id` may touch.
    ///
    /// Never grants partial privilege: modules outside the allow-list (or on
    /// the always-denied list) are left to resolve to denial stubs.
    pub fn build(&self, extension_id: &str, context_id: &str, options: &SandboxOptions) -> Environment {
        let allowed_modules = options
            .allowed_modules
            .iter()
            .filter(|name| !ALWAYS_DENIED_MODULES.contains(&name.as_str()))
            .cloned()
            .collect();

        Environment {
            extension_id: extension_id.to_string(),
            context_id: context_id.to_string(),
            allowed_modules,
            allowed_globals: options.allowed_globals.clone(),
            permissions: options.permissions.clone(),
            allowed_hosts: options.allowed_hosts.clone(),
            logging: options.logging,
            timeout: options.timeout,
            storage: self.storage.clone(),
            gateway: self.gateway.clone(),
            events: self.events.clone(),
            redactor: self.redactor.clone(),
        }
    }
}

/// Everything one context is allowed to see
#[derive(Clone)]
pub struct Environment {
    pub extension_id: String,
    pub context_id: String,
    pub allowed_modules: BTreeSet<String>,
    pub allowed_globals: BTreeSet<String>,
    pub permissions: BTreeSet<String>,
    pub allowed_hosts: BTreeSet<String>,
    pub logging: bool,
    pub timeout: Duration,
    storage: Arc<ExtensionStorage>,
    gateway: Arc<dyn HttpGateway>,
    events: EventBus,
    redactor: Arc<PiiRedactor>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("extension_id", &self.extension_id)
            .field("context_id", &self.context_id)
            .field("allowed_modules", &self.allowed_modules)
            .field("allowed_globals", &self.allowed_globals)
            .field("permissions", &self.permissions)
            .field("allowed_hosts", &self.allowed_hosts)
            .field("logging", &self.logging)
            .finish()
    }
}

impl Environment {
    pub fn grants(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    pub fn module_allowed(&self, name: &str) -> bool {
        self.allowed_modules.contains(name)
    }

    fn config_json(&self) -> String {
        serde_json::json!({
            "extensionId": self.extension_id,
            "contextId": self.context_id,
            "allowedModules": self.allowed_modules,
            "allowedGlobals": self.allowed_globals,
            "permissions": self.permissions,
        })
        .to_string()
    }

    /// Install host functions and run the prelude inside `ctx`.
    pub(crate) fn install<'js>(&self, ctx: &Ctx<'js>, budget: &Arc<RunBudget>) -> rquickjs::Result<()> {
        let env = Arc::new(self.clone());
        let native = Object::new(ctx.clone())?;

        let console_env = env.clone();
        native.set(
            "log",
            Function::new(ctx.clone(), move |level: String, line: String| {
                console_env.console(&level, &line);
            })?,
        )?;
        native.set(
            "uuid",
            Function::new(ctx.clone(), || uuid::Uuid::new_v4().to_string())?,
        )?;

        if self.grants(PERMISSION_STORAGE) {
            let get_env = env.clone();
            native.set(
                "storageGet",
                Function::new(ctx.clone(), move |key: String| -> Option<String> {
                    get_env.storage.get(&get_env.extension_id, &key)
                })?,
            )?;
            let set_env = env.clone();
            let set_budget = budget.clone();
            native.set(
                "storageSet",
                Function::new(ctx.clone(), move |key: String, json: String| -> Option<String> {
                    set_env.store(&key, json, &set_budget)
                })?,
            )?;
            let remove_env = env.clone();
            native.set(
                "storageRemove",
                Function::new(ctx.clone(), move |key: String| -> bool {
                    remove_env.storage.remove(&remove_env.extension_id, &key)
                })?,
            )?;
            let keys_env = env.clone();
            native.set(
                "storageKeys",
                Function::new(ctx.clone(), move || -> Vec<String> {
                    keys_env.storage.keys(&keys_env.extension_id)
                })?,
            )?;
        }

        if self.grants(PERMISSION_EVENTS) {
            let emit_env = env.clone();
            native.set(
                "emit",
                Function::new(ctx.clone(), move |name: String, payload: String| {
                    emit_env.emit(name, &payload);
                })?,
            )?;
        }

        if self.grants(PERMISSION_NETWORK) {
            let fetch_env = env.clone();
            let fetch_budget = budget.clone();
            native.set(
                "fetch",
                Function::new(ctx.clone(), move |request: String| -> String {
                    fetch_env.fetch(&request, &fetch_budget)
                })?,
            )?;
        }

        let setup: Function<'js> = ctx.eval(PRELUDE)?;
        setup.call::<_, ()>((native, self.config_json()))
    }

    fn console(&self, level: &str, line: &str) {
        if !self.logging {
            return;
        }
        let line = self.console_line(line);
        let extension_id = self.extension_id.as_str();
        let context_id = self.context_id.as_str();
        match level {
            "error" => tracing::error!(target: "extension_sandbox::console", extension_id, context_id, "{}", line),
            "warn" => tracing::warn!(target: "extension_sandbox::console", extension_id, context_id, "{}", line),
            "debug" => tracing::debug!(target: "extension_sandbox::console", extension_id, context_id, "{}", line),
            _ => tracing::info!(target: "extension_sandbox::console", extension_id, context_id, "{}", line),
        }
    }

    /// Cut to the console line limit, then redact what is left.
    fn console_line(&self, line: &str) -> String {
        match line.char_indices().nth(MAX_CONSOLE_LINE_CHARS) {
            Some((cut, _)) => {
                let head = line.get(..cut).unwrap_or(line);
                format!("{}...", self.redactor.redact(head))
            }
            None => self.redactor.redact(line),
        }
    }

    /// `None` on success, otherwise the refusal message for the prelude.
    fn store(&self, key: &str, json: String, budget: &RunBudget) -> Option<String> {
        match self.storage.set(&self.extension_id, key, json) {
            Ok(()) => None,
            Err(e) => {
                budget.exhaust();
                tracing::warn!(
                    extension_id = %self.extension_id,
                    context_id = %self.context_id,
                    error = %e,
                    "Refused extension storage write"
                );
                Some(e.to_string())
            }
        }
    }

    fn emit(&self, name: String, payload: &str) {
        let payload = serde_json::from_str(payload).unwrap_or(serde_json::Value::Null);
        self.events.publish(LifecycleEvent::Extension(ExtensionEvent {
            extension_id: self.extension_id.clone(),
            context_id: self.context_id.clone(),
            name,
            payload,
            timestamp: Utc::now(),
        }));
    }

    /// Returns a JSON envelope: `{ok, response}` or `{ok: false, kind, message}`.
    fn fetch(&self, request: &str, budget: &RunBudget) -> String {
        match self.checked_fetch(request, budget) {
            Ok(response) => serde_json::json!({ "ok": true, "response": response }).to_string(),
            Err((kind, message)) => {
                serde_json::json!({ "ok": false, "kind": kind, "message": message }).to_string()
            }
        }
    }

    fn checked_fetch(
        &self,
        request: &str,
        budget: &RunBudget,
    ) -> Result<crate::host::HttpResponse, (&'static str, String)> {
        let request: HttpRequest = serde_json::from_str(request)
            .map_err(|e| ("runtime", format!("Invalid fetch request: {e}")))?;
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| ("runtime", format!("Invalid URL '{}': {e}", request.url)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err((
                "security",
                format!("Scheme '{}' is not allowed for sandbox.http.fetch", url.scheme()),
            ));
        }
        let host = url.host_str().unwrap_or_default();
        if !host_allowed(host, &self.allowed_hosts) {
            tracing::warn!(
                extension_id = %self.extension_id,
                context_id = %self.context_id,
                host,
                "Blocked outbound request to host outside allow-list"
            );
            return Err(("security", format!("Network access to host '{host}' is not allowed")));
        }

        let timeout = budget.remaining().unwrap_or(self.timeout);
        if timeout.is_zero() {
            return Err(("timeout", "Request timed out before it was sent".to_string()));
        }

        self.gateway.fetch(request, timeout).map_err(|e| match e {
            GatewayError::Timeout(_) => ("timeout", e.to_string()),
            _ => ("runtime", e.to_string()),
        })
    }
}
