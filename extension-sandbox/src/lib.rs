//! Extension sandbox execution engine
//!
//! Runs third-party extension scripts inside embedded QuickJS interpreters
//! with no ambient authority, under strict resource and capability limits:
//! - One isolated interpreter per context, bound to a single extension
//! - Hard wall-clock timeout, heap ceiling and output/code size ceilings
//! - Default-deny capability policy with permission-gated host APIs
//!   (storage, events, allow-listed outbound HTTP)
//! - Five-kind failure taxonomy returned as data, never as a panic or error
//! - Per (user, extension) rate limiting and per-extension context ceilings
//! - Global/per-extension statistics, health and load-triggered cleanup
//! - Background reaping of idle contexts
//! - Lifecycle events on a broadcast channel
//!
//! # Security Model
//!
//! - No filesystem, process or network primitives exist in the interpreter
//! - Globals outside the core built-ins and the allow-list are removed
//! - `require` of any module outside the allow-list yields a denial stub
//!   that throws `SecurityError` when used
//! - `sandbox.*` APIs throw `PermissionError` without the matching grant
//!
//! # Example
//!
//! ```rust,no_run
//! use extension_sandbox::{ContextOptions, SandboxConfig, SandboxService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = SandboxService::new(SandboxConfig::default())?;
//!
//!     let context_id = service
//!         .create_context("hello-extension", Some("user-1"), ContextOptions::default())
//!         .await?;
//!
//!     let result = service
//!         .execute(&context_id, "return a + b", serde_json::json!({ "a": 1, "b": 2 }))
//!         .await?;
//!     assert_eq!(result.result, Some(serde_json::json!(3)));
//!
//!     service.destroy_context(&context_id).await;
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod classifier;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod host;
pub mod isolate;
pub mod loader;
pub mod policy;
pub mod quota;
pub mod reaper;
pub mod service;
pub mod stats;

pub use classifier::{classify, FailureSignal, RawFailure};
pub use config::{ContextOptions, SandboxConfig, SandboxOptions, MAX_EXECUTION_TIMEOUT};
pub use context::{ContextManager, LoadLevel, SandboxContext};
pub use engine::{ExecutionEngine, SandboxExecutionResult};
pub use error::*;
pub use events::{ContextSummary, DestroyReason, EventBus, ExtensionEvent, LifecycleEvent};
pub use host::{
    ExtensionStorage, GatewayError, HttpGateway, HttpRequest, HttpResponse, ReqwestGateway,
    StorageError, StorageLimits,
};
pub use loader::{ExtensionDescriptor, LoadError};
pub use policy::{CapabilityPolicy, Environment};
pub use quota::{QuotaConfig, QuotaController};
pub use reaper::LifecycleReaper;
pub use service::{SandboxService, SandboxServiceBuilder};
pub use stats::{ExtensionStats, HealthReport, HealthStatus, SandboxStats, StatsAggregator};
