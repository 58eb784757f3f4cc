//! Sandbox error types
//!
//! Two kinds of failure leave this crate and they never mix:
//!
//! - [`SandboxError`] is *data*: a classified failure of code that was
//!   admitted and started. It travels inside a `SandboxExecutionResult`.
//! - [`AdmissionError`] is a refusal before anything ran (rate limit,
//!   context ceiling, unknown or inactive context).
//!
//! [`SandboxRuntimeError`] covers host-side failures that may surface from
//! `create_context` and service construction.

use chrono::{DateTime, Utc};
use error_common::codes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Five-kind failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxErrorKind {
    Timeout,
    Memory,
    Security,
    Permission,
    Runtime,
}

impl SandboxErrorKind {
    pub const ALL: [SandboxErrorKind; 5] = [
        Self::Timeout,
        Self::Memory,
        Self::Security,
        Self::Permission,
        Self::Runtime,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Memory => "memory",
            Self::Security => "security",
            Self::Permission => "permission",
            Self::Runtime => "runtime",
        }
    }

    /// Stable transport code for this kind
    pub fn code(self) -> &'static str {
        codes::execution_code(self.as_str())
    }
}

impl fmt::Display for SandboxErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure attached to exactly one context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxError {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: SandboxErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub context: BTreeMap<String, String>,
}

impl SandboxError {
    pub fn new(kind: SandboxErrorKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            message: message.into(),
            stack: None,
            context: BTreeMap::new(),
        }
    }

    pub fn with_stack(mut self, stack: Option<String>) -> Self {
        self.stack = stack;
        self
    }

    pub fn with_context(mut self, context: BTreeMap<String, String>) -> Self {
        self.context = context;
        self
    }

    /// Reduced shape for callers outside the engine; no stack.
    pub fn to_public(&self) -> error_common::PublicError {
        error_common::PublicError::new(self.kind.code(), self.kind.as_str(), self.message.clone())
    }
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

/// Pre-admission refusal; nothing was executed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// Per (user, extension) execution window is full
    #[error("Rate limit exceeded for extension {extension_id}: {limit} executions per minute, retry after {retry_after:?}")]
    RateLimited {
        extension_id: String,
        limit: u32,
        retry_after: Duration,
    },

    /// Per-extension live context ceiling reached
    #[error("Context limit reached for extension {extension_id}: {limit} concurrent contexts")]
    ContextLimitReached { extension_id: String, limit: usize },

    /// Unknown context id
    #[error("Context not found: {0}")]
    ContextNotFound(String),

    /// Context has been destroyed
    #[error("Context is no longer active: {0}")]
    ContextInactive(String),

    /// Extension is disabled upstream
    #[error("Extension is disabled: {0}")]
    ExtensionDisabled(String),

    /// Malformed request (e.g. non-object args)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl AdmissionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => codes::admission::RATE_LIMITED,
            Self::ContextLimitReached { .. } => codes::admission::CONTEXT_LIMIT_REACHED,
            Self::ContextNotFound(_) => codes::admission::CONTEXT_NOT_FOUND,
            Self::ContextInactive(_) => codes::admission::CONTEXT_INACTIVE,
            Self::ExtensionDisabled(_) => codes::admission::EXTENSION_DISABLED,
            Self::InvalidRequest(_) => codes::admission::INVALID_REQUEST,
        }
    }

    /// Time after which retrying may succeed, when known
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Host-side errors of the sandbox service
#[derive(Error, Debug)]
pub enum SandboxRuntimeError {
    /// Request refused before admission
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// Interpreter could not be created or prepared
    #[error("Sandbox initialization failed: {0}")]
    InitializationFailed(String),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// HTTP gateway could not be constructed
    #[error("HTTP gateway error: {0}")]
    Gateway(String),
}

impl SandboxRuntimeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Admission(e) => e.code(),
            Self::InitializationFailed(_) | Self::Gateway(_) => codes::host::INITIALIZATION_FAILED,
            Self::Config(_) => codes::host::CONFIGURATION,
        }
    }
}

impl From<rquickjs::Error> for SandboxRuntimeError {
    fn from(err: rquickjs::Error) -> Self {
        Self::InitializationFailed(err.to_string())
    }
}

/// Sandbox result type for host-side operations
pub type SandboxResult<T> = Result<T, SandboxRuntimeError>;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
