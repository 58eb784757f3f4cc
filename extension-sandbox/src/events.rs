//! Lifecycle events
//!
//! A broadcast channel carrying context lifecycle notifications and events
//! extensions emit through `sandbox.events.emit`. Observability and audit
//! collaborators subscribe; publishing with nobody listening is a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::SandboxErrorKind;

/// Why a context was destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestroyReason {
    /// Caller asked for it
    Explicit,
    /// Idle longer than the idle TTL
    Idle,
    /// Emergency cleanup above the hard context ceiling
    Emergency,
    /// Every context of a disabled/uninstalled extension was killed
    ExtensionKilled,
    /// Operator-triggered full stop
    EmergencyStop,
}

impl DestroyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Idle => "idle",
            Self::Emergency => "emergency",
            Self::ExtensionKilled => "extension_killed",
            Self::EmergencyStop => "emergency_stop",
        }
    }
}

/// Final accounting of a destroyed context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSummary {
    pub execution_count: u64,
    pub memory_used: u64,
    #[serde(with = "humantime_serde")]
    pub cpu_time: Duration,
    pub error_count: usize,
    #[serde(with = "humantime_serde")]
    pub lifetime: Duration,
}

/// Event published by an extension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionEvent {
    pub extension_id: String,
    pub context_id: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    ContextCreated {
        context_id: String,
        extension_id: String,
        timestamp: DateTime<Utc>,
    },
    ExecutionCompleted {
        context_id: String,
        extension_id: String,
        #[serde(with = "humantime_serde")]
        execution_time: Duration,
        memory_delta: i64,
        output_size: usize,
    },
    ExecutionError {
        context_id: String,
        extension_id: String,
        kind: SandboxErrorKind,
        message: String,
        #[serde(with = "humantime_serde")]
        execution_time: Duration,
    },
    ContextDestroyed {
        context_id: String,
        extension_id: String,
        reason: DestroyReason,
        summary: ContextSummary,
    },
    EmergencyStop {
        destroyed: usize,
        timestamp: DateTime<Utc>,
    },
    Extension(ExtensionEvent),
}

impl LifecycleEvent {
    /// Context the event concerns, if any
    pub fn context_id(&self) -> Option<&str> {
        match self {
            Self::ContextCreated { context_id, .. }
            | Self::ExecutionCompleted { context_id, .. }
            | Self::ExecutionError { context_id, .. }
            | Self::ContextDestroyed { context_id, .. } => Some(context_id),
            Self::Extension(event) => Some(&event.context_id),
            Self::EmergencyStop { .. } => None,
        }
    }
}

/// Broadcast bus for [`LifecycleEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LifecycleEvent>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    /// Number of receivers the event reached; 0 without subscribers.
    pub fn publish(&self, event: LifecycleEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Receiver for all events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
