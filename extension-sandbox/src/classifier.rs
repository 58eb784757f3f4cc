//! Failure classification
//!
//! The isolate reports *why* it stopped through a [`FailureSignal`] whenever
//! it knows (deadline interrupt, heap exhaustion, a denied capability or a
//! missing permission). Only when no signal is present does the classifier
//! fall back to inspecting the message text. Anything unrecognised is a
//! `runtime` failure.

use crate::error::SandboxErrorKind;

/// Typed stop reason recorded by the isolate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSignal {
    /// Interrupt handler fired because the run deadline passed
    DeadlineExceeded,
    /// Host forcibly terminated the run (emergency stop)
    Terminated,
    /// Interpreter heap limit reached
    OutOfMemory,
    /// A blocked module, global or host was touched
    CapabilityDenied,
    /// A `sandbox.*` API was used without the matching permission
    PermissionMissing,
}

/// Raw failure as observed at the isolate boundary
#[derive(Debug, Clone, Default)]
pub struct RawFailure {
    /// JS error class name when the thrown value was an Error object
    pub name: Option<String>,
    pub message: String,
    pub stack: Option<String>,
    pub signal: Option<FailureSignal>,
}

impl RawFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_signal(mut self, signal: FailureSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Map a raw failure onto the five-kind taxonomy.
pub fn classify(failure: &RawFailure) -> SandboxErrorKind {
    if let Some(signal) = failure.signal {
        return match signal {
            FailureSignal::DeadlineExceeded => SandboxErrorKind::Timeout,
            FailureSignal::Terminated => SandboxErrorKind::Runtime,
            FailureSignal::OutOfMemory => SandboxErrorKind::Memory,
            FailureSignal::CapabilityDenied => SandboxErrorKind::Security,
            FailureSignal::PermissionMissing => SandboxErrorKind::Permission,
        };
    }
    classify_message(&failure.message)
}

/// Text heuristics, checked in order: timeout, memory, security, permission.
pub fn classify_message(message: &str) -> SandboxErrorKind {
    let lowered = message.to_ascii_lowercase();

    if lowered.contains("timeout") || lowered.contains("timed out") || lowered.contains("interrupted")
    {
        SandboxErrorKind::Timeout
    } else if lowered.contains("out of memory")
        || lowered.contains("memory limit")
        || lowered.contains("allocation failed")
        || lowered.contains("stack overflow")
    {
        SandboxErrorKind::Memory
    } else if lowered.contains("denied") || lowered.contains("not allowed") {
        SandboxErrorKind::Security
    } else if lowered.contains("permission") {
        SandboxErrorKind::Permission
    } else {
        SandboxErrorKind::Runtime
    }
}
