use serde::{Deserialize, Serialize};

/// Error shape surfaced to callers outside the engine.
///
/// Carries only the stable code, the failure kind and an already sanitized
/// message; raw stacks never travel in this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicError {
    pub code: String,
    pub kind: String,
    pub message: String,
}

impl PublicError {
    pub fn new(code: impl Into<String>, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for PublicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.code, self.kind, self.message)
    }
}
