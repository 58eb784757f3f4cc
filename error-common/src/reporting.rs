// Error reporting utilities
// Emits one structured tracing event per reported failure so log pipelines
// can aggregate on the error code.

use crate::context::ErrorContext;

#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorReporter;

impl ErrorReporter {
    pub fn new() -> Self {
        Self
    }

    pub fn report(&self, code: &str, kind: &str, message: &str, context: &ErrorContext) {
        tracing::warn!(
            error_code = code,
            error_kind = kind,
            extension_id = context.extension_id.as_deref().unwrap_or("-"),
            context_id = context.context_id.as_deref().unwrap_or("-"),
            "Sandbox failure reported: {}",
            message
        );
    }
}
