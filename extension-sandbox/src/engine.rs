//! Execution engine
//!
//! Runs one unit inside a context under a hard wall-clock timeout. The
//! interpreter works on the blocking pool; the async side races it against
//! `tokio::time::timeout`. Whatever happens inside the sandbox comes back as
//! a [`SandboxExecutionResult`]; the only `Err` this module returns is an
//! [`AdmissionError`] for a context that was gone before or after the run.

use crate::classifier::{classify, FailureSignal, RawFailure};
use crate::context::{ContextManager, ContextSlot, ExecutionRecord};
use crate::error::{AdmissionError, SandboxError, SandboxErrorKind};
use crate::events::{EventBus, LifecycleEvent};
use crate::isolate::{CodeUnit, RunOutput};
use error_common::{ErrorContext, ErrorReporter, MessageSanitizer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of every execution attempt that was admitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxExecutionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SandboxError>,
    #[serde(with = "humantime_serde")]
    pub execution_time: Duration,
    pub memory_delta: i64,
    pub output_size: usize,
}

impl SandboxExecutionResult {
    pub fn error_kind(&self) -> Option<SandboxErrorKind> {
        self.error.as_ref().map(|error| error.kind)
    }
}

/// What a run produced before bookkeeping
struct Completed {
    value: Result<(Option<serde_json::Value>, usize), SandboxError>,
    memory_delta: i64,
}

pub struct ExecutionEngine {
    contexts: Arc<ContextManager>,
    events: EventBus,
    sanitizer: MessageSanitizer,
    reporter: ErrorReporter,
    max_code_size: usize,
}

impl ExecutionEngine {
    pub fn new(contexts: Arc<ContextManager>, events: EventBus) -> Self {
        let max_code_size = contexts.config().max_code_size;
        Self {
            contexts,
            events,
            sanitizer: MessageSanitizer::default(),
            reporter: ErrorReporter::new(),
            max_code_size,
        }
    }

    /// Run `unit` in the context, serialized with other calls on it.
    pub async fn execute(
        &self,
        slot: &Arc<ContextSlot>,
        unit: CodeUnit,
    ) -> Result<SandboxExecutionResult, AdmissionError> {
        self.dispatch(slot, Ok(unit)).await
    }

    /// Book a failure that happened before any code could run (e.g. an
    /// unreadable entry file) exactly like a failed execution.
    pub async fn reject(
        &self,
        slot: &Arc<ContextSlot>,
        failure: RawFailure,
    ) -> Result<SandboxExecutionResult, AdmissionError> {
        self.dispatch(slot, Err(failure)).await
    }

    async fn dispatch(
        &self,
        slot: &Arc<ContextSlot>,
        prepared: Result<CodeUnit, RawFailure>,
    ) -> Result<SandboxExecutionResult, AdmissionError> {
        let _serial = slot.serialize().await;
        slot.settle_abandoned().await;
        slot.begin_execution()?;

        let started = Instant::now();
        let completed = match prepared {
            Ok(unit) => self.run(slot, unit).await,
            Err(failure) => Completed {
                value: Err(self.classified(slot, failure)),
                memory_delta: 0,
            },
        };
        let elapsed = started.elapsed();

        self.finish(slot, completed, elapsed)
    }

    async fn run(&self, slot: &Arc<ContextSlot>, unit: CodeUnit) -> Completed {
        let code_size = match &unit {
            CodeUnit::Function { source, .. } | CodeUnit::Script { source } => source.len(),
        };
        if code_size > self.max_code_size {
            let failure = RawFailure::new(format!(
                "code too large: {code_size} bytes exceeds limit of {} bytes",
                self.max_code_size
            ));
            return Completed {
                value: Err(self.classified(slot, failure)),
                memory_delta: 0,
            };
        }

        let options = slot.options();
        let budget = slot.budget().clone();
        budget.arm(options.timeout);

        let isolate = slot.isolate().clone();
        let mut handle = tokio::task::spawn_blocking(move || isolate.lock().run(&unit));

        match tokio::time::timeout(options.timeout, &mut handle).await {
            Ok(Ok(output)) => {
                budget.disarm();
                self.complete(slot, output)
            }
            Ok(Err(join_error)) => {
                budget.disarm();
                tracing::error!(
                    context_id = slot.id(),
                    extension_id = slot.extension_id(),
                    error = %join_error,
                    "Sandbox execution task failed"
                );
                Completed {
                    value: Err(self.classified(
                        slot,
                        RawFailure::new("Sandbox execution task failed"),
                    )),
                    memory_delta: 0,
                }
            }
            Err(_) => {
                // The interrupt handler stops the run shortly; the next call
                // on this context waits for it.
                slot.park_abandoned(handle);
                let failure = RawFailure::new(timeout_message(options.timeout))
                    .with_signal(FailureSignal::DeadlineExceeded);
                Completed {
                    value: Err(self.classified(slot, failure)),
                    memory_delta: 0,
                }
            }
        }
    }

    fn complete(&self, slot: &ContextSlot, output: RunOutput) -> Completed {
        let max_output_size = slot.options().max_output_size;
        let value = match output.outcome {
            Ok(None) => Ok((None, 0)),
            Ok(Some(json)) if json.len() > max_output_size => Err(self.classified(
                slot,
                RawFailure::new(format!(
                    "output too large: {} bytes exceeds limit of {max_output_size} bytes",
                    json.len()
                )),
            )),
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(value) => Ok((Some(value), json.len())),
                Err(e) => Err(self.classified(
                    slot,
                    RawFailure::new(format!("Result could not be decoded: {e}")),
                )),
            },
            Err(mut failure) => {
                match failure.signal {
                    Some(FailureSignal::DeadlineExceeded) => {
                        failure.message = timeout_message(slot.options().timeout);
                    }
                    Some(FailureSignal::Terminated) => {
                        failure.message = "Execution terminated by emergency stop".to_string();
                    }
                    _ => {}
                }
                Err(self.classified(slot, failure))
            }
        };

        Completed {
            value,
            memory_delta: output.memory_delta,
        }
    }

    /// Classify and sanitize a raw failure into a context-scoped error.
    fn classified(&self, slot: &ContextSlot, failure: RawFailure) -> SandboxError {
        let kind = classify(&failure);
        let message = match failure.name.as_deref() {
            Some(name) if !name.is_empty() && name != "Error" => {
                format!("{name}: {}", failure.message)
            }
            _ => failure.message.clone(),
        };

        let mut context = ErrorContext::new()
            .with_extension_id(slot.extension_id())
            .with_context_id(slot.id());
        if let Some(user_id) = slot.user_id() {
            context = context.with_user_id(user_id);
        }
        if let Some(name) = failure.name.as_deref().filter(|name| !name.is_empty()) {
            context = context.add_context("errorName", name);
        }

        SandboxError::new(kind, self.sanitizer.sanitize_message(&message))
            .with_stack(
                failure
                    .stack
                    .as_deref()
                    .and_then(|stack| self.sanitizer.sanitize_stack(stack)),
            )
            .with_context(context.into_map())
    }

    fn finish(
        &self,
        slot: &ContextSlot,
        completed: Completed,
        elapsed: Duration,
    ) -> Result<SandboxExecutionResult, AdmissionError> {
        let (result, output_size, error) = match completed.value {
            Ok((value, size)) => (value, size, None),
            Err(error) => (None, 0, Some(error)),
        };

        self.contexts.finalize_execution(
            slot,
            ExecutionRecord {
                elapsed,
                memory_delta: completed.memory_delta,
                error: error.clone(),
            },
        )?;

        match &error {
            None => {
                tracing::debug!(
                    context_id = slot.id(),
                    extension_id = slot.extension_id(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    memory_delta = completed.memory_delta,
                    output_size,
                    "Sandbox execution completed"
                );
                self.events.publish(LifecycleEvent::ExecutionCompleted {
                    context_id: slot.id().to_string(),
                    extension_id: slot.extension_id().to_string(),
                    execution_time: elapsed,
                    memory_delta: completed.memory_delta,
                    output_size,
                });
            }
            Some(error) => {
                let context = ErrorContext::new()
                    .with_extension_id(slot.extension_id())
                    .with_context_id(slot.id());
                self.reporter
                    .report(error.kind.code(), error.kind.as_str(), &error.message, &context);
                self.events.publish(LifecycleEvent::ExecutionError {
                    context_id: slot.id().to_string(),
                    extension_id: slot.extension_id().to_string(),
                    kind: error.kind,
                    message: error.message.clone(),
                    execution_time: elapsed,
                });
            }
        }

        Ok(SandboxExecutionResult {
            success: error.is_none(),
            result,
            error,
            execution_time: elapsed,
            memory_delta: completed.memory_delta,
            output_size,
        })
    }
}

fn timeout_message(timeout: Duration) -> String {
    format!("Script execution timed out after {}ms", timeout.as_millis())
}
