//! Interpreter isolate
//!
//! One QuickJS runtime and context per sandbox context. Globals persist
//! between runs so an extension loaded with a script unit can be called
//! later through function units.
//!
//! All interaction with the interpreter happens on a blocking thread; the
//! async engine only ever talks to an isolate through [`Isolate::run`].
//! Runtime-level calls (memory stats, job queue) are never made while a
//! context lock is held.

use crate::classifier::{FailureSignal, RawFailure};
use crate::error::SandboxRuntimeError;
use crate::policy::Environment;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use rquickjs::context::EvalOptions;
use rquickjs::{CatchResultExt, Context, Ctx, Function, Runtime};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Native stack ceiling of the interpreter
pub const STACK_LIMIT: usize = 1024 * 1024;

lazy_static! {
    static ref IDENTIFIER: Option<Regex> = Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").ok();
}

const RESERVED_WORDS: &[&str] = &[
    "args", "arguments", "await", "break", "case", "catch", "class", "const", "continue",
    "debugger", "default", "delete", "do", "else", "enum", "eval", "export", "extends", "false",
    "finally", "for", "function", "if", "implements", "import", "in", "instanceof", "interface",
    "let", "new", "null", "package", "private", "protected", "public", "return", "static",
    "super", "switch", "this", "throw", "true", "try", "typeof", "var", "void", "while", "with",
    "yield",
];

/// Per-run wall-clock budget shared with the interrupt handler
#[derive(Debug, Default)]
pub struct RunBudget {
    deadline: Mutex<Option<Instant>>,
    deadline_hit: AtomicBool,
    terminated: AtomicBool,
    /// A host-side resource ceiling (e.g. storage quota) refused this run
    resource_exhausted: AtomicBool,
}

impl RunBudget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self, timeout: Duration) {
        self.deadline_hit.store(false, Ordering::SeqCst);
        self.resource_exhausted.store(false, Ordering::SeqCst);
        *self.deadline.lock() = Some(Instant::now() + timeout);
    }

    pub fn disarm(&self) {
        *self.deadline.lock() = None;
    }

    /// Abort whatever runs now and every later run.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Record that a host-side resource ceiling refused the current run.
    pub fn exhaust(&self) {
        self.resource_exhausted.store(true, Ordering::SeqCst);
    }

    pub fn resource_exhausted(&self) -> bool {
        self.resource_exhausted.load(Ordering::SeqCst)
    }

    pub fn deadline_hit(&self) -> bool {
        self.deadline_hit.load(Ordering::SeqCst)
    }

    /// Time left before the deadline; `None` when unarmed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .lock()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Polled by the interpreter; `true` aborts the running code.
    pub fn should_interrupt(&self) -> bool {
        if self.is_terminated() {
            return true;
        }
        let expired = self
            .deadline
            .lock()
            .map_or(false, |deadline| Instant::now() >= deadline);
        if expired {
            self.deadline_hit.store(true, Ordering::SeqCst);
        }
        expired
    }
}

/// A unit of source handed to an isolate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeUnit {
    /// Function body; args are local bindings and the unit's return value
    /// is the result
    Function { source: String, args_json: String },
    /// Script evaluated at global scope; the result lists `module.exports`
    Script { source: String },
}

impl CodeUnit {
    /// Wrap `code` as a function body. Keys of `args` that are plain
    /// identifiers become `const` bindings; the whole object is `args`.
    pub fn function(
        code: &str,
        args: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, serde_json::Error> {
        let args_json = serde_json::to_string(args)?;
        let mut bindings = String::new();
        for key in args.keys().filter(|key| is_bindable(key)) {
            let quoted = serde_json::to_string(key)?;
            bindings.push_str(&format!("const {key} = args[{quoted}];\n"));
        }
        Ok(Self::Function {
            source: format!("(function (args) {{\n{bindings}{code}\n}})"),
            args_json,
        })
    }

    pub fn script(source: impl Into<String>) -> Self {
        Self::Script {
            source: source.into(),
        }
    }
}

fn is_bindable(key: &str) -> bool {
    IDENTIFIER.as_ref().map_or(false, |re| re.is_match(key)) && !RESERVED_WORDS.contains(&key)
}

/// What a run produced
#[derive(Debug)]
pub struct RunOutput {
    /// Serialized JSON result (`None` for `undefined`) or the failure
    pub outcome: Result<Option<String>, RawFailure>,
    /// Interpreter heap growth during the run, in bytes
    pub memory_delta: i64,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    json: Option<String>,
    /// `"oom"` when the prelude saw the interpreter run out of heap
    #[serde(default)]
    signal: Option<String>,
    #[serde(default)]
    error: Option<ThrownError>,
}

#[derive(Debug, Deserialize)]
struct ThrownError {
    #[serde(default)]
    name: Option<String>,
    message: String,
    #[serde(default)]
    stack: Option<String>,
}

enum Step {
    Envelope(String),
    Pending,
    Failed(RawFailure),
}

pub struct Isolate {
    context: Context,
    runtime: Runtime,
    budget: Arc<RunBudget>,
}

impl Isolate {
    pub fn new(
        env: &Environment,
        memory_limit: usize,
        budget: Arc<RunBudget>,
    ) -> Result<Self, SandboxRuntimeError> {
        let runtime = Runtime::new()?;
        runtime.set_memory_limit(memory_limit);
        runtime.set_max_stack_size(STACK_LIMIT);

        let handler_budget = budget.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || handler_budget.should_interrupt())));

        let context = Context::full(&runtime)?;
        context
            .with(|ctx| {
                env.install(&ctx, &budget)
                    .catch(&ctx)
                    .map_err(|e| e.to_string())
            })
            .map_err(SandboxRuntimeError::InitializationFailed)?;

        Ok(Self {
            context,
            runtime,
            budget,
        })
    }

    pub fn budget(&self) -> &Arc<RunBudget> {
        &self.budget
    }

    /// Run one unit to completion, failure or interrupt.
    ///
    /// The caller arms the budget beforehand; promises returned by the unit
    /// are settled by draining the job queue before the result is read.
    pub fn run(&self, unit: &CodeUnit) -> RunOutput {
        let before = self.memory_used();

        let step = match self.context.with(|ctx| self.start(&ctx, unit)) {
            Step::Pending => {
                self.drive_jobs();
                self.context.with(|ctx| self.collect(&ctx))
            }
            step => step,
        };

        let memory_delta = self.memory_used() - before;
        let outcome = match step {
            Step::Envelope(envelope) => decode(&envelope),
            Step::Failed(failure) => Err(failure),
            Step::Pending => Err(RawFailure::new(
                "Promise returned by the extension never settled",
            )),
        };

        RunOutput {
            outcome: outcome.map_err(|failure| self.attach_signal(failure)),
            memory_delta,
        }
    }

    fn start<'js>(&self, ctx: &Ctx<'js>, unit: &CodeUnit) -> Step {
        match unit {
            CodeUnit::Function { source, args_json } => {
                let result = ctx
                    .globals()
                    .get::<_, Function>("__sandbox_run")
                    .and_then(|run| {
                        run.call::<_, Option<String>>((source.clone(), args_json.clone()))
                    });
                match result {
                    Ok(Some(envelope)) => Step::Envelope(envelope),
                    Ok(None) => Step::Pending,
                    Err(err) => Step::Failed(describe(ctx, err)),
                }
            }
            CodeUnit::Script { source } => {
                let mut options = EvalOptions::default();
                options.strict = false;
                let evaluated = ctx
                    .eval_with_options::<(), _>(source.as_str(), options)
                    .and_then(|()| {
                        ctx.globals()
                            .get::<_, Function>("__sandbox_summary")
                            .and_then(|summary| summary.call::<_, String>(()))
                    });
                match evaluated {
                    Ok(envelope) => Step::Envelope(envelope),
                    Err(err) => Step::Failed(describe(ctx, err)),
                }
            }
        }
    }

    fn collect<'js>(&self, ctx: &Ctx<'js>) -> Step {
        let taken = ctx
            .globals()
            .get::<_, Function>("__sandbox_take")
            .and_then(|take| take.call::<_, Option<String>>(()));
        match taken {
            Ok(Some(envelope)) => Step::Envelope(envelope),
            Ok(None) => Step::Pending,
            Err(err) => Step::Failed(describe(ctx, err)),
        }
    }

    fn drive_jobs(&self) {
        while self.runtime.is_job_pending() {
            if self.runtime.execute_pending_job().is_err() {
                break;
            }
            if self.budget.should_interrupt() {
                break;
            }
        }
    }

    fn memory_used(&self) -> i64 {
        self.runtime.memory_usage().memory_used_size
    }

    fn attach_signal(&self, mut failure: RawFailure) -> RawFailure {
        if self.budget.is_terminated() {
            failure.signal = Some(FailureSignal::Terminated);
        } else if self.budget.deadline_hit() {
            failure.signal = Some(FailureSignal::DeadlineExceeded);
        } else if self.budget.resource_exhausted() {
            failure.signal = Some(FailureSignal::OutOfMemory);
        } else if failure.signal.is_none() {
            failure.signal = match failure.name.as_deref() {
                Some("SecurityError") => Some(FailureSignal::CapabilityDenied),
                Some("PermissionError") => Some(FailureSignal::PermissionMissing),
                _ => None,
            };
        }
        failure
    }
}

/// Turn an interpreter error into a raw failure, asking the prelude to
/// describe the pending exception when there is one.
fn describe<'js>(ctx: &Ctx<'js>, err: rquickjs::Error) -> RawFailure {
    match err {
        rquickjs::Error::Exception => {
            let thrown = ctx.catch();
            if thrown.is_null() {
                return RawFailure::new("out of memory").with_signal(FailureSignal::OutOfMemory);
            }
            let envelope = ctx
                .globals()
                .get::<_, Function>("__sandbox_describe")
                .and_then(|describe| describe.call::<_, String>((thrown,)));
            match envelope {
                Ok(envelope) => match decode(&envelope) {
                    Err(failure) => failure,
                    Ok(_) => RawFailure::new("Uncaught exception"),
                },
                Err(_) => RawFailure::new("Uncaught exception"),
            }
        }
        rquickjs::Error::Allocation => {
            RawFailure::new("out of memory").with_signal(FailureSignal::OutOfMemory)
        }
        other => RawFailure::new(other.to_string()),
    }
}

fn decode(envelope: &str) -> Result<Option<String>, RawFailure> {
    let envelope: Envelope = serde_json::from_str(envelope)
        .map_err(|e| RawFailure::new(format!("Malformed result envelope: {e}")))?;
    if envelope.ok {
        return Ok(envelope.json);
    }
    let thrown = envelope.error.unwrap_or(ThrownError {
        name: None,
        message: "Uncaught exception".to_string(),
        stack: None,
    });
    let signal = match envelope.signal.as_deref() {
        Some("oom") => Some(FailureSignal::OutOfMemory),
        _ => None,
    };
    Err(RawFailure {
        name: thrown.name,
        message: thrown.message,
        stack: thrown.stack,
        signal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxOptions;
    use crate::events::EventBus;
    use crate::host::{
        ExtensionStorage, GatewayError, HttpGateway, HttpRequest, HttpResponse, StorageLimits,
    };
    use crate::policy::{CapabilityPolicy, PERMISSION_STORAGE};

    struct NoNetwork;

    impl HttpGateway for NoNetwork {
        fn fetch(&self, _request: HttpRequest, _timeout: Duration) -> Result<HttpResponse, GatewayError> {
            Err(GatewayError::Transport("offline".into()))
        }
    }

    fn isolate_with(options: SandboxOptions) -> Isolate {
        let policy = CapabilityPolicy::new(
            Arc::new(ExtensionStorage::new()),
            Arc::new(NoNetwork),
            EventBus::new(16),
        );
        let env = policy.build("E1", "ctx-1", &options);
        Isolate::new(&env, options.memory_limit, Arc::new(RunBudget::new())).unwrap()
    }

    fn run(isolate: &Isolate, code: &str) -> Result<Option<String>, RawFailure> {
        let unit = CodeUnit::function(code, &serde_json::Map::new()).unwrap();
        isolate.budget().arm(Duration::from_secs(2));
        let output = isolate.run(&unit);
        isolate.budget().disarm();
        output.outcome
    }

    #[test]
    fn test_function_unit_binds_identifier_args() {
        let mut args = serde_json::Map::new();
        args.insert("count".into(), serde_json::json!(2));
        args.insert("not-an-ident".into(), serde_json::json!(1));
        args.insert("class".into(), serde_json::json!(1));

        let unit = CodeUnit::function("return count;", &args).unwrap();
        let CodeUnit::Function { source, .. } = unit else {
            panic!("expected function unit");
        };
        assert!(source.contains("const count = args[\"count\"];"));
        assert!(!source.contains("const class"));
        assert!(!source.contains("not-an-ident ="));
    }

    #[test]
    fn test_returns_serialized_result() {
        let isolate = isolate_with(SandboxOptions::default());
        assert_eq!(run(&isolate, "return 1 + 1").unwrap().as_deref(), Some("2"));
        assert_eq!(run(&isolate, "return undefined").unwrap(), None);
    }

    #[test]
    fn test_promises_are_settled() {
        let isolate = isolate_with(SandboxOptions::default());
        let result = run(&isolate, "return Promise.resolve(21).then((v) => v * 2)").unwrap();
        assert_eq!(result.as_deref(), Some("42"));

        let failure = run(&isolate, "return Promise.reject(new Error('nope'))").unwrap_err();
        assert_eq!(failure.message, "nope");
    }

    #[test]
    fn test_denied_module_raises_security_signal() {
        let isolate = isolate_with(SandboxOptions::default());
        let failure = run(&isolate, "require('fs').writeFileSync('/tmp/x', 'y')").unwrap_err();
        assert_eq!(failure.name.as_deref(), Some("SecurityError"));
        assert_eq!(failure.signal, Some(FailureSignal::CapabilityDenied));
    }

    #[test]
    fn test_ambient_globals_are_stubbed_or_removed() {
        let isolate = isolate_with(SandboxOptions::default());
        let failure = run(&isolate, "process.exit(1)").unwrap_err();
        assert_eq!(failure.signal, Some(FailureSignal::CapabilityDenied));

        let result = run(&isolate, "return [typeof eval, typeof Function, typeof Reflect]").unwrap();
        assert_eq!(result.as_deref(), Some(r#"["undefined","undefined","undefined"]"#));
    }

    #[test]
    fn test_missing_permission_signal() {
        let isolate = isolate_with(SandboxOptions::default());
        let failure = run(&isolate, "sandbox.storage.set('a', 1)").unwrap_err();
        assert_eq!(failure.signal, Some(FailureSignal::PermissionMissing));
    }

    #[test]
    fn test_storage_with_permission() {
        let mut options = SandboxOptions::default();
        options.permissions.insert(PERMISSION_STORAGE.to_string());
        let isolate = isolate_with(options);

        run(&isolate, "sandbox.storage.set('answer', { value: 42 })").unwrap();
        let result = run(&isolate, "return sandbox.storage.get('answer').value").unwrap();
        assert_eq!(result.as_deref(), Some("42"));
    }

    #[test]
    fn test_interrupt_on_deadline() {
        let isolate = isolate_with(SandboxOptions::default());
        let unit = CodeUnit::function("while (true) {}", &serde_json::Map::new()).unwrap();

        isolate.budget().arm(Duration::from_millis(50));
        let output = isolate.run(&unit);
        isolate.budget().disarm();

        let failure = output.outcome.unwrap_err();
        assert_eq!(failure.signal, Some(FailureSignal::DeadlineExceeded));

        // the isolate stays usable
        assert_eq!(run(&isolate, "return 'ok'").unwrap().as_deref(), Some("\"ok\""));
    }

    #[test]
    fn test_heap_exhaustion_raises_memory_signal() {
        let isolate = isolate_with(SandboxOptions {
            memory_limit: 8 * 1024 * 1024,
            ..SandboxOptions::default()
        });

        let failure = run(
            &isolate,
            "const a = []; while (true) { a.push('x'.repeat(1024) + a.length); }",
        )
        .unwrap_err();
        assert_eq!(failure.signal, Some(FailureSignal::OutOfMemory));
        assert_eq!(failure.message, "out of memory");

        assert_eq!(run(&isolate, "return 'ok'").unwrap().as_deref(), Some("\"ok\""));
    }

    #[test]
    fn test_storage_refusal_raises_memory_signal() {
        let policy = CapabilityPolicy::new(
            Arc::new(ExtensionStorage::with_limits(StorageLimits {
                max_bytes: 64,
                max_keys: 8,
                max_value_bytes: 32,
            })),
            Arc::new(NoNetwork),
            EventBus::new(16),
        );
        let mut options = SandboxOptions::default();
        options.permissions.insert(PERMISSION_STORAGE.to_string());
        let env = policy.build("E1", "ctx-1", &options);
        let isolate = Isolate::new(&env, options.memory_limit, Arc::new(RunBudget::new())).unwrap();

        let failure = run(&isolate, "sandbox.storage.set('big', 'x'.repeat(64))").unwrap_err();
        assert_eq!(failure.name.as_deref(), Some("QuotaExceededError"));
        assert_eq!(failure.signal, Some(FailureSignal::OutOfMemory));

        // the flag does not outlive the run that tripped it
        let failure = run(&isolate, "throw new Error('unrelated')").unwrap_err();
        assert!(failure.signal.is_none());
    }

    #[test]
    fn test_thrown_error_carries_no_signal() {
        let isolate = isolate_with(SandboxOptions::default());
        let failure = run(&isolate, "throw new RangeError('bad index')").unwrap_err();
        assert_eq!(failure.name.as_deref(), Some("RangeError"));
        assert!(failure.signal.is_none());
    }

    #[test]
    fn test_script_units_define_globals() {
        let isolate = isolate_with(SandboxOptions::default());
        let unit = CodeUnit::script(
            "function greet(name) { return 'hi ' + name; }\nmodule.exports = { greet };",
        );
        isolate.budget().arm(Duration::from_secs(2));
        let output = isolate.run(&unit);
        isolate.budget().disarm();
        assert_eq!(output.outcome.unwrap().as_deref(), Some(r#"{"exports":["greet"]}"#));

        assert_eq!(
            run(&isolate, "return greet('bob')").unwrap().as_deref(),
            Some("\"hi bob\"")
        );
    }

    #[test]
    fn test_syntax_errors_are_failures() {
        let isolate = isolate_with(SandboxOptions::default());
        let failure = run(&isolate, "return (").unwrap_err();
        assert_eq!(failure.name.as_deref(), Some("SyntaxError"));
        assert!(failure.signal.is_none());
    }
}
