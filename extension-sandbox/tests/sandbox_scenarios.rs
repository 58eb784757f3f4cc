//! End-to-end scenarios for the sandbox service
//!
//! Each test drives the public `SandboxService` API the way a transport
//! layer would:
//! 1. Simple arithmetic result
//! 2. Infinite loop hits the timeout and the context survives
//! 3. Rate limit rejects the 11th execution in a minute
//! 4. Per-extension context ceiling rejects the 4th context
//! 5. Idle context reaped without caller action
//! 6. Blocked capabilities classify as security
//! 7. Oversized output rejected
//! 8. Double destroy
//! 9. Extension loading and function calls
//! 10. Permission-gated host APIs
//! 11. Heap exhaustion and storage quota classify as memory

use extension_sandbox::*;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Gateway that answers every request with a fixed body and records URLs
#[derive(Default)]
struct RecordingGateway {
    urls: Mutex<Vec<String>>,
}

impl HttpGateway for RecordingGateway {
    fn fetch(&self, request: HttpRequest, _timeout: Duration) -> Result<HttpResponse, GatewayError> {
        self.urls.lock().unwrap().push(request.url.clone());
        Ok(HttpResponse {
            status: 200,
            headers: Default::default(),
            body: r#"{"temperature":21}"#.to_string(),
        })
    }
}

fn test_config() -> SandboxConfig {
    SandboxConfig {
        rate_limit_enabled: false,
        ..Default::default()
    }
}

fn service_with(config: SandboxConfig) -> SandboxService {
    SandboxService::builder()
        .config(config)
        .gateway(Arc::new(RecordingGateway::default()))
        .reaper(false)
        .build()
        .unwrap()
}

async fn context(service: &SandboxService, extension_id: &str) -> String {
    service
        .create_context(extension_id, Some("user-1"), ContextOptions::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_scenario_1_simple_result() {
    let service = service_with(test_config());
    let ctx = context(&service, "E1").await;

    let result = service
        .execute(&ctx, "return 1+1", serde_json::Value::Null)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.result, Some(serde_json::json!(2)));
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_args_are_local_bindings() {
    let service = service_with(test_config());
    let ctx = context(&service, "E1").await;

    let result = service
        .execute(&ctx, "return a + b + args.a", serde_json::json!({ "a": 1, "b": 2 }))
        .await
        .unwrap();
    assert_eq!(result.result, Some(serde_json::json!(4)));

    // bindings from the previous call must not leak into the global scope
    let result = service
        .execute(&ctx, "return typeof a", serde_json::Value::Null)
        .await
        .unwrap();
    assert_eq!(result.result, Some(serde_json::json!("undefined")));

    let err = service
        .execute(&ctx, "return 1", serde_json::json!([1, 2]))
        .await
        .unwrap_err();
    assert!(matches!(err, AdmissionError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_scenario_2_timeout_and_recovery() {
    let service = service_with(test_config());
    let ctx = service
        .create_context(
            "E1",
            None,
            ContextOptions::default().with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap();

    let started = Instant::now();
    let result = service
        .execute(&ctx, "while(true){}", serde_json::Value::Null)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(!result.success);
    assert_eq!(result.error_kind(), Some(SandboxErrorKind::Timeout));
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(1), "timeout took {elapsed:?}");

    let result = service
        .execute(&ctx, "return 'still here'", serde_json::Value::Null)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(service.get_context(&ctx).await.unwrap().execution_count, 2);
}

#[tokio::test]
async fn test_scenario_3_rate_limit() {
    let service = service_with(SandboxConfig {
        rate_limit_enabled: true,
        rate_limit_per_minute: 10,
        ..Default::default()
    });
    let ctx = context(&service, "E1").await;

    for _ in 0..10 {
        service
            .execute(&ctx, "return 1", serde_json::Value::Null)
            .await
            .unwrap();
    }
    let err = service
        .execute(&ctx, "return 1", serde_json::Value::Null)
        .await
        .unwrap_err();

    assert!(matches!(err, AdmissionError::RateLimited { limit: 10, .. }));
    assert!(err.retry_after().unwrap() <= Duration::from_secs(60));
    // rejected before admission: not counted as an execution
    assert_eq!(service.get_context(&ctx).await.unwrap().execution_count, 10);
}

#[tokio::test]
async fn test_scenario_4_context_ceiling() {
    let service = service_with(test_config());
    for _ in 0..3 {
        context(&service, "E1").await;
    }

    let err = service
        .create_context("E1", None, ContextOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SandboxRuntimeError::Admission(AdmissionError::ContextLimitReached { limit: 3, .. })
    ));
    assert_eq!(service.get_stats().active_contexts, 3);
}

#[tokio::test]
async fn test_scenario_5_idle_context_reaped() {
    let service = SandboxService::builder()
        .config(SandboxConfig {
            idle_ttl: Duration::from_millis(50),
            reap_interval: Duration::from_millis(20),
            ..test_config()
        })
        .gateway(Arc::new(RecordingGateway::default()))
        .build()
        .unwrap();
    let mut events = service.subscribe();
    let ctx = context(&service, "E1").await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(service.get_context(&ctx).await.is_none());
    assert_eq!(service.get_stats().active_contexts, 0);

    let mut reaped = false;
    while let Ok(event) = events.try_recv() {
        if let LifecycleEvent::ContextDestroyed { context_id, reason, .. } = event {
            assert_eq!(context_id, ctx);
            assert_eq!(reason, DestroyReason::Idle);
            reaped = true;
        }
    }
    assert!(reaped);
    service.shutdown().await;
}

#[tokio::test]
async fn test_scenario_6_blocked_capabilities_are_security() {
    let service = service_with(test_config());
    let ctx = context(&service, "E1").await;

    let attempts = [
        "require('fs').writeFileSync('/tmp/owned', 'x')",
        "require('node:fs').readFileSync('/etc/passwd')",
        "require('child_process').execSync('id')",
        "require('net').createServer()",
        "process.exit(1)",
        "setTimeout(() => {}, 10)",
        "return fetch('https://example.com')",
    ];

    for code in attempts {
        let result = service
            .execute(&ctx, code, serde_json::Value::Null)
            .await
            .unwrap();
        assert!(!result.success, "{code} should fail");
        assert_eq!(result.error_kind(), Some(SandboxErrorKind::Security), "{code}");
    }
}

#[tokio::test]
async fn test_scenario_7_output_ceiling() {
    let service = service_with(test_config());
    let ctx = service
        .create_context(
            "E1",
            None,
            ContextOptions::default().with_max_output_size(1024),
        )
        .await
        .unwrap();

    let result = service
        .execute(&ctx, "return 'a'.repeat(4096)", serde_json::Value::Null)
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.error_kind(), Some(SandboxErrorKind::Runtime));
    assert!(result.error.unwrap().message.contains("output too large"));
}

#[tokio::test]
async fn test_scenario_8_double_destroy() {
    let service = service_with(test_config());
    let first = context(&service, "E1").await;
    let _second = context(&service, "E1").await;

    assert!(service.destroy_context(&first).await);
    assert!(!service.destroy_context(&first).await);
    assert!(!service.destroy_context("never-existed").await);
    assert_eq!(service.get_stats().active_contexts, 1);

    let err = service
        .execute(&first, "return 1", serde_json::Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, AdmissionError::ContextNotFound(_)));
}

#[tokio::test]
async fn test_execution_count_tracks_completed_calls() {
    let service = service_with(test_config());
    let ctx = context(&service, "E1").await;

    let codes = ["return 1", "throw new Error('x')", "return [1,2,3]", "return undefined"];
    for (index, code) in codes.iter().enumerate() {
        service
            .execute(&ctx, code, serde_json::Value::Null)
            .await
            .unwrap();
        let snapshot = service.get_context(&ctx).await.unwrap();
        assert_eq!(snapshot.execution_count, index as u64 + 1);
    }

    let stats = service.get_stats();
    assert_eq!(stats.total_executions, 4);
    assert_eq!(stats.total_errors, 1);
    assert_eq!(stats.extensions["E1"].executions, 4);
    assert_eq!(service.get_context(&ctx).await.unwrap().errors.len(), 1);
}

#[tokio::test]
async fn test_scenario_9_load_extension_and_call_function() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("package.json"),
        r#"{"name":"greeter","main":"src/main.js"}"#,
    )
    .unwrap();
    std::fs::create_dir(dir.path().join("src")).unwrap();
    std::fs::write(
        dir.path().join("src/main.js"),
        r#"
        const util = require('util');
        function shout(text) { return text.toUpperCase(); }
        module.exports = {
            greet(name, punctuation) {
                return util.format('Hello, %s%s', name, punctuation || '!');
            },
        };
        "#,
    )
    .unwrap();

    let service = service_with(test_config());
    let ctx = context(&service, "greeter").await;

    let loaded = service.load_extension(&ctx, dir.path()).await.unwrap();
    assert!(loaded.success, "{:?}", loaded.error);
    assert_eq!(loaded.result, Some(serde_json::json!({ "exports": ["greet"] })));

    let result = service
        .call_function(&ctx, "greet", serde_json::json!(["Ada", "?"]))
        .await
        .unwrap();
    assert_eq!(result.result, Some(serde_json::json!("Hello, Ada?")));

    // top-level declarations are reachable too
    let result = service
        .call_function(&ctx, "shout", serde_json::json!("hey"))
        .await
        .unwrap();
    assert_eq!(result.result, Some(serde_json::json!("HEY")));

    let result = service
        .call_function(&ctx, "missing", serde_json::Value::Null)
        .await
        .unwrap();
    assert_eq!(result.error_kind(), Some(SandboxErrorKind::Runtime));
}

#[tokio::test]
async fn test_load_failures_are_classified_results() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(test_config());
    let ctx = context(&service, "E1").await;

    let result = service.load_extension(&ctx, dir.path()).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.error_kind(), Some(SandboxErrorKind::Runtime));

    let escaped = ExtensionDescriptor::new("E1", dir.path()).with_entry_point("../../etc/passwd");
    let result = service.load_descriptor(&ctx, &escaped).await.unwrap();
    assert!(!result.success);

    let disabled = ExtensionDescriptor::new("E1", dir.path()).disabled();
    assert!(matches!(
        service.load_descriptor(&ctx, &disabled).await,
        Err(AdmissionError::ExtensionDisabled(_))
    ));
    assert!(service
        .create_context_for(&disabled, None, ContextOptions::default())
        .await
        .is_err());
}

#[tokio::test]
async fn test_failed_load_is_a_booked_execution() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(SandboxConfig {
        rate_limit_enabled: true,
        rate_limit_per_minute: 5,
        ..Default::default()
    });
    let ctx = context(&service, "E1").await;

    let result = service.load_extension(&ctx, dir.path()).await.unwrap();
    assert!(!result.success);
    assert!(result.error.unwrap().message.contains("Failed to load extension"));

    assert_eq!(service.remaining_executions("user-1", "E1").await, 4);
    let info = service.get_context(&ctx).await.unwrap();
    assert_eq!(info.execution_count, 1);

    std::fs::write(dir.path().join("index.js"), "exports.ok = () => 1;").unwrap();
    let result = service.load_extension(&ctx, dir.path()).await.unwrap();
    assert!(result.success, "{:?}", result.error);
    assert_eq!(service.remaining_executions("user-1", "E1").await, 3);
}

#[tokio::test]
async fn test_scenario_10_permission_gated_apis() {
    let service = service_with(test_config());

    let plain = context(&service, "E1").await;
    let result = service
        .execute(&plain, "sandbox.storage.set('k', 1)", serde_json::Value::Null)
        .await
        .unwrap();
    assert_eq!(result.error_kind(), Some(SandboxErrorKind::Permission));

    let dir = tempfile::tempdir().unwrap();
    let descriptor = ExtensionDescriptor::new("E1", dir.path()).with_permissions(["storage"]);
    let writer = service
        .create_context_for(&descriptor, Some("user-1"), ContextOptions::default())
        .await
        .unwrap();
    let reader = service
        .create_context_for(&descriptor, Some("user-2"), ContextOptions::default())
        .await
        .unwrap();

    service
        .execute(
            &writer,
            "sandbox.storage.set('profile', { theme: 'dark' })",
            serde_json::Value::Null,
        )
        .await
        .unwrap();
    let result = service
        .execute(&reader, "return sandbox.storage.get('profile')", serde_json::Value::Null)
        .await
        .unwrap();
    assert_eq!(result.result, Some(serde_json::json!({ "theme": "dark" })));

    // storage is scoped per extension
    let other = context(&service, "E2").await;
    let result = service
        .execute(&other, "return sandbox.storage.keys()", serde_json::Value::Null)
        .await
        .unwrap();
    assert_eq!(result.error_kind(), Some(SandboxErrorKind::Permission));
    assert!(service.storage().keys("E2").is_empty());
}

#[tokio::test]
async fn test_scenario_11_heap_exhaustion_is_memory() {
    let service = service_with(test_config());
    let ctx = service
        .create_context(
            "E1",
            Some("user-1"),
            ContextOptions::default().with_memory_limit(8 * 1024 * 1024),
        )
        .await
        .unwrap();

    let result = service
        .execute(
            &ctx,
            "const a = []; while (true) { a.push('x'.repeat(1024) + a.length); }",
            serde_json::Value::Null,
        )
        .await
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.error_kind(), Some(SandboxErrorKind::Memory));

    let result = service
        .execute(&ctx, "return 'still alive'", serde_json::Value::Null)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.result, Some(serde_json::json!("still alive")));

    let stats = service.get_stats();
    assert_eq!(stats.errors_by_kind.get(&SandboxErrorKind::Memory), Some(&1));
}

#[tokio::test]
async fn test_storage_quota_bounds_host_memory() {
    let service = service_with(SandboxConfig {
        storage_max_bytes: 4 * 1024 * 1024,
        storage_max_value_bytes: 1024 * 1024,
        ..test_config()
    });
    let dir = tempfile::tempdir().unwrap();
    let descriptor = ExtensionDescriptor::new("E1", dir.path()).with_permissions(["storage"]);
    let ctx = service
        .create_context_for(
            &descriptor,
            Some("user-1"),
            ContextOptions::default().with_memory_limit(8 * 1024 * 1024),
        )
        .await
        .unwrap();

    let fill = "const chunk = 'x'.repeat(900 * 1024);\n\
                for (let i = 0; i < 20; i++) { sandbox.storage.set('k' + round + '-' + i, chunk); }";
    let mut kinds = Vec::new();
    for round in 0..5 {
        let result = service
            .execute(&ctx, fill, serde_json::json!({ "round": round }))
            .await
            .unwrap();
        kinds.push(result.error_kind());
    }

    assert!(kinds.iter().all(|kind| *kind == Some(SandboxErrorKind::Memory)));
    assert!(service.storage().usage("E1") <= 4 * 1024 * 1024);

    // a single oversized value is refused outright
    let result = service
        .execute(
            &ctx,
            "sandbox.storage.set('huge', 'y'.repeat(2 * 1024 * 1024))",
            serde_json::Value::Null,
        )
        .await
        .unwrap();
    assert_eq!(result.error_kind(), Some(SandboxErrorKind::Memory));
    assert!(result.error.unwrap().message.contains("QuotaExceededError"));
    assert!(service.storage().get("E1", "huge").is_none());

    // stored data stays readable after refusals
    let result = service
        .execute(&ctx, "return sandbox.storage.keys().length", serde_json::Value::Null)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.result, Some(serde_json::json!(4)));
}

#[tokio::test]
async fn test_http_fetch_allow_list() {
    let gateway = Arc::new(RecordingGateway::default());
    let service = SandboxService::builder()
        .config(test_config())
        .gateway(gateway.clone())
        .reaper(false)
        .build()
        .unwrap();
    let ctx = service
        .create_context(
            "weather",
            None,
            ContextOptions::default()
                .with_permissions(["network"])
                .with_allowed_hosts(["api.weather.test"]),
        )
        .await
        .unwrap();

    let result = service
        .execute(
            &ctx,
            "return sandbox.http.fetch('https://api.weather.test/now').then((r) => r.json())",
            serde_json::Value::Null,
        )
        .await
        .unwrap();
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.result, Some(serde_json::json!({ "temperature": 21 })));

    let result = service
        .execute(
            &ctx,
            "return sandbox.http.fetch('https://exfil.example/steal')",
            serde_json::Value::Null,
        )
        .await
        .unwrap();
    assert_eq!(result.error_kind(), Some(SandboxErrorKind::Security));

    assert_eq!(
        *gateway.urls.lock().unwrap(),
        vec!["https://api.weather.test/now".to_string()]
    );
}

#[tokio::test]
async fn test_extension_events_reach_subscribers() {
    let service = service_with(test_config());
    let mut events = service.subscribe();
    let ctx = service
        .create_context("E1", None, ContextOptions::default().with_permissions(["events"]))
        .await
        .unwrap();

    let result = service
        .execute(
            &ctx,
            r#"
            let seen = null;
            sandbox.events.subscribe('ping', (payload) => { seen = payload.n; });
            const delivered = sandbox.events.emit('ping', { n: 7 });
            return [delivered, seen];
            "#,
            serde_json::Value::Null,
        )
        .await
        .unwrap();
    assert_eq!(result.result, Some(serde_json::json!([1, 7])));

    let mut published = None;
    while let Ok(event) = events.try_recv() {
        if let LifecycleEvent::Extension(event) = event {
            published = Some(event);
        }
    }
    let published = published.unwrap();
    assert_eq!(published.name, "ping");
    assert_eq!(published.payload, serde_json::json!({ "n": 7 }));
    assert_eq!(published.context_id, ctx);
}

#[tokio::test]
async fn test_kill_extension_and_emergency_stop() {
    let service = service_with(test_config());
    context(&service, "E1").await;
    context(&service, "E1").await;
    context(&service, "E2").await;

    assert_eq!(service.kill_extension_contexts("E1").await, 2);
    assert_eq!(service.get_active_contexts().await.len(), 1);

    assert_eq!(service.emergency_stop().await, 1);
    assert!(service.get_active_contexts().await.is_empty());

    let stats = service.get_stats();
    assert_eq!(stats.active_contexts, 0);
    assert_eq!(stats.total_contexts, 3);
    assert_eq!(service.health().status, HealthStatus::Healthy);
}

#[tokio::test]
async fn test_console_and_shims_run_inside_sandbox() {
    let service = service_with(test_config());
    let ctx = context(&service, "E1").await;

    let result = service
        .execute(
            &ctx,
            r#"
            console.log('user %s paid with card 4111 1111 1111 1111', 'ada@example.com');
            const { EventEmitter } = require('events');
            const emitter = new EventEmitter();
            let hits = 0;
            emitter.on('tick', () => hits++);
            emitter.emit('tick');
            const id = require('uuid').v4();
            return { hits, idLength: id.length };
            "#,
            serde_json::Value::Null,
        )
        .await
        .unwrap();
    assert_eq!(result.result, Some(serde_json::json!({ "hits": 1, "idLength": 36 })));
}
