use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use pluglet::config::FetchConfig;
use pluglet::marshal::FetchResponse;
use pluglet::shim::FETCH_SHIM;
use pluglet::{
    DelegateError, DelegateSet, FailureKind, FetchDelegate, HostDelegate, PluginRequest,
    PluginRunner, PlugletError, SandboxLimits,
};

/// Stands in for the network: records each request and answers from a script.
struct StubFetch {
    reply: std::result::Result<Value, String>,
    delay: Option<Duration>,
    seen: Mutex<Vec<Value>>,
}

impl StubFetch {
    fn ok(response: FetchResponse) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(serde_json::to_value(response).unwrap()),
            delay: None,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Err(message.to_string()),
            delay: None,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(serde_json::to_value(FetchResponse::ok_json(json!(null))).unwrap()),
            delay: Some(delay),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn urls(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|args| args["url"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

#[async_trait]
impl HostDelegate for StubFetch {
    fn name(&self) -> &str {
        "fetch"
    }

    fn shim(&self) -> &str {
        FETCH_SHIM
    }

    async fn call(&self, args: Value) -> std::result::Result<Value, DelegateError> {
        self.seen.lock().unwrap().push(args);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.reply.clone().map_err(DelegateError::new)
    }
}

fn runner_with(limits: SandboxLimits, stub: Arc<StubFetch>) -> PluginRunner {
    PluginRunner::new(limits, DelegateSet::new().with(stub))
}

fn runner(stub: Arc<StubFetch>) -> PluginRunner {
    runner_with(SandboxLimits::default(), stub)
}

fn plain_runner() -> PluginRunner {
    PluginRunner::new(SandboxLimits::default(), DelegateSet::new())
}

// ============================================================================
// Core scenarios
// ============================================================================

#[tokio::test]
async fn test_returns_plugin_result() {
    let request = PluginRequest::new("add", "function add(p) { return p.a + p.b; }")
        .with_params(json!({"a": 2, "b": 3}));

    let value = plain_runner().run_value(&request).await.unwrap();
    assert_eq!(value, json!(5));
}

#[tokio::test]
async fn test_fetch_through_delegate() {
    let stub = StubFetch::ok(FetchResponse::ok_json(json!({"x": 1})));
    let runner = runner(stub.clone());
    let request = PluginRequest::new(
        "load",
        r#"async function load(p) { return await (await fetch(p.url)).json(); }"#,
    )
    .with_params(json!({"url": "https://api.example.com/x"}));

    let outcome = runner.run(&request).await.unwrap();
    assert_eq!(outcome.value, json!({"x": 1}));
    assert_eq!(outcome.delegate_calls, 1);
    assert_eq!(stub.urls(), vec!["https://api.example.com/x"]);
}

#[tokio::test]
async fn test_delegate_failure_is_catchable() {
    let runner = runner(StubFetch::failing("network down"));
    let request = PluginRequest::new(
        "safe",
        r#"async function safe() {
            try {
                await fetch("https://api.example.com");
                return "fetched";
            } catch (e) {
                return e.message === "network down" ? "fallback" : e.message;
            }
        }"#,
    );

    assert_eq!(runner.run_value(&request).await.unwrap(), json!("fallback"));
}

#[tokio::test]
async fn test_uncaught_delegate_failure() {
    let runner = runner(StubFetch::failing("network down"));
    let request = PluginRequest::new(
        "load",
        r#"async function load() { return (await fetch("https://api.example.com")).status; }"#,
    );

    let err = runner.run(&request).await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::Capability);
    match err {
        PlugletError::Capability {
            capability,
            message,
        } => {
            assert_eq!(capability, "fetch");
            assert_eq!(message, "network down");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_missing_entry_point() {
    let runner = plain_runner();
    let request = PluginRequest::new("missing", "function other() { return 1; }");

    let err = runner.run(&request).await.unwrap_err();
    assert!(matches!(err, PlugletError::EntryPointNotFound { ref name } if name == "missing"));
    assert_eq!(runner.live_contexts(), 0);
}

#[tokio::test]
async fn test_memory_ceiling() {
    let limits = SandboxLimits {
        memory_limit_bytes: 16 * 1024 * 1024,
        ..Default::default()
    };
    let runner = PluginRunner::new(limits, DelegateSet::new());
    let request = PluginRequest::new(
        "grow",
        "function grow() { const keep = []; for (;;) keep.push(new Array(100000).fill(1)); }",
    );

    let err = runner.run(&request).await.unwrap_err();
    assert!(matches!(err, PlugletError::MemoryLimitExceeded { limit_mb: 16 }));
    assert_eq!(err.kind(), FailureKind::ResourceLimit);
    assert_eq!(runner.live_contexts(), 0);
}

#[tokio::test]
async fn test_memory_failure_does_not_affect_concurrent_run() {
    let limits = SandboxLimits {
        memory_limit_bytes: 16 * 1024 * 1024,
        ..Default::default()
    };
    let runner = PluginRunner::new(limits, DelegateSet::new());
    let greedy = PluginRequest::new(
        "grow",
        "function grow() { const keep = []; for (;;) keep.push(new Array(100000).fill(1)); }",
    );
    let modest = PluginRequest::new(
        "sum",
        "function sum() { let t = 0; for (let i = 1; i <= 1000; i++) t += i; return t; }",
    );

    let (greedy, modest) = tokio::join!(runner.run(&greedy), runner.run(&modest));
    assert!(greedy.is_err());
    assert_eq!(modest.unwrap().value, json!(500500));
}

// ============================================================================
// Isolation and copying
// ============================================================================

#[tokio::test]
async fn test_contexts_are_never_reused() {
    let runner = plain_runner();
    let request = PluginRequest::new(
        "count",
        "globalThis.counter = (globalThis.counter || 0) + 1; function count() { return counter; }",
    );

    assert_eq!(runner.run_value(&request).await.unwrap(), json!(1));
    assert_eq!(runner.run_value(&request).await.unwrap(), json!(1));
}

#[tokio::test]
async fn test_results_are_copies() {
    let runner = plain_runner();
    let request = PluginRequest::new(
        "echo",
        "function echo(p) { p.list.push(4); p.extra = true; return p; }",
    )
    .with_params(json!({"list": [1, 2, 3]}));

    let value = runner.run_value(&request).await.unwrap();
    assert_eq!(value, json!({"list": [1, 2, 3, 4], "extra": true}));
    assert_eq!(request.params, json!({"list": [1, 2, 3]}));
}

#[tokio::test]
async fn test_settings_are_second_argument() {
    let request = PluginRequest::new("greet", "function greet(p, s) { return s.greeting + ', ' + p.who; }")
        .with_params(json!({"who": "world"}))
        .with_settings(json!({"greeting": "hello"}));

    let value = plain_runner().run_value(&request).await.unwrap();
    assert_eq!(value, json!("hello, world"));
}

#[tokio::test]
async fn test_undefined_result_is_null() {
    let request = PluginRequest::new("nothing", "function nothing() {}");
    assert_eq!(plain_runner().run_value(&request).await.unwrap(), Value::Null);
}

#[tokio::test]
async fn test_host_globals_are_absent() {
    let runner = runner(StubFetch::ok(FetchResponse::ok_json(json!(null))));
    let request = PluginRequest::new(
        "globals",
        r#"function globals() {
            return {
                require: typeof require,
                process: typeof process,
                call: typeof __pluglet_call,
                log: typeof __pluglet_log,
                bind: typeof __pluglet_bind,
                mark: typeof __pluglet_mark,
                fetch: typeof fetch,
                console: typeof console.log,
                global: global === globalThis,
            };
        }"#,
    );

    let value = runner.run_value(&request).await.unwrap();
    assert_eq!(
        value,
        json!({
            "require": "undefined",
            "process": "undefined",
            "call": "undefined",
            "log": "undefined",
            "bind": "undefined",
            "mark": "undefined",
            "fetch": "function",
            "console": "function",
            "global": true,
        })
    );
}

#[tokio::test]
async fn test_fetch_absent_without_capability() {
    let request = PluginRequest::new("kind", "function kind() { return typeof fetch; }");
    assert_eq!(plain_runner().run_value(&request).await.unwrap(), json!("undefined"));
}

#[tokio::test]
async fn test_console_output_does_not_disturb_result() {
    let request = PluginRequest::new(
        "chatty",
        r#"function chatty() {
            console.log("plain", {nested: [1]}, 3);
            console.warn(new Error("careful"));
            console.error(undefined);
            return "done";
        }"#,
    );
    assert_eq!(plain_runner().run_value(&request).await.unwrap(), json!("done"));
}

// ============================================================================
// Response surface
// ============================================================================

#[tokio::test]
async fn test_response_object_surface() {
    let mut headers = std::collections::BTreeMap::new();
    headers.insert("Content-Type".to_string(), "application/json".to_string());
    let stub = StubFetch::ok(FetchResponse::new(201, "Created", headers, json!({"name": "é"})));
    let request = PluginRequest::new(
        "inspect",
        r#"async function inspect() {
            const res = await fetch("https://api.example.com/items", { method: "POST", body: { a: 1 } });
            const copy = res.clone();
            const blob = await res.blob();
            return {
                ok: res.ok,
                status: res.status,
                statusText: res.statusText,
                contentType: res.headers.get("CONTENT-TYPE"),
                hasMissing: res.headers.has("x-missing"),
                headerKeys: Object.keys(res.headers),
                text: await res.text(),
                cloned: await copy.json(),
                blobSize: blob.size,
                blobType: blob.type,
                emptyBuffer: (await res.arrayBuffer()).byteLength,
            };
        }"#,
    );

    let value = runner(stub.clone()).run_value(&request).await.unwrap();
    assert_eq!(value["ok"], true);
    assert_eq!(value["status"], 201);
    assert_eq!(value["statusText"], "Created");
    assert_eq!(value["contentType"], "application/json");
    assert_eq!(value["hasMissing"], false);
    assert_eq!(value["headerKeys"], json!(["content-type"]));
    assert_eq!(value["text"], r#"{"name":"é"}"#);
    assert_eq!(value["cloned"], json!({"name": "é"}));
    assert_eq!(value["blobSize"], 13);
    assert_eq!(value["blobType"], "application/json");
    assert_eq!(value["emptyBuffer"], 0);

    let seen = stub.seen.lock().unwrap();
    assert_eq!(seen[0]["options"]["method"], "POST");
    assert_eq!(seen[0]["options"]["body"], json!({"a": 1}));
}

#[tokio::test]
async fn test_text_and_blob_encode_string_data() {
    let stub = StubFetch::ok(FetchResponse::ok_json(json!("abc")));
    let request = PluginRequest::new(
        "read",
        r#"async function read() {
            const r = await fetch("https://h");
            return [await r.text(), await (await r.blob()).text()];
        }"#,
    );

    let value = runner(stub).run_value(&request).await.unwrap();
    assert_eq!(value, json!(["\"abc\"", "\"abc\""]));
}

#[tokio::test]
async fn test_fetch_against_http_server() {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/quote"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"quote": "hi"})))
        .mount(&server)
        .await;

    let fetch = FetchDelegate::new(FetchConfig::default()).unwrap();
    let runner = PluginRunner::new(SandboxLimits::default(), DelegateSet::new().with(Arc::new(fetch)));
    let request = PluginRequest::new(
        "quote",
        r#"async function quote(p) {
            const res = await fetch(p.base + "/quote");
            if (!res.ok) throw new Error("status " + res.status);
            return (await res.json()).quote;
        }"#,
    )
    .with_params(json!({"base": server.uri()}));

    assert_eq!(runner.run_value(&request).await.unwrap(), json!("hi"));
}

// ============================================================================
// Delegate call handling
// ============================================================================

#[tokio::test]
async fn test_delegate_calls_observed_in_issue_order() {
    let stub = StubFetch::ok(FetchResponse::ok_json(json!(true)));
    let runner = runner(stub.clone());
    let request = PluginRequest::new(
        "many",
        r#"async function many() {
            const all = await Promise.all(["a", "b", "c"].map((u) => fetch("https://h/" + u)));
            return all.length;
        }"#,
    );

    let outcome = runner.run(&request).await.unwrap();
    assert_eq!(outcome.value, json!(3));
    assert_eq!(outcome.delegate_calls, 3);
    assert_eq!(stub.urls(), vec!["https://h/a", "https://h/b", "https://h/c"]);
}

#[tokio::test]
async fn test_delegate_call_cap() {
    let limits = SandboxLimits {
        max_delegate_calls: 2,
        ..Default::default()
    };
    let stub = StubFetch::ok(FetchResponse::ok_json(json!(1)));
    let runner = runner_with(limits, stub.clone());
    let request = PluginRequest::new(
        "greedy",
        r#"async function greedy() {
            await fetch("https://h/1");
            await fetch("https://h/2");
            try {
                await fetch("https://h/3");
                return "unbounded";
            } catch (e) {
                return e.message;
            }
        }"#,
    );

    let value = runner.run_value(&request).await.unwrap();
    assert_eq!(value, json!("delegate call limit of 2 reached"));
    assert_eq!(stub.urls().len(), 2);
}

// ============================================================================
// Failures and teardown
// ============================================================================

#[tokio::test]
async fn test_teardown_after_repeated_failures() {
    let runner = plain_runner();
    let failing = [
        PluginRequest::new("boom", "function boom() { throw new TypeError('bad input'); }"),
        PluginRequest::new("boom", "function boom( {"),
        PluginRequest::new("absent", "var x = 1;"),
        PluginRequest::new("boom", "async function boom() { return 10n; }"),
    ];

    for _ in 0..5 {
        for request in &failing {
            assert!(runner.run(request).await.is_err());
            assert_eq!(runner.live_contexts(), 0);
        }
    }
}

#[tokio::test]
async fn test_plugin_error_keeps_name_and_message() {
    let request = PluginRequest::new("boom", "function boom() { throw new TypeError('bad input'); }");
    let err = plain_runner().run(&request).await.unwrap_err();
    assert_eq!(err.to_string(), "TypeError: bad input");
    assert_eq!(err.kind(), FailureKind::Plugin);
}

#[tokio::test]
async fn test_error_names_cannot_claim_host_failures() {
    let forged = [
        ("function boom() { throw new Error('out of memory'); }", "Error"),
        (
            "function boom() { throw new RangeError('Maximum call stack size exceeded'); }",
            "RangeError",
        ),
        (
            "function boom() { const e = new Error('gone'); e.name = 'PluginLookupError'; throw e; }",
            "PluginLookupError",
        ),
        (
            "function boom() { const e = new Error('no'); e.name = 'CapabilityError'; e.capability = 'fetch'; throw e; }",
            "CapabilityError",
        ),
    ];

    let runner = plain_runner();
    for (code, expected) in forged {
        let err = runner.run(&PluginRequest::new("boom", code)).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Plugin, "{code}");
        match err {
            PlugletError::PluginThrew { name, .. } => assert_eq!(name, expected),
            other => panic!("{code}: unexpected error: {other}"),
        }
    }
    assert_eq!(runner.live_contexts(), 0);
}

#[tokio::test]
async fn test_rethrown_delegate_failure_stays_capability() {
    let runner = runner(StubFetch::failing("network down"));
    let request = PluginRequest::new(
        "load",
        r#"async function load() {
            try {
                await fetch("https://h");
            } catch (e) {
                e.message = "still down";
                throw e;
            }
        }"#,
    );

    let err = runner.run(&request).await.unwrap_err();
    assert!(matches!(err, PlugletError::Capability { ref capability, .. } if capability == "fetch"));
}

#[tokio::test]
async fn test_unserializable_result() {
    let request = PluginRequest::new("big", "function big() { return 10n; }");
    let err = plain_runner().run(&request).await.unwrap_err();
    assert!(matches!(err, PlugletError::Marshal(_)));
}

#[tokio::test]
async fn test_syntax_error() {
    let request = PluginRequest::new("broken", "function broken( {");
    let err = plain_runner().run(&request).await.unwrap_err();
    assert!(matches!(err, PlugletError::Evaluation { .. }));
}

#[tokio::test]
async fn test_invalid_entry_name() {
    let request = PluginRequest::new("delete", "function x() {}");
    let err = plain_runner().run(&request).await.unwrap_err();
    assert!(matches!(err, PlugletError::InvalidEntryPoint { .. }));
}

#[tokio::test]
async fn test_infinite_loop_times_out() {
    let limits = SandboxLimits {
        timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let runner = PluginRunner::new(limits, DelegateSet::new());
    let request = PluginRequest::new("spin", "function spin() { for (;;) {} }");

    let err = runner.run(&request).await.unwrap_err();
    assert!(matches!(err, PlugletError::Timeout { timeout_ms: 200 }));
    assert!(err.is_retryable());
    assert_eq!(runner.live_contexts(), 0);
}

#[tokio::test]
async fn test_deadline_after_await_times_out() {
    let limits = SandboxLimits {
        timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let runner = runner_with(limits, StubFetch::ok(FetchResponse::ok_json(json!(null))));
    let spinning = [
        "async function spin() { for (;;) await null; }",
        "async function spin() { await null; for (;;) {} }",
        "async function spin() { await fetch('https://h'); for (;;) {} }",
    ];

    for code in spinning {
        let err = runner.run(&PluginRequest::new("spin", code)).await.unwrap_err();
        assert!(matches!(err, PlugletError::Timeout { timeout_ms: 200 }), "{code}: {err}");
        assert_eq!(runner.live_contexts(), 0);
    }

    // The host process survives and still runs plugins
    let request = PluginRequest::new("ok", "function ok() { return 1; }");
    assert_eq!(runner.run_value(&request).await.unwrap(), json!(1));
}

#[tokio::test]
async fn test_slow_delegate_times_out() {
    let limits = SandboxLimits {
        timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let runner = runner_with(limits, StubFetch::slow(Duration::from_secs(5)));
    let request = PluginRequest::new("wait", "async function wait() { await fetch('https://h'); }");

    let err = runner.run(&request).await.unwrap_err();
    assert!(matches!(err, PlugletError::Timeout { .. }));
}

#[tokio::test]
async fn test_never_settling_promise() {
    let request = PluginRequest::new("stuck", "function stuck() { return new Promise(() => {}); }");
    let err = plain_runner().run(&request).await.unwrap_err();
    assert!(matches!(err, PlugletError::EntryPointNeverSettled));
}

#[tokio::test]
async fn test_deep_recursion_is_contained() {
    let request = PluginRequest::new("deep", "function deep(n) { return deep(n + 1) + 1; }")
        .with_params(json!(0));
    let err = plain_runner().run(&request).await.unwrap_err();
    assert!(matches!(err, PlugletError::StackOverflow));
}

#[tokio::test]
async fn test_oversized_result() {
    let limits = SandboxLimits {
        max_output_bytes: 64,
        ..Default::default()
    };
    let runner = PluginRunner::new(limits, DelegateSet::new());
    let request = PluginRequest::new("wide", "function wide() { return 'x'.repeat(1000); }");

    let err = runner.run(&request).await.unwrap_err();
    assert!(matches!(err, PlugletError::OutputTooLarge { max: 64, .. }));
}

#[tokio::test]
async fn test_concurrency_limit() {
    let limits = SandboxLimits {
        max_concurrent: 1,
        ..Default::default()
    };
    let runner = runner_with(limits, StubFetch::slow(Duration::from_millis(300)));
    let slow = PluginRequest::new("slow", "async function slow() { await fetch('https://h'); return 1; }");
    let quick = PluginRequest::new("quick", "function quick() { return 2; }");

    let (first, second) = tokio::join!(runner.run(&slow), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        runner.run(&quick).await
    });

    assert_eq!(first.unwrap().value, json!(1));
    assert!(matches!(second.unwrap_err(), PlugletError::ConcurrencyLimit { max: 1 }));
}

#[tokio::test]
async fn test_dropped_invocation_is_torn_down() {
    let runner = plain_runner();
    let request = PluginRequest::new("spin", "function spin() { for (;;) {} }");

    let abandoned = tokio::time::timeout(Duration::from_millis(100), runner.run(&request)).await;
    assert!(abandoned.is_err());

    let request = PluginRequest::new("spin", "async function spin() { await null; for (;;) {} }");
    let abandoned = tokio::time::timeout(Duration::from_millis(100), runner.run(&request)).await;
    assert!(abandoned.is_err());

    for _ in 0..40 {
        if runner.live_contexts() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(runner.live_contexts(), 0);
}
