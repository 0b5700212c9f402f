//! End-to-end runs through the real worker process

mod common;

use assert_matches::assert_matches;
use common::{handler_flow, message, runner, setup_test_logging, test_config};
use flowrun_common::{FlowDefinition, FlowError, MessageInstance, MessageRequest};
use flowrun_sandbox::{FlowRunner, RunnerConfig};
use serde_json::json;
use std::io::Write;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_echo_handler() {
    let flow = handler_flow("function index(ctx, c) { ctx.succeed({ echo: c.value }); }", 2)
        .with_default_handler("index");
    let success = runner()
        .run(flow, message(json!({ "value": 42 })), Some("txn-1".to_string()))
        .await
        .unwrap();

    assert_eq!(success.result, json!({ "echo": 42 }));
    assert!(success.duration_ms > 0);
}

#[tokio::test]
async fn test_untyped_input() {
    let success = runner()
        .run_value(
            json!({
                "script": "function index(ctx, c) { ctx.succeed(c.items.length); }",
                "runtimeVersion": "1.2.0",
                "timeout": 2
            }),
            json!({ "content": { "items": [1, 2, 3] } }),
            None,
        )
        .await
        .unwrap();
    assert_eq!(success.result, json!(3));
}

#[tokio::test]
async fn test_legacy_script_runs_at_global_scope() {
    let flow = FlowDefinition::new("context.succeed(context.content.value * 2);").with_timeout(2);
    let success = runner().run(flow, message(json!({ "value": 21 })), None).await.unwrap();
    assert_eq!(success.result, json!(42));
}

#[tokio::test]
async fn test_default_handler_override() {
    let flow = handler_flow("function process(context, content) { context.succeed(content.x); }", 2)
        .with_default_handler("process");
    let success = runner().run(flow, message(json!({ "x": "hello" })), None).await.unwrap();
    assert_eq!(success.result, json!("hello"));
}

#[tokio::test]
async fn test_child_handler_overrides_default() {
    let script = r#"
        function index(ctx) { ctx.succeed("index"); }
        function onChild(ctx, c) { ctx.succeed("child:" + c.n); }
    "#;
    let mut msg = MessageInstance::new(json!({ "n": 7 }));
    msg.request = Some(MessageRequest {
        child_handler: Some("onChild".to_string()),
        ..Default::default()
    });

    let success = runner().run(handler_flow(script, 2), msg, None).await.unwrap();
    assert_eq!(success.result, json!("child:7"));
}

#[tokio::test]
async fn test_handler_throw_is_script_failure() {
    let flow = handler_flow("function index() { throw new Error(\"boom\"); }", 2);
    let err = runner().run(flow, message(json!({})), None).await.unwrap_err();

    assert_eq!(err.message(), "boom");
    assert!(err.stack().is_some());
    assert_matches!(err, FlowError::ScriptThrown(_));
}

#[tokio::test]
async fn test_rejected_promise_carries_partial_result() {
    let script = r#"
        async function index(ctx, c) {
            const err = new Error("half done");
            err.result = { processed: c.count };
            throw err;
        }
    "#;
    let err = runner()
        .run(handler_flow(script, 2), message(json!({ "count": 5 })), None)
        .await
        .unwrap_err();

    assert_eq!(err.message(), "half done");
    assert_eq!(err.result(), Some(&json!({ "processed": 5 })));
}

#[tokio::test]
async fn test_first_terminal_call_wins() {
    let script = r#"
        function index(ctx) {
            ctx.fail(new Error("first"));
            ctx.succeed("second");
        }
    "#;
    let err = runner()
        .run(handler_flow(script, 2), message(json!({})), None)
        .await
        .unwrap_err();
    assert_eq!(err.message(), "first");
}

#[tokio::test]
async fn test_infinite_loop_times_out() {
    let flow = handler_flow("function index() { while (true) {} }", 1);
    let started = Instant::now();
    let err = runner().run(flow, message(json!({})), None).await.unwrap_err();

    assert_matches!(err, FlowError::Timeout { after } if after == Duration::from_secs(1));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_missing_outcome_fails_fast() {
    let flow = handler_flow("function index() { }", 5);
    let started = Instant::now();
    let err = runner().run(flow, message(json!({})), None).await.unwrap_err();

    assert_matches!(err, FlowError::ScriptThrown(_));
    assert!(err.message().contains("without calling"));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_concurrent_runs_are_isolated() {
    let script = r#"
        async function index(ctx, c) {
            const seen = globalThis.marker;
            globalThis.marker = c.id;
            await Promise.resolve();
            ctx.succeed({ seen: seen === undefined ? null : seen, mine: globalThis.marker });
        }
    "#;
    let (a, b) = (runner(), runner());
    let (first, second) = tokio::join!(
        a.run(handler_flow(script, 2), message(json!({ "id": "a" })), None),
        b.run(handler_flow(script, 2), message(json!({ "id": "b" })), None),
    );

    assert_eq!(first.unwrap().result, json!({ "seen": null, "mine": "a" }));
    assert_eq!(second.unwrap().result, json!({ "seen": null, "mine": "b" }));
}

#[tokio::test]
async fn test_busy_runner_rejects_second_run() {
    let runner = runner();
    let slow = handler_flow("function index() { while (true) {} }", 1);
    let pending = runner.start(slow, message(json!({})), None).await.unwrap();

    let quick = handler_flow("function index(ctx) { ctx.succeed(1); }", 1);
    let err = runner.start(quick.clone(), message(json!({})), None).await.unwrap_err();
    assert_matches!(err, FlowError::Busy);

    assert_matches!(pending.await, Err(FlowError::Timeout { .. }));
    let success = runner.run(quick, message(json!({})), None).await.unwrap();
    assert_eq!(success.result, json!(1));
}

#[tokio::test]
async fn test_raw_string_input_rejected() {
    let err = runner()
        .run_value(json!("context.succeed(1)"), json!({ "content": {} }), None)
        .await
        .unwrap_err();
    assert_matches!(err, FlowError::Configuration(_));

    let err = runner()
        .run_value(json!({ "script": "context.succeed(1)" }), json!("payload"), None)
        .await
        .unwrap_err();
    assert_matches!(err, FlowError::Configuration(_));
}

#[tokio::test]
async fn test_syntax_error_never_launches() {
    let config = RunnerConfig {
        worker_program: Some("/nonexistent/flowrun-worker".into()),
        ..test_config()
    };
    let flow = handler_flow("function index(ctx { ctx.succeed(1); }", 2);
    let err = FlowRunner::new(config).run(flow, message(json!({})), None).await.unwrap_err();
    assert_matches!(err, FlowError::Compile(_));
}

#[tokio::test]
async fn test_utilities_available_to_scripts() {
    let script = r#"
        function index(ctx, c) {
            const names = ctx.utils.jsonPath(c, "$.people[*].name");
            const later = ctx.utils.addToDate("2024-01-31T00:00:00Z", 1, "month");
            const doc = ctx.utils.parseXml("<a><b>x</b></a>");
            ctx.succeed({ names, later, b: doc.a.b[0] });
        }
    "#;
    let content = json!({ "people": [{ "name": "Ada" }, { "name": "Lin" }] });
    let success = runner().run(handler_flow(script, 2), message(content), None).await.unwrap();

    assert_eq!(success.result["names"], json!(["Ada", "Lin"]));
    assert_eq!(success.result["later"], json!("2024-02-29T00:00:00.000Z"));
    assert_eq!(success.result["b"], json!("x"));
}

#[tokio::test]
async fn test_host_callbacks_reject_without_endpoint() {
    let script = r#"
        async function index(ctx) {
            try {
                await ctx.getFacility();
                ctx.succeed("unexpected");
            } catch (e) {
                ctx.succeed(e.message);
            }
        }
    "#;
    let success = runner()
        .run(handler_flow(script, 2), message(json!({})), None)
        .await
        .unwrap();
    assert_eq!(success.result, json!("host callbacks are not configured"));
}

#[tokio::test]
async fn test_config_file_parameters_reach_script() {
    setup_test_logging();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "worker_program = {:?}\nenvironment = \"test\"\nkill_grace = \"500ms\"\n\n[parameters]\ngreeting = \"hello\"",
        common::worker_binary().display().to_string()
    )
    .unwrap();

    let config = RunnerConfig::load(file.path()).unwrap();
    assert_eq!(config.kill_grace, Duration::from_millis(500));

    let flow = handler_flow("function index(ctx) { ctx.succeed(ctx.parameters.greeting); }", 2);
    let success = FlowRunner::new(config).run(flow, message(json!({})), None).await.unwrap();
    assert_eq!(success.result, json!("hello"));
}

#[tokio::test]
async fn test_read_file_under_configured_root() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("note.txt"), "from disk").unwrap();

    let config = RunnerConfig {
        allow_filesystem: true,
        filesystem_root: Some(dir.path().to_path_buf()),
        ..test_config()
    };
    let flow = handler_flow("function index(ctx) { ctx.succeed(ctx.readFile(\"note.txt\")); }", 2);
    let success = FlowRunner::new(config).run(flow, message(json!({})), None).await.unwrap();
    assert_eq!(success.result, json!("from disk"));
}

#[tokio::test]
async fn test_heap_exhaustion_is_process_exit() {
    let config = RunnerConfig {
        max_heap_mb: 16,
        ..test_config()
    };
    let script = r#"
        function index(ctx) {
            const hoard = [];
            while (true) { hoard.push({ filler: new Array(1024).fill(hoard.length) }); }
        }
    "#;
    let err = FlowRunner::new(config)
        .run(handler_flow(script, 20), message(json!({})), None)
        .await
        .unwrap_err();
    assert_matches!(err, FlowError::ProcessExit { .. });
}
