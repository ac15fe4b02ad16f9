//! End-to-end tests for tool calling against the scripted backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt;
use hearth_agent::{ToolDispatcher, ToolSession};
use hearth_config::{AgentConfig, SessionConfig, ToolCallPolicy};
use hearth_core::{DispatchError, Error, EventBus, FunctionTool, ParamType, ToolRegistry};
use hearth_engine::testing::{self, ScriptedBackend};

// ── Helpers ──────────────────────────────────────────────────────────────

fn sum_registry(calls: Arc<AtomicUsize>) -> ToolRegistry {
    ToolRegistry::builder()
        .tool(
            FunctionTool::new("sum", "Add two integers", move |args| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok((args.i64("a")? + args.i64("b")?).to_string())
                }
            })
            .param("a", ParamType::Integer, "first addend")
            .param("b", ParamType::Integer, "second addend"),
        )
        .build()
        .unwrap()
}

fn session_config() -> SessionConfig {
    SessionConfig {
        n_ctx: 8192,
        prompt: "You are a helpful assistant.\n".into(),
        ..SessionConfig::default()
    }
}

const SUM_CALL: &str = r#"<tool_call>{"id":1,"name":"sum","arguments":{"a":1,"b":2}}</tool_call>"#;

// ── Blocking inference ───────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn sum_call_is_dispatched_and_answer_returned() {
    let calls = Arc::new(AtomicUsize::new(0));
    let backend = ScriptedBackend::new(8192).with_replies([SUM_CALL, "The sum is 3."]);
    let probe = backend.probe();
    let session = ToolSession::new(
        &session_config(),
        &AgentConfig::default(),
        sum_registry(Arc::clone(&calls)),
        backend,
    )
    .unwrap();

    let answer = session.infer("What is 1 + 2?").await.unwrap();
    assert_eq!(answer, "The sum is 3.");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // the response envelope was fed back to the model
    let decoded = testing::detokenize(
        &probe.decoded().iter().map(|&(t, _)| t).collect::<Vec<_>>(),
    );
    assert!(decoded.contains(r#"<tool_response>{"id":1,"name":"sum","result":3}</tool_response>"#));
    // and the preamble described the tool
    assert!(decoded.contains(r#""name":"sum""#));

    session.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn plain_answer_needs_no_dispatch() {
    let calls = Arc::new(AtomicUsize::new(0));
    let backend = ScriptedBackend::new(8192).with_replies(["Paris."]);
    let session = ToolSession::new(
        &session_config(),
        &AgentConfig::default(),
        sum_registry(Arc::clone(&calls)),
        backend,
    )
    .unwrap();

    assert_eq!(session.infer("Capital of France?").await.unwrap(), "Paris.");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn plain_answers_leave_no_call_delimiter_in_context() {
    let backend = ScriptedBackend::new(8192).with_replies(["Paris.", "Rome."]);
    let probe = backend.probe();
    let session = ToolSession::new(
        &session_config(),
        &AgentConfig::default(),
        sum_registry(Arc::new(AtomicUsize::new(0))),
        backend,
    )
    .unwrap();

    assert_eq!(session.infer("Capital of France?").await.unwrap(), "Paris.");
    assert_eq!(session.infer("Capital of Italy?").await.unwrap(), "Rome.");

    let decoded = testing::detokenize(
        &probe.decoded().iter().map(|&(t, _)| t).collect::<Vec<_>>(),
    );
    let conversation = &decoded[decoded.find("Capital of France?").unwrap()..];
    assert!(conversation.contains("Rome."));
    assert!(
        !conversation.contains("</tool_call>"),
        "unpaired delimiter in context: {conversation:?}"
    );
    session.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn tool_preamble_survives_a_context_shift() {
    let long_reply = "y".repeat(3000);
    let backend = ScriptedBackend::new(2048).with_replies([long_reply.clone()]);
    let probe = backend.probe();
    let config = SessionConfig {
        n_ctx: 2048,
        ..session_config()
    };
    let session = ToolSession::new(
        &config,
        &AgentConfig::default(),
        sum_registry(Arc::new(AtomicUsize::new(0))),
        backend,
    )
    .unwrap();

    assert_eq!(session.infer("Say y a lot.").await.unwrap(), long_reply);
    assert!(probe.decoded_count() > 2048, "the window never shifted");

    let cells = probe.kv_cells();
    let context = testing::detokenize(&cells.iter().map(|&(t, _)| t).collect::<Vec<_>>());
    assert!(
        context.starts_with("<s>You are a function calling AI model."),
        "preamble evicted: {:?}",
        &context[..context.len().min(80)]
    );
    assert!(context.contains(r#""name":"sum""#));
    assert!(context.contains("You are a helpful assistant.\n"));
    session.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_tool_is_fatal_under_fatal_policy() {
    let backend = ScriptedBackend::new(8192)
        .with_replies([r#"<tool_call>{"id":1,"name":"launch","arguments":{}}</tool_call>"#]);
    let agent = AgentConfig {
        malformed_tool_calls: ToolCallPolicy::Fatal,
        ..AgentConfig::default()
    };
    let session = ToolSession::new(
        &session_config(),
        &agent,
        sum_registry(Arc::new(AtomicUsize::new(0))),
        backend,
    )
    .unwrap();

    let err = session.infer("go").await.unwrap_err();
    assert!(matches!(err, Error::Dispatch(DispatchError::UnknownTool(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_tool_is_reported_back_under_recover_policy() {
    let backend = ScriptedBackend::new(8192).with_replies([
        r#"<tool_call>{"id":1,"name":"launch","arguments":{}}</tool_call>"#,
        "I cannot do that.",
    ]);
    let probe = backend.probe();
    let session = ToolSession::new(
        &session_config(),
        &AgentConfig::default(),
        sum_registry(Arc::new(AtomicUsize::new(0))),
        backend,
    )
    .unwrap();

    assert_eq!(session.infer("go").await.unwrap(), "I cannot do that.");
    let decoded = testing::detokenize(
        &probe.decoded().iter().map(|&(t, _)| t).collect::<Vec<_>>(),
    );
    assert!(decoded.contains("unknown tool 'launch'"));
}

#[tokio::test(flavor = "multi_thread")]
async fn iteration_guard_returns_last_output() {
    let calls = Arc::new(AtomicUsize::new(0));
    let backend = ScriptedBackend::new(8192).with_replies([SUM_CALL, SUM_CALL, SUM_CALL, SUM_CALL]);
    let agent = AgentConfig {
        max_tool_iterations: 2,
        ..AgentConfig::default()
    };
    let session = ToolSession::new(
        &session_config(),
        &agent,
        sum_registry(Arc::clone(&calls)),
        backend,
    )
    .unwrap();

    let answer = session.infer("loop forever").await.unwrap();
    assert_eq!(answer, SUM_CALL);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// ── Concurrent dispatch ──────────────────────────────────────────────────

#[tokio::test]
async fn responses_keep_call_order_when_second_finishes_first() {
    let registry = ToolRegistry::builder()
        .tool(FunctionTool::new("slow", "Answers late", |_| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok("slow".to_string())
        }))
        .tool(FunctionTool::new("fast", "Answers at once", |_| async move {
            Ok("fast".to_string())
        }))
        .build()
        .unwrap();
    let dispatcher =
        ToolDispatcher::new(registry, ToolCallPolicy::Recover, EventBus::default()).unwrap();

    let out = dispatcher
        .dispatch(
            r#"<tool_call>{"id":1,"name":"slow"}</tool_call>
<tool_call>{"id":2,"name":"fast"}</tool_call>"#,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        out,
        concat!(
            r#"<tool_response>{"id":1,"name":"slow","result":"slow"}</tool_response>"#,
            r#"<tool_response>{"id":2,"name":"fast","result":"fast"}</tool_response>"#,
        )
    );
}

// ── Streaming ────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn stream_yields_text_and_withholds_tool_calls() {
    let backend = ScriptedBackend::new(8192).with_replies([
        format!("Paris\n\n{SUM_CALL}"),
        " is lovely.".to_string(),
    ]);
    let calls = Arc::new(AtomicUsize::new(0));
    let session = ToolSession::new(
        &session_config(),
        &AgentConfig::default(),
        sum_registry(Arc::clone(&calls)),
        backend,
    )
    .unwrap();

    let fragments: Vec<String> = session
        .inference_stream("Where?")
        .map(|f| f.unwrap())
        .collect()
        .await;
    let text = fragments.concat();

    assert_eq!(text, "Paris is lovely.");
    assert!(fragments.iter().all(|f| !f.contains("tool_call")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_stream_leaves_session_usable() {
    let backend = ScriptedBackend::new(8192).with_replies(["a long first answer", "second"]);
    let session = ToolSession::new(
        &session_config(),
        &AgentConfig::default(),
        sum_registry(Arc::new(AtomicUsize::new(0))),
        backend,
    )
    .unwrap();

    let mut stream = session.inference_stream("first");
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first, "a");
    drop(stream);

    let answer = tokio::time::timeout(Duration::from_secs(5), session.infer("again"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(answer, "second");
}

#[tokio::test(flavor = "multi_thread")]
async fn stopped_session_fails_inference() {
    let session = ToolSession::new(
        &session_config(),
        &AgentConfig::default(),
        sum_registry(Arc::new(AtomicUsize::new(0))),
        ScriptedBackend::new(8192),
    )
    .unwrap();
    session.stop();
    session.stop();
    assert!(matches!(
        session.infer("hello").await,
        Err(Error::SessionClosed)
    ));
}
