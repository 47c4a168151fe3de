use super::*;

use parking_lot::Mutex;
use serde_json::json;

use parley_core::permissions::{
    PermissionOption, PermissionOptionKind, PermissionOutcome, PermissionRequest, ToolCallDescriptor,
};

use crate::backend::flags;
use crate::mock::{MockBackend, MockResponse, MockStep};
use crate::permissions::{PermissionConfig, PermissionPrompter};
use crate::sink::RecordingSink;
use crate::store::InMemoryConversationStore;

struct Harness {
    orchestrator: TurnOrchestrator,
    backend: Arc<MockBackend>,
    store: Arc<InMemoryConversationStore>,
    sink: Arc<RecordingSink>,
}

fn harness(backend: MockBackend) -> Harness {
    harness_with(backend, Arc::new(PermissionGateway::new(PermissionConfig::default())))
}

fn harness_with(backend: MockBackend, permissions: Arc<PermissionGateway>) -> Harness {
    let backend = Arc::new(backend);
    let store = Arc::new(InMemoryConversationStore::new());
    let _ = store.create(conv("S1"), Some("/tmp"));
    let _ = store.create(conv("S2"), None);
    let sink = Arc::new(RecordingSink::new());
    let orchestrator = TurnOrchestrator::new(
        backend.clone(),
        store.clone(),
        sink.clone(),
        permissions,
        OrchestratorConfig::default(),
    );
    Harness {
        orchestrator,
        backend,
        store,
        sink,
    }
}

fn conv(id: &str) -> ConversationId {
    ConversationId::from_raw(id)
}

fn prompt(id: &str, text: &str) -> TurnRequest {
    TurnRequest::new(conv(id), vec![ContentBlock::text(text)])
}

fn updates_for(sink: &RecordingSink, id: &str) -> Vec<ToolCallUpdate> {
    sink.notifications()
        .into_iter()
        .filter(|n| n.conversation_id.as_str() == id)
        .filter_map(|n| match n.update {
            SessionUpdate::ToolCallUpdate(u) => Some(u),
            _ => None,
        })
        .collect()
}

async fn wait_until(mut ready: impl FnMut() -> bool) {
    while !ready() {
        tokio::task::yield_now().await;
    }
}

#[derive(Default)]
struct RecordingPrompter {
    requests: Mutex<Vec<PermissionRequest>>,
}

impl PermissionPrompter for RecordingPrompter {
    fn prompt(&self, request: &PermissionRequest) {
        self.requests.lock().push(request.clone());
    }
}

#[tokio::test]
async fn blocking_turn_end_to_end() {
    let h = harness(MockBackend::new(vec![MockResponse::text("Hello!")]));

    let resp = h.orchestrator.submit_turn(prompt("S1", "Hi")).await.unwrap();
    assert_eq!(resp.stop_reason, StopReason::EndTurn);

    assert_eq!(h.sink.kinds(), vec!["tool_call", "agent_message_chunk", "tool_call_update"]);
    assert_eq!(h.sink.message_texts(), vec!["Hello!"]);

    let last = updates_for(&h.sink, "S1").pop().unwrap();
    assert_eq!(last.status, Some(ToolCallStatus::Completed));
    assert_eq!(last.meta.unwrap()["stopReason"], "end_turn");

    let stored = h.store.get(&conv("S1")).unwrap();
    assert!(!stored.processing);
    assert_eq!(stored.messages.len(), 2);
    assert_eq!(stored.messages[0].role, Role::User);
    assert_eq!(stored.messages[1].role, Role::Assistant);

    assert_eq!(h.backend.calls()[0].text, "Hi");
    assert!(!h.backend.calls()[0].streaming);
    assert_eq!(h.orchestrator.queue_count(), 0);
    assert_eq!(h.orchestrator.pending_turns(&conv("S1")), 0);
}

#[tokio::test]
async fn turns_on_one_conversation_run_in_order() {
    let h = harness(MockBackend::new(vec![
        MockResponse::delayed(Duration::from_millis(50), MockResponse::text("one")),
        MockResponse::text("two"),
    ]));

    let first = h.orchestrator.submit_turn(prompt("S1", "first"));
    let second = h.orchestrator.submit_turn(prompt("S1", "second"));
    let (a, b) = tokio::join!(first, second);
    assert_eq!(a.unwrap().stop_reason, StopReason::EndTurn);
    assert_eq!(b.unwrap().stop_reason, StopReason::EndTurn);

    assert_eq!(
        h.backend.timeline(),
        vec!["start:first", "end:first", "start:second", "end:second"]
    );
    assert_eq!(h.sink.message_texts(), vec!["one", "two"]);
    assert_eq!(h.orchestrator.queue_count(), 0);
}

#[tokio::test]
async fn conversations_do_not_block_each_other() {
    let backend = MockBackend::default()
        .with_conversation(conv("S1"), vec![MockResponse::Hang])
        .with_conversation(conv("S2"), vec![MockResponse::text("fast")]);
    let h = harness(backend);

    let slow = tokio::spawn({
        let orchestrator = h.orchestrator.clone();
        async move { orchestrator.submit_turn(prompt("S1", "slow")).await }
    });
    wait_until(|| h.orchestrator.active_turns(&conv("S1")) == 1).await;

    let fast = h.orchestrator.submit_turn(prompt("S2", "fast")).await.unwrap();
    assert_eq!(fast.stop_reason, StopReason::EndTurn);
    assert_eq!(h.orchestrator.pending_turns(&conv("S1")), 1);

    assert_eq!(h.orchestrator.cancel_conversation(&conv("S1")), 1);
    let slow = slow.await.unwrap().unwrap();
    assert_eq!(slow.stop_reason, StopReason::Cancelled);
    assert_eq!(h.orchestrator.active_turns(&conv("S1")), 0);
    assert!(!h.store.get(&conv("S1")).unwrap().processing);
}

#[tokio::test]
async fn streaming_reassembles_split_code_fence() {
    let h = harness(MockBackend::new(vec![MockResponse::chunks(&[
        "Here you go:\n``",
        "`rust\nfn main() {}\n``",
        "`\nBye",
    ])]));

    let resp = h
        .orchestrator
        .submit_turn(prompt("S1", "code please").streaming(true))
        .await
        .unwrap();
    assert_eq!(resp.stop_reason, StopReason::EndTurn);

    let texts = h.sink.message_texts();
    assert!(texts.iter().any(|t| t == "```rust\nfn main() {}\n```"), "{texts:?}");
    assert!(texts.iter().any(|t| t.starts_with("Here you go:")), "{texts:?}");
    assert!(texts.last().is_some_and(|t| t.ends_with("Bye")), "{texts:?}");
    assert!(h.backend.calls()[0].streaming);

    let stored = h.store.get(&conv("S1")).unwrap();
    assert_eq!(stored.messages[1].content.len(), texts.len());
}

#[tokio::test]
async fn streaming_forwards_tool_calls_and_closes_open_ones() {
    let call = ToolCall::new(ToolCallId::from_raw("t1"), "Read file", ToolKind::Read);
    let stray = ToolCallUpdate::status(ToolCallId::from_raw("unknown"), ToolCallStatus::Completed);
    let h = harness(MockBackend::new(vec![MockResponse::Stream(vec![
        MockStep::Event(BackendEvent::ToolCall(call.clone())),
        MockStep::Event(BackendEvent::ToolCall(call)),
        MockStep::Event(BackendEvent::ToolCallUpdate(stray)),
        MockStep::Event(BackendEvent::Progress(Some("reading".into()))),
        MockStep::Event(BackendEvent::Chunk("done\n".into())),
    ])]));

    let resp = h
        .orchestrator
        .submit_turn(prompt("S1", "x").streaming(true))
        .await
        .unwrap();
    // No Done event: a stream that simply ends is a normal completion.
    assert_eq!(resp.stop_reason, StopReason::EndTurn);

    let calls: Vec<ToolCall> = h
        .sink
        .notifications()
        .into_iter()
        .filter_map(|n| match n.update {
            SessionUpdate::ToolCall(c) if c.tool_call_id.as_str() == "t1" => Some(c),
            _ => None,
        })
        .collect();
    assert_eq!(calls.len(), 1);

    let updates = updates_for(&h.sink, "S1");
    assert!(updates.iter().all(|u| u.tool_call_id.as_str() != "unknown"));
    assert!(updates
        .iter()
        .any(|u| u.meta.as_ref().and_then(|m| m.get("message")) == Some(&json!("reading"))));
    let closed = updates
        .iter()
        .find(|u| u.tool_call_id.as_str() == "t1")
        .unwrap();
    assert_eq!(closed.status, Some(ToolCallStatus::Failed));
}

#[tokio::test(start_paused = true)]
async fn cancel_mid_stream_stops_notifications() {
    let h = harness(MockBackend::new(vec![MockResponse::Stream(vec![
        MockStep::Event(BackendEvent::Chunk("first line\n".into())),
        MockStep::Pause(Duration::from_secs(10)),
        MockStep::Event(BackendEvent::Chunk("never\n".into())),
        MockStep::Event(BackendEvent::Done(BackendResponse::ok("first line\nnever\n"))),
    ])]));

    let turn = tokio::spawn({
        let orchestrator = h.orchestrator.clone();
        async move { orchestrator.submit_turn(prompt("S1", "x").streaming(true)).await }
    });
    wait_until(|| !h.sink.message_texts().is_empty()).await;

    assert_eq!(h.orchestrator.cancel_conversation(&conv("S1")), 1);
    let resp = turn.await.unwrap().unwrap();
    assert_eq!(resp.stop_reason, StopReason::Cancelled);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.sink.kinds(), vec!["tool_call", "agent_message_chunk"]);
    assert_eq!(h.sink.message_texts(), vec!["first line\n"]);
    assert!(!h.store.get(&conv("S1")).unwrap().processing);
}

#[tokio::test]
async fn cancel_resolves_pending_permission() {
    let prompter = Arc::new(RecordingPrompter::default());
    let gateway = Arc::new(
        PermissionGateway::new(PermissionConfig::default()).with_prompter(prompter.clone()),
    );
    let options = vec![
        PermissionOption::new("allow", "Allow", PermissionOptionKind::AllowOnce),
        PermissionOption::new("reject", "Reject", PermissionOptionKind::RejectOnce),
    ];
    let backend = MockBackend::new(vec![MockResponse::AskPermission(
        ToolCallDescriptor::new(ToolCallId::from_raw("edit-1"), ToolKind::Edit),
        options,
    )]);
    let h = harness_with(backend, gateway.clone());

    let turn = tokio::spawn({
        let orchestrator = h.orchestrator.clone();
        async move { orchestrator.submit_turn(prompt("S1", "edit it")).await }
    });
    wait_until(|| gateway.pending_count() == 1).await;
    assert_eq!(prompter.requests.lock()[0].conversation_id, conv("S1"));

    let _ = h.orchestrator.cancel_conversation(&conv("S1"));
    let resp = turn.await.unwrap().unwrap();
    assert_eq!(resp.stop_reason, StopReason::Cancelled);
    assert_eq!(gateway.pending_count(), 0);
}

#[tokio::test]
async fn granted_permission_reaches_backend() {
    let prompter = Arc::new(RecordingPrompter::default());
    let gateway = Arc::new(
        PermissionGateway::new(PermissionConfig::default()).with_prompter(prompter.clone()),
    );
    let backend = MockBackend::new(vec![MockResponse::AskPermission(
        ToolCallDescriptor::new(ToolCallId::from_raw("rm-1"), ToolKind::Delete),
        vec![
            PermissionOption::new("allow", "Allow", PermissionOptionKind::AllowOnce),
            PermissionOption::new("reject", "Reject", PermissionOptionKind::RejectOnce),
        ],
    )]);
    let h = harness_with(backend, gateway.clone());

    let turn = tokio::spawn({
        let orchestrator = h.orchestrator.clone();
        async move { orchestrator.submit_turn(prompt("S1", "delete")).await }
    });
    wait_until(|| gateway.pending_count() == 1).await;
    let request_id = prompter.requests.lock()[0].request_id.clone();
    assert!(gateway.resolve(&request_id, PermissionOutcome::selected("allow")));

    let resp = turn.await.unwrap().unwrap();
    assert_eq!(resp.stop_reason, StopReason::EndTurn);
    assert_eq!(h.sink.message_texts(), vec!["selected:allow"]);
}

#[tokio::test]
async fn invalid_request_has_no_side_effects() {
    let h = harness(MockBackend::new(vec![MockResponse::text("unused")]));

    let err = h
        .orchestrator
        .submit_turn(TurnRequest::new(conv("S1"), vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, TurnError::Validation(_)));
    assert!(err.is_client_error());

    let err = h.orchestrator.submit_turn(prompt("nope", "hi")).await.unwrap_err();
    assert!(matches!(err, TurnError::ConversationNotFound(ref id) if id.as_str() == "nope"));

    assert_eq!(h.backend.call_count(), 0);
    assert!(h.sink.is_empty());
    assert!(h.store.get(&conv("S1")).unwrap().messages.is_empty());
    assert_eq!(h.orchestrator.queue_count(), 0);
}

#[tokio::test]
async fn panicking_turn_is_contained() {
    let h = harness(MockBackend::new(vec![
        MockResponse::Panic("backend exploded".into()),
        MockResponse::text("recovered"),
    ]));

    let err = h.orchestrator.submit_turn(prompt("S1", "boom")).await.unwrap_err();
    assert!(matches!(err, TurnError::Internal(_)));
    assert_eq!(err.error_kind(), "internal");
    assert!(!h.store.get(&conv("S1")).unwrap().processing);
    assert_eq!(h.orchestrator.active_turns(&conv("S1")), 0);

    let resp = h.orchestrator.submit_turn(prompt("S1", "again")).await.unwrap();
    assert_eq!(resp.stop_reason, StopReason::EndTurn);
    assert_eq!(h.sink.message_texts(), vec!["recovered"]);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_reports_elapsed_time() {
    let h = harness(MockBackend::new(vec![MockResponse::delayed(
        Duration::from_secs(30),
        MockResponse::text("slow answer"),
    )]));

    let resp = h.orchestrator.submit_turn(prompt("S1", "think")).await.unwrap();
    assert_eq!(resp.stop_reason, StopReason::EndTurn);

    let updates = updates_for(&h.sink, "S1");
    let beats: Vec<u64> = updates
        .iter()
        .filter(|u| u.status == Some(ToolCallStatus::InProgress))
        .filter_map(|u| u.meta.as_ref()?.get("elapsedMs")?.as_u64())
        .collect();
    assert_eq!(beats, vec![12_000, 24_000]);

    let stored = h.store.get(&conv("S1")).unwrap();
    assert!(stored.metadata.contains_key("lastActivityAt"));
}

#[tokio::test(start_paused = true)]
async fn heartbeat_stops_once_conversation_is_removed() {
    let h = harness(MockBackend::new(vec![MockResponse::delayed(
        Duration::from_secs(40),
        MockResponse::text("late answer"),
    )]));

    let orchestrator = h.orchestrator.clone();
    let turn = tokio::spawn(async move { orchestrator.submit_turn(prompt("S1", "think")).await });
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.store.remove(&conv("S1")));

    let resp = turn.await.unwrap().unwrap();
    assert_eq!(resp.stop_reason, StopReason::EndTurn);

    // Without the stop there would be beats at 12 s, 24 s and 36 s.
    let beats = updates_for(&h.sink, "S1")
        .into_iter()
        .filter(|u| u.status == Some(ToolCallStatus::InProgress))
        .filter(|u| u.meta.as_ref().is_some_and(|m| m.contains_key("elapsedMs")))
        .count();
    assert_eq!(beats, 0);
}

#[tokio::test]
async fn stop_reasons_follow_backend_flags() {
    let h = harness(MockBackend::new(vec![
        MockResponse::Output(BackendResponse::ok("cut").with_metadata(flags::MAX_TOKENS, json!(true))),
        MockResponse::Output(
            BackendResponse::ok("loop").with_metadata(flags::STOP_REASON, json!("max_turn_requests")),
        ),
        MockResponse::Output(BackendResponse::ok("no").with_metadata(flags::REFUSAL, json!(true))),
        MockResponse::Output(BackendResponse::failure("crashed")),
        MockResponse::Error(BackendError::Process("spawn failed".into())),
    ]));

    let mut reasons = Vec::new();
    for _ in 0..5 {
        reasons.push(h.orchestrator.submit_turn(prompt("S1", "x")).await.unwrap().stop_reason);
    }
    assert_eq!(
        reasons,
        vec![
            StopReason::MaxTokens,
            StopReason::MaxTurnRequests,
            StopReason::Refusal,
            StopReason::Refusal,
            StopReason::Refusal,
        ]
    );

    let finals: Vec<Option<ToolCallStatus>> = updates_for(&h.sink, "S1").iter().map(|u| u.status).collect();
    assert_eq!(
        finals,
        vec![
            Some(ToolCallStatus::Completed),
            Some(ToolCallStatus::Completed),
            Some(ToolCallStatus::Failed),
            Some(ToolCallStatus::Failed),
            Some(ToolCallStatus::Failed),
        ]
    );
}

#[tokio::test]
async fn response_carries_backend_metadata() {
    let h = harness(MockBackend::new(vec![MockResponse::Output(
        BackendResponse::ok("hi").with_metadata("exitCode", json!(0)),
    )]));
    let resp = h.orchestrator.submit_turn(prompt("S1", "x")).await.unwrap();
    assert_eq!(resp.metadata["exitCode"], 0);
}

#[tokio::test]
async fn shutdown_rejects_new_turns() {
    let h = harness(MockBackend::new(vec![MockResponse::text("unused")]));
    h.orchestrator.shutdown();
    assert!(h.orchestrator.is_shutting_down());

    let err = h.orchestrator.submit_turn(prompt("S1", "late")).await.unwrap_err();
    assert!(matches!(err, TurnError::ShuttingDown));
    assert_eq!(h.backend.call_count(), 0);
}

#[tokio::test]
async fn shutdown_cancels_running_turn() {
    let h = harness(MockBackend::new(vec![MockResponse::Hang]));
    let turn = tokio::spawn({
        let orchestrator = h.orchestrator.clone();
        async move { orchestrator.submit_turn(prompt("S1", "x")).await }
    });
    wait_until(|| h.orchestrator.active_turns(&conv("S1")) == 1).await;

    h.orchestrator.shutdown();
    let resp = turn.await.unwrap().unwrap();
    assert_eq!(resp.stop_reason, StopReason::Cancelled);
}

#[tokio::test]
async fn cancel_with_nothing_running_is_noop() {
    let h = harness(MockBackend::new(vec![MockResponse::text("later")]));
    assert_eq!(h.orchestrator.cancel_conversation(&conv("S1")), 0);

    let resp = h.orchestrator.submit_turn(prompt("S1", "x")).await.unwrap();
    assert_eq!(resp.stop_reason, StopReason::EndTurn);
}

#[tokio::test]
async fn records_turn_metrics() {
    let metrics = Arc::new(MetricsRecorder::new());
    let h = harness(MockBackend::new(vec![MockResponse::text("ok")]));
    let orchestrator = TurnOrchestrator::instrumented(
        h.backend.clone(),
        h.store.clone(),
        h.sink.clone(),
        h.orchestrator.permissions().clone(),
        OrchestratorConfig::default(),
        metrics.clone(),
    );
    // Front ends hold clones; every clone records into the same recorder.
    let front = orchestrator.clone();

    let _ = front.submit_turn(prompt("S1", "x")).await.unwrap();
    assert_eq!(metrics.counter_get("turns_started", &[]), 1);
    assert_eq!(metrics.counter_get("turns_completed", &[("stop_reason", "end_turn")]), 1);
    assert_eq!(metrics.gauge_get("active_turns", &[]), 0.0);
    assert_eq!(metrics.histogram_summary("turn_duration_ms", &[]).count, 1);
}

#[test]
fn classify_stop_prefers_cancellation() {
    let limited = Ok(BackendResponse::ok("").with_metadata(flags::MAX_TOKENS, json!(true)));
    assert_eq!(classify_stop(true, &limited), StopReason::Cancelled);
    assert_eq!(classify_stop(false, &limited), StopReason::MaxTokens);
    assert_eq!(classify_stop(false, &Err(BackendError::Cancelled)), StopReason::Cancelled);
    assert_eq!(classify_stop(false, &Ok(BackendResponse::ok("fine"))), StopReason::EndTurn);
}
