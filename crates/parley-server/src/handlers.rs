//! JSON-RPC method routing onto the turn orchestrator and permission gateway.

use serde_json::{json, Value};
use tracing::{debug, warn};

use parley_core::errors::ValidationError;
use parley_core::ids::{ConversationId, PermissionRequestId};
use parley_core::permissions::{PermissionOutcome, PermissionResponse};
use parley_core::turn::TurnRequest;
use parley_engine::error::TurnError;
use parley_engine::orchestrator::TurnOrchestrator;

use crate::rpc::{self, RpcRequest, RpcResponse};

pub const PROMPT: &str = "session/prompt";
pub const CANCEL: &str = "session/cancel";
pub const PERMISSION_RESPONSE: &str = "session/permission_response";

#[derive(Clone)]
pub struct RpcDispatcher {
    orchestrator: TurnOrchestrator,
}

impl RpcDispatcher {
    pub fn new(orchestrator: TurnOrchestrator) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &TurnOrchestrator {
        &self.orchestrator
    }

    /// Handle one inbound JSON text. Returns the serialized response, or
    /// `None` for notifications and for client replies to our own requests.
    pub async fn handle_line(&self, line: &str) -> Option<String> {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "unparseable rpc message");
                return serialize(&RpcResponse::parse_error());
            }
        };

        // A reply to `session/request_permission` carries the permission id as its id.
        if value.get("method").is_none() && value.get("id").is_some() {
            self.permission_reply(&value);
            return None;
        }

        let request: RpcRequest = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                return serialize(&RpcResponse::error(None, rpc::INVALID_REQUEST, e.to_string()));
            }
        };
        let response = self.dispatch(request).await?;
        serialize(&response)
    }

    /// Route a parsed request. Notifications (no id) run but produce no response.
    pub async fn dispatch(&self, request: RpcRequest) -> Option<RpcResponse> {
        let RpcRequest { method, params, id, .. } = request;
        let is_notification = id.is_none();
        let params = params.unwrap_or(Value::Null);

        let response = match method.as_str() {
            PROMPT => self.prompt(params, id).await,
            CANCEL => self.cancel(&params, id),
            PERMISSION_RESPONSE => self.permission_response(&params, id),
            other => RpcResponse::method_not_found(id, other),
        };
        (!is_notification).then_some(response)
    }

    async fn prompt(&self, mut params: Value, id: Option<Value>) -> RpcResponse {
        if let Some(obj) = params.as_object_mut() {
            let streaming_default = self.orchestrator.config().streaming_default;
            let _ = obj.entry("streaming").or_insert(Value::Bool(streaming_default));
        }
        let request = match TurnRequest::from_value(params) {
            Ok(r) => r,
            Err(e) => return validation_error(id, &e),
        };
        match self.orchestrator.submit_turn(request).await {
            Ok(response) => match serde_json::to_value(&response) {
                Ok(result) => RpcResponse::success(id, result),
                Err(e) => RpcResponse::internal_error(id, e.to_string()),
            },
            Err(e) => turn_error(id, &e),
        }
    }

    fn cancel(&self, params: &Value, id: Option<Value>) -> RpcResponse {
        let conversation_id = match rpc::require_str(params, "conversationId") {
            Ok(s) => ConversationId::from_raw(s),
            Err(msg) => return RpcResponse::invalid_params(id, msg),
        };
        let cancelled = self.orchestrator.cancel_conversation(&conversation_id);
        RpcResponse::success(id, json!({ "cancelled": cancelled }))
    }

    fn permission_response(&self, params: &Value, id: Option<Value>) -> RpcResponse {
        let request_id = match rpc::require_str(params, "requestId") {
            Ok(s) => PermissionRequestId::from_raw(s),
            Err(msg) => return RpcResponse::invalid_params(id, msg),
        };
        let response: PermissionResponse = match serde_json::from_value(params.clone()) {
            Ok(r) => r,
            Err(e) => return validation_error(id, &ValidationError::from(e)),
        };
        let resolved = self
            .orchestrator
            .permissions()
            .resolve(&request_id, response.outcome);
        RpcResponse::success(id, json!({ "resolved": resolved }))
    }

    fn permission_reply(&self, value: &Value) {
        let Some(request_id) = value.get("id").and_then(Value::as_str) else {
            warn!("rpc response with non-string id ignored");
            return;
        };
        let request_id = PermissionRequestId::from_raw(request_id);
        let Some(result) = value.get("result") else {
            // An error reply means the client could not ask; treat it as a dismissal.
            let _ = self
                .orchestrator
                .permissions()
                .resolve(&request_id, PermissionOutcome::Cancelled);
            return;
        };
        match serde_json::from_value::<PermissionResponse>(result.clone()) {
            Ok(response) => {
                if !self.orchestrator.permissions().resolve(&request_id, response.outcome) {
                    debug!(request_id = %request_id, "permission reply for unknown request");
                }
            }
            Err(e) => warn!(request_id = %request_id, error = %e, "malformed permission reply"),
        }
    }
}

fn serialize(response: &RpcResponse) -> Option<String> {
    match serde_json::to_string(response) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(error = %e, "failed to serialize rpc response");
            None
        }
    }
}

fn validation_error(id: Option<Value>, e: &ValidationError) -> RpcResponse {
    RpcResponse::invalid_params(id, e.to_string()).with_data(json!({ "kind": e.error_kind() }))
}

fn turn_error(id: Option<Value>, e: &TurnError) -> RpcResponse {
    let code = match e {
        TurnError::Validation(_) => rpc::INVALID_PARAMS,
        TurnError::ConversationNotFound(_) => rpc::NOT_FOUND,
        TurnError::ShuttingDown => rpc::UNAVAILABLE,
        TurnError::Store(_) | TurnError::Internal(_) => rpc::INTERNAL_ERROR,
    };
    RpcResponse::error(id, code, e.to_string()).with_data(json!({ "kind": e.error_kind() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use parley_core::ids::ToolCallId;
    use parley_core::notifications::ToolKind;
    use parley_core::permissions::{PermissionOption, PermissionOptionKind, ToolCallDescriptor};
    use parley_engine::mock::{MockBackend, MockResponse};
    use parley_engine::orchestrator::OrchestratorConfig;
    use parley_engine::permissions::{PermissionConfig, PermissionGateway};
    use parley_engine::store::InMemoryConversationStore;

    use crate::bridge::{RpcNotificationSink, RpcPermissionPrompter, REQUEST_PERMISSION, SESSION_UPDATE};

    struct Fixture {
        dispatcher: RpcDispatcher,
        backend: Arc<MockBackend>,
        outbound: mpsc::UnboundedReceiver<String>,
    }

    fn fixture(backend: MockBackend, config: OrchestratorConfig) -> Fixture {
        let (tx, outbound) = mpsc::unbounded_channel();
        let backend = Arc::new(backend);
        let store = Arc::new(InMemoryConversationStore::new());
        let _ = store.create(ConversationId::from_raw("S1"), None);
        let gateway = Arc::new(
            PermissionGateway::new(PermissionConfig::default())
                .with_prompter(Arc::new(RpcPermissionPrompter::new(tx.clone()))),
        );
        let orchestrator = TurnOrchestrator::new(
            backend.clone(),
            store,
            Arc::new(RpcNotificationSink::new(tx)),
            gateway,
            config,
        );
        Fixture {
            dispatcher: RpcDispatcher::new(orchestrator),
            backend,
            outbound,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(serde_json::from_str(&line).unwrap());
        }
        out
    }

    async fn call(dispatcher: &RpcDispatcher, line: Value) -> Value {
        let reply = dispatcher.handle_line(&line.to_string()).await.unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    fn prompt_line(id: u64, conversation: &str, text: &str) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": PROMPT,
            "params": {
                "conversationId": conversation,
                "content": [{"type": "text", "text": text}]
            }
        })
    }

    #[tokio::test]
    async fn prompt_returns_stop_reason_and_streams_updates() {
        let mut f = fixture(
            MockBackend::new(vec![MockResponse::text("Hello")]),
            OrchestratorConfig::default(),
        );
        let reply = call(&f.dispatcher, prompt_line(1, "S1", "Hi")).await;
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["result"]["stopReason"], "end_turn");

        let sent = drain(&mut f.outbound);
        assert!(sent.iter().all(|m| m["method"] == SESSION_UPDATE));
        let chunks: Vec<&Value> = sent
            .iter()
            .filter(|m| m["params"]["update"]["kind"] == "agent_message_chunk")
            .collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0]["params"]["update"]["content"]["text"], "Hello");
    }

    #[tokio::test]
    async fn missing_content_is_invalid_params() {
        let f = fixture(MockBackend::new(vec![]), OrchestratorConfig::default());
        let reply = call(
            &f.dispatcher,
            json!({"jsonrpc": "2.0", "id": 2, "method": PROMPT, "params": {"conversationId": "S1"}}),
        )
        .await;
        assert_eq!(reply["error"]["code"], rpc::INVALID_PARAMS);
        assert_eq!(reply["error"]["data"]["kind"], "missing_field");
        assert_eq!(f.backend.call_count(), 0);
    }

    #[tokio::test]
    async fn empty_content_is_invalid_params() {
        let f = fixture(MockBackend::new(vec![]), OrchestratorConfig::default());
        let reply = call(
            &f.dispatcher,
            json!({"id": 3, "method": PROMPT, "params": {"conversationId": "S1", "content": []}}),
        )
        .await;
        assert_eq!(reply["error"]["code"], rpc::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let f = fixture(MockBackend::new(vec![]), OrchestratorConfig::default());
        let reply = call(&f.dispatcher, prompt_line(4, "ghost", "hi")).await;
        assert_eq!(reply["error"]["code"], rpc::NOT_FOUND);
        assert_eq!(reply["error"]["data"]["kind"], "conversation_not_found");
    }

    #[tokio::test]
    async fn unknown_method_and_garbage() {
        let f = fixture(MockBackend::new(vec![]), OrchestratorConfig::default());
        let reply = call(&f.dispatcher, json!({"id": 5, "method": "session/dance"})).await;
        assert_eq!(reply["error"]["code"], rpc::METHOD_NOT_FOUND);

        let reply = f.dispatcher.handle_line("{not json").await.unwrap();
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["error"]["code"], rpc::PARSE_ERROR);
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let f = fixture(MockBackend::new(vec![]), OrchestratorConfig::default());
        let reply = f
            .dispatcher
            .handle_line(&json!({"method": CANCEL, "params": {"conversationId": "S1"}}).to_string())
            .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn streaming_default_applies_when_absent() {
        let config = OrchestratorConfig {
            streaming_default: true,
            ..OrchestratorConfig::default()
        };
        let f = fixture(
            MockBackend::new(vec![MockResponse::chunks(&["a\n"]), MockResponse::text("b")]),
            config,
        );
        let _ = call(&f.dispatcher, prompt_line(6, "S1", "x")).await;

        let mut explicit = prompt_line(7, "S1", "y");
        explicit["params"]["streaming"] = json!(false);
        let _ = call(&f.dispatcher, explicit).await;

        let calls = f.backend.calls();
        assert!(calls[0].streaming);
        assert!(!calls[1].streaming);
    }

    #[tokio::test]
    async fn permission_round_trip_over_rpc() {
        let backend = MockBackend::new(vec![MockResponse::AskPermission(
            ToolCallDescriptor::new(ToolCallId::from_raw("t1"), ToolKind::Edit),
            vec![
                PermissionOption::new("allow", "Allow", PermissionOptionKind::AllowOnce),
                PermissionOption::new("reject", "Reject", PermissionOptionKind::RejectOnce),
            ],
        )]);
        let mut f = fixture(backend, OrchestratorConfig::default());

        let dispatcher = f.dispatcher.clone();
        let turn = tokio::spawn(async move { call(&dispatcher, prompt_line(8, "S1", "edit")).await });

        let request = loop {
            if let Some(line) = f.outbound.recv().await {
                let msg: Value = serde_json::from_str(&line).unwrap();
                if msg["method"] == REQUEST_PERMISSION {
                    break msg;
                }
            }
        };
        let request_id = request["id"].as_str().unwrap().to_string();
        let reply = f
            .dispatcher
            .handle_line(
                &json!({"jsonrpc": "2.0", "id": request_id, "result": {"outcome": {"selected": "allow"}}})
                    .to_string(),
            )
            .await;
        assert!(reply.is_none());

        let result = turn.await.unwrap();
        assert_eq!(result["result"]["stopReason"], "end_turn");
        let texts: Vec<Value> = drain(&mut f.outbound)
            .into_iter()
            .filter(|m| m["params"]["update"]["kind"] == "agent_message_chunk")
            .map(|m| m["params"]["update"]["content"]["text"].clone())
            .collect();
        assert_eq!(texts, vec![json!("selected:allow")]);
    }

    #[tokio::test]
    async fn permission_response_method_resolves() {
        let backend = MockBackend::new(vec![MockResponse::AskPermission(
            ToolCallDescriptor::new(ToolCallId::from_raw("t2"), ToolKind::Delete),
            vec![PermissionOption::new("reject", "Reject", PermissionOptionKind::RejectOnce)],
        )]);
        let mut f = fixture(backend, OrchestratorConfig::default());
        let dispatcher = f.dispatcher.clone();
        let turn = tokio::spawn(async move { call(&dispatcher, prompt_line(9, "S1", "rm")).await });

        let request_id = loop {
            let line = f.outbound.recv().await.unwrap();
            let msg: Value = serde_json::from_str(&line).unwrap();
            if msg["method"] == REQUEST_PERMISSION {
                break msg["id"].as_str().unwrap().to_string();
            }
        };
        let reply = call(
            &f.dispatcher,
            json!({
                "id": 10,
                "method": PERMISSION_RESPONSE,
                "params": {"requestId": request_id, "outcome": "cancelled"}
            }),
        )
        .await;
        assert_eq!(reply["result"]["resolved"], true);

        let result = turn.await.unwrap();
        assert_eq!(result["result"]["stopReason"], "end_turn");
        assert_eq!(f.backend.call_count(), 1);
    }

    #[tokio::test]
    async fn cancel_stops_running_prompt() {
        let f = fixture(MockBackend::new(vec![MockResponse::Hang]), OrchestratorConfig::default());
        let dispatcher = f.dispatcher.clone();
        let turn = tokio::spawn(async move { call(&dispatcher, prompt_line(11, "S1", "wait")).await });

        let conversation = ConversationId::from_raw("S1");
        while f.dispatcher.orchestrator().active_turns(&conversation) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let reply = call(
            &f.dispatcher,
            json!({"id": 12, "method": CANCEL, "params": {"conversationId": "S1"}}),
        )
        .await;
        assert_eq!(reply["result"]["cancelled"], 1);

        let result = turn.await.unwrap();
        assert_eq!(result["result"]["stopReason"], "cancelled");
    }

    #[tokio::test]
    async fn cancel_requires_conversation_id() {
        let f = fixture(MockBackend::new(vec![]), OrchestratorConfig::default());
        let reply = call(&f.dispatcher, json!({"id": 13, "method": CANCEL, "params": {}})).await;
        assert_eq!(reply["error"]["code"], rpc::INVALID_PARAMS);
    }
}
