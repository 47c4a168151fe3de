//! Engine-to-wire adapters: session notifications and permission prompts as
//! JSON-RPC strings on an outbound channel. Framing belongs to the host.

use tokio::sync::mpsc;
use tracing::{trace, warn};

use parley_core::notifications::SessionNotification;
use parley_core::permissions::PermissionRequest;
use parley_engine::permissions::PermissionPrompter;
use parley_engine::sink::NotificationSink;

use crate::rpc::RpcOutbound;

pub const SESSION_UPDATE: &str = "session/update";
pub const REQUEST_PERMISSION: &str = "session/request_permission";

/// Writes `session/update` notifications.
#[derive(Clone)]
pub struct RpcNotificationSink {
    tx: mpsc::UnboundedSender<String>,
}

impl RpcNotificationSink {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

impl NotificationSink for RpcNotificationSink {
    fn send(&self, notification: SessionNotification) {
        let params = match serde_json::to_value(&notification) {
            Ok(params) => params,
            Err(e) => {
                warn!(error = %e, "failed to serialize session notification");
                return;
            }
        };
        write(&self.tx, &RpcOutbound::notification(SESSION_UPDATE, params));
        trace!(conversation_id = %notification.conversation_id, kind = notification.update.kind(), "notification sent");
    }
}

/// Writes `session/request_permission` requests. The JSON-RPC id is the
/// permission request id, so the client's reply can be routed back with
/// `session/permission_response`.
#[derive(Clone)]
pub struct RpcPermissionPrompter {
    tx: mpsc::UnboundedSender<String>,
}

impl RpcPermissionPrompter {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

impl PermissionPrompter for RpcPermissionPrompter {
    fn prompt(&self, request: &PermissionRequest) {
        let params = match serde_json::to_value(request) {
            Ok(params) => params,
            Err(e) => {
                warn!(error = %e, "failed to serialize permission request");
                return;
            }
        };
        write(
            &self.tx,
            &RpcOutbound::request(request.request_id.as_str(), REQUEST_PERMISSION, params),
        );
    }
}

fn write(tx: &mpsc::UnboundedSender<String>, message: &RpcOutbound) {
    match serde_json::to_string(message) {
        Ok(json) => {
            if tx.send(json).is_err() {
                warn!(method = message.method, "outbound channel closed, message dropped");
            }
        }
        Err(e) => warn!(method = message.method, error = %e, "failed to serialize outbound message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::content::ContentBlock;
    use parley_core::ids::{ConversationId, PermissionRequestId, ToolCallId};
    use parley_core::notifications::ToolKind;
    use parley_core::permissions::{PermissionOption, PermissionOptionKind, ToolCallDescriptor};
    use serde_json::Value;

    #[test]
    fn sink_writes_session_update() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = RpcNotificationSink::new(tx);
        sink.send(SessionNotification::message_chunk(
            ConversationId::from_raw("S1"),
            ContentBlock::text("Hello"),
        ));

        let value: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], SESSION_UPDATE);
        assert!(value.get("id").is_none());
        assert_eq!(value["params"]["conversationId"], "S1");
        assert_eq!(value["params"]["update"]["kind"], "agent_message_chunk");
        assert_eq!(value["params"]["update"]["content"]["text"], "Hello");
    }

    #[test]
    fn prompter_uses_request_id_as_rpc_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let prompter = RpcPermissionPrompter::new(tx);
        let request = PermissionRequest {
            conversation_id: ConversationId::from_raw("S1"),
            request_id: PermissionRequestId::from_raw("perm-9"),
            tool_call: ToolCallDescriptor::new(ToolCallId::from_raw("t1"), ToolKind::Execute),
            options: vec![PermissionOption::new("allow", "Allow", PermissionOptionKind::AllowOnce)],
        };
        prompter.prompt(&request);

        let value: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(value["id"], "perm-9");
        assert_eq!(value["method"], REQUEST_PERMISSION);
        assert_eq!(value["params"]["requestId"], "perm-9");
        assert_eq!(value["params"]["options"][0]["optionId"], "allow");
    }

    #[test]
    fn closed_channel_is_not_fatal() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = RpcNotificationSink::new(tx);
        sink.send(SessionNotification::message_chunk(
            ConversationId::from_raw("S1"),
            ContentBlock::text("lost"),
        ));
    }
}
