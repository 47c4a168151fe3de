//! Execution backend contract: whatever actually runs the agent.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use parley_core::content::ContentBlock;
use parley_core::ids::{ConversationId, TurnId};
use parley_core::notifications::{ToolCall, ToolCallUpdate};

use crate::error::BackendError;
use crate::permissions::PermissionHandle;

/// Metadata keys a backend sets to report why it stopped.
pub mod flags {
    pub const STOP_REASON: &str = "stopReason";
    pub const MAX_TOKENS: &str = "maxTokens";
    pub const MAX_TURN_REQUESTS: &str = "maxTurnRequests";
    pub const REFUSAL: &str = "refusal";
}

/// Final result of a backend call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendResponse {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackendResponse {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        let _ = self.metadata.insert(key.into(), value);
        self
    }

    fn flag(&self, key: &str, stop_reason: &str) -> bool {
        self.metadata.get(key).and_then(Value::as_bool).unwrap_or(false)
            || self.metadata.get(flags::STOP_REASON).and_then(Value::as_str) == Some(stop_reason)
    }

    pub fn hit_token_limit(&self) -> bool {
        self.flag(flags::MAX_TOKENS, "max_tokens")
    }

    pub fn hit_turn_limit(&self) -> bool {
        self.flag(flags::MAX_TURN_REQUESTS, "max_turn_requests")
    }

    pub fn is_refusal(&self) -> bool {
        self.flag(flags::REFUSAL, "refusal")
    }
}

/// One item of a streaming backend call.
#[derive(Clone, Debug, PartialEq)]
pub enum BackendEvent {
    /// Raw text fragment; split points are arbitrary.
    Chunk(String),
    /// Liveness signal with an optional human-readable note.
    Progress(Option<String>),
    ToolCall(ToolCall),
    ToolCallUpdate(ToolCallUpdate),
    /// Terminal event. A stream that ends without one counts as a plain success.
    Done(BackendResponse),
}

pub type BackendStream = Pin<Box<dyn Stream<Item = BackendEvent> + Send>>;

/// Everything a backend gets to know about the turn it serves.
#[derive(Clone, Debug)]
pub struct TurnContext {
    pub conversation_id: ConversationId,
    pub turn_id: TurnId,
    /// Working directory from the conversation's metadata.
    pub cwd: Option<String>,
    /// Request metadata as sent by the client.
    pub metadata: Map<String, Value>,
    /// Fires when the turn is cancelled. Backends must stop promptly.
    pub cancel: CancellationToken,
    pub permissions: PermissionHandle,
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Run the turn to completion and return the whole output.
    async fn send(
        &self,
        ctx: &TurnContext,
        content: &[ContentBlock],
    ) -> Result<BackendResponse, BackendError>;

    /// Run the turn, yielding fragments as they arrive.
    async fn send_streaming(
        &self,
        ctx: &TurnContext,
        content: &[ContentBlock],
    ) -> Result<BackendStream, BackendError>;
}
