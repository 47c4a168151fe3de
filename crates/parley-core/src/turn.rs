use serde::{Deserialize, Serialize};

use crate::content::{validate_content, ContentBlock};
use crate::errors::ValidationError;
use crate::ids::ConversationId;

/// Terminal classification of why a turn ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    MaxTurnRequests,
    Refusal,
    Cancelled,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EndTurn => "end_turn",
            Self::MaxTokens => "max_tokens",
            Self::MaxTurnRequests => "max_turn_requests",
            Self::Refusal => "refusal",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One submitted unit of content against a conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub conversation_id: ConversationId,
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl TurnRequest {
    pub fn new(conversation_id: ConversationId, content: Vec<ContentBlock>) -> Self {
        Self {
            conversation_id,
            content,
            streaming: false,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Parse raw params, reporting missing required fields by name.
    pub fn from_value(params: serde_json::Value) -> Result<Self, ValidationError> {
        if !params.is_object() {
            return Err(ValidationError::Malformed("params must be an object".into()));
        }
        for key in ["conversationId", "content"] {
            if params.get(key).map_or(true, serde_json::Value::is_null) {
                return Err(ValidationError::MissingField(key));
            }
        }
        let request: Self = serde_json::from_value(params)?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.conversation_id.is_empty() {
            return Err(ValidationError::MissingField("conversationId"));
        }
        validate_content(&self.content)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResponse {
    pub stop_reason: StopReason,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl TurnResponse {
    pub fn new(stop_reason: StopReason) -> Self {
        Self {
            stop_reason,
            metadata: serde_json::Map::new(),
        }
    }
}
