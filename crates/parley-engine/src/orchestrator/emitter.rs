use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use parley_core::content::{Annotations, ContentBlock};
use parley_core::ids::ConversationId;
use parley_core::notifications::{SessionNotification, SessionUpdate};

use crate::sink::NotificationSink;

/// Per-turn notification gate. Nothing leaves once the turn's token has fired.
pub(crate) struct TurnEmitter {
    sink: Arc<dyn NotificationSink>,
    conversation_id: ConversationId,
    cancel: CancellationToken,
    transcript: Mutex<Vec<ContentBlock>>,
}

impl TurnEmitter {
    pub(crate) fn new(
        sink: Arc<dyn NotificationSink>,
        conversation_id: ConversationId,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sink,
            conversation_id,
            cancel,
            transcript: Mutex::new(Vec::new()),
        }
    }

    /// Returns false if the update was suppressed.
    pub(crate) fn emit(&self, update: SessionUpdate) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.sink.send(SessionNotification {
            conversation_id: self.conversation_id.clone(),
            update,
        });
        true
    }

    /// Stamp and emit an assistant message block, keeping it for the transcript.
    pub(crate) fn message(&self, mut block: ContentBlock) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        block
            .annotations_mut()
            .get_or_insert_with(Annotations::default)
            .last_modified = Some(Utc::now().to_rfc3339());
        self.transcript.lock().push(block.clone());
        self.emit(SessionUpdate::AgentMessageChunk { content: block })
    }

    pub(crate) fn transcript(&self) -> Vec<ContentBlock> {
        self.transcript.lock().clone()
    }
}
