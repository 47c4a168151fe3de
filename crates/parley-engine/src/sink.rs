use parking_lot::Mutex;

use parley_core::notifications::{SessionNotification, SessionUpdate};

/// Outbound channel for session notifications. Fire-and-forget: delivery
/// failures are the sink's concern.
pub trait NotificationSink: Send + Sync {
    fn send(&self, notification: SessionNotification);
}

/// Sink that keeps every notification in memory, in arrival order.
#[derive(Default)]
pub struct RecordingSink {
    notifications: Mutex<Vec<SessionNotification>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<SessionNotification> {
        self.notifications.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.notifications.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifications.lock().is_empty()
    }

    /// Text of every `agent_message_chunk`, in order.
    pub fn message_texts(&self) -> Vec<String> {
        self.notifications
            .lock()
            .iter()
            .filter_map(|n| match &n.update {
                SessionUpdate::AgentMessageChunk { content } => content.as_text().map(str::to_string),
                _ => None,
            })
            .collect()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.notifications.lock().iter().map(|n| n.update.kind()).collect()
    }
}

impl NotificationSink for RecordingSink {
    fn send(&self, notification: SessionNotification) {
        self.notifications.lock().push(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::content::ContentBlock;
    use parley_core::ids::ConversationId;

    #[test]
    fn records_in_order() {
        let sink = RecordingSink::new();
        assert!(sink.is_empty());
        let conv = ConversationId::from_raw("S1");
        sink.send(SessionNotification::message_chunk(conv.clone(), ContentBlock::text("a")));
        sink.send(SessionNotification::message_chunk(conv, ContentBlock::text("b")));
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.message_texts(), vec!["a", "b"]);
        assert_eq!(sink.kinds(), vec!["agent_message_chunk", "agent_message_chunk"]);
    }
}
