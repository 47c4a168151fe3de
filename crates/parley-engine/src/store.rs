//! Conversation storage contract and the in-memory reference store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use parley_core::content::{ContentBlock, Role};
use parley_core::ids::ConversationId;

use crate::error::StoreError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub timestamp: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    /// Store-owned metadata. `cwd` holds the working directory.
    pub metadata: Map<String, Value>,
    pub messages: Vec<StoredMessage>,
    pub processing: bool,
    pub created_at: String,
}

impl Conversation {
    pub fn new(id: ConversationId) -> Self {
        Self {
            id,
            metadata: Map::new(),
            messages: Vec::new(),
            processing: false,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    pub fn cwd(&self) -> Option<&str> {
        self.metadata.get("cwd").and_then(Value::as_str)
    }
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// `Ok(None)` when the conversation does not exist.
    async fn load(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError>;

    async fn add_message(
        &self,
        id: &ConversationId,
        role: Role,
        content: &[ContentBlock],
    ) -> Result<(), StoreError>;

    /// Shallow-merge `patch` into the conversation's metadata.
    async fn update_metadata(
        &self,
        id: &ConversationId,
        patch: Map<String, Value>,
    ) -> Result<(), StoreError>;

    async fn mark_processing(&self, id: &ConversationId) -> Result<(), StoreError>;

    async fn unmark_processing(&self, id: &ConversationId) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<ConversationId, Conversation>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) a conversation, optionally recording its working directory.
    pub fn create(&self, id: ConversationId, cwd: Option<&str>) -> Conversation {
        let mut conversation = Conversation::new(id.clone());
        if let Some(cwd) = cwd {
            let _ = conversation
                .metadata
                .insert("cwd".into(), Value::String(cwd.to_string()));
        }
        let _ = self.conversations.write().insert(id, conversation.clone());
        conversation
    }

    pub fn remove(&self, id: &ConversationId) -> bool {
        self.conversations.write().remove(id).is_some()
    }

    pub fn get(&self, id: &ConversationId) -> Option<Conversation> {
        self.conversations.read().get(id).cloned()
    }

    fn with_mut<T>(
        &self,
        id: &ConversationId,
        f: impl FnOnce(&mut Conversation) -> T,
    ) -> Result<T, StoreError> {
        let mut conversations = self.conversations.write();
        let conversation = conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        Ok(f(conversation))
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError> {
        Ok(self.get(id))
    }

    async fn add_message(
        &self,
        id: &ConversationId,
        role: Role,
        content: &[ContentBlock],
    ) -> Result<(), StoreError> {
        self.with_mut(id, |c| {
            c.messages.push(StoredMessage {
                role,
                content: content.to_vec(),
                timestamp: Utc::now().to_rfc3339(),
            });
        })
    }

    async fn update_metadata(
        &self,
        id: &ConversationId,
        patch: Map<String, Value>,
    ) -> Result<(), StoreError> {
        self.with_mut(id, |c| c.metadata.extend(patch))
    }

    async fn mark_processing(&self, id: &ConversationId) -> Result<(), StoreError> {
        self.with_mut(id, |c| c.processing = true)
    }

    async fn unmark_processing(&self, id: &ConversationId) -> Result<(), StoreError> {
        self.with_mut(id, |c| c.processing = false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn load_missing_is_none() {
        let store = InMemoryConversationStore::new();
        assert!(store.load(&ConversationId::from_raw("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_and_load() {
        let store = InMemoryConversationStore::new();
        let id = ConversationId::from_raw("S1");
        store.create(id.clone(), Some("/work"));
        let conv = store.load(&id).await.unwrap().unwrap();
        assert_eq!(conv.cwd(), Some("/work"));
        assert!(!conv.processing);
    }

    #[tokio::test]
    async fn processing_flag_toggles() {
        let store = InMemoryConversationStore::new();
        let id = ConversationId::from_raw("S1");
        store.create(id.clone(), None);
        store.mark_processing(&id).await.unwrap();
        assert!(store.get(&id).unwrap().processing);
        store.unmark_processing(&id).await.unwrap();
        assert!(!store.get(&id).unwrap().processing);
    }

    #[tokio::test]
    async fn metadata_merges() {
        let store = InMemoryConversationStore::new();
        let id = ConversationId::from_raw("S1");
        store.create(id.clone(), Some("/a"));
        let mut patch = Map::new();
        let _ = patch.insert("lastActivityAt".into(), json!("2026-01-01T00:00:00Z"));
        store.update_metadata(&id, patch).await.unwrap();
        let conv = store.get(&id).unwrap();
        assert_eq!(conv.cwd(), Some("/a"));
        assert_eq!(conv.metadata["lastActivityAt"], "2026-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn messages_append() {
        let store = InMemoryConversationStore::new();
        let id = ConversationId::from_raw("S1");
        store.create(id.clone(), None);
        store.add_message(&id, Role::User, &[ContentBlock::text("hi")]).await.unwrap();
        store
            .add_message(&id, Role::Assistant, &[ContentBlock::text("Hello")])
            .await
            .unwrap();
        let conv = store.get(&id).unwrap();
        assert_eq!(conv.messages.len(), 2);
        assert_eq!(conv.messages[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn mutations_on_missing_conversation_fail() {
        let store = InMemoryConversationStore::new();
        let id = ConversationId::from_raw("gone");
        let err = store.mark_processing(&id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(ref missing) if *missing == id));
        assert!(store.add_message(&id, Role::User, &[]).await.is_err());
    }

    #[test]
    fn remove_conversation() {
        let store = InMemoryConversationStore::new();
        let id = ConversationId::from_raw("S1");
        store.create(id.clone(), None);
        assert!(store.remove(&id));
        assert!(!store.remove(&id));
    }
}
