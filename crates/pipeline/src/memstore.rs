//! In-memory collaborator implementations.
//!
//! These back the pipeline tests and small deployments that do not need
//! durable storage; production embeds its own database-backed collaborators.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;

use promptgate_core::{
    Conversation, ConversationId, ConversationStore, ExtractError, KnowledgeSnippet,
    KnowledgeStore, Message, Role, SecurityLogSink, StoreError, UrlTextExtractor, ViolationRecord,
    truncate_title,
};

/// Map-backed conversation store.
#[derive(Default)]
pub struct MemoryConversationStore {
    conversations: Mutex<HashMap<String, Conversation>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty conversation and return its id.
    pub fn create(&self, owner: &str) -> ConversationId {
        let conv = Conversation::new(owner);
        let id = conv.id.clone();
        self.conversations
            .lock()
            .unwrap()
            .insert(id.0.clone(), conv);
        id
    }

    /// The stored conversation, cloned.
    pub fn get(&self, id: &ConversationId) -> Option<Conversation> {
        self.conversations.lock().unwrap().get(&id.0).cloned()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn append(
        &self,
        conversation_id: &ConversationId,
        role: Role,
        content: &str,
        filtered: bool,
        filter_reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut conversations = self.conversations.lock().unwrap();
        let conv = conversations
            .get_mut(&conversation_id.0)
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))?;

        let mut message = Message::new(role, content);
        message.filtered = filtered;
        message.filter_reason = filter_reason.map(String::from);

        if conv.title.is_none() && role == Role::User {
            conv.title = Some(truncate_title(content));
        }
        conv.push(message);
        Ok(())
    }

    async fn history(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, StoreError> {
        let conversations = self.conversations.lock().unwrap();
        conversations
            .get(&conversation_id.0)
            .map(|c| c.messages.clone())
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))
    }

    async fn touch(&self, conversation_id: &ConversationId) -> Result<(), StoreError> {
        let mut conversations = self.conversations.lock().unwrap();
        let conv = conversations
            .get_mut(&conversation_id.0)
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))?;
        conv.updated_at = Utc::now();
        Ok(())
    }
}

/// Fixed snippet list.
pub struct StaticKnowledge {
    snippets: Vec<KnowledgeSnippet>,
}

impl StaticKnowledge {
    pub fn new(snippets: Vec<KnowledgeSnippet>) -> Self {
        Self { snippets }
    }

    pub fn empty() -> Self {
        Self { snippets: Vec::new() }
    }
}

#[async_trait]
impl KnowledgeStore for StaticKnowledge {
    async fn active_snippets(&self) -> Result<Vec<KnowledgeSnippet>, StoreError> {
        Ok(self.snippets.clone())
    }
}

/// Violation sink that keeps records in memory.
#[derive(Default)]
pub struct MemorySecurityLog {
    records: Mutex<Vec<ViolationRecord>>,
}

impl MemorySecurityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ViolationRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl SecurityLogSink for MemorySecurityLog {
    async fn record_violation(&self, record: ViolationRecord) -> Result<(), StoreError> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}

/// Extractor returning fixed text, truncated to the requested budget.
pub struct StaticExtractor {
    text: String,
}

impl StaticExtractor {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[async_trait]
impl UrlTextExtractor for StaticExtractor {
    async fn extract(&self, _url: &str, max_chars: usize) -> Result<String, ExtractError> {
        Ok(self.text.chars().take(max_chars).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_and_history_roundtrip() {
        let store = MemoryConversationStore::new();
        let id = store.create("user-1");

        store
            .append(&id, Role::User, "hola", false, None)
            .await
            .unwrap();
        store
            .append(&id, Role::Assistant, "buenos dias", false, None)
            .await
            .unwrap();

        let history = store.history(&id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "hola");
        assert_eq!(history[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn first_user_message_titles_the_conversation() {
        let store = MemoryConversationStore::new();
        let id = store.create("user-1");
        store
            .append(&id, Role::User, "necesito ayuda con el informe", false, None)
            .await
            .unwrap();

        let conv = store.get(&id).unwrap();
        assert_eq!(conv.title.as_deref(), Some("necesito ayuda con el informe"));
    }

    #[tokio::test]
    async fn unknown_conversation_errors() {
        let store = MemoryConversationStore::new();
        let missing = ConversationId::from("nope");
        assert!(matches!(
            store.history(&missing).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.touch(&missing).await.is_err());
    }

    #[tokio::test]
    async fn touch_bumps_updated_at() {
        let store = MemoryConversationStore::new();
        let id = store.create("user-1");
        let before = store.get(&id).unwrap().updated_at;
        store.touch(&id).await.unwrap();
        assert!(store.get(&id).unwrap().updated_at >= before);
    }
}
