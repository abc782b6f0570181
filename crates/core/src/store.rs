//! Collaborator traits at the edges of the mediation core.
//!
//! Persistence, knowledge retrieval, URL extraction and security logging are
//! owned by the embedding application; the core only talks to these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ExtractError, StoreError};
use crate::message::{ConversationId, KnowledgeSnippet, Message, Role};

/// Durable conversation history.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Append a message to a conversation's history.
    async fn append(
        &self,
        conversation_id: &ConversationId,
        role: Role,
        content: &str,
        filtered: bool,
        filter_reason: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Fetch the full history of a conversation, oldest first.
    async fn history(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, StoreError>;

    /// Bump the conversation's `updated_at` without adding a message.
    async fn touch(&self, conversation_id: &ConversationId) -> Result<(), StoreError>;
}

/// Source of curated knowledge snippets for context injection.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Currently active snippets, already filtered and ordered by the backend.
    async fn active_snippets(&self) -> Result<Vec<KnowledgeSnippet>, StoreError>;
}

/// Fetches readable text for a URL mentioned in a user turn.
#[async_trait]
pub trait UrlTextExtractor: Send + Sync {
    /// Extract at most `max_chars` characters of text from `url`.
    async fn extract(&self, url: &str, max_chars: usize) -> Result<String, ExtractError>;
}

/// Transport-level request metadata attached to security violations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMeta {
    pub client_ip: String,
    pub user_agent: String,
}

/// A recorded security rule violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub user: String,
    pub rule_id: i64,
    pub rule_name: String,
    pub action: String,
    /// The text that triggered the rule, as submitted or as generated
    pub content: String,
    pub meta: RequestMeta,
    pub occurred_at: DateTime<Utc>,
}

impl ViolationRecord {
    pub fn new(
        user: impl Into<String>,
        rule_id: i64,
        rule_name: impl Into<String>,
        action: impl Into<String>,
        content: impl Into<String>,
        meta: RequestMeta,
    ) -> Self {
        Self {
            user: user.into(),
            rule_id,
            rule_name: rule_name.into(),
            action: action.into(),
            content: content.into(),
            meta,
            occurred_at: Utc::now(),
        }
    }
}

/// Sink for security violation records.
///
/// Implementations must not fail the chat path; errors are for the caller to
/// log and swallow.
#[async_trait]
pub trait SecurityLogSink: Send + Sync {
    async fn record_violation(&self, record: ViolationRecord) -> Result<(), StoreError>;
}
