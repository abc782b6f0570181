//! Message and Conversation domain types.
//!
//! These are the value objects that flow through the whole mediation path:
//! a user turn arrives → policy checks it → context is assembled → the
//! inference backend answers → the reply is checked and persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The model's reply
    Assistant,
    /// Operating instructions and injected knowledge
    System,
}

impl Role {
    /// Wire name, matching the chat API's `role` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,

    /// True if a security rule replaced this message's content with a refusal
    #[serde(default)]
    pub filtered: bool,

    /// Rule name or reason behind the refusal, when `filtered` is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_reason: Option<String>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create an assistant refusal carrying the rule that triggered it.
    pub fn refusal(content: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Assistant, content);
        msg.filtered = true;
        msg.filter_reason = Some(reason.into());
        msg
    }

    /// Create a message with an explicit role.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            filtered: false,
            filter_reason: None,
            timestamp: Utc::now(),
        }
    }
}

/// A conversation is an ordered sequence of messages with shared settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique conversation ID
    pub id: ConversationId,

    /// Owning user, opaque to this crate
    pub owner: String,

    /// Ordered messages
    pub messages: Vec<Message>,

    /// When this conversation was created
    pub created_at: DateTime<Utc>,

    /// When the last message was added
    pub updated_at: DateTime<Utc>,

    /// Optional title, derived from the first user turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Per-conversation model override; the client's global model applies when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Conversation {
    /// Create a new empty conversation for a user.
    pub fn new(owner: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            owner: owner.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            title: None,
            model: None,
        }
    }

    /// Add a message to the conversation.
    pub fn push(&mut self, message: Message) {
        self.updated_at = Utc::now();
        self.messages.push(message);
    }
}

/// A curated knowledge entry injected into the model context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeSnippet {
    pub title: String,
    pub category: String,
    pub content: String,
}

impl KnowledgeSnippet {
    pub fn new(
        title: impl Into<String>,
        category: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            category: category.into(),
            content: content.into(),
        }
    }
}

/// Derive a conversation title from the first user turn.
///
/// Titles longer than 50 characters are cut at 47 and ellipsized.
pub fn truncate_title(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= 50 {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(47).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_user_message() {
        let msg = Message::user("Hola");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hola");
        assert!(!msg.filtered);
    }

    #[test]
    fn refusal_carries_reason() {
        let msg = Message::refusal("Lo siento", "sql_injection");
        assert!(msg.filtered);
        assert_eq!(msg.filter_reason.as_deref(), Some("sql_injection"));
        assert_eq!(msg.role, Role::Assistant);
    }

    #[test]
    fn conversation_tracks_updates() {
        let mut conv = Conversation::new("user-1");
        let created = conv.created_at;

        conv.push(Message::user("First message"));
        assert_eq!(conv.messages.len(), 1);
        assert!(conv.updated_at >= created);
    }

    #[test]
    fn message_serialization_roundtrip() {
        let msg = Message::user("Test message");
        let json = serde_json::to_string(&msg).unwrap();
        let deserialized: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.content, "Test message");
        assert_eq!(deserialized.role, Role::User);
    }

    #[test]
    fn title_truncation() {
        assert_eq!(truncate_title("  short  "), "short");
        let long = "x".repeat(80);
        let title = truncate_title(&long);
        assert_eq!(title.chars().count(), 50);
        assert!(title.ends_with("..."));
    }
}
