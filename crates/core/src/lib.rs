//! # Promptgate Core
//!
//! Domain types, traits, and error definitions for the Promptgate chat
//! mediation core. This crate has **zero framework dependencies** — it
//! defines the domain model the other crates implement against.
//!
//! Persistence, knowledge retrieval, URL extraction and security logging are
//! collaborator traits here; implementations live in the embedding
//! application (in-memory versions ship with the pipeline crate for tests).

pub mod error;
pub mod message;
pub mod store;

// Re-export key types at crate root for ergonomics
pub use error::{ExtractError, PipelineError, StoreError, UpstreamError, ValidationError};
pub use message::{Conversation, ConversationId, KnowledgeSnippet, Message, Role, truncate_title};
pub use store::{
    ConversationStore, KnowledgeStore, RequestMeta, SecurityLogSink, UrlTextExtractor,
    ViolationRecord,
};
