//! # Promptgate Pipeline
//!
//! The mediation pipeline: context assembly (knowledge, history, URL
//! enrichment), the synchronous chat path, and the streaming orchestrator
//! with its frame protocol. In-memory collaborator implementations live in
//! [`memstore`] for tests and storage-free deployments.

pub mod assembler;
pub mod chat;
pub mod memstore;
pub mod orchestrator;

pub use assembler::ContextAssembler;
pub use chat::{ChatOutcome, ChatPipeline, SendRequest};
pub use memstore::{MemoryConversationStore, MemorySecurityLog, StaticExtractor, StaticKnowledge};
pub use orchestrator::{StreamFrame, StreamOrchestrator, StreamRequest};
