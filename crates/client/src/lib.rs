//! # Promptgate Client
//!
//! Client for the inference backend: synchronous chat with retry and
//! exponential backoff, streamed chat over newline-delimited JSON, a
//! TTL-cached availability probe, and model selection. Every request passes
//! the policy engine in both directions before and after the wire.

pub mod client;
pub mod transport;
pub mod wire;

pub use client::{ChatReply, InferenceClient, StreamEvent, StreamStart};
pub use transport::{HttpTransport, Transport};
pub use wire::{ChatRequest, ChatResponse, GenOptions, ModelInfo, TagsResponse, WireMessage};
