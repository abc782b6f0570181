//! Wire types for the inference backend's chat API.
//!
//! The backend speaks JSON over two endpoints: `POST /api/chat` (single
//! response, or newline-delimited chunks when `stream` is set) and
//! `GET /api/tags` (installed models).

use promptgate_config::GenerationConfig;
use promptgate_core::Message;
use serde::{Deserialize, Serialize};

/// A message as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

impl From<&Message> for WireMessage {
    fn from(msg: &Message) -> Self {
        Self {
            role: msg.role.as_str().to_string(),
            content: msg.content.clone(),
        }
    }
}

/// Generation parameters forwarded with every request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_ctx: Option<u32>,
}

impl From<&GenerationConfig> for GenOptions {
    fn from(cfg: &GenerationConfig) -> Self {
        Self {
            temperature: Some(cfg.temperature),
            top_p: Some(cfg.top_p),
            top_k: cfg.top_k,
            num_ctx: Some(cfg.num_ctx),
        }
    }
}

/// `POST /api/chat` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    pub stream: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<GenOptions>,
}

/// `POST /api/chat` response body. Streaming responses send one of these
/// per line; the final line carries `done: true`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub created_at: Option<String>,

    #[serde(default)]
    pub message: Option<WireMessage>,

    #[serde(default)]
    pub done: bool,
}

/// `GET /api/tags` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct TagsResponse {
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

/// An installed model as reported by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,

    #[serde(default)]
    pub modified_at: Option<String>,

    #[serde(default)]
    pub size: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_skips_unset_options() {
        let req = ChatRequest {
            model: "deepseek-r1:14b".into(),
            messages: vec![WireMessage {
                role: "user".into(),
                content: "hola".into(),
            }],
            stream: false,
            options: Some(GenOptions {
                temperature: Some(0.7),
                top_p: Some(0.9),
                top_k: None,
                num_ctx: Some(4096),
            }),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"temperature\":0.7"));
        assert!(json.contains("\"num_ctx\":4096"));
        assert!(!json.contains("top_k"));
    }

    #[test]
    fn stream_line_parses() {
        let line = r#"{"model":"deepseek-r1:14b","created_at":"2026-01-15T10:00:00Z","message":{"role":"assistant","content":"Hola"},"done":false}"#;
        let chunk: ChatResponse = serde_json::from_str(line).unwrap();
        assert_eq!(chunk.message.unwrap().content, "Hola");
        assert!(!chunk.done);
    }

    #[test]
    fn final_stream_line_may_omit_message() {
        let line = r#"{"model":"deepseek-r1:14b","done":true}"#;
        let chunk: ChatResponse = serde_json::from_str(line).unwrap();
        assert!(chunk.done);
        assert!(chunk.message.is_none());
    }

    #[test]
    fn tags_response_parses() {
        let body = r#"{"models":[{"name":"deepseek-r1:14b","modified_at":"2026-01-10T08:00:00Z","size":9000000000},{"name":"llama3:8b"}]}"#;
        let tags: TagsResponse = serde_json::from_str(body).unwrap();
        assert_eq!(tags.models.len(), 2);
        assert_eq!(tags.models[0].name, "deepseek-r1:14b");
        assert_eq!(tags.models[1].size, None);
    }
}
