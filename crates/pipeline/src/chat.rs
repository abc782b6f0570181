//! The synchronous chat path: validate, persist, assemble, ask, persist.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use promptgate_client::InferenceClient;
use promptgate_core::{
    ConversationId, ConversationStore, KnowledgeStore, PipelineError, RequestMeta, Role,
    SecurityLogSink, ValidationError, ViolationRecord,
};
use promptgate_policy::{Verdict, sanitize_for_storage};

use crate::assembler::ContextAssembler;

/// One user turn submitted to the pipeline.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub conversation_id: ConversationId,
    pub user: String,
    pub text: String,
    pub model_override: Option<String>,
    pub meta: RequestMeta,
}

/// The pipeline's answer for a turn.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub conversation_id: ConversationId,
    pub response: String,
    pub filtered: bool,
    pub filter_reason: Option<String>,
}

/// Mediates one synchronous chat turn end to end.
pub struct ChatPipeline {
    client: Arc<InferenceClient>,
    store: Arc<dyn ConversationStore>,
    knowledge: Arc<dyn KnowledgeStore>,
    security_log: Arc<dyn SecurityLogSink>,
    assembler: ContextAssembler,
    max_message_length: usize,
}

impl ChatPipeline {
    pub fn new(
        client: Arc<InferenceClient>,
        store: Arc<dyn ConversationStore>,
        knowledge: Arc<dyn KnowledgeStore>,
        security_log: Arc<dyn SecurityLogSink>,
        assembler: ContextAssembler,
        max_message_length: usize,
    ) -> Self {
        Self {
            client,
            store,
            knowledge,
            security_log,
            assembler,
            max_message_length,
        }
    }

    /// Handle one turn and wait for the full answer.
    ///
    /// Validation rejects before any persistence or policy side effect. The
    /// user message is stored before the backend call, so it survives an
    /// upstream failure.
    pub async fn send(
        &self,
        request: SendRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatOutcome, PipelineError> {
        self.validate(&request.text)?;
        let text = sanitize_for_storage(&request.text);

        // History before this turn; the current text rides separately.
        let history = self.store.history(&request.conversation_id).await?;
        self.store
            .append(&request.conversation_id, Role::User, &text, false, None)
            .await?;

        let snippets = self.knowledge.active_snippets().await.unwrap_or_else(|e| {
            warn!(error = %e, "Knowledge lookup failed, continuing without snippets");
            Vec::new()
        });

        let window = self.assembler.build(&history, &snippets, &text).await;

        let reply = self
            .client
            .chat(&window, request.model_override.as_deref(), cancel)
            .await?;

        if let Some(verdict) = &reply.verdict {
            self.record_violation(&request, verdict, &text).await;
        }

        let filtered = reply.verdict.as_ref().is_some_and(|v| v.blocked);
        let filter_reason = filtered
            .then(|| reply.verdict.as_ref().map(|v| v.reason.clone()))
            .flatten();

        if filtered {
            info!(
                conversation = %request.conversation_id,
                reason = filter_reason.as_deref().unwrap_or(""),
                "Turn filtered"
            );
        }

        self.store
            .append(
                &request.conversation_id,
                Role::Assistant,
                &reply.text,
                filtered,
                reply
                    .verdict
                    .as_ref()
                    .filter(|v| v.blocked)
                    .map(|v| v.rule_name.as_str()),
            )
            .await?;
        self.store.touch(&request.conversation_id).await?;

        Ok(ChatOutcome {
            conversation_id: request.conversation_id,
            response: reply.text,
            filtered,
            filter_reason,
        })
    }

    fn validate(&self, text: &str) -> Result<(), ValidationError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::Empty);
        }
        let len = trimmed.chars().count();
        if len > self.max_message_length {
            return Err(ValidationError::TooLong {
                len,
                max: self.max_message_length,
            });
        }
        Ok(())
    }

    async fn record_violation(&self, request: &SendRequest, verdict: &Verdict, content: &str) {
        let record = ViolationRecord::new(
            request.user.clone(),
            verdict.rule_id,
            verdict.rule_name.clone(),
            verdict.action.as_str(),
            content,
            request.meta.clone(),
        );
        if let Err(e) = self.security_log.record_violation(record).await {
            warn!(error = %e, "Failed to record security violation");
        }
    }
}
