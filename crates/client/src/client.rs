//! The inference client: retries, policy checks, streaming and model
//! selection over a [`Transport`].

use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use promptgate_config::AppConfig;
use promptgate_core::{Message, Role, UpstreamError};
use promptgate_policy::{Direction, REFUSAL_INPUT, REFUSAL_OUTPUT, RuleEngine, Verdict};

use crate::transport::{HttpTransport, Transport};
use crate::wire::{ChatRequest, ChatResponse, GenOptions, ModelInfo, WireMessage};

/// A completed synchronous chat.
#[derive(Debug, Clone)]
pub struct ChatReply {
    /// The answer, or a fixed refusal when a rule blocked it
    pub text: String,
    /// The rule verdict that applied, if any
    pub verdict: Option<Verdict>,
}

/// One event on an open response stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A text fragment, in arrival order
    Delta(String),
    /// End of stream: the full concatenated text and its output-check verdict
    Done {
        text: String,
        verdict: Option<Verdict>,
    },
}

/// Result of opening a response stream.
pub enum StreamStart {
    /// The input was blocked before any network traffic
    Blocked(Verdict),
    /// The stream is open
    Open {
        events: mpsc::Receiver<Result<StreamEvent, UpstreamError>>,
        /// Non-blocking verdict on the input (warn/log), if any
        input_verdict: Option<Verdict>,
    },
}

struct Availability {
    available: bool,
    checked_at: Option<Instant>,
}

/// Client for the inference backend.
///
/// Every request passes the rule engine in both directions: the last user
/// message before the call, the generated text after it. Transient upstream
/// failures retry with exponential backoff; 4xx responses never retry.
pub struct InferenceClient {
    transport: Arc<dyn Transport>,
    rules: Arc<RuleEngine>,
    system_prompt: String,
    model: RwLock<String>,
    options: GenOptions,
    retries: u32,
    backoff_base: Duration,
    availability: Mutex<Availability>,
    availability_ttl: Duration,
}

impl InferenceClient {
    /// Build a client over HTTP from configuration.
    pub fn new(config: &AppConfig, rules: Arc<RuleEngine>) -> Self {
        let transport = Arc::new(HttpTransport::new(
            config.server_url.clone(),
            config.upstream.request_timeout(),
            config.upstream.probe_timeout(),
        ));
        Self::with_transport(transport, config, rules)
    }

    /// Build a client over an arbitrary transport.
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        config: &AppConfig,
        rules: Arc<RuleEngine>,
    ) -> Self {
        Self {
            transport,
            rules,
            system_prompt: config.system_prompt.clone(),
            model: RwLock::new(config.default_model.clone()),
            options: GenOptions::from(&config.generation),
            retries: config.upstream.retries,
            backoff_base: config.upstream.backoff_base(),
            availability: Mutex::new(Availability {
                available: false,
                checked_at: None,
            }),
            availability_ttl: config.upstream.availability_ttl(),
        }
    }

    /// The globally selected model.
    pub fn model(&self) -> String {
        self.model.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Change the globally selected model.
    pub fn set_model(&self, name: impl Into<String>) {
        let name = name.into();
        info!(model = %name, "Switching default model");
        *self.model.write().unwrap_or_else(|e| e.into_inner()) = name;
    }

    fn resolve_model(&self, model_override: Option<&str>) -> String {
        match model_override {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => self.model(),
        }
    }

    fn build_request(&self, messages: &[Message], model: String, stream: bool) -> ChatRequest {
        let mut wire = Vec::with_capacity(messages.len() + 1);
        wire.push(WireMessage {
            role: Role::System.as_str().to_string(),
            content: self.system_prompt.clone(),
        });
        wire.extend(messages.iter().map(WireMessage::from));
        ChatRequest {
            model,
            messages: wire,
            stream,
            options: Some(self.options.clone()),
        }
    }

    /// Check the last user message in the window against input rules.
    fn check_input(&self, messages: &[Message]) -> Option<Verdict> {
        let last_user = messages.iter().rev().find(|m| m.role == Role::User)?;
        self.rules.check(Direction::Input, &last_user.content)
    }

    /// Send a chat request and wait for the full answer.
    ///
    /// A blocked input returns the fixed refusal without touching the
    /// network; a blocked answer is replaced by the output refusal. Either
    /// way the verdict rides along for the caller to record.
    pub async fn chat(
        &self,
        messages: &[Message],
        model_override: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ChatReply, UpstreamError> {
        let input_verdict = self.check_input(messages);
        if let Some(v) = &input_verdict {
            if v.blocked {
                info!(rule = %v.rule_name, "Input blocked, skipping backend call");
                return Ok(ChatReply {
                    text: REFUSAL_INPUT.to_string(),
                    verdict: input_verdict,
                });
            }
        }

        let model = self.resolve_model(model_override);
        let request = self.build_request(messages, model, false);

        let response = self.send_with_retries(&request, cancel).await?;
        let text = response
            .message
            .map(|m| m.content)
            .unwrap_or_default();

        match self.rules.check(Direction::Output, &text) {
            Some(v) if v.blocked => {
                info!(rule = %v.rule_name, "Generated answer blocked");
                Ok(ChatReply {
                    text: REFUSAL_OUTPUT.to_string(),
                    verdict: Some(v),
                })
            }
            output_verdict => Ok(ChatReply {
                text,
                verdict: output_verdict.or(input_verdict),
            }),
        }
    }

    async fn send_with_retries(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, UpstreamError> {
        let mut last_err = None;

        for attempt in 1..=self.retries {
            if cancel.is_cancelled() {
                return Err(UpstreamError::Cancelled);
            }

            if attempt > 1 {
                let wait = backoff_delay(self.backoff_base, attempt);
                debug!(attempt, wait_ms = wait.as_millis() as u64, "Backing off before retry");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
                    _ = tokio::time::sleep(wait) => {}
                }
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
                r = self.transport.chat(request) => r,
            };

            match result {
                Ok(response) => {
                    self.mark_availability(true).await;
                    return Ok(response);
                }
                Err(e) if e.is_retryable() => {
                    warn!(attempt, error = %e, "Chat attempt failed");
                    if matches!(e, UpstreamError::Network(_)) {
                        self.mark_availability(false).await;
                    }
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| UpstreamError::Network("no attempts made".into())))
    }

    /// Open a streaming chat.
    ///
    /// Undecodable stream lines are skipped. The producer performs one
    /// output check on the full concatenated text and finishes with
    /// [`StreamEvent::Done`].
    pub async fn chat_stream(
        &self,
        messages: &[Message],
        model_override: Option<&str>,
    ) -> Result<StreamStart, UpstreamError> {
        let input_verdict = self.check_input(messages);
        if let Some(v) = input_verdict.clone() {
            if v.blocked {
                info!(rule = %v.rule_name, "Input blocked, stream not opened");
                return Ok(StreamStart::Blocked(v));
            }
        }

        let model = self.resolve_model(model_override);
        let request = self.build_request(messages, model, true);

        let mut lines = match self.transport.chat_stream(&request).await {
            Ok(rx) => {
                self.mark_availability(true).await;
                rx
            }
            Err(e) => {
                if matches!(e, UpstreamError::Network(_)) {
                    self.mark_availability(false).await;
                }
                return Err(e);
            }
        };

        let (tx, events) = mpsc::channel(64);
        let rules = self.rules.clone();

        tokio::spawn(async move {
            let mut full = String::new();

            while let Some(line) = lines.recv().await {
                match line {
                    Ok(raw) => match serde_json::from_str::<ChatResponse>(&raw) {
                        Ok(chunk) => {
                            let content =
                                chunk.message.map(|m| m.content).unwrap_or_default();
                            if !content.is_empty() {
                                full.push_str(&content);
                                if tx.send(Ok(StreamEvent::Delta(content))).await.is_err() {
                                    return; // receiver dropped
                                }
                            }
                            if chunk.done {
                                break;
                            }
                        }
                        Err(e) => {
                            trace!(line = %raw, error = %e, "Ignoring undecodable stream line");
                        }
                    },
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }

            let verdict = rules.check(Direction::Output, &full);
            let _ = tx.send(Ok(StreamEvent::Done { text: full, verdict })).await;
        });

        Ok(StreamStart::Open {
            events,
            input_verdict,
        })
    }

    /// Whether the backend currently answers, cached for the TTL.
    pub async fn is_available(&self) -> bool {
        let mut cache = self.availability.lock().await;
        if let Some(at) = cache.checked_at {
            if at.elapsed() < self.availability_ttl {
                return cache.available;
            }
        }

        let available = self.transport.tags().await.is_ok();
        debug!(available, "Probed backend availability");
        cache.available = available;
        cache.checked_at = Some(Instant::now());
        available
    }

    /// Models installed on the backend.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, UpstreamError> {
        let tags = self.transport.tags().await?;
        self.mark_availability(true).await;
        Ok(tags.models)
    }

    async fn mark_availability(&self, available: bool) {
        let mut cache = self.availability.lock().await;
        cache.available = available;
        cache.checked_at = Some(Instant::now());
    }
}

/// Exponential backoff for retry `attempt` (2 is the first retry),
/// saturating instead of overflowing for large retry counts.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(2)))
}
