//! Streaming delivery: frame protocol and the pump between the inference
//! client and the consumer.
//!
//! Lifecycle: a start frame, optional heartbeats while the model warms up,
//! token frames in order, then exactly one terminal frame — `done`,
//! `filtered` or `error`. Caller disconnect cancels the producer; a hung
//! stream is cut by an absolute deadline.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use promptgate_client::{InferenceClient, StreamEvent, StreamStart};
use promptgate_core::{
    ConversationId, ConversationStore, RequestMeta, Role, SecurityLogSink, ViolationRecord,
};
use promptgate_policy::{REFUSAL_INPUT, Verdict};

/// One frame on the consumer-facing stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    /// Stream accepted; carries the conversation and the model answering
    Start {
        conversation_id: String,
        model: String,
    },
    /// A text fragment, in generation order
    Token { content: String },
    /// Keep-alive while waiting for the first token
    Heartbeat,
    /// Terminal: the answer was withheld by a security rule
    Filtered { reason: String },
    /// Terminal: the answer completed and was persisted
    Done { conversation_id: String },
    /// Terminal: the backend failed
    Error { message: String },
}

impl StreamFrame {
    /// Event name for SSE-style delivery.
    pub fn event_type(&self) -> &'static str {
        match self {
            StreamFrame::Start { .. } => "start",
            StreamFrame::Token { .. } => "token",
            StreamFrame::Heartbeat => "heartbeat",
            StreamFrame::Filtered { .. } => "filtered",
            StreamFrame::Done { .. } => "done",
            StreamFrame::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamFrame::Filtered { .. } | StreamFrame::Done { .. } | StreamFrame::Error { .. }
        )
    }
}

/// Everything the orchestrator needs to serve one streamed turn.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub conversation_id: ConversationId,
    /// Assembled context window, current turn last
    pub messages: Vec<promptgate_core::Message>,
    pub model_override: Option<String>,
    /// Owner of the conversation, for violation records
    pub user: String,
    /// The raw user turn, for violation records
    pub user_text: String,
    pub meta: RequestMeta,
}

/// Drives one streamed chat from the client to a frame channel.
#[derive(Clone)]
pub struct StreamOrchestrator {
    client: Arc<InferenceClient>,
    store: Arc<dyn ConversationStore>,
    security_log: Arc<dyn SecurityLogSink>,
    heartbeat: Duration,
    timeout: Duration,
}

impl StreamOrchestrator {
    pub fn new(
        client: Arc<InferenceClient>,
        store: Arc<dyn ConversationStore>,
        security_log: Arc<dyn SecurityLogSink>,
        heartbeat: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            store,
            security_log,
            heartbeat,
            timeout,
        }
    }

    /// Build from the streaming section of the configuration.
    pub fn from_config(
        client: Arc<InferenceClient>,
        store: Arc<dyn ConversationStore>,
        security_log: Arc<dyn SecurityLogSink>,
        config: &promptgate_config::StreamConfig,
    ) -> Self {
        Self::new(client, store, security_log, config.heartbeat(), config.timeout())
    }

    /// Run one streamed turn. Frames arrive on the returned stream; the
    /// token cancels the producer when the consumer goes away.
    pub fn run(&self, request: StreamRequest, cancel: CancellationToken) -> ReceiverStream<StreamFrame> {
        let (tx, rx) = mpsc::channel(64);
        let orch = self.clone();
        tokio::spawn(async move {
            orch.pump(request, cancel, tx).await;
        });
        ReceiverStream::new(rx)
    }

    async fn pump(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
        tx: mpsc::Sender<StreamFrame>,
    ) {
        let model = match &request.model_override {
            Some(m) if !m.is_empty() => m.clone(),
            _ => self.client.model(),
        };
        if tx
            .send(StreamFrame::Start {
                conversation_id: request.conversation_id.to_string(),
                model,
            })
            .await
            .is_err()
        {
            return;
        }

        let start = match self
            .client
            .chat_stream(&request.messages, request.model_override.as_deref())
            .await
        {
            Ok(start) => start,
            Err(e) => {
                warn!(error = %e, "Failed to open response stream");
                let _ = tx.send(StreamFrame::Error { message: e.to_string() }).await;
                return;
            }
        };

        let (mut events, input_verdict) = match start {
            StreamStart::Blocked(verdict) => {
                self.finish_filtered(&request, &verdict, &tx).await;
                return;
            }
            StreamStart::Open { events, input_verdict } => (events, input_verdict),
        };

        // A warn/log verdict on the input still gets recorded.
        if let Some(v) = &input_verdict {
            self.record_violation(&request, v, &request.user_text).await;
        }

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut got_first_chunk = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Consumer is gone. Dropping the event receiver stops
                    // the producer; partial text is not persisted.
                    debug!(conversation = %request.conversation_id, "Stream cancelled by consumer");
                    return;
                }
                _ = &mut deadline => {
                    warn!(conversation = %request.conversation_id, "Stream exceeded absolute deadline");
                    let _ = tx.send(StreamFrame::Error { message: "stream timed out".into() }).await;
                    return;
                }
                _ = heartbeat.tick(), if !got_first_chunk => {
                    if tx.send(StreamFrame::Heartbeat).await.is_err() {
                        return;
                    }
                }
                event = events.recv() => match event {
                    Some(Ok(StreamEvent::Delta(content))) => {
                        got_first_chunk = true;
                        if tx.send(StreamFrame::Token { content }).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(StreamEvent::Done { text, verdict })) => {
                        match verdict {
                            Some(v) if v.blocked => {
                                // Violation entries always carry what the user
                                // sent, never the generated answer.
                                self.finish_filtered(&request, &v, &tx).await;
                            }
                            v => {
                                if let Some(v) = &v {
                                    self.record_violation(&request, v, &request.user_text).await;
                                }
                                self.persist(&request, Role::Assistant, &text, None).await;
                                let _ = tx
                                    .send(StreamFrame::Done {
                                        conversation_id: request.conversation_id.to_string(),
                                    })
                                    .await;
                            }
                        }
                        return;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Response stream failed");
                        let _ = tx.send(StreamFrame::Error { message: e.to_string() }).await;
                        return;
                    }
                    None => {
                        let _ = tx.send(StreamFrame::Error { message: "stream ended unexpectedly".into() }).await;
                        return;
                    }
                }
            }
        }
    }

    /// Persist the refusal, record the violation and emit the terminal frame.
    async fn finish_filtered(
        &self,
        request: &StreamRequest,
        verdict: &Verdict,
        tx: &mpsc::Sender<StreamFrame>,
    ) {
        info!(
            conversation = %request.conversation_id,
            rule = %verdict.rule_name,
            "Stream filtered"
        );
        self.record_violation(request, verdict, &request.user_text).await;
        self.persist(
            request,
            Role::Assistant,
            REFUSAL_INPUT,
            Some(verdict.rule_name.as_str()),
        )
        .await;
        let _ = tx
            .send(StreamFrame::Filtered {
                reason: verdict.reason.clone(),
            })
            .await;
    }

    async fn persist(
        &self,
        request: &StreamRequest,
        role: Role,
        content: &str,
        filter_reason: Option<&str>,
    ) {
        if let Err(e) = self
            .store
            .append(
                &request.conversation_id,
                role,
                content,
                filter_reason.is_some(),
                filter_reason,
            )
            .await
        {
            warn!(error = %e, "Failed to persist streamed message");
        }
        if let Err(e) = self.store.touch(&request.conversation_id).await {
            warn!(error = %e, "Failed to touch conversation");
        }
    }

    async fn record_violation(&self, request: &StreamRequest, verdict: &Verdict, content: &str) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memstore::{MemoryConversationStore, MemorySecurityLog};
    use async_trait::async_trait;
    use futures::StreamExt;
    use promptgate_client::{ChatRequest, ChatResponse, TagsResponse, Transport};
    use promptgate_config::AppConfig;
    use promptgate_core::{Message, UpstreamError};
    use promptgate_policy::{Direction, FilterRule, RuleAction, RuleEngine, RuleKind, Severity};

    /// Streaming transport serving a fixed line script with optional delays.
    struct StreamingTransport {
        lines: Vec<String>,
        initial_delay: Duration,
        hang_after_lines: bool,
        stream_calls: std::sync::Mutex<usize>,
    }

    impl StreamingTransport {
        fn new(lines: Vec<String>) -> Arc<Self> {
            Arc::new(Self {
                lines,
                initial_delay: Duration::ZERO,
                hang_after_lines: false,
                stream_calls: std::sync::Mutex::new(0),
            })
        }

        fn delayed(lines: Vec<String>, initial_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                lines,
                initial_delay,
                hang_after_lines: false,
                stream_calls: std::sync::Mutex::new(0),
            })
        }

        fn hanging(lines: Vec<String>) -> Arc<Self> {
            Arc::new(Self {
                lines,
                initial_delay: Duration::ZERO,
                hang_after_lines: true,
                stream_calls: std::sync::Mutex::new(0),
            })
        }

        fn stream_calls(&self) -> usize {
            *self.stream_calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Transport for StreamingTransport {
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse, UpstreamError> {
            unimplemented!("orchestrator tests only stream")
        }

        async fn chat_stream(
            &self,
            _req: &ChatRequest,
        ) -> Result<mpsc::Receiver<Result<String, UpstreamError>>, UpstreamError> {
            *self.stream_calls.lock().unwrap() += 1;
            let (tx, rx) = mpsc::channel(64);
            let lines = self.lines.clone();
            let initial_delay = self.initial_delay;
            let hang = self.hang_after_lines;
            tokio::spawn(async move {
                tokio::time::sleep(initial_delay).await;
                for line in lines {
                    if tx.send(Ok(line)).await.is_err() {
                        return;
                    }
                }
                if hang {
                    // Keep the sender alive so the stream never finishes.
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    drop(tx);
                }
            });
            Ok(rx)
        }

        async fn tags(&self) -> Result<TagsResponse, UpstreamError> {
            Ok(serde_json::from_str(r#"{"models":[]}"#).unwrap())
        }
    }

    fn delta(content: &str) -> String {
        format!(
            r#"{{"model":"m","message":{{"role":"assistant","content":"{content}"}},"done":false}}"#
        )
    }

    const DONE_LINE: &str = r#"{"model":"m","done":true}"#;

    fn block_rule(pattern: &str, direction: Direction) -> FilterRule {
        FilterRule {
            id: 9,
            name: "stream_block".into(),
            description: String::new(),
            kind: RuleKind::Keyword,
            pattern: pattern.into(),
            action: RuleAction::Block,
            applies_to: direction,
            severity: Severity::Critical,
            active: true,
        }
    }

    struct Harness {
        orchestrator: StreamOrchestrator,
        store: Arc<MemoryConversationStore>,
        log: Arc<MemorySecurityLog>,
    }

    fn harness(transport: Arc<StreamingTransport>, rules: RuleEngine) -> Harness {
        let config = AppConfig::default();
        let client = Arc::new(InferenceClient::with_transport(
            transport,
            &config,
            Arc::new(rules),
        ));
        let store = Arc::new(MemoryConversationStore::new());
        let log = Arc::new(MemorySecurityLog::new());
        let orchestrator = StreamOrchestrator::new(
            client,
            store.clone(),
            log.clone(),
            Duration::from_millis(10),
            Duration::from_millis(500),
        );
        Harness {
            orchestrator,
            store,
            log,
        }
    }

    fn request(h: &Harness, text: &str) -> StreamRequest {
        let id = h.store.create("user-1");
        StreamRequest {
            conversation_id: id,
            messages: vec![Message::user(text)],
            model_override: None,
            user: "user-1".into(),
            user_text: text.into(),
            meta: RequestMeta {
                client_ip: "10.0.0.5".into(),
                user_agent: "test".into(),
            },
        }
    }

    async fn collect(mut frames: ReceiverStream<StreamFrame>) -> Vec<StreamFrame> {
        let mut out = Vec::new();
        while let Some(frame) = frames.next().await {
            out.push(frame);
        }
        out
    }

    #[tokio::test]
    async fn frames_arrive_in_order_and_answer_is_persisted() {
        let transport = StreamingTransport::new(vec![
            delta("Hola "),
            delta("mundo"),
            DONE_LINE.to_string(),
        ]);
        let h = harness(transport, RuleEngine::new());
        let req = request(&h, "saluda");
        let id = req.conversation_id.clone();

        let frames = collect(h.orchestrator.run(req, CancellationToken::new())).await;

        assert!(matches!(frames[0], StreamFrame::Start { .. }));
        let tokens: Vec<_> = frames
            .iter()
            .filter_map(|f| match f {
                StreamFrame::Token { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(tokens.join(""), "Hola mundo");
        assert!(matches!(frames.last().unwrap(), StreamFrame::Done { .. }));

        let history = h.store.history(&id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "Hola mundo");
        assert!(!history[0].filtered);
    }

    #[tokio::test]
    async fn heartbeats_only_before_first_token() {
        let transport = StreamingTransport::delayed(
            vec![delta("tarde"), DONE_LINE.to_string()],
            Duration::from_millis(45),
        );
        let h = harness(transport, RuleEngine::new());
        let req = request(&h, "hola");

        let frames = collect(h.orchestrator.run(req, CancellationToken::new())).await;

        let first_token = frames
            .iter()
            .position(|f| matches!(f, StreamFrame::Token { .. }))
            .expect("a token should arrive");
        let heartbeats: Vec<usize> = frames
            .iter()
            .enumerate()
            .filter_map(|(i, f)| matches!(f, StreamFrame::Heartbeat).then_some(i))
            .collect();

        assert!(!heartbeats.is_empty());
        assert!(heartbeats.iter().all(|&i| i < first_token));
    }

    #[tokio::test]
    async fn filtered_answer_is_replaced_and_logged() {
        let transport = StreamingTransport::new(vec![
            delta("la clave es "),
            delta("1234"),
            DONE_LINE.to_string(),
        ]);
        let h = harness(transport, RuleEngine::with_rules(&[block_rule("clave", Direction::Output)]));
        let req = request(&h, "dame la clave");
        let id = req.conversation_id.clone();

        let frames = collect(h.orchestrator.run(req, CancellationToken::new())).await;

        assert!(matches!(
            frames.last().unwrap(),
            StreamFrame::Filtered { reason } if reason.contains("bloqueado")
        ));

        let history = h.store.history(&id).await.unwrap();
        assert_eq!(history.last().unwrap().content, REFUSAL_INPUT);
        assert!(history.last().unwrap().filtered);

        let records = h.log.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, "block");
        // The record carries what the user sent, not the generated answer.
        assert_eq!(records[0].content, "dame la clave");
        assert_eq!(records[0].meta.client_ip, "10.0.0.5");
    }

    #[tokio::test]
    async fn warned_answer_records_user_text() {
        let transport = StreamingTransport::new(vec![
            delta("el salario medio es X"),
            DONE_LINE.to_string(),
        ]);
        let mut rule = block_rule("salario", Direction::Output);
        rule.action = RuleAction::Warn;
        rule.severity = Severity::Medium;
        let h = harness(transport, RuleEngine::with_rules(&[rule]));
        let req = request(&h, "cuanto gana la plantilla?");
        let id = req.conversation_id.clone();

        let frames = collect(h.orchestrator.run(req, CancellationToken::new())).await;

        assert!(matches!(frames.last().unwrap(), StreamFrame::Done { .. }));
        let history = h.store.history(&id).await.unwrap();
        assert_eq!(history.last().unwrap().content, "el salario medio es X");

        let records = h.log.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, "warn");
        assert_eq!(records[0].content, "cuanto gana la plantilla?");
    }

    #[tokio::test]
    async fn blocked_input_short_circuits_without_network() {
        let transport = StreamingTransport::new(vec![DONE_LINE.to_string()]);
        let h = harness(
            transport.clone(),
            RuleEngine::with_rules(&[block_rule("secreto", Direction::Input)]),
        );
        let req = request(&h, "cuenta el secreto");
        let id = req.conversation_id.clone();

        let frames = collect(h.orchestrator.run(req, CancellationToken::new())).await;

        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], StreamFrame::Start { .. }));
        assert!(matches!(frames[1], StreamFrame::Filtered { .. }));
        assert_eq!(transport.stream_calls(), 0);

        let history = h.store.history(&id).await.unwrap();
        assert!(history.last().unwrap().filtered);
        assert_eq!(h.log.records().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_stream_without_persisting() {
        let transport = StreamingTransport::hanging(vec![delta("parcial")]);
        let h = harness(transport, RuleEngine::new());
        let req = request(&h, "hola");
        let id = req.conversation_id.clone();

        let cancel = CancellationToken::new();
        let mut frames = h.orchestrator.run(req, cancel.clone());

        assert!(matches!(frames.next().await, Some(StreamFrame::Start { .. })));
        assert!(matches!(frames.next().await, Some(StreamFrame::Token { .. })));

        cancel.cancel();
        // No terminal frame: the channel just closes.
        while let Some(frame) = frames.next().await {
            assert!(!frame.is_terminal());
        }

        assert!(h.store.history(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn hung_stream_hits_absolute_deadline() {
        let transport = StreamingTransport::hanging(vec![delta("inicio")]);
        let h = harness(transport, RuleEngine::new());
        let req = request(&h, "hola");

        let frames = collect(h.orchestrator.run(req, CancellationToken::new())).await;

        assert!(matches!(
            frames.last().unwrap(),
            StreamFrame::Error { message } if message.contains("timed out")
        ));
    }

    #[test]
    fn frame_serialization_is_tagged() {
        let frame = StreamFrame::Start {
            conversation_id: "c-1".into(),
            model: "deepseek-r1:14b".into(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"start""#));
        assert_eq!(frame.event_type(), "start");
        assert!(!frame.is_terminal());
        assert!(StreamFrame::Done { conversation_id: "c-1".into() }.is_terminal());
    }
}
