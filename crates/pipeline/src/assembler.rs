//! Context assembly: knowledge snippets, history and the current turn,
//! ordered into the message window sent upstream.
//!
//! The fixed operating prompt is not added here; the client prepends it to
//! every request, so the final window reads: operating prompt, knowledge,
//! history, current turn.

use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

use promptgate_core::{KnowledgeSnippet, Message, UrlTextExtractor};

const KNOWLEDGE_HEADER: &str = "--- CONOCIMIENTO EMPRESARIAL ---\n\
    Utiliza la siguiente informacion interna cuando sea relevante:\n\n";

/// Builds the message window for a chat request.
pub struct ContextAssembler {
    extractor: Arc<dyn UrlTextExtractor>,
    url_regex: Regex,
    url_extract_max_chars: usize,
}

impl ContextAssembler {
    pub fn new(extractor: Arc<dyn UrlTextExtractor>, url_extract_max_chars: usize) -> Self {
        Self {
            extractor,
            // Anything URL-shaped; trailing punctuation is trimmed per match.
            url_regex: Regex::new(r#"https?://[^\s<>"{}|\\^`\[\]]+"#)
                .expect("url regex is a constant"),
            url_extract_max_chars,
        }
    }

    /// Assemble the window: optional knowledge system message, the full
    /// prior history in order, then the current turn with any URL content
    /// appended in-memory. Stored history is never modified.
    pub async fn build(
        &self,
        history: &[Message],
        snippets: &[KnowledgeSnippet],
        current_text: &str,
    ) -> Vec<Message> {
        let mut window = Vec::with_capacity(history.len() + 2);

        if !snippets.is_empty() {
            window.push(Message::system(Self::knowledge_block(snippets)));
        }

        window.extend(history.iter().cloned());

        let enriched = self.enrich_with_url_content(current_text).await;
        window.push(Message::user(enriched));

        debug!(
            history = history.len(),
            snippets = snippets.len(),
            window = window.len(),
            "Assembled context window"
        );
        window
    }

    fn knowledge_block(snippets: &[KnowledgeSnippet]) -> String {
        let mut block = String::from(KNOWLEDGE_HEADER);
        for snippet in snippets {
            block.push_str(&format!(
                "## {} [{}]\n{}\n\n",
                snippet.title, snippet.category, snippet.content
            ));
        }
        block.trim_end().to_string()
    }

    /// Append extracted page text for every URL in the turn. Failures
    /// degrade to an inline note; the turn itself is always preserved.
    async fn enrich_with_url_content(&self, text: &str) -> String {
        let mut urls: Vec<&str> = self
            .url_regex
            .find_iter(text)
            .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?', ')']))
            .filter(|u| !u.is_empty())
            .collect();
        urls.dedup();

        if urls.is_empty() {
            return text.to_string();
        }

        let mut enriched = text.to_string();
        for url in urls {
            match self.extractor.extract(url, self.url_extract_max_chars).await {
                Ok(content) => {
                    enriched.push_str(&format!("\n\n[Contenido extraido de {url}]:\n{content}"));
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "URL extraction failed");
                    enriched.push_str(&format!("\n\n[Error extrayendo {url}: {e}]"));
                }
            }
        }
        enriched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use promptgate_core::{ExtractError, Role};
    use std::sync::Mutex;

    /// Extractor returning fixed text, recording every call.
    struct RecordingExtractor {
        text: String,
        calls: Mutex<Vec<(String, usize)>>,
    }

    impl RecordingExtractor {
        fn new(text: &str) -> Arc<Self> {
            Arc::new(Self {
                text: text.into(),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl UrlTextExtractor for RecordingExtractor {
        async fn extract(&self, url: &str, max_chars: usize) -> Result<String, ExtractError> {
            self.calls.lock().unwrap().push((url.to_string(), max_chars));
            Ok(self.text.chars().take(max_chars).collect())
        }
    }

    struct FailingExtractor;

    #[async_trait]
    impl UrlTextExtractor for FailingExtractor {
        async fn extract(&self, _url: &str, _max_chars: usize) -> Result<String, ExtractError> {
            Err(ExtractError::Fetch("connection timed out".into()))
        }
    }

    fn snippet() -> KnowledgeSnippet {
        KnowledgeSnippet::new("Horario", "RRHH", "La oficina abre a las 9:00.")
    }

    #[tokio::test]
    async fn window_orders_knowledge_history_then_turn() {
        let assembler = ContextAssembler::new(RecordingExtractor::new(""), 8000);
        let history = vec![Message::user("hola"), Message::assistant("buenos dias")];

        let window = assembler.build(&history, &[snippet()], "cual es el horario?").await;

        assert_eq!(window.len(), 4);
        assert_eq!(window[0].role, Role::System);
        assert!(window[0].content.contains("CONOCIMIENTO EMPRESARIAL"));
        assert!(window[0].content.contains("## Horario [RRHH]"));
        assert_eq!(window[1].content, "hola");
        assert_eq!(window[2].content, "buenos dias");
        assert_eq!(window[3].role, Role::User);
        assert_eq!(window[3].content, "cual es el horario?");
    }

    #[tokio::test]
    async fn no_knowledge_message_without_snippets() {
        let assembler = ContextAssembler::new(RecordingExtractor::new(""), 8000);
        let window = assembler.build(&[], &[], "hola").await;
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].role, Role::User);
    }

    #[tokio::test]
    async fn url_content_is_appended_to_current_turn_only() {
        let extractor = RecordingExtractor::new("Texto de la pagina.");
        let assembler = ContextAssembler::new(extractor.clone(), 8000);
        let history = vec![Message::user("mira https://old.example.com antes")];

        let window = assembler
            .build(&history, &[], "resume https://example.com/doc.")
            .await;

        // History is passed through untouched, URLs included.
        assert_eq!(window[0].content, "mira https://old.example.com antes");
        assert!(window[1].content.starts_with("resume https://example.com/doc."));
        assert!(window[1].content.contains("[Contenido extraido de https://example.com/doc]"));
        assert!(window[1].content.contains("Texto de la pagina."));

        let calls = extractor.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], ("https://example.com/doc".to_string(), 8000));
    }

    #[tokio::test]
    async fn extraction_failure_degrades_to_note() {
        let assembler = ContextAssembler::new(Arc::new(FailingExtractor), 8000);
        let window = assembler.build(&[], &[], "lee https://example.com/x").await;

        assert!(window[0].content.contains("[Error extrayendo https://example.com/x:"));
        assert!(window[0].content.starts_with("lee https://example.com/x"));
    }

    #[tokio::test]
    async fn extraction_respects_char_budget() {
        let extractor = RecordingExtractor::new(&"a".repeat(500));
        let assembler = ContextAssembler::new(extractor.clone(), 100);

        let window = assembler.build(&[], &[], "https://example.com").await;
        let appended = window[0].content.split(":\n").last().unwrap();
        assert_eq!(appended.chars().count(), 100);
    }
}
