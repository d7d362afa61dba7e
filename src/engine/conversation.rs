// Concierge Engine — Conversation Processor
//
// Webhook-driven ingest of chat messages plus the batch re-scan path.
// Persistence is idempotent on message_sid; analysis serialises per
// conversation so two deliveries for the same contact never race. The
// agent sees the last N messages of the conversation as chat history;
// when it does not create an event itself, a deterministic extractor
// (time-expression parser + title heuristics) proposes one.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{ConversationMessage, EventStatus, Message};
use crate::engine::exec::ToolExecutor;
use crate::engine::orchestrator::{AgentRequest, Orchestrator};
use crate::engine::store::Store;
use crate::engine::timeparse;
use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use log::{info, warn};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Messages considered conversational filler when picking an event title.
const GREETING_WORDS: &[&str] =
    &["hola", "buenas", "buenos días", "buenos dias", "hello", "hi", "gracias", "ok", "vale"];

const CONTEXT_LIMIT: usize = 10;
const REPLY_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, Default)]
pub struct ProcessSummary {
    pub event_id: Option<i64>,
    pub event_extracted: bool,
    pub reply_sent: bool,
    pub agent_text: String,
}

pub struct ConversationProcessor {
    store: Arc<Store>,
    orchestrator: Arc<Orchestrator>,
    exec: Arc<ToolExecutor>,
    /// Per-conversation analysis locks, created on demand.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConversationProcessor {
    pub fn new(store: Arc<Store>, orchestrator: Arc<Orchestrator>, exec: Arc<ToolExecutor>) -> Self {
        ConversationProcessor { store, orchestrator, exec, locks: Mutex::new(HashMap::new()) }
    }

    /// Persist an inbound message. Returns false for a duplicate delivery
    /// (silent success — the provider gets its 200 either way).
    pub fn ingest(
        &self,
        message_sid: &str,
        from_number: &str,
        to_number: &str,
        body: &str,
        received_at: Option<&str>,
    ) -> EngineResult<bool> {
        let received = received_at
            .map(str::to_string)
            .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
        let inserted = self.store.insert_message(
            message_sid,
            from_number, // conversation keyed on the sender identity
            from_number,
            to_number,
            body,
            &received,
        )?;
        if inserted {
            info!("[conversation] stored {} from {}", message_sid, from_number);
        } else {
            info!("[conversation] duplicate {} ignored", message_sid);
        }
        Ok(inserted)
    }

    async fn conversation_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(conversation_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Analyse the conversation around one triggering message: run the
    /// agent with the conversation tail as history, link or extract an
    /// event, mark the tail processed, and reply over the messenger.
    pub async fn process_message(&self, message_sid: &str) -> EngineResult<ProcessSummary> {
        let trigger = self
            .store
            .get_message(message_sid)?
            .ok_or_else(|| EngineError::application("conversation", format!("unknown message {}", message_sid)))?;

        let lock = self.conversation_lock(&trigger.conversation_id).await;
        let _guard = lock.lock().await;

        let tail = self.store.conversation_tail(&trigger.conversation_id, CONTEXT_LIMIT)?;

        // History = everything before the trigger, as user turns.
        let chat_history: Vec<Message> = tail
            .iter()
            .filter(|m| m.message_sid != trigger.message_sid)
            .map(|m| Message::user(m.body.clone()))
            .collect();

        let outcome = self
            .orchestrator
            .run(
                AgentRequest {
                    query: trigger.body.clone(),
                    chat_history,
                    top_k: None,
                },
                None,
                None,
            )
            .await;

        // Did the agent already create a calendar event?
        let mut event_id: Option<i64> = outcome
            .tool_results
            .iter()
            .find(|tr| tr.tool_name == "create_calendar_event" && tr.success)
            .and_then(|tr| tr.result.as_ref())
            .and_then(|r| r["event_id"].as_i64());

        // Deterministic extraction over the tail when it did not.
        if event_id.is_none() {
            event_id = self.extract_event_from_tail(&tail)?;
        }

        let event_extracted = event_id.is_some();
        for msg in &tail {
            let is_trigger = msg.message_sid == trigger.message_sid;
            self.store.mark_message_processed(
                &msg.message_sid,
                is_trigger && event_extracted,
                if is_trigger { event_id } else { None },
            )?;
        }

        // Reply through the messenger tool.
        let reply = if outcome.text.is_empty() {
            "Recibido. ¿En qué puedo ayudarte?".to_string()
        } else {
            crate::atoms::types::truncate_utf8(&outcome.text, REPLY_MAX_CHARS)
        };
        let send = self
            .exec
            .execute("send_whatsapp", &json!({ "to": trigger.from_number, "body": reply }))
            .await;
        if !send.success {
            warn!(
                "[conversation] reply to {} failed: {:?}",
                trigger.from_number, send.error_message
            );
        }

        Ok(ProcessSummary {
            event_id,
            event_extracted,
            reply_sent: send.success,
            agent_text: outcome.text,
        })
    }

    /// Deterministic fallback: find a time window in the newest messages
    /// and a title in the newest non-window, non-greeting message.
    fn extract_event_from_tail(&self, tail: &[ConversationMessage]) -> EngineResult<Option<i64>> {
        let mut window = None;
        let mut confidence = 0.5;

        // Newest message with a parseable window wins; its received_at is
        // the anchor, so relative words resolve against when it was sent.
        for msg in tail.iter().rev() {
            let anchor = parse_received_at(&msg.received_at);
            if let Some((w, c)) = timeparse::event_signal(&msg.body, anchor) {
                window = Some(w);
                confidence = c;
                break;
            }
        }
        let Some(window) = window else {
            return Ok(None);
        };

        // Title: newest message that is neither the window carrier shape
        // nor a greeting.
        let title = tail
            .iter()
            .rev()
            .filter(|m| {
                let anchor = parse_received_at(&m.received_at);
                timeparse::parse_window(&m.body, anchor).is_none() && !is_greeting(&m.body)
            })
            .map(|m| timeparse::extract_title(&m.body))
            .next()
            .unwrap_or_else(|| "Evento".to_string());

        let start = window.start.to_rfc3339_opts(SecondsFormat::Secs, true);
        let end = window.end.to_rfc3339_opts(SecondsFormat::Secs, true);
        let id = self.store.insert_extracted_event(
            "whatsapp",
            &title,
            Some(&start),
            Some(&end),
            &window.start.timezone().to_string(),
            None,
            &[],
            EventStatus::Proposed,
            confidence,
        )?;
        info!("[conversation] extracted event {} '{}' at {}", id, title, start);
        Ok(Some(id))
    }

    /// Batch re-scan: run the analysis over every conversation that has
    /// unprocessed messages (or every conversation when `all` is set),
    /// using the newest message of each as the trigger.
    pub async fn reprocess(&self, all: bool) -> EngineResult<Vec<(String, ProcessSummary)>> {
        let conversations = if all {
            self.store.all_conversations()?
        } else {
            self.store.conversations_with_unprocessed()?
        };

        let mut results = Vec::new();
        for conversation_id in conversations {
            let tail = self.store.conversation_tail(&conversation_id, CONTEXT_LIMIT)?;
            let Some(newest) = tail.last() else { continue };
            match self.process_message(&newest.message_sid).await {
                Ok(summary) => results.push((conversation_id, summary)),
                Err(e) => warn!("[conversation] reprocess {} failed: {}", conversation_id, e),
            }
        }
        Ok(results)
    }
}

fn parse_received_at(received_at: &str) -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339(received_at)
        .unwrap_or_else(|_| Utc::now().fixed_offset())
}

fn is_greeting(body: &str) -> bool {
    let trimmed = body.trim().to_lowercase();
    GREETING_WORDS.iter().any(|g| trimmed == *g || trimmed.starts_with(&format!("{} ", g)))
        || trimmed.chars().count() < 3
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::Settings;
    use crate::engine::embedding::{EmbeddingService, MockEmbedder};
    use crate::engine::llm::LlmClient;
    use crate::engine::mcp::{McpManager, ToolMapping};
    use crate::engine::metrics::Metrics;
    use crate::engine::rag::Retrieval;
    use crate::engine::tools::ToolRegistry;

    fn processor() -> (Arc<Store>, ConversationProcessor) {
        let settings = Settings::for_tests();
        let store = Arc::new(Store::in_memory(settings.embedding_dimensions).unwrap());
        let embeddings = Arc::new(EmbeddingService::new(
            Arc::new(MockEmbedder::new(settings.embedding_dimensions)),
            &settings,
        ));
        let rag = Arc::new(Retrieval::new(store.clone(), embeddings));
        let metrics = Arc::new(Metrics::new());
        let exec = Arc::new(ToolExecutor::new(
            Arc::new(ToolRegistry::new()),
            Arc::new(McpManager::new(&settings)),
            ToolMapping::empty(),
            metrics.clone(),
            true, // mock mode: send_whatsapp succeeds deterministically
        ));
        let llm = Arc::new(LlmClient::new(&settings));
        let orchestrator = Arc::new(Orchestrator::new(
            &settings,
            llm,
            rag,
            exec.clone(),
            store.clone(),
            metrics,
        ));
        let proc = ConversationProcessor::new(store.clone(), orchestrator, exec);
        (store, proc)
    }

    #[test]
    fn test_ingest_idempotent() {
        let (_, proc) = processor();
        assert!(proc.ingest("SM1", "+34600", "+1555", "hola", None).unwrap());
        assert!(!proc.ingest("SM1", "+34600", "+1555", "hola", None).unwrap());
    }

    #[test]
    fn test_extract_event_across_messages() {
        let (store, proc) = processor();
        let msgs = [
            ("SM1", "Hola", "2025-12-15T09:00:00+01:00"),
            ("SM2", "Quiero agendar una reunión", "2025-12-15T09:01:00+01:00"),
            ("SM3", "El viernes a las 10:00", "2025-12-15T09:02:00+01:00"),
            ("SM4", "Revisión del proyecto", "2025-12-15T09:03:00+01:00"),
        ];
        for (sid, body, at) in msgs {
            store.insert_message(sid, "+34600", "+34600", "+1555", body, at).unwrap();
        }

        let tail = store.conversation_tail("+34600", 10).unwrap();
        let event_id = proc.extract_event_from_tail(&tail).unwrap().unwrap();
        let event = store.get_extracted_event(event_id).unwrap().unwrap();

        assert_eq!(event.title, "Revisión del proyecto");
        // Monday the 15th → Friday the 19th at 10:00 local
        assert_eq!(event.start_at.as_deref(), Some("2025-12-19T10:00:00+01:00"));
        assert_eq!(event.status, EventStatus::Proposed);
    }

    #[test]
    fn test_no_window_means_no_event() {
        let (store, proc) = processor();
        store
            .insert_message("SM1", "+34600", "+34600", "+1555", "Hola", "2025-12-15T09:00:00+01:00")
            .unwrap();
        let tail = store.conversation_tail("+34600", 10).unwrap();
        assert!(proc.extract_event_from_tail(&tail).unwrap().is_none());
    }

    #[test]
    fn test_greeting_detection() {
        assert!(is_greeting("Hola"));
        assert!(is_greeting("ok"));
        assert!(!is_greeting("Revisión del proyecto"));
    }
}
