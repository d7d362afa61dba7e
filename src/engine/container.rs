// Concierge Engine — Service Container
//
// Leaves-first construction of every service, in dependency order:
// store → embeddings → retrieval → registry/MCP → facade → LLM →
// orchestrator → conversation processor → voice backends. Configuration
// is taken by value and immutable afterwards; nothing here is a global.

use crate::atoms::error::EngineResult;
use crate::engine::config::Settings;
use crate::engine::conversation::ConversationProcessor;
use crate::engine::embedding::{Embedder, EmbeddingService, HttpEmbedder, MockEmbedder};
use crate::engine::exec::ToolExecutor;
use crate::engine::llm::LlmClient;
use crate::engine::mcp::{McpManager, ToolMapping};
use crate::engine::metrics::Metrics;
use crate::engine::orchestrator::Orchestrator;
use crate::engine::rag::Retrieval;
use crate::engine::store::Store;
use crate::engine::tools;
use crate::engine::tools::ToolRegistry;
use crate::engine::voice::{stt_backend, tts_backend, SttBackend, TtsBackend, VoiceDeps};
use log::info;
use std::sync::Arc;
use std::time::Duration;

pub struct ServiceContainer {
    pub settings: Settings,
    pub store: Arc<Store>,
    pub embeddings: Arc<EmbeddingService>,
    pub rag: Arc<Retrieval>,
    pub mcp: Arc<McpManager>,
    pub exec: Arc<ToolExecutor>,
    pub llm: Arc<LlmClient>,
    pub metrics: Arc<Metrics>,
    pub orchestrator: Arc<Orchestrator>,
    pub conversations: Arc<ConversationProcessor>,
    pub stt: Arc<dyn SttBackend>,
    pub tts: Arc<dyn TtsBackend>,
    mapping: ToolMapping,
}

impl ServiceContainer {
    pub fn build(settings: Settings) -> EngineResult<Arc<Self>> {
        let store = Arc::new(if settings.db_path.to_string_lossy() == ":memory:" {
            Store::in_memory(settings.embedding_dimensions)?
        } else {
            Store::open(&settings.db_path, settings.embedding_dimensions)?
        });

        let embedder: Arc<dyn Embedder> = if settings.mock_mode {
            Arc::new(MockEmbedder::new(settings.embedding_dimensions))
        } else {
            Arc::new(HttpEmbedder::new(&settings))
        };
        let embeddings = Arc::new(EmbeddingService::new(embedder, &settings));
        let rag = Arc::new(Retrieval::new(store.clone(), embeddings.clone()));

        let registry = Arc::new(build_registry(&settings, store.clone()));
        let mcp = Arc::new(McpManager::new(&settings));
        let mapping = ToolMapping::load(settings.mcp_mapping_path.as_deref());
        let metrics = Arc::new(Metrics::new());
        let exec = Arc::new(ToolExecutor::new(
            registry,
            mcp.clone(),
            mapping.clone(),
            metrics.clone(),
            settings.mock_mode,
        ));

        let llm = Arc::new(LlmClient::new(&settings));
        let orchestrator = Arc::new(Orchestrator::new(
            &settings,
            llm.clone(),
            rag.clone(),
            exec.clone(),
            store.clone(),
            metrics.clone(),
        ));
        let conversations = Arc::new(ConversationProcessor::new(
            store.clone(),
            orchestrator.clone(),
            exec.clone(),
        ));

        let stt = stt_backend(&settings);
        let tts = tts_backend(&settings);

        info!(
            "[engine] container ready (mock_mode={}, tools={})",
            settings.mock_mode,
            exec.registry().names().len()
        );

        Ok(Arc::new(ServiceContainer {
            settings,
            store,
            embeddings,
            rag,
            mcp,
            exec,
            llm,
            metrics,
            orchestrator,
            conversations,
            stt,
            tts,
            mapping,
        }))
    }

    /// Startup-time check that the static MCP mapping matches what the
    /// servers actually expose. Warnings only.
    pub async fn validate_mcp_mapping(&self) {
        if !self.mapping.is_empty() && !self.settings.mock_mode {
            self.mcp.validate_mapping(&self.mapping).await;
        }
    }

    pub fn voice_deps(&self) -> VoiceDeps {
        VoiceDeps {
            stt: self.stt.clone(),
            tts: self.tts.clone(),
            orchestrator: self.orchestrator.clone(),
            metrics: self.metrics.clone(),
            sample_rate: self.settings.voice_sample_rate,
            first_chunk_timeout: Duration::from_millis(self.settings.tts_first_chunk_timeout_ms),
            min_transcription_chars: self.settings.min_transcription_chars,
        }
    }
}

/// Explicit tool registration — a duplicate name panics here, at
/// construction, never at request time.
fn build_registry(settings: &Settings, store: Arc<Store>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(Arc::new(tools::agenda::ListAgendaEvents::new(store.clone())));
    registry.register(Arc::new(tools::agenda::ConfirmAgendaEvent::new(store.clone())));
    registry.register(Arc::new(tools::calendar::CreateCalendarEvent::new(store.clone())));

    let mail = tools::email::MailConfig::from_settings(settings);
    registry.register(Arc::new(tools::email::SearchEmails::new(mail.clone())));
    registry.register(Arc::new(tools::email::ReadEmail::new(mail.clone())));
    registry.register(Arc::new(tools::email::SendEmail::new(mail)));

    registry.register(Arc::new(tools::messenger::SendWhatsapp::new(settings)));

    let calendly = tools::calendly::CalendlyClient::new(&settings.calendly_api_key);
    registry.register(Arc::new(tools::calendly::ListCalendlyEvents::new(calendly.clone())));
    registry.register(Arc::new(tools::calendly::CreateCalendlyEvent::new(calendly.clone())));
    registry.register(Arc::new(tools::calendly::IngestCalendlyEvents::new(calendly, store)));

    registry.register(Arc::new(tools::web::ExtractUrls));
    registry.register(Arc::new(tools::web::ScrapeWebContent::new()));
    registry.register(Arc::new(tools::web::ScrapeNewsForEvents::new()));

    registry
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_builds_in_mock_mode() {
        let container = ServiceContainer::build(Settings::for_tests()).unwrap();
        let names = container.exec.registry().names();
        for expected in [
            "list_agenda_events",
            "confirm_agenda_event",
            "create_calendar_event",
            "search_emails",
            "read_email",
            "send_email",
            "send_whatsapp",
            "list_calendly_events",
            "create_calendly_event",
            "ingest_calendly_events",
            "extract_urls",
            "scrape_web_content",
            "scrape_news_for_events",
        ] {
            assert!(names.contains(&expected), "missing tool {}", expected);
        }
    }
}
