// Concierge Engine — Orchestrator
//
// The stage graph driving every request:
//   entry → intent → rag → conflict_check → policy → agent → plan ⇄ tool
//         → response → end
// Stages 2–5 are strictly sequential. Only the plan/tool segment loops,
// bounded by max_iterations; tool calls within one iteration run
// concurrently and the iteration is a barrier. A policy refusal
// short-circuits straight to response.
//
// Module layout:
//   intent.rs   — two-tier intent routing
//   conflict.rs — overlap detection + alternative slot
//   policy.rs   — hard rules (working hours, destructive, lookahead)
//   humanize.rs — deterministic response cleanup

pub mod conflict;
pub mod humanize;
pub mod intent;
pub mod policy;

use crate::atoms::error::{EngineError, EngineResult, ErrorKind};
use crate::atoms::types::*;
use crate::engine::config::Settings;
use crate::engine::exec::ToolExecutor;
use crate::engine::llm::LlmClient;
use crate::engine::metrics::Metrics;
use crate::engine::rag::Retrieval;
use crate::engine::store::Store;
use crate::engine::timeparse;
use chrono::{DateTime, FixedOffset, Local};
use conflict::ConflictReport;
use log::{info, warn};
use policy::{PolicyConfig, PolicyDecision};
use regex::Regex;
use serde_json::json;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// Structured stage events flow through this sink to the caller (the
/// voice session forwards them verbatim to the client).
pub type LogSink = mpsc::UnboundedSender<AgentLogEvent>;

/// Cooperative cancellation: flips to true on user interrupt.
pub type CancelSignal = watch::Receiver<bool>;

#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    pub query: String,
    pub chat_history: Vec<Message>,
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentOutcome {
    pub text: String,
    pub citations: Vec<String>,
    pub tool_calls: Vec<serde_json::Value>,
    pub tool_results: Vec<ToolResult>,
    pub intent: Intent,
    pub agent_code: AgentCode,
    pub iterations: u32,
    pub stage_timings_ms: Vec<(String, f64)>,
}

/// Transient per-request state. Owned by one request task; never shared.
struct AgentState {
    query: String,
    messages: Vec<Message>,
    intent: Intent,
    agent_code: AgentCode,
    rag_context: String,
    citations: Vec<String>,
    retrieved_ids: Vec<String>,
    conflict: ConflictReport,
    tool_calls: Vec<serde_json::Value>,
    tool_results: Vec<ToolResult>,
    iteration_count: u32,
    stage_timings_ms: Vec<(String, f64)>,
}

pub struct Orchestrator {
    llm: Arc<LlmClient>,
    rag: Arc<Retrieval>,
    exec: Arc<ToolExecutor>,
    store: Arc<Store>,
    metrics: Arc<Metrics>,
    max_iterations: u32,
    default_top_k: usize,
    min_similarity: f64,
    request_deadline: Duration,
    policy: PolicyConfig,
    dev_mode: bool,
    mock_mode: bool,
}

impl Orchestrator {
    pub fn new(
        settings: &Settings,
        llm: Arc<LlmClient>,
        rag: Arc<Retrieval>,
        exec: Arc<ToolExecutor>,
        store: Arc<Store>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Orchestrator {
            llm,
            rag,
            exec,
            store,
            metrics,
            max_iterations: settings.max_iterations,
            default_top_k: settings.default_top_k,
            min_similarity: settings.min_similarity,
            request_deadline: Duration::from_secs(settings.request_deadline_secs),
            policy: PolicyConfig {
                working_hours_start: settings.working_hours_start,
                working_hours_end: settings.working_hours_end,
                max_lookahead_days: settings.max_lookahead_days,
            },
            dev_mode: settings.dev_mode,
            mock_mode: settings.mock_mode,
        }
    }

    /// Run the full graph for one request. The overall deadline cancels
    /// everything still running; an interrupt on `cancel` does the same
    /// from the user side.
    pub async fn run(
        &self,
        request: AgentRequest,
        log: Option<LogSink>,
        cancel: Option<CancelSignal>,
    ) -> AgentOutcome {
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.request_deadline,
            self.run_stages(request, log, cancel),
        )
        .await;

        match outcome {
            Ok(Ok(outcome)) => {
                self.metrics.record_request(true);
                outcome
            }
            Ok(Err(e)) if e.kind() == ErrorKind::Cancelled => {
                info!("[agent] request cancelled after {:?}", started.elapsed());
                self.metrics.record_request(false);
                AgentOutcome::failure("Petición cancelada.", e)
            }
            Ok(Err(e)) => {
                warn!("[agent] request failed: {}", e);
                self.metrics.record_request(false);
                AgentOutcome::failure(
                    "Lo siento, no he podido completar la petición. Inténtalo de nuevo.",
                    e,
                )
            }
            Err(_) => {
                warn!("[agent] request deadline ({:?}) exceeded", self.request_deadline);
                self.metrics.record_request(false);
                AgentOutcome::failure(
                    "La petición ha tardado demasiado y la he cancelado.",
                    EngineError::Cancelled("deadline".into()),
                )
            }
        }
    }

    async fn run_stages(
        &self,
        request: AgentRequest,
        log: Option<LogSink>,
        mut cancel: Option<CancelSignal>,
    ) -> EngineResult<AgentOutcome> {
        let emit = |event: &str, data: serde_json::Value| {
            if let Some(sink) = &log {
                let _ = sink.send(AgentLogEvent::new(event, data));
            }
        };
        let now: DateTime<FixedOffset> = Local::now().fixed_offset();

        // ── entry ──────────────────────────────────────────────────────
        let mut state = AgentState {
            query: request.query.clone(),
            messages: Vec::new(),
            intent: Intent::General,
            agent_code: AgentCode::Gen,
            rag_context: String::new(),
            citations: Vec::new(),
            retrieved_ids: Vec::new(),
            conflict: ConflictReport::default(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            iteration_count: 0,
            stage_timings_ms: Vec::new(),
        };

        // ── intent ─────────────────────────────────────────────────────
        let t = Instant::now();
        state.intent = intent::classify(&state.query, &self.llm, true).await;
        state.agent_code = state.intent.agent_code();
        self.record_stage(&mut state, "intent", t);

        // ── rag ────────────────────────────────────────────────────────
        let t = Instant::now();
        let top_k = request.top_k.unwrap_or(self.default_top_k);
        emit("agent_rag_started", json!({ "top_k": top_k, "agent_code": state.agent_code.as_str() }));
        let chunks = check_cancel(&mut cancel)?
            .then_run(self.rag.retrieve(&state.query, top_k, self.min_similarity, None))
            .await?;
        let chunks = chunks.unwrap_or_default();
        let (context, citations) = Retrieval::assemble_context(&chunks);
        state.retrieved_ids = citations.clone();
        state.citations = citations;
        state.rag_context = context;
        emit(
            "agent_rag_completed",
            json!({
                "chunks_found": chunks.len(),
                "chunk_ids": state.retrieved_ids,
                "duration_ms": t.elapsed().as_millis() as u64,
            }),
        );
        self.record_stage(&mut state, "rag", t);

        // ── conflict_check ─────────────────────────────────────────────
        let t = Instant::now();
        let window = timeparse::parse_window(&state.query, now);
        if matches!(state.intent, Intent::Calendar | Intent::Scheduling) {
            if let Some(window) = &window {
                state.conflict = conflict::check(&self.store, window)?;
            }
        }
        self.record_stage(&mut state, "conflict_check", t);

        // ── policy ─────────────────────────────────────────────────────
        let t = Instant::now();
        let decision =
            policy::evaluate(&state.query, state.intent, window.as_ref(), now, &self.policy);
        self.record_stage(&mut state, "policy", t);
        if let PolicyDecision::Refused { reason } = decision {
            info!("[agent] policy refusal: {}", reason);
            self.store.audit("policy_refusal", "agent", json!({ "query": state.query }))?;
            return Ok(self.respond(state, reason, &emit));
        }

        // A booking request colliding with an existing event resolves
        // without tools: report the conflict and the free slot instead.
        if state.intent == Intent::Scheduling && state.conflict.has_conflicts() {
            let text = conflict_reply(&state.conflict);
            return Ok(self.respond(state, text, &emit));
        }

        // ── agent (specialist dispatch) ────────────────────────────────
        let tool_names = tools_for_agent(state.agent_code, &self.exec.registry().names());
        let tools = self.exec.registry().definitions_for(&tool_names);
        let system_prompt = self.build_system_prompt(&state, now);
        state.messages.push(Message::system(system_prompt));
        state.messages.extend(request.chat_history);
        state.messages.push(Message::user(state.query.clone()));

        // ── plan ⇄ tool loop ───────────────────────────────────────────
        let mut final_text: Option<String> = None;
        while state.iteration_count < self.max_iterations {
            state.iteration_count += 1;
            emit(
                "agent_iteration_started",
                json!({
                    "iteration": state.iteration_count,
                    "max_iterations": self.max_iterations,
                    "agent_code": state.agent_code.as_str(),
                }),
            );
            emit(
                "agent_tools_available",
                json!({
                    "tool_count": tools.len(),
                    "tools": tools.iter().map(|t| t.function.name.clone()).collect::<Vec<_>>(),
                }),
            );

            let t = Instant::now();
            let outcome = if self.mock_mode {
                mock_plan(&state)
            } else {
                check_cancel(&mut cancel)?
                    .then_run(self.llm.chat(&state.messages, &tools))
                    .await??
            };
            self.record_stage(&mut state, "plan", t);

            emit(
                "agent_llm_reasoning",
                json!({
                    "iteration": state.iteration_count,
                    "has_tool_calls": !outcome.tool_calls.is_empty(),
                    "content_preview": outcome
                        .content
                        .as_deref()
                        .map(|c| truncate_utf8(c, 200)),
                }),
            );

            if outcome.tool_calls.is_empty() {
                final_text = outcome.content;
                break;
            }

            // ── tool: concurrent within the iteration, barrier after ───
            let t = Instant::now();
            state.messages.push(Message::assistant_tool_calls(outcome.tool_calls.clone()));

            let mut futures = Vec::new();
            for call in &outcome.tool_calls {
                let name = call.function.name.clone();
                let args: serde_json::Value =
                    serde_json::from_str(&call.function.arguments).unwrap_or_else(|e| {
                        warn!("[agent] malformed args for '{}': {}", name, e);
                        json!({})
                    });
                emit(
                    "agent_tool_executing",
                    json!({
                        "iteration": state.iteration_count,
                        "tool_name": name.clone(),
                        "args_preview": truncate_utf8(&args.to_string(), 200),
                    }),
                );
                state.tool_calls.push(json!({ "tool_name": name.clone(), "arguments": args.clone() }));
                let exec = self.exec.clone();
                let call_id = call.id.clone();
                futures.push(async move {
                    let result = exec.execute(&name, &args).await;
                    (call_id, name, result)
                });
            }

            let results = check_cancel(&mut cancel)?
                .then_run(futures::future::join_all(futures))
                .await?;

            for (call_id, name, result) in results {
                emit(
                    "agent_tool_completed",
                    json!({
                        "iteration": state.iteration_count,
                        "tool_name": name,
                        "success": result.success,
                        "via": result.via,
                        "duration_ms": result.duration_ms,
                        "error": result.error_message,
                    }),
                );
                let body = serde_json::to_string(&result)
                    .unwrap_or_else(|_| "{\"success\":false}".to_string());
                state.messages.push(Message::tool_result(&call_id, &name, body));
                state.tool_results.push(result);
            }
            self.record_stage(&mut state, "tool", t);
        }

        if final_text.is_none() && state.iteration_count >= self.max_iterations {
            warn!("[agent] max iterations ({}) reached", self.max_iterations);
            final_text = Some(
                "He agotado los pasos disponibles antes de poder cerrar la respuesta. \
                 Esto es lo que he conseguido hasta ahora."
                    .to_string(),
            );
        }

        let text = final_text.unwrap_or_default();
        Ok(self.respond(state, text, &emit))
    }

    /// response + end stages: humanise, extract citations, emit.
    fn respond(
        &self,
        mut state: AgentState,
        raw_text: String,
        emit: &dyn Fn(&str, serde_json::Value),
    ) -> AgentOutcome {
        let t = Instant::now();
        let text = humanize::humanise(&raw_text, &state.tool_results, &state.citations);

        let cited = extract_citations(&text, &state.retrieved_ids);
        if !cited.is_empty() {
            state.citations = cited;
        }
        self.record_stage(&mut state, "response", t);

        emit(
            "agent_response_ready",
            json!({
                "text": text,
                "citations_count": state.citations.len(),
                "tools_used": state
                    .tool_calls
                    .iter()
                    .map(|c| c["tool_name"].clone())
                    .collect::<Vec<_>>(),
                "iterations": state.iteration_count,
            }),
        );

        AgentOutcome {
            text,
            citations: state.citations,
            tool_calls: state.tool_calls,
            tool_results: state.tool_results,
            intent: state.intent,
            agent_code: state.agent_code,
            iterations: state.iteration_count,
            stage_timings_ms: state.stage_timings_ms,
        }
    }

    fn build_system_prompt(&self, state: &AgentState, now: DateTime<FixedOffset>) -> String {
        let context = if state.rag_context.is_empty() {
            "No hay contexto relevante en la base de conocimiento.".to_string()
        } else {
            state.rag_context.clone()
        };
        let conflict_note = if state.conflict.has_conflicts() {
            let titles: Vec<&str> =
                state.conflict.conflicts.iter().map(|c| c.title.as_str()).collect();
            format!(
                "\n## Conflictos de agenda detectados\nLa franja mencionada choca con: {}. \
                 Señálalo antes de proponer nada.\n",
                titles.join(", ")
            )
        } else {
            String::new()
        };
        let dev_note = if self.dev_mode {
            "\n(Modo desarrollador: incluye detalles técnicos si ayudan.)"
        } else {
            ""
        };

        format!(
            "Eres un asistente personal de coordinación con acceso a una base de \
             conocimiento y a herramientas de acción.\n\n\
             ## Fecha y hora actuales\n{now}\n\
             Usa siempre fechas futuras al agendar.\n\n\
             ## Contexto recuperado\n{context}\n{conflict}\n\
             ## Instrucciones\n\
             - Para preguntas informativas usa el contexto y cita con [chunk_id].\n\
             - Para acciones usa las herramientas disponibles; si faltan datos \
             (fecha, hora, correo), pídelos.\n\
             - Tras ejecutar una herramienta confirma la acción con los detalles \
             relevantes.\n\
             - Sé conciso y profesional.{dev}",
            now = now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            context = context,
            conflict = conflict_note,
            dev = dev_note,
        )
    }

    fn record_stage(&self, state: &mut AgentState, stage: &str, started: Instant) {
        let ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics.record_stage(stage, ms);
        state.stage_timings_ms.push((stage.to_string(), (ms * 100.0).round() / 100.0));
    }
}

impl AgentOutcome {
    fn failure(message: &str, error: EngineError) -> Self {
        info!("[agent] failure outcome: {}", error);
        AgentOutcome {
            text: message.to_string(),
            citations: vec![],
            tool_calls: vec![],
            tool_results: vec![],
            intent: Intent::General,
            agent_code: AgentCode::Gen,
            iterations: 0,
            stage_timings_ms: vec![("error".into(), 0.0)],
        }
    }
}

/// Deterministic plan used when the engine runs without a live model:
/// one informative tool pass for agenda intents, then finish. The
/// humaniser surfaces the tool's formatted body as the reply.
fn mock_plan(state: &AgentState) -> ChatOutcome {
    if state.iteration_count == 1 && matches!(state.agent_code, AgentCode::Cal | AgentCode::Sched) {
        return ChatOutcome {
            content: None,
            tool_calls: vec![ToolCall {
                id: "call_plan_1".into(),
                call_type: "function".into(),
                function: FunctionCall {
                    name: "list_agenda_events".into(),
                    arguments: "{\"limit\":10}".into(),
                },
            }],
        };
    }
    ChatOutcome {
        content: Some("He revisado tu petición.".to_string()),
        tool_calls: vec![],
    }
}

/// User-facing conflict reply with the proposed alternative slot.
fn conflict_reply(report: &ConflictReport) -> String {
    let first = &report.conflicts[0];
    let mut text = format!(
        "Esa franja choca con \"{}\" ({} – {}).",
        first.title, first.start_at, first.end_at
    );
    if let Some(alt) = &report.suggested_alternative {
        text.push_str(&format!(" Te propongo {} como alternativa, ¿te encaja?", alt));
    } else {
        text.push_str(" ¿Quieres proponer otra hora?");
    }
    text
}

/// Tool subsets per specialist. Tools outside the set are withheld from
/// the model entirely.
fn tools_for_agent(agent_code: AgentCode, all: &[&'static str]) -> Vec<&'static str> {
    match agent_code {
        AgentCode::Cal => vec![
            "list_agenda_events",
            "confirm_agenda_event",
            "create_calendar_event",
            "extract_urls",
            "scrape_web_content",
        ],
        AgentCode::Email => vec![
            "search_emails",
            "read_email",
            "send_email",
            "extract_urls",
            "scrape_web_content",
        ],
        AgentCode::Sched => vec![
            "create_calendly_event",
            "list_calendly_events",
            "ingest_calendly_events",
            "create_calendar_event",
            "list_agenda_events",
            "extract_urls",
        ],
        AgentCode::Comms => vec!["send_whatsapp", "send_email", "extract_urls"],
        AgentCode::Gen => all.to_vec(),
    }
}

fn citation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([^\[\]]+)\]").expect("citation regex"))
}

/// `[chunk_id]` citations present in the text, filtered to ids we
/// actually retrieved, deduplicated in first-appearance order.
fn extract_citations(text: &str, retrieved_ids: &[String]) -> Vec<String> {
    let mut cited = Vec::new();
    for caps in citation_regex().captures_iter(text) {
        let id = caps[1].to_string();
        if retrieved_ids.contains(&id) && !cited.contains(&id) {
            cited.push(id);
        }
    }
    cited
}

// ── Cancellation plumbing ──────────────────────────────────────────────────

struct CancelGuard<'a> {
    cancel: &'a mut Option<CancelSignal>,
}

impl<'a> CancelGuard<'a> {
    /// Race the future against the cancel signal.
    async fn then_run<T>(
        self,
        fut: impl std::future::Future<Output = T>,
    ) -> EngineResult<T> {
        match self.cancel {
            Some(rx) => {
                let mut rx = rx.clone();
                tokio::select! {
                    out = fut => Ok(out),
                    _ = wait_cancelled(&mut rx) => {
                        Err(EngineError::Cancelled("interrupted by user".into()))
                    }
                }
            }
            None => Ok(fut.await),
        }
    }
}

/// Fail fast if already cancelled, else hand back a guard to race with.
fn check_cancel(cancel: &mut Option<CancelSignal>) -> EngineResult<CancelGuard<'_>> {
    if let Some(rx) = cancel {
        if *rx.borrow() {
            return Err(EngineError::Cancelled("interrupted by user".into()));
        }
    }
    Ok(CancelGuard { cancel })
}

async fn wait_cancelled(rx: &mut CancelSignal) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // sender dropped: never cancels
            std::future::pending::<()>().await;
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::EventStatus;
    use crate::engine::embedding::{EmbeddingService, MockEmbedder};
    use crate::engine::mcp::{McpManager, ToolMapping};
    use crate::engine::tools::agenda::ListAgendaEvents;
    use crate::engine::tools::calendar::CreateCalendarEvent;
    use crate::engine::tools::ToolRegistry;

    fn pipeline() -> (Arc<Store>, Orchestrator) {
        let settings = Settings::for_tests();
        let store = Arc::new(Store::in_memory(settings.embedding_dimensions).unwrap());
        let embeddings = Arc::new(EmbeddingService::new(
            Arc::new(MockEmbedder::new(settings.embedding_dimensions)),
            &settings,
        ));
        let rag = Arc::new(Retrieval::new(store.clone(), embeddings));
        let metrics = Arc::new(Metrics::new());
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(ListAgendaEvents::new(store.clone())));
        registry.register(Arc::new(CreateCalendarEvent::new(store.clone())));
        let exec = Arc::new(ToolExecutor::new(
            Arc::new(registry),
            Arc::new(McpManager::new(&settings)),
            ToolMapping::empty(),
            metrics.clone(),
            false, // local registry: the mock planner still drives the loop
        ));
        let llm = Arc::new(LlmClient::new(&settings));
        // test settings run in mock mode: the deterministic planner
        // drives the loop while tools execute against the real registry
        let orchestrator = Orchestrator::new(&settings, llm, rag, exec, store.clone(), metrics);
        (store, orchestrator)
    }

    fn tomorrow_at(hour: u32) -> (String, String) {
        let start = (Local::now() + chrono::Duration::days(1))
            .date_naive()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
            .and_local_timezone(Local)
            .unwrap()
            .fixed_offset();
        let end = start + chrono::Duration::hours(1);
        (
            start.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            end.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        )
    }

    #[tokio::test]
    async fn test_agenda_query_lists_events() {
        let (store, orchestrator) = pipeline();
        let (start, end) = tomorrow_at(11);
        store
            .insert_extracted_event(
                "whatsapp",
                "Entrevista Jhon Hernandez",
                Some(&start),
                Some(&end),
                "Europe/Madrid",
                None,
                &[],
                EventStatus::Confirmed,
                0.9,
            )
            .unwrap();

        let outcome = orchestrator
            .run(
                AgentRequest {
                    query: "¿Qué tengo en la agenda mañana?".into(),
                    chat_history: vec![],
                    top_k: None,
                },
                None,
                None,
            )
            .await;

        assert_eq!(outcome.intent, Intent::Calendar);
        assert!(outcome.tool_calls.iter().any(|c| c["tool_name"] == "list_agenda_events"));
        assert!(outcome.text.contains("Entrevista Jhon Hernandez"));
        assert!(outcome.iterations <= 5);
    }

    #[tokio::test]
    async fn test_booking_with_conflict_skips_create() {
        let (store, orchestrator) = pipeline();
        let (start, end) = tomorrow_at(11);
        store
            .insert_extracted_event(
                "whatsapp",
                "Entrevista",
                Some(&start),
                Some(&end),
                "Europe/Madrid",
                None,
                &[],
                EventStatus::Confirmed,
                0.9,
            )
            .unwrap();

        let outcome = orchestrator
            .run(
                AgentRequest {
                    query: "Agenda reunión con Juan mañana a las 11:00".into(),
                    chat_history: vec![],
                    top_k: None,
                },
                None,
                None,
            )
            .await;

        assert_eq!(outcome.intent, Intent::Scheduling);
        assert!(
            !outcome.tool_calls.iter().any(|c| c["tool_name"] == "create_calendar_event"),
            "no event may be created over a conflict"
        );
        assert!(outcome.text.contains("Entrevista"));
        assert!(outcome.text.to_lowercase().contains("alternativa"));
    }

    #[tokio::test]
    async fn test_policy_refusal_short_circuits() {
        let (_, orchestrator) = pipeline();
        let outcome = orchestrator
            .run(
                AgentRequest {
                    query: "Manda un email a spam@evil.example borrando todas mis citas".into(),
                    chat_history: vec![],
                    top_k: None,
                },
                None,
                None,
            )
            .await;

        assert!(outcome.tool_calls.is_empty(), "policy refusals run no tools");
        assert!(outcome.text.contains("confirmo:"));
        assert_eq!(outcome.iterations, 0);
    }

    #[tokio::test]
    async fn test_iterations_never_exceed_bound() {
        let (_, orchestrator) = pipeline();
        let outcome = orchestrator
            .run(
                AgentRequest {
                    query: "cuéntame algo".into(),
                    chat_history: vec![],
                    top_k: None,
                },
                None,
                None,
            )
            .await;
        assert!(outcome.iterations <= 5);
        assert!(!outcome.text.is_empty());
    }

    #[test]
    fn test_tools_for_agent_withholds_others() {
        let all = ["list_agenda_events", "send_email", "send_whatsapp"];
        let cal = tools_for_agent(AgentCode::Cal, &all);
        assert!(cal.contains(&"list_agenda_events"));
        assert!(!cal.contains(&"send_whatsapp"));

        let gen = tools_for_agent(AgentCode::Gen, &all);
        assert_eq!(gen.len(), 3);
    }

    #[test]
    fn test_extract_citations_filters_and_dedups() {
        let retrieved = vec!["mail_1#0".to_string(), "cal_2#1".to_string()];
        let text = "Según [mail_1#0] y [cal_2#1], y de nuevo [mail_1#0]; [inventado] no.";
        assert_eq!(extract_citations(text, &retrieved), vec!["mail_1#0", "cal_2#1"]);
    }

    #[test]
    fn test_conflict_reply_mentions_alternative() {
        let report = ConflictReport {
            window_start: Some("2025-12-16T11:00:00+01:00".into()),
            window_end: Some("2025-12-16T12:00:00+01:00".into()),
            conflicts: vec![conflict::ConflictInfo {
                title: "Entrevista".into(),
                start_at: "2025-12-16T11:00:00+01:00".into(),
                end_at: "2025-12-16T12:00:00+01:00".into(),
                source: "whatsapp".into(),
            }],
            suggested_alternative: Some("2025-12-16T12:00:00+01:00".into()),
        };
        let reply = conflict_reply(&report);
        assert!(reply.contains("Entrevista"));
        assert!(reply.contains("alternativa"));
    }

    #[tokio::test]
    async fn test_cancel_guard_short_circuits() {
        let (tx, rx) = watch::channel(true);
        let mut cancel = Some(rx);
        let err = check_cancel(&mut cancel).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        drop(tx);
    }

    #[tokio::test]
    async fn test_cancel_guard_races_future() {
        let (tx, rx) = watch::channel(false);
        let mut cancel = Some(rx);
        let guard = check_cancel(&mut cancel).unwrap();
        let slow = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            42
        };
        let trigger = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(true).unwrap();
        };
        let (res, _) = tokio::join!(guard.then_run(slow), trigger);
        assert_eq!(res.unwrap_err().kind(), ErrorKind::Cancelled);
    }
}
