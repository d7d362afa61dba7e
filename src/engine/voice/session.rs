// Voice session — full-duplex loop over one WebSocket.
//
// Two tasks per session: the reader (this function's loop) and a writer
// draining a bounded channel of outbound frames. Control frames jump the
// queue: an interrupt flips the active request's cancel signal, which
// aborts LLM/tool work and the TTS stream; nothing partial is committed.
// A session-level lock keeps at most one request in flight; concurrent
// requests are answered with a backend_busy event.

use crate::atoms::types::AgentLogEvent;
use crate::engine::metrics::Metrics;
use crate::engine::orchestrator::{AgentRequest, Orchestrator};
use crate::engine::voice::stt::SttBackend;
use crate::engine::voice::tts::TtsBackend;
use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

const OUT_CHANNEL_DEPTH: usize = 64;

/// Filler tokens that do not count as content for the nonsense filter.
const FILLER_TOKENS: &[&str] = &[
    "eh", "ehh", "em", "mmm", "mm", "uh", "um", "ah", "aah", "pues", "este", "esto",
    "ya", "ok", "vale", "a", "e", "o",
];

#[derive(Clone)]
pub struct VoiceDeps {
    pub stt: Arc<dyn SttBackend>,
    pub tts: Arc<dyn TtsBackend>,
    pub orchestrator: Arc<Orchestrator>,
    pub metrics: Arc<Metrics>,
    pub sample_rate: u32,
    pub first_chunk_timeout: Duration,
    pub min_transcription_chars: usize,
}

/// Outbound frames, serialised by the writer task.
enum OutFrame {
    Log(AgentLogEvent),
    Audio(Vec<u8>),
    Cancel(String),
    Complete,
    Error(String),
}

/// The transcription must have a minimum length and at least one token
/// that is not filler noise.
pub fn is_meaningful(text: &str, min_chars: usize) -> bool {
    let trimmed = text.trim();
    if trimmed.chars().count() < min_chars {
        return false;
    }
    trimmed.split_whitespace().any(|token| {
        let t: String = token
            .to_lowercase()
            .chars()
            .filter(|c| c.is_alphabetic())
            .collect();
        !t.is_empty() && !FILLER_TOKENS.contains(&t.as_str())
    })
}

/// Serve one voice session until the client disconnects.
pub async fn run_session<S>(ws: WebSocketStream<S>, deps: VoiceDeps)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<OutFrame>(OUT_CHANNEL_DEPTH);

    // ── Writer task ────────────────────────────────────────────────────
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let message = match frame {
                OutFrame::Log(ev) => WsMessage::Text(
                    json!({
                        "type": "log",
                        "event": ev.event,
                        "data": ev.data,
                        "timestamp": ev.timestamp,
                    })
                    .to_string(),
                ),
                OutFrame::Audio(bytes) => WsMessage::Binary(bytes),
                OutFrame::Cancel(reason) => {
                    WsMessage::Text(json!({ "type": "cancel", "reason": reason }).to_string())
                }
                OutFrame::Complete => WsMessage::Text(json!({ "type": "complete" }).to_string()),
                OutFrame::Error(message) => {
                    WsMessage::Text(json!({ "type": "error", "message": message }).to_string())
                }
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let send_log = |tx: &mpsc::Sender<OutFrame>, event: &str, data: serde_json::Value| {
        let _ = tx.try_send(OutFrame::Log(AgentLogEvent::new(event, data)));
    };

    send_log(
        &out_tx,
        "backend_ready",
        json!({ "sample_rate": deps.sample_rate, "message": "voice endpoint listo" }),
    );

    // One request at a time per session.
    let busy = Arc::new(Mutex::new(()));
    // Cancel sender of the active request, if any.
    let active_cancel: Arc<parking_lot::Mutex<Option<watch::Sender<bool>>>> =
        Arc::new(parking_lot::Mutex::new(None));

    // ── Reader loop ────────────────────────────────────────────────────
    while let Some(incoming) = stream.next().await {
        let msg = match incoming {
            Ok(m) => m,
            Err(e) => {
                debug!("[voice] read error: {}", e);
                break;
            }
        };

        let text = match msg {
            WsMessage::Text(t) => t,
            WsMessage::Close(_) => break,
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            WsMessage::Binary(_) => {
                debug!("[voice] unexpected binary frame, ignoring");
                continue;
            }
            _ => continue,
        };

        let payload: serde_json::Value = serde_json::from_str(&text)
            .unwrap_or_else(|_| json!({ "mode": "text", "text": text }));

        // Control frames jump the queue.
        match payload["type"].as_str() {
            Some("interrupt") => {
                info!("[voice] interrupt received");
                if let Some(cancel) = active_cancel.lock().as_ref() {
                    let _ = cancel.send(true);
                }
                continue;
            }
            Some("cancel") => {
                let reason = payload["reason"].as_str().unwrap_or("unknown").to_string();
                info!("[voice] cancel received: {}", reason);
                if let Some(cancel) = active_cancel.lock().as_ref() {
                    let _ = cancel.send(true);
                }
                send_log(&out_tx, "request_cancelled", json!({ "reason": reason }));
                continue;
            }
            _ => {}
        }

        // New request: reject when one is already running.
        let Ok(guard) = busy.clone().try_lock_owned() else {
            send_log(
                &out_tx,
                "backend_busy",
                json!({ "message": "Por favor espera a que termine la petición en curso." }),
            );
            continue;
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        *active_cancel.lock() = Some(cancel_tx);

        let deps = deps.clone();
        let out_tx = out_tx.clone();
        let active_cancel = active_cancel.clone();
        tokio::spawn(async move {
            handle_request(payload, deps, out_tx, cancel_rx).await;
            *active_cancel.lock() = None;
            drop(guard);
        });
    }

    info!("[voice] client_disconnected");
    if let Some(cancel) = active_cancel.lock().as_ref() {
        let _ = cancel.send(true);
    }
    drop(out_tx);
    let _ = writer.await;
}

/// One request through the pipeline: STT → agent → TTS.
async fn handle_request(
    payload: serde_json::Value,
    deps: VoiceDeps,
    out_tx: mpsc::Sender<OutFrame>,
    mut cancel: watch::Receiver<bool>,
) {
    let send_log = |event: &str, data: serde_json::Value| {
        let _ = out_tx.try_send(OutFrame::Log(AgentLogEvent::new(event, data)));
    };
    let request_start = Instant::now();
    let mode = payload["mode"].as_str().unwrap_or("text");

    // ── STT ────────────────────────────────────────────────────────────
    let mut stt_ms = 0.0;
    let user_text = if mode == "audio" {
        let stt_start = Instant::now();
        send_log("stt_started", json!({}));

        let b64 = payload["audio_base64"].as_str().unwrap_or("");
        let audio = match base64::engine::general_purpose::STANDARD.decode(b64) {
            Ok(bytes) if !bytes.is_empty() => bytes,
            _ => {
                send_log("stt_error", json!({ "error": "audio vacío o base64 inválido" }));
                return;
            }
        };

        match deps.stt.transcribe(audio).await {
            Ok(text) => {
                stt_ms = stt_start.elapsed().as_secs_f64() * 1000.0;
                deps.metrics.record_voice_stt(stt_ms);
                send_log(
                    "stt_completed",
                    json!({ "text": text, "duration_ms": stt_ms.round() }),
                );
                text
            }
            Err(e) => {
                deps.metrics.record_voice_stt(stt_start.elapsed().as_secs_f64() * 1000.0);
                send_log("stt_error", json!({ "error": e.to_string() }));
                return;
            }
        }
    } else {
        payload["text"].as_str().unwrap_or("").to_string()
    };

    // ── Nonsense filter ────────────────────────────────────────────────
    if !is_meaningful(&user_text, deps.min_transcription_chars) {
        info!("[voice] transcription discarded as noise: '{}'", user_text);
        let _ = out_tx.try_send(OutFrame::Cancel("message_no_sense".to_string()));
        return;
    }

    // ── Agent ──────────────────────────────────────────────────────────
    let agent_start = Instant::now();
    send_log("agent_processing_started", json!({ "query_length": user_text.chars().count() }));

    // Forward the orchestrator's stage events to the client verbatim.
    let (log_tx, mut log_rx) = mpsc::unbounded_channel::<AgentLogEvent>();
    let forward_out = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(ev) = log_rx.recv().await {
            let _ = forward_out.try_send(OutFrame::Log(ev));
        }
    });

    let outcome = deps
        .orchestrator
        .run(
            AgentRequest { query: user_text, chat_history: vec![], top_k: None },
            Some(log_tx),
            Some(cancel.clone()),
        )
        .await;
    let _ = forwarder.await;

    let agent_ms = agent_start.elapsed().as_secs_f64() * 1000.0;
    deps.metrics.record_voice_agent(agent_ms);

    if *cancel.borrow() {
        send_log("request_cancelled", json!({ "reason": "interrupted_by_user" }));
        return;
    }
    if outcome.text.is_empty() {
        send_log("agent_error", json!({ "error": "respuesta vacía" }));
        let _ = out_tx.try_send(OutFrame::Error("Sin respuesta del agente.".into()));
        return;
    }

    // ── TTS ────────────────────────────────────────────────────────────
    let tts_start = Instant::now();
    send_log("tts_started", json!({ "text_length": outcome.text.chars().count() }));

    let mut rx = match deps.tts.synthesize(&outcome.text).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!("[voice] TTS start failed: {}", e);
            deps.metrics.record_voice_tts(tts_start.elapsed().as_secs_f64() * 1000.0, None);
            send_log(
                "tts_error",
                json!({ "error": e.to_string(), "fallback_available": true }),
            );
            finish_request(&deps, &send_log, &out_tx, request_start, stt_ms, agent_ms, 0.0, None);
            return;
        }
    };

    let mut first_chunk_ms: Option<f64> = None;
    let mut chunk_count = 0usize;
    let first_deadline = tokio::time::Instant::now() + deps.first_chunk_timeout;
    let mut interrupted = false;

    loop {
        tokio::select! {
            chunk = rx.recv() => {
                match chunk {
                    Some(bytes) => {
                        if first_chunk_ms.is_none() {
                            let latency = tts_start.elapsed().as_secs_f64() * 1000.0;
                            first_chunk_ms = Some(latency);
                            send_log(
                                "tts_first_chunk_sent",
                                json!({
                                    "first_chunk_latency_ms": latency.round(),
                                    "chunk_size_bytes": bytes.len(),
                                }),
                            );
                        }
                        chunk_count += 1;
                        if out_tx.send(OutFrame::Audio(bytes)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = wait_cancelled(&mut cancel) => {
                interrupted = true;
                break; // dropping rx stops the synthesis task
            }
            _ = tokio::time::sleep_until(first_deadline), if first_chunk_ms.is_none() => {
                warn!("[voice] no TTS chunk within {:?}, signalling fallback", deps.first_chunk_timeout);
                send_log(
                    "tts_error",
                    json!({
                        "error": "sin audio del backend primario",
                        "fallback_available": true,
                        "chunks_received": 0,
                    }),
                );
                break;
            }
        }
    }
    drop(rx);

    let tts_ms = tts_start.elapsed().as_secs_f64() * 1000.0;
    deps.metrics.record_voice_tts(tts_ms, first_chunk_ms);

    if interrupted {
        send_log("request_cancelled", json!({ "reason": "interrupted_by_user" }));
        return;
    }

    send_log(
        "tts_completed",
        json!({
            "chunks_sent": chunk_count,
            "duration_ms": tts_ms.round(),
            "first_chunk_latency_ms": first_chunk_ms.map(f64::round),
            "fallback_available": chunk_count == 0,
        }),
    );

    finish_request(&deps, &send_log, &out_tx, request_start, stt_ms, agent_ms, tts_ms, first_chunk_ms);
}

/// Resolve when the cancel flag flips to true; pend forever if the
/// sender goes away without cancelling.
async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn finish_request(
    deps: &VoiceDeps,
    send_log: &dyn Fn(&str, serde_json::Value),
    out_tx: &mpsc::Sender<OutFrame>,
    request_start: Instant,
    stt_ms: f64,
    agent_ms: f64,
    tts_ms: f64,
    first_chunk_ms: Option<f64>,
) {
    let total_ms = request_start.elapsed().as_secs_f64() * 1000.0;
    deps.metrics.record_voice_request(total_ms);
    send_log(
        "request_completed",
        serde_json::json!({
            "total_duration_ms": total_ms.round(),
            "stt_duration_ms": stt_ms.round(),
            "agent_duration_ms": agent_ms.round(),
            "tts_duration_ms": tts_ms.round(),
            "first_chunk_latency_ms": first_chunk_ms.map(f64::round),
        }),
    );
    let _ = out_tx.try_send(OutFrame::Complete);
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::Settings;
    use crate::engine::embedding::{EmbeddingService, MockEmbedder};
    use crate::engine::exec::ToolExecutor;
    use crate::engine::llm::LlmClient;
    use crate::engine::mcp::{McpManager, ToolMapping};
    use crate::engine::rag::Retrieval;
    use crate::engine::store::Store;
    use crate::engine::tools::ToolRegistry;
    use crate::engine::voice::stt::MockStt;
    use crate::engine::voice::tts::MockTts;

    #[test]
    fn test_nonsense_filter_minimum_length() {
        assert!(!is_meaningful("", 3));
        assert!(!is_meaningful("ah", 3));
        assert!(is_meaningful("hola", 3));
    }

    #[test]
    fn test_nonsense_filter_fillers_only() {
        assert!(!is_meaningful("eh mmm eh", 3));
        assert!(!is_meaningful("123 456", 3));
        assert!(is_meaningful("eh agenda", 3));
        assert!(is_meaningful("¿Qué tengo en la agenda mañana?", 3));
    }

    fn test_deps() -> VoiceDeps {
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
            true,
        ));
        let llm = Arc::new(LlmClient::new(&settings));
        let orchestrator = Arc::new(Orchestrator::new(
            &settings,
            llm,
            rag,
            exec,
            store,
            metrics.clone(),
        ));
        VoiceDeps {
            stt: Arc::new(MockStt),
            tts: Arc::new(MockTts::new(settings.voice_sample_rate)),
            orchestrator,
            metrics,
            sample_rate: settings.voice_sample_rate,
            first_chunk_timeout: Duration::from_millis(settings.tts_first_chunk_timeout_ms),
            min_transcription_chars: settings.min_transcription_chars,
        }
    }

    #[tokio::test]
    async fn test_session_text_roundtrip_over_duplex() {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let deps = test_deps();

        let server = tokio::spawn(async move {
            let ws = tokio_tungstenite::accept_async(server_io).await.unwrap();
            run_session(ws, deps).await;
        });

        let (mut client, _) =
            tokio_tungstenite::client_async("ws://voice.test/voice", client_io).await.unwrap();

        // First frame must be backend_ready with the sample rate.
        let first = client.next().await.unwrap().unwrap();
        let payload: serde_json::Value =
            serde_json::from_str(first.to_text().unwrap()).unwrap();
        assert_eq!(payload["event"], "backend_ready");
        assert_eq!(payload["data"]["sample_rate"], 24_000);

        client
            .send(WsMessage::Text(
                json!({ "mode": "text", "text": "hola, ¿qué tal?" }).to_string(),
            ))
            .await
            .unwrap();

        let mut saw_response_ready = false;
        let mut saw_audio = false;
        let mut saw_complete = false;
        while let Some(Ok(msg)) = client.next().await {
            match msg {
                WsMessage::Text(t) => {
                    let v: serde_json::Value = serde_json::from_str(&t).unwrap();
                    if v["event"] == "agent_response_ready" {
                        saw_response_ready = true;
                    }
                    if v["type"] == "complete" {
                        saw_complete = true;
                        break;
                    }
                }
                WsMessage::Binary(bytes) => {
                    assert_eq!(bytes.len() % 2, 0);
                    saw_audio = true;
                }
                _ => {}
            }
        }
        assert!(saw_response_ready);
        assert!(saw_audio);
        assert!(saw_complete);

        client.close(None).await.ok();
        let _ = server.await;
    }

    #[tokio::test]
    async fn test_session_rejects_noise() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let deps = test_deps();
        let server = tokio::spawn(async move {
            let ws = tokio_tungstenite::accept_async(server_io).await.unwrap();
            run_session(ws, deps).await;
        });
        let (mut client, _) =
            tokio_tungstenite::client_async("ws://voice.test/voice", client_io).await.unwrap();
        let _ready = client.next().await.unwrap().unwrap();

        client
            .send(WsMessage::Text(json!({ "mode": "text", "text": "eh" }).to_string()))
            .await
            .unwrap();

        let msg = client.next().await.unwrap().unwrap();
        let v: serde_json::Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        assert_eq!(v["type"], "cancel");
        assert_eq!(v["reason"], "message_no_sense");

        client.close(None).await.ok();
        let _ = server.await;
    }
}
