// Concierge Engine — HTTP Surface
//
// Hand-rolled listener: one task per connection, a small HTTP/1.1 request
// reader, and a WebSocket upgrade path that replays the consumed request
// bytes so the handshake sees them again. Webhook routes ACK immediately
// and do their work on a spawned task.

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::container::ServiceContainer;
use crate::engine::orchestrator::AgentRequest;
use crate::engine::tools::agenda::materialise_event;
use crate::engine::voice;
use crate::engine::webhooks;
use crate::atoms::types::{EventStatus, Message};
use log::{info, warn};
use serde_json::json;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

const MAX_REQUEST_BYTES: usize = 4 * 1024 * 1024;

// ── Prefixed stream (replays consumed bytes, then delegates) ───────────────

pub(crate) struct PrefixedStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self { prefix, pos: 0, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let remaining = &this.prefix[this.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

// ── Request parsing ────────────────────────────────────────────────────────

struct HttpRequest {
    method: String,
    path: String,
    /// Lowercased header names.
    headers: HashMap<String, String>,
    body: Vec<u8>,
    /// Everything read from the socket, for WebSocket replay.
    raw: Vec<u8>,
}

impl HttpRequest {
    fn header(&self, name: &str) -> &str {
        self.headers.get(name).map(String::as_str).unwrap_or("")
    }

    fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }

    fn wants_websocket(&self) -> bool {
        self.header("upgrade").eq_ignore_ascii_case("websocket")
    }
}

async fn read_request(stream: &mut TcpStream) -> EngineResult<HttpRequest> {
    let mut raw: Vec<u8> = Vec::with_capacity(2048);
    let mut buf = [0u8; 4096];

    // Headers first.
    let header_end = loop {
        if let Some(pos) = find_header_end(&raw) {
            break pos;
        }
        if raw.len() > MAX_REQUEST_BYTES {
            return Err(EngineError::application("http", "request too large"));
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(EngineError::Transport("connection closed mid-request".into()));
        }
        raw.extend_from_slice(&buf[..n]);
    };

    let header_text = String::from_utf8_lossy(&raw[..header_end]).to_string();
    let mut lines = header_text.lines();
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("/").split('?').next().unwrap_or("/").to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }

    // Body, per Content-Length.
    let body_start = header_end + 4;
    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if content_length > MAX_REQUEST_BYTES {
        return Err(EngineError::application("http", "body too large"));
    }
    while raw.len() < body_start + content_length {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(EngineError::Transport("connection closed mid-body".into()));
        }
        raw.extend_from_slice(&buf[..n]);
    }
    let body = raw[body_start..body_start + content_length].to_vec();

    Ok(HttpRequest { method, path, headers, body, raw })
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

// ── Responses ──────────────────────────────────────────────────────────────

async fn respond_json(
    stream: &mut TcpStream,
    status: u16,
    body: &serde_json::Value,
) -> EngineResult<()> {
    let payload = body.to_string();
    let reason = match status {
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        502 => "Bad Gateway",
        _ => "Internal Server Error",
    };
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        payload.len(),
        payload
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

// ── Server core ────────────────────────────────────────────────────────────

pub async fn run_server(container: Arc<ServiceContainer>) -> EngineResult<()> {
    let addr = format!("{}:{}", container.settings.bind_address, container.settings.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| EngineError::Config(format!("bind {} failed: {}", addr, e)))?;
    info!("[server] listening on http://{}", addr);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("[server] accept error: {}", e);
                continue;
            }
        };
        let container = container.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, container).await {
                warn!("[server] connection from {} failed: {}", peer, e);
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    container: Arc<ServiceContainer>,
) -> EngineResult<()> {
    let request = read_request(&mut stream).await?;

    // ── WebSocket: /voice ──────────────────────────────────────────────
    if request.path == "/voice" && request.wants_websocket() {
        let replay = PrefixedStream::new(request.raw, stream);
        let ws = tokio_tungstenite::accept_async(replay)
            .await
            .map_err(|e| EngineError::Transport(format!("ws handshake: {}", e)))?;
        info!("[server] voice session opened");
        voice::run_session(ws, container.voice_deps()).await;
        return Ok(());
    }

    let (status, body) = route(&request, &container).await;
    respond_json(&mut stream, status, &body).await
}

async fn route(
    request: &HttpRequest,
    container: &Arc<ServiceContainer>,
) -> (u16, serde_json::Value) {
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/healthz") => {
            let mcp = container.mcp.status().await;
            (200, json!({ "status": "ok", "mock_mode": container.settings.mock_mode, "mcp": mcp }))
        }

        ("GET", "/tools") => {
            let defs = container.exec.registry().definitions();
            (200, json!({ "tools": defs }))
        }

        ("GET", "/metrics") => {
            (200, container.metrics.snapshot(container.embeddings.cache_stats()))
        }

        ("GET", "/events") => match container.store.list_extracted_events(50) {
            Ok(events) => (200, json!({ "events": events })),
            Err(e) => (500, json!({ "error": e.to_string() })),
        },

        ("POST", "/text") => handle_text(request, container).await,

        ("POST", "/email/send") => {
            let payload = request.json();
            let result = container.exec.execute("send_email", &payload).await;
            let status = if result.success { 200 } else { 502 };
            (status, json!(result))
        }

        ("POST", "/events/suggest") => handle_event_suggest(request, container),

        ("POST", path) if path.starts_with("/events/") => handle_event_action(path, container),

        ("POST", "/whatsapp/webhook") => handle_whatsapp_webhook(request, container),

        ("POST", "/whatsapp/reprocess") => {
            let all = request.json()["all"].as_bool().unwrap_or(false);
            let container = container.clone();
            tokio::spawn(async move {
                match container.conversations.reprocess(all).await {
                    Ok(results) => info!("[server] batch reprocess: {} conversation(s)", results.len()),
                    Err(e) => warn!("[server] batch reprocess failed: {}", e),
                }
            });
            (202, json!({ "status": "reprocessing", "all": all }))
        }

        ("POST", "/calendly/webhook") => handle_calendly_webhook(request, container),

        ("GET", _) | ("POST", _) => (404, json!({ "error": "not found" })),
        _ => (405, json!({ "error": "method not allowed" })),
    }
}

async fn handle_text(
    request: &HttpRequest,
    container: &Arc<ServiceContainer>,
) -> (u16, serde_json::Value) {
    let payload = request.json();
    let Some(query) = payload["query"].as_str().filter(|q| !q.is_empty()) else {
        return (400, json!({ "error": "missing 'query'" }));
    };

    let chat_history: Vec<Message> = payload["chat_history"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|m| {
                    let content = m["content"].as_str()?;
                    match m["role"].as_str()? {
                        "user" => Some(Message::user(content)),
                        "assistant" => Some(Message::assistant(content)),
                        _ => None,
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let outcome = container
        .orchestrator
        .run(
            AgentRequest {
                query: query.to_string(),
                chat_history,
                top_k: payload["top_k"].as_u64().map(|k| k as usize),
            },
            None,
            None,
        )
        .await;

    (
        200,
        json!({
            "text": outcome.text,
            "citations": outcome.citations,
            "debug": {
                "intent": outcome.intent,
                "agent_code": outcome.agent_code,
                "iterations": outcome.iterations,
                "tools_called": outcome.tool_calls,
                "stage_timings_ms": outcome.stage_timings_ms,
            },
        }),
    )
}

fn handle_event_suggest(
    request: &HttpRequest,
    container: &Arc<ServiceContainer>,
) -> (u16, serde_json::Value) {
    let payload = request.json();
    let Some(title) = payload["title"].as_str().filter(|t| !t.is_empty()) else {
        return (400, json!({ "error": "missing 'title'" }));
    };
    let attendees: Vec<String> = payload["attendees"]
        .as_array()
        .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();

    match container.store.insert_extracted_event(
        payload["source"].as_str().unwrap_or("api"),
        title,
        payload["start_at"].as_str(),
        payload["end_at"].as_str(),
        payload["timezone"].as_str().unwrap_or("UTC"),
        payload["location"].as_str(),
        &attendees,
        EventStatus::Proposed,
        payload["confidence"].as_f64().unwrap_or(0.5),
    ) {
        Ok(id) => (200, json!({ "event_id": id, "status": "proposed" })),
        Err(e) => (400, json!({ "error": e.to_string() })),
    }
}

/// `/events/{id}/approve` and `/events/{id}/reject`.
fn handle_event_action(path: &str, container: &Arc<ServiceContainer>) -> (u16, serde_json::Value) {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let (Some(id), Some(action)) = (
        segments.get(1).and_then(|s| s.parse::<i64>().ok()),
        segments.get(2).copied(),
    ) else {
        return (404, json!({ "error": "not found" }));
    };

    match action {
        "approve" => {
            if let Err(e) = container.store.transition_event_status(id, EventStatus::Confirmed, "user") {
                return (409, json!({ "error": e.to_string() }));
            }
            match materialise_event(&container.store, id, "local") {
                Ok(calendar_event) => (200, json!({ "event_id": id, "status": "created", "calendar_event": calendar_event })),
                Err(e) => (409, json!({ "error": e.to_string() })),
            }
        }
        "reject" => match container.store.transition_event_status(id, EventStatus::Rejected, "user") {
            Ok(event) => (200, json!({ "event_id": id, "status": event.status })),
            Err(e) => (409, json!({ "error": e.to_string() })),
        },
        _ => (404, json!({ "error": "not found" })),
    }
}

/// Messenger webhook: validate the provider signature over the raw body,
/// persist idempotently, ACK, analyse asynchronously.
fn handle_whatsapp_webhook(
    request: &HttpRequest,
    container: &Arc<ServiceContainer>,
) -> (u16, serde_json::Value) {
    let secret = &container.settings.messenger_webhook_secret;
    if !secret.is_empty() {
        let signature = request.header("x-hub-signature-256");
        if !webhooks::validate_messenger_signature(signature, &request.body, secret) {
            warn!("[server] whatsapp webhook signature mismatch");
            return (403, json!({ "error": "signature mismatch" }));
        }
    }

    let payload = request.json();
    let message_sid = payload["message_sid"]
        .as_str()
        .or_else(|| payload["MessageSid"].as_str())
        .unwrap_or("")
        .to_string();
    if message_sid.is_empty() {
        return (400, json!({ "error": "missing message_sid" }));
    }
    let from = payload["from"]
        .as_str()
        .or_else(|| payload["From"].as_str())
        .unwrap_or("")
        .replace("whatsapp:", "");
    let to = payload["to"]
        .as_str()
        .or_else(|| payload["To"].as_str())
        .unwrap_or("")
        .replace("whatsapp:", "");
    let body = payload["body"]
        .as_str()
        .or_else(|| payload["Body"].as_str())
        .unwrap_or("")
        .to_string();

    let inserted = match container.conversations.ingest(&message_sid, &from, &to, &body, None) {
        Ok(inserted) => inserted,
        Err(e) => {
            warn!("[server] webhook persist failed: {}", e);
            // ACK anyway so the provider does not retry; the failure is logged.
            return (200, json!({ "status": "error", "message": e.to_string() }));
        }
    };

    // Duplicate delivery: idempotent success, no second analysis.
    if inserted {
        let container = container.clone();
        tokio::spawn(async move {
            if let Err(e) = container.conversations.process_message(&message_sid).await {
                warn!("[server] conversation analysis failed: {}", e);
            }
        });
    }

    (200, json!({ "status": "received" }))
}

/// Scheduling-link webhook: validated, ACKed, then synced asynchronously
/// through the ingest tool.
fn handle_calendly_webhook(
    request: &HttpRequest,
    container: &Arc<ServiceContainer>,
) -> (u16, serde_json::Value) {
    let secret = &container.settings.calendly_webhook_secret;
    if !secret.is_empty() {
        let signature = request.header("calendly-webhook-signature");
        if !webhooks::validate_timestamped_signature(signature, &request.body, secret) {
            warn!("[server] calendly webhook signature mismatch");
            return (403, json!({ "error": "signature mismatch" }));
        }
    }

    let container = container.clone();
    tokio::spawn(async move {
        let result = container.exec.execute("ingest_calendly_events", &json!({})).await;
        if !result.success {
            warn!("[server] calendly ingest failed: {:?}", result.error_message);
        }
    });

    (200, json!({ "status": "received" }))
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::Settings;

    fn container() -> Arc<ServiceContainer> {
        ServiceContainer::build(Settings::for_tests()).unwrap()
    }

    fn container_without_webhook_secrets() -> Arc<ServiceContainer> {
        let mut settings = Settings::for_tests();
        settings.messenger_webhook_secret = String::new();
        settings.calendly_webhook_secret = String::new();
        ServiceContainer::build(settings).unwrap()
    }

    fn get(path: &str) -> HttpRequest {
        HttpRequest {
            method: "GET".into(),
            path: path.into(),
            headers: HashMap::new(),
            body: vec![],
            raw: vec![],
        }
    }

    fn post(path: &str, body: serde_json::Value) -> HttpRequest {
        HttpRequest {
            method: "POST".into(),
            path: path.into(),
            headers: HashMap::new(),
            body: body.to_string().into_bytes(),
            raw: vec![],
        }
    }

    #[test]
    fn test_find_header_end() {
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\nHost: x\r\n\r\nbody"), Some(23));
        assert_eq!(find_header_end(b"partial"), None);
    }

    #[tokio::test]
    async fn test_healthz_and_tools() {
        let c = container();
        let (status, body) = route(&get("/healthz"), &c).await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "ok");

        let (status, body) = route(&get("/tools"), &c).await;
        assert_eq!(status, 200);
        assert!(body["tools"].as_array().unwrap().len() >= 13);
    }

    #[tokio::test]
    async fn test_event_lifecycle_over_http() {
        let c = container();
        let (status, body) = route(
            &post(
                "/events/suggest",
                json!({
                    "title": "Demo",
                    "start_at": "2025-12-16T11:00:00+01:00",
                    "end_at": "2025-12-16T12:00:00+01:00",
                }),
            ),
            &c,
        )
        .await;
        assert_eq!(status, 200);
        let id = body["event_id"].as_i64().unwrap();

        let (status, body) = route(&post(&format!("/events/{}/approve", id), json!({})), &c).await;
        assert_eq!(status, 200, "{}", body);
        assert_eq!(body["status"], "created");

        // created is terminal: reject now fails
        let (status, _) = route(&post(&format!("/events/{}/reject", id), json!({})), &c).await;
        assert_eq!(status, 409);
    }

    #[tokio::test]
    async fn test_duplicate_webhook_is_single_row() {
        let c = container_without_webhook_secrets();
        let payload = json!({
            "message_sid": "SM_dup",
            "from": "whatsapp:+34600111222",
            "to": "whatsapp:+1555",
            "body": "Hola",
        });
        let (s1, _) = route(&post("/whatsapp/webhook", payload.clone()), &c).await;
        let (s2, _) = route(&post("/whatsapp/webhook", payload), &c).await;
        assert_eq!((s1, s2), (200, 200));

        let tail = c.store.conversation_tail("+34600111222", 10).unwrap();
        assert_eq!(tail.len(), 1);
    }

    #[tokio::test]
    async fn test_webhook_signature_enforced() {
        let c = container(); // test secret is non-empty
        let request = post("/whatsapp/webhook", json!({ "message_sid": "SM2" }));
        let (status, _) = route(&request, &c).await;
        assert_eq!(status, 403);
    }

    #[tokio::test]
    async fn test_text_requires_query() {
        let c = container();
        let (status, _) = route(&post("/text", json!({})), &c).await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let c = container();
        let (status, _) = route(&get("/nope"), &c).await;
        assert_eq!(status, 404);
    }
}
