// Concierge Engine — Tool Execution Facade
//
// Single entry point for running a tool by name. Resolution order:
//   1. mock_mode → deterministic stub registry (via=mock)
//   2. static MCP mapping hit → tools/call on that server (via=mcp);
//      only TRANSPORT failures fall through — a tool that reports its
//      own failure is a final answer
//   3. local registry (via=local)
// Every call is wrapped in the uniform ToolResult envelope and recorded
// in metrics.

use crate::atoms::error::ErrorKind;
use crate::atoms::types::{ToolOutput, ToolResult, Via};
use crate::engine::mcp::{McpManager, ToolMapping};
use crate::engine::metrics::Metrics;
use crate::engine::tools::ToolRegistry;
use log::{info, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    mcp: Arc<McpManager>,
    mapping: ToolMapping,
    metrics: Arc<Metrics>,
    mock_mode: bool,
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        mcp: Arc<McpManager>,
        mapping: ToolMapping,
        metrics: Arc<Metrics>,
        mock_mode: bool,
    ) -> Self {
        ToolExecutor { registry, mcp, mapping, metrics, mock_mode }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub async fn execute(&self, tool_name: &str, args: &serde_json::Value) -> ToolResult {
        let started = Instant::now();
        let result = self.execute_inner(tool_name, args, started).await;
        self.metrics.record_tool_call(
            tool_name,
            started.elapsed().as_secs_f64() * 1000.0,
            result.success,
        );
        result
    }

    async fn execute_inner(
        &self,
        tool_name: &str,
        args: &serde_json::Value,
        started: Instant,
    ) -> ToolResult {
        let elapsed = |s: Instant| s.elapsed().as_millis() as u64;

        if self.mock_mode {
            let output = mock_output(tool_name, args);
            return ToolResult::ok(tool_name, output, elapsed(started), Via::Mock);
        }

        // ── MCP first, when mapped ─────────────────────────────────────
        if let Some((server_id, server_tool)) = self.mapping.resolve(tool_name) {
            info!("[exec] {} → mcp {}.{}", tool_name, server_id, server_tool);
            match self.mcp.call_tool(server_id, server_tool, args.clone()).await {
                Ok(text) => {
                    let result = serde_json::from_str::<serde_json::Value>(&text)
                        .unwrap_or_else(|_| json!({ "text": text.clone() }));
                    return ToolResult::ok(
                        tool_name,
                        ToolOutput { result, formatted_text: Some(text) },
                        elapsed(started),
                        Via::Mcp,
                    );
                }
                Err(e) if e.kind() == ErrorKind::Application => {
                    // The server ran the tool and said no — surface it.
                    return ToolResult::err(
                        tool_name,
                        ErrorKind::Application,
                        e.to_string(),
                        elapsed(started),
                        Via::Mcp,
                    );
                }
                Err(e) => {
                    warn!("[exec] MCP transport failure for {} ({}); falling back to local", tool_name, e);
                }
            }
        }

        // ── Local registry ─────────────────────────────────────────────
        match self.registry.execute(tool_name, args).await {
            Ok(output) => ToolResult::ok(tool_name, output, elapsed(started), Via::Local),
            Err(e) => ToolResult::err(tool_name, e.kind(), e.to_string(), elapsed(started), Via::Local),
        }
    }
}

// ── Mock registry ──────────────────────────────────────────────────────────

/// Deterministic stub responses. Shapes mirror the real tools so the
/// rest of the pipeline (humaniser, tests, demos) behaves identically.
fn mock_output(tool_name: &str, args: &serde_json::Value) -> ToolOutput {
    match tool_name {
        "list_agenda_events" => ToolOutput::formatted(
            json!({
                "events": [{
                    "id": 1,
                    "title": "Entrevista Jhon Hernandez",
                    "start_at": "2025-12-16T11:00:00+01:00",
                    "end_at": "2025-12-16T12:00:00+01:00",
                    "status": "confirmed",
                }],
                "count": 1,
            }),
            "Próximas citas:\n• Entrevista Jhon Hernandez (confirmado) - 16 de diciembre a las 11:00",
        ),
        "create_calendar_event" => ToolOutput::json(json!({
            "event_id": 1,
            "provider_event_id": "mock-event-1",
            "title": args["title"].as_str().unwrap_or("Evento"),
            "start": args["start"],
            "end": args["end"],
        })),
        "confirm_agenda_event" => ToolOutput::json(json!({
            "event": { "id": args["event_id"], "status": "confirmed" }
        })),
        "send_email" => ToolOutput::json(json!({
            "delivered_to": args["to"].as_str().unwrap_or(""),
            "subject": args["subject"].as_str().unwrap_or(""),
        })),
        "send_whatsapp" => ToolOutput::json(json!({
            "delivered_to": args["to"].as_str().unwrap_or(""),
            "message_sid": "SM_mock_1",
        })),
        "search_emails" => ToolOutput::json(json!({
            "message_ids": [42, 23], "count": 2,
            "folder": args["folder"].as_str().unwrap_or("INBOX"),
        })),
        "read_email" => ToolOutput::json(json!({
            "email_id": args["email_id"],
            "headers": { "from": "mock@example.com", "subject": "Mock" },
            "body": "Cuerpo de prueba.",
        })),
        "extract_urls" => {
            let urls = crate::engine::tools::web::extract_urls_from_text(
                args["text"].as_str().unwrap_or(""),
                true,
                true,
            );
            let count = urls.len();
            ToolOutput::json(json!({ "urls": urls, "count": count }))
        }
        _ => ToolOutput::json(json!({ "mock": true, "tool": tool_name })),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::Settings;
    use crate::engine::store::Store;
    use crate::engine::tools::agenda::ListAgendaEvents;

    fn facade(mock_mode: bool, mapping: ToolMapping) -> ToolExecutor {
        let store = Arc::new(Store::in_memory(4).unwrap());
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(ListAgendaEvents::new(store)));
        let settings = Settings::for_tests();
        ToolExecutor::new(
            Arc::new(registry),
            Arc::new(McpManager::new(&settings)),
            mapping,
            Arc::new(Metrics::new()),
            mock_mode,
        )
    }

    #[tokio::test]
    async fn test_mock_mode_short_circuits() {
        let exec = facade(true, ToolMapping::empty());
        let result = exec.execute("list_agenda_events", &json!({})).await;
        assert!(result.success);
        assert_eq!(result.via, Via::Mock);
        assert!(result.formatted_text.unwrap().contains("Entrevista Jhon Hernandez"));
    }

    #[tokio::test]
    async fn test_local_execution_and_envelope() {
        let exec = facade(false, ToolMapping::empty());
        let result = exec.execute("list_agenda_events", &json!({})).await;
        assert!(result.success);
        assert_eq!(result.via, Via::Local);
        assert!(result.error_kind.is_none());
    }

    #[tokio::test]
    async fn test_unknown_tool_is_application_failure() {
        let exec = facade(false, ToolMapping::empty());
        let result = exec.execute("teleport", &json!({})).await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Application));
        assert_eq!(result.via, Via::Local);
    }

    #[tokio::test]
    async fn test_mcp_transport_failure_falls_back_to_local() {
        // Mapping points at a server the manager does not know: the MCP
        // path fails with CONFIG/TRANSPORT and the local registry serves
        // the call.
        let mapping = ToolMapping::parse(r#"{ "list_agenda_events": "offline.list_events" }"#);
        let exec = facade(false, mapping);
        let result = exec.execute("list_agenda_events", &json!({})).await;
        assert!(result.success);
        assert_eq!(result.via, Via::Local);
    }

    #[tokio::test]
    async fn test_mock_extract_urls_is_real_logic() {
        let exec = facade(true, ToolMapping::empty());
        let result = exec
            .execute("extract_urls", &json!({ "text": "ver https://a.example/x y https://a.example/x" }))
            .await;
        assert_eq!(result.result.unwrap()["count"], 1);
    }
}
