// Concierge Engine — MCP Client
//
// One connected MCP server: initialize handshake, tools/list, tools/call.
// Transport-agnostic via McpTransportHandle.

use super::transport::{HttpTransport, McpTransportHandle, SseTransport, StdioTransport};
use super::types::*;
use crate::atoms::error::{EngineError, EngineResult};
use log::info;
use std::sync::atomic::{AtomicU64, Ordering};

/// MCP protocol version we advertise.
const PROTOCOL_VERSION: &str = "2024-11-05";
/// Default timeout for JSON-RPC housekeeping requests (seconds).
const DEFAULT_TIMEOUT: u64 = 30;

#[derive(Debug)]
pub struct McpClient {
    pub config: McpServerConfig,
    transport: McpTransportHandle,
    next_id: AtomicU64,
    pub server_info: Option<McpServerInfo>,
    /// Cached tools from the last `tools/list`.
    pub tools: Vec<McpToolDef>,
}

impl McpClient {
    /// Connect, perform the initialize handshake, and fetch the tool list.
    pub async fn connect(config: McpServerConfig) -> EngineResult<Self> {
        info!("[mcp] Connecting to server '{}' via {:?}", config.id, config.transport);

        let transport = match config.transport {
            McpTransportKind::Stdio => {
                if config.command.is_empty() {
                    return Err(EngineError::Config(format!(
                        "MCP server '{}': stdio transport requires a command",
                        config.id
                    )));
                }
                McpTransportHandle::Stdio(
                    StdioTransport::spawn(&config.command, &config.args, &config.env)
                        .await
                        .map_err(EngineError::Transport)?,
                )
            }
            McpTransportKind::Http => {
                if config.url.is_empty() {
                    return Err(EngineError::Config(format!(
                        "MCP server '{}': http transport requires a URL",
                        config.id
                    )));
                }
                McpTransportHandle::Http(
                    HttpTransport::connect(&config.url, &config.env)
                        .map_err(EngineError::Transport)?,
                )
            }
            McpTransportKind::Sse => {
                if config.url.is_empty() {
                    return Err(EngineError::Config(format!(
                        "MCP server '{}': sse transport requires a URL",
                        config.id
                    )));
                }
                McpTransportHandle::Sse(
                    SseTransport::connect(&config.url, &config.env)
                        .await
                        .map_err(EngineError::Transport)?,
                )
            }
        };

        let mut client = McpClient {
            config,
            transport,
            next_id: AtomicU64::new(1),
            server_info: None,
            tools: vec![],
        };

        client.initialize().await?;
        client.refresh_tools().await?;
        Ok(client)
    }

    async fn initialize(&mut self) -> EngineResult<()> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: McpClientCapabilities::default(),
            client_info: McpClientInfo {
                name: "concierge".into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
        };

        let req = JsonRpcRequest::new(
            self.next_id(),
            "initialize",
            Some(serde_json::to_value(&params)?),
        );
        let resp = self
            .transport
            .send_request(req, DEFAULT_TIMEOUT)
            .await
            .map_err(EngineError::Transport)?;

        if let Some(err) = resp.error {
            return Err(EngineError::application(
                "mcp",
                format!("initialize failed: {} (code={})", err.message, err.code),
            ));
        }
        if let Some(result) = resp.result {
            let init: InitializeResult = serde_json::from_value(result)?;
            info!(
                "[mcp] Server '{}' initialized (protocol={})",
                self.config.id, init.protocol_version
            );
            self.server_info = init.server_info;
        }

        // `initialized` notification completes the handshake.
        self.transport
            .send_notification("notifications/initialized", None)
            .await
            .map_err(EngineError::Transport)?;
        Ok(())
    }

    /// Fetch (or refresh) the server's tool list.
    pub async fn refresh_tools(&mut self) -> EngineResult<()> {
        let req = JsonRpcRequest::new(self.next_id(), "tools/list", None);
        let resp = self
            .transport
            .send_request(req, DEFAULT_TIMEOUT)
            .await
            .map_err(EngineError::Transport)?;

        if let Some(err) = resp.error {
            // Server may not expose tools at all.
            if err.code == METHOD_NOT_FOUND {
                info!("[mcp] Server '{}' does not expose tools", self.config.id);
                self.tools = vec![];
                return Ok(());
            }
            return Err(EngineError::application(
                "mcp",
                format!("tools/list failed: {} (code={})", err.message, err.code),
            ));
        }

        self.tools = match resp.result {
            Some(result) => serde_json::from_value::<ToolsListResult>(result)?.tools,
            None => vec![],
        };
        info!("[mcp] Server '{}' exposes {} tools", self.config.id, self.tools.len());
        Ok(())
    }

    /// Call a tool. Application failures (JSON-RPC error object or
    /// isError content) surface as Application errors; only transport
    /// breakage maps to Transport.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        timeout_secs: u64,
    ) -> EngineResult<String> {
        let params = ToolCallParams { name: tool_name.into(), arguments };
        let req = JsonRpcRequest::new(
            self.next_id(),
            "tools/call",
            Some(serde_json::to_value(&params)?),
        );

        let resp = self
            .transport
            .send_request(req, timeout_secs)
            .await
            .map_err(EngineError::Transport)?;

        if let Some(err) = resp.error {
            return Err(EngineError::application(
                "mcp",
                format!("tools/call '{}' failed: {} (code={})", tool_name, err.message, err.code),
            ));
        }

        let result_val = resp.result.ok_or_else(|| {
            EngineError::application("mcp", format!("tools/call '{}': empty result", tool_name))
        })?;
        let tool_result: ToolCallResult = serde_json::from_value(result_val)?;

        if tool_result.is_error {
            return Err(EngineError::application(
                "mcp",
                extract_text_content(&tool_result.content),
            ));
        }
        Ok(extract_text_content(&tool_result.content))
    }

    pub async fn is_alive(&self) -> bool {
        self.transport.is_alive().await
    }

    pub async fn shutdown(&self) {
        info!("[mcp] Shutting down server '{}'", self.config.id);
        self.transport.shutdown().await;
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Concatenated text content from MCP content blocks.
fn extract_text_content(content: &[McpContent]) -> String {
    content
        .iter()
        .filter_map(|c| match c {
            McpContent::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_text_content_multi() {
        let content = vec![
            McpContent::Text { text: "Line 1".into() },
            McpContent::Image { data: "b64".into(), mime_type: "image/png".into() },
            McpContent::Text { text: "Line 2".into() },
        ];
        assert_eq!(extract_text_content(&content), "Line 1\nLine 2");
        assert_eq!(extract_text_content(&[]), "");
    }

    #[tokio::test]
    async fn test_stdio_requires_command() {
        let config = McpServerConfig {
            id: "bad".into(),
            name: String::new(),
            transport: McpTransportKind::Stdio,
            command: String::new(),
            args: vec![],
            env: Default::default(),
            url: String::new(),
            enabled: true,
        };
        let err = McpClient::connect(config).await.unwrap_err();
        assert_eq!(err.kind(), crate::atoms::error::ErrorKind::Config);
    }
}
