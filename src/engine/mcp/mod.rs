// Concierge Engine — MCP (Model Context Protocol) Client
//
// Out-of-process tool servers speaking JSON-RPC 2.0 over stdio, HTTP, or
// HTTP+SSE. The execution facade consults the static tool mapping and
// dispatches mapped tools here before falling back to the local registry.
//
// Architecture:
//   types.rs     — protocol types + server config
//   transport.rs — stdio / http / sse transports + unified handle
//   client.rs    — initialize handshake, tools/list, tools/call
//   manager.rs   — pooled lifecycle (coalesced connect, idle eviction,
//                  failure cooldown)
//   mapping.rs   — static tool_name → server.tool table

pub mod client;
pub mod manager;
pub mod mapping;
pub mod transport;
pub mod types;

pub use manager::McpManager;
pub use mapping::ToolMapping;
pub use types::{McpServerConfig, McpTransportKind};
