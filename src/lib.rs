// Concierge — personal coordination assistant engine.
//
// A single-user service that takes voice or text requests, retrieves
// semantic context, routes the request through a specialist agent
// pipeline with bounded tool use (local registry or MCP servers), and
// answers in natural language, optionally spoken.

pub mod atoms;
pub mod engine;

pub use atoms::error::{EngineError, EngineResult, ErrorKind};
pub use engine::config::Settings;
pub use engine::container::ServiceContainer;
