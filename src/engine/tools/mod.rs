// Concierge Engine — Tool Registry
// Each tool group is a self-contained module with its definitions and
// executor. Registration happens once at container construction; a
// duplicate name is a programming error and fails fast.
//
// Module layout:
//   agenda.rs    — list_agenda_events, confirm_agenda_event
//   calendar.rs  — create_calendar_event
//   email.rs     — search_emails, read_email, send_email (curl smtps/imaps)
//   messenger.rs — send_whatsapp
//   calendly.rs  — list/create/ingest scheduling-link events
//   web.rs       — extract_urls, scrape_web_content, scrape_news_for_events

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{ToolDefinition, ToolOutput};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

pub mod agenda;
pub mod calendar;
pub mod calendly;
pub mod email;
pub mod messenger;
pub mod web;

/// A typed in-process operation exposed to the LLM.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable snake_case identifier.
    fn name(&self) -> &'static str;
    /// Natural-language description shown to the LLM.
    fn description(&self) -> &str;
    /// JSON-schema parameter object.
    fn parameters(&self) -> serde_json::Value;
    async fn execute(&self, args: &serde_json::Value) -> EngineResult<ToolOutput>;
}

/// Registry of local tools. The rest of the system sees a read-only view.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<&'static str, Arc<dyn Tool>>,
    order: Vec<&'static str>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Panics on a duplicate name — registration is
    /// container-construction time only.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name();
        if self.tools.insert(name, tool).is_some() {
            panic!("tool '{}' registered twice", name);
        }
        self.order.push(name);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.order.clone()
    }

    /// All definitions, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| ToolDefinition::function(t.name(), t.description(), t.parameters()))
            .collect()
    }

    /// Definitions for a subset of names (specialist dispatch). Unknown
    /// names are skipped.
    pub fn definitions_for(&self, names: &[&str]) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter(|n| names.contains(n))
            .filter_map(|n| self.tools.get(n))
            .map(|t| ToolDefinition::function(t.name(), t.description(), t.parameters()))
            .collect()
    }

    /// Execute a local tool. Unknown names are application errors, not
    /// transport errors — there is nothing to fall back to.
    pub async fn execute(&self, name: &str, args: &serde_json::Value) -> EngineResult<ToolOutput> {
        match self.get(name) {
            Some(tool) => tool.execute(args).await,
            None => Err(EngineError::application("registry", format!("unknown tool: {}", name))),
        }
    }
}

// ── Argument helpers ───────────────────────────────────────────────────────

pub(crate) fn require_str<'a>(args: &'a serde_json::Value, key: &str) -> EngineResult<&'a str> {
    args[key]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EngineError::application("args", format!("missing required '{}'", key)))
}

pub(crate) fn opt_str<'a>(args: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    args[key].as_str().filter(|s| !s.is_empty())
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the arguments back."
        }
        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, args: &serde_json::Value) -> EngineResult<ToolOutput> {
            Ok(ToolOutput::json(args.clone()))
        }
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_duplicate_registration_panics() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Echo));
        reg.register(Arc::new(Echo));
    }

    #[tokio::test]
    async fn test_execute_and_unknown() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Echo));

        let out = reg.execute("echo", &serde_json::json!({"a": 1})).await.unwrap();
        assert_eq!(out.result["a"], 1);

        let err = reg.execute("nope", &serde_json::json!({})).await.unwrap_err();
        assert_eq!(err.kind(), crate::atoms::error::ErrorKind::Application);
    }

    #[test]
    fn test_definitions_subset_preserves_order() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Echo));
        let defs = reg.definitions_for(&["echo", "ghost"]);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].function.name, "echo");
    }
}
