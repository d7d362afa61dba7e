// Concierge Engine — MCP Tool Mapping
//
// Static table from local tool name to (server_id, server_tool_name),
// loaded once from a JSON file of the form
//   { "send_email": "gmail.send_message", ... }
// Exact names only; no wildcards. Discovery via tools/list is used to
// VALIDATE this table at startup, never to build it.

use log::warn;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct ToolMapping {
    map: HashMap<String, (String, String)>,
}

impl ToolMapping {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load from a JSON object file. A missing file yields an empty
    /// mapping (everything runs on the local registry).
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::empty();
        };
        let raw = match std::fs::read_to_string(path) {
            Ok(r) => r,
            Err(e) => {
                warn!("[mcp] mapping file {:?} unreadable ({}), using empty mapping", path, e);
                return Self::empty();
            }
        };
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Self {
        let parsed: HashMap<String, String> = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!("[mcp] mapping parse failed ({}), using empty mapping", e);
                return Self::empty();
            }
        };
        let mut map = HashMap::new();
        for (tool, target) in parsed {
            match target.split_once('.') {
                Some((server, server_tool)) if !server.is_empty() && !server_tool.is_empty() => {
                    map.insert(tool, (server.to_string(), server_tool.to_string()));
                }
                _ => {
                    warn!("[mcp] mapping entry '{}' → '{}' is not server.tool, skipped", tool, target);
                }
            }
        }
        ToolMapping { map }
    }

    /// Resolve a tool name to its (server_id, server_tool_name).
    pub fn resolve(&self, tool_name: &str) -> Option<(&str, &str)> {
        self.map.get(tool_name).map(|(s, t)| (s.as_str(), t.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &(String, String))> {
        self.map.iter()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_resolve() {
        let mapping = ToolMapping::parse(
            r#"{ "send_email": "gmail.send_message", "send_whatsapp": "twilio.send" }"#,
        );
        assert_eq!(mapping.resolve("send_email"), Some(("gmail", "send_message")));
        assert_eq!(mapping.resolve("list_agenda_events"), None);
    }

    #[test]
    fn test_malformed_entries_skipped() {
        let mapping = ToolMapping::parse(r#"{ "a": "no_dot", "b": ".empty", "c": "srv.ok" }"#);
        assert_eq!(mapping.resolve("a"), None);
        assert_eq!(mapping.resolve("b"), None);
        assert_eq!(mapping.resolve("c"), Some(("srv", "ok")));
    }

    #[test]
    fn test_invalid_json_is_empty() {
        assert!(ToolMapping::parse("not json").is_empty());
        assert!(ToolMapping::load(None).is_empty());
    }
}
