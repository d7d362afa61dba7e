// ── Concierge Atoms: Pure Data Types ───────────────────────────────────────
// All plain struct/enum definitions with no logic beyond trivial accessors.
// Wire shapes follow the OpenAI function-calling convention for messages
// and tool definitions; persistence shapes mirror the store schema.

use crate::atoms::error::ErrorKind;
use serde::{Deserialize, Serialize};

// ── Chat messages ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message { role: Role::System, content: Some(content.into()), tool_calls: None, tool_call_id: None, name: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message { role: Role::User, content: Some(content.into()), tool_calls: None, tool_call_id: None, name: None }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Message { role: Role::Assistant, content: Some(content.into()), tool_calls: None, tool_call_id: None, name: None }
    }

    /// Assistant message carrying tool calls (content omitted).
    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Message { role: Role::Assistant, content: None, tool_calls: Some(calls), tool_call_id: None, name: None }
    }

    /// Tool-result message, labelled with the tool's name.
    pub fn tool_result(call_id: &str, tool_name: &str, content: impl Into<String>) -> Self {
        Message {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.to_string()),
            name: Some(tool_name.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn function_type() -> String {
    "function".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object, exactly as the model produced it.
    pub arguments: String,
}

/// One chat-completion outcome: a final text, tool calls, or both.
#[derive(Debug, Clone, Default)]
pub struct ChatOutcome {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

// ── Tool definitions ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn function(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        ToolDefinition {
            tool_type: "function".into(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

// ── Tool execution envelope ────────────────────────────────────────────────

/// Which path served a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Via {
    Mcp,
    Local,
    Mock,
}

/// Raw output of a tool implementation before it is wrapped in the envelope.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub result: serde_json::Value,
    /// Pre-formatted user-facing text; when present the response stage
    /// prefers it over a second LLM pass.
    pub formatted_text: Option<String>,
}

impl ToolOutput {
    pub fn json(result: serde_json::Value) -> Self {
        ToolOutput { result, formatted_text: None }
    }

    pub fn formatted(result: serde_json::Value, text: impl Into<String>) -> Self {
        ToolOutput { result, formatted_text: Some(text.into()) }
    }
}

/// Uniform result envelope returned by the execution facade regardless of
/// transport. Exactly one `via` is set; `error_*` only on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub via: Via,
}

impl ToolResult {
    pub fn ok(tool_name: &str, output: ToolOutput, duration_ms: u64, via: Via) -> Self {
        ToolResult {
            tool_name: tool_name.into(),
            success: true,
            result: Some(output.result),
            formatted_text: output.formatted_text,
            error_kind: None,
            error_message: None,
            duration_ms,
            via,
        }
    }

    pub fn err(tool_name: &str, kind: ErrorKind, message: impl Into<String>, duration_ms: u64, via: Via) -> Self {
        ToolResult {
            tool_name: tool_name.into(),
            success: false,
            result: None,
            formatted_text: None,
            error_kind: Some(kind),
            error_message: Some(message.into()),
            duration_ms,
            via,
        }
    }
}

// ── Intent routing ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Calendar,
    Email,
    Scheduling,
    Comms,
    General,
}

/// Short mnemonic labelling the specialist responsible for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentCode {
    #[serde(rename = "CAL")]
    Cal,
    #[serde(rename = "EMAIL")]
    Email,
    #[serde(rename = "SCHED")]
    Sched,
    #[serde(rename = "COMMS")]
    Comms,
    #[serde(rename = "GEN")]
    Gen,
}

impl Intent {
    pub fn agent_code(self) -> AgentCode {
        match self {
            Intent::Calendar => AgentCode::Cal,
            Intent::Email => AgentCode::Email,
            Intent::Scheduling => AgentCode::Sched,
            Intent::Comms => AgentCode::Comms,
            Intent::General => AgentCode::Gen,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Calendar => "calendar",
            Intent::Email => "email",
            Intent::Scheduling => "scheduling",
            Intent::Comms => "comms",
            Intent::General => "general",
        }
    }
}

impl AgentCode {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentCode::Cal => "CAL",
            AgentCode::Email => "EMAIL",
            AgentCode::Sched => "SCHED",
            AgentCode::Comms => "COMMS",
            AgentCode::Gen => "GEN",
        }
    }
}

// ── Persistence shapes ─────────────────────────────────────────────────────

/// One retrievable unit of semantic memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticChunk {
    pub chunk_id: String,
    pub source: String,
    pub text: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub created_at: String,
}

/// A chunk returned from similarity search, with its score attached.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub source: String,
    pub text: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub message_sid: String,
    pub conversation_id: String,
    pub from_number: String,
    pub to_number: String,
    pub body: String,
    pub received_at: String,
    pub processed: bool,
    pub event_extracted: bool,
    pub linked_event_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Proposed,
    Suggested,
    Confirmed,
    Created,
    Rejected,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Proposed => "proposed",
            EventStatus::Suggested => "suggested",
            EventStatus::Confirmed => "confirmed",
            EventStatus::Created => "created",
            EventStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "proposed" => Some(EventStatus::Proposed),
            "suggested" => Some(EventStatus::Suggested),
            "confirmed" => Some(EventStatus::Confirmed),
            "created" => Some(EventStatus::Created),
            "rejected" => Some(EventStatus::Rejected),
            _ => None,
        }
    }

    /// Forward-only transition check:
    /// proposed|suggested → confirmed → created, or → rejected.
    pub fn can_transition_to(self, next: EventStatus) -> bool {
        use EventStatus::*;
        matches!(
            (self, next),
            (Proposed, Confirmed)
                | (Suggested, Confirmed)
                | (Proposed, Rejected)
                | (Suggested, Rejected)
                | (Confirmed, Created)
                | (Confirmed, Rejected)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEvent {
    pub id: i64,
    pub source: String,
    pub title: String,
    pub start_at: Option<String>,
    pub end_at: Option<String>,
    pub timezone: String,
    pub location: Option<String>,
    pub attendees: Vec<String>,
    pub status: EventStatus,
    pub confidence: f64,
    pub relevance_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub provider: String,
    pub provider_event_id: String,
    pub calendar_id: String,
    pub title: String,
    pub start_at: String,
    pub end_at: String,
    pub status: String,
    pub last_sync_at: String,
}

// ── Structured agent log events ────────────────────────────────────────────

/// One structured log event emitted by a pipeline stage. Forwarded verbatim
/// over the voice channel and to debug traces.
#[derive(Debug, Clone, Serialize)]
pub struct AgentLogEvent {
    pub event: String,
    pub data: serde_json::Value,
    pub timestamp: String,
}

impl AgentLogEvent {
    pub fn new(event: &str, data: serde_json::Value) -> Self {
        AgentLogEvent {
            event: event.to_string(),
            data,
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        }
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────

/// Truncate a string on a char boundary, appending an ellipsis marker.
pub fn truncate_utf8(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{}...", cut)
}

// ── Tests ──────────────────────────────────────────────────────────────────
