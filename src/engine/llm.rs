// Concierge Engine — LLM Client
//
// Chat completions with function calling against an OpenAI-compatible
// endpoint. Stateless per call — conversation memory lives in the
// request's message history. Internal reasoning spans are stripped from
// content before it leaves this module.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{ChatOutcome, FunctionCall, Message, ToolCall, ToolDefinition};
use crate::engine::config::Settings;
use log::{info, warn};
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::OnceLock;
use std::time::Duration;

const CHAT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 2;

fn is_retryable_status(status: u16) -> bool {
    status == 429 || status == 408 || (500..=599).contains(&status)
}

fn think_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<think>.*?(</think>|$)").expect("think regex"))
}

/// Remove `<think>…</think>` spans (case-insensitive; an unterminated
/// span swallows the rest of the text).
pub fn strip_reasoning_spans(text: &str) -> String {
    think_regex().replace_all(text, "").trim().to_string()
}

pub struct LlmClient {
    client: Client,
    base_url: String,
    api_key: String,
    chat_model: String,
    router_model: String,
    temperature: f64,
}

impl LlmClient {
    pub fn new(settings: &Settings) -> Self {
        LlmClient {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            base_url: settings.llm_base_url.trim_end_matches('/').to_string(),
            api_key: settings.llm_api_key.clone(),
            chat_model: settings.llm_chat_model.clone(),
            router_model: settings.llm_router_model.clone(),
            temperature: settings.temperature,
        }
    }

    pub fn has_router_model(&self) -> bool {
        !self.router_model.is_empty()
    }

    /// One chat completion with the main model.
    pub async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> EngineResult<ChatOutcome> {
        self.chat_with(&self.chat_model, messages, tools, 1500).await
    }

    /// Tiny completion with the router model — used by the intent stage.
    pub async fn route(&self, prompt: &str) -> EngineResult<String> {
        let messages = [Message::user(prompt)];
        let outcome = self.chat_with(&self.router_model, &messages, &[], 8).await?;
        Ok(outcome.content.unwrap_or_default())
    }

    async fn chat_with(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
        max_tokens: u32,
    ) -> EngineResult<ChatOutcome> {
        let url = format!("{}/v1/chat/completions", self.base_url);

        let mut body = json!({
            "model": model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": max_tokens,
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
            body["tool_choice"] = json!("auto");
        }

        info!("[llm] chat model={} messages={} tools={}", model, messages.len(), tools.len());

        let mut last_error = String::new();
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = Duration::from_millis(500 * (1 << attempt));
                warn!("[llm] retry {}/{} after {:?}", attempt, MAX_RETRIES, delay);
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .timeout(CHAT_TIMEOUT)
                .send()
                .await;

            let resp = match resp {
                Ok(r) => r,
                Err(e) => {
                    last_error = format!("request failed: {}", e);
                    continue;
                }
            };

            let status = resp.status().as_u16();
            if status == 401 || status == 403 {
                let text = resp.text().await.unwrap_or_default();
                return Err(EngineError::application(
                    "llm",
                    format!("auth error {}: {}", status, crate::atoms::types::truncate_utf8(&text, 200)),
                ));
            }
            if !resp.status().is_success() {
                let text = resp.text().await.unwrap_or_default();
                last_error = format!(
                    "API error {}: {}",
                    status,
                    crate::atoms::types::truncate_utf8(&text, 200)
                );
                if is_retryable_status(status) && attempt < MAX_RETRIES {
                    continue;
                }
                return Err(EngineError::application("llm", last_error));
            }

            let data: Value = resp.json().await?;
            return Ok(parse_chat_response(&data));
        }

        Err(EngineError::Transport(last_error))
    }
}

/// Parse one non-streaming chat-completions response into a ChatOutcome,
/// stripping reasoning spans from the content.
fn parse_chat_response(data: &Value) -> ChatOutcome {
    let msg = &data["choices"][0]["message"];

    let content = msg["content"]
        .as_str()
        .map(strip_reasoning_spans)
        .filter(|s| !s.is_empty());

    let tool_calls: Vec<ToolCall> = msg["tool_calls"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let name = tc["function"]["name"].as_str()?;
                    Some(ToolCall {
                        id: tc["id"].as_str().unwrap_or("call_0").to_string(),
                        call_type: "function".into(),
                        function: FunctionCall {
                            name: name.to_string(),
                            arguments: tc["function"]["arguments"]
                                .as_str()
                                .unwrap_or("{}")
                                .to_string(),
                        },
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    ChatOutcome { content, tool_calls }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_reasoning_spans() {
        let raw = "<think>debo listar la agenda</think>Tienes una cita mañana.";
        assert_eq!(strip_reasoning_spans(raw), "Tienes una cita mañana.");

        let raw = "<THINK>uno</THINK>ok<think>dos</think> listo";
        assert_eq!(strip_reasoning_spans(raw), "ok listo");

        // unterminated span swallows the tail
        let raw = "Respuesta corta. <think>y esto nunca cierra";
        assert_eq!(strip_reasoning_spans(raw), "Respuesta corta.");

        // no spans is a no-op
        assert_eq!(strip_reasoning_spans("sin marcas"), "sin marcas");
    }

    #[test]
    fn test_parse_chat_response_with_tool_calls() {
        let data = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {
                            "name": "list_agenda_events",
                            "arguments": "{\"limit\": 10}"
                        }
                    }]
                }
            }]
        });
        let outcome = parse_chat_response(&data);
        assert!(outcome.content.is_none());
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_calls[0].function.name, "list_agenda_events");
        assert_eq!(outcome.tool_calls[0].id, "call_abc");
    }

    #[test]
    fn test_parse_chat_response_strips_think() {
        let data = json!({
            "choices": [{
                "message": {
                    "content": "<think>hm</think>Hola",
                    "tool_calls": null
                }
            }]
        });
        let outcome = parse_chat_response(&data);
        assert_eq!(outcome.content.as_deref(), Some("Hola"));
        assert!(outcome.tool_calls.is_empty());
    }

    #[test]
    fn test_retryable_status_classification() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(404));
    }
}
