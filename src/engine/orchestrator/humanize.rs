// Humanisation post-processor — deterministic rewrites applied to the
// model's final text before any user surface (text reply or TTS).
// The whole pass is idempotent: running it twice changes nothing.

use crate::atoms::types::ToolResult;
use crate::engine::llm::strip_reasoning_spans;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Preamble fragments dropped when a line starts with them. The model
/// sometimes leaks these despite the reasoning-span stripping.
const PREAMBLE_PATTERNS: &[&str] = &[
    "let me think", "let's process", "we note that", "we are given", "we should",
    "how should we", "vamos a pensar", "primero analizo", "analicemos",
];

const MONTHS_ES: [&str; 12] = [
    "enero", "febrero", "marzo", "abril", "mayo", "junio", "julio", "agosto",
    "septiembre", "octubre", "noviembre", "diciembre",
];

fn event_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bevent(?:o)?[ _]?(?:id[ =]?)?#?(\d+)\b").expect("event id regex")
    })
}

fn iso_date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").expect("iso date regex"))
}

fn whitespace_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[ \t]{2,}").expect("ws regex"))
}

fn blank_lines_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n\s*\n\s*\n+").expect("blank regex"))
}

/// Title lookup from tool results: any `events[*]` entry or top-level
/// object with an id and a title contributes.
fn collect_event_titles(tool_results: &[ToolResult]) -> HashMap<String, String> {
    let mut titles = HashMap::new();
    for tr in tool_results {
        let Some(result) = &tr.result else { continue };
        if let Some(events) = result["events"].as_array() {
            for ev in events {
                let id = ev["id"]
                    .as_i64()
                    .map(|v| v.to_string())
                    .or_else(|| ev["id"].as_str().map(String::from));
                let title = ev["title"].as_str().or_else(|| ev["name"].as_str());
                if let (Some(id), Some(title)) = (id, title) {
                    titles.insert(id, title.to_string());
                }
            }
        }
        if let (Some(id), Some(title)) = (result["event_id"].as_i64(), result["title"].as_str()) {
            titles.insert(id.to_string(), title.to_string());
        }
    }
    titles
}

/// ISO date → Spanish long form ("2025-12-16" → "16 de diciembre de 2025").
fn humanize_dates(text: &str) -> String {
    iso_date_regex()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let year: i32 = caps[1].parse().unwrap_or(0);
            let month: usize = caps[2].parse().unwrap_or(0);
            let day: u32 = caps[3].parse().unwrap_or(0);
            if (1..=12).contains(&month) && (1..=31).contains(&day) {
                format!("{} de {} de {}", day, MONTHS_ES[month - 1], year)
            } else {
                caps[0].to_string()
            }
        })
        .to_string()
}

fn drop_preambles(text: &str) -> String {
    text.lines()
        .filter(|line| {
            let l = line.trim().to_lowercase();
            !PREAMBLE_PATTERNS.iter().any(|p| l.starts_with(p))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// The last successful tool result carrying pre-formatted text, if any.
fn final_formatted_text(tool_results: &[ToolResult]) -> Option<&str> {
    tool_results
        .iter()
        .rev()
        .find(|tr| tr.success && tr.formatted_text.as_deref().is_some_and(|t| t.len() > 20))
        .and_then(|tr| tr.formatted_text.as_deref())
}

/// Main entry point. `raw` is the model's final text; tool results feed
/// the formatted-body preference and the id → title substitution.
pub fn humanise(raw: &str, tool_results: &[ToolResult], _citations: &[String]) -> String {
    // Prefer the tool's own formatted body when one exists — it already
    // stands alone and TTS reads it directly.
    let base = match final_formatted_text(tool_results) {
        Some(formatted) => formatted.to_string(),
        None => raw.to_string(),
    };

    let mut text = strip_reasoning_spans(&base);
    text = drop_preambles(&text);

    // Opaque event ids → event titles where resolvable.
    let titles = collect_event_titles(tool_results);
    if !titles.is_empty() {
        text = event_id_regex()
            .replace_all(&text, |caps: &regex::Captures<'_>| {
                match titles.get(&caps[1]) {
                    Some(title) => format!("\"{}\"", title),
                    None => caps[0].to_string(),
                }
            })
            .to_string();
    }

    text = humanize_dates(&text);
    text = whitespace_regex().replace_all(&text, " ").to_string();
    text = blank_lines_regex().replace_all(&text, "\n\n").to_string();
    let mut text = text.trim().to_string();

    // Sentence shape: leading capital, closing punctuation.
    if let Some(first) = text.chars().next() {
        if first.is_lowercase() {
            let mut chars = text.chars();
            chars.next();
            text = first.to_uppercase().collect::<String>() + chars.as_str();
        }
    }
    if !text.is_empty() && !text.ends_with(['.', '!', '?', ':']) && !text.ends_with(|c: char| c.is_numeric()) {
        text.push('.');
    }

    if text.is_empty() {
        text = "He procesado tu solicitud. ¿Hay algo más en lo que pueda ayudarte?".to_string();
    }
    text
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{ToolOutput, Via};
    use serde_json::json;

    fn tool_ok(name: &str, result: serde_json::Value, formatted: Option<&str>) -> ToolResult {
        let output = match formatted {
            Some(f) => ToolOutput::formatted(result, f),
            None => ToolOutput::json(result),
        };
        ToolResult::ok(name, output, 5, Via::Local)
    }

    #[test]
    fn test_think_spans_removed() {
        let out = humanise("<think>listar agenda</think>Tienes una cita mañana.", &[], &[]);
        assert_eq!(out, "Tienes una cita mañana.");
    }

    #[test]
    fn test_preamble_lines_dropped() {
        let out = humanise("We note that the user asked.\nTienes una cita mañana.", &[], &[]);
        assert_eq!(out, "Tienes una cita mañana.");
    }

    #[test]
    fn test_formatted_text_preferred() {
        let tr = tool_ok(
            "list_agenda_events",
            json!({"events": []}),
            Some("Próximas citas:\n• Entrevista (confirmado)"),
        );
        let out = humanise("Aquí tienes un resumen generado.", &[tr], &[]);
        assert!(out.starts_with("Próximas citas:"));
    }

    #[test]
    fn test_event_id_replaced_with_title() {
        let tr = tool_ok(
            "list_agenda_events",
            json!({"events": [{"id": 7, "title": "Entrevista Jhon Hernandez"}]}),
            None,
        );
        let out = humanise("He confirmado el evento 7 en tu agenda.", &[tr], &[]);
        assert!(out.contains("\"Entrevista Jhon Hernandez\""));
        assert!(!out.contains("evento 7"));
    }

    #[test]
    fn test_dates_humanised() {
        let out = humanise("La cita es el 2025-12-16 a las 11:00.", &[], &[]);
        assert!(out.contains("16 de diciembre de 2025"));
    }

    #[test]
    fn test_whitespace_collapsed_and_capitalised() {
        let out = humanise("tienes   dos   citas", &[], &[]);
        assert_eq!(out, "Tienes dos citas.");
    }

    #[test]
    fn test_empty_becomes_default() {
        let out = humanise("<think>solo pensamiento</think>", &[], &[]);
        assert!(out.contains("He procesado tu solicitud"));
    }

    #[test]
    fn test_idempotent() {
        let tr = tool_ok(
            "list_agenda_events",
            json!({"events": [{"id": 7, "title": "Entrevista"}]}),
            None,
        );
        let cases = [
            "<think>x</think>El evento 7 es el 2025-12-16.",
            "tienes   dos   citas",
            "Próximas citas:\n• Entrevista (confirmado) - 16 de diciembre a las 11:00",
        ];
        for case in cases {
            let once = humanise(case, std::slice::from_ref(&tr), &[]);
            let twice = humanise(&once, std::slice::from_ref(&tr), &[]);
            assert_eq!(once, twice, "not idempotent for: {}", case);
        }
    }
}
