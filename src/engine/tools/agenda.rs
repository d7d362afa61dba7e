// Concierge Engine — Agenda tools
// list_agenda_events, confirm_agenda_event

use super::Tool;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{CalendarEvent, EventStatus, ExtractedEvent, ToolOutput};
use crate::engine::store::Store;
use async_trait::async_trait;
use chrono::DateTime;
use log::info;
use serde_json::json;
use std::sync::Arc;

const MONTHS_ES: [&str; 12] = [
    "enero", "febrero", "marzo", "abril", "mayo", "junio", "julio", "agosto",
    "septiembre", "octubre", "noviembre", "diciembre",
];

/// Conversational Spanish agenda line for one event — the TTS path reads
/// this text aloud verbatim.
fn format_event_line(ev: &ExtractedEvent) -> String {
    let when = ev
        .start_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| {
            use chrono::{Datelike, Timelike};
            format!(
                " - {} de {} a las {:02}:{:02}",
                dt.day(),
                MONTHS_ES[dt.month0() as usize],
                dt.hour(),
                dt.minute()
            )
        })
        .unwrap_or_default();
    let status = match ev.status {
        EventStatus::Confirmed | EventStatus::Created => " (confirmado)",
        EventStatus::Proposed | EventStatus::Suggested => " (propuesto)",
        EventStatus::Rejected => " (rechazado)",
    };
    format!("• {}{}{}", ev.title, status, when)
}

pub fn format_agenda(events: &[ExtractedEvent]) -> String {
    if events.is_empty() {
        return "No encontré próximas citas en la agenda.".to_string();
    }
    let mut lines = vec!["Próximas citas:".to_string()];
    lines.extend(events.iter().map(format_event_line));
    lines.join("\n")
}

// ── list_agenda_events ─────────────────────────────────────────────────────

pub struct ListAgendaEvents {
    store: Arc<Store>,
}

impl ListAgendaEvents {
    pub fn new(store: Arc<Store>) -> Self {
        ListAgendaEvents { store }
    }
}

#[async_trait]
impl Tool for ListAgendaEvents {
    fn name(&self) -> &'static str {
        "list_agenda_events"
    }

    fn description(&self) -> &str {
        "Lista las próximas citas de la agenda (propuestas y confirmadas). \
         Úsala cuando el usuario pregunte qué tiene agendado."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "limit": {
                    "type": "integer",
                    "description": "Número máximo de eventos a devolver (por defecto 10)"
                }
            },
            "required": []
        })
    }

    async fn execute(&self, args: &serde_json::Value) -> EngineResult<ToolOutput> {
        let limit = args["limit"].as_u64().unwrap_or(10) as usize;
        let events = self.store.list_extracted_events(limit)?;
        info!("[tools] list_agenda_events → {} events", events.len());
        let text = format_agenda(&events);
        let count = events.len();
        Ok(ToolOutput::formatted(json!({ "events": events, "count": count }), text))
    }
}

// ── confirm_agenda_event ───────────────────────────────────────────────────

pub struct ConfirmAgendaEvent {
    store: Arc<Store>,
}

impl ConfirmAgendaEvent {
    pub fn new(store: Arc<Store>) -> Self {
        ConfirmAgendaEvent { store }
    }
}

#[async_trait]
impl Tool for ConfirmAgendaEvent {
    fn name(&self) -> &'static str {
        "confirm_agenda_event"
    }

    fn description(&self) -> &str {
        "Confirma una cita propuesta de la agenda. El evento pasa a estado \
         confirmado y queda listo para materializarse en el calendario."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "event_id": {
                    "type": "integer",
                    "description": "ID del evento propuesto a confirmar"
                }
            },
            "required": ["event_id"]
        })
    }

    async fn execute(&self, args: &serde_json::Value) -> EngineResult<ToolOutput> {
        let id = args["event_id"]
            .as_i64()
            .ok_or_else(|| EngineError::application("args", "missing required 'event_id'"))?;

        let event = self.store.transition_event_status(id, EventStatus::Confirmed, "user")?;
        info!("[tools] confirm_agenda_event id={} '{}'", id, event.title);
        let text = format!("He confirmado la cita \"{}\".", event.title);
        Ok(ToolOutput::formatted(json!({ "event": event }), text))
    }
}

/// Materialise a confirmed event as a provider calendar row and advance it
/// to `created`. Called by the approval path after confirmation.
pub fn materialise_event(store: &Store, id: i64, provider: &str) -> EngineResult<CalendarEvent> {
    let event = store
        .get_extracted_event(id)?
        .ok_or_else(|| EngineError::application("store", format!("event {} not found", id)))?;
    let (start, end) = match (&event.start_at, &event.end_at) {
        (Some(s), Some(e)) => (s.clone(), e.clone()),
        _ => {
            return Err(EngineError::application(
                "store",
                format!("event {} has no concrete time window", id),
            ))
        }
    };

    let calendar_event = CalendarEvent {
        provider: provider.to_string(),
        provider_event_id: uuid::Uuid::new_v4().to_string(),
        calendar_id: "primary".to_string(),
        title: event.title.clone(),
        start_at: start,
        end_at: end,
        status: "confirmed".to_string(),
        last_sync_at: chrono::Utc::now().to_rfc3339(),
    };
    store.upsert_calendar_event(&calendar_event)?;
    store.transition_event_status(id, EventStatus::Created, "agent")?;
    Ok(calendar_event)
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_event() -> (Arc<Store>, i64) {
        let store = Arc::new(Store::in_memory(4).unwrap());
        let id = store
            .insert_extracted_event(
                "whatsapp",
                "Entrevista Jhon Hernandez",
                Some("2025-12-16T11:00:00+01:00"),
                Some("2025-12-16T12:00:00+01:00"),
                "Europe/Madrid",
                None,
                &[],
                EventStatus::Confirmed,
                0.9,
            )
            .unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn test_list_formats_spanish_agenda() {
        let (store, _) = store_with_event();
        let tool = ListAgendaEvents::new(store);
        let out = tool.execute(&json!({ "limit": 10 })).await.unwrap();
        let text = out.formatted_text.unwrap();
        assert!(text.contains("Próximas citas:"));
        assert!(text.contains("Entrevista Jhon Hernandez"));
        assert!(text.contains("16 de diciembre a las 11:00"));
        assert!(text.contains("(confirmado)"));
    }

    #[tokio::test]
    async fn test_list_empty_agenda() {
        let store = Arc::new(Store::in_memory(4).unwrap());
        let tool = ListAgendaEvents::new(store);
        let out = tool.execute(&json!({})).await.unwrap();
        assert!(out.formatted_text.unwrap().contains("No encontré"));
    }

    #[tokio::test]
    async fn test_confirm_transitions_status() {
        let store = Arc::new(Store::in_memory(4).unwrap());
        let id = store
            .insert_extracted_event(
                "whatsapp",
                "Demo",
                Some("2025-12-16T11:00:00Z"),
                Some("2025-12-16T12:00:00Z"),
                "UTC",
                None,
                &[],
                EventStatus::Proposed,
                0.8,
            )
            .unwrap();
        let tool = ConfirmAgendaEvent::new(store.clone());
        tool.execute(&json!({ "event_id": id })).await.unwrap();
        assert_eq!(
            store.get_extracted_event(id).unwrap().unwrap().status,
            EventStatus::Confirmed
        );
    }

    #[test]
    fn test_materialise_creates_calendar_row() {
        let (store, id) = store_with_event();
        let cal = materialise_event(&store, id, "google").unwrap();
        assert_eq!(cal.title, "Entrevista Jhon Hernandez");
        assert_eq!(
            store.get_extracted_event(id).unwrap().unwrap().status,
            EventStatus::Created
        );
        let rows = store
            .calendar_events_overlapping("2025-12-16T00:00:00+01:00", "2025-12-17T00:00:00+01:00")
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
