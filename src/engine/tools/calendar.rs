// Concierge Engine — Calendar tool
// create_calendar_event: validates the window, records the extracted
// event as created, and materialises the provider calendar row. When the
// tool is mapped to an external MCP calendar server the facade routes it
// there instead and this local implementation is the fallback.

use super::{opt_str, require_str, Tool};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{CalendarEvent, EventStatus, ToolOutput};
use crate::engine::store::Store;
use async_trait::async_trait;
use chrono::DateTime;
use log::info;
use serde_json::json;
use std::sync::Arc;

pub struct CreateCalendarEvent {
    store: Arc<Store>,
    provider: String,
}

impl CreateCalendarEvent {
    pub fn new(store: Arc<Store>) -> Self {
        CreateCalendarEvent { store, provider: "local".to_string() }
    }
}

#[async_trait]
impl Tool for CreateCalendarEvent {
    fn name(&self) -> &'static str {
        "create_calendar_event"
    }

    fn description(&self) -> &str {
        "Crea un evento de calendario con título, inicio y fin en formato ISO \
         8601. Úsala cuando el usuario pida agendar una reunión con fecha y \
         hora concretas. Devuelve el identificador del evento creado."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "title": {
                    "type": "string",
                    "description": "Título del evento, p. ej. 'Reunión con Juan'"
                },
                "start": {
                    "type": "string",
                    "description": "Inicio en ISO 8601, p. ej. 2025-12-16T11:00:00+01:00"
                },
                "end": {
                    "type": "string",
                    "description": "Fin en ISO 8601; por defecto una hora después del inicio"
                },
                "attendees": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Direcciones de correo de los asistentes"
                },
                "location": { "type": "string" },
                "description": { "type": "string" }
            },
            "required": ["title", "start"]
        })
    }

    async fn execute(&self, args: &serde_json::Value) -> EngineResult<ToolOutput> {
        let title = require_str(args, "title")?;
        let start = require_str(args, "start")?;

        let start_dt = DateTime::parse_from_rfc3339(start)
            .map_err(|e| EngineError::application("calendar", format!("invalid start '{}': {}", start, e)))?;
        let end_owned;
        let end = match opt_str(args, "end") {
            Some(e) => {
                let end_dt = DateTime::parse_from_rfc3339(e).map_err(|err| {
                    EngineError::application("calendar", format!("invalid end '{}': {}", e, err))
                })?;
                if end_dt < start_dt {
                    return Err(EngineError::application("calendar", "end precedes start"));
                }
                e
            }
            None => {
                end_owned = (start_dt + chrono::Duration::hours(1)).to_rfc3339();
                &end_owned
            }
        };

        let attendees: Vec<String> = args["attendees"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();

        let id = self.store.insert_extracted_event(
            "assistant",
            title,
            Some(start),
            Some(end),
            start_dt.timezone().to_string().as_str(),
            opt_str(args, "location"),
            &attendees,
            EventStatus::Confirmed,
            1.0,
        )?;

        let calendar_event = CalendarEvent {
            provider: self.provider.clone(),
            provider_event_id: uuid::Uuid::new_v4().to_string(),
            calendar_id: "primary".to_string(),
            title: title.to_string(),
            start_at: start.to_string(),
            end_at: end.to_string(),
            status: "confirmed".to_string(),
            last_sync_at: chrono::Utc::now().to_rfc3339(),
        };
        self.store.upsert_calendar_event(&calendar_event)?;
        self.store.transition_event_status(id, EventStatus::Created, "agent")?;

        info!(
            "[tools] create_calendar_event '{}' {} → {} (id={})",
            title, start, end, calendar_event.provider_event_id
        );

        let text = format!("He creado el evento \"{}\" para el {}.", title, start);
        Ok(ToolOutput::formatted(
            json!({
                "event_id": id,
                "provider_event_id": calendar_event.provider_event_id,
                "title": title,
                "start": start,
                "end": end,
            }),
            text,
        ))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_persists_event_and_calendar_row() {
        let store = Arc::new(Store::in_memory(4).unwrap());
        let tool = CreateCalendarEvent::new(store.clone());

        let out = tool
            .execute(&json!({
                "title": "Reunión con Juan",
                "start": "2025-12-16T11:00:00+01:00",
                "end": "2025-12-16T12:00:00+01:00"
            }))
            .await
            .unwrap();

        let id = out.result["event_id"].as_i64().unwrap();
        let ev = store.get_extracted_event(id).unwrap().unwrap();
        assert_eq!(ev.status, EventStatus::Created);

        let rows = store
            .calendar_events_overlapping("2025-12-16T10:00:00+01:00", "2025-12-16T13:00:00+01:00")
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "Reunión con Juan");
    }

    #[tokio::test]
    async fn test_default_duration_is_one_hour() {
        let store = Arc::new(Store::in_memory(4).unwrap());
        let tool = CreateCalendarEvent::new(store);
        let out = tool
            .execute(&json!({ "title": "Llamada", "start": "2025-12-16T09:00:00+01:00" }))
            .await
            .unwrap();
        assert_eq!(out.result["end"], "2025-12-16T10:00:00+01:00");
    }

    #[tokio::test]
    async fn test_rejects_bad_input() {
        let store = Arc::new(Store::in_memory(4).unwrap());
        let tool = CreateCalendarEvent::new(store);
        assert!(tool.execute(&json!({ "start": "2025-12-16T09:00:00Z" })).await.is_err());
        assert!(tool
            .execute(&json!({ "title": "x", "start": "no es una fecha" }))
            .await
            .is_err());
        assert!(tool
            .execute(&json!({
                "title": "x",
                "start": "2025-12-16T12:00:00Z",
                "end": "2025-12-16T11:00:00Z"
            }))
            .await
            .is_err());
    }
}
