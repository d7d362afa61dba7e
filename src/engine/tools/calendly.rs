// Concierge Engine — Scheduling-link tools
// list_calendly_events, create_calendly_event, ingest_calendly_events

use super::{opt_str, require_str, Tool};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{EventStatus, ToolOutput};
use crate::engine::store::Store;
use async_trait::async_trait;
use log::info;
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const API_BASE: &str = "https://api.calendly.com";
const API_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct CalendlyClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl CalendlyClient {
    pub fn new(api_key: &str) -> Self {
        CalendlyClient {
            client: Client::new(),
            api_key: api_key.to_string(),
            base_url: API_BASE.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(api_key: &str, base_url: &str) -> Self {
        CalendlyClient {
            client: Client::new(),
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn require_key(&self) -> EngineResult<()> {
        if self.api_key.is_empty() {
            return Err(EngineError::Config("CALENDLY_API_KEY not configured".into()));
        }
        Ok(())
    }

    async fn scheduled_events(&self, count: u64) -> EngineResult<Vec<serde_json::Value>> {
        self.require_key()?;
        let resp = self
            .client
            .get(format!("{}/scheduled_events?count={}", self.base_url, count))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(API_TIMEOUT)
            .send()
            .await?;
        let status = resp.status();
        let payload: serde_json::Value = resp.json().await.unwrap_or_else(|_| json!({}));
        if !status.is_success() {
            return Err(EngineError::application("calendly", format!("{} — {}", status, payload)));
        }
        Ok(payload["collection"].as_array().cloned().unwrap_or_default())
    }
}

// ── list_calendly_events ───────────────────────────────────────────────────

pub struct ListCalendlyEvents {
    api: CalendlyClient,
}

impl ListCalendlyEvents {
    pub fn new(api: CalendlyClient) -> Self {
        ListCalendlyEvents { api }
    }
}

#[async_trait]
impl Tool for ListCalendlyEvents {
    fn name(&self) -> &'static str {
        "list_calendly_events"
    }

    fn description(&self) -> &str {
        "Lista las reuniones agendadas a través del enlace de Calendly."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "count": { "type": "integer", "description": "Máximo de resultados (por defecto 10)" }
            },
            "required": []
        })
    }

    async fn execute(&self, args: &serde_json::Value) -> EngineResult<ToolOutput> {
        let count = args["count"].as_u64().unwrap_or(10);
        let events = self.api.scheduled_events(count).await?;
        info!("[tools] list_calendly_events → {}", events.len());
        let total = events.len();
        Ok(ToolOutput::json(json!({ "events": events, "count": total })))
    }
}

// ── create_calendly_event ──────────────────────────────────────────────────

pub struct CreateCalendlyEvent {
    api: CalendlyClient,
}

impl CreateCalendlyEvent {
    pub fn new(api: CalendlyClient) -> Self {
        CreateCalendlyEvent { api }
    }
}

#[async_trait]
impl Tool for CreateCalendlyEvent {
    fn name(&self) -> &'static str {
        "create_calendly_event"
    }

    fn description(&self) -> &str {
        "Crea un enlace de invitación de Calendly para un tipo de evento, \
         para que el invitado elija su hueco."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "event_type": { "type": "string", "description": "URI del tipo de evento de Calendly" },
                "max_event_count": { "type": "integer", "description": "Usos máximos del enlace (por defecto 1)" }
            },
            "required": ["event_type"]
        })
    }

    async fn execute(&self, args: &serde_json::Value) -> EngineResult<ToolOutput> {
        self.api.require_key()?;
        let event_type = require_str(args, "event_type")?;
        let max_count = args["max_event_count"].as_u64().unwrap_or(1);

        let resp = self
            .api
            .client
            .post(format!("{}/scheduling_links", self.api.base_url))
            .header("Authorization", format!("Bearer {}", self.api.api_key))
            .json(&json!({
                "max_event_count": max_count,
                "owner": event_type,
                "owner_type": "EventType",
            }))
            .timeout(API_TIMEOUT)
            .send()
            .await?;

        let status = resp.status();
        let payload: serde_json::Value = resp.json().await.unwrap_or_else(|_| json!({}));
        if !status.is_success() {
            return Err(EngineError::application("calendly", format!("{} — {}", status, payload)));
        }

        let url = payload["resource"]["booking_url"].as_str().unwrap_or("").to_string();
        info!("[tools] create_calendly_event → {}", url);
        Ok(ToolOutput::formatted(
            json!({ "booking_url": url }),
            format!("Enlace de reserva creado: {}", url),
        ))
    }
}

// ── ingest_calendly_events ─────────────────────────────────────────────────

pub struct IngestCalendlyEvents {
    api: CalendlyClient,
    store: Arc<Store>,
}

impl IngestCalendlyEvents {
    pub fn new(api: CalendlyClient, store: Arc<Store>) -> Self {
        IngestCalendlyEvents { api, store }
    }
}

#[async_trait]
impl Tool for IngestCalendlyEvents {
    fn name(&self) -> &'static str {
        "ingest_calendly_events"
    }

    fn description(&self) -> &str {
        "Sincroniza las reuniones de Calendly hacia la agenda local como \
         eventos confirmados."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "count": { "type": "integer", "description": "Máximo de reuniones a sincronizar" }
            },
            "required": []
        })
    }

    async fn execute(&self, args: &serde_json::Value) -> EngineResult<ToolOutput> {
        let count = args["count"].as_u64().unwrap_or(25);
        let events = self.api.scheduled_events(count).await?;

        let mut ingested = 0usize;
        for ev in &events {
            let title = ev["name"].as_str().unwrap_or("Reunión Calendly");
            let start = ev["start_time"].as_str();
            let end = ev["end_time"].as_str();
            let timezone = opt_str(ev, "timezone").unwrap_or("UTC");
            if start.is_none() {
                continue;
            }
            self.store.insert_extracted_event(
                "calendly",
                title,
                start,
                end,
                timezone,
                ev["location"]["location"].as_str(),
                &[],
                EventStatus::Confirmed,
                1.0,
            )?;
            ingested += 1;
        }

        info!("[tools] ingest_calendly_events → {} of {}", ingested, events.len());
        Ok(ToolOutput::formatted(
            json!({ "ingested": ingested, "fetched": events.len() }),
            format!("He sincronizado {} reuniones de Calendly.", ingested),
        ))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_api_key_is_config_error() {
        let api = CalendlyClient::new("");
        let tool = ListCalendlyEvents::new(api.clone());
        let err = tool.execute(&json!({})).await.unwrap_err();
        assert_eq!(err.kind(), crate::atoms::error::ErrorKind::Config);

        let store = Arc::new(Store::in_memory(4).unwrap());
        let tool = IngestCalendlyEvents::new(api, store);
        assert!(tool.execute(&json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_create_requires_event_type() {
        let api = CalendlyClient::new("key");
        let tool = CreateCalendlyEvent::new(api);
        assert!(tool.execute(&json!({})).await.is_err());
    }
}
