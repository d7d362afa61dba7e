// Concierge Engine — Messenger tool
// send_whatsapp: delivery through the messenger gateway's HTTP API.

use super::{require_str, Tool};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::ToolOutput;
use crate::engine::config::Settings;
use async_trait::async_trait;
use log::info;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

pub struct SendWhatsapp {
    client: Client,
    base_url: String,
    token: String,
    from: String,
}

impl SendWhatsapp {
    pub fn new(settings: &Settings) -> Self {
        SendWhatsapp {
            client: Client::new(),
            base_url: settings.messenger_base_url.trim_end_matches('/').to_string(),
            token: settings.messenger_token.clone(),
            from: settings.messenger_from.clone(),
        }
    }
}

#[async_trait]
impl Tool for SendWhatsapp {
    fn name(&self) -> &'static str {
        "send_whatsapp"
    }

    fn description(&self) -> &str {
        "Envía un mensaje de WhatsApp al número indicado (formato \
         internacional, p. ej. +34600111222)."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "to": { "type": "string", "description": "Número de destino en formato internacional" },
                "body": { "type": "string", "description": "Texto del mensaje" }
            },
            "required": ["to", "body"]
        })
    }

    async fn execute(&self, args: &serde_json::Value) -> EngineResult<ToolOutput> {
        if self.base_url.is_empty() {
            return Err(EngineError::Config("MESSENGER_BASE_URL not configured".into()));
        }
        let to = require_str(args, "to")?;
        let body = require_str(args, "body")?;

        info!("[tools] send_whatsapp to {} ({} chars)", to, body.len());

        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("Authorization", format!("Bearer {}", self.token))
            .json(&json!({ "from": self.from, "to": to, "body": body }))
            .timeout(Duration::from_secs(15))
            .send()
            .await?;

        let status = resp.status();
        let payload: serde_json::Value = resp.json().await.unwrap_or_else(|_| json!({}));
        if !status.is_success() {
            return Err(EngineError::application(
                "messenger",
                format!("{} — {}", status, payload),
            ));
        }

        let sid = payload["sid"]
            .as_str()
            .or_else(|| payload["id"].as_str())
            .unwrap_or("unknown")
            .to_string();
        Ok(ToolOutput::formatted(
            json!({ "delivered_to": to, "message_sid": sid }),
            format!("Mensaje enviado a {}.", to),
        ))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
