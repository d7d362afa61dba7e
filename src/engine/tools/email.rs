// Concierge Engine — Email tools
// search_emails, read_email, send_email
//
// Delivery and mailbox access go through curl's smtps/imaps support in a
// child process — credentials never appear on the command line for the
// message body, and no mail library is linked in.

use super::{opt_str, require_str, Tool};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::ToolOutput;
use crate::engine::config::Settings;
use async_trait::async_trait;
use log::info;
use serde_json::json;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Clone)]
pub struct MailConfig {
    smtp_host: String,
    smtp_port: u16,
    smtp_user: String,
    smtp_pass: String,
    imap_host: String,
    imap_port: u16,
    imap_user: String,
    imap_pass: String,
}

impl MailConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        MailConfig {
            smtp_host: settings.smtp_host.clone(),
            smtp_port: settings.smtp_port,
            smtp_user: settings.smtp_user.clone(),
            smtp_pass: settings.smtp_pass.clone(),
            imap_host: settings.imap_host.clone(),
            imap_port: settings.imap_port,
            imap_user: settings.imap_user.clone(),
            imap_pass: settings.imap_pass.clone(),
        }
    }

    fn require_smtp(&self) -> EngineResult<()> {
        if self.smtp_host.is_empty() || self.smtp_user.is_empty() {
            return Err(EngineError::Config("SMTP_HOST / SMTP_USER not configured".into()));
        }
        Ok(())
    }

    fn require_imap(&self) -> EngineResult<()> {
        if self.imap_host.is_empty() || self.imap_user.is_empty() {
            return Err(EngineError::Config("IMAP_HOST / IMAP_USER not configured".into()));
        }
        Ok(())
    }
}

// ── send_email ─────────────────────────────────────────────────────────────

pub struct SendEmail {
    config: MailConfig,
}

impl SendEmail {
    pub fn new(config: MailConfig) -> Self {
        SendEmail { config }
    }
}

/// RFC 5322 message with optional Cc header. Bcc recipients only appear
/// in the envelope.
fn build_mail_body(from: &str, to: &str, cc: Option<&str>, subject: &str, body: &str) -> String {
    let cc_header = cc.map(|c| format!("Cc: {}\r\n", c)).unwrap_or_default();
    format!(
        "From: {from}\r\nTo: {to}\r\n{cc}Subject: {subject}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{body}",
        from = from,
        to = to,
        cc = cc_header,
        subject = subject,
        body = body
    )
}

#[async_trait]
impl Tool for SendEmail {
    fn name(&self) -> &'static str {
        "send_email"
    }

    fn description(&self) -> &str {
        "Envía un correo electrónico. Las credenciales están configuradas en \
         el servidor; solo indica destinatario, asunto y cuerpo."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "to": { "type": "string", "description": "Dirección del destinatario" },
                "subject": { "type": "string", "description": "Asunto del correo" },
                "body": { "type": "string", "description": "Cuerpo en texto plano" },
                "cc": { "type": "string", "description": "Copia (opcional)" },
                "bcc": { "type": "string", "description": "Copia oculta (opcional)" }
            },
            "required": ["to", "subject", "body"]
        })
    }

    async fn execute(&self, args: &serde_json::Value) -> EngineResult<ToolOutput> {
        self.config.require_smtp()?;
        let to = require_str(args, "to")?;
        let subject = require_str(args, "subject")?;
        let body = require_str(args, "body")?;
        let cc = opt_str(args, "cc");
        let bcc = opt_str(args, "bcc");

        let url = if self.config.smtp_port == 465 {
            format!("smtps://{}:{}", self.config.smtp_host, self.config.smtp_port)
        } else {
            format!("smtp://{}:{}", self.config.smtp_host, self.config.smtp_port)
        };

        info!("[tools] send_email to {} via {}", to, url);

        let mail = build_mail_body(&self.config.smtp_user, to, cc, subject, body);

        let mut cmd = Command::new("curl");
        cmd.args(["--ssl-reqd", "--url", &url])
            .args(["--user", &format!("{}:{}", self.config.smtp_user, self.config.smtp_pass)])
            .args(["--mail-from", &self.config.smtp_user])
            .args(["--mail-rcpt", to]);
        for extra in [cc, bcc].into_iter().flatten() {
            cmd.args(["--mail-rcpt", extra]);
        }
        cmd.args(["-T", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::Transport(format!("spawn curl: {}", e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(mail.as_bytes()).await?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| EngineError::Transport(format!("curl wait: {}", e)))?;

        if output.status.success() {
            Ok(ToolOutput::formatted(
                json!({ "delivered_to": to, "subject": subject }),
                format!("Correo enviado a {}.", to),
            ))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(EngineError::application("smtp", stderr.trim().to_string()))
        }
    }
}

// ── search_emails ──────────────────────────────────────────────────────────

pub struct SearchEmails {
    config: MailConfig,
}

impl SearchEmails {
    pub fn new(config: MailConfig) -> Self {
        SearchEmails { config }
    }
}

#[async_trait]
impl Tool for SearchEmails {
    fn name(&self) -> &'static str {
        "search_emails"
    }

    fn description(&self) -> &str {
        "Busca correos por criterio IMAP (p. ej. 'UNSEEN', 'FROM juan@x.com', \
         'SUBJECT factura'). Devuelve id, remitente, asunto y fecha."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Criterio de búsqueda IMAP" },
                "folder": { "type": "string", "description": "Carpeta (por defecto INBOX)" },
                "max_results": { "type": "integer", "description": "Máximo de resultados (por defecto 10)" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: &serde_json::Value) -> EngineResult<ToolOutput> {
        self.config.require_imap()?;
        let query = require_str(args, "query")?;
        let folder = opt_str(args, "folder").unwrap_or("INBOX");
        let max_results = args["max_results"].as_u64().unwrap_or(10);

        let url = format!("imaps://{}:{}/{}", self.config.imap_host, self.config.imap_port, folder);
        info!("[tools] search_emails '{}' in {}", query, url);

        let output = Command::new("curl")
            .args(["--ssl-reqd", "--url", &url])
            .args(["--user", &format!("{}:{}", self.config.imap_user, self.config.imap_pass)])
            .args(["--request", &format!("SEARCH {}", query)])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| EngineError::Transport(format!("spawn curl: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::application("imap", stderr.trim().to_string()));
        }

        let body = String::from_utf8_lossy(&output.stdout);
        let ids = parse_search_response(&body, max_results as usize);
        let count = ids.len();
        Ok(ToolOutput::json(json!({
            "folder": folder,
            "query": query,
            "message_ids": ids,
            "count": count,
        })))
    }
}

/// Parse an IMAP `* SEARCH 4 8 15 …` response into the newest N ids.
fn parse_search_response(body: &str, max: usize) -> Vec<u64> {
    let mut ids: Vec<u64> = body
        .lines()
        .filter_map(|l| l.trim().strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|t| t.parse().ok()))
        .collect();
    ids.sort_unstable_by(|a, b| b.cmp(a));
    ids.truncate(max);
    ids
}

// ── read_email ─────────────────────────────────────────────────────────────

pub struct ReadEmail {
    config: MailConfig,
}

impl ReadEmail {
    pub fn new(config: MailConfig) -> Self {
        ReadEmail { config }
    }
}

#[async_trait]
impl Tool for ReadEmail {
    fn name(&self) -> &'static str {
        "read_email"
    }

    fn description(&self) -> &str {
        "Lee un correo concreto por su id (obtenido con search_emails). \
         Devuelve cabeceras y cuerpo."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "email_id": { "type": "integer", "description": "Id del mensaje" },
                "folder": { "type": "string", "description": "Carpeta (por defecto INBOX)" }
            },
            "required": ["email_id"]
        })
    }

    async fn execute(&self, args: &serde_json::Value) -> EngineResult<ToolOutput> {
        self.config.require_imap()?;
        let email_id = args["email_id"]
            .as_u64()
            .ok_or_else(|| EngineError::application("args", "missing required 'email_id'"))?;
        let folder = opt_str(args, "folder").unwrap_or("INBOX");

        let url = format!(
            "imaps://{}:{}/{};MAILINDEX={}",
            self.config.imap_host, self.config.imap_port, folder, email_id
        );
        info!("[tools] read_email {} from {}", email_id, folder);

        let output = Command::new("curl")
            .args(["--ssl-reqd", "--url", &url])
            .args(["--user", &format!("{}:{}", self.config.imap_user, self.config.imap_pass)])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| EngineError::Transport(format!("spawn curl: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::application("imap", stderr.trim().to_string()));
        }

        let raw = String::from_utf8_lossy(&output.stdout);
        let (headers, body) = split_message(&raw);
        Ok(ToolOutput::json(json!({
            "email_id": email_id,
            "folder": folder,
            "headers": headers,
            "body": crate::atoms::types::truncate_utf8(body, 8000),
        })))
    }
}

/// Split a raw RFC 5322 message into selected headers and the body.
fn split_message(raw: &str) -> (serde_json::Value, &str) {
    let (head, body) = match raw.split_once("\r\n\r\n").or_else(|| raw.split_once("\n\n")) {
        Some((h, b)) => (h, b),
        None => (raw, ""),
    };
    let mut headers = serde_json::Map::new();
    for line in head.lines() {
        for key in ["From", "To", "Subject", "Date"] {
            if let Some(value) = line.strip_prefix(&format!("{}:", key)) {
                headers.insert(key.to_lowercase(), json!(value.trim()));
            }
        }
    }
    (serde_json::Value::Object(headers), body)
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_mail_body_with_cc() {
        let mail = build_mail_body("me@x.com", "you@y.com", Some("cc@z.com"), "Hola", "Cuerpo");
        assert!(mail.starts_with("From: me@x.com\r\nTo: you@y.com\r\nCc: cc@z.com\r\n"));
        assert!(mail.ends_with("\r\n\r\nCuerpo"));
    }

    #[test]
    fn test_build_mail_body_without_cc() {
        let mail = build_mail_body("me@x.com", "you@y.com", None, "Hola", "Cuerpo");
        assert!(!mail.contains("Cc:"));
    }

    #[test]
    fn test_parse_search_response_newest_first() {
        let body = "* SEARCH 4 8 15 16 23 42\r\nOK SEARCH done\r\n";
        assert_eq!(parse_search_response(body, 3), vec![42, 23, 16]);
        assert_eq!(parse_search_response("OK nothing\r\n", 5), Vec::<u64>::new());
    }

    #[test]
    fn test_split_message() {
        let raw = "From: a@x.com\r\nSubject: Hola\r\nDate: hoy\r\n\r\nEl cuerpo.";
        let (headers, body) = split_message(raw);
        assert_eq!(headers["from"], "a@x.com");
        assert_eq!(headers["subject"], "Hola");
        assert_eq!(body, "El cuerpo.");
    }

    #[tokio::test]
    async fn test_unconfigured_mail_is_config_error() {
        let cfg = MailConfig {
            smtp_host: String::new(),
            smtp_port: 587,
            smtp_user: String::new(),
            smtp_pass: String::new(),
            imap_host: String::new(),
            imap_port: 993,
            imap_user: String::new(),
            imap_pass: String::new(),
        };
        let tool = SendEmail::new(cfg.clone());
        let err = tool
            .execute(&json!({ "to": "x@y.z", "subject": "s", "body": "b" }))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::atoms::error::ErrorKind::Config);

        let tool = SearchEmails::new(cfg);
        assert!(tool.execute(&json!({ "query": "ALL" })).await.is_err());
    }
}
