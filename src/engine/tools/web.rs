// Concierge Engine — Web tools
// extract_urls, scrape_web_content, scrape_news_for_events

use super::{require_str, Tool};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::ToolOutput;
use async_trait::async_trait;
use log::{info, warn};
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use serde_json::json;
use std::sync::OnceLock;
use std::time::Duration;

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);
const USER_AGENT: &str = "Mozilla/5.0 (compatible; concierge/0.4)";

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s<>"')\]]+"#).expect("url regex"))
}

/// Pull URLs out of free text. `normalize` lowercases host and strips
/// fragments; `remove_duplicates` keeps first appearance order.
pub fn extract_urls_from_text(text: &str, normalize: bool, remove_duplicates: bool) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for m in url_regex().find_iter(text) {
        let raw = m.as_str().trim_end_matches(['.', ',', ';', ':']);
        let candidate = if normalize {
            match url::Url::parse(raw) {
                Ok(mut parsed) => {
                    parsed.set_fragment(None);
                    parsed.to_string()
                }
                Err(_) => continue,
            }
        } else {
            raw.to_string()
        };
        if !remove_duplicates || !out.contains(&candidate) {
            out.push(candidate);
        }
    }
    out
}

// ── extract_urls ───────────────────────────────────────────────────────────

pub struct ExtractUrls;

#[async_trait]
impl Tool for ExtractUrls {
    fn name(&self) -> &'static str {
        "extract_urls"
    }

    fn description(&self) -> &str {
        "Extrae las URLs presentes en un texto, normalizadas y sin duplicados."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Texto del cual extraer URLs" },
                "normalize": { "type": "boolean", "description": "Normalizar URLs (por defecto true)" },
                "remove_duplicates": { "type": "boolean", "description": "Eliminar duplicados (por defecto true)" }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: &serde_json::Value) -> EngineResult<ToolOutput> {
        let text = require_str(args, "text")?;
        let normalize = args["normalize"].as_bool().unwrap_or(true);
        let remove_duplicates = args["remove_duplicates"].as_bool().unwrap_or(true);
        let urls = extract_urls_from_text(text, normalize, remove_duplicates);
        let count = urls.len();
        Ok(ToolOutput::json(json!({ "urls": urls, "count": count })))
    }
}

// ── scrape_web_content ─────────────────────────────────────────────────────

pub struct ScrapeWebContent {
    client: Client,
}

impl ScrapeWebContent {
    pub fn new() -> Self {
        ScrapeWebContent {
            client: Client::builder().user_agent(USER_AGENT).build().unwrap_or_default(),
        }
    }
}

impl Default for ScrapeWebContent {
    fn default() -> Self {
        Self::new()
    }
}

fn select_first_text(doc: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    doc.select(&sel)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn select_meta_content(doc: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    doc.select(&sel)
        .next()
        .and_then(|el| el.value().attr("content"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Visible body text, paragraphs joined, bounded in size.
fn extract_body_text(doc: &Html) -> String {
    let sel = Selector::parse("p").expect("p selector");
    let text: Vec<String> = doc
        .select(&sel)
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    crate::atoms::types::truncate_utf8(&text.join("\n"), 4000)
}

#[async_trait]
impl Tool for ScrapeWebContent {
    fn name(&self) -> &'static str {
        "scrape_web_content"
    }

    fn description(&self) -> &str {
        "Descarga una página web y devuelve título, descripción, imagen \
         principal y, opcionalmente, el texto visible."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "URL de la página" },
                "extract_image": { "type": "boolean", "description": "Incluir imagen principal (por defecto true)" },
                "extract_text": { "type": "boolean", "description": "Incluir texto visible (por defecto false)" }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: &serde_json::Value) -> EngineResult<ToolOutput> {
        let url = require_str(args, "url")?;
        let extract_image = args["extract_image"].as_bool().unwrap_or(true);
        let extract_text = args["extract_text"].as_bool().unwrap_or(false);

        info!("[tools] scrape_web_content {}", url);
        let resp = self.client.get(url).timeout(FETCH_TIMEOUT).send().await?;
        if !resp.status().is_success() {
            return Err(EngineError::application("scrape", format!("HTTP {} from {}", resp.status(), url)));
        }
        let html = resp.text().await?;
        let doc = Html::parse_document(&html);

        let title = select_meta_content(&doc, r#"meta[property="og:title"]"#)
            .or_else(|| select_first_text(&doc, "title"))
            .unwrap_or_default();
        let description = select_meta_content(&doc, r#"meta[property="og:description"]"#)
            .or_else(|| select_meta_content(&doc, r#"meta[name="description"]"#))
            .unwrap_or_default();

        let mut out = json!({ "url": url, "title": title, "description": description });
        if extract_image {
            out["image"] = json!(select_meta_content(&doc, r#"meta[property="og:image"]"#));
        }
        if extract_text {
            out["text"] = json!(extract_body_text(&doc));
        }
        Ok(ToolOutput::json(out))
    }
}

// ── scrape_news_for_events ─────────────────────────────────────────────────

pub struct ScrapeNewsForEvents {
    client: Client,
}

impl ScrapeNewsForEvents {
    pub fn new() -> Self {
        ScrapeNewsForEvents {
            client: Client::builder().user_agent(USER_AGENT).build().unwrap_or_default(),
        }
    }
}

impl Default for ScrapeNewsForEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// Headlines (h1-h3 and links) matching any keyword, with their hrefs.
fn candidate_headlines(doc: &Html, keywords: &[String]) -> Vec<serde_json::Value> {
    let mut found = Vec::new();
    for selector in ["h1 a", "h2 a", "h3 a", "h1", "h2", "h3"] {
        let Ok(sel) = Selector::parse(selector) else { continue };
        for el in doc.select(&sel) {
            let text = el.text().collect::<String>().trim().to_string();
            if text.is_empty() {
                continue;
            }
            let lower = text.to_lowercase();
            if keywords.iter().any(|k| lower.contains(&k.to_lowercase())) {
                found.push(json!({
                    "headline": text,
                    "href": el.value().attr("href"),
                }));
            }
        }
    }
    found
}

#[async_trait]
impl Tool for ScrapeNewsForEvents {
    fn name(&self) -> &'static str {
        "scrape_news_for_events"
    }

    fn description(&self) -> &str {
        "Rastrea sitios de noticias en busca de titulares que mencionen las \
         palabras clave y devuelve eventos candidatos."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "sites": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "URLs de los sitios a revisar"
                },
                "keywords": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Palabras clave a buscar en titulares"
                }
            },
            "required": ["sites", "keywords"]
        })
    }

    async fn execute(&self, args: &serde_json::Value) -> EngineResult<ToolOutput> {
        let sites: Vec<String> = args["sites"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        let keywords: Vec<String> = args["keywords"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        if sites.is_empty() || keywords.is_empty() {
            return Err(EngineError::application("args", "'sites' and 'keywords' must be non-empty"));
        }

        let mut candidates = Vec::new();
        for site in &sites {
            let resp = match self.client.get(site).timeout(FETCH_TIMEOUT).send().await {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    warn!("[tools] scrape_news: {} returned {}", site, r.status());
                    continue;
                }
                Err(e) => {
                    warn!("[tools] scrape_news: {} failed: {}", site, e);
                    continue;
                }
            };
            let Ok(html) = resp.text().await else { continue };
            let doc = Html::parse_document(&html);
            for mut hit in candidate_headlines(&doc, &keywords) {
                hit["site"] = json!(site);
                candidates.push(hit);
            }
        }

        info!("[tools] scrape_news_for_events → {} candidates", candidates.len());
        let count = candidates.len();
        Ok(ToolOutput::json(json!({ "candidates": candidates, "count": count })))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_urls_dedup_and_normalize() {
        let text = "mira https://Example.com/page#section y también \
                    https://example.com/page#other, gracias";
        let urls = extract_urls_from_text(text, true, true);
        assert_eq!(urls, vec!["https://example.com/page"]);
    }

    #[test]
    fn test_extract_urls_is_idempotent() {
        let text = "https://a.example/x https://b.example/y";
        let first = extract_urls_from_text(text, true, true);
        let again = extract_urls_from_text(&first.join(" "), true, true);
        assert_eq!(first, again);
    }

    #[test]
    fn test_extract_urls_keeps_duplicates_when_asked() {
        let text = "https://a.example/x https://a.example/x";
        let urls = extract_urls_from_text(text, false, false);
        assert_eq!(urls.len(), 2);
    }

    #[test]
    fn test_extract_urls_trailing_punctuation() {
        let urls = extract_urls_from_text("ver https://a.example/x.", true, true);
        assert_eq!(urls, vec!["https://a.example/x"]);
    }

    #[test]
    fn test_scrape_selectors() {
        let html = r#"<html><head>
            <title>Fallback</title>
            <meta property="og:title" content="Titular OG">
            <meta name="description" content="Desc">
            <meta property="og:image" content="https://img.example/x.png">
            </head><body><p>Primer párrafo.</p><p>Segundo.</p></body></html>"#;
        let doc = Html::parse_document(html);
        assert_eq!(
            select_meta_content(&doc, r#"meta[property="og:title"]"#).unwrap(),
            "Titular OG"
        );
        assert_eq!(select_first_text(&doc, "title").unwrap(), "Fallback");
        assert!(extract_body_text(&doc).contains("Primer párrafo."));
    }

    #[test]
    fn test_candidate_headlines_match_keywords() {
        let html = r#"<html><body>
            <h2><a href="/conferencia">Gran conferencia de IA en Madrid</a></h2>
            <h2><a href="/futbol">Resultados de fútbol</a></h2>
            </body></html>"#;
        let doc = Html::parse_document(html);
        let hits = candidate_headlines(&doc, &["conferencia".to_string()]);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["href"], "/conferencia");
    }
}
