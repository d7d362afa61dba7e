// Concierge Engine — Settings
//
// Process-wide configuration, read once from environment variables at
// startup and immutable afterwards. Required keys fail fast with a
// Config error; everything else has a sensible default.

use crate::atoms::error::{EngineError, EngineResult};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Settings {
    // ── Store ──────────────────────────────────────────────────────────
    pub db_path: PathBuf,
    pub embedding_dimensions: usize,

    // ── LLM ────────────────────────────────────────────────────────────
    pub llm_base_url: String,
    pub llm_api_key: String,
    pub llm_chat_model: String,
    /// Cheap model used only for intent routing. Empty disables the LLM
    /// fallback and the rule pass alone decides.
    pub llm_router_model: String,
    pub temperature: f64,

    // ── Embeddings ─────────────────────────────────────────────────────
    pub embed_model: String,
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub cache_max_size: usize,

    // ── Voice ──────────────────────────────────────────────────────────
    pub stt_base_url: String,
    pub stt_api_key: String,
    pub stt_model: String,
    pub tts_base_url: String,
    pub tts_voice: String,
    pub voice_sample_rate: u32,
    pub tts_first_chunk_timeout_ms: u64,
    pub min_transcription_chars: usize,

    // ── Mail ───────────────────────────────────────────────────────────
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_pass: String,
    pub imap_host: String,
    pub imap_port: u16,
    pub imap_user: String,
    pub imap_pass: String,

    // ── Messenger / scheduling link ────────────────────────────────────
    pub messenger_base_url: String,
    pub messenger_token: String,
    pub messenger_from: String,
    pub messenger_webhook_secret: String,
    pub calendly_api_key: String,
    pub calendly_webhook_secret: String,

    // ── MCP ────────────────────────────────────────────────────────────
    pub mcp_servers_path: Option<PathBuf>,
    pub mcp_mapping_path: Option<PathBuf>,
    pub mcp_pool_size: usize,
    pub mcp_idle_timeout_secs: u64,
    pub mcp_cooldown_secs: u64,
    pub mcp_tool_timeout_secs: u64,

    // ── Agent ──────────────────────────────────────────────────────────
    pub max_iterations: u32,
    pub default_top_k: usize,
    pub min_similarity: f64,
    pub working_hours_start: u32,
    pub working_hours_end: u32,
    pub max_lookahead_days: i64,
    pub request_deadline_secs: u64,

    // ── Flags / server ─────────────────────────────────────────────────
    pub mock_mode: bool,
    pub dev_mode: bool,
    pub bind_address: String,
    pub port: u16,
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

impl Settings {
    /// Load from the process environment. Call once at startup.
    pub fn from_env() -> EngineResult<Self> {
        let default_db = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".concierge")
            .join("engine.db");

        let settings = Settings {
            db_path: std::env::var("CONCIERGE_DB_PATH").map(PathBuf::from).unwrap_or(default_db),
            embedding_dimensions: env_parse("EMBEDDING_DIMENSIONS", 1024),

            llm_base_url: env_str("LLM_BASE_URL", "https://api.openai.com"),
            llm_api_key: env_str("LLM_API_KEY", ""),
            llm_chat_model: env_str("LLM_CHAT_MODEL", "gpt-4o"),
            llm_router_model: env_str("LLM_ROUTER_MODEL", ""),
            temperature: env_parse("TEMPERATURE", 0.1),

            embed_model: env_str("EMBED_MODEL", "text-embedding-3-small"),
            cache_enabled: env_bool("CACHE_ENABLED", true),
            cache_ttl_secs: env_parse("CACHE_TTL", 3600),
            cache_max_size: env_parse("CACHE_MAX_SIZE", 1000),

            stt_base_url: env_str("STT_BASE_URL", ""),
            stt_api_key: env_str("STT_API_KEY", ""),
            stt_model: env_str("STT_MODEL", "whisper-large-v3"),
            tts_base_url: env_str("TTS_BASE_URL", ""),
            tts_voice: env_str("TTS_VOICE", "default"),
            voice_sample_rate: env_parse("VOICE_SAMPLE_RATE", 24_000),
            tts_first_chunk_timeout_ms: env_parse("TTS_FIRST_CHUNK_TIMEOUT_MS", 2_000),
            min_transcription_chars: env_parse("MIN_TRANSCRIPTION_CHARS", 3),

            smtp_host: env_str("SMTP_HOST", ""),
            smtp_port: env_parse("SMTP_PORT", 587),
            smtp_user: env_str("SMTP_USER", ""),
            smtp_pass: env_str("SMTP_PASS", ""),
            imap_host: env_str("IMAP_HOST", ""),
            imap_port: env_parse("IMAP_PORT", 993),
            imap_user: env_str("IMAP_USER", ""),
            imap_pass: env_str("IMAP_PASS", ""),

            messenger_base_url: env_str("MESSENGER_BASE_URL", ""),
            messenger_token: env_str("MESSENGER_TOKEN", ""),
            messenger_from: env_str("MESSENGER_FROM", ""),
            messenger_webhook_secret: env_str("MESSENGER_WEBHOOK_SECRET", ""),
            calendly_api_key: env_str("CALENDLY_API_KEY", ""),
            calendly_webhook_secret: env_str("CALENDLY_WEBHOOK_SECRET", ""),

            mcp_servers_path: std::env::var("MCP_SERVERS_PATH").ok().map(PathBuf::from),
            mcp_mapping_path: std::env::var("MCP_MAPPING_PATH").ok().map(PathBuf::from),
            mcp_pool_size: env_parse("MCP_POOL_SIZE", 10),
            mcp_idle_timeout_secs: env_parse("MCP_IDLE_TIMEOUT_SECS", 300),
            mcp_cooldown_secs: env_parse("MCP_COOLDOWN_SECS", 30),
            mcp_tool_timeout_secs: env_parse("MCP_TOOL_TIMEOUT_SECS", 20),

            max_iterations: env_parse("MAX_ITERATIONS", 5),
            default_top_k: env_parse("DEFAULT_TOP_K", 6),
            min_similarity: env_parse("MIN_SIMILARITY", 0.0),
            working_hours_start: env_parse("WORKING_HOURS_START", 9),
            working_hours_end: env_parse("WORKING_HOURS_END", 19),
            max_lookahead_days: env_parse("MAX_LOOKAHEAD_DAYS", 365),
            request_deadline_secs: env_parse("REQUEST_DEADLINE_SECS", 30),

            mock_mode: env_bool("MOCK_MODE", false),
            dev_mode: env_bool("DEV_MODE", false),
            bind_address: env_str("BIND_ADDRESS", "127.0.0.1"),
            port: env_parse("PORT", 8787),
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> EngineResult<()> {
        if !self.mock_mode && self.llm_api_key.is_empty() {
            return Err(EngineError::Config(
                "LLM_API_KEY is required unless MOCK_MODE=true".into(),
            ));
        }
        if self.embedding_dimensions == 0 {
            return Err(EngineError::Config("EMBEDDING_DIMENSIONS must be > 0".into()));
        }
        if self.working_hours_start >= self.working_hours_end || self.working_hours_end > 24 {
            return Err(EngineError::Config(format!(
                "invalid working hours {}..{}",
                self.working_hours_start, self.working_hours_end
            )));
        }
        if self.max_iterations == 0 {
            return Err(EngineError::Config("MAX_ITERATIONS must be >= 1".into()));
        }
        Ok(())
    }

    /// A settings value suitable for tests: mock mode, in-memory paths,
    /// tiny limits.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Settings {
            db_path: PathBuf::from(":memory:"),
            embedding_dimensions: 8,
            llm_base_url: "http://127.0.0.1:0".into(),
            llm_api_key: String::new(),
            llm_chat_model: "test-model".into(),
            llm_router_model: String::new(),
            temperature: 0.0,
            embed_model: "test-embed".into(),
            cache_enabled: true,
            cache_ttl_secs: 3600,
            cache_max_size: 16,
            stt_base_url: String::new(),
            stt_api_key: String::new(),
            stt_model: String::new(),
            tts_base_url: String::new(),
            tts_voice: "default".into(),
            voice_sample_rate: 24_000,
            tts_first_chunk_timeout_ms: 2_000,
            min_transcription_chars: 3,
            smtp_host: String::new(),
            smtp_port: 587,
            smtp_user: String::new(),
            smtp_pass: String::new(),
            imap_host: String::new(),
            imap_port: 993,
            imap_user: String::new(),
            imap_pass: String::new(),
            messenger_base_url: String::new(),
            messenger_token: String::new(),
            messenger_from: String::new(),
            messenger_webhook_secret: "test-secret".into(),
            calendly_api_key: String::new(),
            calendly_webhook_secret: "test-secret".into(),
            mcp_servers_path: None,
            mcp_mapping_path: None,
            mcp_pool_size: 10,
            mcp_idle_timeout_secs: 300,
            mcp_cooldown_secs: 30,
            mcp_tool_timeout_secs: 20,
            max_iterations: 5,
            default_top_k: 6,
            min_similarity: 0.0,
            working_hours_start: 9,
            working_hours_end: 19,
            max_lookahead_days: 365,
            request_deadline_secs: 30,
            mock_mode: true,
            dev_mode: false,
            bind_address: "127.0.0.1".into(),
            port: 0,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_validate_rejects_bad_hours() {
        let mut s = Settings::for_tests();
        s.working_hours_start = 19;
        s.working_hours_end = 9;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_settings_validate_requires_llm_key_without_mock() {
        let mut s = Settings::for_tests();
        s.mock_mode = false;
        s.llm_api_key = String::new();
        assert!(matches!(s.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_settings_defaults_pass_validation() {
        let s = Settings::for_tests();
        assert!(s.validate().is_ok());
        assert_eq!(s.max_iterations, 5);
        assert_eq!(s.cache_max_size, 16);
    }
}
