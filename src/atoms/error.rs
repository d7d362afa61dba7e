// ── Concierge Atoms: Error Types ───────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by failure kind (Config, Transport,
//     Application, Policy, Cancelled, Internal) plus `#[from]` wiring for
//     the library errors that feed them.
//   • `kind()` collapses every variant to one of the reportable kinds used
//     in tool-result envelopes and audit records.
//   • No variant carries secret material (API keys, passwords) in its message.

use thiserror::Error;

// ── Reportable kinds ───────────────────────────────────────────────────────

/// Coarse failure classification carried on tool-result envelopes and
/// audit-log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorKind {
    Config,
    Transport,
    Application,
    Policy,
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Config => "CONFIG",
            ErrorKind::Transport => "TRANSPORT",
            ErrorKind::Application => "APPLICATION",
            ErrorKind::Policy => "POLICY",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Internal => "INTERNAL",
        };
        f.write_str(s)
    }
}

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// An external collaborator returned a documented failure
    /// (HTTP 4xx, JSON-RPC error object, SMTP rejection, …).
    #[error("Application error: {service}: {message}")]
    Application { service: String, message: String },

    /// Transport-level failure against an external collaborator that did
    /// not map to one of the library variants above (spawn failure,
    /// timeout, closed channel).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration is missing or invalid — fail fast at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An internal rule refused the action before any tool ran.
    #[error("Policy refusal: {0}")]
    Policy(String),

    /// User- or deadline-initiated cancellation. Never fatal.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Invariant violation or unhandled case.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Create an application error with service name and message.
    pub fn application(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Application { service: service.into(), message: message.into() }
    }

    /// Collapse to the reportable kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Config(_) => ErrorKind::Config,
            EngineError::Io(_)
            | EngineError::Network(_)
            | EngineError::Transport(_) => ErrorKind::Transport,
            EngineError::Application { .. } => ErrorKind::Application,
            EngineError::Policy(_) => ErrorKind::Policy,
            EngineError::Cancelled(_) => ErrorKind::Cancelled,
            EngineError::Serialization(_)
            | EngineError::Database(_)
            | EngineError::Internal(_) => ErrorKind::Internal,
        }
    }
}

// ── Migration bridge: String → EngineError ─────────────────────────────────
// Allows `?` on transport helpers still returning `Result<T, String>` inside
// functions that return `EngineResult<T>`.

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Transport(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Transport(s.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations should return this type.
pub type EngineResult<T> = Result<T, EngineError>;

impl From<EngineError> for String {
    fn from(e: EngineError) -> Self {
        e.to_string()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_taxonomy() {
        assert_eq!(EngineError::Config("x".into()).kind(), ErrorKind::Config);
        assert_eq!(EngineError::Transport("x".into()).kind(), ErrorKind::Transport);
        assert_eq!(
            EngineError::application("smtp", "550 rejected").kind(),
            ErrorKind::Application
        );
        assert_eq!(EngineError::Policy("x".into()).kind(), ErrorKind::Policy);
        assert_eq!(EngineError::Cancelled("x".into()).kind(), ErrorKind::Cancelled);
        assert_eq!(EngineError::Internal("x".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn string_bridge_is_transport() {
        let e: EngineError = "connection reset".to_string().into();
        assert_eq!(e.kind(), ErrorKind::Transport);
    }

    #[test]
    fn kind_serializes_uppercase() {
        let v = serde_json::to_value(ErrorKind::Application).unwrap();
        assert_eq!(v, serde_json::json!("APPLICATION"));
    }
}
