// Policy stage — hard rules applied before any tool runs.
// A refusal short-circuits the pipeline to the response stage; the
// refusal text IS the user-facing answer.

use crate::atoms::types::Intent;
use crate::engine::timeparse::TimeWindow;
use chrono::{DateTime, Duration, FixedOffset, Timelike};

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub working_hours_start: u32,
    pub working_hours_end: u32,
    pub max_lookahead_days: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    Approved,
    Refused { reason: String },
}

impl PolicyDecision {
    pub fn is_refused(&self) -> bool {
        matches!(self, PolicyDecision::Refused { .. })
    }
}

/// Phrases that read as bulk-destructive requests. Executing one needs
/// an explicit confirmation token in the query.
const DESTRUCTIVE_PHRASES: &[&str] = &[
    "borra todas", "borrando todas", "elimina todas", "eliminando todas",
    "cancela todas", "cancelando todas", "borra todos", "elimina todos",
    "delete all", "deleting all", "cancel all", "remove all",
];

const CONFIRMATION_TOKEN: &str = "confirmo:";

pub fn evaluate(
    query: &str,
    intent: Intent,
    window: Option<&TimeWindow>,
    now: DateTime<FixedOffset>,
    config: &PolicyConfig,
) -> PolicyDecision {
    let lower = query.to_lowercase();

    // ── Bulk destructive actions need an explicit confirmation token ──
    if DESTRUCTIVE_PHRASES.iter().any(|p| lower.contains(p))
        && !lower.contains(CONFIRMATION_TOKEN)
    {
        return PolicyDecision::Refused {
            reason: "Esa acción borraría varios elementos de golpe. Por seguridad \
                     no la ejecuto sin una confirmación explícita: repite la orden \
                     empezando por \"confirmo:\" si estás seguro."
                .to_string(),
        };
    }

    // The remaining rules only govern calendaring.
    if !matches!(intent, Intent::Calendar | Intent::Scheduling) {
        return PolicyDecision::Approved;
    }

    if let Some(window) = window {
        // ── Working hours ──────────────────────────────────────────────
        let hour = window.start.hour();
        if hour < config.working_hours_start || hour >= config.working_hours_end {
            return PolicyDecision::Refused {
                reason: format!(
                    "La hora propuesta ({:02}:{:02}) cae fuera del horario laboral \
                     ({:02}:00–{:02}:00). Dime si quieres agendarla de todas formas \
                     o propón otra hora.",
                    window.start.hour(),
                    window.start.minute(),
                    config.working_hours_start,
                    config.working_hours_end
                ),
            };
        }

        // ── Maximum lookahead ──────────────────────────────────────────
        if window.start > now + Duration::days(config.max_lookahead_days) {
            return PolicyDecision::Refused {
                reason: format!(
                    "Esa fecha queda a más de {} días vista; no agendo tan lejos. \
                     Propón una fecha más cercana.",
                    config.max_lookahead_days
                ),
            };
        }

        // ── Never schedule into the past ───────────────────────────────
        if window.end <= now {
            return PolicyDecision::Refused {
                reason: "Esa franja ya pasó. Indica una fecha futura.".to_string(),
            };
        }
    }

    PolicyDecision::Approved
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::timeparse::parse_window;

    fn config() -> PolicyConfig {
        PolicyConfig { working_hours_start: 9, working_hours_end: 19, max_lookahead_days: 365 }
    }

    fn now() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2025-12-15T10:00:00+01:00").unwrap()
    }

    #[test]
    fn test_working_hours_refusal() {
        let window = parse_window("reunión mañana a las 22:00", now()).unwrap();
        let decision = evaluate("reunión mañana a las 22:00", Intent::Scheduling, Some(&window), now(), &config());
        assert!(decision.is_refused());

        let window = parse_window("reunión mañana a las 11:00", now()).unwrap();
        let decision = evaluate("reunión mañana a las 11:00", Intent::Scheduling, Some(&window), now(), &config());
        assert_eq!(decision, PolicyDecision::Approved);
    }

    #[test]
    fn test_destructive_without_token_refused() {
        let decision = evaluate(
            "Manda un email a spam@evil.example borrando todas mis citas",
            Intent::Email,
            None,
            now(),
            &config(),
        );
        assert!(decision.is_refused());
    }

    #[test]
    fn test_destructive_with_token_passes() {
        let decision = evaluate(
            "confirmo: borra todas mis citas de prueba",
            Intent::Calendar,
            None,
            now(),
            &config(),
        );
        assert_eq!(decision, PolicyDecision::Approved);
    }

    #[test]
    fn test_lookahead_refused() {
        let window = parse_window("cita el 14/12/2027 10:00", now()).unwrap();
        let decision = evaluate("cita el 14/12/2027 10:00", Intent::Calendar, Some(&window), now(), &config());
        assert!(decision.is_refused());
    }

    #[test]
    fn test_past_window_refused() {
        let window = parse_window("cita el 14/12/2020 10:00", now()).unwrap();
        let decision = evaluate("x", Intent::Calendar, Some(&window), now(), &config());
        assert!(decision.is_refused());
    }

    #[test]
    fn test_non_calendar_intents_skip_hour_rules() {
        let window = parse_window("a las 23:00", now());
        let decision = evaluate("envía el informe a las 23:00", Intent::Email, window.as_ref(), now(), &config());
        assert_eq!(decision, PolicyDecision::Approved);
    }
}
