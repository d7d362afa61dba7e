// Intent routing — two tiers.
// A keyword pass over a static Spanish/English lexicon decides the easy
// cases; when it abstains, a tiny completion with the router model picks
// from the closed intent set. The final default is GENERAL.
//
// Ordering matters: scheduling-link words outrank calendar so "calendly"
// never routes as a plain calendar request, and email outranks calendar
// so "leer el correo de la reunión" stays an email intent.

use crate::atoms::types::Intent;
use crate::engine::llm::LlmClient;
use log::{debug, info};

const SCHEDULING_KEYWORDS: &[&str] = &[
    "calendly", "disponibilidad", "availability", "scheduling link", "enlace de reserva",
    "hueco libre",
];

/// Booking verbs: the user is asking to PLACE a meeting, not to read the
/// agenda. "agenda" as a bare noun stays a calendar intent.
const BOOKING_KEYWORDS: &[&str] = &[
    "agendar", "agenda reunión", "agenda reunion", "agenda una", "agéndame", "agendame",
    "programar", "programa una", "reservar", "book a", "schedule a", "crear evento",
    "crea un evento", "crea una reunión", "crea una reunion",
];

const EMAIL_KEYWORDS: &[&str] = &[
    "email", "correo", "mail", "inbox", "bandeja de entrada", "asunto",
];

const COMMS_KEYWORDS: &[&str] = &[
    "whatsapp", "mensaje", "message", "notificación", "notificacion", "escríbele",
    "escribele", "avisa a",
];

const CALENDAR_KEYWORDS: &[&str] = &[
    "calendar", "calendario", "agenda", "agendar", "reunión", "reunion", "cita",
    "meeting", "evento", "appointment",
];

/// Rule pass: returns None when no lexicon entry matches (abstain).
pub fn classify_rules(query: &str) -> Option<Intent> {
    let q = query.to_lowercase();
    let hit = |keywords: &[&str]| keywords.iter().any(|k| q.contains(k));

    if hit(SCHEDULING_KEYWORDS) {
        return Some(Intent::Scheduling);
    }
    if hit(EMAIL_KEYWORDS) {
        return Some(Intent::Email);
    }
    if hit(COMMS_KEYWORDS) {
        return Some(Intent::Comms);
    }
    if hit(BOOKING_KEYWORDS) {
        return Some(Intent::Scheduling);
    }
    if hit(CALENDAR_KEYWORDS) {
        return Some(Intent::Calendar);
    }
    None
}

fn parse_router_answer(answer: &str) -> Option<Intent> {
    let a = answer.trim().to_lowercase();
    for (word, intent) in [
        ("calendar", Intent::Calendar),
        ("email", Intent::Email),
        ("scheduling", Intent::Scheduling),
        ("comms", Intent::Comms),
        ("general", Intent::General),
    ] {
        if a.starts_with(word) {
            return Some(intent);
        }
    }
    None
}

/// Full two-tier classification.
pub async fn classify(query: &str, llm: &LlmClient, use_llm_fallback: bool) -> Intent {
    if let Some(intent) = classify_rules(query) {
        info!("[intent] rules: '{}' → {}", crate::atoms::types::truncate_utf8(query, 60), intent.as_str());
        return intent;
    }

    if use_llm_fallback && llm.has_router_model() {
        let prompt = format!(
            "Clasifica la intención del usuario en una de: calendar, email, \
             scheduling, comms, general.\nUsuario: {}\nResponde solo con una \
             palabra de esa lista.",
            query
        );
        match llm.route(&prompt).await {
            Ok(answer) => {
                if let Some(intent) = parse_router_answer(&answer) {
                    info!("[intent] router model → {}", intent.as_str());
                    return intent;
                }
                debug!("[intent] router answer unusable: '{}'", answer);
            }
            Err(e) => debug!("[intent] router call failed: {}", e),
        }
    }

    Intent::General
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calendar_queries() {
        assert_eq!(classify_rules("¿Qué tengo en la agenda mañana?"), Some(Intent::Calendar));
        assert_eq!(classify_rules("lista mis próximas citas"), Some(Intent::Calendar));
    }

    #[test]
    fn test_booking_verbs_are_scheduling() {
        assert_eq!(
            classify_rules("Agenda reunión con Juan mañana a las 11"),
            Some(Intent::Scheduling)
        );
        assert_eq!(classify_rules("schedule a meeting with Ana"), Some(Intent::Scheduling));
    }

    #[test]
    fn test_scheduling_outranks_calendar() {
        assert_eq!(
            classify_rules("crea un evento en calendly para la reunión"),
            Some(Intent::Scheduling)
        );
        assert_eq!(classify_rules("consulta mi disponibilidad"), Some(Intent::Scheduling));
    }

    #[test]
    fn test_email_outranks_calendar() {
        assert_eq!(
            classify_rules("busca el correo sobre la reunión del viernes"),
            Some(Intent::Email)
        );
    }

    #[test]
    fn test_comms() {
        assert_eq!(
            classify_rules("envíale un whatsapp a Juan"),
            Some(Intent::Comms)
        );
    }

    #[test]
    fn test_abstains_on_general() {
        assert_eq!(classify_rules("¿qué tiempo hace hoy?"), None);
        assert_eq!(classify_rules("cuéntame un chiste"), None);
    }

    #[test]
    fn test_router_answer_parsing() {
        assert_eq!(parse_router_answer(" Calendar\n"), Some(Intent::Calendar));
        assert_eq!(parse_router_answer("general."), Some(Intent::General));
        assert_eq!(parse_router_answer("no sé"), None);
    }
}
