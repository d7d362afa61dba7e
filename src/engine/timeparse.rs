// Concierge Engine — Time-Expression Parser
//
// Extracts a concrete [start, end) window from free text, Spanish or
// English: explicit dates (dd/mm/yyyy, ISO), hh:mm times and ranges,
// weekday names, and relative day words (hoy / mañana / tomorrow).
// All resolution is relative to an anchor instant — for chat messages
// that is the message's received_at, so old messages resolve against
// when they were written.

use chrono::{DateTime, Datelike, Duration, FixedOffset, TimeZone, Timelike};
use regex::Regex;
use std::sync::OnceLock;

const WEEKDAYS: &[(&str, u32)] = &[
    // Spanish
    ("lunes", 0),
    ("martes", 1),
    ("miércoles", 2),
    ("miercoles", 2),
    ("jueves", 3),
    ("viernes", 4),
    ("sábado", 5),
    ("sabado", 5),
    ("domingo", 6),
    // English
    ("monday", 0),
    ("tuesday", 1),
    ("wednesday", 2),
    ("thursday", 3),
    ("friday", 4),
    ("saturday", 5),
    ("sunday", 6),
];

const RELATIVE_DAYS: &[(&str, i64)] = &[
    ("pasado mañana", 2),
    ("pasado manana", 2),
    ("day after tomorrow", 2),
    ("hoy", 0),
    ("today", 0),
    ("mañana", 1),
    ("manana", 1),
    ("tomorrow", 1),
];

fn time_range_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?P<h1>\d{1,2}):(?P<m1>\d{2})\s*[-–]\s*(?P<h2>\d{1,2}):(?P<m2>\d{2})")
            .expect("range regex")
    })
}

fn date_dmy_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?P<d>\d{1,2})[/-](?P<m>\d{1,2})[/-](?P<y>\d{2,4})(?:[ T](?P<h>\d{1,2}):(?P<min>\d{2}))?",
        )
        .expect("dmy regex")
    })
}

fn date_iso_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?P<y>\d{4})-(?P<m>\d{2})-(?P<d>\d{2})(?:[ T](?P<h>\d{2}):(?P<min>\d{2}))?")
            .expect("iso regex")
    })
}

fn time_only_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:\b|a las |at )(?P<h>\d{1,2}):(?P<min>\d{2})\b").expect("time regex")
    })
}

/// Bare hour forms like "a las 11" / "at 5" (no minutes).
fn hour_word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:a las|a la|at)\s+(?P<h>\d{1,2})\b").expect("hour regex"))
}

/// A parsed window, start inclusive, end exclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeWindow {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

/// Shift `from` forward to the next occurrence of the target weekday
/// (0 = Monday). Same-day never matches — "el viernes" said on a Friday
/// means next week.
fn next_weekday(from: DateTime<FixedOffset>, target: u32) -> DateTime<FixedOffset> {
    let current = from.weekday().num_days_from_monday();
    let mut ahead = target as i64 - current as i64;
    if ahead <= 0 {
        ahead += 7;
    }
    from + Duration::days(ahead)
}

fn weekday_in(text: &str) -> Option<u32> {
    WEEKDAYS.iter().find(|(name, _)| text.contains(name)).map(|(_, idx)| *idx)
}

fn relative_in(text: &str) -> Option<i64> {
    RELATIVE_DAYS.iter().find(|(name, _)| text.contains(name)).map(|(_, off)| *off)
}

fn at_time(anchor: DateTime<FixedOffset>, hour: u32, minute: u32) -> Option<DateTime<FixedOffset>> {
    anchor
        .with_hour(hour)
        .and_then(|d| d.with_minute(minute))
        .and_then(|d| d.with_second(0))
        .and_then(|d| d.with_nanosecond(0))
}

fn apply_day_words(
    text: &str,
    base: DateTime<FixedOffset>,
) -> DateTime<FixedOffset> {
    let mut dt = base;
    if let Some(wd) = weekday_in(text) {
        dt = next_weekday(dt, wd);
    } else if let Some(offset) = relative_in(text) {
        dt = dt + Duration::days(offset);
    }
    dt
}

/// Extract a time window from `text`, resolving relative expressions
/// against `anchor`. Returns None when no date or time is present.
pub fn parse_window(text: &str, anchor: DateTime<FixedOffset>) -> Option<TimeWindow> {
    let lower = text.to_lowercase();

    // Explicit hh:mm–hh:mm range
    if let Some(caps) = time_range_re().captures(&lower) {
        let h1: u32 = caps["h1"].parse().ok()?;
        let m1: u32 = caps["m1"].parse().ok()?;
        let h2: u32 = caps["h2"].parse().ok()?;
        let m2: u32 = caps["m2"].parse().ok()?;
        let start = apply_day_words(&lower, at_time(anchor, h1.min(23), m1.min(59))?);
        let end = apply_day_words(&lower, at_time(anchor, h2.min(23), m2.min(59))?);
        if end > start {
            return Some(TimeWindow { start, end });
        }
    }

    // Full date, ISO or dd/mm/yyyy, optionally with a time. ISO goes
    // first: the dd/mm pattern would otherwise bite into "2025-12-20".
    for re in [date_iso_re(), date_dmy_re()] {
        if let Some(caps) = re.captures(&lower) {
            let mut y: i32 = caps["y"].parse().ok()?;
            if y < 100 {
                y += 2000;
            }
            let m: u32 = caps["m"].parse().ok()?;
            let d: u32 = caps["d"].parse().ok()?;
            let h: u32 = caps.name("h").and_then(|v| v.as_str().parse().ok()).unwrap_or(9);
            let min: u32 = caps.name("min").and_then(|v| v.as_str().parse().ok()).unwrap_or(0);
            let start = anchor.timezone().with_ymd_and_hms(y, m, d, h.min(23), min.min(59), 0);
            let start = start.single()?;
            return Some(TimeWindow { start, end: start + Duration::hours(1) });
        }
    }

    // Time only (hh:mm), day resolved from weekday / relative words
    if let Some(caps) = time_only_re().captures(&lower) {
        let h: u32 = caps["h"].parse().ok()?;
        let min: u32 = caps["min"].parse().ok()?;
        let start = apply_day_words(&lower, at_time(anchor, h.min(23), min.min(59))?);
        return Some(TimeWindow { start, end: start + Duration::hours(1) });
    }

    // Bare hour ("a las 11") requires a day word to disambiguate noise
    if let Some(caps) = hour_word_re().captures(&lower) {
        let h: u32 = caps["h"].parse().ok()?;
        if h < 24 && (weekday_in(&lower).is_some() || relative_in(&lower).is_some()) {
            let start = apply_day_words(&lower, at_time(anchor, h, 0)?);
            return Some(TimeWindow { start, end: start + Duration::hours(1) });
        }
    }

    None
}

const EVENT_KEYWORDS: &[&str] = &[
    "reunión", "reunion", "meeting", "cita", "appointment", "agenda", "agendar",
    "programar", "schedule", "evento", "event", "llamada", "call", "videollamada",
    "entrevista", "interview", "presentación", "presentacion",
];

/// Detect appointment intent: a parseable date/time qualifies on its own;
/// an event keyword alongside it raises the confidence.
pub fn event_signal(text: &str, anchor: DateTime<FixedOffset>) -> Option<(TimeWindow, f64)> {
    let window = parse_window(text, anchor)?;
    let lower = text.to_lowercase();
    let has_keyword = EVENT_KEYWORDS.iter().any(|k| lower.contains(k));
    Some((window, if has_keyword { 0.9 } else { 0.6 }))
}

/// Title heuristics: first line when long enough (emoji-stripped),
/// otherwise the first few words.
pub fn extract_title(text: &str) -> String {
    let first_line = text.trim().lines().next().unwrap_or("").trim();
    let cleaned: String = first_line
        .chars()
        .filter(|c| !matches!(c, '📅' | '🕐' | '📌' | '✅' | '❌'))
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.chars().count() > 5 {
        return cleaned.chars().take(100).collect();
    }
    let words: Vec<&str> = text.split_whitespace().take(5).collect();
    if words.is_empty() {
        "Evento".to_string()
    } else {
        words.join(" ").chars().take(100).collect()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor() -> DateTime<FixedOffset> {
        // Monday 2025-12-15 10:00 +01:00
        DateTime::parse_from_rfc3339("2025-12-15T10:00:00+01:00").unwrap()
    }

    #[test]
    fn test_tomorrow_with_hour() {
        let w = parse_window("Agenda reunión con Juan mañana a las 11:00", anchor()).unwrap();
        assert_eq!(w.start.to_rfc3339(), "2025-12-16T11:00:00+01:00");
        assert_eq!(w.end - w.start, Duration::hours(1));
    }

    #[test]
    fn test_bare_hour_with_relative_day() {
        let w = parse_window("reunión mañana a las 11", anchor()).unwrap();
        assert_eq!(w.start.hour(), 11);
        assert_eq!(w.start.day(), 16);
    }

    #[test]
    fn test_next_friday_at_ten() {
        let w = parse_window("El viernes a las 10:00", anchor()).unwrap();
        // anchor is Monday the 15th → Friday the 19th
        assert_eq!(w.start.to_rfc3339(), "2025-12-19T10:00:00+01:00");
    }

    #[test]
    fn test_same_weekday_rolls_a_week() {
        // anchor is a Monday; "lunes" must mean the NEXT Monday
        let w = parse_window("el lunes a las 09:00", anchor()).unwrap();
        assert_eq!(w.start.day(), 22);
    }

    #[test]
    fn test_explicit_range() {
        let w = parse_window("disponible 16:00-17:30 mañana", anchor()).unwrap();
        assert_eq!(w.start.hour(), 16);
        assert_eq!(w.end.hour(), 17);
        assert_eq!(w.end.minute(), 30);
        assert_eq!(w.start.day(), 16);
    }

    #[test]
    fn test_dmy_date_with_time() {
        let w = parse_window("cita el 14/12/2025 16:00", anchor()).unwrap();
        assert_eq!(w.start.to_rfc3339(), "2025-12-14T16:00:00+01:00");
    }

    #[test]
    fn test_two_digit_year() {
        let w = parse_window("el 14-12-25 16:00", anchor()).unwrap();
        assert_eq!(w.start.year(), 2025);
    }

    #[test]
    fn test_iso_date_defaults_morning() {
        let w = parse_window("revisión 2025-12-20", anchor()).unwrap();
        assert_eq!(w.start.hour(), 9);
        assert_eq!(w.start.day(), 20);
    }

    #[test]
    fn test_no_window_in_plain_text() {
        assert!(parse_window("Hola", anchor()).is_none());
        assert!(parse_window("gracias por todo", anchor()).is_none());
    }

    #[test]
    fn test_title_extraction() {
        assert_eq!(extract_title("Revisión del proyecto\nel viernes"), "Revisión del proyecto");
        assert_eq!(extract_title("📅 Demo con cliente"), "Demo con cliente");
        assert_eq!(extract_title("ok"), "ok");
    }

    #[test]
    fn test_event_signal_requires_window() {
        let (_, conf) = event_signal("reunión el viernes a las 10:00", anchor()).unwrap();
        assert!(conf > 0.8);
        let (_, conf) = event_signal("El viernes a las 10:00", anchor()).unwrap();
        assert!(conf < 0.8);
        assert!(event_signal("hablamos de todo un poco", anchor()).is_none());
    }
}
