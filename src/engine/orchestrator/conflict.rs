// Conflict-check stage — for calendaring intents, find existing events
// that overlap the time window mentioned in the query and propose an
// alternative slot after the busy block.

use crate::atoms::error::EngineResult;
use crate::engine::store::Store;
use crate::engine::timeparse::TimeWindow;
use chrono::{DateTime, SecondsFormat};
use log::info;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ConflictInfo {
    pub title: String,
    pub start_at: String,
    pub end_at: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ConflictReport {
    pub window_start: Option<String>,
    pub window_end: Option<String>,
    pub conflicts: Vec<ConflictInfo>,
    /// First free slot of the same duration after the busy block.
    pub suggested_alternative: Option<String>,
}

impl ConflictReport {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Query both event tables for overlap with `window`.
pub fn check(store: &Store, window: &TimeWindow) -> EngineResult<ConflictReport> {
    let start = window.start.to_rfc3339_opts(SecondsFormat::Secs, true);
    let end = window.end.to_rfc3339_opts(SecondsFormat::Secs, true);

    let mut conflicts: Vec<ConflictInfo> = Vec::new();
    for ev in store.extracted_events_overlapping(&start, &end)? {
        conflicts.push(ConflictInfo {
            title: ev.title,
            start_at: ev.start_at.unwrap_or_default(),
            end_at: ev.end_at.unwrap_or_default(),
            source: ev.source,
        });
    }
    for ev in store.calendar_events_overlapping(&start, &end)? {
        conflicts.push(ConflictInfo {
            title: ev.title,
            start_at: ev.start_at,
            end_at: ev.end_at,
            source: ev.provider,
        });
    }

    let suggested_alternative = if conflicts.is_empty() {
        None
    } else {
        suggest_alternative(window, &conflicts)
    };

    info!(
        "[conflict] window {}..{} → {} conflict(s)",
        start,
        end,
        conflicts.len()
    );

    Ok(ConflictReport {
        window_start: Some(start),
        window_end: Some(end),
        conflicts,
        suggested_alternative,
    })
}

/// Next start instant after the busy block clears.
fn suggest_alternative(_window: &TimeWindow, conflicts: &[ConflictInfo]) -> Option<String> {
    let latest_end = conflicts
        .iter()
        .filter_map(|c| DateTime::parse_from_rfc3339(&c.end_at).ok())
        .max()?;
    Some(latest_end.to_rfc3339_opts(SecondsFormat::Secs, true))
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::EventStatus;
    use crate::engine::timeparse::parse_window;

    fn anchor() -> DateTime<chrono::FixedOffset> {
        DateTime::parse_from_rfc3339("2025-12-15T10:00:00+01:00").unwrap()
    }

    #[test]
    fn test_overlap_detected_and_alternative_suggested() {
        let store = Store::in_memory(4).unwrap();
        store
            .insert_extracted_event(
                "whatsapp",
                "Entrevista",
                Some("2025-12-16T11:00:00+01:00"),
                Some("2025-12-16T12:00:00+01:00"),
                "Europe/Madrid",
                None,
                &[],
                EventStatus::Confirmed,
                0.9,
            )
            .unwrap();

        let window = parse_window("Agenda reunión con Juan mañana a las 11:00", anchor()).unwrap();
        let report = check(&store, &window).unwrap();
        assert!(report.has_conflicts());
        assert_eq!(report.conflicts[0].title, "Entrevista");
        assert_eq!(
            report.suggested_alternative.as_deref(),
            Some("2025-12-16T12:00:00+01:00")
        );
    }

    #[test]
    fn test_free_window_is_clean() {
        let store = Store::in_memory(4).unwrap();
        let window = parse_window("reunión mañana a las 11:00", anchor()).unwrap();
        let report = check(&store, &window).unwrap();
        assert!(!report.has_conflicts());
        assert!(report.suggested_alternative.is_none());
    }
}
