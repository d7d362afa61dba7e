// Extracted / calendar event storage and the audit log.
// Event mutations and their audit record commit in one transaction.

use super::Store;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{CalendarEvent, EventStatus, ExtractedEvent};
use rusqlite::params;

fn row_to_extracted(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExtractedEvent> {
    let attendees_json: String = row.get(7)?;
    let status_str: String = row.get(8)?;
    Ok(ExtractedEvent {
        id: row.get(0)?,
        source: row.get(1)?,
        title: row.get(2)?,
        start_at: row.get(3)?,
        end_at: row.get(4)?,
        timezone: row.get(5)?,
        location: row.get(6)?,
        attendees: serde_json::from_str(&attendees_json).unwrap_or_default(),
        status: EventStatus::parse(&status_str).unwrap_or(EventStatus::Proposed),
        confidence: row.get(9)?,
        relevance_score: row.get(10)?,
    })
}

const EXTRACTED_COLUMNS: &str = "id, source, title, start_at, end_at, timezone, location, \
     attendees, status, confidence, relevance_score";

impl Store {
    // ── Extracted events ───────────────────────────────────────────────

    /// Insert a new extracted event and its audit record atomically.
    /// `end_at >= start_at` is enforced when both are present.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_extracted_event(
        &self,
        source: &str,
        title: &str,
        start_at: Option<&str>,
        end_at: Option<&str>,
        timezone: &str,
        location: Option<&str>,
        attendees: &[String],
        status: EventStatus,
        confidence: f64,
    ) -> EngineResult<i64> {
        if let (Some(s), Some(e)) = (start_at, end_at) {
            if e < s {
                return Err(EngineError::Internal(format!(
                    "event '{}': end_at {} precedes start_at {}",
                    title, e, s
                )));
            }
        }
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO extracted_events
                (source, title, start_at, end_at, timezone, location, attendees, status, confidence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                source,
                title,
                start_at,
                end_at,
                timezone,
                location,
                serde_json::to_string(attendees)?,
                status.as_str(),
                confidence
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO audit_log (action, actor, payload) VALUES ('event_insert', 'agent', ?1)",
            params![serde_json::json!({ "id": id, "title": title, "source": source }).to_string()],
        )?;
        tx.commit()?;
        Ok(id)
    }

    pub fn get_extracted_event(&self, id: i64) -> EngineResult<Option<ExtractedEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXTRACTED_COLUMNS} FROM extracted_events WHERE id = ?1"
        ))?;
        Ok(stmt.query_row(params![id], row_to_extracted).ok())
    }

    /// Forthcoming events ordered by start time. Events without a start
    /// time sort last.
    pub fn list_extracted_events(&self, limit: usize) -> EngineResult<Vec<ExtractedEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXTRACTED_COLUMNS} FROM extracted_events
             WHERE status != 'rejected'
             ORDER BY start_at IS NULL, start_at ASC LIMIT ?1"
        ))?;
        let events: Vec<ExtractedEvent> = stmt
            .query_map(params![limit as i64], row_to_extracted)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(events)
    }

    /// Transition an event's status (forward-only), auditing the change.
    /// `actor` is "agent" or "user".
    pub fn transition_event_status(
        &self,
        id: i64,
        next: EventStatus,
        actor: &str,
    ) -> EngineResult<ExtractedEvent> {
        let current = self
            .get_extracted_event(id)?
            .ok_or_else(|| EngineError::application("store", format!("event {} not found", id)))?;

        if !current.status.can_transition_to(next) {
            return Err(EngineError::application(
                "store",
                format!(
                    "event {}: illegal status transition {} → {}",
                    id,
                    current.status.as_str(),
                    next.as_str()
                ),
            ));
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE extracted_events SET status = ?2 WHERE id = ?1",
            params![id, next.as_str()],
        )?;
        tx.execute(
            "INSERT INTO audit_log (action, actor, payload) VALUES ('event_status', ?1, ?2)",
            params![
                actor,
                serde_json::json!({
                    "id": id,
                    "from": current.status.as_str(),
                    "to": next.as_str(),
                })
                .to_string()
            ],
        )?;
        tx.commit()?;

        drop(conn);
        Ok(self.get_extracted_event(id)?.expect("event row vanished mid-transition"))
    }

    /// Extracted events (not rejected) overlapping [window_start, window_end).
    pub fn extracted_events_overlapping(
        &self,
        window_start: &str,
        window_end: &str,
    ) -> EngineResult<Vec<ExtractedEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXTRACTED_COLUMNS} FROM extracted_events
             WHERE status != 'rejected'
               AND start_at IS NOT NULL AND end_at IS NOT NULL
               AND start_at < ?2 AND end_at > ?1
             ORDER BY start_at ASC"
        ))?;
        let events: Vec<ExtractedEvent> = stmt
            .query_map(params![window_start, window_end], row_to_extracted)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(events)
    }

    // ── Calendar events ────────────────────────────────────────────────

    /// Upsert keyed on (provider, provider_event_id) — webhook syncs
    /// replay safely.
    pub fn upsert_calendar_event(&self, ev: &CalendarEvent) -> EngineResult<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO calendar_events
                (provider, provider_event_id, calendar_id, title, start_at, end_at, status, last_sync_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(provider, provider_event_id) DO UPDATE SET
                calendar_id = excluded.calendar_id,
                title = excluded.title,
                start_at = excluded.start_at,
                end_at = excluded.end_at,
                status = excluded.status,
                last_sync_at = excluded.last_sync_at",
            params![
                ev.provider,
                ev.provider_event_id,
                ev.calendar_id,
                ev.title,
                ev.start_at,
                ev.end_at,
                ev.status,
                ev.last_sync_at
            ],
        )?;
        Ok(())
    }

    pub fn calendar_events_overlapping(
        &self,
        window_start: &str,
        window_end: &str,
    ) -> EngineResult<Vec<CalendarEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT provider, provider_event_id, calendar_id, title, start_at, end_at, status, last_sync_at
             FROM calendar_events
             WHERE status != 'cancelled' AND start_at < ?2 AND end_at > ?1
             ORDER BY start_at ASC",
        )?;
        let events: Vec<CalendarEvent> = stmt
            .query_map(params![window_start, window_end], |row| {
                Ok(CalendarEvent {
                    provider: row.get(0)?,
                    provider_event_id: row.get(1)?,
                    calendar_id: row.get(2)?,
                    title: row.get(3)?,
                    start_at: row.get(4)?,
                    end_at: row.get(5)?,
                    status: row.get(6)?,
                    last_sync_at: row.get(7)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(events)
    }

    // ── Audit log ──────────────────────────────────────────────────────

    pub fn audit(&self, action: &str, actor: &str, payload: serde_json::Value) -> EngineResult<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO audit_log (action, actor, payload) VALUES (?1, ?2, ?3)",
            params![action, actor, payload.to_string()],
        )?;
        Ok(())
    }

    pub fn audit_count(&self) -> EngineResult<i64> {
        let conn = self.conn();
        Ok(conn.query_row("SELECT COUNT(*) FROM audit_log", [], |r| r.get(0))?)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_basic(store: &Store, title: &str, start: &str, end: &str) -> i64 {
        store
            .insert_extracted_event(
                "whatsapp",
                title,
                Some(start),
                Some(end),
                "Europe/Madrid",
                None,
                &[],
                EventStatus::Proposed,
                0.8,
            )
            .unwrap()
    }

    #[test]
    fn test_insert_writes_audit_atomically() {
        let store = Store::in_memory(4).unwrap();
        let before = store.audit_count().unwrap();
        insert_basic(&store, "Entrevista", "2025-12-16T11:00:00+01:00", "2025-12-16T12:00:00+01:00");
        assert_eq!(store.audit_count().unwrap(), before + 1);
    }

    #[test]
    fn test_end_before_start_rejected() {
        let store = Store::in_memory(4).unwrap();
        let res = store.insert_extracted_event(
            "s",
            "t",
            Some("2025-12-16T12:00:00Z"),
            Some("2025-12-16T11:00:00Z"),
            "UTC",
            None,
            &[],
            EventStatus::Proposed,
            0.5,
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_status_transitions_enforced() {
        let store = Store::in_memory(4).unwrap();
        let id = insert_basic(&store, "Demo", "2025-12-16T11:00:00Z", "2025-12-16T12:00:00Z");

        let ev = store.transition_event_status(id, EventStatus::Confirmed, "user").unwrap();
        assert_eq!(ev.status, EventStatus::Confirmed);

        let ev = store.transition_event_status(id, EventStatus::Created, "agent").unwrap();
        assert_eq!(ev.status, EventStatus::Created);

        // created is terminal
        assert!(store.transition_event_status(id, EventStatus::Rejected, "user").is_err());
    }

    #[test]
    fn test_overlap_query() {
        let store = Store::in_memory(4).unwrap();
        insert_basic(&store, "A", "2025-12-16T11:00:00Z", "2025-12-16T12:00:00Z");
        insert_basic(&store, "B", "2025-12-16T15:00:00Z", "2025-12-16T16:00:00Z");

        let hits = store
            .extracted_events_overlapping("2025-12-16T11:30:00Z", "2025-12-16T12:30:00Z")
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "A");

        // touching boundary is not an overlap
        let hits = store
            .extracted_events_overlapping("2025-12-16T12:00:00Z", "2025-12-16T13:00:00Z")
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_calendar_upsert_is_idempotent() {
        let store = Store::in_memory(4).unwrap();
        let ev = CalendarEvent {
            provider: "google".into(),
            provider_event_id: "abc123".into(),
            calendar_id: "primary".into(),
            title: "Sync".into(),
            start_at: "2025-12-16T11:00:00Z".into(),
            end_at: "2025-12-16T12:00:00Z".into(),
            status: "confirmed".into(),
            last_sync_at: "2025-12-15T00:00:00Z".into(),
        };
        store.upsert_calendar_event(&ev).unwrap();
        let mut updated = ev.clone();
        updated.title = "Sync (moved)".into();
        store.upsert_calendar_event(&updated).unwrap();

        let hits = store
            .calendar_events_overlapping("2025-12-16T00:00:00Z", "2025-12-17T00:00:00Z")
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Sync (moved)");
    }
}
