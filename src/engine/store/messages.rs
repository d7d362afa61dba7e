// Conversation message storage. `message_sid` is the webhook idempotency
// key: duplicate deliveries are silent no-ops.

use super::Store;
use crate::atoms::error::EngineResult;
use crate::atoms::types::ConversationMessage;
use rusqlite::params;

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationMessage> {
    Ok(ConversationMessage {
        message_sid: row.get(0)?,
        conversation_id: row.get(1)?,
        from_number: row.get(2)?,
        to_number: row.get(3)?,
        body: row.get(4)?,
        received_at: row.get(5)?,
        processed: row.get::<_, i64>(6)? != 0,
        event_extracted: row.get::<_, i64>(7)? != 0,
        linked_event_id: row.get(8)?,
    })
}

const MESSAGE_COLUMNS: &str = "message_sid, conversation_id, from_number, to_number, body, \
     received_at, processed, event_extracted, linked_event_id";

impl Store {
    /// Insert a message idempotently. Returns true if the row was new,
    /// false when the sid was already present (duplicate delivery).
    pub fn insert_message(
        &self,
        message_sid: &str,
        conversation_id: &str,
        from_number: &str,
        to_number: &str,
        body: &str,
        received_at: &str,
    ) -> EngineResult<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO conversation_messages
                (message_sid, conversation_id, from_number, to_number, body, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![message_sid, conversation_id, from_number, to_number, body, received_at],
        )?;
        Ok(changed > 0)
    }

    /// Last `limit` messages of a conversation, oldest first.
    pub fn conversation_tail(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> EngineResult<Vec<ConversationMessage>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM conversation_messages
             WHERE conversation_id = ?1
             ORDER BY received_at DESC, message_sid DESC LIMIT ?2"
        ))?;
        let mut rows: Vec<ConversationMessage> = stmt
            .query_map(params![conversation_id, limit as i64], row_to_message)?
            .filter_map(|r| r.ok())
            .collect();
        rows.reverse();
        Ok(rows)
    }

    pub fn get_message(&self, message_sid: &str) -> EngineResult<Option<ConversationMessage>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM conversation_messages WHERE message_sid = ?1"
        ))?;
        Ok(stmt.query_row(params![message_sid], row_to_message).ok())
    }

    /// Flip processed / event linkage flags after analysis.
    pub fn mark_message_processed(
        &self,
        message_sid: &str,
        event_extracted: bool,
        linked_event_id: Option<i64>,
    ) -> EngineResult<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE conversation_messages
             SET processed = 1, event_extracted = ?2, linked_event_id = ?3
             WHERE message_sid = ?1",
            params![message_sid, event_extracted as i64, linked_event_id],
        )?;
        Ok(())
    }

    /// Conversation ids that still have unprocessed messages.
    pub fn conversations_with_unprocessed(&self) -> EngineResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT conversation_id FROM conversation_messages WHERE processed = 0",
        )?;
        let ids: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    /// All conversation ids (for a full batch re-scan).
    pub fn all_conversations(&self) -> EngineResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT DISTINCT conversation_id FROM conversation_messages")?;
        let ids: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_sid_is_silent_noop() {
        let store = Store::in_memory(4).unwrap();
        let first = store
            .insert_message("SM1", "+34600", "+34600", "+1555", "hola", "2025-12-15T10:00:00Z")
            .unwrap();
        let second = store
            .insert_message("SM1", "+34600", "+34600", "+1555", "hola", "2025-12-15T10:00:00Z")
            .unwrap();
        assert!(first);
        assert!(!second);

        let tail = store.conversation_tail("+34600", 10).unwrap();
        assert_eq!(tail.len(), 1);
    }

    #[test]
    fn test_tail_is_oldest_first_and_bounded() {
        let store = Store::in_memory(4).unwrap();
        for i in 0..5 {
            store
                .insert_message(
                    &format!("SM{i}"),
                    "conv",
                    "a",
                    "b",
                    &format!("m{i}"),
                    &format!("2025-12-15T10:0{i}:00Z"),
                )
                .unwrap();
        }
        let tail = store.conversation_tail("conv", 3).unwrap();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].body, "m2");
        assert_eq!(tail[2].body, "m4");
    }

    #[test]
    fn test_mark_processed_links_event() {
        let store = Store::in_memory(4).unwrap();
        store
            .insert_message("SM1", "c", "a", "b", "reunión viernes 10:00", "2025-12-15T10:00:00Z")
            .unwrap();
        store.mark_message_processed("SM1", true, Some(42)).unwrap();

        let msg = store.get_message("SM1").unwrap().unwrap();
        assert!(msg.processed);
        assert!(msg.event_extracted);
        assert_eq!(msg.linked_event_id, Some(42));
        assert!(store.conversations_with_unprocessed().unwrap().is_empty());
    }
}
