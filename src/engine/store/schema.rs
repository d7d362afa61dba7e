// Database schema and migrations for the Concierge store.
// Adding a new table or column: append an idempotent CREATE TABLE IF NOT
// EXISTS or ALTER TABLE … ADD COLUMN at the end of run_migrations() —
// never modify existing SQL to keep upgrade paths clean.

use crate::atoms::error::EngineResult;
use rusqlite::Connection;

pub(crate) fn run_migrations(conn: &Connection) -> EngineResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS store_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS semantic_chunks (
            chunk_id TEXT PRIMARY KEY,
            source TEXT NOT NULL DEFAULT '',
            text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_chunks_source
            ON semantic_chunks(source);

        CREATE TABLE IF NOT EXISTS conversation_messages (
            message_sid TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            from_number TEXT NOT NULL DEFAULT '',
            to_number TEXT NOT NULL DEFAULT '',
            body TEXT NOT NULL DEFAULT '',
            received_at TEXT NOT NULL DEFAULT (datetime('now')),
            processed INTEGER NOT NULL DEFAULT 0,
            event_extracted INTEGER NOT NULL DEFAULT 0,
            linked_event_id INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON conversation_messages(conversation_id, received_at);

        CREATE TABLE IF NOT EXISTS extracted_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL DEFAULT '',
            title TEXT NOT NULL,
            start_at TEXT,
            end_at TEXT,
            timezone TEXT NOT NULL DEFAULT 'UTC',
            location TEXT,
            attendees TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL DEFAULT 'proposed',
            confidence REAL NOT NULL DEFAULT 0.5,
            relevance_score REAL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_extracted_start
            ON extracted_events(start_at);

        CREATE TABLE IF NOT EXISTS calendar_events (
            provider TEXT NOT NULL,
            provider_event_id TEXT NOT NULL,
            calendar_id TEXT NOT NULL DEFAULT 'primary',
            title TEXT NOT NULL DEFAULT '',
            start_at TEXT NOT NULL,
            end_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'confirmed',
            last_sync_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (provider, provider_event_id)
        );

        CREATE INDEX IF NOT EXISTS idx_calendar_start
            ON calendar_events(start_at);

        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            action TEXT NOT NULL,
            actor TEXT NOT NULL DEFAULT 'agent',
            payload TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;
    Ok(())
}

pub(crate) fn declared_embedding_dim(conn: &Connection) -> EngineResult<Option<usize>> {
    let dim: Option<String> = conn
        .query_row(
            "SELECT value FROM store_meta WHERE key = 'embedding_dim'",
            [],
            |r| r.get(0),
        )
        .ok();
    Ok(dim.and_then(|v| v.parse().ok()))
}

pub(crate) fn declare_embedding_dim(conn: &Connection, dim: usize) -> EngineResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO store_meta (key, value) VALUES ('embedding_dim', ?1)",
        [dim.to_string()],
    )?;
    Ok(())
}
