// Semantic chunk storage + similarity scan.
// Chunks are never mutated in place — supersede by inserting a new chunk_id.

use super::vector::{bytes_to_f32_vec, cosine_similarity, f32_vec_to_bytes};
use super::Store;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::RetrievedChunk;
use rusqlite::params;

impl Store {
    /// Insert a semantic chunk. Rejects vectors whose dimension differs
    /// from the one declared at store creation.
    pub fn insert_chunk(
        &self,
        chunk_id: &str,
        source: &str,
        text: &str,
        embedding: &[f32],
    ) -> EngineResult<()> {
        if embedding.len() != self.embedding_dim() {
            return Err(EngineError::Internal(format!(
                "chunk '{}' has dimension {} (store expects {})",
                chunk_id,
                embedding.len(),
                self.embedding_dim()
            )));
        }
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO semantic_chunks (chunk_id, source, text, embedding)
             VALUES (?1, ?2, ?3, ?4)",
            params![chunk_id, source, text, f32_vec_to_bytes(embedding)],
        )?;
        Ok(())
    }

    /// Cosine-similarity scan over all chunks (optionally filtered by
    /// source). Returns up to `limit` results with `similarity >= min`,
    /// best first. A query vector of the wrong dimension is rejected.
    pub fn search_chunks(
        &self,
        query_embedding: &[f32],
        limit: usize,
        min_similarity: f64,
        source_filter: Option<&str>,
    ) -> EngineResult<Vec<RetrievedChunk>> {
        if query_embedding.len() != self.embedding_dim() {
            return Err(EngineError::Internal(format!(
                "query vector has dimension {} (store expects {})",
                query_embedding.len(),
                self.embedding_dim()
            )));
        }
        if limit == 0 {
            return Ok(vec![]);
        }

        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT chunk_id, source, text, embedding FROM semantic_chunks",
        )?;

        let mut scored: Vec<RetrievedChunk> = stmt
            .query_map([], |row| {
                let chunk_id: String = row.get(0)?;
                let source: String = row.get(1)?;
                let text: String = row.get(2)?;
                let blob: Vec<u8> = row.get(3)?;
                Ok((chunk_id, source, text, blob))
            })?
            .filter_map(|r| r.ok())
            .filter(|(_, source, _, _)| source_filter.map_or(true, |f| source == f))
            .filter_map(|(chunk_id, source, text, blob)| {
                let similarity =
                    cosine_similarity(query_embedding, &bytes_to_f32_vec(&blob));
                if similarity >= min_similarity {
                    Some(RetrievedChunk { chunk_id, source, text, similarity })
                } else {
                    None
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        Ok(scored)
    }

    pub fn chunk_count(&self) -> EngineResult<i64> {
        let conn = self.conn();
        Ok(conn.query_row("SELECT COUNT(*) FROM semantic_chunks", [], |r| r.get(0))?)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
