// Concierge Engine — Retrieval Service
//
// Embeds the query, runs cosine nearest-neighbour over the chunk store,
// collapses near-duplicate chunks, and assembles the context block with
// citation tracking. An empty result set is a normal outcome, never an
// error.

use crate::atoms::error::EngineResult;
use crate::atoms::types::RetrievedChunk;
use crate::engine::embedding::EmbeddingService;
use crate::engine::store::Store;
use log::info;
use std::collections::HashSet;
use std::sync::Arc;

pub struct Retrieval {
    store: Arc<Store>,
    embeddings: Arc<EmbeddingService>,
}

impl Retrieval {
    pub fn new(store: Arc<Store>, embeddings: Arc<EmbeddingService>) -> Self {
        Retrieval { store, embeddings }
    }

    /// Top-K similarity search with dedup. Chunks whose `source` prefix
    /// before `#` matches collapse to the highest-similarity
    /// representative, so one document cannot crowd out the rest.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        min_similarity: f64,
        source_filter: Option<&str>,
    ) -> EngineResult<Vec<RetrievedChunk>> {
        if top_k == 0 {
            return Ok(vec![]);
        }

        let query_embedding = self.embeddings.embed(query).await?;

        // Over-fetch so dedup still fills top_k.
        let raw = self.store.search_chunks(
            &query_embedding,
            top_k * 4,
            min_similarity,
            source_filter,
        )?;

        let mut seen_prefixes: HashSet<String> = HashSet::new();
        let mut deduped = Vec::with_capacity(top_k);
        for chunk in raw {
            let prefix = dedup_prefix(&chunk.chunk_id);
            if seen_prefixes.insert(prefix) {
                deduped.push(chunk);
                if deduped.len() >= top_k {
                    break;
                }
            }
        }

        info!("[rag] query matched {} chunks (top_k={})", deduped.len(), top_k);
        Ok(deduped)
    }

    /// Concatenated context plus the citation list in first-appearance
    /// order. Each fragment is prefixed with its chunk id so the model
    /// can cite it back.
    pub fn assemble_context(chunks: &[RetrievedChunk]) -> (String, Vec<String>) {
        let mut citations = Vec::new();
        let mut parts = Vec::new();
        for chunk in chunks {
            if !citations.contains(&chunk.chunk_id) {
                citations.push(chunk.chunk_id.clone());
            }
            parts.push(format!("[{}] {}", chunk.chunk_id, chunk.text));
        }
        (parts.join("\n\n"), citations)
    }
}

/// Base id used for dedup: everything before the first `#`.
fn dedup_prefix(chunk_id: &str) -> String {
    chunk_id.split('#').next().unwrap_or(chunk_id).to_string()
}

// ── Tests ──────────────────────────────────────────────────────────────────
