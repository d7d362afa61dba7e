// Concierge Engine — Embedding Service
//
// Produces query vectors via an OpenAI-compatible embeddings API, fronted
// by a bounded LRU+TTL cache. Concurrent misses on the same fingerprint
// coalesce so only one outbound call is in flight per key.
//
// Module layout:
//   cache.rs — fingerprinting + LRU/TTL cache with stat counters
//   mod.rs   — Embedder trait, HTTP + mock backends, EmbeddingService

pub mod cache;

pub use cache::{fingerprint, EmbeddingCache};

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::config::Settings;
use async_trait::async_trait;
use log::{debug, info};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

const EMBED_TIMEOUT: Duration = Duration::from_secs(10);

/// Backend that turns text into a raw vector (dimension not yet fixed).
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_raw(&self, text: &str) -> EngineResult<Vec<f32>>;
}

// ── HTTP backend ───────────────────────────────────────────────────────────

/// OpenAI-compatible embeddings endpoint: POST /v1/embeddings.
pub struct HttpEmbedder {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpEmbedder {
    pub fn new(settings: &Settings) -> Self {
        HttpEmbedder {
            client: Client::new(),
            base_url: settings.llm_base_url.trim_end_matches('/').to_string(),
            api_key: settings.llm_api_key.clone(),
            model: settings.embed_model.clone(),
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_raw(&self, text: &str) -> EngineResult<Vec<f32>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let body = json!({ "model": self.model, "input": text });

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .timeout(EMBED_TIMEOUT)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(EngineError::application(
                "embeddings",
                format!("{} — {}", status, crate::atoms::types::truncate_utf8(&text, 200)),
            ));
        }

        let v: Value = resp.json().await?;
        let embedding = v["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| EngineError::application("embeddings", "no data[0].embedding in response"))?;

        let vec: Vec<f32> = embedding
            .iter()
            .filter_map(|x| x.as_f64().map(|f| f as f32))
            .collect();
        if vec.is_empty() {
            return Err(EngineError::application("embeddings", "empty embedding vector"));
        }
        Ok(vec)
    }
}

// ── Mock backend ───────────────────────────────────────────────────────────

/// Deterministic vectors derived from the text fingerprint. Identical
/// texts always map to identical vectors, so top-1 self-retrieval holds.
pub struct MockEmbedder {
    dimensions: usize,
}

impl MockEmbedder {
    pub fn new(dimensions: usize) -> Self {
        MockEmbedder { dimensions }
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed_raw(&self, text: &str) -> EngineResult<Vec<f32>> {
        let mut seed = fingerprint(text);
        let mut v = Vec::with_capacity(self.dimensions);
        for _ in 0..self.dimensions {
            // xorshift64 walk over the fingerprint
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            v.push(((seed % 2000) as f32 / 1000.0) - 1.0);
        }
        Ok(v)
    }
}

// ── Service ────────────────────────────────────────────────────────────────

type InflightSlot = watch::Receiver<Option<Result<Vec<f32>, String>>>;

/// Cache-fronted embedding service with per-key request coalescing.
pub struct EmbeddingService {
    backend: Arc<dyn Embedder>,
    cache: EmbeddingCache,
    dimensions: usize,
    inflight: Mutex<HashMap<u64, InflightSlot>>,
}

impl EmbeddingService {
    pub fn new(backend: Arc<dyn Embedder>, settings: &Settings) -> Self {
        info!(
            "[embed] cache enabled={} max_size={} ttl={}s dim={}",
            settings.cache_enabled,
            settings.cache_max_size,
            settings.cache_ttl_secs,
            settings.embedding_dimensions
        );
        EmbeddingService {
            backend,
            cache: EmbeddingCache::new(
                settings.cache_max_size,
                settings.cache_ttl_secs,
                settings.cache_enabled,
            ),
            dimensions: settings.embedding_dimensions,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Embed one text, fixed to the configured dimension. Cache hits skip
    /// the backend entirely; concurrent misses on the same key share one
    /// backend call.
    pub async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        let key = fingerprint(text);
        if let Some(hit) = self.cache.get(key) {
            debug!("[embed] cache hit for {:#x}", key);
            return Ok(hit);
        }

        // Join an in-flight request for the same key, or claim the slot.
        let tx = {
            let mut inflight = self.inflight.lock().await;
            if let Some(rx) = inflight.get(&key) {
                let mut rx = rx.clone();
                drop(inflight);
                loop {
                    if let Some(outcome) = rx.borrow().clone() {
                        return outcome.map_err(EngineError::Transport);
                    }
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
                return Err(EngineError::Transport("coalesced embedding call dropped".into()));
            }
            let (tx, rx) = watch::channel(None);
            inflight.insert(key, rx);
            tx
        };

        let outcome = self.backend.embed_raw(text).await.map(|v| self.fix_dimensions(v));

        {
            let mut inflight = self.inflight.lock().await;
            inflight.remove(&key);
        }

        match &outcome {
            Ok(vec) => {
                self.cache.put(key, vec.clone());
                let _ = tx.send(Some(Ok(vec.clone())));
            }
            Err(e) => {
                let _ = tx.send(Some(Err(e.to_string())));
            }
        }
        outcome
    }

    /// Truncate or zero-pad to the store's declared dimension.
    fn fix_dimensions(&self, mut v: Vec<f32>) -> Vec<f32> {
        if v.len() > self.dimensions {
            v.truncate(self.dimensions);
        } else {
            while v.len() < self.dimensions {
                v.push(0.0);
            }
        }
        v
    }

    pub fn cache_stats(&self) -> serde_json::Value {
        self.cache.stats()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingEmbedder {
        calls: AtomicU64,
        dim: usize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed_raw(&self, text: &str) -> EngineResult<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // small delay widens the coalescing window
            tokio::time::sleep(Duration::from_millis(20)).await;
            MockEmbedder::new(self.dim).embed_raw(text).await
        }
    }

    fn service_with_counter(dim: usize) -> (Arc<CountingEmbedder>, EmbeddingService) {
        let backend = Arc::new(CountingEmbedder { calls: AtomicU64::new(0), dim });
        let mut settings = Settings::for_tests();
        settings.embedding_dimensions = dim;
        let svc = EmbeddingService::new(backend.clone(), &settings);
        (backend, svc)
    }

    #[tokio::test]
    async fn test_cache_avoids_second_call() {
        let (backend, svc) = service_with_counter(8);
        let a = svc.embed("hola mundo").await.unwrap();
        let b = svc.embed("Hola  Mundo").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_coalesce() {
        let (backend, svc) = service_with_counter(8);
        let svc = Arc::new(svc);

        let mut handles = vec![];
        for _ in 0..8 {
            let svc = svc.clone();
            handles.push(tokio::spawn(async move { svc.embed("misma consulta").await }));
        }
        let mut vectors = vec![];
        for h in handles {
            vectors.push(h.await.unwrap().unwrap());
        }
        assert!(vectors.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dimension_fixing() {
        let backend = Arc::new(MockEmbedder::new(16));
        let mut settings = Settings::for_tests();
        settings.embedding_dimensions = 8;
        let svc = EmbeddingService::new(backend, &settings);
        assert_eq!(svc.embed("x").await.unwrap().len(), 8);

        let backend = Arc::new(MockEmbedder::new(4));
        let svc = EmbeddingService::new(backend, &settings);
        let v = svc.embed("x").await.unwrap();
        assert_eq!(v.len(), 8);
        assert_eq!(&v[4..], &[0.0, 0.0, 0.0, 0.0]);
    }
}
