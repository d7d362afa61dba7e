// Text-to-speech backends.
// The HTTP backend streams raw PCM16 from a synthesis endpoint through a
// bounded channel; chunks are trimmed to even byte counts so PCM16
// framing never splits a sample. The mock backend emits deterministic
// chunks for tests and demos.

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::config::Settings;
use async_trait::async_trait;
use futures::StreamExt;
use log::{info, warn};
use std::time::Duration;
use tokio::sync::mpsc;

const TTS_CHANNEL_DEPTH: usize = 32;

#[async_trait]
pub trait TtsBackend: Send + Sync {
    /// Start synthesis; PCM16 chunks arrive on the returned channel until
    /// synthesis completes or the receiver is dropped (barge-in).
    async fn synthesize(&self, text: &str) -> EngineResult<mpsc::Receiver<Vec<u8>>>;
}

pub struct HttpTts {
    client: reqwest::Client,
    base_url: String,
    voice: String,
}

impl HttpTts {
    pub fn new(settings: &Settings) -> Self {
        HttpTts {
            client: reqwest::Client::new(),
            base_url: settings.tts_base_url.trim_end_matches('/').to_string(),
            voice: settings.tts_voice.clone(),
        }
    }
}

#[async_trait]
impl TtsBackend for HttpTts {
    async fn synthesize(&self, text: &str) -> EngineResult<mpsc::Receiver<Vec<u8>>> {
        let url = format!("{}/synthesize", self.base_url);
        info!("[voice] TTS {} chars → {}", text.len(), url);

        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "text": text, "voice": self.voice, "format": "pcm16" }))
            .timeout(Duration::from_secs(120))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(EngineError::application("tts", format!("HTTP {}", resp.status())));
        }

        let (tx, rx) = mpsc::channel::<Vec<u8>>(TTS_CHANNEL_DEPTH);
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            // carry an odd trailing byte into the next chunk
            let mut carry: Option<u8> = None;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(bytes) => {
                        let mut chunk = Vec::with_capacity(bytes.len() + 1);
                        if let Some(b) = carry.take() {
                            chunk.push(b);
                        }
                        chunk.extend_from_slice(&bytes);
                        if chunk.len() % 2 != 0 {
                            carry = chunk.pop();
                        }
                        if chunk.is_empty() {
                            continue;
                        }
                        if tx.send(chunk).await.is_err() {
                            // receiver dropped: barge-in
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("[voice] TTS stream error: {}", e);
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }
}

/// Deterministic backend: a short burst of silence chunks sized from the
/// text length.
pub struct MockTts {
    sample_rate: u32,
}

impl MockTts {
    pub fn new(sample_rate: u32) -> Self {
        MockTts { sample_rate }
    }
}

#[async_trait]
impl TtsBackend for MockTts {
    async fn synthesize(&self, text: &str) -> EngineResult<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(TTS_CHANNEL_DEPTH);
        // ~60 ms of PCM16 silence per chunk, one chunk per 20 chars
        let chunk_len = (self.sample_rate as usize / 16) * 2;
        let chunks = (text.chars().count() / 20 + 1).min(10);
        tokio::spawn(async move {
            for _ in 0..chunks {
                if tx.send(vec![0u8; chunk_len]).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });
        Ok(rx)
    }
}

pub fn tts_backend(settings: &Settings) -> std::sync::Arc<dyn TtsBackend> {
    if settings.mock_mode || settings.tts_base_url.is_empty() {
        std::sync::Arc::new(MockTts::new(settings.voice_sample_rate))
    } else {
        std::sync::Arc::new(HttpTts::new(settings))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_tts_emits_even_chunks() {
        let tts = MockTts::new(24_000);
        let mut rx = tts.synthesize("Tienes una cita mañana a las once.").await.unwrap();
        let mut count = 0;
        while let Some(chunk) = rx.recv().await {
            assert!(!chunk.is_empty());
            assert_eq!(chunk.len() % 2, 0);
            count += 1;
        }
        assert!(count >= 1);
    }

    #[tokio::test]
    async fn test_mock_tts_stops_on_dropped_receiver() {
        let tts = MockTts::new(24_000);
        let rx = tts.synthesize("texto largo que produciría varios chunks de audio").await.unwrap();
        drop(rx); // barge-in: sender task must exit quietly
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
}
