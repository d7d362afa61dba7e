// Concierge Engine — Metrics
//
// Counters and latency samples for tools, pipeline stages, the embedding
// cache, and the voice path. Readers get a JSON snapshot; recording is a
// short lock over plain vectors.

use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct LatencySeries {
    samples: Vec<f64>,
}

impl LatencySeries {
    fn record(&mut self, ms: f64) {
        self.samples.push(ms);
    }

    fn percentile(&self, p: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted[rank.min(sorted.len() - 1)]
    }

    fn snapshot(&self) -> serde_json::Value {
        let avg = if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().sum::<f64>() / self.samples.len() as f64
        };
        json!({
            "count": self.samples.len(),
            "avg_ms": round2(avg),
            "p50_ms": round2(self.percentile(0.5)),
            "p95_ms": round2(self.percentile(0.95)),
        })
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[derive(Default)]
struct ToolStats {
    invocations: u64,
    failures: u64,
    latency: LatencySeries,
}

#[derive(Default)]
struct VoiceStats {
    stt: LatencySeries,
    agent: LatencySeries,
    tts: LatencySeries,
    tts_first_chunk: LatencySeries,
    end_to_end: LatencySeries,
}

#[derive(Default)]
pub struct Metrics {
    tools: Mutex<HashMap<String, ToolStats>>,
    stages: Mutex<HashMap<String, LatencySeries>>,
    voice: Mutex<VoiceStats>,
    requests_total: AtomicU64,
    requests_failed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tool_call(&self, tool_name: &str, duration_ms: f64, success: bool) {
        let mut tools = self.tools.lock();
        let stats = tools.entry(tool_name.to_string()).or_default();
        stats.invocations += 1;
        if !success {
            stats.failures += 1;
        }
        stats.latency.record(duration_ms);
    }

    pub fn record_stage(&self, stage: &str, duration_ms: f64) {
        let mut stages = self.stages.lock();
        stages.entry(stage.to_string()).or_default().record(duration_ms);
    }

    pub fn record_request(&self, success: bool) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_voice_stt(&self, ms: f64) {
        self.voice.lock().stt.record(ms);
    }

    pub fn record_voice_agent(&self, ms: f64) {
        self.voice.lock().agent.record(ms);
    }

    pub fn record_voice_tts(&self, ms: f64, first_chunk_ms: Option<f64>) {
        let mut voice = self.voice.lock();
        voice.tts.record(ms);
        if let Some(fc) = first_chunk_ms {
            voice.tts_first_chunk.record(fc);
        }
    }

    pub fn record_voice_request(&self, ms: f64) {
        self.voice.lock().end_to_end.record(ms);
    }

    /// Read-only JSON snapshot. `cache_stats` is supplied by the
    /// embedding service so this module stays a leaf.
    pub fn snapshot(&self, cache_stats: serde_json::Value) -> serde_json::Value {
        let tools = self.tools.lock();
        let tool_map: serde_json::Map<String, serde_json::Value> = tools
            .iter()
            .map(|(name, s)| {
                let mut v = s.latency.snapshot();
                v["invocations"] = json!(s.invocations);
                v["failures"] = json!(s.failures);
                (name.clone(), v)
            })
            .collect();

        let stages = self.stages.lock();
        let stage_map: serde_json::Map<String, serde_json::Value> =
            stages.iter().map(|(name, s)| (name.clone(), s.snapshot())).collect();

        let voice = self.voice.lock();
        let total = self.requests_total.load(Ordering::Relaxed);
        let failed = self.requests_failed.load(Ordering::Relaxed);

        json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "requests": {
                "total": total,
                "errors": failed,
                "success_rate": if total > 0 {
                    round2((total - failed) as f64 / total as f64)
                } else { 0.0 },
            },
            "tools": tool_map,
            "stages": stage_map,
            "embedding_cache": cache_stats,
            "voice": {
                "stt": voice.stt.snapshot(),
                "agent": voice.agent.snapshot(),
                "tts": voice.tts.snapshot(),
                "tts_first_chunk": voice.tts_first_chunk.snapshot(),
                "end_to_end": voice.end_to_end.snapshot(),
            },
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
