// Metrics collection and tracking

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use voice_core::{CacheStats, StreamResources};

/// Latency samples kept for percentile calculation
const MAX_LATENCY_SAMPLES: usize = 1000;

/// Per-endpoint metrics
#[derive(Debug, Clone)]
pub struct EndpointMetrics {
    request_count: Arc<AtomicU64>,
    error_count: Arc<AtomicU64>,
    total_latency_ms: Arc<AtomicU64>,
    min_latency_ms: Arc<AtomicU64>,
    max_latency_ms: Arc<AtomicU64>,
    latency_samples: Arc<Mutex<Vec<u64>>>,
}

impl EndpointMetrics {
    pub fn new() -> Self {
        Self {
            request_count: Arc::new(AtomicU64::new(0)),
            error_count: Arc::new(AtomicU64::new(0)),
            total_latency_ms: Arc::new(AtomicU64::new(0)),
            min_latency_ms: Arc::new(AtomicU64::new(u64::MAX)),
            max_latency_ms: Arc::new(AtomicU64::new(0)),
            latency_samples: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn record_request(&self, latency_ms: u64) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.min_latency_ms.fetch_min(latency_ms, Ordering::Relaxed);
        self.max_latency_ms.fetch_max(latency_ms, Ordering::Relaxed);

        if let Ok(mut samples) = self.latency_samples.lock() {
            samples.push(latency_ms);
            if samples.len() > MAX_LATENCY_SAMPLES {
                samples.remove(0);
            }
        }
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn avg_latency_ms(&self) -> f64 {
        let count = self.request_count();
        if count == 0 {
            return 0.0;
        }
        self.total_latency_ms.load(Ordering::Relaxed) as f64 / count as f64
    }

    fn percentile(&self, p: u8) -> u64 {
        let Ok(samples) = self.latency_samples.lock() else {
            return 0;
        };
        if samples.is_empty() {
            return 0;
        }
        let mut sorted = samples.clone();
        sorted.sort_unstable();
        let index = (sorted.len() * p as usize / 100).min(sorted.len() - 1);
        sorted[index]
    }

    pub fn stats(&self) -> EndpointStats {
        let min = self.min_latency_ms.load(Ordering::Relaxed);
        EndpointStats {
            request_count: self.request_count(),
            error_count: self.error_count(),
            avg_latency_ms: self.avg_latency_ms(),
            min_latency_ms: if min == u64::MAX { 0 } else { min },
            max_latency_ms: self.max_latency_ms.load(Ordering::Relaxed),
            p50_latency_ms: self.percentile(50),
            p95_latency_ms: self.percentile(95),
            p99_latency_ms: self.percentile(99),
        }
    }
}

impl Default for EndpointMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Synthesis counters shared by the batch and streaming paths
#[derive(Debug, Clone, Default)]
pub struct SynthesisMetrics {
    synthesis_count: Arc<AtomicU64>,
    total_synthesis_ms: Arc<AtomicU64>,
    total_audio_ms: Arc<AtomicU64>,
    streams_started: Arc<AtomicU64>,
    streams_cancelled: Arc<AtomicU64>,
    first_chunk: EndpointMetrics,
}

impl SynthesisMetrics {
    pub fn record_synthesis(&self, elapsed_ms: u64, audio_ms: u64) {
        self.synthesis_count.fetch_add(1, Ordering::Relaxed);
        self.total_synthesis_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
        self.total_audio_ms.fetch_add(audio_ms, Ordering::Relaxed);
    }

    pub fn record_stream_started(&self) {
        self.streams_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_first_chunk(&self, latency_ms: u64) {
        self.first_chunk.record_request(latency_ms);
    }

    pub fn record_stream_cancelled(&self) {
        self.streams_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Seconds of compute per second of audio; below 1.0 is faster than real time.
    pub fn real_time_factor(&self) -> f64 {
        let audio = self.total_audio_ms.load(Ordering::Relaxed);
        if audio == 0 {
            return 0.0;
        }
        self.total_synthesis_ms.load(Ordering::Relaxed) as f64 / audio as f64
    }

    pub fn response(&self) -> SynthesisMetricsResponse {
        let count = self.synthesis_count.load(Ordering::Relaxed);
        let total = self.total_synthesis_ms.load(Ordering::Relaxed);
        SynthesisMetricsResponse {
            synthesis_count: count,
            avg_synthesis_ms: if count == 0 { 0.0 } else { total as f64 / count as f64 },
            total_audio_ms: self.total_audio_ms.load(Ordering::Relaxed),
            real_time_factor: self.real_time_factor(),
            streams_started: self.streams_started.load(Ordering::Relaxed),
            streams_cancelled: self.streams_cancelled.load(Ordering::Relaxed),
            first_chunk: self.first_chunk.stats(),
        }
    }
}

/// Comprehensive metrics structure
#[derive(Debug, Clone)]
pub struct AppMetrics {
    pub embed: EndpointMetrics,
    pub clone: EndpointMetrics,
    pub stream: EndpointMetrics,
    pub synthesis: SynthesisMetrics,
    started: Instant,
}

impl AppMetrics {
    pub fn new() -> Self {
        Self {
            embed: EndpointMetrics::new(),
            clone: EndpointMetrics::new(),
            stream: EndpointMetrics::new(),
            synthesis: SynthesisMetrics::default(),
            started: Instant::now(),
        }
    }

    pub fn snapshot(&self, cache: CacheStats, resources: &StreamResources) -> MetricsResponse {
        let lookups = cache.hits + cache.misses;
        MetricsResponse {
            timestamp: Utc::now(),
            uptime_seconds: self.started.elapsed().as_secs(),
            endpoints: EndpointMetricsResponse {
                embed: self.embed.stats(),
                clone: self.clone.stats(),
                stream: self.stream.stats(),
            },
            synthesis: self.synthesis.response(),
            cache: CacheMetricsResponse {
                hits: cache.hits,
                misses: cache.misses,
                entries: cache.entries,
                capacity: cache.capacity,
                hit_rate: if lookups == 0 {
                    0.0
                } else {
                    cache.hits as f64 / lookups as f64 * 100.0
                },
            },
            streams: StreamGaugesResponse {
                buffered_frames: resources.buffered_frames(),
                buffered_chunks: resources.buffered_chunks(),
                live_workers: resources.live_workers(),
            },
        }
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub endpoints: EndpointMetricsResponse,
    pub synthesis: SynthesisMetricsResponse,
    pub cache: CacheMetricsResponse,
    pub streams: StreamGaugesResponse,
}

#[derive(Debug, Serialize)]
pub struct EndpointMetricsResponse {
    pub embed: EndpointStats,
    pub clone: EndpointStats,
    pub stream: EndpointStats,
}

#[derive(Debug, Serialize)]
pub struct EndpointStats {
    pub request_count: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct SynthesisMetricsResponse {
    pub synthesis_count: u64,
    pub avg_synthesis_ms: f64,
    pub total_audio_ms: u64,
    pub real_time_factor: f64,
    pub streams_started: u64,
    pub streams_cancelled: u64,
    pub first_chunk: EndpointStats,
}

#[derive(Debug, Serialize)]
pub struct CacheMetricsResponse {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub capacity: usize,
    pub hit_rate: f64,
}

#[derive(Debug, Serialize)]
pub struct StreamGaugesResponse {
    pub buffered_frames: usize,
    pub buffered_chunks: usize,
    pub live_workers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_stats() {
        let metrics = EndpointMetrics::new();
        assert_eq!(metrics.stats().min_latency_ms, 0);
        for ms in [10, 20, 30, 40] {
            metrics.record_request(ms);
        }
        metrics.record_error();

        let stats = metrics.stats();
        assert_eq!(stats.request_count, 4);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.min_latency_ms, 10);
        assert_eq!(stats.max_latency_ms, 40);
        assert!((stats.avg_latency_ms - 25.0).abs() < 1e-9);
        assert_eq!(stats.p50_latency_ms, 30);
        assert_eq!(stats.p99_latency_ms, 40);
    }

    #[test]
    fn test_real_time_factor() {
        let synthesis = SynthesisMetrics::default();
        assert_eq!(synthesis.real_time_factor(), 0.0);
        synthesis.record_synthesis(500, 2000);
        assert!((synthesis.real_time_factor() - 0.25).abs() < 1e-9);
    }
}
