//! Generation timing and throughput
//!
//! Purely observational: nothing in here feeds back into control flow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::info;

/// Statistics for one `generate` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationStats {
    pub started_at: DateTime<Utc>,
    pub prefill_tokens: usize,
    pub prefill_time_ms: u64,
    pub tokens_generated: usize,
    pub elapsed_ms: u64,
    pub tokens_per_second: f64,
}

/// Wall-clock timer for a single generation.
#[derive(Debug, Clone)]
pub struct Stopwatch {
    started_at: DateTime<Utc>,
    start: Instant,
    prefill: Option<(usize, Duration)>,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
            start: Instant::now(),
            prefill: None,
        }
    }

    /// Mark the end of prompt evaluation.
    pub fn prefill_done(&mut self, tokens: usize) {
        self.prefill = Some((tokens, self.start.elapsed()));
    }

    pub fn finish(&self, tokens_generated: usize) -> GenerationStats {
        let elapsed = self.start.elapsed();
        let (prefill_tokens, prefill_time) = self.prefill.unwrap_or_default();
        GenerationStats {
            started_at: self.started_at,
            prefill_tokens,
            prefill_time_ms: prefill_time.as_millis() as u64,
            tokens_generated,
            elapsed_ms: elapsed.as_millis() as u64,
            tokens_per_second: tokens_per_second(tokens_generated, elapsed),
        }
    }
}

/// Throughput, `0.0` when no time has elapsed.
pub fn tokens_per_second(tokens: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        tokens as f64 / secs
    } else {
        0.0
    }
}

/// Cumulative counters across the lifetime of a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub generations: u64,
    pub failures: u64,
    pub total_tokens: u64,
    pub total_time_ms: u64,
    pub last: Option<GenerationStats>,
    /// Partial statistics of the most recent aborted generation
    pub last_failure: Option<GenerationStats>,
}

impl TelemetrySnapshot {
    pub fn average_tokens_per_second(&self) -> f64 {
        tokens_per_second(self.total_tokens as usize, Duration::from_millis(self.total_time_ms))
    }
}

/// Accumulates [`GenerationStats`].
#[derive(Debug, Default)]
pub struct TelemetryRecorder {
    snapshot: TelemetrySnapshot,
}

impl TelemetryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, stats: &GenerationStats) {
        info!(
            tokens = stats.tokens_generated,
            elapsed_ms = stats.elapsed_ms,
            prefill_tokens = stats.prefill_tokens,
            tokens_per_second = stats.tokens_per_second,
            "Generation complete"
        );
        self.snapshot.generations += 1;
        self.snapshot.total_tokens += stats.tokens_generated as u64;
        self.snapshot.total_time_ms += stats.elapsed_ms;
        self.snapshot.last = Some(stats.clone());
    }

    /// Count an aborted generation, keeping what it emitted before failing.
    pub fn record_failure(&mut self, stats: &GenerationStats) {
        info!(
            tokens = stats.tokens_generated,
            elapsed_ms = stats.elapsed_ms,
            "Generation aborted"
        );
        self.snapshot.failures += 1;
        self.snapshot.total_tokens += stats.tokens_generated as u64;
        self.snapshot.total_time_ms += stats.elapsed_ms;
        self.snapshot.last_failure = Some(stats.clone());
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.snapshot.clone()
    }
}
