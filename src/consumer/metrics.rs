// src/consumer/metrics.rs
//! Per-consumer counters
//!
//! Every field is a scalar atomic, so a snapshot taken during an in-flight
//! write sees either the old or the new value of each counter, never a torn
//! one. Counters only grow; they reset when the process restarts.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Wall-clock source, injectable for tests
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_millis(&self) -> u64;
}

/// The system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    /// Move the clock forward by `millis`
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

/// Process-lifetime metrics of one sink consumer
pub struct ConsumerMetrics {
    /// Successful writes
    processed: AtomicU64,

    /// Rejected messages (parse or write failures)
    errors: AtomicU64,

    /// Receipt to acknowledgement of the latest successful message
    last_process_ms: AtomicU64,

    /// Store write time of the latest successful message
    last_db_write_ms: AtomicU64,

    start_ms: u64,
    clock: Arc<dyn Clock>,
}

impl ConsumerMetrics {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Metrics whose uptime is measured against `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_process_ms: AtomicU64::new(0),
            last_db_write_ms: AtomicU64::new(0),
            start_ms: clock.now_millis(),
            clock,
        }
    }

    /// Count one stored message and fold its timings into the averages
    pub fn record_success(&self, db_write_ms: u64, process_ms: u64) {
        self.last_db_write_ms.store(db_write_ms, Ordering::Relaxed);
        self.last_process_ms.store(process_ms, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one message that was rejected
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Current counters plus derived rates
    pub fn snapshot(&self) -> MetricsSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let elapsed_sec =
            self.clock.now_millis().saturating_sub(self.start_ms) as f64 / 1000.0;

        let throughput_per_sec = if elapsed_sec > 0.0 {
            processed as f64 / elapsed_sec
        } else {
            0.0
        };

        let total = processed + errors;
        let error_rate = if total > 0 {
            errors as f64 / total as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            processed,
            errors,
            last_process_ms: self.last_process_ms.load(Ordering::Relaxed),
            last_db_write_ms: self.last_db_write_ms.load(Ordering::Relaxed),
            start_time: self.start_ms,
            throughput_per_sec,
            error_rate,
        }
    }
}

impl Default for ConsumerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics read endpoint payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub errors: u64,
    pub last_process_ms: u64,
    pub last_db_write_ms: u64,

    /// Consumer start, milliseconds since the Unix epoch
    pub start_time: u64,

    pub throughput_per_sec: f64,
    pub error_rate: f64,
}
