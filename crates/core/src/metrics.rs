//! Per-session counters and response latency tracking.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

pub const LATENCY_WINDOW: usize = 100;

/// Rolling window of the most recent latency samples.
#[derive(Debug)]
pub struct LatencyWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, sample: Duration) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<Duration> {
        self.samples.back().copied()
    }
}

#[derive(Debug)]
pub struct SessionMetrics {
    received: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    processing_errors: AtomicU64,
    latency: Mutex<LatencyWindow>,
    last_user_audio: Mutex<Option<Instant>>,
}

impl SessionMetrics {
    pub fn new(latency_window: usize) -> Self {
        Self {
            received: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            processing_errors: AtomicU64::new(0),
            latency: Mutex::new(LatencyWindow::new(latency_window)),
            last_user_audio: Mutex::new(None),
        }
    }

    pub fn chunk_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processing_error(&self) {
        self.processing_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_user_audio(&self, at: Instant) {
        *self.last_user_audio.lock() = Some(at);
    }

    /// Records `now - last user audio` as a latency sample. Nothing is
    /// recorded before the user has sent any audio.
    pub fn record_response(&self, now: Instant) -> Option<Duration> {
        let since = (*self.last_user_audio.lock())?;
        let sample = now.saturating_duration_since(since);
        self.latency.lock().record(sample);
        Some(sample)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn processing_errors(&self) -> u64 {
        self.processing_errors.load(Ordering::Relaxed)
    }

    /// Mean latency in milliseconds, 0 when no samples exist yet.
    pub fn avg_response_time_ms(&self) -> f64 {
        self.latency
            .lock()
            .mean()
            .map_or(0.0, |mean| mean.as_secs_f64() * 1000.0)
    }

    pub fn latency_samples(&self) -> usize {
        self.latency.lock().len()
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new(LATENCY_WINDOW)
    }
}
