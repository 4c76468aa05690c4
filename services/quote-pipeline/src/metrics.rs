//! Metrics for the quote pipeline
//!
//! Counters are plain atomics shared by the buffer and every consumer.
//! Catch-up latency is sampled into a bounded tracker for percentiles.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Shared pipeline counters.
pub struct PipelineMetrics {
    appends_accepted: AtomicU64,
    noop_appends: AtomicU64,
    snapshots_taken: AtomicU64,
    rebuilds: AtomicU64,
    batches_applied: AtomicU64,
    records_applied: AtomicU64,
    starvations: AtomicU64,
    resnapshots: AtomicU64,
    lagged_signals: AtomicU64,
    catch_up_us: Mutex<LatencyTracker>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            appends_accepted: AtomicU64::new(0),
            noop_appends: AtomicU64::new(0),
            snapshots_taken: AtomicU64::new(0),
            rebuilds: AtomicU64::new(0),
            batches_applied: AtomicU64::new(0),
            records_applied: AtomicU64::new(0),
            starvations: AtomicU64::new(0),
            resnapshots: AtomicU64::new(0),
            lagged_signals: AtomicU64::new(0),
            catch_up_us: Mutex::new(LatencyTracker::new(1_000)),
        }
    }

    pub fn record_append(&self) {
        self.appends_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// An append that was dropped without assigning a seq.
    pub fn record_noop_append(&self) {
        self.noop_appends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot(&self) {
        self.snapshots_taken.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebuild(&self) {
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self, records: usize) {
        self.batches_applied.fetch_add(1, Ordering::Relaxed);
        self.records_applied
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    /// A poll came back empty while the consumer was still behind.
    pub fn record_starvation(&self) {
        self.starvations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resnapshot(&self) {
        self.resnapshots.fetch_add(1, Ordering::Relaxed);
    }

    /// A consumer missed broadcast signals and fell back to `current_seq`.
    pub fn record_lagged(&self, missed: u64) {
        self.lagged_signals.fetch_add(missed, Ordering::Relaxed);
    }

    pub fn record_catch_up(&self, micros: u64) {
        self.catch_up_us.lock().record(micros);
    }

    /// Percentile of recorded catch-up durations in microseconds.
    pub fn catch_up_percentile(&self, p: usize) -> Option<u64> {
        self.catch_up_us.lock().percentile(p)
    }

    /// Export metrics as a BTreeMap for Prometheus-style exposition.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let mut m = BTreeMap::new();
        m.insert("appends_accepted".to_string(), self.appends_accepted.load(Ordering::Relaxed));
        m.insert("noop_appends".to_string(), self.noop_appends.load(Ordering::Relaxed));
        m.insert("snapshots_taken".to_string(), self.snapshots_taken.load(Ordering::Relaxed));
        m.insert("rebuilds".to_string(), self.rebuilds.load(Ordering::Relaxed));
        m.insert("batches_applied".to_string(), self.batches_applied.load(Ordering::Relaxed));
        m.insert("records_applied".to_string(), self.records_applied.load(Ordering::Relaxed));
        m.insert("starvations".to_string(), self.starvations.load(Ordering::Relaxed));
        m.insert("resnapshots".to_string(), self.resnapshots.load(Ordering::Relaxed));
        m.insert("lagged_signals".to_string(), self.lagged_signals.load(Ordering::Relaxed));
        if let Some(p99) = self.catch_up_percentile(99) {
            m.insert("catch_up_p99_us".to_string(), p99);
        }
        m
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PipelineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.export()).finish()
    }
}

/// Tracks latency samples for percentile calculation.
#[derive(Debug)]
pub struct LatencyTracker {
    samples: std::collections::VecDeque<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: std::collections::VecDeque::with_capacity(max_samples),
            max_samples,
        }
    }

    /// Record a sample, dropping the oldest once full.
    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Get a percentile value (0-100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (p.min(100) as f64 / 100.0 * (sorted.len() - 1) as f64) as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }
}
