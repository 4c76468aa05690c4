//! Sequenced quote buffer for the quote pipeline
//!
//! The buffer is the single source of truth. Every accepted full or delta
//! quote is stored as the symbol's last-known quote, appended to the
//! symbol's retained history and to the global change log, and stamped with
//! the next buffer-wide seq.
//!
//! Guarantees:
//! - seq values are assigned under the write lock, 1-based and gap-free
//! - readers copy under the read lock and never see a half-applied append
//! - "buffer advanced" is broadcast after the lock is released and never
//!   blocks or fails the append

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use quote_types::ids::{SubscriptionId, SymbolKey};
use quote_types::quote::{merge_delta, DeltaQuote, Quote};

use crate::clock::Clock;
use crate::config::BufferConfig;
use crate::events::{BufferAdvanced, ChangeRecord, Seq};
use crate::metrics::PipelineMetrics;
use crate::snapshot::Snapshot;

#[derive(Debug, Default)]
struct BufferState {
    /// First-write-wins
    id_to_key: BTreeMap<SubscriptionId, SymbolKey>,
    /// First-write-wins
    id_to_channel: BTreeMap<SubscriptionId, String>,
    last_per_symbol: BTreeMap<SymbolKey, Arc<Quote>>,
    series: BTreeMap<SymbolKey, SymbolSeries>,
    /// Contiguous by seq
    log: VecDeque<ChangeRecord>,
    /// Newest feed timestamp ever appended to the log.
    log_newest_ts: Option<i64>,
}

/// Retained history of one symbol, in append order.
#[derive(Debug)]
struct SymbolSeries {
    quotes: VecDeque<Arc<Quote>>,
    newest_ts: i64,
}

/// Append-only, sequenced store of quote changes.
pub struct MarketDataBuffer {
    config: BufferConfig,
    clock: Arc<dyn Clock>,
    state: RwLock<BufferState>,
    /// Mirror of the last assigned seq, written under the write lock.
    seq: AtomicU64,
    advanced_tx: broadcast::Sender<BufferAdvanced>,
    metrics: Arc<PipelineMetrics>,
}

impl MarketDataBuffer {
    pub fn new(config: BufferConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_metrics(config, clock, Arc::new(PipelineMetrics::new()))
    }

    /// Create a buffer that reports into shared metrics.
    pub fn with_metrics(
        config: BufferConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        info!(
            retention_secs = config.retention.as_secs(),
            log_max_records = config.log_max_records,
            signal_capacity = config.signal_capacity,
            "MarketDataBuffer initialized"
        );

        let (advanced_tx, _) = broadcast::channel(config.signal_capacity.max(1));
        Self {
            config,
            clock,
            state: RwLock::new(BufferState::default()),
            seq: AtomicU64::new(0),
            advanced_tx,
            metrics,
        }
    }

    /// Append a full quote.
    ///
    /// Registers the quote's subscription id (first write wins) and returns
    /// the assigned seq, or `None` when the quote carries no usable key.
    pub fn append_full(&self, quote: Quote) -> Option<Seq> {
        if quote.key.symbol_id.is_empty() || quote.key.venue_id.is_empty() {
            debug!(key = %quote.key, "Dropping full quote without usable key");
            self.metrics.record_noop_append();
            return None;
        }

        let seq = {
            let mut state = self.state.write();
            if let Some(id) = quote.subscription_id {
                state
                    .id_to_key
                    .entry(id)
                    .or_insert_with(|| quote.key.clone());
                state
                    .id_to_channel
                    .entry(id)
                    .or_insert_with(|| quote.key.channel.clone());
            }
            self.store_locked(&mut state, quote)
        };

        self.announce(seq);
        Some(seq)
    }

    /// Merge a delta onto the last-known quote of its stream and append it.
    ///
    /// Returns `None` for unmapped subscription ids and for deltas that
    /// cannot produce a quote; state is left untouched in both cases.
    pub fn append_delta(&self, delta: &DeltaQuote) -> Option<Seq> {
        let now = self.clock.now_unix_secs();

        let seq = {
            let mut state = self.state.write();
            let Some(key) = state.id_to_key.get(&delta.subscription_id).cloned() else {
                debug!(
                    subscription_id = %delta.subscription_id,
                    "Dropping delta for unknown subscription id"
                );
                self.metrics.record_noop_append();
                return None;
            };

            let prev = state.last_per_symbol.get(&key).cloned();
            let channel = state.id_to_channel.get(&delta.subscription_id).cloned();
            let Some(merged) = merge_delta(&key, prev.as_deref(), delta, channel.as_deref(), now)
            else {
                debug!(symbol = %key, "Delta produced no quote");
                self.metrics.record_noop_append();
                return None;
            };

            self.store_locked(&mut state, merged)
        };

        self.announce(seq);
        Some(seq)
    }

    /// Point-in-time copy with each symbol's history newer than `now - window`.
    pub fn snapshot(&self, window: Duration) -> Snapshot {
        let cutoff = self.clock.now_unix_secs() - secs(window);
        let state = self.state.read();

        let window_per_symbol: BTreeMap<SymbolKey, Vec<Arc<Quote>>> = state
            .series
            .iter()
            .filter_map(|(key, series)| {
                let recent: Vec<Arc<Quote>> = series
                    .quotes
                    .iter()
                    .filter(|q| q.timestamp_sec >= cutoff)
                    .cloned()
                    .collect();
                (!recent.is_empty()).then(|| (key.clone(), recent))
            })
            .collect();

        let snapshot = Snapshot {
            seq: self.seq.load(Ordering::Acquire),
            id_to_key: state.id_to_key.clone(),
            id_to_channel: state.id_to_channel.clone(),
            last_per_symbol: state.last_per_symbol.clone(),
            window_per_symbol,
        };
        drop(state);

        self.metrics.record_snapshot();
        debug!(
            seq = snapshot.seq,
            window_secs = window.as_secs(),
            symbols = snapshot.symbol_count(),
            quotes = snapshot.quote_count(),
            "Snapshot taken"
        );
        snapshot
    }

    /// Change records with `seq > after`, oldest first, at most `max_records`.
    ///
    /// Empty when nothing newer exists or when `after` has fallen behind the
    /// retained log; the caller must re-snapshot in the latter case.
    pub fn poll_since(&self, after: Seq, max_records: usize) -> Vec<ChangeRecord> {
        let state = self.state.read();
        let Some(front) = state.log.front() else {
            return Vec::new();
        };

        let first_wanted = after.saturating_add(1);
        if first_wanted < front.seq {
            debug!(
                after,
                oldest_retained = front.seq,
                "Poll cursor behind retained log"
            );
            return Vec::new();
        }

        let Ok(start) = usize::try_from(first_wanted - front.seq) else {
            return Vec::new();
        };
        state
            .log
            .iter()
            .skip(start)
            .take(max_records)
            .cloned()
            .collect()
    }

    /// Last assigned seq, `0` before the first append.
    pub fn current_seq(&self) -> Seq {
        self.seq.load(Ordering::Acquire)
    }

    pub fn symbol_for_sub_id(&self, id: SubscriptionId) -> Option<SymbolKey> {
        self.state.read().id_to_key.get(&id).cloned()
    }

    /// Channel type ("last", "bid", ...) registered for a subscription id.
    pub fn quote_type_for_sub_id(&self, id: SubscriptionId) -> Option<String> {
        self.state.read().id_to_channel.get(&id).cloned()
    }

    pub fn last_quote(&self, key: &SymbolKey) -> Option<Arc<Quote>> {
        self.state.read().last_per_symbol.get(key).cloned()
    }

    /// Receiver of "buffer advanced" signals.
    pub fn subscribe(&self) -> broadcast::Receiver<BufferAdvanced> {
        self.advanced_tx.subscribe()
    }

    /// Number of change records currently retained.
    pub fn log_len(&self) -> usize {
        self.state.read().log.len()
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Store `quote` and append its change record. Caller holds the write lock.
    fn store_locked(&self, state: &mut BufferState, quote: Quote) -> Seq {
        let seq = self.seq.load(Ordering::Relaxed) + 1;
        let quote = Arc::new(quote);
        let key = quote.key.clone();
        let retention = secs(self.config.retention);

        state.last_per_symbol.insert(key.clone(), quote.clone());

        let series = state.series.entry(key.clone()).or_insert_with(|| SymbolSeries {
            quotes: VecDeque::new(),
            newest_ts: quote.timestamp_sec,
        });
        series.newest_ts = series.newest_ts.max(quote.timestamp_sec);
        series.quotes.push_back(quote.clone());
        let horizon = series.newest_ts.saturating_sub(retention);
        while series
            .quotes
            .front()
            .is_some_and(|q| q.timestamp_sec < horizon)
        {
            series.quotes.pop_front();
        }

        // Log ages are feed time; the record just appended always stays.
        let newest = state
            .log_newest_ts
            .map_or(quote.timestamp_sec, |ts| ts.max(quote.timestamp_sec));
        state.log_newest_ts = Some(newest);
        let record = ChangeRecord::quote_change(seq, quote);
        let kind = record.change_type_label();
        state.log.push_back(record);

        let log_cutoff = newest.saturating_sub(retention);
        let mut evicted = 0usize;
        while state.log.len() > 1 {
            let Some(front) = state.log.front() else {
                break;
            };
            let over_cap = state.log.len() > self.config.log_max_records;
            if !over_cap && front.timestamp_sec >= log_cutoff {
                break;
            }
            state.log.pop_front();
            evicted += 1;
        }

        self.seq.store(seq, Ordering::Release);
        self.metrics.record_append();
        trace!(seq, kind, symbol = %key, log_len = state.log.len(), evicted, "Change appended");
        seq
    }

    fn announce(&self, seq: Seq) {
        // No receivers is not an error.
        let _ = self.advanced_tx.send(BufferAdvanced { seq });
    }
}

fn secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}
