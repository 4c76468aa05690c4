//! Short quote history per symbol
//!
//! Keeps a retention-bounded, time-ordered series of raw quotes per symbol
//! plus the last-known quote, which outlives eviction. Serves "recent
//! quotes" queries without touching the buffer log.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, trace};

use quote_types::ids::SymbolKey;
use quote_types::quote::Quote;

use crate::clock::Clock;
use crate::config::HistoryConfig;
use crate::events::{ChangeRecord, QuoteUpdated};
use crate::replay::{Projection, ReplayingConsumer};
use crate::snapshot::Snapshot;

/// Recent quotes of every symbol, fed by a replaying consumer.
pub struct ShortHistoryProjection {
    config: HistoryConfig,
    initial_window: Duration,
    clock: Arc<dyn Clock>,
    /// Oldest first; empty series are removed.
    series: BTreeMap<SymbolKey, VecDeque<Arc<Quote>>>,
    last_known: BTreeMap<SymbolKey, Arc<Quote>>,
    updates: broadcast::Sender<QuoteUpdated>,
}

impl ShortHistoryProjection {
    pub fn new(
        config: HistoryConfig,
        initial_window: Duration,
        clock: Arc<dyn Clock>,
        update_capacity: usize,
    ) -> Self {
        let (updates, _) = broadcast::channel(update_capacity.max(1));
        Self {
            config,
            initial_window,
            clock,
            series: BTreeMap::new(),
            last_known: BTreeMap::new(),
            updates,
        }
    }

    pub fn updates(&self) -> broadcast::Sender<QuoteUpdated> {
        self.updates.clone()
    }

    /// Quotes stamped within the trailing `window`, oldest first.
    pub fn quotes(&self, key: &SymbolKey, window: Duration) -> Vec<Arc<Quote>> {
        let Some(series) = self.series.get(key) else {
            return Vec::new();
        };
        let min_ts = self.clock.now_unix_secs() - secs(window);
        series
            .iter()
            .filter(|q| q.timestamp_sec >= min_ts)
            .cloned()
            .collect()
    }

    /// Most recent retained quote.
    pub fn last(&self, key: &SymbolKey) -> Option<Arc<Quote>> {
        self.series.get(key)?.back().cloned()
    }

    /// Last quote ever seen for `key`, even if evicted.
    pub fn last_known(&self, key: &SymbolKey) -> Option<Arc<Quote>> {
        self.last_known.get(key).cloned()
    }

    pub fn symbols(&self) -> Vec<SymbolKey> {
        self.series.keys().cloned().collect()
    }

    pub fn series_len(&self, key: &SymbolKey) -> usize {
        self.series.get(key).map_or(0, VecDeque::len)
    }

    fn evict(&mut self, key: &SymbolKey, min_ts: i64) {
        let Some(series) = self.series.get_mut(key) else {
            return;
        };
        let mut evicted = 0usize;
        while series.front().is_some_and(|q| q.timestamp_sec < min_ts) {
            series.pop_front();
            evicted += 1;
        }
        if evicted > 0 {
            trace!(symbol = %key, evicted, "Evicted quotes");
        }
        if series.is_empty() {
            self.series.remove(key);
            debug!(symbol = %key, "Removed empty quote series");
        }
    }
}

impl Projection for ShortHistoryProjection {
    fn name(&self) -> &'static str {
        "short-history"
    }

    fn initial_snapshot_window(&self) -> Duration {
        self.initial_window
    }

    fn rebuild_from_snapshot(&mut self, snapshot: &Snapshot) {
        self.series = snapshot
            .window_per_symbol
            .iter()
            .map(|(key, quotes)| (key.clone(), quotes.iter().cloned().collect()))
            .collect();
        self.last_known = snapshot.last_per_symbol.clone();

        debug!(
            seq = snapshot.seq,
            symbols = self.series.len(),
            "Short history rebuilt"
        );
        for key in self.series.keys() {
            let _ = self.updates.send(QuoteUpdated { key: key.clone() });
        }
    }

    fn apply_changes(&mut self, changes: &[ChangeRecord]) {
        let min_ts = self.clock.now_unix_secs() - secs(self.config.retention);
        let mut updated = BTreeSet::new();

        for change in changes {
            let quote = change.quote();
            self.series
                .entry(change.key.clone())
                .or_default()
                .push_back(Arc::clone(quote));
            self.last_known.insert(change.key.clone(), Arc::clone(quote));
            self.evict(&change.key, min_ts);
            updated.insert(change.key.clone());
        }

        trace!(records = changes.len(), symbols = updated.len(), "Applied quote changes");
        for key in updated {
            let _ = self.updates.send(QuoteUpdated { key });
        }
    }
}

/// Query surface of the short-history consumer.
impl ReplayingConsumer<ShortHistoryProjection> {
    pub fn quotes(&self, key: &SymbolKey, window: Duration) -> Vec<Arc<Quote>> {
        self.read(|p| p.quotes(key, window))
    }

    pub fn last(&self, key: &SymbolKey) -> Option<Arc<Quote>> {
        self.read(|p| p.last(key))
    }

    pub fn last_known(&self, key: &SymbolKey) -> Option<Arc<Quote>> {
        self.read(|p| p.last_known(key))
    }
}

fn secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use rust_decimal::Decimal;

    const NOW: i64 = 1_700_000_000;

    fn key() -> SymbolKey {
        SymbolKey::new("133962", "22", "last")
    }

    fn change(seq: u64, ts: i64, price: i64) -> ChangeRecord {
        ChangeRecord::quote_change(seq, Arc::new(Quote::new(key(), ts, Decimal::from(price), seq as i64)))
    }

    fn projection(clock: Arc<ManualClock>, retention_secs: u64) -> ShortHistoryProjection {
        let config = HistoryConfig {
            retention: Duration::from_secs(retention_secs),
        };
        ShortHistoryProjection::new(config, Duration::from_secs(1800), clock, 16)
    }

    #[test]
    fn test_apply_appends_and_signals_once() {
        let clock = Arc::new(ManualClock::new(NOW));
        let mut history = projection(clock, 3600);
        let mut rx = history.updates().subscribe();

        history.apply_changes(&[change(1, NOW - 20, 100), change(2, NOW - 10, 101), change(3, NOW, 102)]);

        assert_eq!(history.series_len(&key()), 3);
        assert_eq!(history.last(&key()).unwrap().price, Decimal::from(102));
        assert_eq!(history.quotes(&key(), Duration::from_secs(15)).len(), 2);
        assert_eq!(rx.try_recv().unwrap(), QuoteUpdated { key: key() });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_eviction_keeps_last_known() {
        let clock = Arc::new(ManualClock::new(NOW));
        let mut history = projection(clock.clone(), 60);

        history.apply_changes(&[change(1, NOW, 100)]);
        clock.advance(120);
        // Late quote older than retention is evicted immediately.
        history.apply_changes(&[change(2, NOW + 10, 101)]);

        assert!(history.last(&key()).is_none());
        assert!(history.symbols().is_empty());
        assert!(history.quotes(&key(), Duration::from_secs(3600)).is_empty());
        assert_eq!(history.last_known(&key()).unwrap().price, Decimal::from(101));
    }

    #[test]
    fn test_rebuild_replaces_state() {
        let clock = Arc::new(ManualClock::new(NOW));
        let mut history = projection(clock, 3600);
        let other = SymbolKey::new("1", "2", "bid");
        history.apply_changes(&[ChangeRecord::quote_change(
            1,
            Arc::new(Quote::new(other.clone(), NOW, Decimal::ONE, 0)),
        )]);

        let quotes = vec![
            Arc::new(Quote::new(key(), NOW - 5, Decimal::from(100), 1)),
            Arc::new(Quote::new(key(), NOW, Decimal::from(101), 2)),
        ];
        let mut snapshot = Snapshot {
            seq: 9,
            ..Snapshot::default()
        };
        snapshot.last_per_symbol.insert(key(), quotes[1].clone());
        snapshot.window_per_symbol.insert(key(), quotes);

        history.rebuild_from_snapshot(&snapshot);
        assert_eq!(history.symbols(), vec![key()]);
        assert_eq!(history.series_len(&key()), 2);
        assert!(history.last_known(&other).is_none());
        assert_eq!(history.last_known(&key()).unwrap().price, Decimal::from(101));
    }

    #[test]
    fn test_unknown_key_queries_are_empty() {
        let history = projection(Arc::new(ManualClock::new(NOW)), 3600);
        let unknown = SymbolKey::new("0", "0", "ask");
        assert!(history.quotes(&unknown, Duration::from_secs(60)).is_empty());
        assert!(history.last(&unknown).is_none());
        assert!(history.last_known(&unknown).is_none());
    }
}
