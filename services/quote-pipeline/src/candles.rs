//! Time-bucket candle aggregation
//!
//! Turns the irregular quote stream of each symbol into contiguous,
//! fixed-width OHLC candles. When one update spans several buckets, the
//! tick delta it carries is spread across them in proportion to the time
//! each bucket covers; the last segment absorbs whatever rounding left over.
//!
//! Buckets are aligned to the epoch. Missing buckets between two observed
//! ones are filled with flat candles at the previous close and zero ticks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use quote_types::candle::{bucket_end, bucket_start, Candle};
use quote_types::ids::SymbolKey;
use quote_types::quote::Quote;

use crate::clock::Clock;
use crate::config::CandleConfig;
use crate::events::{CandleUpdated, ChangeRecord};
use crate::replay::{Projection, ReplayingConsumer};
use crate::snapshot::Snapshot;

/// Candle series of a single symbol.
#[derive(Debug, Clone)]
pub struct TimeCandleAggregator {
    frame_secs: i64,
    /// Latest timestamp seen and the tick of the last accepted quote.
    last_seen: Option<(i64, i64)>,
    /// Keyed by bucket start, contiguous.
    candles: BTreeMap<i64, Candle>,
    /// Survives eviction.
    last_known: Option<Candle>,
}

impl TimeCandleAggregator {
    pub fn new(frame_secs: i64) -> Self {
        Self {
            frame_secs: frame_secs.max(1),
            last_seen: None,
            candles: BTreeMap::new(),
            last_known: None,
        }
    }

    /// Fold one quote into the series.
    pub fn accept_quote(&mut self, quote: &Quote) {
        let ts1 = quote.timestamp_sec;
        let tick1 = quote.tick;

        let Some((ts0, tick0)) = self.last_seen else {
            let start = bucket_start(ts1, self.frame_secs);
            self.fill_gaps(start);
            self.upsert(start, quote.price, 1, quote.precision);
            self.last_seen = Some((ts1, tick1));
            return;
        };

        let d_tick = u64::try_from(tick1.saturating_sub(tick0)).unwrap_or(0);

        if ts1 <= ts0 {
            // Late or same-second quote: fold into the bucket we are in.
            let start = bucket_start(ts0, self.frame_secs);
            self.fill_gaps(start);
            self.upsert(start, quote.price, d_tick, quote.precision);
        } else {
            let d_sec = ts1.saturating_sub(ts0).max(1);
            let mut cursor = ts0;
            let mut remaining = d_tick;

            while cursor < ts1 {
                let start = bucket_start(cursor, self.frame_secs);
                let seg_end = bucket_end(cursor, self.frame_secs).min(ts1);
                let seg_dur = seg_end.saturating_sub(cursor).max(1);

                let alloc = if seg_end == ts1 {
                    remaining
                } else {
                    proportional_share(d_tick, seg_dur, d_sec).min(remaining)
                };

                self.fill_gaps(start);
                self.upsert(start, quote.price, alloc, quote.precision);

                remaining -= alloc;
                cursor = seg_end;
            }

            // A quote exactly on a boundary still opens its own bucket.
            let closing = bucket_start(ts1, self.frame_secs);
            if !self.candles.contains_key(&closing) {
                self.fill_gaps(closing);
                self.upsert(closing, quote.price, 0, quote.precision);
            }
        }

        // The tick counter may reset upstream; only the timestamp is monotonic.
        self.last_seen = Some((ts0.max(ts1), tick1));
    }

    /// Drop candles whose bucket starts before `min_start_sec`.
    ///
    /// Returns the number of candles removed.
    pub fn evict_older_than(&mut self, min_start_sec: i64) -> usize {
        let mut evicted = 0;
        while let Some(entry) = self.candles.first_entry() {
            if *entry.key() >= min_start_sec {
                break;
            }
            entry.remove();
            evicted += 1;
        }
        evicted
    }

    pub fn view(&self) -> &BTreeMap<i64, Candle> {
        &self.candles
    }

    pub fn latest(&self) -> Option<&Candle> {
        self.candles.last_key_value().map(|(_, c)| c)
    }

    /// Most recently touched candle, even if evicted.
    pub fn last_known(&self) -> Option<&Candle> {
        self.last_known.as_ref()
    }

    pub fn frame_secs(&self) -> i64 {
        self.frame_secs
    }

    /// Flat candles from the last bucket up to (excluding) `start`.
    fn fill_gaps(&mut self, start: i64) {
        let Some((&last_start, last)) = self.candles.last_key_value() else {
            return;
        };
        let close = last.close;
        let precision = last.precision;

        let mut gap = last_start.checked_add(self.frame_secs);
        while let Some(bucket) = gap.filter(|g| *g < start) {
            self.candles
                .entry(bucket)
                .or_insert_with(|| Candle::flat(bucket, close, precision));
            gap = bucket.checked_add(self.frame_secs);
        }
    }

    fn upsert(&mut self, start: i64, price: Decimal, ticks: u64, precision: Option<u32>) {
        let candle = match self.candles.get(&start) {
            Some(existing) => existing.updated(price, ticks, precision),
            None => Candle::open_at(start, price, ticks, precision),
        };
        self.last_known = Some(candle.clone());
        self.candles.insert(start, candle);
    }
}

/// `round(total * part / whole)`, half away from zero.
fn proportional_share(total: u64, part: i64, whole: i64) -> u64 {
    let num = i128::from(total) * i128::from(part);
    let den = i128::from(whole.max(1));
    u64::try_from((2 * num + den) / (2 * den)).unwrap_or(u64::MAX)
}

/// Candles for every symbol, fed by a replaying consumer.
pub struct CandleProjection {
    config: CandleConfig,
    initial_window: Duration,
    clock: Arc<dyn Clock>,
    aggregators: BTreeMap<SymbolKey, TimeCandleAggregator>,
    updates: broadcast::Sender<CandleUpdated>,
}

impl CandleProjection {
    pub fn new(
        config: CandleConfig,
        initial_window: Duration,
        clock: Arc<dyn Clock>,
        update_capacity: usize,
    ) -> Self {
        let (updates, _) = broadcast::channel(update_capacity.max(1));
        Self {
            config,
            initial_window,
            clock,
            aggregators: BTreeMap::new(),
            updates,
        }
    }

    /// Sender of "candle updated" signals; subscribe before seeding to see
    /// the rebuild signals too.
    pub fn updates(&self) -> broadcast::Sender<CandleUpdated> {
        self.updates.clone()
    }

    /// Candles whose bucket starts within the trailing `window`.
    pub fn candles(&self, key: &SymbolKey, window: Duration) -> Vec<Candle> {
        let Some(agg) = self.aggregators.get(key) else {
            return Vec::new();
        };
        let min_start = self.clock.now_unix_secs() - secs(window);
        agg.view().range(min_start..).map(|(_, c)| c.clone()).collect()
    }

    /// The full retained series of `key`.
    pub fn view(&self, key: &SymbolKey) -> BTreeMap<i64, Candle> {
        self.aggregators
            .get(key)
            .map(|agg| agg.view().clone())
            .unwrap_or_default()
    }

    pub fn latest_candle(&self, key: &SymbolKey) -> Option<Candle> {
        self.aggregators.get(key)?.latest().cloned()
    }

    pub fn last_known_candle(&self, key: &SymbolKey) -> Option<Candle> {
        self.aggregators.get(key)?.last_known().cloned()
    }

    pub fn symbols(&self) -> Vec<SymbolKey> {
        self.aggregators.keys().cloned().collect()
    }

    fn aggregator(&mut self, key: &SymbolKey) -> &mut TimeCandleAggregator {
        let frame_secs = self.config.frame_secs;
        self.aggregators
            .entry(key.clone())
            .or_insert_with(|| TimeCandleAggregator::new(frame_secs))
    }

    fn announce(&self, key: SymbolKey) {
        let _ = self.updates.send(CandleUpdated { key });
    }
}

impl Projection for CandleProjection {
    fn name(&self) -> &'static str {
        "candles"
    }

    fn initial_snapshot_window(&self) -> Duration {
        self.initial_window
    }

    fn rebuild_from_snapshot(&mut self, snapshot: &Snapshot) {
        self.aggregators.clear();
        for (key, quotes) in &snapshot.window_per_symbol {
            let agg = self.aggregator(key);
            for quote in quotes {
                agg.accept_quote(quote);
            }
        }
        debug!(
            seq = snapshot.seq,
            symbols = self.aggregators.len(),
            "Candles rebuilt"
        );
        let keys: Vec<SymbolKey> = self.aggregators.keys().cloned().collect();
        for key in keys {
            self.announce(key);
        }
    }

    fn apply_changes(&mut self, changes: &[ChangeRecord]) {
        let min_start = self.clock.now_unix_secs() - secs(self.config.retention);
        let mut updated = std::collections::BTreeSet::new();

        for change in changes {
            let agg = self.aggregator(&change.key);
            agg.accept_quote(change.quote());
            let evicted = agg.evict_older_than(min_start);
            if evicted > 0 {
                trace!(symbol = %change.key, evicted, "Evicted candles");
            }
            updated.insert(change.key.clone());
        }

        for key in updated {
            self.announce(key);
        }
    }
}

/// Query surface of the candle consumer.
impl ReplayingConsumer<CandleProjection> {
    pub fn candles(&self, key: &SymbolKey, window: Duration) -> Vec<Candle> {
        self.read(|p| p.candles(key, window))
    }

    pub fn view(&self, key: &SymbolKey) -> BTreeMap<i64, Candle> {
        self.read(|p| p.view(key))
    }

    pub fn latest_candle(&self, key: &SymbolKey) -> Option<Candle> {
        self.read(|p| p.latest_candle(key))
    }

    pub fn last_known_candle(&self, key: &SymbolKey) -> Option<Candle> {
        self.read(|p| p.last_known_candle(key))
    }
}

fn secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use proptest::prelude::*;

    fn quote(ts: i64, tick: i64, price: i64) -> Quote {
        Quote::new(SymbolKey::new("133962", "22", "last"), ts, Decimal::from(price), tick)
            .with_precision(2)
    }

    fn total_ticks(agg: &TimeCandleAggregator) -> u64 {
        agg.view().values().map(|c| c.tick_count).sum()
    }

    #[test]
    fn test_first_quote_opens_candle() {
        let mut agg = TimeCandleAggregator::new(60);
        agg.accept_quote(&quote(75, 40, 100));

        let candles = agg.view();
        assert_eq!(candles.len(), 1);
        let candle = &candles[&60];
        assert_eq!(candle.open, Decimal::from(100));
        assert_eq!(candle.close, Decimal::from(100));
        assert_eq!(candle.tick_count, 1);
        assert_eq!(candle.precision, Some(2));
    }

    #[test]
    fn test_ticks_spread_across_buckets() {
        let mut agg = TimeCandleAggregator::new(60);
        agg.accept_quote(&quote(0, 0, 100));
        agg.accept_quote(&quote(125, 10, 110));

        let candles = agg.view();
        assert_eq!(candles.keys().copied().collect::<Vec<_>>(), vec![0, 60, 120]);

        let first = &candles[&0];
        assert_eq!(first.open, Decimal::from(100));
        assert_eq!(first.high, Decimal::from(110));
        assert_eq!(first.close, Decimal::from(110));
        // 1 opening tick + round(10 * 60 / 125)
        assert_eq!(first.tick_count, 6);
        assert_eq!(candles[&60].tick_count, 5);
        assert_eq!(candles[&120].tick_count, 0);
        assert_eq!(candles[&120].close, Decimal::from(110));

        assert_eq!(total_ticks(&agg), 11);
        assert!(candles.values().all(Candle::is_valid));
    }

    #[test]
    fn test_last_segment_absorbs_remainder() {
        let mut agg = TimeCandleAggregator::new(60);
        agg.accept_quote(&quote(30, 0, 100));
        agg.accept_quote(&quote(100, 7, 101));

        // [30,60) gets round(7*30/70)=3, [60,100) takes the remaining 4.
        assert_eq!(agg.view()[&0].tick_count, 1 + 3);
        assert_eq!(agg.view()[&60].tick_count, 4);
    }

    #[test]
    fn test_boundary_quote_opens_bucket() {
        let mut agg = TimeCandleAggregator::new(60);
        agg.accept_quote(&quote(100, 0, 100));
        agg.accept_quote(&quote(120, 4, 101));

        let candles = agg.view();
        assert_eq!(candles.keys().copied().collect::<Vec<_>>(), vec![60, 120]);
        assert_eq!(candles[&60].tick_count, 1 + 4);
        assert_eq!(candles[&120].tick_count, 0);
        assert_eq!(candles[&120].open, Decimal::from(101));
        assert_eq!(agg.last_known().unwrap().bucket_start_sec, 120);
    }

    #[test]
    fn test_gap_filled_with_flat_candles() {
        let mut agg = TimeCandleAggregator::new(60);
        agg.accept_quote(&quote(10, 0, 100));
        // Drop the cursor so the next quote opens without a walk.
        agg.last_seen = None;
        agg.accept_quote(&quote(250, 9, 120));

        let candles = agg.view();
        assert_eq!(candles.keys().copied().collect::<Vec<_>>(), vec![0, 60, 120, 180, 240]);
        for start in [60, 120, 180] {
            let flat = &candles[&start];
            assert_eq!(flat.open, Decimal::from(100));
            assert_eq!(flat.high, Decimal::from(100));
            assert_eq!(flat.low, Decimal::from(100));
            assert_eq!(flat.close, Decimal::from(100));
            assert_eq!(flat.tick_count, 0);
            assert_eq!(flat.precision, Some(2));
        }
        assert_eq!(candles[&240].open, Decimal::from(120));
        assert_eq!(candles[&240].tick_count, 1);
    }

    #[test]
    fn test_late_quote_folds_into_current_bucket() {
        let mut agg = TimeCandleAggregator::new(60);
        agg.accept_quote(&quote(70, 0, 100));
        agg.accept_quote(&quote(65, 3, 90));
        agg.accept_quote(&quote(70, 2, 95));

        let candles = agg.view();
        assert_eq!(candles.len(), 1);
        let candle = &candles[&60];
        assert_eq!(candle.low, Decimal::from(90));
        assert_eq!(candle.close, Decimal::from(95));
        // Tick counter going backwards adds nothing.
        assert_eq!(candle.tick_count, 1 + 3);
    }

    #[test]
    fn test_tick_counter_reset_resumes_counting() {
        let mut agg = TimeCandleAggregator::new(60);
        agg.accept_quote(&quote(0, 1_000, 100));
        agg.accept_quote(&quote(10, 5, 101));
        let before = total_ticks(&agg);

        agg.accept_quote(&quote(20, 15, 102));
        assert_eq!(total_ticks(&agg) - before, 10);
        assert_eq!(agg.view()[&0].tick_count, 1 + 10);
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        let mut agg = TimeCandleAggregator::new(60);
        agg.accept_quote(&quote(i64::MAX - 10, 0, 100));
        agg.accept_quote(&quote(i64::MAX, i64::MAX, 101));
        assert_eq!(total_ticks(&agg), 1 + i64::MAX as u64);
        assert_eq!(agg.latest().unwrap().close, Decimal::from(101));
    }

    #[test]
    fn test_eviction_keeps_last_known() {
        let mut agg = TimeCandleAggregator::new(60);
        agg.accept_quote(&quote(0, 0, 100));
        agg.accept_quote(&quote(130, 4, 101));

        assert_eq!(agg.evict_older_than(120), 2);
        assert_eq!(agg.view().len(), 1);
        assert_eq!(agg.evict_older_than(1_000), 1);
        assert!(agg.latest().is_none());
        assert_eq!(agg.last_known().unwrap().bucket_start_sec, 120);
        assert_eq!(agg.last_known().unwrap().close, Decimal::from(101));
    }

    #[test]
    fn test_projection_queries_and_signals() {
        let clock = Arc::new(ManualClock::new(600));
        let mut projection = CandleProjection::new(
            CandleConfig::default(),
            Duration::from_secs(1800),
            clock.clone(),
            16,
        );
        let mut rx = projection.updates().subscribe();
        let key = SymbolKey::new("133962", "22", "last");

        let changes: Vec<ChangeRecord> = [quote(400, 0, 100), quote(590, 5, 104)]
            .into_iter()
            .enumerate()
            .map(|(i, q)| ChangeRecord::quote_change(i as u64 + 1, Arc::new(q)))
            .collect();
        projection.apply_changes(&changes);

        // One signal per updated symbol per batch.
        assert_eq!(rx.try_recv().unwrap(), CandleUpdated { key: key.clone() });
        assert!(rx.try_recv().is_err());

        assert_eq!(projection.view(&key).len(), 4);
        assert_eq!(projection.candles(&key, Duration::from_secs(120)).len(), 2);
        assert_eq!(projection.latest_candle(&key).unwrap().bucket_start_sec, 540);
        assert_eq!(projection.last_known_candle(&key).unwrap().close, Decimal::from(104));

        let unknown = SymbolKey::new("1", "1", "bid");
        assert!(projection.candles(&unknown, Duration::from_secs(60)).is_empty());
        assert!(projection.latest_candle(&unknown).is_none());
        assert!(projection.last_known_candle(&unknown).is_none());
    }

    #[test]
    fn test_projection_evicts_by_retention() {
        let clock = Arc::new(ManualClock::new(0));
        let config = CandleConfig {
            frame_secs: 60,
            retention: Duration::from_secs(120),
        };
        let mut projection = CandleProjection::new(config, Duration::from_secs(1800), clock.clone(), 16);
        let key = SymbolKey::new("133962", "22", "last");

        projection.apply_changes(&[ChangeRecord::quote_change(1, Arc::new(quote(0, 0, 100)))]);
        clock.set(400);
        projection.apply_changes(&[ChangeRecord::quote_change(2, Arc::new(quote(400, 1, 101)))]);

        let view = projection.view(&key);
        assert!(view.keys().all(|start| *start >= 280));
        assert_eq!(projection.latest_candle(&key).unwrap().bucket_start_sec, 360);
    }

    #[test]
    fn test_rebuild_replaces_state() {
        let clock = Arc::new(ManualClock::new(1_000));
        let mut projection =
            CandleProjection::new(CandleConfig::default(), Duration::from_secs(1800), clock, 16);
        let mut rx = projection.updates().subscribe();
        let key = SymbolKey::new("133962", "22", "last");
        let stale = SymbolKey::new("9", "9", "last");

        let stale_quote = Arc::new(Quote::new(stale, 900, Decimal::ONE, 0));
        projection.apply_changes(&[ChangeRecord::quote_change(1, stale_quote)]);
        let _ = rx.try_recv();

        let mut snapshot = Snapshot {
            seq: 5,
            ..Snapshot::default()
        };
        snapshot
            .window_per_symbol
            .insert(key.clone(), vec![Arc::new(quote(900, 0, 100)), Arc::new(quote(960, 2, 101))]);
        projection.rebuild_from_snapshot(&snapshot);

        assert_eq!(projection.symbols(), vec![key.clone()]);
        assert_eq!(projection.view(&key).len(), 2);
        assert_eq!(rx.try_recv().unwrap(), CandleUpdated { key });
    }

    proptest! {
        #[test]
        fn prop_series_is_contiguous(steps in prop::collection::vec((0i64..400, 0i64..50), 1..40)) {
            let mut agg = TimeCandleAggregator::new(60);
            let (mut ts, mut tick) = (1_000i64, 0i64);
            let first_ts = ts;
            agg.accept_quote(&quote(ts, tick, 100));
            for (dt, dtick) in steps {
                ts += dt;
                tick += dtick;
                agg.accept_quote(&quote(ts, tick, 100 + dtick));
            }

            let starts: Vec<i64> = agg.view().keys().copied().collect();
            let expected: Vec<i64> = (bucket_start(first_ts, 60)..=bucket_start(ts, 60))
                .step_by(60)
                .collect();
            prop_assert_eq!(starts, expected);
            prop_assert!(agg.view().values().all(Candle::is_valid));
        }

        #[test]
        fn prop_ticks_are_conserved(
            dt in -30i64..600,
            d_tick in -5i64..500,
            start in 0i64..600,
        ) {
            let mut agg = TimeCandleAggregator::new(60);
            agg.accept_quote(&quote(start, 100, 10));
            let before = total_ticks(&agg);

            agg.accept_quote(&quote(start + dt, 100 + d_tick, 11));
            let added = total_ticks(&agg) - before;
            prop_assert_eq!(added, d_tick.max(0) as u64);
        }
    }
}
