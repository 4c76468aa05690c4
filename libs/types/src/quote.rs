//! Quote and delta quote types
//!
//! A `Quote` is a full snapshot of one stream at one second. A `DeltaQuote`
//! is the sparse update the feed sends afterwards; `merge_delta` folds a
//! delta onto the previous quote to produce the next full quote.
//!
//! Wire names follow the client contract (`s`, `tsUnixSec`, `subId`, ...)
//! and decimals serialize as JSON numbers.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::{SubscriptionId, SymbolKey, LAST_CHANNEL};

/// Full quote of a stream at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    /// Stream identity
    #[serde(rename = "s")]
    pub key: SymbolKey,
    /// Unix seconds
    #[serde(rename = "tsUnixSec")]
    pub timestamp_sec: i64,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub high: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub low: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub open: Option<Decimal>,
    /// Official previous close, the reference for `abs`/`rel`
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub prev_close: Option<Decimal>,
    /// Absolute change against previous close
    #[serde(with = "rust_decimal::serde::float")]
    pub abs: Decimal,
    /// Relative change against previous close (0.01 == 1%)
    #[serde(with = "rust_decimal::serde::float")]
    pub rel: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub tick_size: Decimal,
    pub active: bool,
    /// Monotonic tick counter of the stream
    pub tick: i64,
    #[serde(default, rename = "subId")]
    pub subscription_id: Option<SubscriptionId>,
    /// Decimal places used for display
    #[serde(default)]
    pub precision: Option<u32>,
}

impl Quote {
    /// Minimal quote: price only, everything else neutral.
    pub fn new(key: SymbolKey, timestamp_sec: i64, price: Decimal, tick: i64) -> Self {
        Self {
            key,
            timestamp_sec,
            price,
            high: None,
            low: None,
            open: None,
            prev_close: None,
            abs: Decimal::ZERO,
            rel: Decimal::ZERO,
            tick_size: Decimal::ZERO,
            active: true,
            tick,
            subscription_id: None,
            precision: None,
        }
    }

    pub fn with_subscription_id(mut self, id: SubscriptionId) -> Self {
        self.subscription_id = Some(id);
        self
    }

    pub fn with_precision(mut self, precision: u32) -> Self {
        self.precision = Some(precision);
        self
    }
}

/// Sparse update for a stream referenced by subscription id.
///
/// `None` means "unchanged".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaQuote {
    pub subscription_id: SubscriptionId,
    pub new_price: Option<Decimal>,
    pub seconds_since_last: Option<i64>,
    pub tick_delta: Option<i64>,
    pub new_high: Option<Decimal>,
    pub new_low: Option<Decimal>,
    pub volume_delta_pct: Option<Decimal>,
    pub turnover_abs: Option<Decimal>,
}

impl DeltaQuote {
    /// Delta carrying no changes.
    pub fn new(subscription_id: SubscriptionId) -> Self {
        Self {
            subscription_id,
            new_price: None,
            seconds_since_last: None,
            tick_delta: None,
            new_high: None,
            new_low: None,
            volume_delta_pct: None,
            turnover_abs: None,
        }
    }

    pub fn with_price(mut self, price: Decimal) -> Self {
        self.new_price = Some(price);
        self
    }

    pub fn with_elapsed(mut self, seconds: i64) -> Self {
        self.seconds_since_last = Some(seconds);
        self
    }

    pub fn with_tick_delta(mut self, ticks: i64) -> Self {
        self.tick_delta = Some(ticks);
        self
    }
}

/// Merge a delta onto the previous quote of `key`.
///
/// Returns `None` when there is neither a previous quote nor a new price.
/// `channel` is the channel registered for the delta's subscription id and
/// `now_sec` is the timestamp base when no previous quote exists.
pub fn merge_delta(
    key: &SymbolKey,
    prev: Option<&Quote>,
    delta: &DeltaQuote,
    channel: Option<&str>,
    now_sec: i64,
) -> Option<Quote> {
    if prev.is_none() && delta.new_price.is_none() {
        return None;
    }

    let price = delta
        .new_price
        .or(prev.map(|p| p.price))
        .unwrap_or(Decimal::ZERO);

    // An offset that would overflow is treated like an absent field.
    let base_ts = prev.map_or(now_sec, |p| p.timestamp_sec);
    let timestamp_sec = delta
        .seconds_since_last
        .and_then(|secs| base_ts.checked_add(secs))
        .unwrap_or(base_ts);

    let base_tick = prev.map_or(0, |p| p.tick);
    let tick = delta
        .tick_delta
        .and_then(|ticks| base_tick.checked_add(ticks))
        .unwrap_or(base_tick);

    let mut high = delta.new_high.or(prev.and_then(|p| p.high));
    let mut low = delta.new_low.or(prev.and_then(|p| p.low));
    if let Some(px) = delta.new_price {
        high = Some(high.map_or(px, |h| h.max(px)));
        low = Some(low.map_or(px, |l| l.min(px)));
    }

    let mut abs = prev.map_or(Decimal::ZERO, |p| p.abs);
    let mut rel = prev.map_or(Decimal::ZERO, |p| p.rel);
    if let Some(v) = delta.volume_delta_pct {
        rel = v;
    }
    if channel == Some(LAST_CHANNEL) {
        if let Some(turnover) = delta.turnover_abs {
            abs = turnover;
        }
    }

    // Change against the official previous close wins over raw delta fields.
    if let (Some(prev), Some(px)) = (prev, delta.new_price) {
        if let Some(prev_close) = prev.prev_close {
            if let Some(change) = px.checked_sub(prev_close) {
                abs = change;
            }
            if !prev_close.is_zero() {
                if let Some(ratio) = px.checked_div(prev_close) {
                    rel = ratio - Decimal::ONE;
                }
            }
        }
    }

    Some(Quote {
        key: key.clone(),
        timestamp_sec,
        price,
        high,
        low,
        open: prev.and_then(|p| p.open),
        prev_close: prev.and_then(|p| p.prev_close),
        abs,
        rel,
        tick_size: prev.map_or(Decimal::ZERO, |p| p.tick_size),
        active: prev.is_some_and(|p| p.active),
        tick,
        subscription_id: Some(delta.subscription_id),
        precision: prev.and_then(|p| p.precision),
    })
}
