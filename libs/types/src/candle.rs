//! OHLC candle type and bucket arithmetic
//!
//! Candle boundaries are aligned to the Unix epoch: a 60s candle starting at
//! `t` covers `[t, t + 60)`. Candles are values; an update produces a new
//! candle for the same bucket.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Default candle width in seconds.
pub const DEFAULT_FRAME_SECS: i64 = 60;

/// Floor a timestamp to its bucket start.
///
/// Uses euclidean division so pre-epoch timestamps floor downwards too.
pub fn bucket_start(timestamp_sec: i64, frame_secs: i64) -> i64 {
    timestamp_sec.div_euclid(frame_secs).saturating_mul(frame_secs)
}

/// Exclusive end of the bucket containing `timestamp_sec`.
pub fn bucket_end(timestamp_sec: i64, frame_secs: i64) -> i64 {
    bucket_start(timestamp_sec, frame_secs).saturating_add(frame_secs)
}

/// A single OHLC candle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub bucket_start_sec: i64,
    #[serde(with = "rust_decimal::serde::float")]
    pub open: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub high: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub low: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub close: Decimal,
    /// Estimated number of ticks inside the bucket
    #[serde(rename = "ticks")]
    pub tick_count: u64,
    #[serde(default)]
    pub precision: Option<u32>,
}

impl Candle {
    /// Open a candle at `price`.
    pub fn open_at(bucket_start_sec: i64, price: Decimal, ticks: u64, precision: Option<u32>) -> Self {
        Self {
            bucket_start_sec,
            open: price,
            high: price,
            low: price,
            close: price,
            tick_count: ticks,
            precision,
        }
    }

    /// Create a flat (no-tick) candle for gap filling.
    pub fn flat(bucket_start_sec: i64, prev_close: Decimal, precision: Option<u32>) -> Self {
        Self::open_at(bucket_start_sec, prev_close, 0, precision)
    }

    /// Next version of this candle after observing `price`.
    ///
    /// `open` is kept; `precision` follows the triggering quote.
    pub fn updated(&self, price: Decimal, add_ticks: u64, precision: Option<u32>) -> Self {
        Self {
            bucket_start_sec: self.bucket_start_sec,
            open: self.open,
            high: self.high.max(price),
            low: self.low.min(price),
            close: price,
            tick_count: self.tick_count.saturating_add(add_ticks),
            precision,
        }
    }

    /// Validate candle integrity (OHLC invariants).
    pub fn is_valid(&self) -> bool {
        self.high >= self.open
            && self.high >= self.close
            && self.high >= self.low
            && self.low <= self.open
            && self.low <= self.close
    }
}
