//! Change records and pipeline signals
//!
//! `ChangeRecord` is the unit stored in the buffer log. Every record carries
//! the buffer-wide sequence number it was assigned on append; consumers use
//! it as their catch-up cursor.
//!
//! The signal structs travel over `tokio::sync::broadcast` channels and only
//! say *that* something advanced; receivers read the data themselves.

use std::sync::Arc;

use quote_types::ids::{SubscriptionId, SymbolKey};
use quote_types::quote::Quote;

/// Buffer-wide sequence number. `0` means "no changes yet".
pub type Seq = u64;

/// One appended change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// Strictly increasing, 1-based
    pub seq: Seq,
    /// Unix seconds of the change
    pub timestamp_sec: i64,
    /// Upstream id the change arrived under, if known
    pub subscription_id: Option<SubscriptionId>,
    pub key: SymbolKey,
    pub payload: ChangePayload,
}

/// Change-specific payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangePayload {
    /// The full quote after the change was applied
    Quote(Arc<Quote>),
}

impl ChangeRecord {
    pub fn quote_change(seq: Seq, quote: Arc<Quote>) -> Self {
        Self {
            seq,
            timestamp_sec: quote.timestamp_sec,
            subscription_id: quote.subscription_id,
            key: quote.key.clone(),
            payload: ChangePayload::Quote(quote),
        }
    }

    /// The quote carried by this change.
    pub fn quote(&self) -> &Arc<Quote> {
        match &self.payload {
            ChangePayload::Quote(quote) => quote,
        }
    }

    /// Get the change type as a string label for logging.
    pub fn change_type_label(&self) -> &'static str {
        match &self.payload {
            ChangePayload::Quote(_) => "QuoteChange",
        }
    }
}

/// Ordering by sequence number
impl Ord for ChangeRecord {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.seq.cmp(&other.seq)
    }
}

impl PartialOrd for ChangeRecord {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Raised after every successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferAdvanced {
    /// Seq of the change that was just appended
    pub seq: Seq,
}

/// Raised by the candle consumer for every symbol whose candles changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandleUpdated {
    pub key: SymbolKey,
}

/// Raised by the short-history consumer for every symbol with new quotes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteUpdated {
    pub key: SymbolKey,
}
