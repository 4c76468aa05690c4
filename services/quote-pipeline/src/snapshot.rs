//! Point-in-time export of the market data buffer
//!
//! A snapshot seeds a replaying consumer: it carries the seq it is
//! consistent with, the subscription maps, the last quote of every symbol
//! and a windowed slice of each symbol's recent history. Quotes are shared
//! with the buffer (`Arc`), never copied.

use std::collections::BTreeMap;
use std::sync::Arc;

use quote_types::ids::{SubscriptionId, SymbolKey};
use quote_types::quote::Quote;

use crate::events::Seq;

/// Consistent copy of buffer state at `seq`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Last seq included in this snapshot.
    pub seq: Seq,
    pub id_to_key: BTreeMap<SubscriptionId, SymbolKey>,
    pub id_to_channel: BTreeMap<SubscriptionId, String>,
    pub last_per_symbol: BTreeMap<SymbolKey, Arc<Quote>>,
    /// Oldest first; symbols with no quote inside the window are absent.
    pub window_per_symbol: BTreeMap<SymbolKey, Vec<Arc<Quote>>>,
}

impl Snapshot {
    /// Windowed quotes of one symbol, oldest first.
    pub fn window_for(&self, key: &SymbolKey) -> &[Arc<Quote>] {
        self.window_per_symbol
            .get(key)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn last_for(&self, key: &SymbolKey) -> Option<&Arc<Quote>> {
        self.last_per_symbol.get(key)
    }

    /// Number of symbols with windowed history.
    pub fn symbol_count(&self) -> usize {
        self.window_per_symbol.len()
    }

    /// Total windowed quotes across all symbols.
    pub fn quote_count(&self) -> usize {
        self.window_per_symbol.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.seq == 0
    }
}
