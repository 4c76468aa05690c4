//! Identity types for quote streams
//!
//! A `SymbolKey` names one tradable quote stream (instrument, venue and
//! price channel). The upstream feed refers to streams by a numeric
//! `SubscriptionId` once the first full quote has been delivered; the
//! buffer keeps the id → key mapping.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::KeyError;

/// Channel name of the "last traded price" stream.
///
/// Delta turnover (`turnoverAbs`) is only meaningful on this channel.
pub const LAST_CHANNEL: &str = "last";

/// Identity of one quote stream: `symbolId:venueId:channel`.
///
/// Equality, hashing and ordering are by value, so the key is usable in
/// `HashMap` and `BTreeMap` alike.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolKey {
    pub symbol_id: String,
    pub venue_id: String,
    pub channel: String,
}

impl SymbolKey {
    pub fn new(
        symbol_id: impl Into<String>,
        venue_id: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            symbol_id: symbol_id.into(),
            venue_id: venue_id.into(),
            channel: channel.into(),
        }
    }

    /// Parse a subscription string such as `133962:22:last`.
    pub fn from_sub(sub: &str) -> Result<Self, KeyError> {
        let mut parts = sub.trim().splitn(3, ':');
        let symbol_id = parts.next().unwrap_or_default();
        let venue_id = parts.next().unwrap_or_default();
        let channel = parts.next().unwrap_or_default();

        if symbol_id.is_empty() || venue_id.is_empty() || channel.is_empty() {
            return Err(KeyError::Malformed(sub.to_string()));
        }

        Ok(Self::new(symbol_id, venue_id, channel))
    }
}

impl FromStr for SymbolKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_sub(s)
    }
}

impl fmt::Display for SymbolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.symbol_id, self.venue_id, self.channel)
    }
}

/// Numeric stream id assigned by the upstream feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(u32);

impl SubscriptionId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(&self) -> u32 {
        self.0
    }
}

impl From<u32> for SubscriptionId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl FromStr for SubscriptionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u32>().map(Self)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_symbol_key_from_sub() {
        let key = SymbolKey::from_sub("133962:22:last").unwrap();
        assert_eq!(key.symbol_id, "133962");
        assert_eq!(key.venue_id, "22");
        assert_eq!(key.channel, LAST_CHANNEL);
    }

    #[test]
    fn test_symbol_key_rejects_short_input() {
        assert!(SymbolKey::from_sub("133962:22").is_err());
        assert!(SymbolKey::from_sub("133962::last").is_err());
        assert!(SymbolKey::from_sub("").is_err());
    }

    #[test]
    fn test_symbol_key_display_roundtrip() {
        let key = SymbolKey::new("133979", "98", "bid");
        assert_eq!(key.to_string(), "133979:98:bid");
        assert_eq!("133979:98:bid".parse::<SymbolKey>().unwrap(), key);
    }

    #[test]
    fn test_symbol_key_value_equality() {
        let mut set = HashSet::new();
        set.insert(SymbolKey::new("1", "2", "last"));
        set.insert(SymbolKey::new("1", "2", "last"));
        set.insert(SymbolKey::new("1", "2", "bid"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_symbol_key_serializes_camel_case() {
        let key = SymbolKey::new("133962", "22", "last");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, r#"{"symbolId":"133962","venueId":"22","channel":"last"}"#);
    }

    #[test]
    fn test_subscription_id_parse() {
        assert_eq!("22".parse::<SubscriptionId>().unwrap(), SubscriptionId::new(22));
        assert!("x".parse::<SubscriptionId>().is_err());
    }
}
