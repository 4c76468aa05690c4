//! Upstream quote feed frames
//!
//! The feed speaks three text frame kinds:
//! - outbound subscribe / unsubscribe: `a133962:22:last`, `r133962:22:last`
//! - inbound initial quote: a JSON object (`{"q":..., "s":"133962:22:last", ...}`)
//! - inbound delta: `subId:value:secSinceLast:tickDelta:newHigh:newLow:vDelta:tvAbs`
//!
//! Any individual numeric field that is empty or unparsable is treated as
//! absent. Only frames that cannot be attributed to a stream are errors.

use serde::Deserialize;
use tracing::trace;

use rust_decimal::Decimal;

use crate::errors::FeedError;
use crate::ids::{SubscriptionId, SymbolKey};
use crate::numeric::{
    lenient_bool, lenient_decimal, lenient_i64, lenient_string, lenient_u32, parse_decimal,
    parse_i64,
};
use crate::quote::{DeltaQuote, Quote};

/// Parse a colon-separated delta frame.
///
/// Trailing empty fields are kept, missing trailing fields are absent.
pub fn parse_delta_frame(frame: &str) -> Result<DeltaQuote, FeedError> {
    let frame = frame.trim();
    if frame.is_empty() {
        return Err(FeedError::EmptyFrame);
    }

    let fields: Vec<&str> = frame.split(':').collect();
    let raw_id = fields[0];
    let subscription_id = raw_id
        .parse::<SubscriptionId>()
        .map_err(|_| FeedError::InvalidSubscriptionId {
            raw: raw_id.to_string(),
        })?;

    let decimal_at = |i: usize| fields.get(i).and_then(|f| parse_decimal(f));
    let int_at = |i: usize| fields.get(i).and_then(|f| parse_i64(f));

    let delta = DeltaQuote {
        subscription_id,
        new_price: decimal_at(1),
        seconds_since_last: int_at(2),
        tick_delta: int_at(3),
        new_high: decimal_at(4),
        new_low: decimal_at(5),
        volume_delta_pct: decimal_at(6),
        turnover_abs: decimal_at(7),
    };
    trace!(subscription_id = %delta.subscription_id, fields = fields.len(), "Parsed delta frame");
    Ok(delta)
}

/// Initial quote frame as sent by the feed.
///
/// Unknown fields are ignored; every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct QuoteMessage {
    #[serde(deserialize_with = "lenient_decimal")]
    pub q: Option<Decimal>,
    #[serde(deserialize_with = "lenient_decimal")]
    pub h: Option<Decimal>,
    #[serde(deserialize_with = "lenient_decimal")]
    pub l: Option<Decimal>,
    #[serde(deserialize_with = "lenient_decimal")]
    pub o: Option<Decimal>,
    #[serde(deserialize_with = "lenient_decimal")]
    pub pc: Option<Decimal>,
    #[serde(deserialize_with = "lenient_i64")]
    pub ts: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub t: Option<i64>,
    #[serde(deserialize_with = "lenient_decimal")]
    pub abs: Option<Decimal>,
    #[serde(deserialize_with = "lenient_decimal")]
    pub rel: Option<Decimal>,
    #[serde(rename = "tickSize", deserialize_with = "lenient_decimal")]
    pub tick_size: Option<Decimal>,
    #[serde(deserialize_with = "lenient_bool")]
    pub active: Option<bool>,
    #[serde(deserialize_with = "lenient_u32")]
    pub i: Option<u32>,
    #[serde(deserialize_with = "lenient_string")]
    pub s: Option<String>,
    #[serde(deserialize_with = "lenient_u32")]
    pub precision: Option<u32>,
}

impl QuoteMessage {
    pub fn parse(json: &str) -> Result<Self, FeedError> {
        serde_json::from_str(json).map_err(|e| FeedError::InvalidJson {
            reason: e.to_string(),
        })
    }

    /// Convert into a full quote.
    ///
    /// `now_sec` stands in for a missing timestamp.
    pub fn into_quote(self, now_sec: i64) -> Result<Quote, FeedError> {
        let raw_key = self.s.ok_or(FeedError::MissingSymbol)?;
        let key = SymbolKey::from_sub(&raw_key)?;
        let price = self.q.ok_or(FeedError::MissingPrice)?;

        Ok(Quote {
            key,
            timestamp_sec: self.ts.unwrap_or(now_sec),
            price,
            high: self.h,
            low: self.l,
            open: self.o,
            prev_close: self.pc,
            abs: self.abs.unwrap_or(Decimal::ZERO),
            rel: self.rel.unwrap_or(Decimal::ZERO),
            tick_size: self.tick_size.unwrap_or(Decimal::ZERO),
            active: self.active.unwrap_or(false),
            tick: self.t.unwrap_or(0),
            subscription_id: self.i.map(SubscriptionId::new),
            precision: self.precision,
        })
    }
}

/// An inbound feed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedFrame {
    Initial(QuoteMessage),
    Delta(DeltaQuote),
}

impl FeedFrame {
    /// Classify and parse a text frame: JSON objects are initial quotes,
    /// everything else is a delta.
    pub fn parse(frame: &str) -> Result<Self, FeedError> {
        let trimmed = frame.trim_start();
        if trimmed.is_empty() {
            return Err(FeedError::EmptyFrame);
        }
        if trimmed.starts_with('{') {
            QuoteMessage::parse(trimmed).map(FeedFrame::Initial)
        } else {
            parse_delta_frame(trimmed).map(FeedFrame::Delta)
        }
    }
}

/// Outbound subscription command for the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedCommand {
    Subscribe(SymbolKey),
    Unsubscribe(SymbolKey),
}

impl FeedCommand {
    /// Text frame for the feed: `a` / `r` followed by the key.
    pub fn to_frame(&self) -> String {
        match self {
            FeedCommand::Subscribe(key) => format!("a{}", key),
            FeedCommand::Unsubscribe(key) => format!("r{}", key),
        }
    }

    pub fn key(&self) -> &SymbolKey {
        match self {
            FeedCommand::Subscribe(key) | FeedCommand::Unsubscribe(key) => key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_parse_delta_frame() {
        let delta = parse_delta_frame("22:49032.72:3:5::::").unwrap();
        assert_eq!(delta.subscription_id, SubscriptionId::new(22));
        assert_eq!(delta.new_price, Some(Decimal::from_str("49032.72").unwrap()));
        assert_eq!(delta.seconds_since_last, Some(3));
        assert_eq!(delta.tick_delta, Some(5));
        assert_eq!(delta.new_high, None);
        assert_eq!(delta.new_low, None);
        assert_eq!(delta.volume_delta_pct, None);
        assert_eq!(delta.turnover_abs, None);
    }

    #[test]
    fn test_parse_delta_frame_short_and_garbled_fields() {
        let delta = parse_delta_frame("7:abc").unwrap();
        assert_eq!(delta.subscription_id, SubscriptionId::new(7));
        assert_eq!(delta.new_price, None);
        assert_eq!(delta.tick_delta, None);

        let delta = parse_delta_frame("7::1:x:10.5:9.5:0.01:1234").unwrap();
        assert_eq!(delta.seconds_since_last, Some(1));
        assert_eq!(delta.tick_delta, None);
        assert_eq!(delta.new_high, Some(Decimal::from_str("10.5").unwrap()));
        assert_eq!(delta.turnover_abs, Some(Decimal::from(1234)));
    }

    #[test]
    fn test_parse_delta_frame_rejects_bad_id() {
        assert_eq!(parse_delta_frame(""), Err(FeedError::EmptyFrame));
        assert!(matches!(
            parse_delta_frame("x:1:2"),
            Err(FeedError::InvalidSubscriptionId { .. })
        ));
    }

    #[test]
    fn test_quote_message_into_quote() {
        let json = r#"{"q":12000.0,"h":12200.0,"l":11800.0,"o":11950.0,"pc":11800.0,
            "ts":1700000000,"t":560,"abs":200.0,"rel":0.016949153,"tickSize":0.01,
            "active":true,"i":1,"s":"133979:98:bid","precision":2,"extra":"ignored"}"#;

        let quote = QuoteMessage::parse(json).unwrap().into_quote(0).unwrap();
        assert_eq!(quote.key, SymbolKey::new("133979", "98", "bid"));
        assert_eq!(quote.price, Decimal::from(12000));
        assert_eq!(quote.prev_close, Some(Decimal::from(11800)));
        assert_eq!(quote.timestamp_sec, 1_700_000_000);
        assert_eq!(quote.tick, 560);
        assert_eq!(quote.subscription_id, Some(SubscriptionId::new(1)));
        assert_eq!(quote.precision, Some(2));
        assert!(quote.active);
    }

    #[test]
    fn test_quote_message_lenient_fields() {
        let json = r#"{"q":"101.5","h":"n/a","ts":null,"t":"12","s":"1:2:last"}"#;
        let quote = QuoteMessage::parse(json).unwrap().into_quote(42).unwrap();
        assert_eq!(quote.price, Decimal::from_str("101.5").unwrap());
        assert_eq!(quote.high, None);
        assert_eq!(quote.timestamp_sec, 42);
        assert_eq!(quote.tick, 12);
        assert_eq!(quote.subscription_id, None);
    }

    #[test]
    fn test_quote_message_requires_symbol() {
        let msg = QuoteMessage::parse(r#"{"q":1}"#).unwrap();
        assert_eq!(msg.into_quote(0), Err(FeedError::MissingSymbol));

        let msg = QuoteMessage::parse(r#"{"q":1,"s":"bad"}"#).unwrap();
        assert!(matches!(msg.into_quote(0), Err(FeedError::Key(_))));

        assert!(matches!(
            QuoteMessage::parse("{not json"),
            Err(FeedError::InvalidJson { .. })
        ));
    }

    #[test]
    fn test_feed_frame_classification() {
        assert!(matches!(
            FeedFrame::parse(r#" {"q":1,"s":"1:2:last"}"#),
            Ok(FeedFrame::Initial(_))
        ));
        assert!(matches!(FeedFrame::parse("3:1.5"), Ok(FeedFrame::Delta(_))));
        assert_eq!(FeedFrame::parse("   "), Err(FeedError::EmptyFrame));
    }

    #[test]
    fn test_feed_commands() {
        let key = SymbolKey::from_sub("133962:22:last").unwrap();
        assert_eq!(FeedCommand::Subscribe(key.clone()).to_frame(), "a133962:22:last");
        assert_eq!(FeedCommand::Unsubscribe(key.clone()).to_frame(), "r133962:22:last");
        assert_eq!(FeedCommand::Subscribe(key.clone()).key(), &key);
    }
}
