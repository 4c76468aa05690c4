//! Client-facing message contract
//!
//! Inbound:
//! - `{"action":"subscribe","symbolId":"133962","venueId":"22","channel":"last","window":3600}`
//! - `{"action":"unsubscribe", ...}` with the same fields
//! - `{"type":"ping"}`
//!
//! Outbound messages are tagged by `type`: `candles` / `quotes` carry the
//! initial window for a new subscription, `candle` / `quote` carry live
//! updates, plus `pong` and `error`.

use serde::{Deserialize, Serialize};

use quote_types::candle::Candle;
use quote_types::errors::KeyError;
use quote_types::ids::{SymbolKey, LAST_CHANNEL};
use quote_types::quote::Quote;

/// Window used when a subscription does not ask for a positive one.
pub const DEFAULT_WINDOW_SECS: u64 = 3600;

/// Symbol selection of a subscribe / unsubscribe request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub symbol_id: String,
    pub venue_id: String,
    #[serde(default)]
    pub channel: Option<String>,
    /// Trailing window in seconds for the initial payload
    #[serde(default)]
    pub window: Option<i64>,
}

impl SubscriptionRequest {
    /// Requested key; the channel defaults to `last`.
    pub fn key(&self) -> Result<SymbolKey, KeyError> {
        let channel = self.channel.as_deref().unwrap_or(LAST_CHANNEL);
        if self.symbol_id.is_empty() || self.venue_id.is_empty() || channel.is_empty() {
            return Err(KeyError::Malformed(format!(
                "{}:{}:{}",
                self.symbol_id, self.venue_id, channel
            )));
        }
        Ok(SymbolKey::new(self.symbol_id.as_str(), self.venue_id.as_str(), channel))
    }

    pub fn window_secs(&self) -> u64 {
        self.window
            .and_then(|w| u64::try_from(w).ok())
            .filter(|w| *w > 0)
            .unwrap_or(DEFAULT_WINDOW_SECS)
    }
}

/// Subscription management, tagged by `action`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum SubscriptionMessage {
    Subscribe(SubscriptionRequest),
    Unsubscribe(SubscriptionRequest),
}

/// Connection control, tagged by `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Ping,
}

/// Any message a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientMessage {
    Control(ControlMessage),
    Subscription(SubscriptionMessage),
}

impl ClientMessage {
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Any message the server sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Initial candle window of a subscription
    Candles { key: SymbolKey, data: Vec<Candle> },
    /// Initial quote window of a subscription
    Quotes { key: SymbolKey, data: Vec<Quote> },
    /// Live candle update
    Candle { key: SymbolKey, data: Candle },
    /// Live quote update
    Quote { key: SymbolKey, data: Quote },
    Pong,
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl std::fmt::Display) -> Self {
        ServerMessage::Error {
            message: message.to_string(),
        }
    }

    /// Type tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Candles { .. } => "candles",
            ServerMessage::Quotes { .. } => "quotes",
            ServerMessage::Candle { .. } => "candle",
            ServerMessage::Quote { .. } => "quote",
            ServerMessage::Pong => "pong",
            ServerMessage::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
