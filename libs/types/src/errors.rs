//! Error types for the quote pipeline
//!
//! Comprehensive error taxonomy using thiserror. Only frames that cannot be
//! interpreted at all are errors; a bad individual numeric field resolves to
//! "absent" instead.

use thiserror::Error;

/// Symbol key parse errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Malformed symbol key (expected symbolId:venueId:channel): {0:?}")]
    Malformed(String),
}

/// Upstream feed frame errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("Empty feed frame")]
    EmptyFrame,

    #[error("Invalid subscription id in delta frame: {raw:?}")]
    InvalidSubscriptionId { raw: String },

    #[error("Invalid quote JSON: {reason}")]
    InvalidJson { reason: String },

    #[error("Quote frame has no symbol string")]
    MissingSymbol,

    #[error("Quote frame has no price")]
    MissingPrice,

    #[error("Symbol error: {0}")]
    Key(#[from] KeyError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_error_display() {
        let err = KeyError::Malformed("1:2".to_string());
        assert!(err.to_string().contains("1:2"));
    }

    #[test]
    fn test_feed_error_from_key_error() {
        let feed_err: FeedError = KeyError::Malformed("x".to_string()).into();
        assert!(matches!(feed_err, FeedError::Key(_)));
    }

    #[test]
    fn test_invalid_subscription_id_display() {
        let err = FeedError::InvalidSubscriptionId {
            raw: "abc".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid subscription id in delta frame: \"abc\""
        );
    }
}
