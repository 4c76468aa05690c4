//! Types library for the quote pipeline
//!
//! Value types shared by the sequenced market-data buffer, its replaying
//! consumers and the feed/client boundaries. Everything here is an immutable
//! value: quotes and candles are replaced, never mutated in place, once they
//! leave the function that built them.
//!
//! # Modules
//! - `ids`: Stream identity (`SymbolKey`) and upstream subscription ids
//! - `numeric`: Lenient decimal parsing used by every feed field
//! - `quote`: Full quotes, sparse deltas and the delta merge rule
//! - `candle`: OHLC candles and bucket arithmetic
//! - `feed`: Upstream feed frames (delta frames, initial JSON quotes, sub/unsub)
//! - `errors`: Error taxonomy

pub mod candle;
pub mod errors;
pub mod feed;
pub mod ids;
pub mod numeric;
pub mod quote;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::candle::*;
    pub use crate::errors::*;
    pub use crate::feed::*;
    pub use crate::ids::*;
    pub use crate::numeric::*;
    pub use crate::quote::*;
}
