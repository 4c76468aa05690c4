//! Quote Pipeline
//!
//! Distributes real-time quote updates and derives OHLC candles from the
//! same stream:
//! - Sequenced, append-only quote buffer with snapshot and incremental poll
//! - Snapshot-then-catch-up consumers that keep private views in step
//! - Fixed-width candle aggregation with tick interpolation and gap filling
//! - Short per-symbol quote history with last-known fallback
//! - Tagged client messages for the fan-out layer
//!
//! # Architecture
//!
//! ```text
//!  Upstream feed frames
//!        │
//!  ┌─────▼──────┐
//!  │   Buffer   │  ← assigns seq, keeps log + per-symbol history
//!  └─────┬──────┘
//!        │ BufferAdvanced { seq }
//!   ┌────┴──────────────┐
//!   │                   │
//! ┌─▼───────┐    ┌──────▼───────┐
//! │ Candles │    │ ShortHistory │  ← poll_since(last_applied, batch)
//! └─┬───────┘    └──────┬───────┘
//!   │ CandleUpdated     │ QuoteUpdated
//! ┌─▼───────────────────▼─┐
//! │    Fan-out layer      │
//! └───────────────────────┘
//! ```

pub mod buffer;
pub mod candles;
pub mod clock;
pub mod config;
pub mod events;
pub mod history;
pub mod messages;
pub mod metrics;
pub mod pipeline;
pub mod replay;
pub mod snapshot;

pub use buffer::MarketDataBuffer;
pub use pipeline::MarketDataPipeline;

