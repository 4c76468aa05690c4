//! Pipeline facade
//!
//! Wires one buffer to the candle and short-history consumers and exposes
//! what the fan-out layer needs: feed ingestion, read-only queries, update
//! signals and ready-to-send client messages.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use quote_types::candle::Candle;
use quote_types::errors::FeedError;
use quote_types::feed::{FeedCommand, FeedFrame};
use quote_types::ids::SymbolKey;
use quote_types::quote::{DeltaQuote, Quote};

use crate::buffer::MarketDataBuffer;
use crate::candles::CandleProjection;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, PipelineConfig};
use crate::events::{CandleUpdated, QuoteUpdated, Seq};
use crate::history::ShortHistoryProjection;
use crate::messages::{ClientMessage, ControlMessage, ServerMessage, SubscriptionMessage};
use crate::metrics::PipelineMetrics;
use crate::replay::{CatchUpReport, ConsumerHandle, ReplayingConsumer};

pub type CandleConsumer = ReplayingConsumer<CandleProjection>;
pub type HistoryConsumer = ReplayingConsumer<ShortHistoryProjection>;

/// What to send back to a client, and what to tell the upstream feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientReply {
    pub messages: Vec<ServerMessage>,
    pub feed_command: Option<FeedCommand>,
}

/// Buffer plus its derived views.
pub struct MarketDataPipeline {
    clock: Arc<dyn Clock>,
    buffer: Arc<MarketDataBuffer>,
    candles: Arc<CandleConsumer>,
    history: Arc<HistoryConsumer>,
    candle_updates: broadcast::Sender<CandleUpdated>,
    quote_updates: broadcast::Sender<QuoteUpdated>,
    handles: Mutex<Vec<ConsumerHandle>>,
}

impl MarketDataPipeline {
    pub fn new(config: PipelineConfig, clock: Arc<dyn Clock>) -> Self {
        let metrics = Arc::new(PipelineMetrics::new());
        let buffer = Arc::new(MarketDataBuffer::with_metrics(
            config.buffer.clone(),
            Arc::clone(&clock),
            metrics,
        ));

        let candle_projection = CandleProjection::new(
            config.candles.clone(),
            config.consumer.initial_window,
            Arc::clone(&clock),
            config.update_capacity,
        );
        let candle_updates = candle_projection.updates();

        let history_projection = ShortHistoryProjection::new(
            config.history.clone(),
            config.consumer.initial_window,
            Arc::clone(&clock),
            config.update_capacity,
        );
        let quote_updates = history_projection.updates();

        let candles = Arc::new(ReplayingConsumer::new(
            Arc::clone(&buffer),
            config.consumer.clone(),
            candle_projection,
        ));
        let history = Arc::new(ReplayingConsumer::new(
            Arc::clone(&buffer),
            config.consumer.clone(),
            history_projection,
        ));

        info!(
            frame_secs = config.candles.frame_secs,
            retention_secs = config.buffer.retention.as_secs(),
            "MarketDataPipeline initialized"
        );

        Self {
            clock,
            buffer,
            candles,
            history,
            candle_updates,
            quote_updates,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Pipeline on the system clock with `QUOTE_PIPELINE_*` overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(PipelineConfig::from_env()?, Arc::new(SystemClock)))
    }

    pub fn buffer(&self) -> &Arc<MarketDataBuffer> {
        &self.buffer
    }

    pub fn candle_consumer(&self) -> &Arc<CandleConsumer> {
        &self.candles
    }

    pub fn history_consumer(&self) -> &Arc<HistoryConsumer> {
        &self.history
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        self.buffer.metrics()
    }

    /// Parse one upstream text frame and append it.
    ///
    /// `Ok(None)` is a no-op append (unknown subscription id, nothing to
    /// merge); errors are frames that cannot be attributed to any stream.
    pub fn ingest_frame(&self, frame: &str) -> Result<Option<Seq>, FeedError> {
        let seq = match FeedFrame::parse(frame)? {
            FeedFrame::Initial(message) => {
                let quote = message.into_quote(self.clock.now_unix_secs())?;
                self.buffer.append_full(quote)
            }
            FeedFrame::Delta(delta) => self.buffer.append_delta(&delta),
        };
        if seq.is_none() {
            debug!(frame, "Feed frame produced no change");
        }
        Ok(seq)
    }

    pub fn append_full(&self, quote: Quote) -> Option<Seq> {
        self.buffer.append_full(quote)
    }

    pub fn append_delta(&self, delta: &DeltaQuote) -> Option<Seq> {
        self.buffer.append_delta(delta)
    }

    pub fn subscribe_candle_updates(&self) -> broadcast::Receiver<CandleUpdated> {
        self.candle_updates.subscribe()
    }

    pub fn subscribe_quote_updates(&self) -> broadcast::Receiver<QuoteUpdated> {
        self.quote_updates.subscribe()
    }

    pub fn get_candles(&self, key: &SymbolKey, window: Duration) -> Vec<Candle> {
        self.candles.candles(key, window)
    }

    pub fn get_latest_candle(&self, key: &SymbolKey) -> Option<Candle> {
        self.candles.latest_candle(key)
    }

    pub fn get_last_known_candle(&self, key: &SymbolKey) -> Option<Candle> {
        self.candles.last_known_candle(key)
    }

    pub fn get_quotes(&self, key: &SymbolKey, window: Duration) -> Vec<Arc<Quote>> {
        self.history.quotes(key, window)
    }

    pub fn get_last(&self, key: &SymbolKey) -> Option<Arc<Quote>> {
        self.history.last(key)
    }

    pub fn get_last_known(&self, key: &SymbolKey) -> Option<Arc<Quote>> {
        self.history.last_known(key)
    }

    /// Initial payload for a new subscriber: candles then quotes in `window`,
    /// each falling back to the last-known value when the window is empty.
    pub fn initial_messages(&self, key: &SymbolKey, window: Duration) -> Vec<ServerMessage> {
        let mut candles = self.get_candles(key, window);
        if candles.is_empty() {
            candles.extend(self.get_last_known_candle(key));
        }

        let mut quotes: Vec<Quote> = self
            .get_quotes(key, window)
            .iter()
            .map(|q| q.as_ref().clone())
            .collect();
        if quotes.is_empty() {
            quotes.extend(self.get_last_known(key).map(|q| q.as_ref().clone()));
        }

        vec![
            ServerMessage::Candles {
                key: key.clone(),
                data: candles,
            },
            ServerMessage::Quotes {
                key: key.clone(),
                data: quotes,
            },
        ]
    }

    /// Live candle message: latest candle, else last-known.
    pub fn candle_update(&self, key: &SymbolKey) -> Option<ServerMessage> {
        let data = self
            .get_latest_candle(key)
            .or_else(|| self.get_last_known_candle(key))?;
        Some(ServerMessage::Candle {
            key: key.clone(),
            data,
        })
    }

    /// Live quote message: most recent quote, else last-known.
    pub fn quote_update(&self, key: &SymbolKey) -> Option<ServerMessage> {
        let quote = self.get_last(key).or_else(|| self.get_last_known(key))?;
        Some(ServerMessage::Quote {
            key: key.clone(),
            data: quote.as_ref().clone(),
        })
    }

    /// Interpret one client text message.
    pub fn handle_client_text(&self, text: &str) -> ClientReply {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Rejecting client message");
                return ClientReply {
                    messages: vec![ServerMessage::error(format!("invalid message: {e}"))],
                    feed_command: None,
                };
            }
        };

        match message {
            ClientMessage::Control(ControlMessage::Ping) => ClientReply {
                messages: vec![ServerMessage::Pong],
                feed_command: None,
            },
            ClientMessage::Subscription(SubscriptionMessage::Subscribe(request)) => {
                match request.key() {
                    Ok(key) => {
                        let window = Duration::from_secs(request.window_secs());
                        debug!(symbol = %key, window_secs = window.as_secs(), "Client subscribed");
                        ClientReply {
                            messages: self.initial_messages(&key, window),
                            feed_command: Some(FeedCommand::Subscribe(key)),
                        }
                    }
                    Err(e) => ClientReply {
                        messages: vec![ServerMessage::error(e)],
                        feed_command: None,
                    },
                }
            }
            ClientMessage::Subscription(SubscriptionMessage::Unsubscribe(request)) => {
                match request.key() {
                    Ok(key) => ClientReply {
                        messages: Vec::new(),
                        feed_command: Some(FeedCommand::Unsubscribe(key)),
                    },
                    Err(e) => ClientReply {
                        messages: vec![ServerMessage::error(e)],
                        feed_command: None,
                    },
                }
            }
        }
    }

    /// Synchronously bring both consumers up to the buffer's current seq.
    pub fn catch_up(&self) -> (CatchUpReport, CatchUpReport) {
        (
            self.candles.catch_up_to_current(),
            self.history.catch_up_to_current(),
        )
    }

    /// Start both consumer tasks. Must be called inside a tokio runtime.
    pub fn spawn(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            warn!("Consumers already running");
            return;
        }
        handles.push(self.candles.spawn());
        handles.push(self.history.spawn());
    }

    /// Stop the consumer tasks and wait for them to finish.
    pub async fn stop(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            handle.shutdown().await;
        }
    }
}
