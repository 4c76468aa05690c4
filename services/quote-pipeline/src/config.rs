//! Pipeline configuration
//!
//! Plain structs with documented defaults. `PipelineConfig::from_env`
//! overlays `QUOTE_PIPELINE_*` environment variables on top of them.

use std::time::Duration;

use thiserror::Error;

/// Prefix of all environment overrides.
pub const ENV_PREFIX: &str = "QUOTE_PIPELINE_";

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

/// Configuration for the market data buffer.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Age limit for per-symbol history and log entries.
    pub retention: Duration,
    /// Hard cap on retained change records.
    pub log_max_records: usize,
    /// Capacity of the "buffer advanced" broadcast channel.
    pub signal_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3600),
            log_max_records: 200_000,
            signal_capacity: 1024,
        }
    }
}

/// Configuration shared by replaying consumers.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Max change records pulled per poll.
    pub batch_size: usize,
    /// History window requested from the initial snapshot.
    pub initial_window: Duration,
    /// Rebuild from a fresh snapshot when the log no longer covers the cursor.
    pub resnapshot_on_starvation: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            initial_window: Duration::from_secs(30 * 60),
            resnapshot_on_starvation: true,
        }
    }
}

/// Configuration for candle aggregation.
#[derive(Debug, Clone)]
pub struct CandleConfig {
    /// Candle width in seconds.
    pub frame_secs: i64,
    /// Candles whose bucket starts before `now - retention` are evicted.
    pub retention: Duration,
}

impl Default for CandleConfig {
    fn default() -> Self {
        Self {
            frame_secs: quote_types::candle::DEFAULT_FRAME_SECS,
            retention: Duration::from_secs(3600),
        }
    }
}

/// Configuration for the short quote history.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub retention: Duration,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3600),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub buffer: BufferConfig,
    pub consumer: ConsumerConfig,
    pub candles: CandleConfig,
    pub history: HistoryConfig,
    /// Capacity of the candle/quote update broadcast channels.
    pub update_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer: BufferConfig::default(),
            consumer: ConsumerConfig::default(),
            candles: CandleConfig::default(),
            history: HistoryConfig::default(),
            update_capacity: 1024,
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with `QUOTE_PIPELINE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup` (full variable name → value).
    ///
    /// `RETENTION_SECS` applies to the buffer, candles and history alike.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secs) = read_u64(&lookup, "RETENTION_SECS")? {
            let retention = Duration::from_secs(secs);
            config.buffer.retention = retention;
            config.candles.retention = retention;
            config.history.retention = retention;
        }
        if let Some(max) = read_u64(&lookup, "LOG_MAX_RECORDS")? {
            config.buffer.log_max_records = to_positive_usize("LOG_MAX_RECORDS", max)?;
        }
        if let Some(capacity) = read_u64(&lookup, "SIGNAL_CAPACITY")? {
            let capacity = to_positive_usize("SIGNAL_CAPACITY", capacity)?;
            config.buffer.signal_capacity = capacity;
            config.update_capacity = capacity;
        }
        if let Some(batch) = read_u64(&lookup, "BATCH_SIZE")? {
            config.consumer.batch_size = to_positive_usize("BATCH_SIZE", batch)?;
        }
        if let Some(secs) = read_u64(&lookup, "INITIAL_WINDOW_SECS")? {
            config.consumer.initial_window = Duration::from_secs(secs);
        }
        if let Some(frame) = read_u64(&lookup, "CANDLE_FRAME_SECS")? {
            config.candles.frame_secs = i64::try_from(frame)
                .ok()
                .filter(|f| *f > 0)
                .ok_or_else(|| invalid("CANDLE_FRAME_SECS", frame))?;
        }

        Ok(config)
    }
}

fn read_u64<F>(lookup: &F, suffix: &str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let key = format!("{ENV_PREFIX}{suffix}");
    match lookup(&key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

fn to_positive_usize(suffix: &str, value: u64) -> Result<usize, ConfigError> {
    usize::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| invalid(suffix, value))
}

fn invalid(suffix: &str, value: u64) -> ConfigError {
    ConfigError::Invalid {
        key: format!("{ENV_PREFIX}{suffix}"),
        value: value.to_string(),
    }
}
