//! Snapshot-then-catch-up consumers
//!
//! A `ReplayingConsumer` owns one `Projection` (candles, short history) and
//! keeps it in step with the buffer:
//!
//! 1. on construction it seeds the projection from
//!    `buffer.snapshot(projection.initial_snapshot_window())`
//! 2. on every "buffer advanced" signal it polls the log in batches of
//!    `batch_size` from its own `last_applied_seq` until it reaches the
//!    signalled seq
//!
//! If the log no longer covers the cursor (retention evicted the records),
//! the poll comes back empty while the consumer is still behind. The
//! consumer then rebuilds from a fresh snapshot unless
//! `resnapshot_on_starvation` is off, in which case it stays where it is.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::buffer::MarketDataBuffer;
use crate::config::ConsumerConfig;
use crate::events::{ChangeRecord, Seq};
use crate::metrics::PipelineMetrics;
use crate::snapshot::Snapshot;

/// A private materialized view fed by the buffer.
///
/// Both hooks are called with the consumer lock held, exactly once per
/// distinct snapshot or batch.
pub trait Projection: Send + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// How much history to request when seeding.
    fn initial_snapshot_window(&self) -> Duration;

    /// Replace all derived state.
    fn rebuild_from_snapshot(&mut self, snapshot: &Snapshot);

    /// Fold an ordered, gap-free batch into the derived state.
    fn apply_changes(&mut self, changes: &[ChangeRecord]);
}

/// Outcome of one catch-up run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatchUpReport {
    pub from_seq: Seq,
    pub to_seq: Seq,
    pub batches: usize,
    pub records: usize,
    /// A poll came back empty before the target was reached.
    pub starved: bool,
    /// The projection was rebuilt from a fresh snapshot.
    pub resnapshotted: bool,
}

struct ConsumerState<P> {
    projection: P,
    last_applied_seq: Seq,
}

/// Keeps a projection consistent with the buffer's seq.
pub struct ReplayingConsumer<P: Projection> {
    buffer: Arc<MarketDataBuffer>,
    config: ConsumerConfig,
    state: Mutex<ConsumerState<P>>,
    /// Mirror of `last_applied_seq` for lock-free reads.
    last_applied: AtomicU64,
    metrics: Arc<PipelineMetrics>,
}

impl<P: Projection> ReplayingConsumer<P> {
    /// Seed `projection` from a snapshot and return the ready consumer.
    pub fn new(buffer: Arc<MarketDataBuffer>, config: ConsumerConfig, mut projection: P) -> Self {
        let snapshot = buffer.snapshot(projection.initial_snapshot_window());
        projection.rebuild_from_snapshot(&snapshot);

        let metrics = Arc::clone(buffer.metrics());
        metrics.record_rebuild();
        info!(
            consumer = projection.name(),
            seq = snapshot.seq,
            symbols = snapshot.symbol_count(),
            quotes = snapshot.quote_count(),
            batch_size = config.batch_size,
            "Consumer seeded from snapshot"
        );

        Self {
            buffer,
            config,
            last_applied: AtomicU64::new(snapshot.seq),
            state: Mutex::new(ConsumerState {
                projection,
                last_applied_seq: snapshot.seq,
            }),
            metrics,
        }
    }

    pub fn name(&self) -> &'static str {
        self.state.lock().projection.name()
    }

    pub fn last_applied_seq(&self) -> Seq {
        self.last_applied.load(Ordering::Acquire)
    }

    pub fn buffer(&self) -> &Arc<MarketDataBuffer> {
        &self.buffer
    }

    /// Run `f` against the projection under the consumer lock.
    pub fn read<R>(&self, f: impl FnOnce(&P) -> R) -> R {
        f(&self.state.lock().projection)
    }

    /// Apply changes until `last_applied_seq >= target`.
    pub fn catch_up(&self, target: Seq) -> CatchUpReport {
        let started = Instant::now();
        let mut state = self.state.lock();
        let mut report = CatchUpReport {
            from_seq: state.last_applied_seq,
            ..CatchUpReport::default()
        };
        let batch_size = self.config.batch_size.max(1);

        while state.last_applied_seq < target {
            let batch = self.buffer.poll_since(state.last_applied_seq, batch_size);
            let Some(last_seq) = batch.last().map(|r| r.seq) else {
                report.starved = true;
                self.metrics.record_starvation();
                warn!(
                    consumer = state.projection.name(),
                    last_applied_seq = state.last_applied_seq,
                    target,
                    "Catch-up starved: log no longer covers cursor"
                );
                if self.config.resnapshot_on_starvation {
                    self.rebuild_locked(&mut state);
                    self.metrics.record_resnapshot();
                    report.resnapshotted = true;
                }
                break;
            };

            trace!(
                consumer = state.projection.name(),
                first_seq = batch[0].seq,
                last_seq,
                records = batch.len(),
                "Applying batch"
            );
            state.projection.apply_changes(&batch);
            state.last_applied_seq = last_seq;
            self.last_applied.store(last_seq, Ordering::Release);

            self.metrics.record_batch(batch.len());
            report.batches += 1;
            report.records += batch.len();
        }

        report.to_seq = state.last_applied_seq;
        drop(state);

        if report.batches > 0 || report.resnapshotted {
            let micros = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
            self.metrics.record_catch_up(micros);
            debug!(
                from_seq = report.from_seq,
                to_seq = report.to_seq,
                batches = report.batches,
                records = report.records,
                micros,
                "Catch-up completed"
            );
        }
        report
    }

    /// Catch up to whatever the buffer holds right now.
    pub fn catch_up_to_current(&self) -> CatchUpReport {
        self.catch_up(self.buffer.current_seq())
    }

    /// Discard derived state and rebuild from a fresh snapshot.
    pub fn resnapshot(&self) -> Seq {
        let mut state = self.state.lock();
        self.rebuild_locked(&mut state);
        state.last_applied_seq
    }

    fn rebuild_locked(&self, state: &mut ConsumerState<P>) {
        let snapshot = self
            .buffer
            .snapshot(state.projection.initial_snapshot_window());
        state.projection.rebuild_from_snapshot(&snapshot);
        state.last_applied_seq = snapshot.seq;
        self.last_applied.store(snapshot.seq, Ordering::Release);
        self.metrics.record_rebuild();
        info!(
            consumer = state.projection.name(),
            seq = snapshot.seq,
            symbols = snapshot.symbol_count(),
            "Consumer rebuilt from snapshot"
        );
    }

    /// Drive this consumer from the buffer's "advanced" signals on a tokio task.
    ///
    /// Subscribes before the first catch-up so no signal is missed.
    pub fn spawn(self: &Arc<Self>) -> ConsumerHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let mut signals = self.buffer.subscribe();
        let consumer = Arc::clone(self);
        let name = self.name();

        let task = tokio::spawn(async move {
            info!(consumer = name, "Consumer started");
            consumer.catch_up_to_current();

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    signal = signals.recv() => match signal {
                        Ok(advanced) => {
                            consumer.catch_up(advanced.seq);
                        }
                        Err(RecvError::Lagged(missed)) => {
                            consumer.metrics.record_lagged(missed);
                            warn!(consumer = name, missed, "Consumer lagged behind signals");
                            consumer.catch_up_to_current();
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }

            info!(
                consumer = name,
                last_applied_seq = consumer.last_applied_seq(),
                "Consumer stopped"
            );
        });

        ConsumerHandle {
            name,
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// Handle to a spawned consumer task.
pub struct ConsumerHandle {
    name: &'static str,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the task to stop and wait for it.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(consumer = self.name, error = %e, "Consumer task ended abnormally");
        }
    }
}
