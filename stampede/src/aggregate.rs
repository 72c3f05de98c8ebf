use std::{collections::BTreeMap, fmt::Debug, time::Duration};

use hdrhistogram::Histogram;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::metric::{Metric, Outcome, StepMetric};

/// The `Aggregate` trait defines how raw [`Metric`] values are collected into an
/// intermediate representation that keeps what later analysis needs.
///
/// Aggregates should **not** compute final statistics such as averages or
/// percentiles; that belongs to a [`crate::Report`], which is derived from the
/// aggregate. Aggregates store compact raw data (counters, histograms, error
/// tallies) so any report can be computed from them without loss.
///
/// # Example
/// ```rust
/// use stampede::{Aggregate, metric::StepMetric};
///
/// #[derive(Debug, Clone)]
/// struct KoCounter(u64);
///
/// impl Aggregate for KoCounter {
///     type Metric = StepMetric;
///
///     fn new() -> Self {
///         Self(0)
///     }
///
///     fn consume(&mut self, metric: &StepMetric) {
///         self.0 += u64::from(!metric.outcome.is_ok());
///     }
/// }
/// ```
pub trait Aggregate
where
    Self: Send + Sync + Debug + Clone + 'static,
{
    /// The metric type this aggregate summarizes.
    type Metric: Metric;

    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Aggregate multiple metrics into the current instance.
    ///
    /// This default implementation calls [`Aggregate::consume`] for each metric.
    fn aggregate(&mut self, metrics: &[Self::Metric]) {
        metrics.iter().for_each(|m| self.consume(m));
    }

    /// Incorporate a single metric into the aggregate.
    fn consume(&mut self, metric: &Self::Metric);
}

/// Raw counters and latency distribution of one step (or of all steps).
///
/// Latencies are kept in microseconds in an auto-resizing HDR histogram with
/// three significant figures.
#[derive(Debug, Clone)]
pub struct StepStats {
    pub ok: u64,
    pub ko: u64,
    pub latencies: Histogram<u64>,
    /// KO reasons and how often each occurred.
    pub errors: BTreeMap<String, u64>,
}

impl StepStats {
    pub fn new() -> Self {
        Self {
            ok: 0,
            ko: 0,
            latencies: Histogram::new(3).expect("3 significant figures is a valid precision"),
            errors: BTreeMap::new(),
        }
    }

    pub fn total(&self) -> u64 {
        self.ok + self.ko
    }

    pub fn record(&mut self, outcome: &Outcome, latency: Duration) {
        match outcome {
            Outcome::Ok => self.ok += 1,
            Outcome::Ko(reason) => {
                self.ko += 1;
                *self.errors.entry(reason.clone()).or_default() += 1;
            }
        }
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        if let Err(err) = self.latencies.record(micros) {
            tracing::warn!("Latency sample of {micros}us not recorded: {err:?}");
        }
    }

    /// Share of KO outcomes, 0-100.
    pub fn ko_percent(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.ko as f64 * 100.0 / total as f64,
        }
    }

    /// Latency at `percentile` (0-100), in milliseconds. Zero when nothing was
    /// recorded.
    pub fn percentile_ms(&self, percentile: f64) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }
        let quantile = (percentile / 100.0).clamp(0.0, 1.0);
        self.latencies.value_at_quantile(quantile) as f64 / 1_000.0
    }

    pub fn min_ms(&self) -> f64 {
        self.ms(self.latencies.min())
    }

    pub fn mean_ms(&self) -> f64 {
        if self.latencies.is_empty() {
            0.0
        } else {
            self.latencies.mean() / 1_000.0
        }
    }

    pub fn max_ms(&self) -> f64 {
        self.ms(self.latencies.max())
    }

    fn ms(&self, micros: u64) -> f64 {
        if self.latencies.is_empty() {
            0.0
        } else {
            micros as f64 / 1_000.0
        }
    }
}

impl Default for StepStats {
    fn default() -> Self {
        Self::new()
    }
}

/// The engine's built-in [`Aggregate`]: per-step and global [`StepStats`].
#[derive(Debug, Clone, Default)]
pub struct StatsAggregate {
    pub steps: BTreeMap<String, StepStats>,
    pub global: StepStats,
}

impl StatsAggregate {
    pub fn step(&self, name: &str) -> Option<&StepStats> {
        self.steps.get(name)
    }

    /// Number of recorded step outcomes.
    pub fn total(&self) -> u64 {
        self.global.total()
    }
}

impl Aggregate for StatsAggregate {
    type Metric = StepMetric;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, metric: &Self::Metric) {
        self.steps
            .entry(metric.step.clone())
            .or_default()
            .record(&metric.outcome, metric.latency);
        self.global.record(&metric.outcome, metric.latency);
    }
}

/// Cloneable handle through which virtual users report step outcomes.
///
/// Recording only enqueues the metric; a single aggregation task owns the
/// aggregate, so callers never contend on a lock.
#[derive(Debug, Clone)]
pub struct StatsRecorder {
    tx: mpsc::UnboundedSender<StepMetric>,
    started: Instant,
}

impl StatsRecorder {
    pub fn record(&self, step: impl Into<String>, outcome: Outcome, latency: Duration) {
        let metric = StepMetric {
            step: step.into(),
            outcome,
            latency,
            at: self.started.elapsed(),
        };
        if self.tx.send(metric).is_err() {
            tracing::debug!("Stats aggregation already finished, dropping metric");
        }
    }
}

/// Starts the aggregation task.
///
/// The task drains metrics in batches, publishes a snapshot every
/// `snapshot_interval`, and returns the final aggregate once every
/// [`StatsRecorder`] has been dropped.
pub(crate) fn spawn_stats<A>(
    started: Instant,
    snapshot_interval: Duration,
    batch_size: usize,
) -> (
    StatsRecorder,
    watch::Receiver<A>,
    JoinHandle<A>,
)
where
    A: Aggregate<Metric = StepMetric>,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let (snap_tx, snap_rx) = watch::channel(A::new());
    let handle = tokio::spawn(aggregator_task(rx, batch_size, snap_tx, snapshot_interval));
    (StatsRecorder { tx, started }, snap_rx, handle)
}

/// Tokio task for efficient metric aggregation
pub(crate) async fn aggregator_task<A: Aggregate>(
    mut rx: mpsc::UnboundedReceiver<A::Metric>,
    batch_size: usize,
    snapshots: watch::Sender<A>,
    snapshot_interval: Duration,
) -> A {
    let mut agg = A::new();
    let mut batch = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(snapshot_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            received = rx.recv() => {
                // Receive the first metric or end the loop once all recorders are gone
                match received {
                    Some(metric) => batch.push(metric),
                    None => break,
                }
                // Then everything else that is already queued
                while batch.len() < batch_size {
                    match rx.try_recv() {
                        Ok(metric) => batch.push(metric),
                        Err(_) => break,
                    }
                }
                agg.aggregate(&batch);
                batch.clear();
            }
            _ = ticker.tick() => {
                snapshots.send_replace(agg.clone());
            }
        }
    }

    tracing::debug!("All recorders dropped, publishing final stats");
    snapshots.send_replace(agg.clone());
    agg
}
