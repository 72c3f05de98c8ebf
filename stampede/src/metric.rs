use std::{fmt::Debug, time::Duration};

use serde::{Deserialize, Serialize};

/// A `Metric` is a single observation produced while a scenario runs.
///
/// Metrics are the most granular level of data. They are collected and
/// summarized by an [`crate::Aggregate`], then turned into figures by a
/// [`crate::Report`].
///
/// Metrics must be cheap to clone and safe to send across tasks, since every
/// virtual user produces them concurrently.
pub trait Metric
where
    Self: Send + Sync + Debug + Clone + 'static,
{
}

/// Pass/fail result of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Ok,
    /// Failed, with a human-readable reason.
    Ko(String),
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Outcome of one request executed by one virtual user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetric {
    /// Step name, prefixed by enclosing group names (`"Group / Request"`).
    pub step: String,
    pub outcome: Outcome,
    pub latency: Duration,
    /// Offset from the start of the run.
    pub at: Duration,
}

impl Metric for StepMetric {}
