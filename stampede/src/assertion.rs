//! Pass/fail criteria evaluated against a finished run's stats.
//!
//! ```rust
//! use stampede::assertion::Assertion;
//!
//! let assertions = [
//!     Assertion::global().failed_percent().lt(5.0),
//!     Assertion::global().max_response_time().lte(2_000.0),
//!     Assertion::step("Get all video games").percentile(95.0).lt(500.0),
//! ];
//! assert_eq!(assertions[0].to_string(), "Global: failed requests % < 5");
//! ```
//!
//! Cancelled users never produce records, so they do not count towards any
//! assertion.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::aggregate::{StatsAggregate, StepStats};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scope {
    Global,
    /// A single step, by its stats name.
    Step(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Target {
    RequestCount,
    FailedCount,
    FailedPercent,
    SuccessfulPercent,
    /// Milliseconds.
    MaxResponseTime,
    /// Milliseconds.
    MeanResponseTime,
    /// Milliseconds at the given percentile (0-100), read from the full
    /// latency histogram.
    Percentile(f64),
}

impl Target {
    fn measure(&self, stats: &StepStats) -> f64 {
        match *self {
            Self::RequestCount => stats.total() as f64,
            Self::FailedCount => stats.ko as f64,
            Self::FailedPercent => stats.ko_percent(),
            Self::SuccessfulPercent if stats.total() == 0 => 0.0,
            Self::SuccessfulPercent => 100.0 - stats.ko_percent(),
            Self::MaxResponseTime => stats.max_ms(),
            Self::MeanResponseTime => stats.mean_ms(),
            Self::Percentile(p) => stats.percentile_ms(p),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Bound {
    Lt(f64),
    Lte(f64),
    Gt(f64),
    Gte(f64),
    Is(f64),
    /// Inclusive.
    Between(f64, f64),
}

impl Bound {
    fn holds(&self, value: f64) -> bool {
        match *self {
            Self::Lt(b) => value < b,
            Self::Lte(b) => value <= b,
            Self::Gt(b) => value > b,
            Self::Gte(b) => value >= b,
            Self::Is(b) => value == b,
            Self::Between(lo, hi) => value >= lo && value <= hi,
        }
    }
}

/// A criterion on one figure of a run's stats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    pub scope: Scope,
    pub target: Target,
    pub bound: Bound,
}

/// First half of an [`Assertion`]: what is being measured.
#[derive(Debug, Clone)]
pub struct Measure {
    scope: Scope,
    target: Target,
}

/// Entry point of an [`Assertion`]: where it is measured.
#[derive(Debug, Clone)]
pub struct ScopeBuilder(Scope);

impl Assertion {
    pub fn global() -> ScopeBuilder {
        ScopeBuilder(Scope::Global)
    }

    pub fn step(name: impl Into<String>) -> ScopeBuilder {
        ScopeBuilder(Scope::Step(name.into()))
    }

    /// Checks this assertion against `stats`.
    pub fn evaluate(&self, stats: &StatsAggregate) -> AssertionResult {
        let step = match &self.scope {
            Scope::Global => Some(&stats.global),
            Scope::Step(name) => stats.step(name),
        };
        let actual = step.map(|s| self.target.measure(s));
        AssertionResult {
            assertion: self.clone(),
            actual,
            passed: actual.is_some_and(|v| self.bound.holds(v)),
        }
    }
}

impl ScopeBuilder {
    fn measure(self, target: Target) -> Measure {
        Measure {
            scope: self.0,
            target,
        }
    }

    pub fn request_count(self) -> Measure {
        self.measure(Target::RequestCount)
    }

    pub fn failed_count(self) -> Measure {
        self.measure(Target::FailedCount)
    }

    pub fn failed_percent(self) -> Measure {
        self.measure(Target::FailedPercent)
    }

    pub fn successful_percent(self) -> Measure {
        self.measure(Target::SuccessfulPercent)
    }

    pub fn max_response_time(self) -> Measure {
        self.measure(Target::MaxResponseTime)
    }

    pub fn mean_response_time(self) -> Measure {
        self.measure(Target::MeanResponseTime)
    }

    pub fn percentile(self, percentile: f64) -> Measure {
        self.measure(Target::Percentile(percentile))
    }
}

impl Measure {
    fn bound(self, bound: Bound) -> Assertion {
        Assertion {
            scope: self.scope,
            target: self.target,
            bound,
        }
    }

    pub fn lt(self, value: f64) -> Assertion {
        self.bound(Bound::Lt(value))
    }

    pub fn lte(self, value: f64) -> Assertion {
        self.bound(Bound::Lte(value))
    }

    pub fn gt(self, value: f64) -> Assertion {
        self.bound(Bound::Gt(value))
    }

    pub fn gte(self, value: f64) -> Assertion {
        self.bound(Bound::Gte(value))
    }

    pub fn is(self, value: f64) -> Assertion {
        self.bound(Bound::Is(value))
    }

    pub fn between(self, min: f64, max: f64) -> Assertion {
        self.bound(Bound::Between(min, max))
    }
}

impl fmt::Display for Assertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Scope::Global => f.write_str("Global: ")?,
            Scope::Step(name) => write!(f, "{name}: ")?,
        }
        match self.target {
            Target::RequestCount => f.write_str("requests")?,
            Target::FailedCount => f.write_str("failed requests")?,
            Target::FailedPercent => f.write_str("failed requests %")?,
            Target::SuccessfulPercent => f.write_str("successful requests %")?,
            Target::MaxResponseTime => f.write_str("max response time (ms)")?,
            Target::MeanResponseTime => f.write_str("mean response time (ms)")?,
            Target::Percentile(p) => write!(f, "p{p} response time (ms)")?,
        }
        match self.bound {
            Bound::Lt(b) => write!(f, " < {b}"),
            Bound::Lte(b) => write!(f, " <= {b}"),
            Bound::Gt(b) => write!(f, " > {b}"),
            Bound::Gte(b) => write!(f, " >= {b}"),
            Bound::Is(b) => write!(f, " == {b}"),
            Bound::Between(lo, hi) => write!(f, " in [{lo}, {hi}]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssertionResult {
    pub assertion: Assertion,
    /// `None` when the scoped step never ran.
    pub actual: Option<f64>,
    pub passed: bool,
}

impl fmt::Display for AssertionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.passed { "OK" } else { "KO" };
        match self.actual {
            Some(actual) => write!(f, "{}: {verdict} (actual {actual})", self.assertion),
            None => write!(f, "{}: {verdict} (no data)", self.assertion),
        }
    }
}

/// Evaluates every assertion; the run passes when all results passed.
pub fn evaluate_all<'a, I>(assertions: I, stats: &StatsAggregate) -> Vec<AssertionResult>
where
    I: IntoIterator<Item = &'a Assertion>,
{
    assertions
        .into_iter()
        .map(|a| a.evaluate(stats))
        .inspect(|r| {
            if !r.passed {
                tracing::warn!("Assertion failed: {r}");
            }
        })
        .collect()
}
