use std::{collections::BTreeMap, fmt, fmt::Debug, future::Future};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::aggregate::{Aggregate, StatsAggregate, StepStats};

/// A `Report` is the final, human- or machine-friendly result of a run,
/// derived from an [`Aggregate`].
///
/// This is where statistics such as percentiles and error ratios are
/// computed. Reports are serializable so they can be stored or compared.
pub trait Report<A>
where
    Self: Send + Sync + Debug + From<A> + Serialize + DeserializeOwned,
    A: Aggregate,
{
}

/// Sends a [`Report`] somewhere: stdout, a file, a database.
pub trait Reporter<A: Aggregate, R: Report<A>> {
    fn report(
        &self,
        report: &R,
    ) -> impl Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>> + Send;
}

/// Figures of one step (or of all steps). Times are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub name: String,
    pub total: u64,
    pub ok: u64,
    pub ko: u64,
    pub ko_percent: f64,
    pub min_ms: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p75_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
    pub errors: BTreeMap<String, u64>,
}

impl StepReport {
    fn new(name: &str, stats: &StepStats) -> Self {
        Self {
            name: name.to_owned(),
            total: stats.total(),
            ok: stats.ok,
            ko: stats.ko,
            ko_percent: stats.ko_percent(),
            min_ms: stats.min_ms(),
            mean_ms: stats.mean_ms(),
            p50_ms: stats.percentile_ms(50.0),
            p75_ms: stats.percentile_ms(75.0),
            p95_ms: stats.percentile_ms(95.0),
            p99_ms: stats.percentile_ms(99.0),
            max_ms: stats.max_ms(),
            errors: stats.errors.clone(),
        }
    }

    pub fn ok_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 - self.ko_percent
        }
    }
}

/// The built-in [`Report`] of a [`StatsAggregate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    pub global: StepReport,
    /// Ordered by step name.
    pub steps: Vec<StepReport>,
}

impl StatsReport {
    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.name == name)
    }
}

impl From<StatsAggregate> for StatsReport {
    fn from(value: StatsAggregate) -> Self {
        Self {
            global: StepReport::new("Global", &value.global),
            steps: value
                .steps
                .iter()
                .map(|(name, stats)| StepReport::new(name, stats))
                .collect(),
        }
    }
}

impl Report<StatsAggregate> for StatsReport {}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .steps
            .iter()
            .map(|s| s.name.len())
            .chain([self.global.name.len()])
            .max()
            .unwrap_or(0);
        writeln!(
            f,
            "{:<width$} {:>8} {:>8} {:>8} {:>7} {:>9} {:>9} {:>9} {:>9} {:>9}",
            "Request", "Total", "OK", "KO", "KO%", "Mean", "p50", "p95", "p99", "Max"
        )?;
        for step in self.steps.iter().chain([&self.global]) {
            writeln!(
                f,
                "{:<width$} {:>8} {:>8} {:>8} {:>6.2}% {:>7.1}ms {:>7.1}ms {:>7.1}ms {:>7.1}ms {:>7.1}ms",
                step.name,
                step.total,
                step.ok,
                step.ko,
                step.ko_percent,
                step.mean_ms,
                step.p50_ms,
                step.p95_ms,
                step.p99_ms,
                step.max_ms,
            )?;
        }
        if !self.global.errors.is_empty() {
            writeln!(f, "\nErrors:")?;
            for (reason, count) in &self.global.errors {
                writeln!(f, "  {count:>6}  {reason}")?;
            }
        }
        Ok(())
    }
}

/// Prints a [`StatsReport`] as a table.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutReporter;

impl Reporter<StatsAggregate, StatsReport> for StdoutReporter {
    async fn report(
        &self,
        report: &StatsReport,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        println!("{report}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{Outcome, StepMetric};
    use std::time::Duration;

    fn aggregate() -> StatsAggregate {
        let mut agg = StatsAggregate::new();
        let metric = |step: &str, outcome, ms| StepMetric {
            step: step.into(),
            outcome,
            latency: Duration::from_millis(ms),
            at: Duration::ZERO,
        };
        for ms in 1..=100 {
            agg.consume(&metric("Get", Outcome::Ok, ms));
        }
        agg.consume(&metric("Post", Outcome::Ko("status".into()), 200));
        agg.consume(&metric("Post", Outcome::Ok, 100));
        agg
    }

    #[test]
    fn figures_per_step_and_global() {
        let report = StatsReport::from(aggregate());

        let get = report.step("Get").unwrap();
        assert_eq!((get.total, get.ok, get.ko), (100, 100, 0));
        assert_eq!(get.ko_percent, 0.0);
        assert!((get.p50_ms - 50.0).abs() < 0.5);
        assert!((get.p95_ms - 95.0).abs() < 0.5);
        assert!((get.max_ms - 100.0).abs() < 0.5);
        assert!((get.mean_ms - 50.5).abs() < 0.5);

        let post = report.step("Post").unwrap();
        assert_eq!(post.ko_percent, 50.0);
        assert_eq!(post.ok_percent(), 50.0);
        assert_eq!(post.errors["status"], 1);

        assert_eq!(report.global.total, 102);
        assert_eq!(report.global.ko, 1);
        assert_eq!(report.steps.len(), 2);
    }

    #[test]
    fn empty_report_is_all_zero() {
        let report = StatsReport::from(StatsAggregate::new());
        assert_eq!(report.global.total, 0);
        assert_eq!(report.global.max_ms, 0.0);
        assert_eq!(report.global.ok_percent(), 0.0);
        assert!(report.steps.is_empty());
    }

    #[test]
    fn serializes_with_named_fields() {
        let json = serde_json::to_value(StatsReport::from(aggregate())).unwrap();
        assert_eq!(json["global"]["total"], 102);
        assert_eq!(json["steps"][1]["name"], "Post");
        assert_eq!(json["steps"][1]["ko_percent"], 50.0);
    }

    #[test]
    fn table_lists_steps_and_errors() {
        let table = StatsReport::from(aggregate()).to_string();
        assert!(table.contains("Get"));
        assert!(table.contains("Post"));
        assert!(table.contains("Global"));
        assert!(table.contains("status"));
    }
}
