//! Streaming aggregation of request outcomes and threshold evaluation.

use std::time::Duration;

use futures::StreamExt;
use tracing::{event, Level};

use crate::{
    report::{RequestKind, RequestOutcome},
    threshold::{Aggregation, Metric, Threshold},
    Receiver, CRATE_NAME,
};

/// Every observed latency in milliseconds. Percentiles are exact (nearest rank).
#[derive(Debug, Default)]
pub(crate) struct Histogram {
    values: Vec<f64>,
    sum: f64,
    sorted: bool,
}

impl Histogram {
    fn observe(&mut self, value: f64) {
        self.values.push(value);
        self.sum += value;
        self.sorted = false;
    }

    fn sort(&mut self) {
        if !self.sorted {
            self.values.sort_unstable_by(f64::total_cmp);
            self.sorted = true;
        }
    }

    fn percentile(&mut self, percentile: f64) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        self.sort();
        let rank = (percentile / 100.0 * self.values.len() as f64).ceil() as usize;
        let index = rank.clamp(1, self.values.len()) - 1;
        Some(self.values[index])
    }

    fn min(&mut self) -> Option<f64> {
        self.percentile(0.0)
    }

    fn max(&mut self) -> Option<f64> {
        self.percentile(100.0)
    }

    fn avg(&self) -> Option<f64> {
        (!self.values.is_empty()).then(|| self.sum / self.values.len() as f64)
    }

    fn aggregate(&mut self, aggregation: Aggregation) -> Option<f64> {
        match aggregation {
            Aggregation::Percentile(p) => self.percentile(p),
            Aggregation::Avg => self.avg(),
            Aggregation::Min => self.min(),
            Aggregation::Max => self.max(),
            Aggregation::Med => self.percentile(50.0),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct CheckStats {
    pub passed: u64,
    pub failed: u64,
}

/// Running totals over every outcome seen so far.
#[derive(Debug, Default)]
pub struct Aggregate {
    total: u64,
    failed: u64,
    checks: [CheckStats; 3],
    latency: Histogram,
}

impl Aggregate {
    pub fn observe(&mut self, outcome: RequestOutcome) {
        self.total += 1;
        let check = &mut self.checks[outcome.kind.index()];
        if outcome.is_success() {
            check.passed += 1;
        } else {
            self.failed += 1;
            check.failed += 1;
        }
        self.latency.observe(outcome.latency.as_nanos() as f64 / 1e6);
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    /// Failed outcomes over all outcomes, zero when nothing was observed.
    pub fn failure_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failed as f64 / self.total as f64
        }
    }

    /// Value of `metric`, `None` when no request was observed.
    pub fn value(&mut self, metric: &Metric) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        match metric {
            Metric::Duration(aggregation) => self.latency.aggregate(*aggregation),
            Metric::FailureRate => Some(self.failure_rate()),
        }
    }

    pub fn latency_summary(&mut self) -> Option<LatencySummary> {
        Some(LatencySummary {
            min: self.latency.min()?,
            avg: self.latency.avg()?,
            med: self.latency.percentile(50.0)?,
            p90: self.latency.percentile(90.0)?,
            p95: self.latency.percentile(95.0)?,
            p99: self.latency.percentile(99.0)?,
            max: self.latency.max()?,
        })
    }

    pub fn checks(&self) -> Vec<(RequestKind, CheckStats)> {
        RequestKind::ALL
            .iter()
            .map(|kind| (*kind, self.checks[kind.index()]))
            .collect()
    }
}

/// Request latency distribution in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct LatencySummary {
    pub min: f64,
    pub avg: f64,
    pub med: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ThresholdResult {
    pub threshold: Threshold,
    /// Value the threshold was checked against, `None` without any request.
    pub observed: Option<f64>,
    pub passed: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Check {
    pub name: &'static str,
    pub kind: RequestKind,
    pub passed: u64,
    pub failed: u64,
}

/// Final result of the evaluator.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Verdict {
    pub requests: u64,
    pub failed_requests: u64,
    pub failure_rate: f64,
    pub latency: Option<LatencySummary>,
    pub checks: Vec<Check>,
    pub thresholds: Vec<ThresholdResult>,
}

impl Verdict {
    /// All thresholds passed.
    pub fn passed(&self) -> bool {
        self.thresholds.iter().all(|result| result.passed)
    }
}

/// Consumes the outcome stream of a run and turns it into a [`Verdict`].
#[derive(Debug, Clone)]
pub struct Evaluator {
    thresholds: Vec<Threshold>,
    progress_interval: Duration,
}

impl Evaluator {
    pub fn new(thresholds: Vec<Threshold>, progress_interval: Duration) -> Self {
        Self {
            thresholds,
            progress_interval,
        }
    }

    /// Aggregate until every sender is dropped, then evaluate the thresholds.
    pub async fn run(self, mut outcomes: Receiver<RequestOutcome>) -> Verdict {
        let mut aggregate = Aggregate::default();
        let mut progress = tokio::time::interval_at(
            tokio::time::Instant::now() + self.progress_interval,
            self.progress_interval,
        );
        progress.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                outcome = outcomes.next() => match outcome {
                    Some(outcome) => aggregate.observe(outcome),
                    None => break,
                },
                _ = progress.tick() => {
                    let p95 = aggregate.value(&Metric::Duration(Aggregation::Percentile(95.0)));
                    event!(
                        name: "progress",
                        target: CRATE_NAME,
                        Level::INFO,
                        requests = aggregate.total(),
                        failed = aggregate.failed(),
                        failure_rate = aggregate.failure_rate(),
                        p95_ms = p95.unwrap_or_default()
                    );
                }
            }
        }

        self.evaluate(&mut aggregate)
    }

    pub fn evaluate(&self, aggregate: &mut Aggregate) -> Verdict {
        let thresholds = self
            .thresholds
            .iter()
            .map(|threshold| {
                let observed = aggregate.value(&threshold.metric);
                let passed = observed.is_some_and(|value| threshold.check(value));
                if !passed {
                    event!(target: CRATE_NAME, Level::WARN, threshold = %threshold, observed = ?observed, "threshold crossed");
                }
                ThresholdResult {
                    threshold: threshold.clone(),
                    observed,
                    passed,
                }
            })
            .collect();

        Verdict {
            requests: aggregate.total(),
            failed_requests: aggregate.failed(),
            failure_rate: aggregate.failure_rate(),
            latency: aggregate.latency_summary(),
            checks: aggregate
                .checks()
                .into_iter()
                .map(|(kind, stats)| Check {
                    name: kind.check_name(),
                    kind,
                    passed: stats.passed,
                    failed: stats.failed,
                })
                .collect(),
            thresholds,
        }
    }
}
