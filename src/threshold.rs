//! Pass/fail criteria over the request metrics of a run.
//!
//! Thresholds are written the way load scripts usually write them, as an
//! expression attached to a metric name:
//!
//! ```text
//! http_req_duration = ["p(99.99) < 50", "avg < 20"]
//! http_req_failed = ["rate<0.01"]
//! ```
//!
//! Durations are in milliseconds, rates are fractions of all requests.

use std::fmt;

use crate::error::Error;

pub const DURATION_METRIC: &str = "http_req_duration";
pub const FAILED_METRIC: &str = "http_req_failed";

/// Aggregation of request latencies.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// Percentile in `0..=100`.
    Percentile(f64),
    Avg,
    Min,
    Max,
    Med,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Latency of every request, in milliseconds.
    Duration(Aggregation),
    /// Failed requests divided by all requests.
    FailureRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Comparator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Comparator {
    pub fn holds(&self, observed: f64, bound: f64) -> bool {
        match self {
            Comparator::Lt => observed < bound,
            Comparator::Le => observed <= bound,
            Comparator::Gt => observed > bound,
            Comparator::Ge => observed >= bound,
            Comparator::Eq => observed == bound,
            Comparator::Ne => observed != bound,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Threshold {
    pub metric: Metric,
    pub comparator: Comparator,
    pub bound: f64,
    /// Expression as it was configured.
    pub source: String,
}

impl Threshold {
    pub fn new(metric: Metric, comparator: Comparator, bound: f64) -> Self {
        let source = format!("{} {} {}", metric_expr(&metric), comparator.as_str(), bound);
        Self {
            metric,
            comparator,
            bound,
            source,
        }
    }

    /// Parse `expr` for the metric called `metric_name`.
    pub fn parse(metric_name: &str, expr: &str) -> Result<Self, Error> {
        let invalid = |why: &str| Error::config(format!("threshold `{metric_name}: {expr}`: {why}"));

        let op_start = expr
            .find(['<', '>', '=', '!'])
            .ok_or_else(|| invalid("missing comparator"))?;
        let (lhs, rest) = expr.split_at(op_start);
        let (comparator, rhs) = [
            ("<=", Comparator::Le),
            (">=", Comparator::Ge),
            ("==", Comparator::Eq),
            ("!=", Comparator::Ne),
            ("<", Comparator::Lt),
            (">", Comparator::Gt),
        ]
        .into_iter()
        .find_map(|(op, comparator)| rest.strip_prefix(op).map(|rhs| (comparator, rhs)))
        .ok_or_else(|| invalid("unknown comparator"))?;

        let bound: f64 = rhs
            .trim()
            .parse()
            .map_err(|_| invalid("bound is not a number"))?;

        let lhs = lhs.trim();
        let metric = match metric_name {
            DURATION_METRIC => Metric::Duration(parse_aggregation(lhs).ok_or_else(|| {
                invalid("expected one of p(N), avg, min, max, med")
            })?),
            FAILED_METRIC if lhs == "rate" => Metric::FailureRate,
            FAILED_METRIC => return Err(invalid("expected rate")),
            _ => return Err(invalid("unknown metric")),
        };

        Ok(Self {
            metric,
            comparator,
            bound,
            source: expr.trim().to_string(),
        })
    }

    /// Whether `observed` satisfies this threshold.
    pub fn check(&self, observed: f64) -> bool {
        self.comparator.holds(observed, self.bound)
    }

    pub fn metric_name(&self) -> &'static str {
        match self.metric {
            Metric::Duration(_) => DURATION_METRIC,
            Metric::FailureRate => FAILED_METRIC,
        }
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.metric_name(), self.source)
    }
}

fn parse_aggregation(lhs: &str) -> Option<Aggregation> {
    match lhs {
        "avg" => Some(Aggregation::Avg),
        "min" => Some(Aggregation::Min),
        "max" => Some(Aggregation::Max),
        "med" => Some(Aggregation::Med),
        _ => {
            let inner = lhs.strip_prefix("p(")?.strip_suffix(')')?;
            let percentile: f64 = inner.trim().parse().ok()?;
            (0.0..=100.0)
                .contains(&percentile)
                .then_some(Aggregation::Percentile(percentile))
        }
    }
}

fn metric_expr(metric: &Metric) -> String {
    match metric {
        Metric::Duration(Aggregation::Percentile(p)) => format!("p({p})"),
        Metric::Duration(Aggregation::Avg) => "avg".to_string(),
        Metric::Duration(Aggregation::Min) => "min".to_string(),
        Metric::Duration(Aggregation::Max) => "max".to_string(),
        Metric::Duration(Aggregation::Med) => "med".to_string(),
        Metric::FailureRate => "rate".to_string(),
    }
}
