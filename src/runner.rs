use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{event, Instrument, Level};
use ulid::Ulid;

use crate::{
    client::ApiClient,
    config::Config,
    error::Error,
    evaluator::{Evaluator, Verdict},
    executor::{Execution, ExecutionStats},
    registry::Registry,
    user::CoinUserBuilder,
    CRATE_NAME,
};

/// Exit status of a run whose thresholds did not hold.
pub const THRESHOLDS_FAILED_EXIT_CODE: i32 = 99;

/// Everything known about a finished run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Summary {
    pub run_id: Ulid,
    #[serde(serialize_with = "serialize_to_rfc3339_opts")]
    pub started_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_to_rfc3339_opts")]
    pub finished_at: DateTime<Utc>,
    pub executor: String,
    /// Usernames that logged in successfully.
    pub registered_users: usize,
    pub execution: ExecutionStats,
    pub verdict: Verdict,
}

impl Summary {
    pub fn passed(&self) -> bool {
        self.verdict.passed()
    }

    pub fn exit_code(&self) -> i32 {
        if self.passed() {
            0
        } else {
            THRESHOLDS_FAILED_EXIT_CODE
        }
    }
}

fn serialize_to_rfc3339_opts<S: serde::Serializer>(
    t: &DateTime<Utc>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = &self.verdict;
        let elapsed = (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default();
        writeln!(f, "run {} ({}) finished in {:.1}s", self.run_id, self.executor, elapsed.as_secs_f64())?;
        writeln!(f)?;
        for check in &verdict.checks {
            let total = check.passed + check.failed;
            let mark = if check.failed == 0 { '✓' } else { '✗' };
            let ratio = if total == 0 {
                100.0
            } else {
                check.passed as f64 * 100.0 / total as f64
            };
            writeln!(
                f,
                "  {mark} {:<24} {:>6.2}%  {} / {}",
                check.name, ratio, check.passed, total
            )?;
        }
        writeln!(f)?;
        if let Some(latency) = &verdict.latency {
            writeln!(
                f,
                "  http_req_duration: avg={:.2}ms min={:.2}ms med={:.2}ms max={:.2}ms p(90)={:.2}ms p(95)={:.2}ms p(99)={:.2}ms",
                latency.avg, latency.min, latency.med, latency.max, latency.p90, latency.p95, latency.p99
            )?;
        }
        writeln!(
            f,
            "  http_req_failed:   {:.2}%  {} out of {}",
            verdict.failure_rate * 100.0,
            verdict.failed_requests,
            verdict.requests
        )?;
        writeln!(
            f,
            "  users: {} started, {} max, {} crashed; iterations: {} ({} failed, {} transfers skipped); registered: {}",
            self.execution.users_started,
            self.execution.max_users,
            self.execution.crashed_users,
            self.execution.iterations,
            self.execution.failed_iterations,
            self.execution.skipped_transfers,
            self.registered_users
        )?;
        writeln!(f)?;
        for result in &verdict.thresholds {
            let mark = if result.passed { '✓' } else { '✗' };
            match result.observed {
                Some(observed) => writeln!(f, "  {mark} {} (observed {observed:.4})", result.threshold)?,
                None => writeln!(f, "  {mark} {} (no requests)", result.threshold)?,
            }
        }
        Ok(())
    }
}

/// Top level struct that runs one load test described by a [`Config`].
pub struct Runner {
    config: Config,
    skip_healthcheck: bool,
}

impl Runner {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            skip_healthcheck: false,
        }
    }

    /// Do not probe `/api/healthcheck` before starting users.
    pub fn skip_healthcheck(mut self, skip: bool) -> Self {
        self.skip_healthcheck = skip;
        self
    }

    pub async fn run(self) -> Result<Summary, Error> {
        let Runner {
            config,
            skip_healthcheck,
        } = self;
        config.validate()?;
        let thresholds = config.thresholds()?;

        let run_id = Ulid::new();
        let span = tracing::span!(target: CRATE_NAME, Level::INFO, "run", id = %run_id);

        async move {
            let (outcome_tx, outcome_rx) = crate::channel();
            let client = ApiClient::new(&config.base_url, config.request_timeout, outcome_tx)?;
            if !skip_healthcheck {
                client.health().await?;
            }

            let started_at = Utc::now();
            event!(target: CRATE_NAME, Level::INFO, base_url = %config.base_url, executor = %config.executor, "starting run");

            let evaluator = tokio::spawn(
                Evaluator::new(thresholds, config.progress_interval)
                    .run(outcome_rx)
                    .in_current_span(),
            );

            let registry = Arc::new(Registry::new());
            let user_builder =
                CoinUserBuilder::new(Arc::new(client), registry.clone(), config.script.clone());
            // the execution owns the last client handles, the outcome stream
            // closes once it returns.
            let execution = Execution::new(
                user_builder,
                config.executor.clone(),
                config.scheduler_tick,
            )
            .execute()
            .await;

            let verdict = evaluator
                .await
                .map_err(|err| Error::new(format!("evaluator task failed: {err}")))?;
            let finished_at = Utc::now();
            event!(target: CRATE_NAME, Level::INFO, passed = verdict.passed(), requests = verdict.requests, "run finished");

            Ok(Summary {
                run_id,
                started_at,
                finished_at,
                executor: config.executor.to_string(),
                registered_users: registry.len(),
                execution,
                verdict,
            })
        }
        .instrument(span)
        .await
    }
}
