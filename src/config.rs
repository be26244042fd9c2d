use std::{collections::BTreeMap, path::Path, time::Duration};

use crate::{
    error::Error,
    logical::Executor,
    threshold::{Threshold, DURATION_METRIC, FAILED_METRIC},
    user::Script,
};

/// Run configuration, usually read from a TOML file.
///
/// Every field has a default so an empty file describes the reference run:
/// ramp to 1000 users over a minute against a local service and require
/// `p(99.99) < 50` ms and fewer than 1% failed requests.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address of the service, `/api/...` paths are appended to it.
    pub base_url: String,
    pub executor: Executor,
    /// Threshold expressions keyed by metric name.
    pub thresholds: BTreeMap<String, Vec<String>>,
    pub script: Script,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// How often the scheduler re-evaluates the number of users.
    #[serde(with = "humantime_serde")]
    pub scheduler_tick: Duration,
    /// How often the evaluator logs progress.
    #[serde(with = "humantime_serde")]
    pub progress_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let thresholds = BTreeMap::from([
            (DURATION_METRIC.to_string(), vec!["p(99.99) < 50".to_string()]),
            (FAILED_METRIC.to_string(), vec!["rate<0.01".to_string()]),
        ]);
        Self {
            base_url: "http://localhost:8080".to_string(),
            executor: Executor::default(),
            thresholds,
            script: Script::default(),
            request_timeout: Duration::from_secs(60),
            scheduler_tick: Duration::from_millis(100),
            progress_interval: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|err| Error::config(format!("cannot read {}: {err}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, Error> {
        let config: Config = toml::from_str(content).map_err(|err| Error::config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parsed thresholds, in metric name order.
    pub fn thresholds(&self) -> Result<Vec<Threshold>, Error> {
        self.thresholds
            .iter()
            .flat_map(|(metric, exprs)| exprs.iter().map(move |expr| Threshold::parse(metric, expr)))
            .collect()
    }

    pub fn validate(&self) -> Result<(), Error> {
        reqwest::Url::parse(&self.base_url)
            .map_err(|err| Error::config(format!("base_url `{}`: {err}", self.base_url)))?;

        match &self.executor {
            Executor::RampingUser { stages } if stages.is_empty() => {
                return Err(Error::config("ramping-user executor needs at least one stage"));
            }
            Executor::PerUser { users: 0, .. } => {
                return Err(Error::config("per-user executor needs at least one user"));
            }
            _ => {}
        }

        if self.script.recipient_attempts == 0 {
            return Err(Error::config("script.recipient_attempts must be at least 1"));
        }
        for (name, value) in [
            ("request_timeout", self.request_timeout),
            ("scheduler_tick", self.scheduler_tick),
            ("progress_interval", self.progress_interval),
        ] {
            if value.is_zero() {
                return Err(Error::config(format!("{name} must be greater than zero")));
            }
        }

        self.thresholds()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{logical::Stage, threshold::Metric};

    #[test]
    fn empty_file_is_the_reference_run() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(
            config.executor,
            Executor::RampingUser {
                stages: vec![Stage::new(Duration::from_secs(60), 1000)]
            }
        );
        assert_eq!(config.base_url, "http://localhost:8080");
        assert_eq!(config.script.password, "password");
        assert_eq!(config.script.item, "1");
        assert_eq!(config.script.amount, 1);
        assert_eq!(config.script.pause, Duration::from_secs(1));

        let thresholds = config.thresholds().unwrap();
        assert_eq!(thresholds.len(), 2);
        assert_eq!(thresholds[1].metric, Metric::FailureRate);
    }

    #[test]
    fn reads_full_file() {
        let config = Config::from_toml(
            r#"
            base_url = "http://shop:8080/"
            request_timeout = "5s"
            scheduler_tick = "250ms"

            [executor]
            type = "ramping-user"
            stages = [
                { duration = "30s", target = 100 },
                { duration = "1m", target = 100 },
                { duration = "10s", target = 0 },
            ]

            [thresholds]
            http_req_duration = ["p(95) < 20", "max < 200"]

            [script]
            item = "pen"
            pause = "500ms"
            "#,
        )
        .unwrap();

        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.scheduler_tick, Duration::from_millis(250));
        assert_eq!(config.script.item, "pen");
        assert_eq!(config.script.pause, Duration::from_millis(500));
        assert_eq!(config.script.password, "password");
        assert_eq!(config.thresholds().unwrap().len(), 2);
        match config.executor {
            Executor::RampingUser { stages } => assert_eq!(stages.len(), 3),
            other => panic!("unexpected executor {other}"),
        }
    }

    #[test]
    fn rejects_invalid_settings() {
        for content in [
            "base_url = \"not a url\"",
            "[executor]\ntype = \"ramping-user\"\nstages = []",
            "[executor]\ntype = \"per-user\"\nusers = 0\niterations = 1",
            "[script]\nrecipient_attempts = 0",
            "scheduler_tick = \"0s\"",
            "[thresholds]\nhttp_req_failed = [\"rate <\"]",
            "unknown_key = 1",
        ] {
            let err = Config::from_toml(content).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{content}");
        }
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = Config::from_path("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
