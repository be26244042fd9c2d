use std::time::Duration;

/// A span of time during which the number of users moves linearly towards `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Stage {
    /// Time it takes to reach the target
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Number of concurrently running users at the end of the stage
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} users over {}",
            self.target,
            humantime_serde::re::humantime::format_duration(self.duration)
        )
    }
}

/// Piecewise-linear schedule over a list of stages.
///
/// Every stage starts from the target of the previous one (zero for the first
/// stage) and interpolates to its own target over its duration.
#[derive(Debug, Clone)]
pub struct Ramp {
    stages: Vec<Stage>,
}

impl Ramp {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|stage| stage.duration).sum()
    }

    /// Number of users that should be running `elapsed` after the start.
    ///
    /// Returns `None` once every stage has been exhausted.
    pub fn target_at(&self, elapsed: Duration) -> Option<usize> {
        self.position(elapsed).map(|(_, target)| target)
    }

    /// Zero based index of the stage active at `elapsed` along with the target.
    pub fn position(&self, elapsed: Duration) -> Option<(usize, usize)> {
        if elapsed > self.total_duration() {
            return None;
        }
        let mut from = 0usize;
        let mut start = Duration::ZERO;
        for (index, stage) in self.stages.iter().enumerate() {
            let end = start + stage.duration;
            // zero length stages are never "inside", they just move `from`.
            if elapsed < end {
                let progress = (elapsed - start).as_secs_f64() / stage.duration.as_secs_f64();
                let from_f = from as f64;
                let target = from_f + (stage.target as f64 - from_f) * progress;
                return Some((index, target.round() as usize));
            }
            from = stage.target;
            start = end;
        }
        Some((self.stages.len().saturating_sub(1), from))
    }
}

/// How users are driven during a run.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Executor {
    /// Ramp the number of concurrently running users up or down through a sequence of stages,
    /// each user performing as many iterations as it can while it is allowed to run.
    RampingUser {
        /// stages of this execution.
        stages: Vec<Stage>,
    },
    /// Have each user run certain number of iterations.
    /// Test finishes when all users have finished their execution.
    PerUser {
        /// Number of users
        users: usize,
        /// Number of iterations each user will perform.
        iterations: usize,
    },
}

impl Default for Executor {
    fn default() -> Self {
        Executor::RampingUser {
            stages: vec![Stage::new(Duration::from_secs(60), 1000)],
        }
    }
}

impl std::fmt::Display for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Executor::RampingUser { stages } => {
                write!(f, "RampingUser ({} stages)", stages.len())
            }
            Executor::PerUser { users, iterations } => {
                write!(f, "PerUser ({} users) {}", users, iterations)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn single_stage_interpolates_from_zero() {
        let ramp = Ramp::new(vec![Stage::new(secs(60), 1000)]);
        assert_eq!(ramp.target_at(Duration::ZERO), Some(0));
        let half = ramp.target_at(secs(30)).unwrap();
        assert!((499..=501).contains(&half), "got {half}");
        assert_eq!(ramp.target_at(secs(60)), Some(1000));
        assert_eq!(ramp.target_at(Duration::from_millis(60_001)), None);
    }

    #[test]
    fn later_stages_start_from_previous_target() {
        let ramp = Ramp::new(vec![
            Stage::new(secs(10), 100),
            Stage::new(secs(10), 100),
            Stage::new(secs(20), 0),
        ]);
        assert_eq!(ramp.target_at(secs(5)), Some(50));
        assert_eq!(ramp.position(secs(15)), Some((1, 100)));
        assert_eq!(ramp.position(secs(30)), Some((2, 50)));
        assert_eq!(ramp.target_at(secs(40)), Some(0));
        assert_eq!(ramp.total_duration(), secs(40));
    }

    #[test]
    fn zero_length_stage_jumps() {
        let ramp = Ramp::new(vec![Stage::new(Duration::ZERO, 10), Stage::new(secs(10), 10)]);
        assert_eq!(ramp.position(Duration::ZERO), Some((1, 10)));
        assert_eq!(ramp.target_at(secs(10)), Some(10));
    }

    #[test]
    fn empty_ramp_is_finished_immediately() {
        let ramp = Ramp::new(vec![]);
        assert_eq!(ramp.target_at(Duration::ZERO), Some(0));
        assert_eq!(ramp.target_at(secs(1)), None);
    }

    #[test]
    fn executor_deserializes_from_tagged_table() {
        let exec: Executor = toml::from_str(
            r#"
            type = "ramping-user"
            stages = [{ duration = "1m", target = 1000 }]
            "#,
        )
        .unwrap();
        assert_eq!(exec, Executor::default());

        let exec: Executor = toml::from_str(
            r#"
            type = "per-user"
            users = 10
            iterations = 1
            "#,
        )
        .unwrap();
        assert_eq!(
            exec,
            Executor::PerUser {
                users: 10,
                iterations: 1
            }
        );
    }
}
