use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{Future, FutureExt};
use tokio::{task::JoinSet, time::Instant};
use tracing::{event, Instrument, Level};

use crate::{
    error::Error,
    logical::{self, Ramp, Stage},
    user::{User, UserBuilder},
    UserResult, CRATE_NAME, SPAN_EXEC, SPAN_TASK,
};

#[derive(Debug, Default)]
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn add(&self, amount: u64) {
        self.value.fetch_add(amount, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters describing what the users of an execution did.
#[derive(Debug, Default)]
struct Counters {
    users_started: Counter,
    iterations: Counter,
    failed_iterations: Counter,
    skipped_transfers: Counter,
    crashed: Counter,
}

impl Counters {
    fn observe(&self, result: &UserResult) {
        self.iterations.add(1);
        if let Err(err) = result {
            self.failed_iterations.add(1);
            if matches!(err, Error::NoRecipient { .. }) {
                self.skipped_transfers.add(1);
            }
        }
    }

    fn stats(&self, max_users: usize) -> ExecutionStats {
        ExecutionStats {
            users_started: self.users_started.get(),
            max_users: max_users as u64,
            iterations: self.iterations.get(),
            failed_iterations: self.failed_iterations.get(),
            skipped_transfers: self.skipped_transfers.get(),
            crashed_users: self.crashed.get(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutionStats {
    pub users_started: u64,
    pub max_users: u64,
    pub iterations: u64,
    pub failed_iterations: u64,
    /// Iterations that found nobody to send coins to.
    pub skipped_transfers: u64,
    /// Users that panicked and were retired.
    pub crashed_users: u64,
}

/// A running user task reports back which slot it held and whether it died.
struct Exit {
    slot: u64,
    panic: Option<String>,
}

/// User started by the ramping scheduler together with its stop flag.
struct Active {
    slot: u64,
    stop: Arc<AtomicBool>,
}

/// Runtime side of a [`logical::Executor`].
pub enum Execution<Ub: UserBuilder> {
    RampingUser(RampingUser<Ub>),
    PerUser(PerUserIteration<Ub>),
}

impl<Ub: UserBuilder> Execution<Ub> {
    pub fn new(user_builder: Ub, executor: logical::Executor, tick: Duration) -> Self {
        match executor {
            logical::Executor::RampingUser { stages } => {
                Self::RampingUser(RampingUser::new(user_builder, stages, tick))
            }
            logical::Executor::PerUser { users, iterations } => {
                Self::PerUser(PerUserIteration::new(user_builder, users, iterations))
            }
        }
    }

    /// Drive users until the plan is exhausted and every user has exited.
    pub async fn execute(self) -> ExecutionStats {
        let name = match &self {
            Execution::RampingUser(_) => "RampingUser",
            Execution::PerUser(_) => "PerUser",
        };
        let span = tracing::span!(target: CRATE_NAME, Level::INFO, SPAN_EXEC, executor = name);
        match self {
            Execution::RampingUser(exec) => exec.execute().instrument(span).await,
            Execution::PerUser(exec) => exec.execute().instrument(span).await,
        }
    }
}

/// Executor with stages. The number of running users follows the piecewise-linear
/// [`Ramp`] of its stages; users above the target are told to stop after their
/// current iteration.
pub struct RampingUser<Ub> {
    user_builder: Ub,
    ramp: Ramp,
    tick: Duration,
}

impl<Ub: UserBuilder> RampingUser<Ub> {
    pub fn new(user_builder: Ub, stages: Vec<Stage>, tick: Duration) -> Self {
        Self {
            user_builder,
            ramp: Ramp::new(stages),
            tick,
        }
    }

    pub async fn execute(self) -> ExecutionStats {
        let counters = Arc::new(Counters::default());
        let total_stages = self.ramp.stages().len();
        event!(target: CRATE_NAME, Level::INFO, stages = total_stages as u64, total_duration = ?self.ramp.total_duration());

        let mut tasks = JoinSet::new();
        let mut active: Vec<Active> = Vec::new();
        // asked to stop but still inside their current iteration.
        let mut draining: Vec<Active> = Vec::new();
        let mut next_slot = 0u64;
        let mut max_users = 0usize;
        let mut current_stage = None;
        let mut last_target = None;

        let start = Instant::now();
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    reap(joined, &mut [&mut active, &mut draining], &counters);
                }
                _ = interval.tick() => {
                    let Some((stage, target)) = self.ramp.position(start.elapsed()) else {
                        break;
                    };
                    if current_stage != Some(stage) {
                        current_stage = Some(stage);
                        event!(target: CRATE_NAME, Level::INFO, stage = stage as u64 + 1, stages = total_stages as u64, "stage started");
                    }

                    // take back users that have not left yet before starting new ones.
                    while active.len() < target {
                        let Some(kept) = draining.pop() else {
                            break;
                        };
                        kept.stop.store(false, Ordering::Release);
                        event!(target: CRATE_NAME, Level::DEBUG, slot = kept.slot, "stop request withdrawn");
                        active.push(kept);
                    }
                    while active.len() < target {
                        let slot = next_slot;
                        next_slot += 1;
                        let stop = Arc::new(AtomicBool::new(false));
                        let user = self.user_builder.build(slot);
                        tasks.spawn(
                            run_user(user, slot, Some(stop.clone()), None, counters.clone())
                                .in_current_span(),
                        );
                        counters.users_started.add(1);
                        active.push(Active { slot, stop });
                    }
                    // newest users leave first.
                    while active.len() > target {
                        if let Some(retired) = active.pop() {
                            retired.stop.store(true, Ordering::Release);
                            event!(target: CRATE_NAME, Level::DEBUG, slot = retired.slot, "user asked to stop");
                            draining.push(retired);
                        }
                    }
                    max_users = max_users.max(tasks.len());

                    if last_target != Some(target) {
                        last_target = Some(target);
                        event!(target: CRATE_NAME, Level::DEBUG, users = active.len() as u64, target_users = target as u64);
                    }
                }
            }
        }

        event!(target: CRATE_NAME, Level::INFO, users = tasks.len() as u64, "stages exhausted, draining users");
        for user in active.drain(..).chain(draining.drain(..)) {
            user.stop.store(true, Ordering::Release);
        }
        while let Some(joined) = tasks.join_next().await {
            reap(joined, &mut [], &counters);
        }
        event!(target: CRATE_NAME, Level::INFO, users = 0u64);

        counters.stats(max_users)
    }
}

/// Have each user run certain number of iterations.
pub struct PerUserIteration<Ub> {
    user_builder: Ub,
    users: usize,
    iterations: usize,
}

impl<Ub: UserBuilder> PerUserIteration<Ub> {
    pub fn new(user_builder: Ub, users: usize, iterations: usize) -> Self {
        Self {
            user_builder,
            users,
            iterations,
        }
    }

    pub async fn execute(self) -> ExecutionStats {
        let counters = Arc::new(Counters::default());
        let mut tasks = JoinSet::new();
        for slot in 0..self.users as u64 {
            let user = self.user_builder.build(slot);
            tasks.spawn(
                run_user(user, slot, None, Some(self.iterations), counters.clone())
                    .in_current_span(),
            );
            counters.users_started.add(1);
        }
        event!(target: CRATE_NAME, Level::INFO, users = self.users as u64);

        while let Some(joined) = tasks.join_next().await {
            reap(joined, &mut [], &counters);
        }
        counters.stats(self.users)
    }
}

fn reap(
    joined: Result<Exit, tokio::task::JoinError>,
    tracked: &mut [&mut Vec<Active>],
    counters: &Counters,
) {
    match joined {
        Ok(Exit { slot, panic }) => {
            for users in tracked.iter_mut() {
                users.retain(|user| user.slot != slot);
            }
            if let Some(panic) = panic {
                counters.crashed.add(1);
                event!(name: "user_crashed", target: CRATE_NAME, Level::WARN, slot, %panic, "user crashed, slot retired");
            }
        }
        Err(err) => {
            event!(target: CRATE_NAME, Level::ERROR, %err, "user task failed to join");
        }
    }
}

/// Loop a user until it is asked to stop or has done `iterations` calls.
///
/// The stop flag is only looked at between iterations so an in-flight request
/// is never cut short. A panic is caught and reported instead of tearing down
/// the executor.
async fn run_user<U: User>(
    mut user: U,
    slot: u64,
    stop: Option<Arc<AtomicBool>>,
    iterations: Option<usize>,
    counters: Arc<Counters>,
) -> Exit {
    let task = async {
        let mut done = 0usize;
        loop {
            if stop.as_ref().is_some_and(|stop| stop.load(Ordering::Acquire)) {
                break;
            }
            if iterations.is_some_and(|iterations| done >= iterations) {
                break;
            }
            let res = user_call(user.call())
                .instrument(tracing::span!(target: CRATE_NAME, Level::INFO, SPAN_TASK, slot))
                .await;
            counters.observe(&res);
            done += 1;
        }
    };

    let panic = AssertUnwindSafe(task)
        .catch_unwind()
        .await
        .err()
        .map(panic_message);
    Exit { slot, panic }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn user_call<'a>(task: impl Future<Output = UserResult> + Send + 'a) -> UserResult {
    let res = task.await;
    if let Err(ref err) = res {
        event!(name: "error", target: CRATE_NAME, Level::INFO, err = %err)
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::HashSet,
        sync::{atomic::AtomicUsize, Mutex},
    };
    use tracing_subscriber::prelude::*;

    use crate::test_util::CapturedEvents;

    #[derive(Debug, Default)]
    struct Probe {
        calls: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
        slots: Mutex<HashSet<u64>>,
    }

    struct MockUser {
        slot: u64,
        probe: Arc<Probe>,
        should_fail: bool,
        panic_on_slot: Option<u64>,
        call_time: Duration,
    }

    #[async_trait::async_trait]
    impl User for MockUser {
        async fn call(&mut self) -> UserResult {
            self.probe.calls.fetch_add(1, Ordering::SeqCst);
            let running = self.probe.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.probe.max_running.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(self.call_time).await;
            self.probe.running.fetch_sub(1, Ordering::SeqCst);
            if self.panic_on_slot == Some(self.slot) {
                panic!("mock user {} blew up", self.slot);
            }
            if self.should_fail {
                Err(Error::NoRecipient {
                    username: format!("user_{}_0", self.slot),
                    candidates: 2,
                })
            } else {
                Ok(())
            }
        }
    }

    fn builder(
        probe: &Arc<Probe>,
        should_fail: bool,
        panic_on_slot: Option<u64>,
        call_time: Duration,
    ) -> impl UserBuilder<Output = MockUser> {
        let probe = probe.clone();
        move |slot| {
            probe.slots.lock().unwrap().insert(slot);
            MockUser {
                slot,
                probe: probe.clone(),
                should_fail,
                panic_on_slot,
                call_time,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn per_user_runs_every_iteration() {
        let captured_events = Arc::new(Mutex::new(Vec::new()));
        let collector = CapturedEvents {
            events: captured_events.clone(),
        };
        let _guard = tracing_subscriber::registry().with(collector).set_default();

        let probe = Arc::new(Probe::default());
        let exec = Execution::new(
            builder(&probe, false, None, Duration::from_millis(10)),
            logical::Executor::PerUser {
                users: 3,
                iterations: 2,
            },
            Duration::from_millis(100),
        );
        let stats = exec.execute().await;

        assert_eq!(probe.calls.load(Ordering::SeqCst), 6);
        assert_eq!(stats.iterations, 6);
        assert_eq!(stats.users_started, 3);
        assert_eq!(stats.failed_iterations, 0);

        let events = captured_events.lock().unwrap();
        let user_count_event = events
            .iter()
            .find(|e| e.fields.get("users") == Some(&"3".to_string()))
            .expect("Expected user count event");
        assert_eq!(user_count_event.level, Level::INFO);
        assert_eq!(user_count_event.target, CRATE_NAME);
        assert_eq!(user_count_event.span_name.as_deref(), Some(SPAN_EXEC));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_iterations_are_reported_in_task_span() {
        let captured_events = Arc::new(Mutex::new(Vec::new()));
        let collector = CapturedEvents {
            events: captured_events.clone(),
        };
        let _guard = tracing_subscriber::registry().with(collector).set_default();

        let probe = Arc::new(Probe::default());
        let stats = PerUserIteration::new(
            builder(&probe, true, None, Duration::from_millis(10)),
            1,
            1,
        )
        .execute()
        .await;

        assert_eq!(stats.failed_iterations, 1);
        assert_eq!(stats.skipped_transfers, 1);

        let events = captured_events.lock().unwrap();
        let error_event = events
            .iter()
            .find(|e| e.name == "error")
            .expect("Expected an error event");
        assert_eq!(error_event.target, CRATE_NAME);
        assert!(error_event
            .fields
            .get("err")
            .unwrap()
            .contains("no transfer recipient distinct from user_0_0"));
        assert_eq!(
            error_event.span_name.as_deref(),
            Some(SPAN_TASK),
            "Error event should be in SPAN_TASK"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ramping_follows_stages_and_drains() {
        let probe = Arc::new(Probe::default());
        let exec = RampingUser::new(
            builder(&probe, false, None, Duration::from_millis(250)),
            vec![
                Stage::new(Duration::from_secs(2), 8),
                Stage::new(Duration::from_secs(2), 8),
                Stage::new(Duration::from_secs(2), 2),
            ],
            Duration::from_millis(100),
        );

        let stats = exec.execute().await;

        assert_eq!(probe.running.load(Ordering::SeqCst), 0, "all users drained");
        assert_eq!(probe.max_running.load(Ordering::SeqCst), 8);
        assert_eq!(stats.max_users, 8);
        assert_eq!(stats.users_started, 8, "ramping down never starts new users");
        assert_eq!(stats.crashed_users, 0);
        assert_eq!(
            probe.slots.lock().unwrap().len() as u64,
            stats.users_started,
            "slots are never reused"
        );
        assert!(stats.iterations > 8);
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_reaches_stage_targets() {
        let probe = Arc::new(Probe::default());
        let handle = tokio::spawn(
            RampingUser::new(
                builder(&probe, false, None, Duration::from_millis(50)),
                vec![
                    Stage::new(Duration::from_secs(4), 20),
                    Stage::new(Duration::from_secs(4), 20),
                ],
                Duration::from_millis(100),
            )
            .execute(),
        );

        tokio::time::sleep(Duration::from_secs(2)).await;
        let halfway = probe.slots.lock().unwrap().len();
        assert!((9..=11).contains(&halfway), "expected ~10 users, got {halfway}");

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(probe.slots.lock().unwrap().len(), 20);

        let stats = handle.await.unwrap();
        assert_eq!(stats.users_started, 20);
        assert_eq!(probe.running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn quick_dip_reuses_draining_users() {
        let probe = Arc::new(Probe::default());
        let exec = RampingUser::new(
            builder(&probe, false, None, Duration::from_secs(2)),
            vec![
                Stage::new(Duration::ZERO, 4),
                Stage::new(Duration::from_millis(500), 4),
                Stage::new(Duration::from_millis(100), 0),
                Stage::new(Duration::from_millis(100), 4),
                Stage::new(Duration::from_secs(2), 4),
            ],
            Duration::from_millis(10),
        );

        let stats = exec.execute().await;

        assert_eq!(probe.max_running.load(Ordering::SeqCst), 4);
        assert_eq!(stats.max_users, 4);
        assert_eq!(stats.users_started, 4, "draining users are taken back first");
        assert_eq!(probe.running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_user_is_replaced() {
        let probe = Arc::new(Probe::default());
        let exec = RampingUser::new(
            builder(&probe, false, Some(0), Duration::from_millis(50)),
            vec![
                Stage::new(Duration::ZERO, 2),
                Stage::new(Duration::from_secs(2), 2),
            ],
            Duration::from_millis(100),
        );

        let stats = exec.execute().await;

        assert_eq!(stats.crashed_users, 1);
        assert_eq!(stats.users_started, 3);
        assert!(probe.slots.lock().unwrap().contains(&2), "replacement got a fresh slot");
    }
}
