use std::{sync::Arc, time::Duration};

use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::watch,
    task::{JoinError, JoinHandle, JoinSet},
    time::Instant,
};
use typed_builder::TypedBuilder;

use super::{
    cancelled,
    user::{UserReport, UserState, VirtualUser},
    ExecutionContext,
};
use crate::{
    aggregate::{spawn_stats, StatsAggregate},
    error::{CancelReason, EngineError},
    injection::InjectionProfile,
    protocol::HttpProtocol,
    report::StatsReport,
    scenario::Scenario,
    transport::Transport,
};

const STATS_BATCH_SIZE: usize = 256;

/// Runs a scenario under an injection profile.
///
/// ```rust,no_run
/// use std::{sync::Arc, time::Duration};
/// use stampede::{Engine, HttpProtocol, InjectionProfile, Scenario, transport::Transport};
///
/// # async fn run(scenario: Scenario, transport: Arc<impl Transport>) -> Result<(), stampede::error::EngineError> {
/// let engine = Engine::builder()
///     .injection(InjectionProfile::new().ramp_users(5, Duration::from_secs(10)))
///     .protocol(HttpProtocol::builder().base_url("https://videogamedb.uk/api").build())
///     .max_duration(Duration::from_secs(20))
///     .build();
/// let summary = engine.exec(scenario, transport).await?;
/// println!("{} requests", summary.stats.total());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct Engine {
    pub injection: InjectionProfile,
    #[builder(setter(into))]
    pub protocol: Arc<HttpProtocol>,
    /// Cancel the run (`CancelledByTimeout`) once this much time has passed.
    #[builder(default, setter(strip_option))]
    pub max_duration: Option<Duration>,
    #[builder(default = Duration::from_secs(5))]
    pub grace_period: Duration,
    #[builder(default = Duration::from_millis(100))]
    pub tick: Duration,
    #[builder(default, setter(strip_option))]
    pub seed: Option<u64>,
    #[builder(default = Duration::from_secs(1))]
    pub snapshot_interval: Duration,
}

/// How the users of a run ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTally {
    pub spawned: u64,
    pub completed: u64,
    pub failed: u64,
    /// Cancelled, either cooperatively or aborted after the grace period.
    pub cancelled: u64,
    /// Scheduled but never spawned because the run was cancelled first.
    pub unstarted: u64,
}

impl UserTally {
    fn record(&mut self, joined: Result<UserReport, JoinError>) {
        match joined {
            Ok(report) => match report.state {
                UserState::Completed => self.completed += 1,
                UserState::Failed(_) => self.failed += 1,
                UserState::Cancelled(_) => self.cancelled += 1,
                UserState::Running { .. } | UserState::Suspended { .. } => {
                    tracing::error!(user = report.id, "Virtual user returned without finishing");
                    self.failed += 1;
                }
            },
            Err(err) if err.is_cancelled() => self.cancelled += 1,
            Err(err) => {
                tracing::error!("Virtual user panicked: {err}");
                self.failed += 1;
            }
        }
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub scenario: String,
    pub stats: StatsAggregate,
    pub users: UserTally,
    pub elapsed: Duration,
    /// Set when the run ended through cancellation rather than completion.
    pub cancelled: Option<CancelReason>,
}

impl RunSummary {
    pub fn report(&self) -> StatsReport {
        StatsReport::from(self.stats.clone())
    }
}

/// Handle on a run in progress.
#[derive(Debug)]
pub struct Run {
    scenario: String,
    started: Instant,
    shutdown: Arc<watch::Sender<Option<CancelReason>>>,
    snapshots: watch::Receiver<StatsAggregate>,
    driver: JoinHandle<DriverOutcome>,
    stats: JoinHandle<StatsAggregate>,
}

impl Run {
    /// Stats as of the latest snapshot.
    pub fn snapshot(&self) -> StatsAggregate {
        self.snapshots.borrow().clone()
    }

    /// Cancels the run (`CancelledByShutdown`). Idempotent.
    pub fn stop(&self) {
        cancel(&self.shutdown, CancelReason::Shutdown);
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Waits for every user to finish and the stats to drain.
    pub async fn join(self) -> Result<RunSummary, EngineError> {
        let outcome = self.driver.await?;
        let stats = self.stats.await?;
        let summary = RunSummary {
            scenario: self.scenario,
            stats,
            users: outcome.users,
            elapsed: self.started.elapsed(),
            cancelled: outcome.cancelled,
        };
        tracing::info!(
            "Done running scenario: {} ({} requests, {} KO) in {:?}",
            summary.scenario,
            summary.stats.total(),
            summary.stats.global.ko,
            summary.elapsed
        );
        Ok(summary)
    }
}

impl Engine {
    /// Validates the scenario and the profile, then starts the run in the
    /// background. Must be called from within a Tokio runtime.
    pub fn start<T: Transport>(
        &self,
        scenario: impl Into<Arc<Scenario>>,
        transport: Arc<T>,
    ) -> Result<Run, EngineError> {
        let scenario: Arc<Scenario> = scenario.into();
        scenario.validate()?;
        let offsets = self.injection.schedule(self.tick)?;

        let started = Instant::now();
        tracing::info!(
            "Starting scenario: {} with {} users over {:?}",
            scenario.name,
            offsets.len(),
            self.injection.duration()
        );
        let (recorder, snapshots, stats) =
            spawn_stats::<StatsAggregate>(started, self.snapshot_interval, STATS_BATCH_SIZE);

        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        let shutdown = Arc::new(shutdown_tx);
        let ctx = ExecutionContext {
            scenario: Arc::clone(&scenario),
            protocol: Arc::clone(&self.protocol),
            transport,
            stats: recorder,
            shutdown: shutdown_rx,
        };
        let plan = DrivePlan {
            offsets,
            started,
            deadline: self.max_duration.map(|d| started + d),
            grace_period: self.grace_period,
            seed: self.seed,
        };
        let driver = tokio::spawn(drive(ctx, plan, Arc::clone(&shutdown)));

        Ok(Run {
            scenario: scenario.name.clone(),
            started,
            shutdown,
            snapshots,
            driver,
            stats,
        })
    }

    /// [`Engine::start`] followed by [`Run::join`].
    pub async fn exec<T: Transport>(
        &self,
        scenario: impl Into<Arc<Scenario>>,
        transport: Arc<T>,
    ) -> Result<RunSummary, EngineError> {
        self.start(scenario, transport)?.join().await
    }
}

struct DrivePlan {
    offsets: Vec<Duration>,
    started: Instant,
    deadline: Option<Instant>,
    grace_period: Duration,
    seed: Option<u64>,
}

#[derive(Debug)]
struct DriverOutcome {
    users: UserTally,
    cancelled: Option<CancelReason>,
}

/// Sets the cancel reason unless one is already set, and returns the one in
/// effect.
fn cancel(shutdown: &watch::Sender<Option<CancelReason>>, reason: CancelReason) -> CancelReason {
    shutdown.send_if_modified(|current| match current {
        Some(_) => false,
        None => {
            *current = Some(reason);
            true
        }
    });
    (*shutdown.borrow()).unwrap_or(reason)
}

fn user_rng(seed: Option<u64>, id: u64) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(id)),
        None => StdRng::from_os_rng(),
    }
}

async fn drive<T: Transport>(
    ctx: ExecutionContext<T>,
    plan: DrivePlan,
    shutdown: Arc<watch::Sender<Option<CancelReason>>>,
) -> DriverOutcome {
    let DrivePlan {
        offsets,
        started,
        deadline,
        grace_period,
        seed,
    } = plan;
    let mut pending = offsets.into_iter().peekable();
    let mut users = JoinSet::new();
    let mut tally = UserTally::default();
    let mut next_id: u64 = 0;
    let mut cancel_rx = shutdown.subscribe();

    let reason = loop {
        let next_spawn = pending.peek().map(|offset| started + *offset);
        if next_spawn.is_none() && users.is_empty() {
            break None;
        }

        tokio::select! {
            biased;
            reason = cancelled(&mut cancel_rx) => break Some(reason),
            _ = tokio::time::sleep_until(deadline.unwrap_or(started)), if deadline.is_some() => {
                break Some(cancel(&shutdown, CancelReason::Timeout));
            }
            _ = tokio::time::sleep_until(next_spawn.unwrap_or(started)), if next_spawn.is_some() => {
                let now = Instant::now();
                while pending.next_if(|offset| started + *offset <= now).is_some() {
                    let user = VirtualUser::new(next_id, ctx.clone(), user_rng(seed, next_id));
                    tracing::trace!(user = next_id, "Spawning virtual user");
                    users.spawn(user.run());
                    next_id += 1;
                }
                tally.spawned = next_id;
            }
            Some(joined) = users.join_next(), if !users.is_empty() => tally.record(joined),
        }
    };

    // Drop our handle on the stats recorder so aggregation can finish once
    // the users are gone.
    drop(ctx);
    tally.unstarted = pending.count() as u64;

    if let Some(reason) = reason {
        tracing::info!(
            "Run {reason}, waiting up to {grace_period:?} for {} users",
            users.len()
        );
        let grace = tokio::time::sleep(grace_period);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                _ = &mut grace => {
                    tracing::warn!("Grace period expired, aborting {} users", users.len());
                    users.abort_all();
                    break;
                }
                joined = users.join_next() => match joined {
                    Some(joined) => tally.record(joined),
                    None => break,
                },
            }
        }
        while let Some(joined) = users.join_next().await {
            tally.record(joined);
        }
    }

    tracing::debug!(?tally, "All virtual users finished");
    DriverOutcome {
        users: tally,
        cancelled: reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{InjectionError, ScenarioError},
        protocol::HttpRequest,
        scenario::Step,
        testing::MockTransport,
        transport::Response,
    };

    fn engine(injection: InjectionProfile) -> Engine {
        Engine::builder()
            .injection(injection)
            .protocol(HttpProtocol::builder().base_url("http://test").build())
            .build()
    }

    fn ok() -> MockTransport {
        MockTransport::new(|_| Ok(Response::new(200)))
    }

    fn one_request() -> Scenario {
        Scenario::builder()
            .name("one")
            .steps(vec![Step::request(HttpRequest::get("Get", "/"))])
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_spawns_users_at_their_offsets() {
        let transport = ok();
        let calls = transport.calls();
        let stamps = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let started = Instant::now();
        let stamped = Arc::clone(&stamps);
        let scenario = Scenario::builder()
            .name("ramp")
            .steps(vec![Step::exec(move |s| {
                stamped.lock().push(started.elapsed());
                s
            })])
            .build();

        let summary = engine(InjectionProfile::new().ramp_users(5, Duration::from_secs(10)))
            .exec(scenario, Arc::new(transport))
            .await
            .unwrap();

        let tick = Duration::from_millis(100);
        let stamps = stamps.lock().clone();
        assert_eq!(stamps.len(), 5);
        for (i, stamp) in stamps.iter().enumerate() {
            let expected = Duration::from_secs(2 * i as u64);
            assert!(*stamp >= expected && *stamp <= expected + tick, "user {i} at {stamp:?}");
        }
        assert_eq!(summary.users.completed, 5);
        assert_eq!(summary.cancelled, None);
        assert!(calls.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn later_users_are_not_held_up_by_earlier_ones() {
        let scenario = Scenario::builder()
            .name("slow")
            .steps(vec![
                Step::pause(Duration::from_secs(60)),
                Step::request(HttpRequest::get("Get", "/")),
            ])
            .build();
        let run = engine(InjectionProfile::new().ramp_users(3, Duration::from_secs(3)))
            .start(scenario, Arc::new(ok()))
            .unwrap();

        let summary = run.join().await.unwrap();
        // three 60s journeys started one second apart
        assert!(summary.elapsed < Duration::from_secs(63));
        assert_eq!(summary.users.completed, 3);
        assert_eq!(summary.stats.total(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn max_duration_cancels_forever_users() {
        let scenario = Scenario::builder()
            .name("forever")
            .steps(vec![Step::forever(vec![
                Step::request(HttpRequest::get("Spin", "/")),
                Step::pause(Duration::from_secs(1)),
            ])])
            .build();

        let engine = Engine {
            max_duration: Some(Duration::from_millis(10_500)),
            ..engine(
                InjectionProfile::new()
                    .at_once_users(2)
                    .nothing_for(Duration::from_secs(30))
                    .at_once_users(3),
            )
        };
        let summary = engine.exec(scenario, Arc::new(ok())).await.unwrap();

        assert_eq!(summary.cancelled, Some(CancelReason::Timeout));
        assert_eq!(
            summary.users,
            UserTally {
                spawned: 2,
                cancelled: 2,
                unstarted: 3,
                ..Default::default()
            }
        );
        // 11 requests per user (t = 0..=10), none of them KO
        assert_eq!(summary.stats.total(), 22);
        assert_eq!(summary.stats.global.ko, 0);
        assert!(summary.elapsed < Duration::from_millis(10_600));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_by_shutdown_and_snapshots_progress() {
        let scenario = Scenario::builder()
            .name("stop")
            .steps(vec![Step::forever(vec![
                Step::request(HttpRequest::get("Spin", "/")),
                Step::pause(Duration::from_millis(500)),
            ])])
            .build();
        let run = engine(InjectionProfile::new().at_once_users(1))
            .start(scenario, Arc::new(ok()))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2_250)).await;
        assert!(run.snapshot().total() >= 2);
        run.stop();
        run.stop();

        let summary = run.join().await.unwrap();
        assert_eq!(summary.cancelled, Some(CancelReason::Shutdown));
        assert_eq!(summary.users.cancelled, 1);
        assert_eq!(summary.stats.total(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_period_aborts_stuck_users() {
        let transport = MockTransport::new(|_| Ok(Response::new(200)))
            .with_delay(Duration::from_secs(3_600));
        let engine = Engine {
            max_duration: Some(Duration::from_secs(1)),
            grace_period: Duration::from_secs(2),
            ..engine(InjectionProfile::new().at_once_users(2))
        };
        let summary = engine.exec(one_request(), Arc::new(transport)).await.unwrap();

        assert_eq!(summary.cancelled, Some(CancelReason::Timeout));
        assert_eq!(summary.users.cancelled, 2);
        assert_eq!(summary.stats.total(), 0);
        assert!(summary.elapsed <= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn invalid_inputs_are_rejected_up_front() {
        let bad_scenario = Scenario::builder().name("").steps(vec![]).build();
        let err = engine(InjectionProfile::new().at_once_users(1))
            .start(bad_scenario, Arc::new(ok()))
            .unwrap_err();
        assert!(matches!(err, EngineError::Scenario(ScenarioError::EmptyName)));

        let err = engine(InjectionProfile::new().constant_rate(f64::INFINITY, Duration::from_secs(1)))
            .start(one_request(), Arc::new(ok()))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Injection(InjectionError::InvalidRate { .. })
        ));
    }

    #[tokio::test]
    async fn failed_users_are_tallied() {
        let transport = MockTransport::new(|_| Ok(Response::new(503)));
        let summary = engine(InjectionProfile::new().at_once_users(4))
            .exec(one_request(), Arc::new(transport))
            .await
            .unwrap();

        assert_eq!(summary.users.failed, 4);
        assert_eq!(summary.report().global.ko, 4);
    }

    #[test]
    fn seeded_users_get_reproducible_rngs() {
        use rand::Rng;
        let a: u64 = user_rng(Some(42), 3).random();
        let b: u64 = user_rng(Some(42), 3).random();
        let c: u64 = user_rng(Some(42), 4).random();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
