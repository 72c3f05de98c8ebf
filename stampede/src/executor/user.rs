use std::{mem, sync::Arc, time::Duration};

use rand::rngs::StdRng;
use tokio::time::Instant;

use super::{cancelled, ExecutionContext};
use crate::{
    check::{evaluate_all, Check},
    error::{CancelReason, StepError},
    metric::Outcome,
    protocol::HttpRequest,
    scenario::{FailurePolicy, LoopKind, Scenario, Step},
    session::{Session, Value},
    transport::Transport,
};

/// Where a virtual user is in its life.
#[derive(Debug, Clone, PartialEq)]
pub enum UserState {
    /// Executing the step at `pointer` (one index per nesting level).
    Running { pointer: Vec<usize> },
    /// Paused until the clock reaches `until`.
    Suspended { until: Instant },
    Completed,
    Cancelled(CancelReason),
    Failed(StepError),
}

impl UserState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled(_) | Self::Failed(_))
    }
}

/// Final state of one virtual user.
#[derive(Debug, Clone)]
pub struct UserReport {
    pub id: u64,
    pub state: UserState,
    pub session: Session,
}

enum Scope<'a> {
    Root,
    Group,
    Block,
    Loop {
        kind: &'a LoopKind,
        counter: &'a str,
        iteration: u64,
        /// Value the counter key held before the loop, restored on exit so
        /// nested loops sharing a key do not clobber each other.
        shadowed: Option<Value>,
    },
}

struct Frame<'a> {
    steps: &'a [Step],
    pc: usize,
    scope: Scope<'a>,
}

impl<'a> Frame<'a> {
    fn new(steps: &'a [Step], scope: Scope<'a>) -> Self {
        Self { steps, pc: 0, scope }
    }
}

/// One simulated actor walking the scenario program with its own session.
pub(crate) struct VirtualUser<T> {
    id: u64,
    session: Session,
    state: UserState,
    rng: StdRng,
    ctx: ExecutionContext<T>,
}

impl<T: Transport> VirtualUser<T> {
    pub fn new(id: u64, ctx: ExecutionContext<T>, rng: StdRng) -> Self {
        Self {
            id,
            session: Session::for_user(id),
            state: UserState::Running { pointer: Vec::new() },
            rng,
            ctx,
        }
    }

    /// Runs the whole program and reports how it ended.
    pub async fn run(mut self) -> UserReport {
        tracing::trace!(user = self.id, "Virtual user started");
        let scenario: Arc<Scenario> = Arc::clone(&self.ctx.scenario);
        self.state = self.interpret(&scenario).await;
        tracing::debug!(user = self.id, state = ?self.state, "Virtual user finished");
        UserReport {
            id: self.id,
            state: self.state,
            session: self.session,
        }
    }

    async fn interpret(&mut self, scenario: &Scenario) -> UserState {
        let mut frames = vec![Frame::new(&scenario.steps, Scope::Root)];
        let mut groups: Vec<&str> = Vec::new();

        loop {
            if let Some(reason) = self.cancel_reason() {
                return UserState::Cancelled(reason);
            }
            let Some(frame) = frames.last_mut() else {
                return UserState::Completed;
            };

            if frame.pc >= frame.steps.len() {
                match &mut frame.scope {
                    Scope::Loop {
                        kind,
                        counter,
                        iteration,
                        shadowed,
                    } => {
                        let next = *iteration + 1;
                        if self.loop_continues(kind, next) {
                            *iteration = next;
                            frame.pc = 0;
                            self.session = mem::take(&mut self.session).set(*counter, next);
                            // give other users a turn between iterations
                            tokio::task::yield_now().await;
                            continue;
                        }
                        let session = mem::take(&mut self.session);
                        self.session = match shadowed.take() {
                            Some(outer) => session.set(*counter, outer),
                            None => session.remove(counter),
                        };
                    }
                    Scope::Group => {
                        groups.pop();
                    }
                    Scope::Root | Scope::Block => {}
                }
                frames.pop();
                continue;
            }

            let steps = frame.steps;
            let step = &steps[frame.pc];
            frame.pc += 1;
            self.state = UserState::Running {
                pointer: frames.iter().map(|f| f.pc - 1).collect(),
            };

            let result = match step {
                Step::Request(request) => self.request(request, &groups).await,
                Step::Pause(pause) => {
                    let duration = pause.duration(&mut self.rng);
                    if let Some(reason) = self.suspend(duration).await {
                        return UserState::Cancelled(reason);
                    }
                    Ok(())
                }
                Step::Loop {
                    kind,
                    counter,
                    steps,
                } => {
                    if self.loop_continues(kind, 0) {
                        let shadowed = self.session.get(counter).cloned();
                        self.session = mem::take(&mut self.session).set(counter.as_str(), 0);
                        frames.push(Frame::new(
                            steps,
                            Scope::Loop {
                                kind,
                                counter,
                                iteration: 0,
                                shadowed,
                            },
                        ));
                    }
                    Ok(())
                }
                Step::Feed(feeder) => match feeder.next() {
                    Ok(record) => {
                        self.session = mem::take(&mut self.session).merge(record);
                        Ok(())
                    }
                    Err(err) => {
                        let name = stat_name(&groups, format!("Feed {}", feeder.name()));
                        self.ctx
                            .stats
                            .record(name, Outcome::Ko(err.to_string()), Duration::ZERO);
                        Err(err)
                    }
                },
                Step::Group { name, steps } => {
                    groups.push(name);
                    frames.push(Frame::new(steps, Scope::Group));
                    Ok(())
                }
                Step::DoIf { condition, steps } => {
                    if condition.holds(&self.session) {
                        frames.push(Frame::new(steps, Scope::Block));
                    }
                    Ok(())
                }
                Step::Exec(hook) => {
                    self.session = hook.apply(mem::take(&mut self.session));
                    Ok(())
                }
            };

            if let Err(err) = result {
                tracing::debug!(user = self.id, error = %err, "Step failed");
                if err.aborts_step_only() {
                    continue;
                }
                match scenario.on_failure {
                    FailurePolicy::StopUser => return UserState::Failed(err),
                    FailurePolicy::Continue => {}
                }
            }
        }
    }

    fn loop_continues(&self, kind: &LoopKind, iteration: u64) -> bool {
        match kind {
            LoopKind::Repeat(times) => iteration < *times,
            LoopKind::Forever => true,
            LoopKind::While(condition) => condition.holds(&self.session),
        }
    }

    fn cancel_reason(&self) -> Option<CancelReason> {
        *self.ctx.shutdown.borrow()
    }

    /// Sleeps for `duration` unless the run is cancelled first.
    async fn suspend(&mut self, duration: Duration) -> Option<CancelReason> {
        let until = Instant::now() + duration;
        self.state = UserState::Suspended { until };
        let mut shutdown = self.ctx.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep_until(until) => None,
            reason = cancelled(&mut shutdown) => Some(reason),
        }
    }

    async fn request(&mut self, request: &HttpRequest, groups: &[&str]) -> Result<(), StepError> {
        let name = stat_name(groups, request.display_name(&self.session));
        let stats = &self.ctx.stats;

        let prepared = match request.prepare(&self.ctx.protocol, &self.session) {
            Ok(prepared) => prepared,
            Err(err) => {
                stats.record(name, Outcome::Ko(err.to_string()), Duration::ZERO);
                return Err(err);
            }
        };

        let started = Instant::now();
        let response = match self.ctx.transport.send(prepared).await {
            Ok(response) => response,
            Err(err) => {
                stats.record(name, Outcome::Ko(err.to_string()), started.elapsed());
                return Err(err.into());
            }
        };
        let latency = if response.latency.is_zero() {
            started.elapsed()
        } else {
            response.latency
        };

        let implicit = (!request.has_status_check()).then(Check::implicit_status);
        let evaluation = evaluate_all(
            implicit.into_iter().chain(&request.checks),
            &response,
            mem::take(&mut self.session),
        );
        self.session = evaluation.session;

        match evaluation.failure {
            None => {
                stats.record(name, Outcome::Ok, latency);
                Ok(())
            }
            Some(failure) => {
                stats.record(name, Outcome::Ko(failure.to_string()), latency);
                Err(failure.into())
            }
        }
    }
}

fn stat_name(groups: &[&str], request: String) -> String {
    if groups.is_empty() {
        return request;
    }
    let mut name = groups.join(" / ");
    name.push_str(" / ");
    name.push_str(&request);
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        aggregate::{spawn_stats, StatsAggregate},
        check::Check,
        feeder::RecordFeeder,
        protocol::HttpProtocol,
        scenario::Condition,
        testing::MockTransport,
        transport::Response,
    };
    use rand::SeedableRng;
    use serde_json::json;
    use tokio::sync::watch;

    struct Harness {
        user: VirtualUser<MockTransport>,
        shutdown: watch::Sender<Option<CancelReason>>,
        stats: tokio::task::JoinHandle<StatsAggregate>,
    }

    impl Harness {
        fn new(scenario: Scenario, transport: MockTransport) -> Self {
            let (recorder, _, stats) =
                spawn_stats::<StatsAggregate>(Instant::now(), Duration::from_secs(1), 64);
            let (shutdown, rx) = watch::channel(None);
            let ctx = ExecutionContext {
                scenario: Arc::new(scenario),
                protocol: Arc::new(HttpProtocol::builder().base_url("http://test").build()),
                transport: Arc::new(transport),
                stats: recorder,
                shutdown: rx,
            };
            Self {
                user: VirtualUser::new(1, ctx, StdRng::seed_from_u64(1)),
                shutdown,
                stats,
            }
        }

        async fn run(self) -> (UserReport, StatsAggregate) {
            let report = self.user.run().await;
            drop(self.shutdown);
            (report, self.stats.await.unwrap())
        }
    }

    fn scenario(steps: Vec<Step>) -> Scenario {
        Scenario::builder().name("test").steps(steps).build()
    }

    fn ok() -> MockTransport {
        MockTransport::new(|_| Ok(Response::new(200)))
    }

    #[tokio::test]
    async fn repeat_injects_counter_each_iteration() {
        let transport = ok();
        let calls = transport.calls();
        let steps = vec![Step::repeat(
            3,
            vec![Step::request(HttpRequest::get("Get #{i}", "/videogame/#{i}"))],
        )
        .counter("i")];

        let (report, stats) = Harness::new(scenario(steps), transport).run().await;

        assert_eq!(report.state, UserState::Completed);
        let urls: Vec<_> = calls.lock().iter().map(|r| r.url.clone()).collect();
        assert_eq!(
            urls,
            ["http://test/videogame/0", "http://test/videogame/1", "http://test/videogame/2"]
        );
        assert_eq!(stats.total(), 3);
        assert!(stats.step("Get 2").is_some());
        // counter is scoped to the loop
        assert!(!report.session.contains("i"));
    }

    #[tokio::test]
    async fn nested_loops_keep_the_outer_counter() {
        let transport = ok();
        let calls = transport.calls();
        let steps = vec![Step::repeat(
            2,
            vec![
                Step::repeat(1, vec![Step::exec(|s| s)]),
                Step::request(HttpRequest::get("Outer", "/outer/#{counter}")),
            ],
        )];

        let (report, stats) = Harness::new(scenario(steps), transport).run().await;

        assert_eq!(report.state, UserState::Completed);
        let urls: Vec<_> = calls.lock().iter().map(|r| r.url.clone()).collect();
        assert_eq!(urls, ["http://test/outer/0", "http://test/outer/1"]);
        assert_eq!(stats.global.ko, 0);
        assert!(!report.session.contains("counter"));
    }

    #[tokio::test]
    async fn groups_prefix_stat_names() {
        let steps = vec![Step::group(
            "Browse",
            vec![Step::group("Inner", vec![Step::request(HttpRequest::get("List", "/"))])],
        )];
        let (_, stats) = Harness::new(scenario(steps), ok()).run().await;
        assert_eq!(stats.step("Browse / Inner / List").map(|s| s.ok), Some(1));
    }

    #[tokio::test]
    async fn failed_check_stops_user_by_default() {
        let transport = MockTransport::new(|_| Ok(Response::new(500)));
        let calls = transport.calls();
        let steps = vec![
            Step::request(HttpRequest::get("First", "/a")),
            Step::request(HttpRequest::get("Second", "/b")),
        ];

        let (report, stats) = Harness::new(scenario(steps), transport).run().await;

        assert!(matches!(report.state, UserState::Failed(StepError::CheckFailed(_))));
        assert_eq!(calls.lock().len(), 1);
        assert_eq!(stats.global.ko, 1);
    }

    #[tokio::test]
    async fn continue_policy_keeps_going() {
        let transport = MockTransport::new(|_| Ok(Response::new(404)));
        let steps = vec![
            Step::request(HttpRequest::get("First", "/a")),
            Step::request(HttpRequest::get("Second", "/b").check(Check::status().is(404))),
        ];
        let scenario = Scenario::builder()
            .name("continue")
            .steps(steps)
            .on_failure(FailurePolicy::Continue)
            .build();

        let (report, stats) = Harness::new(scenario, transport).run().await;

        assert_eq!(report.state, UserState::Completed);
        assert_eq!((stats.global.ok, stats.global.ko), (1, 1));
    }

    #[tokio::test]
    async fn unresolved_variable_only_aborts_the_step() {
        let transport = ok();
        let calls = transport.calls();
        let steps = vec![
            Step::request(
                HttpRequest::get("Secured", "/x").header("Authorization", "Bearer #{jwtToken}"),
            ),
            Step::request(HttpRequest::get("Public", "/y")),
        ];

        let (report, stats) = Harness::new(scenario(steps), transport).run().await;

        assert_eq!(report.state, UserState::Completed);
        assert_eq!(calls.lock().len(), 1);
        assert_eq!(stats.step("Secured").map(|s| s.ko), Some(1));
        assert_eq!(stats.step("Public").map(|s| s.ok), Some(1));
    }

    #[tokio::test]
    async fn transport_error_is_a_ko() {
        let transport = MockTransport::new(|_| {
            Err(crate::transport::TransportError::connect("connection refused"))
        });
        let steps = vec![Step::request(HttpRequest::get("Down", "/"))];

        let (report, stats) = Harness::new(scenario(steps), transport).run().await;

        assert!(matches!(report.state, UserState::Failed(StepError::Transport(_))));
        assert_eq!(stats.step("Down").map(|s| s.ko), Some(1));
    }

    #[tokio::test]
    async fn feed_merges_and_exhaustion_fails_the_user() {
        let feeder = RecordFeeder::queue(
            "games",
            [[("gameId".to_string(), json!(7))].into_iter().collect()],
        );
        let steps = vec![Step::forever(vec![
            Step::feed(feeder),
            Step::exec(|s| {
                let seen = s.get("seen").and_then(|v| v.as_u64()).unwrap_or(0);
                s.set("seen", seen + 1)
            }),
        ])];

        let (report, stats) = Harness::new(scenario(steps), ok()).run().await;

        assert!(matches!(report.state, UserState::Failed(StepError::FeederExhausted { .. })));
        assert_eq!(report.session.get("gameId"), Some(&json!(7)));
        assert_eq!(report.session.get("seen"), Some(&json!(1)));

        let feed = stats.step("Feed games").unwrap();
        assert_eq!((feed.ok, feed.ko), (0, 1));
        assert_eq!(feed.errors.keys().collect::<Vec<_>>(), ["feeder 'games' is exhausted"]);
        assert_eq!(stats.global.ko, 1);
    }

    #[tokio::test]
    async fn do_if_and_while() {
        let steps = vec![
            Step::as_long_as(
                Condition::new(|s| s.get("n").and_then(|v| v.as_u64()).unwrap_or(0) < 4),
                vec![Step::exec(|s| {
                    let n = s.get("n").and_then(|v| v.as_u64()).unwrap_or(0);
                    s.set("n", n + 1)
                })],
            ),
            Step::do_if(Condition::equals("n", 4), vec![Step::exec(|s| s.set("hit", true))]),
            Step::do_if(Condition::exists("nope"), vec![Step::exec(|s| s.set("miss", true))]),
        ];

        let (report, _) = Harness::new(scenario(steps), ok()).run().await;

        assert_eq!(report.state, UserState::Completed);
        assert_eq!(report.session.get("n"), Some(&json!(4)));
        assert_eq!(report.session.get("hit"), Some(&json!(true)));
        assert!(!report.session.contains("miss"));
    }

    #[tokio::test(start_paused = true)]
    async fn forever_loop_is_cancelled_within_a_tick() {
        let steps = vec![Step::forever(vec![
            Step::request(HttpRequest::get("Spin", "/")),
            Step::pause(Duration::from_secs(30)),
        ])];
        let harness = Harness::new(scenario(steps), ok());
        let shutdown = harness.shutdown;
        let user = tokio::spawn(harness.user.run());

        tokio::time::sleep(Duration::from_secs(95)).await;
        let cancelled_at = Instant::now();
        shutdown.send_replace(Some(CancelReason::Timeout));
        let report = user.await.unwrap();

        assert!(cancelled_at.elapsed() <= Duration::from_millis(100));
        assert_eq!(report.state, UserState::Cancelled(CancelReason::Timeout));
        drop(shutdown);
        let stats = harness.stats.await.unwrap();
        assert_eq!(stats.total(), 4);
    }

    #[tokio::test]
    async fn busy_forever_loop_observes_cancellation() {
        let steps = vec![Step::forever(vec![Step::exec(|s| s)])];
        let harness = Harness::new(scenario(steps), ok());
        let shutdown = harness.shutdown;
        let user = tokio::spawn(harness.user.run());

        tokio::task::yield_now().await;
        shutdown.send_replace(Some(CancelReason::Shutdown));
        let report = user.await.unwrap();
        assert_eq!(report.state, UserState::Cancelled(CancelReason::Shutdown));
    }

    #[test]
    fn stat_names() {
        assert_eq!(stat_name(&[], "Get".into()), "Get");
        assert_eq!(stat_name(&["A", "B"], "Get".into()), "A / B / Get");
    }
}
