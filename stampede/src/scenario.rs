//! The scenario program: an immutable tree of steps shared by every user.
//!
//! ```rust
//! use std::time::Duration;
//! use stampede::{check::Check, HttpRequest, Scenario, Step};
//!
//! let scenario = Scenario::builder()
//!     .name("Browse games")
//!     .steps(vec![
//!         Step::repeat(3, vec![
//!             Step::request(HttpRequest::get("Get game #{counter}", "/videogame/#{counter}")
//!                 .check(Check::json_path("$.name").save_as("gameName"))),
//!             Step::pause(Duration::from_secs(1)),
//!         ]),
//!     ])
//!     .build();
//! assert!(scenario.validate().is_ok());
//! ```

use std::{fmt, sync::Arc, time::Duration};

use rand::Rng;
use typed_builder::TypedBuilder;

use crate::{
    check::Extractor, error::ScenarioError, feeder::Feeder, protocol::HttpRequest,
    session::Session, session::Value,
};

/// Default session key of loop counters.
pub const DEFAULT_COUNTER: &str = "counter";

/// What a user does when one of its steps fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Abandon the rest of the journey; the user ends as failed.
    #[default]
    StopUser,
    /// Record the KO and move on to the next step.
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pause {
    Fixed(Duration),
    /// Uniformly distributed in `[min, max]`, drawn from the user's RNG.
    Uniform { min: Duration, max: Duration },
}

impl Pause {
    pub fn duration<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        match *self {
            Self::Fixed(d) => d,
            Self::Uniform { min, max } if min >= max => min,
            Self::Uniform { min, max } => {
                let lo = u64::try_from(min.as_nanos()).unwrap_or(u64::MAX);
                let hi = u64::try_from(max.as_nanos()).unwrap_or(u64::MAX);
                Duration::from_nanos(rng.random_range(lo..=hi))
            }
        }
    }
}

/// A predicate over the session, used by `while` loops and `do_if` blocks.
#[derive(Clone)]
pub struct Condition(Arc<dyn Fn(&Session) -> bool + Send + Sync>);

impl Condition {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Session) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// True when the session holds `key`.
    pub fn exists(key: impl Into<String>) -> Self {
        let key = key.into();
        Self::new(move |s| s.contains(&key))
    }

    /// True when the session holds `key` with exactly `value`.
    pub fn equals(key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        let value = value.into();
        Self::new(move |s| s.get(&key) == Some(&value))
    }

    pub fn holds(&self, session: &Session) -> bool {
        (self.0)(session)
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Condition(..)")
    }
}

/// Session function run by [`Step::Exec`].
#[derive(Clone)]
pub struct Hook(Arc<dyn Fn(Session) -> Session + Send + Sync>);

impl Hook {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Session) -> Session + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn apply(&self, session: Session) -> Session {
        (self.0)(session)
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Hook(..)")
    }
}

#[derive(Debug, Clone)]
pub enum LoopKind {
    Repeat(u64),
    /// Runs until the run is cancelled.
    Forever,
    /// Re-evaluated before every iteration.
    While(Condition),
}

/// One node of the scenario program.
#[derive(Debug, Clone)]
pub enum Step {
    Request(Box<HttpRequest>),
    Pause(Pause),
    Loop {
        kind: LoopKind,
        /// Session key receiving the 0-based iteration index.
        counter: String,
        steps: Vec<Step>,
    },
    Feed(Arc<dyn Feeder>),
    /// Prefixes the stats names of its requests; no effect on control flow.
    Group { name: String, steps: Vec<Step> },
    DoIf { condition: Condition, steps: Vec<Step> },
    Exec(Hook),
}

impl Step {
    pub fn request(request: HttpRequest) -> Self {
        Self::Request(Box::new(request))
    }

    pub fn pause(duration: Duration) -> Self {
        Self::Pause(Pause::Fixed(duration))
    }

    pub fn pause_between(min: Duration, max: Duration) -> Self {
        Self::Pause(Pause::Uniform { min, max })
    }

    pub fn repeat(times: u64, steps: Vec<Step>) -> Self {
        Self::looping(LoopKind::Repeat(times), steps)
    }

    pub fn forever(steps: Vec<Step>) -> Self {
        Self::looping(LoopKind::Forever, steps)
    }

    pub fn as_long_as(condition: Condition, steps: Vec<Step>) -> Self {
        Self::looping(LoopKind::While(condition), steps)
    }

    fn looping(kind: LoopKind, steps: Vec<Step>) -> Self {
        Self::Loop {
            kind,
            counter: DEFAULT_COUNTER.to_owned(),
            steps,
        }
    }

    /// Sets the counter key of a loop. No-op on other steps.
    #[must_use]
    pub fn counter(mut self, key: impl Into<String>) -> Self {
        if let Self::Loop { counter, .. } = &mut self {
            *counter = key.into();
        }
        self
    }

    pub fn feed<F: Feeder + 'static>(feeder: F) -> Self {
        Self::Feed(Arc::new(feeder))
    }

    /// Draws from a feeder shared with other steps or scenarios.
    pub fn feed_shared(feeder: Arc<dyn Feeder>) -> Self {
        Self::Feed(feeder)
    }

    pub fn group(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self::Group {
            name: name.into(),
            steps,
        }
    }

    pub fn do_if(condition: Condition, steps: Vec<Step>) -> Self {
        Self::DoIf { condition, steps }
    }

    pub fn exec<F>(f: F) -> Self
    where
        F: Fn(Session) -> Session + Send + Sync + 'static,
    {
        Self::Exec(Hook::new(f))
    }

    /// Nested steps of loops, groups and conditional blocks.
    pub fn children(&self) -> &[Step] {
        match self {
            Self::Loop { steps, .. } | Self::Group { steps, .. } | Self::DoIf { steps, .. } => {
                steps
            }
            _ => &[],
        }
    }
}

impl From<HttpRequest> for Step {
    fn from(request: HttpRequest) -> Self {
        Self::request(request)
    }
}

/// A named scenario program.
///
/// Built once before the run and shared read-only by all users.
#[derive(Debug, Clone, TypedBuilder)]
pub struct Scenario {
    #[builder(setter(into))]
    pub name: String,
    pub steps: Vec<Step>,
    #[builder(default)]
    pub on_failure: FailurePolicy,
}

impl Scenario {
    /// Reports defects that would otherwise only surface mid-run.
    pub fn validate(&self) -> Result<(), ScenarioError> {
        if self.name.trim().is_empty() {
            return Err(ScenarioError::EmptyName);
        }
        validate_steps(&self.steps)
    }

    /// Number of request steps in the program, loops counted once.
    pub fn request_count(&self) -> usize {
        fn count(steps: &[Step]) -> usize {
            steps
                .iter()
                .map(|s| match s {
                    Step::Request(_) => 1,
                    other => count(other.children()),
                })
                .sum()
        }
        count(&self.steps)
    }
}

fn validate_steps(steps: &[Step]) -> Result<(), ScenarioError> {
    for step in steps {
        match step {
            Step::Request(request) => {
                for check in &request.checks {
                    if let Extractor::JsonPath(path) = &check.extractor {
                        if let Some(message) = path.error() {
                            return Err(ScenarioError::InvalidJsonPath {
                                path: path.source().to_owned(),
                                message: message.to_owned(),
                            });
                        }
                    }
                }
            }
            Step::Pause(Pause::Uniform { min, max }) if min > max => {
                return Err(ScenarioError::InvertedPause {
                    min: *min,
                    max: *max,
                });
            }
            other => validate_steps(other.children())?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::Check;
    use rand::{rngs::StdRng, SeedableRng};

    mod validate {
        use super::*;

        #[test]
        fn accepts_nested_program() {
            let scenario = Scenario::builder()
                .name("ok")
                .steps(vec![Step::group(
                    "g",
                    vec![Step::forever(vec![Step::request(
                        HttpRequest::get("x", "/x").check(Check::json_path("$.id")),
                    )])],
                )])
                .build();
            assert_eq!(scenario.validate(), Ok(()));
            assert_eq!(scenario.request_count(), 1);
        }

        #[test]
        fn rejects_empty_name() {
            let scenario = Scenario::builder().name(" ").steps(vec![]).build();
            assert_eq!(scenario.validate(), Err(ScenarioError::EmptyName));
        }

        #[test]
        fn finds_bad_json_path_deep_inside() {
            let scenario = Scenario::builder()
                .name("bad")
                .steps(vec![Step::repeat(
                    2,
                    vec![Step::do_if(
                        Condition::exists("x"),
                        vec![Step::request(
                            HttpRequest::get("x", "/x").check(Check::json_path("id")),
                        )],
                    )],
                )])
                .build();
            assert!(matches!(
                scenario.validate(),
                Err(ScenarioError::InvalidJsonPath { path, .. }) if path == "id"
            ));
        }

        #[test]
        fn rejects_inverted_pause() {
            let scenario = Scenario::builder()
                .name("pause")
                .steps(vec![Step::pause_between(
                    Duration::from_secs(3),
                    Duration::from_secs(1),
                )])
                .build();
            assert!(matches!(
                scenario.validate(),
                Err(ScenarioError::InvertedPause { .. })
            ));
        }
    }

    #[test]
    fn uniform_pause_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let pause = Pause::Uniform {
            min: Duration::from_millis(100),
            max: Duration::from_millis(200),
        };
        for _ in 0..100 {
            let d = pause.duration(&mut rng);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(200));
        }
    }

    #[test]
    fn counter_key_only_applies_to_loops() {
        let step = Step::repeat(2, vec![]).counter("myCounter");
        assert!(matches!(step, Step::Loop { ref counter, .. } if counter == "myCounter"));
        assert!(matches!(Step::forever(vec![]), Step::Loop { ref counter, .. } if counter == DEFAULT_COUNTER));
        assert!(matches!(Step::pause(Duration::ZERO).counter("x"), Step::Pause(_)));
    }

    #[test]
    fn conditions() {
        let session = Session::new().set("gameId", 3);
        assert!(Condition::exists("gameId").holds(&session));
        assert!(!Condition::exists("token").holds(&session));
        assert!(Condition::equals("gameId", 3).holds(&session));
        assert!(!Condition::equals("gameId", "3").holds(&session));
    }
}
