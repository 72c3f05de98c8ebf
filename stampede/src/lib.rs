//! Stampede: a scenario-driven HTTP load-testing engine.
//!
//! You describe *what a user does* as a [`Scenario`]: a tree of requests,
//! pauses, loops, feeds and groups, built once and shared by every virtual
//! user. You describe *when users arrive* as an [`InjectionProfile`]. The
//! [`Engine`] spawns one lightweight task per virtual user at the right
//! offsets and walks each of them through the scenario with its own
//! [`Session`].
//!
//! # Architecture
//!
//! - [`Session`]: per-user variables, passed by value from step to step.
//! - [`Template`]: strings with `#{name}` placeholders rendered from a session.
//! - [`Feeder`](feeder::Feeder): shared sources of fresh records merged into
//!   sessions.
//! - [`Check`](check::Check): extract a value from a response, validate it,
//!   optionally save it into the session.
//! - [`Scenario`] and [`Step`]: the immutable program every user runs.
//! - [`InjectionProfile`]: open-workload arrival schedule.
//! - [`Engine`]: schedules users, enforces the maximum duration, and
//!   aggregates outcomes.
//! - [`Transport`](transport::Transport): the seam to the actual HTTP client.
//! - [`Aggregate`], [`Report`] and [`Reporter`]: stats collection,
//!   figures, and output.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use stampede::{
//!     check::Check, report::StdoutReporter, transport::Transport, Engine, HttpProtocol,
//!     HttpRequest, InjectionProfile, Reporter, Scenario, Step,
//! };
//!
//! async fn browse<T: Transport>(
//!     transport: Arc<T>,
//! ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let scenario = Scenario::builder()
//!         .name("Browse")
//!         .steps(vec![
//!             Step::request(HttpRequest::get("Get all video games", "/videogame")
//!                 .check(Check::status().is(200))),
//!             Step::pause(Duration::from_secs(1)),
//!         ])
//!         .build();
//!
//!     let summary = Engine::builder()
//!         .injection(InjectionProfile::new().ramp_users(10, Duration::from_secs(10)))
//!         .protocol(HttpProtocol::builder().base_url("https://videogamedb.uk/api").build())
//!         .max_duration(Duration::from_secs(30))
//!         .build()
//!         .exec(scenario, transport)
//!         .await?;
//!
//!     StdoutReporter.report(&summary.report()).await?;
//!     Ok(())
//! }
//! ```
//!
//! The runnable version of this, with a real HTTP client, lives in
//! `examples/video_game_db.rs`.
//!
//! # Feature flags
//!
//! - `macros`: `#[derive(Record)]` for typed feeder records. (Enabled by default)
//! - `reqwest`: [`ReqwestTransport`](transport::ReqwestTransport), a ready-made
//!   transport on top of `reqwest`.

// Lets `#[derive(Record)]` refer to `::stampede` from inside this crate.
#[cfg(feature = "macros")]
extern crate self as stampede;

/// Stats collection
pub mod aggregate;
/// Pass/fail criteria over reports
pub mod assertion;
/// Response checks
pub mod check;
pub mod error;
/// Spawning and running virtual users
pub mod executor;
/// Shared record sources
pub mod feeder;
/// User arrival schedules
pub mod injection;
/// Single observations
pub mod metric;
/// Protocol defaults and request templates
pub mod protocol;
/// Reports and Reporters
pub mod report;
/// The scenario program
pub mod scenario;
pub mod session;
pub mod settings;
pub mod template;
/// The seam to the HTTP client
pub mod transport;

#[cfg(test)]
mod testing;

pub use aggregate::{Aggregate, StatsAggregate};
pub use executor::{Engine, Run, RunSummary};
pub use injection::InjectionProfile;
pub use metric::Metric;
pub use protocol::{HttpProtocol, HttpRequest};
pub use report::{Report, Reporter, StatsReport};
pub use scenario::{Scenario, Step};
pub use session::Session;
pub use settings::RunSettings;
pub use template::Template;

#[cfg(feature = "macros")]
pub use stampede_macros::Record;
