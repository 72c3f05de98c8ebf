//! Executor: spawning virtual users on schedule and walking them through the
//! scenario program.
//!
//! The [`Engine`] turns an [`InjectionProfile`](crate::InjectionProfile) into
//! exact spawn offsets, then drives a single task that sleeps until the next
//! offset, spawns the users due at that time, and reaps finished users. Each
//! virtual user is its own lightweight Tokio task; a user that pauses sleeps on
//! the timer wheel and never occupies a worker thread.
//!
//! # High-level flow
//! 1. The scenario and the injection profile are validated, and the full spawn
//!    schedule is computed up front.
//! 2. A stats aggregation task is spawned; every user reports into it through
//!    a cloned [`StatsRecorder`].
//! 3. The driver task spawns users as their offsets come due. Spawning only
//!    depends on the clock, never on how long earlier users take.
//! 4. The run ends when every user has finished, when `max_duration` elapses,
//!    or when [`Run::stop`] is called.
//!
//! # Cancellation
//! Cancellation travels over a `watch` channel shared by every user. Users
//! look at it before every step and at the top of every loop iteration, and
//! pauses race their timer against it, so a cancelled run is noticed by every
//! suspended or looping user right away. Users still running after
//! `grace_period` are aborted.
//!
//! # Tuning knobs
//! - `tick`: quantum of rate directives (`constant_rate`, `ramp_rate`).
//!   Smaller ticks spread arrivals more smoothly. Typical values: 10–200ms.
//! - `grace_period`: how long in-flight users may unwind after cancellation.
//! - `snapshot_interval`: how often [`Run::snapshot`] gets fresh numbers.
//! - `seed`: makes per-user randomness (uniform pauses) reproducible.
mod engine;
mod user;

pub use engine::{Engine, Run, RunSummary, UserTally};
pub use user::{UserReport, UserState};

use std::sync::Arc;

use tokio::sync::watch::Receiver;

use crate::{
    aggregate::StatsRecorder, error::CancelReason, protocol::HttpProtocol, scenario::Scenario,
};

/// Everything a virtual user shares with the rest of the run.
pub(crate) struct ExecutionContext<T> {
    pub scenario: Arc<Scenario>,
    pub protocol: Arc<HttpProtocol>,
    pub transport: Arc<T>,
    pub stats: StatsRecorder,
    pub shutdown: Receiver<Option<CancelReason>>,
}

impl<T> Clone for ExecutionContext<T> {
    fn clone(&self) -> Self {
        Self {
            scenario: Arc::clone(&self.scenario),
            protocol: Arc::clone(&self.protocol),
            transport: Arc::clone(&self.transport),
            stats: self.stats.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

/// Resolves once the run is cancelled. Never resolves if the sender is gone
/// without having cancelled.
pub(crate) async fn cancelled(shutdown: &mut Receiver<Option<CancelReason>>) -> CancelReason {
    let reason = match shutdown.wait_for(Option::is_some).await {
        Ok(reason) => *reason,
        Err(_) => None,
    };
    match reason {
        Some(reason) => reason,
        None => std::future::pending().await,
    }
}
