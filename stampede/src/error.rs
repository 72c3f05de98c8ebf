//! Error types shared across the engine.

use std::fmt;

use thiserror::Error;

use crate::{check::CheckFailure, transport::TransportError};

/// Failure of a single step for a single virtual user.
///
/// None of these are fatal to the engine. They are recorded as KO outcomes
/// and, depending on the scenario's [`FailurePolicy`](crate::scenario::FailurePolicy),
/// end the journey of the user that hit them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepError {
    /// A `#{name}` placeholder referenced a variable missing from the session.
    #[error("unresolved session variable '{name}'")]
    UnresolvedVariable { name: String },

    /// A finite feeder ran out of records.
    #[error("feeder '{feeder}' is exhausted")]
    FeederExhausted { feeder: String },

    #[error(transparent)]
    CheckFailed(#[from] CheckFailure),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl StepError {
    #[inline]
    pub fn unresolved(name: impl Into<String>) -> Self {
        Self::UnresolvedVariable { name: name.into() }
    }

    #[inline]
    pub fn exhausted(feeder: impl Into<String>) -> Self {
        Self::FeederExhausted {
            feeder: feeder.into(),
        }
    }

    /// Template errors only abort the step that produced them; everything
    /// else is subject to the scenario's failure policy.
    pub fn aborts_step_only(&self) -> bool {
        matches!(self, Self::UnresolvedVariable { .. })
    }
}

/// Why a run (and every user still in it) was cancelled.
///
/// Cancellation is a terminal state of its own, not a failure: cancelled
/// users are never counted as KO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// The run hit its maximum duration.
    Timeout,
    /// The run was stopped from the outside.
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("cancelled by timeout"),
            Self::Shutdown => f.write_str("cancelled by shutdown"),
        }
    }
}

/// Defects in a scenario program, detected before any user starts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScenarioError {
    #[error("scenario name must not be empty")]
    EmptyName,

    #[error("invalid JSON path '{path}': {message}")]
    InvalidJsonPath { path: String, message: String },

    #[error("pause range is inverted: min {min:?} > max {max:?}")]
    InvertedPause {
        min: std::time::Duration,
        max: std::time::Duration,
    },
}

/// Defects in an injection profile.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InjectionError {
    #[error("injection step {index} has an invalid rate {rate} (must be finite and >= 0)")]
    InvalidRate { index: usize, rate: f64 },

    #[error("engine tick must be greater than zero")]
    ZeroTick,
}

/// Errors that stop a run from starting or completing.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid scenario: {0}")]
    Scenario(#[from] ScenarioError),

    #[error("invalid injection profile: {0}")]
    Injection(#[from] InjectionError),

    #[error("engine driver task failed: {0}")]
    Driver(#[from] tokio::task::JoinError),
}

/// A named setting override could not be parsed.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("setting '{key}' has invalid value '{value}': {message}")]
pub struct SettingsError {
    pub key: String,
    pub value: String,
    pub message: String,
}
