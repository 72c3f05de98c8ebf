//! Open-workload injection profiles.
//!
//! An [`InjectionProfile`] is an ordered list of directives laid out on a
//! single timeline. Each directive starts at the current *baseline* offset:
//!
//! - `nothing_for(d)` moves the baseline by `d`;
//! - `at_once_users(n)` starts `n` users at the baseline and leaves it as is;
//! - `ramp_users(n, d)` starts the i-th of `n` users at `baseline + i·d/n`,
//!   then moves the baseline by `d`;
//! - `constant_rate(r, d)` and `ramp_rate(r0, r1, d)` start users at a
//!   (linearly interpolated) arrival rate, then move the baseline by `d`.
//!
//! # Arrival rates
//! Rate directives are quantized on the engine tick. At `elapsed` into a
//! directive of length `during`, the instantaneous rate is
//!
//! ```text
//! t = elapsed / during
//! r(t) = from + (to - from) * t
//! ```
//!
//! and the number of arrivals in the tick is
//!
//! ```text
//! add_f = r(t) * tick_seconds
//! arrivals = floor(add_f + fractional)
//! fractional = (add_f + fractional) - arrivals
//! ```
//!
//! Carrying `fractional` across ticks keeps the long-term average exact even
//! when a single tick holds less than one arrival. The arrivals of one tick
//! are spread evenly across it.

use std::time::Duration;

use crate::error::InjectionError;

/// Upper bound of arrivals produced by a single rate tick.
pub const MAX_ARRIVALS_PER_TICK: u64 = 1 << 20;

#[derive(Debug, Clone, PartialEq)]
pub enum InjectionStep {
    NothingFor(Duration),
    AtOnce { users: u64 },
    Ramp { users: u64, during: Duration },
    /// `rate` users per second.
    ConstantRate { rate: f64, during: Duration },
    /// From `from` to `to` users per second.
    RampRate { from: f64, to: f64, during: Duration },
}

/// Ordered injection directives.
///
/// ```rust
/// use std::time::Duration;
/// use stampede::InjectionProfile;
///
/// let profile = InjectionProfile::new()
///     .nothing_for(Duration::from_secs(5))
///     .at_once_users(2)
///     .ramp_users(5, Duration::from_secs(10));
/// let offsets = profile.schedule(Duration::from_millis(100)).unwrap();
/// assert_eq!(offsets.len(), 7);
/// assert_eq!(offsets[0], Duration::from_secs(5));
/// assert_eq!(offsets[6], Duration::from_secs(13));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InjectionProfile {
    steps: Vec<InjectionStep>,
}

impl InjectionProfile {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn step(mut self, step: InjectionStep) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn nothing_for(self, during: Duration) -> Self {
        self.step(InjectionStep::NothingFor(during))
    }

    #[must_use]
    pub fn at_once_users(self, users: u64) -> Self {
        self.step(InjectionStep::AtOnce { users })
    }

    #[must_use]
    pub fn ramp_users(self, users: u64, during: Duration) -> Self {
        self.step(InjectionStep::Ramp { users, during })
    }

    #[must_use]
    pub fn constant_rate(self, rate: f64, during: Duration) -> Self {
        self.step(InjectionStep::ConstantRate { rate, during })
    }

    #[must_use]
    pub fn ramp_rate(self, from: f64, to: f64, during: Duration) -> Self {
        self.step(InjectionStep::RampRate { from, to, during })
    }

    pub fn steps(&self) -> &[InjectionStep] {
        &self.steps
    }

    /// Offset at which the last directive ends.
    pub fn duration(&self) -> Duration {
        self.steps
            .iter()
            .map(|s| match s {
                InjectionStep::AtOnce { .. } => Duration::ZERO,
                InjectionStep::NothingFor(during)
                | InjectionStep::Ramp { during, .. }
                | InjectionStep::ConstantRate { during, .. }
                | InjectionStep::RampRate { during, .. } => *during,
            })
            .sum()
    }

    pub fn validate(&self, tick: Duration) -> Result<(), InjectionError> {
        if tick.is_zero() {
            return Err(InjectionError::ZeroTick);
        }
        for (index, step) in self.steps.iter().enumerate() {
            let rates: &[f64] = match step {
                InjectionStep::ConstantRate { rate, .. } => &[*rate],
                InjectionStep::RampRate { from, to, .. } => &[*from, *to],
                _ => &[],
            };
            if let Some(&rate) = rates.iter().find(|r| !r.is_finite() || **r < 0.0) {
                return Err(InjectionError::InvalidRate { index, rate });
            }
        }
        Ok(())
    }

    /// Every spawn offset, in non-decreasing order.
    pub fn schedule(&self, tick: Duration) -> Result<Vec<Duration>, InjectionError> {
        self.validate(tick)?;

        let mut offsets = Vec::new();
        let mut baseline = Duration::ZERO;
        for step in &self.steps {
            match *step {
                InjectionStep::NothingFor(during) => baseline += during,
                InjectionStep::AtOnce { users } => {
                    offsets.extend((0..users).map(|_| baseline));
                }
                InjectionStep::Ramp { users, during } => {
                    offsets.extend((0..users).map(|i| baseline + fraction(during, i, users)));
                    baseline += during;
                }
                InjectionStep::ConstantRate { rate, during } => {
                    rate_offsets(&mut offsets, baseline, during, rate, rate, tick);
                    baseline += during;
                }
                InjectionStep::RampRate { from, to, during } => {
                    rate_offsets(&mut offsets, baseline, during, from, to, tick);
                    baseline += during;
                }
            }
        }
        Ok(offsets)
    }
}

/// `d · i / n`, exact to the nanosecond.
fn fraction(d: Duration, i: u64, n: u64) -> Duration {
    if n == 0 {
        return Duration::ZERO;
    }
    let nanos = d.as_nanos() * u128::from(i) / u128::from(n);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

fn rate_offsets(
    offsets: &mut Vec<Duration>,
    baseline: Duration,
    during: Duration,
    from: f64,
    to: f64,
    tick: Duration,
) {
    let mut fractional = 0.0;
    let mut elapsed = Duration::ZERO;
    while elapsed < during {
        let (arrivals, f) = calc_arrivals(elapsed, during, from, to, fractional, tick);
        fractional = f;
        // the last tick may be cut short by the end of the directive
        let span = tick.min(during - elapsed);
        let start = baseline + elapsed;
        offsets.extend((0..arrivals).map(|j| start + fraction(span, j, arrivals)));
        elapsed += tick;
    }
}

/// Pure function computing how many users arrive during the tick starting at
/// `elapsed`.
///
/// Returns `(arrivals, next_fractional_part)`.
pub fn calc_arrivals(
    elapsed: Duration,
    during: Duration,
    from: f64,
    to: f64,
    fractional: f64,
    tick: Duration,
) -> (u64, f64) {
    // Interpolation factor [0.0..1.0]
    let t = if during.is_zero() {
        1.0
    } else {
        (elapsed.as_secs_f64() / during.as_secs_f64()).min(1.0)
    };
    let tick_rate = from + (to - from) * t;
    let add_f = tick_rate * tick.as_secs_f64();

    let add_total_f = (add_f + fractional).floor();
    let fractional = (add_f + fractional) - add_total_f;

    let arrivals = if add_total_f >= MAX_ARRIVALS_PER_TICK as f64 {
        MAX_ARRIVALS_PER_TICK
    } else if add_total_f < 0.0 {
        0
    } else {
        add_total_f as u64
    };

    (arrivals, fractional)
}
