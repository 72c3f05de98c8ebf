//! Feeders supply fresh variable bindings to virtual users.
//!
//! A feeder is shared by every user that draws from it, so each draw has to be
//! atomic: a record handed to one user is never handed to another (unless the
//! strategy is explicitly circular or random), and a generated record is built
//! in a single, uninterrupted pass.

use std::{
    collections::HashMap,
    fmt::{self, Debug},
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

use crate::{error::StepError, session::Value};

/// One set of bindings produced by a feeder.
pub type Record = HashMap<String, Value>;

/// A stateful source of records, shared across all virtual users.
///
/// # Example
/// ```rust
/// use stampede::feeder::{Feeder, Record};
/// use stampede::error::StepError;
///
/// #[derive(Debug)]
/// struct Fixed;
///
/// impl Feeder for Fixed {
///     fn name(&self) -> &str {
///         "fixed"
///     }
///
///     fn next(&self) -> Result<Record, StepError> {
///         Ok(Record::from([("id".to_string(), 1.into())]))
///     }
/// }
/// ```
pub trait Feeder: Send + Sync + Debug {
    /// Name used in logs and in [`StepError::FeederExhausted`].
    fn name(&self) -> &str;

    /// Draws the next record.
    ///
    /// Finite feeders return [`StepError::FeederExhausted`] once every record
    /// has been consumed.
    fn next(&self) -> Result<Record, StepError>;
}

/// How a [`RecordFeeder`] walks its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedStrategy {
    /// Original order, each record once, then exhausted.
    #[default]
    Queue,
    /// Original order, wrapping back to the first record forever.
    Circular,
    /// Uniform random pick on every draw, never exhausts.
    Random,
    /// Shuffled once at construction, then consumed like `Queue`.
    Shuffle,
}

/// Feeder over an in-memory list of records, typically parsed from a CSV or
/// JSON file by the caller.
pub struct RecordFeeder {
    name: String,
    records: Vec<Record>,
    strategy: FeedStrategy,
    cursor: AtomicUsize,
    rng: Mutex<StdRng>,
}

impl RecordFeeder {
    pub fn new(
        name: impl Into<String>,
        records: impl IntoIterator<Item = Record>,
        strategy: FeedStrategy,
    ) -> Self {
        Self::seeded(name, records, strategy, rand::random())
    }

    /// Like [`RecordFeeder::new`], with a fixed seed for `Random` and
    /// `Shuffle`.
    pub fn seeded(
        name: impl Into<String>,
        records: impl IntoIterator<Item = Record>,
        strategy: FeedStrategy,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut records: Vec<Record> = records.into_iter().collect();
        if strategy == FeedStrategy::Shuffle {
            records.shuffle(&mut rng);
        }
        Self {
            name: name.into(),
            records,
            strategy,
            cursor: AtomicUsize::new(0),
            rng: Mutex::new(rng),
        }
    }

    pub fn queue(name: impl Into<String>, records: impl IntoIterator<Item = Record>) -> Self {
        Self::new(name, records, FeedStrategy::Queue)
    }

    pub fn circular(name: impl Into<String>, records: impl IntoIterator<Item = Record>) -> Self {
        Self::new(name, records, FeedStrategy::Circular)
    }

    /// Parses a JSON array of flat objects, one record per object.
    pub fn from_json(
        name: impl Into<String>,
        json: &str,
        strategy: FeedStrategy,
    ) -> Result<Self, serde_json::Error> {
        let records: Vec<Record> = serde_json::from_str(json)?;
        Ok(Self::new(name, records, strategy))
    }

    pub fn strategy(&self) -> FeedStrategy {
        self.strategy
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Feeder for RecordFeeder {
    fn name(&self) -> &str {
        &self.name
    }

    fn next(&self) -> Result<Record, StepError> {
        let len = self.records.len();
        if len == 0 {
            return Err(StepError::exhausted(&self.name));
        }
        let index = match self.strategy {
            FeedStrategy::Queue | FeedStrategy::Shuffle => {
                // Every caller gets a distinct slot; slots past the end mean exhaustion.
                let slot = self.cursor.fetch_add(1, Ordering::Relaxed);
                if slot >= len {
                    return Err(StepError::exhausted(&self.name));
                }
                slot
            }
            FeedStrategy::Circular => self.cursor.fetch_add(1, Ordering::Relaxed) % len,
            FeedStrategy::Random => self.rng.lock().random_range(0..len),
        };
        Ok(self.records[index].clone())
    }
}

impl Debug for RecordFeeder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordFeeder")
            .field("name", &self.name)
            .field("records", &self.records.len())
            .field("strategy", &self.strategy)
            .finish()
    }
}

type Generator = dyn Fn(&mut StdRng) -> Record + Send + Sync;

/// Never-ending feeder computing a fresh record per draw from a seeded RNG.
///
/// The generator runs while holding the feeder's lock, so concurrent users
/// can never observe a record assembled from two generation passes, and a
/// fixed seed gives a reproducible sequence of records.
pub struct GeneratorFeeder {
    name: String,
    rng: Mutex<StdRng>,
    generate: Box<Generator>,
}

impl GeneratorFeeder {
    pub fn new<F>(name: impl Into<String>, generate: F) -> Self
    where
        F: Fn(&mut StdRng) -> Record + Send + Sync + 'static,
    {
        Self::seeded(name, rand::random(), generate)
    }

    pub fn seeded<F>(name: impl Into<String>, seed: u64, generate: F) -> Self
    where
        F: Fn(&mut StdRng) -> Record + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            generate: Box::new(generate),
        }
    }
}

impl Feeder for GeneratorFeeder {
    fn name(&self) -> &str {
        &self.name
    }

    fn next(&self) -> Result<Record, StepError> {
        let mut rng = self.rng.lock();
        Ok((self.generate)(&mut rng))
    }
}

impl Debug for GeneratorFeeder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratorFeeder")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
