//! Restriction trackers and the claim-observing wrapper around them.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::errors::UserResult;

/// A tracker's reading of work done and work left within one element.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Progress {
    /// Work completed so far, in the tracker's own units.
    pub completed: f64,
    /// Work remaining, in the same units.
    pub remaining: f64,
}

/// Mediates claims against a restriction and supports self-split.
///
/// A tracker is constructed fresh for each element entering a splittable
/// process mode. The process thread claims positions through it while a
/// control thread may concurrently ask it to split off the unclaimed
/// remainder; implementations only need interior consistency, the runner
/// serializes cross-thread access.
pub trait RestrictionTracker {
    /// The restriction this tracker mediates.
    type Restriction;
    /// Positions claimed within the restriction.
    type Position;

    /// Attempts to claim `position`. Work may only be performed for claimed
    /// positions; a failed claim means the restriction is exhausted.
    fn try_claim(&mut self, position: Self::Position) -> bool;

    /// The restriction as currently bounded, shrinking as splits succeed.
    fn current_restriction(&self) -> Self::Restriction;

    /// Splits off a fraction of the remaining work, returning
    /// `(primary, residual)`, or `None` if nothing remains to split.
    fn try_split(&mut self, fraction_of_remainder: f64) -> Option<(Self::Restriction, Self::Restriction)>;

    /// Verifies that the restriction has been fully worked through.
    fn check_done(&self) -> UserResult<()>;

    /// The tracker's progress reading, if it supports one.
    fn progress(&self) -> Option<Progress> {
        None
    }
}

/// Observes claim outcomes on a tracker.
///
/// The default observer does nothing; the hook exists so metrics can attach
/// without touching user code paths.
pub trait ClaimObserver<P>: Send + Sync {
    /// A position was claimed.
    fn on_claimed(&self, position: &P) {
        let _ = position;
    }
    /// A claim was refused.
    fn on_claim_failed(&self, position: &P) {
        let _ = position;
    }
}

/// The observer that observes nothing.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopObserver;

impl<P> ClaimObserver<P> for NoopObserver {}

/// A shareable tracker handle that reports claim outcomes to an observer.
///
/// All methods forward to the wrapped tracker under its lock; the lock is
/// what lets a split request race a claim without either seeing a torn
/// tracker.
pub struct ObservedTracker<T: RestrictionTracker> {
    inner: Arc<Mutex<T>>,
    observer: Arc<dyn ClaimObserver<T::Position>>,
}

impl<T: RestrictionTracker> Clone for ObservedTracker<T> {
    fn clone(&self) -> Self {
        ObservedTracker {
            inner: Arc::clone(&self.inner),
            observer: Arc::clone(&self.observer),
        }
    }
}

impl<T: RestrictionTracker> ObservedTracker<T> {
    /// Wraps a tracker with a claim observer.
    pub fn new(tracker: T, observer: Arc<dyn ClaimObserver<T::Position>>) -> Self {
        ObservedTracker {
            inner: Arc::new(Mutex::new(tracker)),
            observer,
        }
    }

    /// Wraps a tracker with the no-op observer.
    pub fn unobserved(tracker: T) -> Self {
        ObservedTracker::new(tracker, Arc::new(NoopObserver))
    }

    /// Attempts to claim `position`, reporting the outcome to the observer.
    pub fn try_claim(&self, position: T::Position) -> bool
    where
        T::Position: Clone,
    {
        let claimed = {
            let mut inner = self.inner.lock().expect("tracker lock poisoned");
            inner.try_claim(position.clone())
        };
        if claimed {
            self.observer.on_claimed(&position);
        } else {
            self.observer.on_claim_failed(&position);
        }
        claimed
    }

    /// The restriction as currently bounded.
    pub fn current_restriction(&self) -> T::Restriction {
        self.inner.lock().expect("tracker lock poisoned").current_restriction()
    }

    /// Splits off a fraction of the remaining work.
    pub fn try_split(&self, fraction_of_remainder: f64) -> Option<(T::Restriction, T::Restriction)> {
        self.inner.lock().expect("tracker lock poisoned").try_split(fraction_of_remainder)
    }

    /// Verifies that the restriction has been fully worked through.
    pub fn check_done(&self) -> UserResult<()> {
        self.inner.lock().expect("tracker lock poisoned").check_done()
    }

    /// The tracker's progress reading, if it supports one.
    pub fn progress(&self) -> Option<Progress> {
        self.inner.lock().expect("tracker lock poisoned").progress()
    }
}

/// A half-open offset range `[from, to)`.
///
/// The stock restriction for sources with a linear address space.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct OffsetRange {
    /// Inclusive lower bound.
    pub from: i64,
    /// Exclusive upper bound.
    pub to: i64,
}

impl OffsetRange {
    /// Creates the range `[from, to)`.
    pub fn new(from: i64, to: i64) -> Self {
        OffsetRange { from, to }
    }

    /// The number of offsets in the range.
    pub fn size(&self) -> i64 {
        (self.to - self.from).max(0)
    }
}

/// A tracker over an [`OffsetRange`], claiming offsets in increasing order.
///
/// # Examples
///
/// ```
/// use spool::tracker::{OffsetRange, OffsetRangeTracker, RestrictionTracker};
///
/// let mut tracker = OffsetRangeTracker::new(OffsetRange::new(0, 4));
/// assert!(tracker.try_claim(0));
/// let (primary, residual) = tracker.try_split(0.0).unwrap();
/// assert_eq!((primary.to, residual.from, residual.to), (1, 1, 4));
/// assert!(tracker.check_done().is_ok());
/// ```
#[derive(Clone, Debug)]
pub struct OffsetRangeTracker {
    range: OffsetRange,
    last_attempted: Option<i64>,
}

impl OffsetRangeTracker {
    /// Creates a tracker over `range` with nothing claimed.
    pub fn new(range: OffsetRange) -> Self {
        OffsetRangeTracker {
            range,
            last_attempted: None,
        }
    }

    /// One past the last attempted offset, or the range start.
    fn frontier(&self) -> i64 {
        self.last_attempted.map_or(self.range.from, |offset| offset + 1)
    }
}

impl RestrictionTracker for OffsetRangeTracker {
    type Restriction = OffsetRange;
    type Position = i64;

    fn try_claim(&mut self, position: i64) -> bool {
        // Claims must be strictly increasing and start at or after `from`.
        if position < self.frontier() {
            return false;
        }
        self.last_attempted = Some(position);
        position < self.range.to
    }

    fn current_restriction(&self) -> OffsetRange {
        self.range
    }

    fn try_split(&mut self, fraction_of_remainder: f64) -> Option<(OffsetRange, OffsetRange)> {
        let frontier = self.frontier();
        let remaining = self.range.to - frontier;
        if remaining <= 0 {
            return None;
        }
        let step = ((remaining as f64) * fraction_of_remainder) as i64;
        let split = (frontier + step).clamp(frontier, self.range.to);
        if split >= self.range.to {
            return None;
        }
        let residual = OffsetRange::new(split, self.range.to);
        self.range.to = split;
        Some((self.range, residual))
    }

    fn check_done(&self) -> UserResult<()> {
        if self.range.size() == 0 || self.frontier() >= self.range.to {
            Ok(())
        } else {
            Err(format!(
                "offsets [{}, {}) were never attempted in range {:?}",
                self.frontier(),
                self.range.to,
                self.range
            )
            .into())
        }
    }

    fn progress(&self) -> Option<Progress> {
        let done = (self.frontier() - self.range.from).max(0);
        let left = (self.range.to - self.frontier()).max(0);
        Some(Progress {
            completed: done as f64,
            remaining: left as f64,
        })
    }
}
