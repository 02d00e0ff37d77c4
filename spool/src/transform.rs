//! The user transform facade.
//!
//! A [`Transform`] is the runner's entire view of user code: a set of
//! callbacks plus the associated types they operate over. The six execution
//! modes all dispatch through this one surface; operations a transform does
//! not support fail with a usage error rather than existing on a separate
//! per-mode interface.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::{Error, UserError, UserResult};
use crate::runner::{FinishContext, OnTimerContext, ProcessContext, SplitRestrictionContext};
use crate::time::Instant;
use crate::tracker::RestrictionTracker;
use crate::watermark::WatermarkEstimator;

/// A composite trait for types usable as values in the runner.
pub trait Data: Clone + Send + 'static {}
impl<T: Clone + Send + 'static> Data for T {}

/// A composite trait for values that additionally cross the wire, as split
/// artifacts and timer payloads do.
pub trait ExchangeData: Data + Serialize + DeserializeOwned {}
impl<T: Data + Serialize + DeserializeOwned> ExchangeData for T {}

/// Whether a splittable process callback is finished with its restriction or
/// wants to be resumed later.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProcessContinuation {
    resume: bool,
    delay: Duration,
}

impl ProcessContinuation {
    /// The restriction has been fully processed.
    pub fn stop() -> Self {
        ProcessContinuation { resume: false, delay: Duration::ZERO }
    }

    /// The callback wants the unprocessed remainder rescheduled.
    pub fn resume() -> Self {
        ProcessContinuation { resume: true, delay: Duration::ZERO }
    }

    /// Requests that resumption wait at least `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// True iff resumption was requested.
    pub fn should_resume(&self) -> bool {
        self.resume
    }

    /// The requested resumption delay.
    pub fn resume_delay(&self) -> Duration {
        self.delay
    }
}

fn unsupported(operation: &str) -> UserError {
    Box::new(Error::Usage(format!(
        "transform does not implement {}",
        operation
    )))
}

/// A user transform: callbacks plus the types they operate over.
///
/// Instances are shared between the process thread and, for sizing split
/// artifacts, the control thread; callbacks take `&self` and interior
/// mutability is the implementor's business. All callbacks may fail with any
/// boxed error, which the runner wraps with transform context exactly once.
///
/// Only [`process`](Transform::process) and the two factory methods needed by
/// the modes a pipeline actually uses must be provided; everything else
/// defaults to a no-op or to a usage error.
pub trait Transform: Send + Sync + 'static {
    /// Main-input element type.
    type In: ExchangeData;
    /// Output element type.
    type Out: Data;
    /// User key type scoping state and timers.
    type Key: ExchangeData;
    /// Restriction type describing remaining work per element.
    type Restriction: ExchangeData;
    /// Resumable watermark estimator state.
    type WatermarkState: ExchangeData;
    /// The tracker mediating claims against a restriction.
    type Tracker: RestrictionTracker<Restriction = Self::Restriction> + Send + 'static;
    /// The watermark estimator for splittable processing.
    type Estimator: WatermarkEstimator<State = Self::WatermarkState> + Send + 'static;

    /// Invoked once when a bundle starts, before any element is delivered.
    fn start_bundle(&self) -> UserResult<()> {
        Ok(())
    }

    /// Processes one element in one window.
    fn process(&self, ctx: &mut ProcessContext<'_, Self>) -> UserResult<ProcessContinuation>
    where
        Self: Sized;

    /// Handles a timer firing in one window.
    fn on_timer(
        &self,
        family: &str,
        tag: &str,
        ctx: &mut OnTimerContext<'_, Self>,
    ) -> UserResult<()>
    where
        Self: Sized,
    {
        let _ = (family, tag, ctx);
        Ok(())
    }

    /// Invoked once when a bundle finishes, after all deliveries.
    fn finish_bundle(&self, ctx: &mut FinishContext<'_, Self>) -> UserResult<()>
    where
        Self: Sized,
    {
        let _ = ctx;
        Ok(())
    }

    /// Invoked when the transform instance is discarded.
    fn teardown(&self) -> UserResult<()> {
        Ok(())
    }

    /// The key of an element, if the transform is keyed.
    fn element_key(&self, element: &Self::In) -> Option<Self::Key> {
        let _ = element;
        None
    }

    /// The restriction initially covering all of `element`'s work.
    fn initial_restriction(&self, element: &Self::In) -> UserResult<Self::Restriction> {
        let _ = element;
        Err(unsupported("initial_restriction"))
    }

    /// The estimator state to start processing `restriction` under.
    fn initial_watermark_state(
        &self,
        element: &Self::In,
        restriction: &Self::Restriction,
    ) -> UserResult<Self::WatermarkState> {
        let _ = (element, restriction);
        Err(unsupported("initial_watermark_state"))
    }

    /// Splits a restriction into sub-restrictions before processing begins.
    fn split_restriction(&self, ctx: &mut SplitRestrictionContext<'_, Self>) -> UserResult<()>
    where
        Self: Sized,
    {
        let _ = ctx;
        Err(unsupported("split_restriction"))
    }

    /// The size of `restriction` in the orchestrator's work accounting.
    fn restriction_size(
        &self,
        element: &Self::In,
        restriction: &Self::Restriction,
    ) -> UserResult<f64> {
        let _ = (element, restriction);
        Err(unsupported("restriction_size"))
    }

    /// A fresh tracker over `restriction`.
    fn new_tracker(&self, restriction: Self::Restriction) -> UserResult<Self::Tracker> {
        let _ = restriction;
        Err(unsupported("new_tracker"))
    }

    /// A fresh watermark estimator resuming from `state`.
    fn new_watermark_estimator(&self, state: Self::WatermarkState) -> UserResult<Self::Estimator> {
        let _ = state;
        Err(unsupported("new_watermark_estimator"))
    }
}

/// The tracker type of transforms that are not splittable.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoTracker;

impl RestrictionTracker for NoTracker {
    type Restriction = ();
    type Position = ();

    fn try_claim(&mut self, _position: ()) -> bool {
        false
    }

    fn current_restriction(&self) {}

    fn try_split(&mut self, _fraction_of_remainder: f64) -> Option<((), ())> {
        None
    }

    fn check_done(&self) -> UserResult<()> {
        Ok(())
    }
}

/// The estimator type of transforms that are not splittable.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoEstimator;

impl WatermarkEstimator for NoEstimator {
    type State = ();

    fn current_watermark(&self) -> Instant {
        Instant::MIN
    }

    fn state(&self) {}
}
