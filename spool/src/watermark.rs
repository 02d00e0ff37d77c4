//! Watermark estimators and the thread-safe wrapper around them.

use std::sync::{Arc, Mutex};

use crate::time::Instant;

/// Tracks the lower bound of event times a splittable element may still
/// produce.
///
/// `observe` is optional: estimators that do not learn from output
/// timestamps simply ignore it. `state` must return whatever is needed to
/// reconstruct the estimator when a residual resumes.
pub trait WatermarkEstimator {
    /// The resumable state of the estimator.
    type State;

    /// Observes the timestamp of an emitted value.
    fn observe(&mut self, timestamp: Instant) {
        let _ = timestamp;
    }

    /// The current output watermark.
    fn current_watermark(&self) -> Instant;

    /// The state from which the estimator can be reconstructed.
    fn state(&self) -> Self::State;
}

/// A watermark estimator shared between the process and split threads.
///
/// Every user-supplied estimator is wrapped at the boundary: both threads
/// call into it concurrently, and the watermark and state must be read as
/// one unit when a split freezes them.
pub struct SharedEstimator<E> {
    inner: Arc<Mutex<E>>,
}

impl<E> Clone for SharedEstimator<E> {
    fn clone(&self) -> Self {
        SharedEstimator { inner: Arc::clone(&self.inner) }
    }
}

impl<E: WatermarkEstimator> SharedEstimator<E> {
    /// Wraps an estimator for shared access.
    pub fn new(estimator: E) -> Self {
        SharedEstimator { inner: Arc::new(Mutex::new(estimator)) }
    }

    /// Observes the timestamp of an emitted value.
    pub fn observe(&self, timestamp: Instant) {
        self.inner.lock().expect("estimator lock poisoned").observe(timestamp);
    }

    /// The current output watermark.
    pub fn current_watermark(&self) -> Instant {
        self.inner.lock().expect("estimator lock poisoned").current_watermark()
    }

    /// Reads the watermark and the state as one atomic unit.
    pub fn watermark_and_state(&self) -> (Instant, E::State) {
        let inner = self.inner.lock().expect("estimator lock poisoned");
        (inner.current_watermark(), inner.state())
    }

    /// Runs `action` against the concrete estimator under the lock.
    ///
    /// This is how user code reaches estimator-specific operations, such as
    /// advancing a manual estimator.
    pub fn with_inner<R>(&self, action: impl FnOnce(&mut E) -> R) -> R {
        action(&mut self.inner.lock().expect("estimator lock poisoned"))
    }
}

/// An estimator advanced explicitly by user code.
#[derive(Clone, Debug)]
pub struct ManualEstimator {
    watermark: Instant,
}

impl ManualEstimator {
    /// Creates an estimator resuming from `state`.
    pub fn new(state: Instant) -> Self {
        ManualEstimator { watermark: state }
    }

    /// Advances the watermark. Retreating is ignored.
    pub fn set_watermark(&mut self, watermark: Instant) {
        self.watermark = self.watermark.max(watermark);
    }
}

impl WatermarkEstimator for ManualEstimator {
    type State = Instant;

    fn current_watermark(&self) -> Instant {
        self.watermark
    }

    fn state(&self) -> Instant {
        self.watermark
    }
}

/// An estimator whose watermark is the greatest observed output timestamp.
#[derive(Clone, Debug)]
pub struct MonotonicEstimator {
    watermark: Instant,
}

impl MonotonicEstimator {
    /// Creates an estimator resuming from `state`.
    pub fn new(state: Instant) -> Self {
        MonotonicEstimator { watermark: state }
    }
}

impl WatermarkEstimator for MonotonicEstimator {
    type State = Instant;

    fn observe(&mut self, timestamp: Instant) {
        self.watermark = self.watermark.max(timestamp);
    }

    fn current_watermark(&self) -> Instant {
        self.watermark
    }

    fn state(&self) -> Instant {
        self.watermark
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use super::*;

    #[test]
    fn monotonic_estimator_tracks_the_maximum() {
        let mut estimator = MonotonicEstimator::new(Instant::MIN);
        estimator.observe(Instant::from_millis(5));
        estimator.observe(Instant::from_millis(3));
        assert_eq!(estimator.current_watermark(), Instant::from_millis(5));
        assert_eq!(estimator.state(), Instant::from_millis(5));
    }

    #[test]
    fn watermark_and_state_read_as_one_unit() {
        // Hammer the estimator from two threads; every snapshot must be
        // internally consistent (watermark equals state for this estimator).
        let shared = SharedEstimator::new(MonotonicEstimator::new(Instant::MIN));
        let barrier = Arc::new(Barrier::new(2));

        let writer = {
            let shared = shared.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for millis in 0..1000 {
                    shared.observe(Instant::from_millis(millis));
                }
            })
        };

        barrier.wait();
        for _ in 0..1000 {
            let (watermark, state) = shared.watermark_and_state();
            assert_eq!(watermark, state);
        }
        writer.join().unwrap();
    }
}
