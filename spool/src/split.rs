//! Mid-bundle progress reporting and the concurrent self-split protocol.
//!
//! While the process thread is inside a user callback, a control thread may
//! ask for the element's progress or for a split of its unprocessed
//! remainder. Everything those requests may touch lives in one snapshot
//! behind one mutex: the runner publishes the snapshot before invoking the
//! callback and clears it on every exit path, and the coordinator only ever
//! reads it under the lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use smallvec::smallvec;

use crate::codec::{Codec, SerdeCodec, WindowedCodec};
use crate::config::{urns, UrnMode};
use crate::element::{Payload, Restricted, Weighted, WindowedValue};
use crate::errors::Error;
use crate::time::{Instant, Timestamp};
use crate::tracker::{ObservedTracker, Progress};
use crate::transform::Transform;
use crate::watermark::SharedEstimator;
use crate::window::{PaneInfo, Window};

/// The main-input payload type of a transform.
pub type PayloadOf<F> = Payload<
    <F as Transform>::In,
    <F as Transform>::Restriction,
    <F as Transform>::WatermarkState,
>;

/// An encoded element handed back to the orchestrator.
#[derive(Clone, Debug, PartialEq)]
pub struct BundleApplication {
    /// The transform the element re-enters at.
    pub transform_id: String,
    /// The input the element re-enters on.
    pub input_id: String,
    /// The element in the full windowed main-input encoding.
    pub element: Vec<u8>,
}

/// A residual element, scheduled for later re-delivery.
#[derive(Clone, Debug, PartialEq)]
pub struct DelayedBundleApplication {
    /// The residual element.
    pub application: BundleApplication,
    /// How long the orchestrator should wait before re-delivery.
    pub requested_time_delay: Duration,
    /// The output-watermark hold per output id, from the frozen estimator.
    pub output_watermarks: HashMap<String, Timestamp>,
}

/// A progress metric record for the worker's reporting callback.
#[derive(Clone, Debug, PartialEq)]
pub struct MonitoringInfo {
    /// The metric's URN.
    pub urn: String,
    /// The metric payload, a one-element double iterable.
    pub payload: Vec<u8>,
}

/// The split-critical snapshot of the element currently being processed.
pub(crate) struct InFlight<F: Transform> {
    pub(crate) element: F::In,
    pub(crate) timestamp: Instant,
    pub(crate) window: Window,
    pub(crate) pane: PaneInfo,
    pub(crate) restriction: F::Restriction,
    pub(crate) input_state: F::WatermarkState,
    pub(crate) tracker: ObservedTracker<F::Tracker>,
    pub(crate) estimator: SharedEstimator<F::Estimator>,
}

/// The snapshot slot shared between the runner and the coordinator.
pub(crate) type SharedInFlight<F> = Arc<Mutex<Option<InFlight<F>>>>;

/// Serves progress and split requests from a thread other than the one
/// driving user callbacks.
pub struct SplitCoordinator<F: Transform> {
    user: Arc<F>,
    mode: UrnMode,
    transform_id: String,
    main_input: String,
    outputs: Vec<String>,
    in_flight: SharedInFlight<F>,
}

impl<F: Transform> Clone for SplitCoordinator<F> {
    fn clone(&self) -> Self {
        SplitCoordinator {
            user: Arc::clone(&self.user),
            mode: self.mode,
            transform_id: self.transform_id.clone(),
            main_input: self.main_input.clone(),
            outputs: self.outputs.clone(),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<F: Transform> SplitCoordinator<F> {
    pub(crate) fn new(
        user: Arc<F>,
        mode: UrnMode,
        transform_id: String,
        main_input: String,
        outputs: Vec<String>,
        in_flight: SharedInFlight<F>,
    ) -> Self {
        SplitCoordinator { user, mode, transform_id, main_input, outputs, in_flight }
    }

    /// The current element's progress, if one is in flight and its tracker
    /// supports a reading.
    pub fn progress(&self) -> Option<Progress> {
        let guard = self.in_flight.lock().expect("split lock poisoned");
        guard.as_ref().and_then(|in_flight| in_flight.tracker.progress())
    }

    /// The current progress as monitoring records, empty when no reading is
    /// available.
    pub fn monitoring(&self) -> Vec<MonitoringInfo> {
        match self.progress() {
            Some(progress) => vec![
                MonitoringInfo {
                    urn: urns::WORK_COMPLETED.to_owned(),
                    payload: crate::codec::encode_double_iterable(&[progress.completed]),
                },
                MonitoringInfo {
                    urn: urns::WORK_REMAINING.to_owned(),
                    payload: crate::codec::encode_double_iterable(&[progress.remaining]),
                },
            ],
            None => Vec::new(),
        }
    }

    /// Attempts to split the current element's unprocessed remainder.
    ///
    /// Returns `Ok(None)` when no element is in flight or the tracker
    /// declines: the caller must treat that as "nothing available right
    /// now", not as failure. On success the primary keeps the watermark
    /// state the element arrived with, and the residual carries the
    /// estimator state frozen *before* the tracker split, so the residual's
    /// watermark hold can never run ahead of what user code observed.
    pub fn try_split(
        &self,
        fraction_of_remainder: f64,
        resume_delay: Option<Duration>,
    ) -> Result<Option<(BundleApplication, DelayedBundleApplication)>, Error> {
        let (primary_value, residual_value, watermark) = {
            let guard = self.in_flight.lock().expect("split lock poisoned");
            let Some(in_flight) = guard.as_ref() else {
                return Ok(None);
            };

            // The freeze must precede the tracker split.
            let (watermark, frozen_state) = in_flight.estimator.watermark_and_state();
            let Some((primary, residual)) = in_flight.tracker.try_split(fraction_of_remainder)
            else {
                return Ok(None);
            };

            let primary = Restricted {
                element: in_flight.element.clone(),
                restriction: primary,
                state: in_flight.input_state.clone(),
            };
            let residual = Restricted {
                element: in_flight.element.clone(),
                restriction: residual,
                state: frozen_state,
            };

            let (primary, residual) = match self.mode {
                UrnMode::ProcessElements { sized: true } => {
                    let primary_size = self
                        .user
                        .restriction_size(&primary.element, &primary.restriction)
                        .map_err(|err| Error::user(&self.transform_id, err))?;
                    let residual_size = self
                        .user
                        .restriction_size(&residual.element, &residual.restriction)
                        .map_err(|err| Error::user(&self.transform_id, err))?;
                    (
                        Payload::SizedRestricted(Weighted { value: primary, size: primary_size }),
                        Payload::SizedRestricted(Weighted { value: residual, size: residual_size }),
                    )
                }
                _ => (Payload::Restricted(primary), Payload::Restricted(residual)),
            };

            let envelope = |payload: PayloadOf<F>| WindowedValue {
                value: payload,
                timestamp: in_flight.timestamp,
                windows: smallvec![in_flight.window],
                pane: in_flight.pane,
            };
            (envelope(primary), envelope(residual), watermark)
        };

        // Encoding happens outside the lock.
        let codec = WindowedCodec::new(SerdeCodec::<PayloadOf<F>>::new());
        let mut primary_bytes = Vec::new();
        codec.encode(&primary_value, &mut primary_bytes)?;
        let mut residual_bytes = Vec::new();
        codec.encode(&residual_value, &mut residual_bytes)?;

        let output_watermarks = if watermark != Instant::MIN {
            self.outputs
                .iter()
                .map(|output| (output.clone(), Timestamp::from(watermark)))
                .collect()
        } else {
            HashMap::new()
        };

        Ok(Some((
            BundleApplication {
                transform_id: self.transform_id.clone(),
                input_id: self.main_input.clone(),
                element: primary_bytes,
            },
            DelayedBundleApplication {
                application: BundleApplication {
                    transform_id: self.transform_id.clone(),
                    input_id: self.main_input.clone(),
                    element: residual_bytes,
                },
                requested_time_delay: resume_delay.unwrap_or(Duration::ZERO),
                output_watermarks,
            },
        )))
    }
}
