//! Splittable processing under concurrent progress and split requests.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use spool::channels::Collector;
use spool::codec::{decode_double_iterable, Codec, SerdeCodec, WindowedCodec};
use spool::config::{urns, TransformConfig, TransformDescriptor};
use spool::element::{Payload, Restricted, Weighted, WindowedValue};
use spool::errors::{Error, UserResult};
use spool::runner::{BundleRunner, Downstream, ProcessContext};
use spool::split::{BundleApplication, DelayedBundleApplication, MonitoringInfo};
use spool::state::NoState;
use spool::time::{Instant, Timestamp};
use spool::timers::DiscardingTimers;
use spool::tracker::{OffsetRange, OffsetRangeTracker};
use spool::transform::{ProcessContinuation, Transform};
use spool::watermark::ManualEstimator;
use spool::window::WindowingStrategy;

type RangedPayload = Payload<String, OffsetRange, Instant>;

/// Claims offsets in order, optionally parking at a rendezvous after the
/// first claim so another thread can interrogate the in-flight element.
struct Ranged {
    /// `(enter, leave)`: after the first claim, wait on `enter`, then on
    /// `leave` before claiming further.
    sync: Option<(Arc<Barrier>, Arc<Barrier>)>,
    /// Maximum claims per invocation.
    claim_limit: usize,
    /// Whether to ask for resumption instead of stopping.
    resume: bool,
    /// Watermark to publish after the first claim.
    watermark: Option<i64>,
    /// Fail after the first claim.
    fail: bool,
}

impl Ranged {
    fn plain(claim_limit: usize, resume: bool) -> Self {
        Ranged { sync: None, claim_limit, resume, watermark: None, fail: false }
    }
}

impl Transform for Ranged {
    type In = String;
    type Out = String;
    type Key = ();
    type Restriction = OffsetRange;
    type WatermarkState = Instant;
    type Tracker = OffsetRangeTracker;
    type Estimator = ManualEstimator;

    fn process(&self, ctx: &mut ProcessContext<'_, Self>) -> UserResult<ProcessContinuation> {
        let tracker = ctx.tracker()?.clone();
        let estimator = ctx.watermark_estimator()?.clone();
        let mut offset = ctx.restriction()?.from;
        let mut claims = 0;
        while claims < self.claim_limit && tracker.try_claim(offset) {
            claims += 1;
            let line = format!("{}:{}", ctx.element(), offset);
            ctx.output(line)?;
            if claims == 1 {
                if let Some(watermark) = self.watermark {
                    estimator.with_inner(|e| e.set_watermark(Instant::from_millis(watermark)));
                }
                if self.fail {
                    return Err("user code exploded".into());
                }
                if let Some((enter, leave)) = &self.sync {
                    enter.wait();
                    leave.wait();
                }
            }
            offset += 1;
        }
        if self.resume {
            Ok(ProcessContinuation::resume().with_delay(Duration::from_millis(100)))
        } else {
            Ok(ProcessContinuation::stop())
        }
    }

    fn restriction_size(&self, _element: &String, restriction: &OffsetRange) -> UserResult<f64> {
        Ok(restriction.size() as f64)
    }

    fn new_tracker(&self, restriction: OffsetRange) -> UserResult<OffsetRangeTracker> {
        Ok(OffsetRangeTracker::new(restriction))
    }

    fn new_watermark_estimator(&self, state: Instant) -> UserResult<ManualEstimator> {
        Ok(ManualEstimator::new(state))
    }
}

fn descriptor(urn: &str) -> TransformDescriptor {
    TransformDescriptor {
        transform_id: "sdf".into(),
        urn: urn.into(),
        main_input: "in".into(),
        outputs: vec!["out".into()],
        side_inputs: Vec::new(),
        timer_families: Vec::new(),
        windowing: WindowingStrategy::default(),
    }
}

type Listener = Rc<RefCell<Vec<(BundleApplication, DelayedBundleApplication)>>>;

fn runner_for(transform: Ranged, urn: &str) -> (BundleRunner<Ranged>, Collector<WindowedValue<String>>, Listener) {
    let config = TransformConfig::from_descriptor(descriptor(urn)).unwrap();
    let downstream = Downstream::<Ranged>::new(&config);
    let outputs = Collector::new();
    downstream.add_consumer("out", outputs.clone()).unwrap();

    let splits: Listener = Rc::new(RefCell::new(Vec::new()));
    let listener = Rc::clone(&splits);
    let runner = BundleRunner::new(
        config,
        transform,
        downstream,
        Box::new(NoState),
        Box::new(DiscardingTimers),
        Box::new(move |primary, residual| listener.borrow_mut().push((primary, residual))),
        None,
    );
    (runner, outputs, splits)
}

fn restricted(element: &str, from: i64, to: i64, state_millis: i64) -> WindowedValue<RangedPayload> {
    WindowedValue::in_global_window(
        Payload::Restricted(Restricted {
            element: element.to_owned(),
            restriction: OffsetRange::new(from, to),
            state: Instant::from_millis(state_millis),
        }),
        Instant::from_millis(10),
    )
}

fn decode_restricted(application: &BundleApplication) -> WindowedValue<RangedPayload> {
    let codec = WindowedCodec::new(SerdeCodec::<RangedPayload>::new());
    let mut bytes = &application.element[..];
    let decoded = codec.decode(&mut bytes).unwrap();
    assert!(bytes.is_empty());
    decoded
}

#[test]
fn external_split_freezes_the_watermark_before_the_tracker_split() {
    let enter = Arc::new(Barrier::new(2));
    let leave = Arc::new(Barrier::new(2));
    let transform = Ranged {
        sync: Some((Arc::clone(&enter), Arc::clone(&leave))),
        claim_limit: usize::MAX,
        resume: true,
        watermark: Some(5),
        fail: false,
    };
    let (mut runner, outputs, splits) = runner_for(transform, urns::PROCESS_ELEMENTS);
    let coordinator = runner.coordinator();

    let control = thread::spawn({
        let enter = Arc::clone(&enter);
        let leave = Arc::clone(&leave);
        move || {
            enter.wait();
            // The process thread is parked inside the user callback.
            let progress = coordinator.progress().expect("tracker supports progress");
            assert_eq!((progress.completed, progress.remaining), (1.0, 3.0));
            let split = coordinator.try_split(0.5, None).unwrap().expect("split succeeds");
            leave.wait();
            split
        }
    });

    runner.start().unwrap();
    runner.accept(restricted("k", 0, 4, 0)).unwrap();
    runner.finish().unwrap();

    let (primary, residual) = control.join().unwrap();

    // Primary keeps the input estimator state; the residual carries the
    // state frozen before the tracker split.
    let primary_value = decode_restricted(&primary);
    let Payload::Restricted(primary_inner) = primary_value.value else {
        panic!("expected a bare restricted payload");
    };
    assert_eq!(primary_inner.restriction, OffsetRange::new(0, 2));
    assert_eq!(primary_inner.state, Instant::from_millis(0));
    assert_eq!(primary_inner.element, "k");
    assert_eq!(primary.input_id, "in");
    assert_eq!(primary.transform_id, "sdf");

    let residual_value = decode_restricted(&residual.application);
    let Payload::Restricted(residual_inner) = residual_value.value else {
        panic!("expected a bare restricted payload");
    };
    assert_eq!(residual_inner.restriction, OffsetRange::new(2, 4));
    assert_eq!(residual_inner.state, Instant::from_millis(5));
    assert_eq!(
        residual.output_watermarks,
        [("out".to_owned(), Timestamp::from(Instant::from_millis(5)))]
            .into_iter()
            .collect()
    );

    // The user callback kept claiming inside the shrunken primary, and its
    // own post-continuation checkpoint found nothing left: no self-split
    // reached the listener.
    let emitted: Vec<String> = outputs.take().into_iter().map(|v| v.value).collect();
    assert_eq!(emitted, vec!["k:0".to_owned(), "k:1".to_owned()]);
    assert!(splits.borrow().is_empty());
}

#[test]
fn resume_continuation_checkpoints_through_the_listener() {
    let (mut runner, outputs, splits) = runner_for(
        Ranged::plain(1, true),
        urns::PROCESS_ELEMENTS,
    );
    runner.start().unwrap();
    runner.accept(restricted("k", 0, 4, 0)).unwrap();
    runner.finish().unwrap();

    let emitted: Vec<String> = outputs.take().into_iter().map(|v| v.value).collect();
    assert_eq!(emitted, vec!["k:0".to_owned()]);

    let splits = splits.borrow();
    assert_eq!(splits.len(), 1);
    let (primary, residual) = &splits[0];
    let Payload::Restricted(primary_inner) = decode_restricted(primary).value else {
        panic!("expected a bare restricted payload");
    };
    let Payload::Restricted(residual_inner) = decode_restricted(&residual.application).value else {
        panic!("expected a bare restricted payload");
    };
    assert_eq!(primary_inner.restriction, OffsetRange::new(0, 1));
    assert_eq!(residual_inner.restriction, OffsetRange::new(1, 4));
    assert_eq!(residual.requested_time_delay, Duration::from_millis(100));
}

#[test]
fn sized_splits_carry_sizes_on_both_halves() {
    let enter = Arc::new(Barrier::new(2));
    let leave = Arc::new(Barrier::new(2));
    let transform = Ranged {
        sync: Some((Arc::clone(&enter), Arc::clone(&leave))),
        claim_limit: usize::MAX,
        resume: false,
        watermark: None,
        fail: false,
    };
    let (mut runner, _outputs, _splits) =
        runner_for(transform, urns::PROCESS_SIZED_ELEMENTS_AND_RESTRICTIONS);
    let coordinator = runner.coordinator();

    let control = thread::spawn({
        let enter = Arc::clone(&enter);
        let leave = Arc::clone(&leave);
        move || {
            enter.wait();
            let split = coordinator.try_split(0.5, None).unwrap().expect("split succeeds");
            leave.wait();
            split
        }
    });

    runner.start().unwrap();
    runner
        .accept(WindowedValue::in_global_window(
            Payload::SizedRestricted(Weighted {
                value: Restricted {
                    element: "k".to_owned(),
                    restriction: OffsetRange::new(0, 4),
                    state: Instant::from_millis(0),
                },
                size: 4.0,
            }),
            Instant::from_millis(10),
        ))
        .unwrap();
    runner.finish().unwrap();

    let (primary, residual) = control.join().unwrap();
    let Payload::SizedRestricted(primary_inner) = decode_restricted(&primary).value else {
        panic!("expected a sized restricted payload");
    };
    let Payload::SizedRestricted(residual_inner) = decode_restricted(&residual.application).value
    else {
        panic!("expected a sized restricted payload");
    };
    assert_eq!(primary_inner.value.restriction, OffsetRange::new(0, 2));
    assert_eq!(primary_inner.size, 2.0);
    assert_eq!(residual_inner.value.restriction, OffsetRange::new(2, 4));
    assert_eq!(residual_inner.size, 2.0);
}

#[test]
fn splits_between_elements_return_nothing() {
    let (runner, _outputs, _splits) = runner_for(
        Ranged::plain(usize::MAX, false),
        urns::PROCESS_ELEMENTS,
    );
    let coordinator = runner.coordinator();
    assert!(coordinator.try_split(0.5, None).unwrap().is_none());
    assert!(coordinator.try_split(0.0, None).unwrap().is_none());
    assert!(coordinator.progress().is_none());
    assert!(coordinator.monitoring().is_empty());
}

#[test]
fn transient_slots_clear_after_a_user_error() {
    let transform = Ranged {
        sync: None,
        claim_limit: usize::MAX,
        resume: false,
        watermark: None,
        fail: true,
    };
    let (mut runner, _outputs, _splits) = runner_for(transform, urns::PROCESS_ELEMENTS);
    let coordinator = runner.coordinator();

    runner.start().unwrap();
    let err = runner.accept(restricted("k", 0, 4, 0)).unwrap_err();
    assert!(matches!(err, Error::UserCode { .. }));

    // The snapshot is gone: a late split request finds nothing.
    assert!(coordinator.try_split(0.5, None).unwrap().is_none());
    assert!(coordinator.progress().is_none());
}

#[test]
fn monitoring_encodes_progress_as_double_iterables() {
    let enter = Arc::new(Barrier::new(2));
    let leave = Arc::new(Barrier::new(2));
    let transform = Ranged {
        sync: Some((Arc::clone(&enter), Arc::clone(&leave))),
        claim_limit: usize::MAX,
        resume: false,
        watermark: None,
        fail: false,
    };
    let (mut runner, _outputs, _splits) = runner_for(transform, urns::PROCESS_ELEMENTS);
    let coordinator = runner.coordinator();

    let seen: Arc<Mutex<Vec<MonitoringInfo>>> = Arc::new(Mutex::new(Vec::new()));
    let control = thread::spawn({
        let enter = Arc::clone(&enter);
        let leave = Arc::clone(&leave);
        let seen = Arc::clone(&seen);
        move || {
            enter.wait();
            *seen.lock().unwrap() = coordinator.monitoring();
            leave.wait();
        }
    });

    runner.start().unwrap();
    runner.accept(restricted("k", 0, 4, 0)).unwrap();
    runner.finish().unwrap();
    control.join().unwrap();

    let records = seen.lock().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].urn, urns::WORK_COMPLETED);
    assert_eq!(records[1].urn, urns::WORK_REMAINING);
    let completed = decode_double_iterable(&mut &records[0].payload[..]).unwrap();
    let remaining = decode_double_iterable(&mut &records[1].payload[..]).unwrap();
    assert_eq!(completed, vec![1.0]);
    assert_eq!(remaining, vec![3.0]);
}
