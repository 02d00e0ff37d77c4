//! The bundle runner: per-URN dispatch and the bundle lifecycle.
//!
//! A [`BundleRunner`] is constructed per bundle from a validated transform
//! configuration, the user transform, and handles to the worker's seams
//! (downstream consumers, state backend, timer service, split listener). The
//! worker drives it with `start`, any number of `accept` and `on_timer`
//! deliveries, and `finish`; a [`SplitCoordinator`] obtained from the runner
//! serves progress and split requests from the control thread throughout.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use smallvec::smallvec;

use crate::channels::{Push, TagOutputs, Tee, TeeHelper};
use crate::codec::{decode_from_slice, encode_to_vec};
use crate::config::{TransformConfig, UrnMode};
use crate::element::{Payload, Restricted, TimerFiring, Weighted, WindowedValue};
use crate::errors::Error;
use crate::logging::{BundleEvent, BundleLogger};
use crate::split::{
    BundleApplication, DelayedBundleApplication, InFlight, PayloadOf, SharedInFlight,
    SplitCoordinator,
};
use crate::state::{BagHandle, CurrentKeyFn, SideInputSpec, StateAccessor, StateBackend};
use crate::time::{Instant, TimeDomain};
use crate::timers::{TimerBuilder, TimerHandlers, TimerService};
use crate::tracker::ObservedTracker;
use crate::transform::{ExchangeData, Transform};
use crate::watermark::SharedEstimator;
use crate::window::{PaneInfo, Window, WindowingStrategy};

/// The restricted main-input shape of a transform.
pub type RestrictedOf<F> = Restricted<
    <F as Transform>::In,
    <F as Transform>::Restriction,
    <F as Transform>::WatermarkState,
>;

/// The callback receiving self-checkpoint results.
pub type SplitListener = Box<dyn FnMut(BundleApplication, DelayedBundleApplication)>;

/// A bundle finalization callback, run once the bundle's outputs are
/// durably handed off.
pub type Finalizer = Box<dyn FnOnce()>;

/// The downstream consumer registries of one transform.
///
/// The worker registers one pusher per consumer; which of the three typed
/// registries the runner writes to is decided by the URN mode.
pub struct Downstream<F: Transform> {
    user: TagOutputs<WindowedValue<F::Out>>,
    restrictions: Tee<WindowedValue<RestrictedOf<F>>>,
    restrictions_helper: TeeHelper<WindowedValue<RestrictedOf<F>>>,
    sized: Tee<WindowedValue<Weighted<RestrictedOf<F>>>>,
    sized_helper: TeeHelper<WindowedValue<Weighted<RestrictedOf<F>>>>,
}

impl<F: Transform> Downstream<F> {
    /// Allocates the registries for a transform's declared outputs.
    pub fn new(config: &TransformConfig) -> Self {
        let (restrictions, restrictions_helper) = Tee::new();
        let (sized, sized_helper) = Tee::new();
        Downstream {
            user: TagOutputs::new(&config.outputs),
            restrictions,
            restrictions_helper,
            sized,
            sized_helper,
        }
    }

    /// Registers a consumer of the user output `tag`.
    pub fn add_consumer<P>(&self, tag: &str, pusher: P) -> Result<(), Error>
    where
        P: Push<WindowedValue<F::Out>> + 'static,
    {
        match self.user.helper(tag) {
            Some(helper) => {
                helper.add_pusher(pusher);
                Ok(())
            }
            None => Err(Error::Config(format!("unknown output tag {:?}", tag))),
        }
    }

    /// Registers a consumer of paired or split restrictions.
    pub fn add_restriction_consumer<P>(&self, pusher: P)
    where
        P: Push<WindowedValue<RestrictedOf<F>>> + 'static,
    {
        self.restrictions_helper.add_pusher(pusher);
    }

    /// Registers a consumer of sized split restrictions.
    pub fn add_sized_consumer<P>(&self, pusher: P)
    where
        P: Push<WindowedValue<Weighted<RestrictedOf<F>>>> + 'static,
    {
        self.sized_helper.add_pusher(pusher);
    }
}

/// The key and window the state accessor sees while a callback is active.
#[derive(Default)]
struct Scope {
    key: Option<Vec<u8>>,
    window: Option<Window>,
}

/// Clears the scope on every exit path of a per-element block.
struct ScopeClear {
    scope: Rc<RefCell<Scope>>,
}

impl Drop for ScopeClear {
    fn drop(&mut self) {
        *self.scope.borrow_mut() = Scope::default();
    }
}

/// Clears the split-critical snapshot on every exit path.
struct InFlightClear<F: Transform> {
    slot: SharedInFlight<F>,
}

impl<F: Transform> Drop for InFlightClear<F> {
    fn drop(&mut self) {
        self.slot.lock().expect("split lock poisoned").take();
    }
}

/// Executes one transform over one bundle.
pub struct BundleRunner<F: Transform> {
    user: Arc<F>,
    config: TransformConfig,
    downstream: Downstream<F>,
    state: Option<StateAccessor>,
    state_backend: Option<Box<dyn StateBackend>>,
    timer_service: Box<dyn TimerService<F::Key>>,
    timer_handlers: TimerHandlers<F::Key>,
    in_flight: SharedInFlight<F>,
    scope: Rc<RefCell<Scope>>,
    coordinator: SplitCoordinator<F>,
    split_listener: SplitListener,
    finalizers: Vec<Finalizer>,
    logger: Option<BundleLogger>,
}

impl<F: Transform> BundleRunner<F> {
    /// Creates a runner from a validated configuration and the worker's
    /// seams.
    pub fn new(
        config: TransformConfig,
        user: F,
        downstream: Downstream<F>,
        state_backend: Box<dyn StateBackend>,
        timer_service: Box<dyn TimerService<F::Key>>,
        split_listener: SplitListener,
        logger: Option<BundleLogger>,
    ) -> Self {
        let user = Arc::new(user);
        let in_flight: SharedInFlight<F> = Arc::new(Mutex::new(None));
        let coordinator = SplitCoordinator::new(
            Arc::clone(&user),
            config.mode,
            config.transform_id.clone(),
            config.main_input.clone(),
            config.outputs.clone(),
            Arc::clone(&in_flight),
        );
        BundleRunner {
            user,
            config,
            downstream,
            state: None,
            state_backend: Some(state_backend),
            timer_service,
            timer_handlers: TimerHandlers::default(),
            in_flight,
            scope: Rc::new(RefCell::new(Scope::default())),
            coordinator,
            split_listener,
            finalizers: Vec::new(),
            logger,
        }
    }

    /// A coordinator handle for the control thread.
    pub fn coordinator(&self) -> SplitCoordinator<F> {
        self.coordinator.clone()
    }

    fn log(&self, event: BundleEvent) {
        if let Some(logger) = &self.logger {
            logger.log(event);
        }
    }

    fn wrap(&self, err: crate::errors::UserError) -> Error {
        Error::user(&self.config.transform_id, err)
    }

    /// Starts the bundle: builds the state accessor, registers one sink per
    /// declared timer family, and runs the user start callback.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.state.is_some() {
            return Err(Error::Config("bundle already started".to_owned()));
        }
        let backend = self
            .state_backend
            .take()
            .ok_or_else(|| Error::Config("a finished bundle cannot be restarted".to_owned()))?;

        let scope = Rc::clone(&self.scope);
        let current: CurrentKeyFn = Rc::new(move || {
            let scope = scope.borrow();
            match (&scope.key, &scope.window) {
                (Some(key), Some(window)) => Some((key.clone(), *window)),
                _ => None,
            }
        });
        self.state = Some(StateAccessor::new(&self.config.transform_id, backend, current));

        self.timer_handlers
            .register_all(self.timer_service.as_mut(), self.config.timer_families.iter());

        self.log(BundleEvent::Start { transform: self.config.transform_id.clone() });
        self.user.start_bundle().map_err(|err| self.wrap(err))
    }

    /// Delivers one main-input element, fanning it out per window in
    /// declaration order and dispatching by URN mode.
    ///
    /// Whether this returns normally or with an error, every per-element
    /// transient slot is clear afterwards.
    pub fn accept(&mut self, element: WindowedValue<PayloadOf<F>>) -> Result<(), Error> {
        if self.state.is_none() {
            return Err(Error::Config(
                "element delivered before the bundle started".to_owned(),
            ));
        }
        self.log(BundleEvent::Element {
            transform: self.config.transform_id.clone(),
            windows: element.windows.len(),
        });
        for single in element.explode() {
            self.dispatch(single)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, value: WindowedValue<PayloadOf<F>>) -> Result<(), Error> {
        let WindowedValue { value: payload, timestamp, windows, pane } = value;
        let window = windows[0];
        match (self.config.mode, payload) {
            (UrnMode::ParDo, Payload::Element(element)) => {
                self.run_plain(element, timestamp, window, pane)
            }
            (UrnMode::PairWithRestriction, Payload::Element(element)) => {
                self.run_pair(element, timestamp, window, pane)
            }
            (UrnMode::SplitRestriction { sized }, Payload::Restricted(input)) => {
                self.run_split(input, sized, timestamp, window, pane)
            }
            (UrnMode::ProcessElements { sized: false }, Payload::Restricted(input)) => {
                self.run_restricted(input, timestamp, window, pane)
            }
            (UrnMode::ProcessElements { sized: true }, Payload::SizedRestricted(weighted)) => {
                self.run_restricted(weighted.value, timestamp, window, pane)
            }
            (mode, _) => Err(Error::Config(format!(
                "element shape does not match urn {}",
                mode.urn()
            ))),
        }
    }

    fn publish_scope(&mut self, key: Option<Vec<u8>>, window: Window) -> ScopeClear {
        *self.scope.borrow_mut() = Scope { key, window: Some(window) };
        ScopeClear { scope: Rc::clone(&self.scope) }
    }

    fn run_plain(
        &mut self,
        element: F::In,
        timestamp: Instant,
        window: Window,
        pane: PaneInfo,
    ) -> Result<(), Error> {
        let user = Arc::clone(&self.user);
        let user_key = user.element_key(&element);
        let key_bytes = match &user_key {
            Some(key) => Some(encode_to_vec(key)?),
            None => None,
        };
        let _scope = self.publish_scope(key_bytes, window);

        let mut ctx = ProcessContext {
            element: &element,
            timestamp,
            window: &window,
            pane: &pane,
            user_key,
            restriction: None,
            watermark_state: None,
            tracker: None,
            estimator: None,
            outputs: &mut self.downstream.user,
            main_output: self.config.main_output(),
            state: self.state.as_mut().expect("bundle started"),
            side_inputs: &self.config.side_inputs,
            timers: &mut self.timer_handlers,
            windowing: &self.config.windowing,
            finalizers: &mut self.finalizers,
        };
        let continuation = user
            .process(&mut ctx)
            .map_err(|err| Error::user(&self.config.transform_id, err))?;
        if continuation.should_resume() {
            return Err(Error::Usage(
                "process requested resumption but the transform is not splittable".to_owned(),
            ));
        }
        Ok(())
    }

    fn run_pair(
        &mut self,
        element: F::In,
        timestamp: Instant,
        window: Window,
        pane: PaneInfo,
    ) -> Result<(), Error> {
        let user = Arc::clone(&self.user);
        let restriction = user
            .initial_restriction(&element)
            .map_err(|err| self.wrap(err))?;
        let state = user
            .initial_watermark_state(&element, &restriction)
            .map_err(|err| self.wrap(err))?;
        self.downstream.restrictions.send(WindowedValue {
            value: Restricted { element, restriction, state },
            timestamp,
            windows: smallvec![window],
            pane,
        });
        Ok(())
    }

    fn run_split(
        &mut self,
        input: RestrictedOf<F>,
        sized: bool,
        timestamp: Instant,
        window: Window,
        pane: PaneInfo,
    ) -> Result<(), Error> {
        let user = Arc::clone(&self.user);
        let transform_id = self.config.transform_id.clone();
        let Restricted { element, restriction, state } = input;
        let user_key = user.element_key(&element);
        let key_bytes = match &user_key {
            Some(key) => Some(encode_to_vec(key)?),
            None => None,
        };
        let _scope = self.publish_scope(key_bytes, window);

        let restrictions = &mut self.downstream.restrictions;
        let sized_restrictions = &mut self.downstream.sized;
        let mut emit = |sub: F::Restriction| -> Result<(), Error> {
            let value = Restricted {
                element: element.clone(),
                restriction: sub,
                state: state.clone(),
            };
            if sized {
                let size = user
                    .restriction_size(&value.element, &value.restriction)
                    .map_err(|err| Error::user(&transform_id, err))?;
                sized_restrictions.send(WindowedValue {
                    value: Weighted { value, size },
                    timestamp,
                    windows: smallvec![window],
                    pane,
                });
            } else {
                restrictions.send(WindowedValue {
                    value,
                    timestamp,
                    windows: smallvec![window],
                    pane,
                });
            }
            Ok(())
        };

        let mut ctx = SplitRestrictionContext {
            element: &element,
            restriction: &restriction,
            watermark_state: &state,
            timestamp,
            window: &window,
            pane: &pane,
            emit: &mut emit,
        };
        user.split_restriction(&mut ctx)
            .map_err(|err| Error::user(&transform_id, err))
    }

    fn run_restricted(
        &mut self,
        input: RestrictedOf<F>,
        timestamp: Instant,
        window: Window,
        pane: PaneInfo,
    ) -> Result<(), Error> {
        let user = Arc::clone(&self.user);
        let transform_id = self.config.transform_id.clone();
        let Restricted { element, restriction, state } = input;

        let tracker = ObservedTracker::unobserved(
            user.new_tracker(restriction.clone())
                .map_err(|err| Error::user(&transform_id, err))?,
        );
        let estimator = SharedEstimator::new(
            user.new_watermark_estimator(state.clone())
                .map_err(|err| Error::user(&transform_id, err))?,
        );

        // Publish the split-critical snapshot. From here to the guard's drop
        // a control thread may observe and split it.
        {
            let mut slot = self.in_flight.lock().expect("split lock poisoned");
            *slot = Some(InFlight {
                element: element.clone(),
                timestamp,
                window,
                pane,
                restriction: restriction.clone(),
                input_state: state.clone(),
                tracker: tracker.clone(),
                estimator: estimator.clone(),
            });
        }
        let _in_flight = InFlightClear { slot: Arc::clone(&self.in_flight) };

        let user_key = user.element_key(&element);
        let key_bytes = match &user_key {
            Some(key) => Some(encode_to_vec(key)?),
            None => None,
        };
        let _scope = self.publish_scope(key_bytes, window);

        let continuation = {
            let mut ctx = ProcessContext {
                element: &element,
                timestamp,
                window: &window,
                pane: &pane,
                user_key,
                restriction: Some(&restriction),
                watermark_state: Some(&state),
                tracker: Some(tracker.clone()),
                estimator: Some(estimator.clone()),
                outputs: &mut self.downstream.user,
                main_output: self.config.main_output(),
                state: self.state.as_mut().expect("bundle started"),
                side_inputs: &self.config.side_inputs,
                timers: &mut self.timer_handlers,
                windowing: &self.config.windowing,
                finalizers: &mut self.finalizers,
            };
            // The split lock is not held here: the callback may run for a
            // long time, and the control thread must stay able to split.
            user.process(&mut ctx)
                .map_err(|err| Error::user(&transform_id, err))?
        };

        if continuation.should_resume() {
            match self
                .coordinator
                .try_split(0.0, Some(continuation.resume_delay()))?
            {
                Some((primary, residual)) => {
                    self.log(BundleEvent::Checkpoint { transform: transform_id });
                    (self.split_listener)(primary, residual);
                }
                // An external split already took the remainder.
                None => tracker.check_done().map_err(|err| Error::user(&transform_id, err))?,
            }
        } else {
            tracker.check_done().map_err(|err| Error::user(&transform_id, err))?;
        }
        Ok(())
    }

    /// Delivers a timer firing, invoking the user timer callback once per
    /// window with a scoped key.
    pub fn on_timer(&mut self, family: &str, firing: TimerFiring<F::Key>) -> Result<(), Error> {
        if self.state.is_none() {
            return Err(Error::Config(
                "timer delivered before the bundle started".to_owned(),
            ));
        }
        let fired_domain = self
            .timer_handlers
            .domain(family)
            .ok_or_else(|| Error::Usage(format!("unknown timer family {:?}", family)))?;
        self.log(BundleEvent::TimerFired {
            transform: self.config.transform_id.clone(),
            family: family.to_owned(),
        });

        let user = Arc::clone(&self.user);
        let transform_id = self.config.transform_id.clone();
        let key_bytes = encode_to_vec(&firing.user_key)?;
        for window in firing.windows.clone() {
            let _scope = self.publish_scope(Some(key_bytes.clone()), window);
            let mut ctx = OnTimerContext {
                firing: &firing,
                window: &window,
                fired_domain,
                outputs: &mut self.downstream.user,
                main_output: self.config.main_output(),
                state: self.state.as_mut().expect("bundle started"),
                side_inputs: &self.config.side_inputs,
                timers: &mut self.timer_handlers,
                windowing: &self.config.windowing,
                finalizers: &mut self.finalizers,
            };
            user.on_timer(family, &firing.dynamic_tag, &mut ctx)
                .map_err(|err| Error::user(&transform_id, err))?;
        }
        Ok(())
    }

    /// Finishes the bundle: flushes timer sinks, runs the user finish
    /// callback (which may still schedule timers), closes the sinks, and
    /// finalizes the state accessor.
    pub fn finish(&mut self) -> Result<(), Error> {
        let user = Arc::clone(&self.user);
        let transform_id = self.config.transform_id.clone();
        self.timer_handlers.flush_all();

        let mut ctx = FinishContext {
            outputs: &mut self.downstream.user,
            main_output: self.config.main_output(),
            finalizers: &mut self.finalizers,
        };
        user.finish_bundle(&mut ctx)
            .map_err(|err| Error::user(&transform_id, err))?;

        self.timer_handlers.close_all();
        let mut state = self
            .state
            .take()
            .ok_or_else(|| Error::Config("finish before the bundle started".to_owned()))?;
        state.finalize()?;
        self.log(BundleEvent::Finish { transform: transform_id });
        Ok(())
    }

    /// Runs the user teardown hook.
    pub fn teardown(&mut self) -> Result<(), Error> {
        self.user.teardown().map_err(|err| self.wrap(err))
    }

    /// Hands over the finalization callbacks registered during the bundle.
    pub fn take_finalizers(&mut self) -> Vec<Finalizer> {
        std::mem::take(&mut self.finalizers)
    }
}

/// What user code sees while processing one element in one window.
pub struct ProcessContext<'a, F: Transform> {
    element: &'a F::In,
    timestamp: Instant,
    window: &'a Window,
    pane: &'a PaneInfo,
    user_key: Option<F::Key>,
    restriction: Option<&'a F::Restriction>,
    watermark_state: Option<&'a F::WatermarkState>,
    tracker: Option<ObservedTracker<F::Tracker>>,
    estimator: Option<SharedEstimator<F::Estimator>>,
    outputs: &'a mut TagOutputs<WindowedValue<F::Out>>,
    main_output: &'a str,
    state: &'a mut StateAccessor,
    side_inputs: &'a HashMap<String, SideInputSpec>,
    timers: &'a mut TimerHandlers<F::Key>,
    windowing: &'a WindowingStrategy,
    finalizers: &'a mut Vec<Finalizer>,
}

impl<'a, F: Transform> ProcessContext<'a, F> {
    /// The element being processed.
    pub fn element(&self) -> &F::In {
        self.element
    }

    /// The element's timestamp.
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// The window currently being processed.
    pub fn window(&self) -> &Window {
        self.window
    }

    /// The element's pane.
    pub fn pane(&self) -> &PaneInfo {
        self.pane
    }

    /// The restriction under processing. Splittable modes only.
    pub fn restriction(&self) -> Result<&F::Restriction, Error> {
        self.restriction
            .ok_or_else(|| Error::Usage("no restriction in this context".to_owned()))
    }

    /// The watermark estimator state the element arrived with. Splittable
    /// modes only.
    pub fn watermark_state(&self) -> Result<&F::WatermarkState, Error> {
        self.watermark_state
            .ok_or_else(|| Error::Usage("no watermark state in this context".to_owned()))
    }

    /// The tracker mediating claims against the current restriction.
    /// Splittable process modes only.
    pub fn tracker(&self) -> Result<&ObservedTracker<F::Tracker>, Error> {
        self.tracker
            .as_ref()
            .ok_or_else(|| Error::Usage("no restriction tracker in this context".to_owned()))
    }

    /// The watermark estimator. Splittable process modes only.
    pub fn watermark_estimator(&self) -> Result<&SharedEstimator<F::Estimator>, Error> {
        self.estimator
            .as_ref()
            .ok_or_else(|| Error::Usage("no watermark estimator in this context".to_owned()))
    }

    /// Emits to the main output at the element's timestamp.
    pub fn output(&mut self, value: F::Out) -> Result<(), Error> {
        let tag = self.main_output;
        self.emit(tag, value, self.timestamp)
    }

    /// Emits to the main output at an explicit timestamp.
    pub fn output_with_timestamp(&mut self, value: F::Out, timestamp: Instant) -> Result<(), Error> {
        let tag = self.main_output;
        self.emit(tag, value, timestamp)
    }

    /// Emits to a tagged output at the element's timestamp.
    pub fn output_tagged(&mut self, tag: &str, value: F::Out) -> Result<(), Error> {
        self.emit(tag, value, self.timestamp)
    }

    fn emit(&mut self, tag: &str, value: F::Out, timestamp: Instant) -> Result<(), Error> {
        if let Some(estimator) = &self.estimator {
            estimator.observe(timestamp);
        }
        let envelope = WindowedValue {
            value,
            timestamp,
            windows: smallvec![*self.window],
            pane: *self.pane,
        };
        match self.outputs.tee(tag) {
            Some(tee) => {
                tee.send(envelope);
                Ok(())
            }
            None => Err(Error::Usage(format!("unknown output tag {:?}", tag))),
        }
    }

    /// Reads the multimap side input `tag` under an encoded key, in the
    /// view window mapped from the current window.
    pub fn side_input<V: ExchangeData>(&mut self, tag: &str, key: &[u8]) -> Result<Vec<V>, Error> {
        let spec = self
            .side_inputs
            .get(tag)
            .ok_or_else(|| Error::Usage(format!("unknown side input tag {:?}", tag)))?;
        let raw = self.state.side_input(spec, tag, key, self.window)?;
        raw.iter().map(|bytes| decode_from_slice(bytes)).collect()
    }

    /// Binds a bag-state handle at the current key and window.
    pub fn bag_state(&mut self, state_id: &str) -> Result<BagHandle<'_>, Error> {
        self.state.bag(state_id)
    }

    /// A timer builder for `family`, scoped to the current key and window.
    pub fn timer(&mut self, family: &str) -> Result<TimerBuilder<'_, F::Key>, Error> {
        let domain = self
            .timers
            .domain(family)
            .ok_or_else(|| Error::Usage(format!("unknown timer family {:?}", family)))?;
        let key = self
            .user_key
            .clone()
            .ok_or_else(|| Error::Usage("timers require a keyed element".to_owned()))?;
        let fire_source = match domain {
            TimeDomain::EventTime => self.timestamp,
            _ => Instant::now(),
        };
        Ok(TimerBuilder::new(
            family.to_owned(),
            domain,
            key,
            *self.window,
            self.timestamp,
            fire_source,
            *self.pane,
            self.windowing.allowed_lateness,
            self.timers,
        ))
    }

    /// Registers a callback to run once the bundle's outputs are durable.
    pub fn register_finalizer(&mut self, finalizer: impl FnOnce() + 'static) {
        self.finalizers.push(Box::new(finalizer));
    }
}

/// What user code sees while splitting a restriction before processing.
pub struct SplitRestrictionContext<'a, F: Transform> {
    element: &'a F::In,
    restriction: &'a F::Restriction,
    watermark_state: &'a F::WatermarkState,
    timestamp: Instant,
    window: &'a Window,
    pane: &'a PaneInfo,
    emit: &'a mut dyn FnMut(F::Restriction) -> Result<(), Error>,
}

impl<'a, F: Transform> SplitRestrictionContext<'a, F> {
    /// The element whose restriction is being split.
    pub fn element(&self) -> &F::In {
        self.element
    }

    /// The restriction to split.
    pub fn restriction(&self) -> &F::Restriction {
        self.restriction
    }

    /// The watermark estimator state the element arrived with.
    pub fn watermark_state(&self) -> &F::WatermarkState {
        self.watermark_state
    }

    /// The element's timestamp.
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// The window currently being processed.
    pub fn window(&self) -> &Window {
        self.window
    }

    /// The element's pane.
    pub fn pane(&self) -> &PaneInfo {
        self.pane
    }

    /// Emits one sub-restriction.
    pub fn output(&mut self, sub_restriction: F::Restriction) -> Result<(), Error> {
        (self.emit)(sub_restriction)
    }
}

/// What user code sees while handling a timer firing in one window.
pub struct OnTimerContext<'a, F: Transform> {
    firing: &'a TimerFiring<F::Key>,
    window: &'a Window,
    fired_domain: TimeDomain,
    outputs: &'a mut TagOutputs<WindowedValue<F::Out>>,
    main_output: &'a str,
    state: &'a mut StateAccessor,
    side_inputs: &'a HashMap<String, SideInputSpec>,
    timers: &'a mut TimerHandlers<F::Key>,
    windowing: &'a WindowingStrategy,
    finalizers: &'a mut Vec<Finalizer>,
}

impl<'a, F: Transform> OnTimerContext<'a, F> {
    /// The key the firing timer is scoped to.
    pub fn key(&self) -> &F::Key {
        &self.firing.user_key
    }

    /// When the timer fired.
    pub fn fire_timestamp(&self) -> Instant {
        self.firing.fire_timestamp
    }

    /// The firing's output-watermark hold.
    pub fn hold_timestamp(&self) -> Instant {
        self.firing.hold_timestamp
    }

    /// The window the timer is firing in.
    pub fn window(&self) -> &Window {
        self.window
    }

    /// The clock the fired family runs against.
    pub fn time_domain(&self) -> TimeDomain {
        self.fired_domain
    }

    /// Emits to the main output at the firing's hold timestamp.
    pub fn output(&mut self, value: F::Out) -> Result<(), Error> {
        let tag = self.main_output;
        let timestamp = self.firing.hold_timestamp;
        self.emit(tag, value, timestamp)
    }

    /// Emits to a tagged output at the firing's hold timestamp.
    pub fn output_tagged(&mut self, tag: &str, value: F::Out) -> Result<(), Error> {
        let timestamp = self.firing.hold_timestamp;
        self.emit(tag, value, timestamp)
    }

    fn emit(&mut self, tag: &str, value: F::Out, timestamp: Instant) -> Result<(), Error> {
        let envelope = WindowedValue {
            value,
            timestamp,
            windows: smallvec![*self.window],
            pane: self.firing.pane,
        };
        match self.outputs.tee(tag) {
            Some(tee) => {
                tee.send(envelope);
                Ok(())
            }
            None => Err(Error::Usage(format!("unknown output tag {:?}", tag))),
        }
    }

    /// Reads the multimap side input `tag` under an encoded key.
    pub fn side_input<V: ExchangeData>(&mut self, tag: &str, key: &[u8]) -> Result<Vec<V>, Error> {
        let spec = self
            .side_inputs
            .get(tag)
            .ok_or_else(|| Error::Usage(format!("unknown side input tag {:?}", tag)))?;
        let raw = self.state.side_input(spec, tag, key, self.window)?;
        raw.iter().map(|bytes| decode_from_slice(bytes)).collect()
    }

    /// Binds a bag-state handle at the timer's key and window.
    pub fn bag_state(&mut self, state_id: &str) -> Result<BagHandle<'_>, Error> {
        self.state.bag(state_id)
    }

    /// A timer builder for `family`, scoped to the firing's key and window.
    pub fn timer(&mut self, family: &str) -> Result<TimerBuilder<'_, F::Key>, Error> {
        let domain = self
            .timers
            .domain(family)
            .ok_or_else(|| Error::Usage(format!("unknown timer family {:?}", family)))?;
        let fire_source = match domain {
            TimeDomain::EventTime => self.firing.fire_timestamp,
            _ => Instant::now(),
        };
        Ok(TimerBuilder::new(
            family.to_owned(),
            domain,
            self.firing.user_key.clone(),
            *self.window,
            self.firing.hold_timestamp,
            fire_source,
            self.firing.pane,
            self.windowing.allowed_lateness,
            self.timers,
        ))
    }

    /// Registers a callback to run once the bundle's outputs are durable.
    pub fn register_finalizer(&mut self, finalizer: impl FnOnce() + 'static) {
        self.finalizers.push(Box::new(finalizer));
    }
}

/// What user code sees in the finish callback.
pub struct FinishContext<'a, F: Transform> {
    outputs: &'a mut TagOutputs<WindowedValue<F::Out>>,
    main_output: &'a str,
    finalizers: &'a mut Vec<Finalizer>,
}

impl<'a, F: Transform> FinishContext<'a, F> {
    /// Emits to the main output with an explicit timestamp, window, and
    /// pane; there is no current element to inherit them from.
    pub fn output_windowed(
        &mut self,
        value: F::Out,
        timestamp: Instant,
        window: Window,
        pane: PaneInfo,
    ) -> Result<(), Error> {
        let tag = self.main_output;
        Self::emit(self.outputs, tag, value, timestamp, window, pane)
    }

    /// Emits to a tagged output with an explicit timestamp, window, and
    /// pane.
    pub fn output_tagged_windowed(
        &mut self,
        tag: &str,
        value: F::Out,
        timestamp: Instant,
        window: Window,
        pane: PaneInfo,
    ) -> Result<(), Error> {
        Self::emit(self.outputs, tag, value, timestamp, window, pane)
    }

    fn emit(
        outputs: &mut TagOutputs<WindowedValue<F::Out>>,
        tag: &str,
        value: F::Out,
        timestamp: Instant,
        window: Window,
        pane: PaneInfo,
    ) -> Result<(), Error> {
        let envelope = WindowedValue { value, timestamp, windows: smallvec![window], pane };
        match outputs.tee(tag) {
            Some(tee) => {
                tee.send(envelope);
                Ok(())
            }
            None => Err(Error::Usage(format!("unknown output tag {:?}", tag))),
        }
    }

    /// Registers a callback to run once the bundle's outputs are durable.
    pub fn register_finalizer(&mut self, finalizer: impl FnOnce() + 'static) {
        self.finalizers.push(Box::new(finalizer));
    }
}
