//! Timer family sinks and the timer surface presented to user code.

use std::collections::HashMap;
use std::time::Duration;

use itertools::Itertools;
use smallvec::smallvec;

use crate::channels::Push;
use crate::element::TimerFiring;
use crate::errors::Error;
use crate::time::{duration_millis, Instant, TimeDomain};
use crate::window::{PaneInfo, Window};

/// A declared timer family.
#[derive(Copy, Clone, Debug)]
pub struct TimerFamilySpec {
    /// The clock the family fires against.
    pub domain: TimeDomain,
}

/// The timer service client: registers one scheduling endpoint per declared
/// timer family at bundle start.
pub trait TimerService<K> {
    /// Registers the endpoint for `family` and returns the sink accepting
    /// scheduled firings.
    fn register(&mut self, family: &str, spec: &TimerFamilySpec) -> Box<dyn Push<TimerFiring<K>>>;
}

/// The timer service for transforms that declare no timer families; any
/// registered sink silently discards firings.
#[derive(Copy, Clone, Debug, Default)]
pub struct DiscardingTimers;

impl<K> TimerService<K> for DiscardingTimers {
    fn register(&mut self, _family: &str, _spec: &TimerFamilySpec) -> Box<dyn Push<TimerFiring<K>>> {
        Box::new(crate::channels::Discard)
    }
}

/// The per-bundle registry of timer sinks.
///
/// Populated once at bundle start and immutable afterwards; sinks are
/// flushed before the user finish callback and closed after it.
pub struct TimerHandlers<K> {
    sinks: HashMap<String, (TimerFamilySpec, Box<dyn Push<TimerFiring<K>>>)>,
}

impl<K> Default for TimerHandlers<K> {
    fn default() -> Self {
        TimerHandlers { sinks: HashMap::new() }
    }
}

impl<K> TimerHandlers<K> {
    /// Registers a sink for every declared family, in the order given.
    pub fn register_all<'a>(
        &mut self,
        service: &mut dyn TimerService<K>,
        families: impl IntoIterator<Item = (&'a String, &'a TimerFamilySpec)>,
    ) {
        for (family, spec) in families {
            let sink = service.register(family, spec);
            self.sinks.insert(family.clone(), (*spec, sink));
        }
    }

    /// The declared domain of `family`, if it exists.
    pub fn domain(&self, family: &str) -> Option<TimeDomain> {
        self.sinks.get(family).map(|(spec, _)| spec.domain)
    }

    /// Sends a firing into `family`'s sink.
    pub fn schedule(&mut self, family: &str, firing: TimerFiring<K>) -> Result<(), Error> {
        match self.sinks.get_mut(family) {
            Some((_, sink)) => {
                sink.send(firing);
                Ok(())
            }
            None => Err(Error::Usage(format!("unknown timer family {:?}", family))),
        }
    }

    /// Flushes every sink, in family-name order.
    pub fn flush_all(&mut self) {
        for family in self.sinks.keys().cloned().sorted() {
            if let Some((_, sink)) = self.sinks.get_mut(&family) {
                sink.done();
            }
        }
    }

    /// Flushes and drops every sink, closing the timer streams.
    pub fn close_all(&mut self) {
        self.flush_all();
        self.sinks.clear();
    }
}

/// The `Timer` surface presented to user code.
///
/// A builder accumulates `{offset, period, output timestamp}` and commits on
/// [`set`](TimerBuilder::set) or [`set_relative`](TimerBuilder::set_relative),
/// at which point the scheduled and output timestamps are derived, checked
/// against the window's garbage-collection bound, and written into the
/// family's sink.
pub struct TimerBuilder<'a, K> {
    family: String,
    domain: TimeDomain,
    user_key: K,
    dynamic_tag: String,
    window: Window,
    hold: Instant,
    fire_source: Instant,
    pane: PaneInfo,
    allowed_lateness: Duration,
    offset: Duration,
    period: Duration,
    output_timestamp: Option<Instant>,
    handlers: &'a mut TimerHandlers<K>,
}

impl<'a, K: Clone> TimerBuilder<'a, K> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        family: String,
        domain: TimeDomain,
        user_key: K,
        window: Window,
        hold: Instant,
        fire_source: Instant,
        pane: PaneInfo,
        allowed_lateness: Duration,
        handlers: &'a mut TimerHandlers<K>,
    ) -> Self {
        TimerBuilder {
            family,
            domain,
            user_key,
            dynamic_tag: String::new(),
            window,
            hold,
            fire_source,
            pane,
            allowed_lateness,
            offset: Duration::ZERO,
            period: Duration::ZERO,
            output_timestamp: None,
            handlers,
        }
    }

    /// Offsets the relative firing target.
    pub fn offset(mut self, offset: Duration) -> Self {
        self.offset = offset;
        self
    }

    /// Aligns the relative firing target to multiples of `period`.
    pub fn align(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Fixes the output-watermark hold of the firing.
    pub fn with_output_timestamp(mut self, timestamp: Instant) -> Self {
        self.output_timestamp = Some(timestamp);
        self
    }

    fn gc_time(&self) -> Instant {
        self.window.gc_time(self.allowed_lateness)
    }

    /// Schedules the timer at the absolute instant `at`.
    ///
    /// Absolute scheduling is only meaningful against the watermark, so this
    /// is restricted to event-time families; `at` must not lie past the
    /// window's garbage-collection bound.
    pub fn set(self, at: Instant) -> Result<(), Error> {
        if self.domain != TimeDomain::EventTime {
            return Err(Error::Usage(format!(
                "absolute timers require the event-time domain, but family {:?} is {:?}; \
                 use set_relative",
                self.family, self.domain
            )));
        }
        if at > self.gc_time() {
            return Err(Error::Usage(format!(
                "timer for family {:?} at {} is after the expiration {} of window {:?}",
                self.family,
                at,
                self.gc_time(),
                self.window
            )));
        }
        self.commit(at)
    }

    /// Schedules the timer relative to its firing source, honoring the
    /// accumulated offset and alignment period.
    pub fn set_relative(self) -> Result<(), Error> {
        let offset_target = self.fire_source.millis() + duration_millis(self.offset);
        let period = duration_millis(self.period);
        let target = if period == 0 {
            Instant::from_millis(offset_target)
        } else {
            let excess = offset_target.rem_euclid(period);
            if excess == 0 {
                self.fire_source
            } else {
                Instant::from_millis(self.fire_source.millis() + period - excess)
            }
        };
        let target = match self.domain {
            TimeDomain::EventTime => target.min(self.gc_time()),
            _ => target,
        };
        self.commit(target)
    }

    /// Derives the output timestamp, checks the commit invariants, and
    /// writes the firing into the family's sink.
    fn commit(self, scheduled: Instant) -> Result<(), Error> {
        let gc = self.gc_time();
        let output = match self.output_timestamp {
            Some(output) => {
                if output < self.hold {
                    return Err(Error::Usage(format!(
                        "output timestamp {} is before the hold {} of the input element or \
                         firing timer",
                        output, self.hold
                    )));
                }
                output
            }
            None => match self.domain {
                TimeDomain::EventTime => scheduled,
                _ => self.hold,
            },
        };

        match self.domain {
            TimeDomain::EventTime => {
                if output > scheduled {
                    return Err(Error::Usage(format!(
                        "output timestamp {} is after the firing timestamp {}",
                        output, scheduled
                    )));
                }
                if scheduled > gc {
                    return Err(Error::Usage(format!(
                        "firing timestamp {} is after the expiration {} of window {:?}",
                        scheduled, gc, self.window
                    )));
                }
            }
            TimeDomain::ProcessingTime | TimeDomain::SynchronizedProcessingTime => {
                if output > gc {
                    return Err(Error::Usage(format!(
                        "output timestamp {} is after the expiration {} of window {:?}",
                        output, gc, self.window
                    )));
                }
            }
        }

        let firing = TimerFiring {
            user_key: self.user_key.clone(),
            dynamic_tag: self.dynamic_tag.clone(),
            windows: smallvec![self.window],
            fire_timestamp: scheduled,
            hold_timestamp: output,
            pane: self.pane,
        };
        self.handlers.schedule(&self.family, firing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::Collector;

    struct FixedSinks {
        sink: Collector<TimerFiring<u64>>,
    }

    impl TimerService<u64> for FixedSinks {
        fn register(
            &mut self,
            _family: &str,
            _spec: &TimerFamilySpec,
        ) -> Box<dyn Push<TimerFiring<u64>>> {
            Box::new(self.sink.clone())
        }
    }

    fn handlers(domain: TimeDomain) -> (TimerHandlers<u64>, Collector<TimerFiring<u64>>) {
        let sink = Collector::new();
        let mut service = FixedSinks { sink: sink.clone() };
        let mut handlers = TimerHandlers::default();
        let families = [("gc".to_owned(), TimerFamilySpec { domain })];
        handlers.register_all(&mut service, families.iter().map(|(f, s)| (f, s)));
        (handlers, sink)
    }

    fn builder_in_window(
        handlers: &mut TimerHandlers<u64>,
        domain: TimeDomain,
        fire_source: i64,
        end: i64,
    ) -> TimerBuilder<'_, u64> {
        TimerBuilder::new(
            "gc".to_owned(),
            domain,
            7,
            Window::interval(Instant::from_millis(0), Instant::from_millis(end)),
            Instant::from_millis(10),
            Instant::from_millis(fire_source),
            PaneInfo::NO_FIRING,
            Duration::ZERO,
            handlers,
        )
    }

    fn builder(
        handlers: &mut TimerHandlers<u64>,
        domain: TimeDomain,
        fire_source: i64,
    ) -> TimerBuilder<'_, u64> {
        builder_in_window(handlers, domain, fire_source, 100)
    }

    #[test]
    fn relative_timer_defaults_output_to_the_firing_time() {
        let (mut handlers, sink) = handlers(TimeDomain::EventTime);
        builder(&mut handlers, TimeDomain::EventTime, 30).set_relative().unwrap();
        let fired = sink.take();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].fire_timestamp, Instant::from_millis(30));
        assert_eq!(fired[0].hold_timestamp, Instant::from_millis(30));
        assert_eq!(fired[0].user_key, 7);
    }

    #[test]
    fn explicit_output_timestamp_is_bounded_by_hold_and_firing() {
        let (mut handlers, sink) = handlers(TimeDomain::EventTime);
        builder(&mut handlers, TimeDomain::EventTime, 30)
            .with_output_timestamp(Instant::from_millis(20))
            .set_relative()
            .unwrap();
        assert_eq!(sink.take()[0].hold_timestamp, Instant::from_millis(20));

        // Below the hold of the input element.
        let err = builder(&mut handlers, TimeDomain::EventTime, 30)
            .with_output_timestamp(Instant::from_millis(5))
            .set_relative()
            .unwrap_err();
        assert!(matches!(err, Error::Usage(_)));

        // Past the firing timestamp.
        let err = builder(&mut handlers, TimeDomain::EventTime, 30)
            .with_output_timestamp(Instant::from_millis(50))
            .set_relative()
            .unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }

    #[test]
    fn relative_targets_clamp_to_the_gc_time() {
        // Window [0, 100), no lateness: expiration is 99ms.
        let (mut handlers, sink) = handlers(TimeDomain::EventTime);
        builder(&mut handlers, TimeDomain::EventTime, 30)
            .offset(Duration::from_millis(200))
            .set_relative()
            .unwrap();
        assert_eq!(sink.take()[0].fire_timestamp, Instant::from_millis(99));
    }

    #[test]
    fn absolute_timers_check_the_gc_time() {
        let (mut handlers, sink) = handlers(TimeDomain::EventTime);
        builder(&mut handlers, TimeDomain::EventTime, 30)
            .set(Instant::from_millis(99))
            .unwrap();
        assert_eq!(sink.take()[0].fire_timestamp, Instant::from_millis(99));

        let err = builder(&mut handlers, TimeDomain::EventTime, 30)
            .set(Instant::from_millis(230))
            .unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }

    #[test]
    fn absolute_timers_require_event_time() {
        let (mut handlers, _sink) = handlers(TimeDomain::ProcessingTime);
        let err = builder(&mut handlers, TimeDomain::ProcessingTime, 30)
            .set(Instant::from_millis(50))
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("event-time"), "diagnostic names the rule: {message}");
        assert!(message.contains("set_relative"), "diagnostic offers the fix: {message}");
    }

    #[test]
    fn aligned_targets_round_up_to_the_period() {
        let (mut handlers, sink) = handlers(TimeDomain::EventTime);
        builder_in_window(&mut handlers, TimeDomain::EventTime, 70, 1000)
            .align(Duration::from_millis(100))
            .set_relative()
            .unwrap();
        assert_eq!(sink.take()[0].fire_timestamp, Instant::from_millis(100));

        // Already on the boundary: the firing source is kept unchanged.
        builder_in_window(&mut handlers, TimeDomain::EventTime, 100, 1000)
            .align(Duration::from_millis(100))
            .set_relative()
            .unwrap();
        assert_eq!(sink.take()[0].fire_timestamp, Instant::from_millis(100));
    }

    #[test]
    fn processing_time_output_defaults_to_the_hold() {
        let (mut handlers, sink) = handlers(TimeDomain::ProcessingTime);
        builder(&mut handlers, TimeDomain::ProcessingTime, 30)
            .set_relative()
            .unwrap();
        let fired = sink.take();
        assert_eq!(fired[0].fire_timestamp, Instant::from_millis(30));
        assert_eq!(fired[0].hold_timestamp, Instant::from_millis(10));
    }
}
