//! Spool executes user transform callbacks over bundles of windowed
//! elements on behalf of a remote pipeline orchestrator.
//!
//! The code is organized in modules that are meant to depend as little as
//! possible on each other.
//!
//! **Value types**: the [`element`] module defines the envelopes moving
//! through the runner (windowed values, restricted elements, timer firings),
//! and [`time`]/[`window`] define the event-time axis they live on.
//!
//! **Dispatch**: the [`runner`] module drives the six URN execution modes
//! from one data-flow skeleton: a [`BundleRunner`](runner::BundleRunner)
//! accepts elements and timer firings, fans each out per window, and invokes
//! the [`Transform`](transform::Transform) callbacks with a mode-appropriate
//! context.
//!
//! **Self-split**: the [`split`] module owns the split-critical snapshot.
//! While the process thread is inside a user callback, a
//! [`SplitCoordinator`](split::SplitCoordinator) on another thread can read
//! progress or carve off the unprocessed remainder of the current element
//! and hand it back to the orchestrator.
//!
//! # Examples
//!
//! A transform that doubles its input, run over a one-element bundle:
//!
//! ```
//! use spool::channels::Collector;
//! use spool::config::{urns, TransformConfig, TransformDescriptor};
//! use spool::element::WindowedValue;
//! use spool::errors::UserResult;
//! use spool::runner::{BundleRunner, Downstream, ProcessContext};
//! use spool::state::NoState;
//! use spool::time::Instant;
//! use spool::timers::DiscardingTimers;
//! use spool::transform::{NoEstimator, NoTracker, ProcessContinuation, Transform};
//!
//! struct Double;
//!
//! impl Transform for Double {
//!     type In = u64;
//!     type Out = u64;
//!     type Key = ();
//!     type Restriction = ();
//!     type WatermarkState = ();
//!     type Tracker = NoTracker;
//!     type Estimator = NoEstimator;
//!
//!     fn process(&self, ctx: &mut ProcessContext<'_, Self>) -> UserResult<ProcessContinuation> {
//!         let doubled = ctx.element() * 2;
//!         ctx.output(doubled)?;
//!         Ok(ProcessContinuation::stop())
//!     }
//! }
//!
//! let config = TransformConfig::from_descriptor(TransformDescriptor {
//!     transform_id: "double".into(),
//!     urn: urns::PAR_DO.into(),
//!     main_input: "in".into(),
//!     outputs: vec!["out".into()],
//!     side_inputs: Vec::new(),
//!     timer_families: Vec::new(),
//!     windowing: Default::default(),
//! }).unwrap();
//!
//! let downstream = Downstream::<Double>::new(&config);
//! let outputs = Collector::new();
//! downstream.add_consumer("out", outputs.clone()).unwrap();
//!
//! let mut runner = BundleRunner::new(
//!     config,
//!     Double,
//!     downstream,
//!     Box::new(NoState),
//!     Box::new(DiscardingTimers),
//!     Box::new(|_, _| {}),
//!     None,
//! );
//! runner.start().unwrap();
//! runner.accept(WindowedValue::in_global_window(
//!     spool::element::Payload::Element(21),
//!     Instant::from_millis(10),
//! )).unwrap();
//! runner.finish().unwrap();
//!
//! assert_eq!(outputs.take()[0].value, 42);
//! ```

#![forbid(missing_docs)]

pub mod channels;
pub mod codec;
pub mod config;
pub mod element;
pub mod errors;
pub mod logging;
pub mod runner;
pub mod split;
pub mod state;
pub mod time;
pub mod timers;
pub mod tracker;
pub mod transform;
pub mod watermark;
pub mod window;

/// Re-export of the `spool_logging` crate.
pub mod logging_core {
    pub use spool_logging::*;
}

pub use config::{TransformConfig, UrnMode};
pub use element::{Kv, Payload, Restricted, TimerFiring, Weighted, WindowedValue};
pub use errors::{Error, UserResult};
pub use runner::{BundleRunner, Downstream};
pub use split::SplitCoordinator;
pub use time::{Instant, TimeDomain};
pub use transform::{Data, ExchangeData, ProcessContinuation, Transform};
pub use window::{PaneInfo, Window};
