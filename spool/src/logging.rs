//! Events describing the life of a bundle, logged through [`spool_logging`].

use serde::{Deserialize, Serialize};

/// The log stream name the runner's events are bound under.
pub const BUNDLE_STREAM: &str = "spool/bundle";

/// A logger for bundle events.
pub type BundleLogger = spool_logging::Logger<BundleEvent>;

/// Milestones in the life of a bundle.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub enum BundleEvent {
    /// A bundle started.
    Start {
        /// The transform the bundle executes.
        transform: String,
    },
    /// An element was delivered.
    Element {
        /// The transform the bundle executes.
        transform: String,
        /// The number of windows the element fans out into.
        windows: usize,
    },
    /// A timer firing was delivered.
    TimerFired {
        /// The transform the bundle executes.
        transform: String,
        /// The family the timer belongs to.
        family: String,
    },
    /// A self-checkpoint handed a residual back after a resume request.
    Checkpoint {
        /// The transform the bundle executes.
        transform: String,
    },
    /// The bundle finished.
    Finish {
        /// The transform the bundle executes.
        transform: String,
    },
}
