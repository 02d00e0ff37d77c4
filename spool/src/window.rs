//! Windows, panes, and the windowing strategy of the main input.

use std::cmp::Ordering;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::time::Instant;

/// How far the global window's maximum timestamp sits below [`Instant::MAX`].
///
/// Leaving headroom lets timers and garbage-collection bounds be computed
/// past the window end without saturating.
const GLOBAL_WINDOW_HEADROOM_MS: i64 = 24 * 60 * 60 * 1000;

/// A bounded region of event time to which elements belong.
///
/// Windows are totally ordered by their maximum timestamp, ties broken by
/// their start, so that window sets can be iterated deterministically.
///
/// # Examples
///
/// ```
/// use spool::time::Instant;
/// use spool::window::Window;
///
/// let w = Window::interval(Instant::from_millis(0), Instant::from_millis(100));
/// assert_eq!(w.max_timestamp(), Instant::from_millis(99));
/// assert!(w < Window::Global);
/// ```
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum Window {
    /// The single window spanning all of event time.
    Global,
    /// A half-open interval `[start, end)`.
    Interval {
        /// Inclusive lower bound.
        start: Instant,
        /// Exclusive upper bound.
        end: Instant,
    },
}

impl Window {
    /// Creates the interval window `[start, end)`.
    pub fn interval(start: Instant, end: Instant) -> Self {
        Window::Interval { start, end }
    }

    /// The greatest timestamp an element in this window may carry.
    pub fn max_timestamp(&self) -> Instant {
        match *self {
            Window::Global => Instant::from_millis(Instant::MAX.millis() - GLOBAL_WINDOW_HEADROOM_MS),
            Window::Interval { end, .. } => Instant::from_millis(end.millis() - 1),
        }
    }

    /// The time past which nothing in this window may fire: the maximum
    /// timestamp advanced by the allowed lateness, saturating.
    pub fn gc_time(&self, allowed_lateness: Duration) -> Instant {
        self.max_timestamp().saturating_add(allowed_lateness)
    }

    fn start(&self) -> Instant {
        match *self {
            Window::Global => Instant::MIN,
            Window::Interval { start, .. } => start,
        }
    }
}

impl Ord for Window {
    fn cmp(&self, other: &Self) -> Ordering {
        self.max_timestamp()
            .cmp(&other.max_timestamp())
            .then_with(|| self.start().cmp(&other.start()))
    }
}

impl PartialOrd for Window {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The windowing strategy declared on the main input.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct WindowingStrategy {
    /// How long past the window end late data is still admitted.
    pub allowed_lateness: Duration,
}

/// The trigger firing that produced an element within its window.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct PaneInfo {
    /// Where the firing sits relative to the watermark.
    pub timing: PaneTiming,
    /// Zero-based firing index within the window.
    pub index: i64,
    /// Whether this is the first firing for the window.
    pub is_first: bool,
    /// Whether this is the last firing for the window.
    pub is_last: bool,
}

impl PaneInfo {
    /// The pane carried by elements not produced by any trigger firing.
    pub const NO_FIRING: PaneInfo = PaneInfo {
        timing: PaneTiming::Unknown,
        index: 0,
        is_first: true,
        is_last: true,
    };
}

impl Default for PaneInfo {
    fn default() -> Self {
        PaneInfo::NO_FIRING
    }
}

/// Pane timing relative to the watermark.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum PaneTiming {
    /// Fired before the watermark passed the window end.
    Early,
    /// Fired when the watermark passed the window end.
    OnTime,
    /// Fired after the watermark passed the window end.
    Late,
    /// Timing unknown, e.g. no firing occurred.
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gc_time_extends_by_lateness_and_saturates() {
        let w = Window::interval(Instant::from_millis(0), Instant::from_millis(100));
        assert_eq!(w.gc_time(Duration::ZERO), Instant::from_millis(99));
        assert_eq!(w.gc_time(Duration::from_millis(50)), Instant::from_millis(149));
        assert_eq!(Window::Global.gc_time(Duration::from_secs(1 << 40)), Instant::MAX);
    }

    #[test]
    fn windows_order_by_max_timestamp() {
        let early = Window::interval(Instant::from_millis(0), Instant::from_millis(10));
        let late = Window::interval(Instant::from_millis(5), Instant::from_millis(20));
        let mut windows = vec![Window::Global, late, early];
        windows.sort();
        assert_eq!(windows, vec![early, late, Window::Global]);
    }
}
