//! Immutable value envelopes moving through the runner.

use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};

use crate::time::Instant;
use crate::window::{PaneInfo, Window};

/// The window set carried on an envelope. Almost always a single window.
pub type WindowSet = SmallVec<[Window; 2]>;

/// A value together with the event-time context it was produced in.
///
/// # Examples
///
/// ```
/// use spool::element::WindowedValue;
/// use spool::time::Instant;
///
/// let value = WindowedValue::in_global_window(5u64, Instant::from_millis(10));
/// assert_eq!(value.windows.len(), 1);
/// assert_eq!(value.explode().count(), 1);
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct WindowedValue<T> {
    /// The payload.
    pub value: T,
    /// The event-time timestamp of the payload.
    pub timestamp: Instant,
    /// The windows the payload belongs to.
    pub windows: WindowSet,
    /// The trigger firing that produced the payload.
    pub pane: PaneInfo,
}

impl<T> WindowedValue<T> {
    /// Creates an envelope carrying `value` in the given windows.
    pub fn new(value: T, timestamp: Instant, windows: WindowSet, pane: PaneInfo) -> Self {
        WindowedValue { value, timestamp, windows, pane }
    }

    /// Creates an envelope in the global window with the no-firing pane.
    pub fn in_global_window(value: T, timestamp: Instant) -> Self {
        WindowedValue {
            value,
            timestamp,
            windows: smallvec![Window::Global],
            pane: PaneInfo::NO_FIRING,
        }
    }

    /// Creates an envelope in a single window with the no-firing pane.
    pub fn in_window(value: T, timestamp: Instant, window: Window) -> Self {
        WindowedValue {
            value,
            timestamp,
            windows: smallvec![window],
            pane: PaneInfo::NO_FIRING,
        }
    }

    /// Replaces the payload, keeping the envelope.
    pub fn with_value<U>(&self, value: U) -> WindowedValue<U> {
        WindowedValue {
            value,
            timestamp: self.timestamp,
            windows: self.windows.clone(),
            pane: self.pane,
        }
    }
}

impl<T: Clone> WindowedValue<T> {
    /// Fans the envelope out into one single-window envelope per window, in
    /// declaration order.
    pub fn explode(&self) -> impl Iterator<Item = WindowedValue<T>> + '_ {
        self.windows.iter().map(move |window| WindowedValue {
            value: self.value.clone(),
            timestamp: self.timestamp,
            windows: smallvec![*window],
            pane: self.pane,
        })
    }
}

/// A key-value pair. Keys are what user state and timers are scoped by.
#[derive(Serialize, Deserialize, Clone, Debug, Default, Hash, Eq, PartialEq)]
pub struct Kv<K, V> {
    /// The key.
    pub key: K,
    /// The value.
    pub value: V,
}

impl<K, V> Kv<K, V> {
    /// Creates a pair.
    pub fn new(key: K, value: V) -> Self {
        Kv { key, value }
    }
}

/// An element paired with a restriction and the watermark estimator state
/// under which the restriction is to be processed.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct Restricted<T, R, S> {
    /// The element.
    pub element: T,
    /// The remaining work description.
    pub restriction: R,
    /// The watermark estimator state.
    pub state: S,
}

/// A value annotated with its size in the orchestrator's work accounting.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Weighted<T> {
    /// The value.
    pub value: T,
    /// The size, as reported by the transform.
    pub size: f64,
}

/// The main-input payload shapes, selected by the transform's URN mode.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum Payload<T, R, S> {
    /// A bare element.
    Element(T),
    /// An element paired with a restriction and estimator state.
    Restricted(Restricted<T, R, S>),
    /// A restricted element annotated with its size.
    SizedRestricted(Weighted<Restricted<T, R, S>>),
}

/// A timer firing delivered to, or scheduled by, the runner.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TimerFiring<K> {
    /// The user key the timer is scoped to.
    pub user_key: K,
    /// The dynamic tag within the timer family. Empty for plain timers.
    pub dynamic_tag: String,
    /// The windows the timer fires in.
    pub windows: WindowSet,
    /// When the timer fires.
    pub fire_timestamp: Instant,
    /// The lower bound this timer imposes on the output watermark.
    pub hold_timestamp: Instant,
    /// The pane of the element that set the timer.
    pub pane: PaneInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explode_preserves_envelope_per_window() {
        let windows: WindowSet = smallvec![
            Window::interval(Instant::from_millis(0), Instant::from_millis(10)),
            Window::interval(Instant::from_millis(10), Instant::from_millis(20)),
        ];
        let value = WindowedValue::new(7u32, Instant::from_millis(3), windows.clone(), PaneInfo::NO_FIRING);
        let exploded: Vec<_> = value.explode().collect();
        assert_eq!(exploded.len(), 2);
        for (single, window) in exploded.iter().zip(&windows) {
            assert_eq!(single.value, 7);
            assert_eq!(single.timestamp, Instant::from_millis(3));
            assert_eq!(&single.windows[..], &[*window]);
        }
    }
}
