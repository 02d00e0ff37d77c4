//! Points and domains on the event-time axis.

use std::fmt;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// A millisecond-precision point on the global event-time axis.
///
/// The representable range is symmetric around the epoch and bounded well
/// inside `i64` millis, so that conversions to finer units cannot overflow.
/// [`Instant::MIN`] doubles as the "no watermark yet" sentinel.
///
/// # Examples
///
/// ```
/// use spool::time::Instant;
///
/// let t = Instant::from_millis(10);
/// assert_eq!(t.millis(), 10);
/// assert!(Instant::MIN < t && t < Instant::MAX);
/// ```
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Instant(i64);

impl Instant {
    /// The least representable instant, used as the minimum sentinel.
    pub const MIN: Instant = Instant(-9_223_372_036_854_775);
    /// The greatest representable instant.
    pub const MAX: Instant = Instant(9_223_372_036_854_775);

    /// Creates an instant from milliseconds since the epoch, clamped to the
    /// representable range.
    pub fn from_millis(millis: i64) -> Self {
        Instant(millis.clamp(Self::MIN.0, Self::MAX.0))
    }

    /// Milliseconds since the epoch.
    pub fn millis(self) -> i64 {
        self.0
    }

    /// The current wall-clock time.
    ///
    /// Used only as the base of relative processing-time timers.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis().min(i64::MAX as u128) as i64)
            .unwrap_or(0);
        Instant::from_millis(millis)
    }

    /// Advances the instant by a duration, saturating at [`Instant::MAX`].
    pub fn saturating_add(self, duration: Duration) -> Self {
        Instant::from_millis(self.0.saturating_add(duration_millis(duration)))
    }

    /// Retreats the instant by a duration, saturating at [`Instant::MIN`].
    pub fn saturating_sub(self, duration: Duration) -> Self {
        Instant::from_millis(self.0.saturating_sub(duration_millis(duration)))
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A duration's length in milliseconds, saturating at `i64::MAX`.
pub fn duration_millis(duration: Duration) -> i64 {
    duration.as_millis().min(i64::MAX as u128) as i64
}

/// The wire form of an instant, as whole seconds plus nanoseconds.
///
/// The conversion truncates toward zero in both fields, matching the
/// orchestrator's expectations for residual watermark entries.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Timestamp {
    /// Whole seconds since the epoch.
    pub seconds: i64,
    /// Sub-second remainder in nanoseconds.
    pub nanos: i64,
}

impl From<Instant> for Timestamp {
    fn from(instant: Instant) -> Self {
        let millis = instant.millis();
        Timestamp {
            seconds: millis / 1000,
            nanos: (millis % 1000) * 1_000_000,
        }
    }
}

/// The clock a timer fires against.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum TimeDomain {
    /// Watermark-driven time.
    EventTime,
    /// Wall-clock time local to the worker.
    ProcessingTime,
    /// Wall-clock time synchronized across workers.
    SynchronizedProcessingTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instants_saturate_at_the_sentinels() {
        assert_eq!(Instant::MAX.saturating_add(Duration::from_millis(1)), Instant::MAX);
        assert_eq!(Instant::MIN.saturating_sub(Duration::from_millis(1)), Instant::MIN);
        assert_eq!(Instant::from_millis(i64::MAX), Instant::MAX);
    }

    #[test]
    fn wire_timestamps_split_millis() {
        let ts = Timestamp::from(Instant::from_millis(1_500));
        assert_eq!((ts.seconds, ts.nanos), (1, 500_000_000));
        let ts = Timestamp::from(Instant::from_millis(999));
        assert_eq!((ts.seconds, ts.nanos), (0, 999_000_000));
    }
}
