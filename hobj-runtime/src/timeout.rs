//! Timeouts and Deadlines
//!
//! Every blocking call in this crate takes a [`Timeout`], which encodes three
//! behaviours: wait forever, do not wait at all, or wait for a bounded span.
//!
//! # Design
//!
//! The numeric encoding used at the C boundary is a signed number of seconds:
//! - `< 0`: wait forever
//! - `== 0`: check once, never block
//! - `> 0`: wait at most that long
//!
//! A timeout is converted into an absolute [`Deadline`] exactly once, on entry
//! to the blocking call. Spurious wakeups and re-checks inside the call all
//! measure against the same deadline, so a call never waits longer than asked
//! no matter how many times it is woken.
//!
//! # Example
//!
//! ```rust,ignore
//! use hobj_runtime::timeout::Timeout;
//! use std::time::Duration;
//!
//! let t = Timeout::from_secs_f64(-1.0);
//! assert_eq!(t, Timeout::Forever);
//!
//! let deadline = Timeout::After(Duration::from_millis(50)).deadline();
//! assert!(!deadline.is_expired());
//! ```

use std::fmt;
use std::time::{Duration, Instant};

/// How long a blocking operation may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Block until the operation can complete.
    #[default]
    Forever,
    /// Never block; fail at once if the operation cannot complete.
    Immediate,
    /// Block for at most this long.
    After(Duration),
}

impl Timeout {
    /// Decode the signed-seconds encoding.
    ///
    /// Negative values mean forever, zero means immediate. `NaN` is treated
    /// as immediate.
    pub fn from_secs_f64(secs: f64) -> Self {
        if secs.is_nan() || secs == 0.0 {
            Timeout::Immediate
        } else if secs < 0.0 {
            Timeout::Forever
        } else {
            Duration::try_from_secs_f64(secs)
                .map(Timeout::After)
                .unwrap_or(Timeout::Forever)
        }
    }

    /// Encode as signed seconds, the inverse of [`Timeout::from_secs_f64`].
    pub fn as_secs_f64(&self) -> f64 {
        match self {
            Timeout::Forever => -1.0,
            Timeout::Immediate => 0.0,
            Timeout::After(d) => d.as_secs_f64(),
        }
    }

    /// Whether this timeout forbids blocking.
    pub fn is_immediate(&self) -> bool {
        match self {
            Timeout::Immediate => true,
            Timeout::After(d) => d.is_zero(),
            Timeout::Forever => false,
        }
    }

    /// Fix the timeout to an absolute deadline measured from now.
    pub fn deadline(self) -> Deadline {
        let now = Instant::now();
        match self {
            Timeout::Forever => Deadline::never(),
            Timeout::Immediate => Deadline::at(now),
            // An unrepresentable instant is far enough away to be forever.
            Timeout::After(d) => now.checked_add(d).map_or_else(Deadline::never, Deadline::at),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        if duration.is_zero() {
            Timeout::Immediate
        } else {
            Timeout::After(duration)
        }
    }
}

impl From<f64> for Timeout {
    fn from(secs: f64) -> Self {
        Timeout::from_secs_f64(secs)
    }
}

impl From<Option<Duration>> for Timeout {
    fn from(duration: Option<Duration>) -> Self {
        duration.map_or(Timeout::Forever, Timeout::from)
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeout::Forever => write!(f, "forever"),
            Timeout::Immediate => write!(f, "immediate"),
            Timeout::After(d) => write!(f, "{:?}", d),
        }
    }
}

/// An absolute point in time by which a blocking call must finish.
///
/// Unlike [`Timeout`], which is relative, a `Deadline` does not move when it
/// is re-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    /// `None` means the deadline never expires.
    instant: Option<Instant>,
}

impl Deadline {
    /// A deadline that never expires.
    pub const fn never() -> Self {
        Self { instant: None }
    }

    /// A deadline at a specific instant.
    pub fn at(instant: Instant) -> Self {
        Self {
            instant: Some(instant),
        }
    }

    /// A deadline that expires after `duration` from now.
    pub fn after(duration: Duration) -> Self {
        Timeout::After(duration).deadline()
    }

    /// The underlying instant, if bounded.
    pub fn instant(&self) -> Option<Instant> {
        self.instant
    }

    /// Whether this deadline is unbounded.
    pub fn is_never(&self) -> bool {
        self.instant.is_none()
    }

    /// Check if the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.instant.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left until the deadline.
    ///
    /// Returns `Duration::ZERO` once expired and `Duration::MAX` when unbounded.
    pub fn remaining(&self) -> Duration {
        match self.instant {
            Some(at) => at.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }
}

impl From<Instant> for Deadline {
    fn from(instant: Instant) -> Self {
        Self::at(instant)
    }
}

impl From<Timeout> for Deadline {
    fn from(timeout: Timeout) -> Self {
        timeout.deadline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_signed_seconds_encoding() {
        assert_eq!(Timeout::from_secs_f64(-1.0), Timeout::Forever);
        assert_eq!(Timeout::from_secs_f64(-0.001), Timeout::Forever);
        assert_eq!(Timeout::from_secs_f64(0.0), Timeout::Immediate);
        assert_eq!(Timeout::from_secs_f64(f64::NAN), Timeout::Immediate);
        assert_eq!(
            Timeout::from_secs_f64(1.5),
            Timeout::After(Duration::from_millis(1500))
        );
    }

    #[test]
    fn test_encoding_inverse() {
        for t in [
            Timeout::Forever,
            Timeout::Immediate,
            Timeout::After(Duration::from_millis(250)),
        ] {
            assert_eq!(Timeout::from_secs_f64(t.as_secs_f64()), t);
        }
    }

    #[test]
    fn test_from_duration() {
        assert_eq!(Timeout::from(Duration::ZERO), Timeout::Immediate);
        assert_eq!(
            Timeout::from(Duration::from_secs(2)),
            Timeout::After(Duration::from_secs(2))
        );
        assert_eq!(Timeout::from(None), Timeout::Forever);
    }

    #[test]
    fn test_forever_deadline_never_expires() {
        let d = Timeout::Forever.deadline();
        assert!(d.is_never());
        assert!(!d.is_expired());
        assert_eq!(d.remaining(), Duration::MAX);
    }

    #[test]
    fn test_immediate_deadline_is_expired() {
        let d = Timeout::Immediate.deadline();
        assert!(d.is_expired());
        assert_eq!(d.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_bounded_deadline_expires() {
        let d = Timeout::After(Duration::from_millis(10)).deadline();
        assert!(!d.is_expired());
        thread::sleep(Duration::from_millis(30));
        assert!(d.is_expired());
        assert_eq!(d.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_huge_duration_is_forever() {
        let d = Timeout::After(Duration::MAX).deadline();
        assert!(d.is_never());
    }
}
