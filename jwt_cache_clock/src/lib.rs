//! Utilities for messing with time at millisecond resolution
//!
//! Types included allow messing with and mocking out clocks and other
//! side-effect-laden time operations. Token lifetimes are short enough that
//! whole seconds are too coarse, so everything here counts milliseconds.
//!
//! With the `tokio` feature enabled, [`TokioClock`] reports wall-clock time
//! that advances in lock-step with Tokio's timer, which keeps expiry checks
//! and sleeping timers consistent when Tokio's time is paused in tests.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_must_use
)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

use std::{
    ops,
    time::{Duration, SystemTime},
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Unix time in milliseconds
///
/// Unix time as represented by the number of milliseconds elapsed since the
/// beginning of the Unix epoch on 1970/01/01 at 00:00:00 UTC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[repr(transparent)]
pub struct UnixTimeMillis(pub u64);

impl UnixTimeMillis {
    /// Constructs a time from a whole number of seconds since the epoch
    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    /// The number of milliseconds from `self` until `later`, which is negative
    /// if `later` has already passed
    #[inline]
    pub fn signed_millis_until(self, later: UnixTimeMillis) -> i128 {
        i128::from(later.0) - i128::from(self.0)
    }
}

impl From<SystemTime> for UnixTimeMillis {
    #[inline]
    fn from(t: SystemTime) -> Self {
        let since_epoch = t.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
        UnixTimeMillis(u64::try_from(since_epoch.as_millis()).unwrap_or(u64::MAX))
    }
}

/// A span of time in milliseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[repr(transparent)]
pub struct DurationMillis(pub u64);

impl DurationMillis {
    /// A zero-length duration
    pub const ZERO: DurationMillis = DurationMillis(0);

    /// Constructs a duration from a whole number of seconds
    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    /// Whether this duration is zero
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl From<DurationMillis> for Duration {
    #[inline]
    fn from(d: DurationMillis) -> Self {
        Duration::from_millis(d.0)
    }
}

impl From<Duration> for DurationMillis {
    #[inline]
    fn from(d: Duration) -> Self {
        DurationMillis(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

impl ops::Add<DurationMillis> for UnixTimeMillis {
    type Output = UnixTimeMillis;

    #[inline]
    fn add(self, rhs: DurationMillis) -> Self::Output {
        UnixTimeMillis(self.0.saturating_add(rhs.0))
    }
}

impl ops::Sub<DurationMillis> for UnixTimeMillis {
    type Output = UnixTimeMillis;

    #[inline]
    fn sub(self, rhs: DurationMillis) -> Self::Output {
        UnixTimeMillis(self.0.saturating_sub(rhs.0))
    }
}

/// Saturates at zero when `rhs` is later than `self`
impl ops::Sub<UnixTimeMillis> for UnixTimeMillis {
    type Output = DurationMillis;

    #[inline]
    fn sub(self, rhs: UnixTimeMillis) -> Self::Output {
        DurationMillis(self.0.saturating_sub(rhs.0))
    }
}

#[cfg(any(feature = "serde", doc))]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl Serialize for UnixTimeMillis {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[cfg(any(feature = "serde", doc))]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl<'de> Deserialize<'de> for UnixTimeMillis {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = u64::deserialize(deserializer)?;
        Ok(Self(s))
    }
}

#[cfg(any(feature = "serde", doc))]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl Serialize for DurationMillis {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[cfg(any(feature = "serde", doc))]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl<'de> Deserialize<'de> for DurationMillis {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = u64::deserialize(deserializer)?;
        Ok(Self(s))
    }
}

/// Represents a clock, which can tell the current time
pub trait Clock {
    /// Gets the current time according to this clock
    fn now(&self) -> UnixTimeMillis;
}

/// The system clock as provided by `std::time::SystemTime`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct System;

impl Clock for System {
    #[inline]
    fn now(&self) -> UnixTimeMillis {
        UnixTimeMillis::from(SystemTime::now())
    }
}

#[cfg(feature = "tokio")]
mod tokio_clock {
    use super::{Clock, DurationMillis, UnixTimeMillis};
    use std::time::SystemTime;
    use tokio::time::Instant;

    /// A clock driven by Tokio's timer
    ///
    /// The wall-clock time is captured once, at construction, and from then on
    /// advances by however much time Tokio reports as elapsed. When Tokio's time
    /// is paused, this clock stands still, and `tokio::time::advance` moves it
    /// forward together with every pending sleep.
    #[derive(Clone, Copy, Debug)]
    pub struct TokioClock {
        origin: UnixTimeMillis,
        anchor: Instant,
    }

    impl TokioClock {
        /// Creates a clock anchored at the current system time
        pub fn new() -> Self {
            Self::starting_at(UnixTimeMillis::from(SystemTime::now()))
        }

        /// Creates a clock that reports `origin` right now
        pub fn starting_at(origin: UnixTimeMillis) -> Self {
            Self {
                origin,
                anchor: Instant::now(),
            }
        }
    }

    impl Default for TokioClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Clock for TokioClock {
        #[inline]
        fn now(&self) -> UnixTimeMillis {
            self.origin + DurationMillis::from(self.anchor.elapsed())
        }
    }
}

#[cfg(feature = "tokio")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
pub use tokio_clock::TokioClock;
