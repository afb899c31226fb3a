//! Utilities for messing with time
//!
//! Types included allow messing with and mocking out clocks and other
//! side-effect-laden time operations. Token lifetimes are tracked with
//! whole-second precision, matching what identity providers issue.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_must_use
)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

use std::{
    fmt, ops,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Unix time
///
/// Unix time as represented by the number of seconds elapsed since the
/// beginning of the Unix epoch on 1970/01/01 at 00:00:00 UTC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct UnixTime(pub u64);

impl UnixTime {
    /// The start of the Unix epoch
    pub const EPOCH: Self = Self(0);

    /// Adds a duration, saturating at the maximum representable time
    #[inline]
    #[must_use]
    pub const fn saturating_add(self, d: DurationSecs) -> Self {
        Self(self.0.saturating_add(d.0))
    }

    /// Subtracts a duration, saturating at the Unix epoch
    #[inline]
    #[must_use]
    pub const fn saturating_sub(self, d: DurationSecs) -> Self {
        Self(self.0.saturating_sub(d.0))
    }

    /// The time elapsed since `earlier`, or zero if `earlier` is later
    #[inline]
    #[must_use]
    pub const fn duration_since(self, earlier: UnixTime) -> DurationSecs {
        DurationSecs(self.0.saturating_sub(earlier.0))
    }
}

impl From<SystemTime> for UnixTime {
    #[inline]
    fn from(t: SystemTime) -> Self {
        // Clocks set before the epoch are clamped rather than trusted
        let time = t
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        UnixTime(time)
    }
}

impl fmt::Display for UnixTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl ops::Add<DurationSecs> for UnixTime {
    type Output = UnixTime;

    #[inline]
    fn add(self, rhs: DurationSecs) -> Self::Output {
        self.saturating_add(rhs)
    }
}

impl ops::AddAssign<DurationSecs> for UnixTime {
    #[inline]
    fn add_assign(&mut self, rhs: DurationSecs) {
        *self = self.saturating_add(rhs);
    }
}

impl ops::Sub<DurationSecs> for UnixTime {
    type Output = UnixTime;

    #[inline]
    fn sub(self, rhs: DurationSecs) -> Self::Output {
        self.saturating_sub(rhs)
    }
}

impl ops::Sub<UnixTime> for UnixTime {
    type Output = DurationSecs;

    #[inline]
    fn sub(self, rhs: UnixTime) -> Self::Output {
        self.duration_since(rhs)
    }
}

/// A span of time measured in whole seconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct DurationSecs(pub u64);

impl DurationSecs {
    /// A zero-length duration
    pub const ZERO: Self = Self(0);

    /// Constructs a duration from a number of minutes
    #[inline]
    pub const fn from_minutes(minutes: u64) -> Self {
        Self(minutes.saturating_mul(60))
    }

    /// Constructs a duration from a number of days
    #[inline]
    pub const fn from_days(days: u64) -> Self {
        Self(days.saturating_mul(86_400))
    }
}

impl From<Duration> for DurationSecs {
    #[inline]
    fn from(d: Duration) -> Self {
        Self(d.as_secs())
    }
}

impl From<DurationSecs> for Duration {
    #[inline]
    fn from(d: DurationSecs) -> Self {
        Duration::from_secs(d.0)
    }
}

impl fmt::Display for DurationSecs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}s", self.0)
    }
}

impl ops::Add for DurationSecs {
    type Output = DurationSecs;

    #[inline]
    fn add(self, rhs: DurationSecs) -> Self::Output {
        Self(self.0.saturating_add(rhs.0))
    }
}

#[cfg(feature = "serde")]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl Serialize for UnixTime {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[cfg(feature = "serde")]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl<'de> Deserialize<'de> for UnixTime {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = u64::deserialize(deserializer)?;
        Ok(Self(s))
    }
}

#[cfg(feature = "serde")]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl Serialize for DurationSecs {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[cfg(feature = "serde")]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
impl<'de> Deserialize<'de> for DurationSecs {
    #[inline]
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = u64::deserialize(deserializer)?;
        Ok(Self(s))
    }
}

/// Serde helpers for Unix times written as decimal strings
///
/// Use with `#[serde(with = "idcache_clock::as_string")]`. Deserialization
/// accepts either a string or an integer.
#[cfg(feature = "serde")]
#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
pub mod as_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    use super::UnixTime;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrInt {
        String(String),
        Int(u64),
    }

    impl StringOrInt {
        fn into_time<E: de::Error>(self) -> Result<UnixTime, E> {
            match self {
                Self::Int(i) => Ok(UnixTime(i)),
                Self::String(s) => s
                    .trim()
                    .parse()
                    .map(UnixTime)
                    .map_err(|_| E::invalid_value(de::Unexpected::Str(&s), &"a unix timestamp")),
            }
        }
    }

    /// Serializes the time as a decimal string
    pub fn serialize<S: Serializer>(t: &UnixTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&t.0)
    }

    /// Deserializes a time from a decimal string or an integer
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<UnixTime, D::Error> {
        StringOrInt::deserialize(deserializer)?.into_time()
    }

    /// The same encoding for optional times
    ///
    /// Pair with `default` and `skip_serializing_if = "Option::is_none"`;
    /// an empty string reads as `None`.
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};

        use super::StringOrInt;
        use crate::UnixTime;

        /// Serializes the time as a decimal string, if present
        pub fn serialize<S: Serializer>(
            t: &Option<UnixTime>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match t {
                Some(t) => serializer.collect_str(&t.0),
                None => serializer.serialize_none(),
            }
        }

        /// Deserializes an optional time
        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<UnixTime>, D::Error> {
            match Option::<StringOrInt>::deserialize(deserializer)? {
                None => Ok(None),
                Some(StringOrInt::String(s)) if s.trim().is_empty() => Ok(None),
                Some(v) => v.into_time().map(Some),
            }
        }
    }
}

/// Represents a clock, which can tell the current time
pub trait Clock {
    /// Gets the current time according to this clock
    fn now(&self) -> UnixTime;
}

impl<C: Clock + ?Sized> Clock for &C {
    #[inline]
    fn now(&self) -> UnixTime {
        (**self).now()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    #[inline]
    fn now(&self) -> UnixTime {
        (**self).now()
    }
}

/// The system clock as provided by `std::time::SystemTime`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct System;

impl Clock for System {
    #[inline]
    fn now(&self) -> UnixTime {
        UnixTime::from(SystemTime::now())
    }
}

/// A test clock which maintains the current time as shared internal state
///
/// Clones observe the same instant, so a test can hand a clone to the code
/// under test and continue moving time forward from the outside.
#[derive(Clone, Debug, Default)]
pub struct TestClock(Arc<AtomicU64>);

impl Clock for TestClock {
    #[inline]
    fn now(&self) -> UnixTime {
        UnixTime(self.0.load(Ordering::Acquire))
    }
}

impl TestClock {
    /// Creates a new test clock with the specified time
    #[inline]
    pub fn new(time: UnixTime) -> Self {
        Self(Arc::new(AtomicU64::new(time.0)))
    }

    /// Updates the clock's current time to `val`
    pub fn set(&self, val: UnixTime) {
        self.0.store(val.0, Ordering::Release);
    }

    /// Increments the clock's current time by `inc` seconds
    pub fn inc(&self, inc: u64) {
        self.advance(DurationSecs(inc));
    }

    /// Moves the clock's current time forward by `d`
    pub fn advance(&self, d: DurationSecs) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                Some(t.saturating_add(d.0))
            });
    }
}
