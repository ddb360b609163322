//! Hybrid logical timestamps and the clock that issues them.
//!
//! A [`Timestamp`] pairs a physical wall time (nanoseconds) with a logical
//! counter that breaks ties between events sharing a wall time. The
//! [`Clock`] never hands out the same timestamp twice and never goes
//! backwards, even if its physical source does.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A hybrid logical clock timestamp.
///
/// Ordered by wall time, then logical counter.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Timestamp {
    /// Wall time in nanoseconds since the Unix epoch.
    pub wall_time: i64,

    /// Logical counter for events within the same wall time.
    pub logical: i32,
}

impl Timestamp {
    /// The zero timestamp. Also used as the timestamp of metadata keys.
    pub const MIN: Timestamp = Timestamp {
        wall_time: 0,
        logical: 0,
    };

    /// The largest representable timestamp.
    pub const MAX: Timestamp = Timestamp {
        wall_time: i64::MAX,
        logical: i32::MAX,
    };

    pub const fn new(wall_time: i64, logical: i32) -> Self {
        Timestamp { wall_time, logical }
    }

    /// A timestamp at the given wall time with a zero logical component.
    pub const fn from_wall(wall_time: i64) -> Self {
        Timestamp {
            wall_time,
            logical: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Timestamp::MIN
    }

    /// The smallest timestamp strictly greater than this one.
    pub fn next(&self) -> Timestamp {
        if self.logical == i32::MAX {
            if self.wall_time == i64::MAX {
                return *self;
            }
            return Timestamp::new(self.wall_time + 1, 0);
        }
        Timestamp::new(self.wall_time, self.logical + 1)
    }

    /// Offset the wall time by `wall` nanoseconds and the logical counter by `logical`.
    pub fn add(&self, wall: i64, logical: i32) -> Timestamp {
        Timestamp::new(
            self.wall_time.saturating_add(wall),
            self.logical.saturating_add(logical),
        )
    }

    /// Move the wall time back by `d`, saturating at zero. The logical part is dropped.
    pub fn sub_duration(&self, d: Duration) -> Timestamp {
        let nanos = i64::try_from(d.as_nanos()).unwrap_or(i64::MAX);
        Timestamp::from_wall(self.wall_time.saturating_sub(nanos).max(0))
    }

    /// Wall-clock time elapsed since `earlier`, zero if `earlier` is later.
    pub fn wall_since(&self, earlier: Timestamp) -> Duration {
        let diff = self.wall_time.saturating_sub(earlier.wall_time);
        if diff <= 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(diff as u64)
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.wall_time.div_euclid(1_000_000_000);
        let nanos = self.wall_time.rem_euclid(1_000_000_000);
        write!(f, "{}.{:09},{}", secs, nanos, self.logical)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// A manually driven physical time source, for tests.
#[derive(Debug, Default)]
pub struct ManualSource {
    nanos: AtomicI64,
}

impl ManualSource {
    pub fn new(nanos: i64) -> Self {
        ManualSource {
            nanos: AtomicI64::new(nanos),
        }
    }

    pub fn set(&self, nanos: i64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }

    pub fn advance(&self, d: Duration) {
        let nanos = i64::try_from(d.as_nanos()).unwrap_or(i64::MAX);
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    pub fn now(&self) -> i64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

type PhysicalSource = Box<dyn Fn() -> i64 + Send + Sync>;

/// Hybrid logical clock.
pub struct Clock {
    /// Physical time source, in nanoseconds.
    physical: PhysicalSource,

    /// Highest timestamp issued or observed.
    state: Mutex<Timestamp>,
}

impl Clock {
    /// Create a clock over an arbitrary physical source.
    pub fn new(physical: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        Clock {
            physical: Box::new(physical),
            state: Mutex::new(Timestamp::MIN),
        }
    }

    /// A clock backed by the system's UTC wall time.
    pub fn wall() -> Self {
        Clock::new(|| chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX))
    }

    /// A clock backed by a [`ManualSource`].
    pub fn manual(source: Arc<ManualSource>) -> Self {
        Clock::new(move || source.now())
    }

    /// Issue a new timestamp, strictly greater than any issued before.
    pub fn now(&self) -> Timestamp {
        let physical = (self.physical)();
        let mut state = self.state.lock();
        if physical > state.wall_time {
            *state = Timestamp::from_wall(physical);
        } else {
            *state = state.next();
        }
        *state
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock")
            .field("state", &*self.state.lock())
            .finish()
    }
}
