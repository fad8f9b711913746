//! Hybrid-logical timestamps and the clock that hands them out.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A point in logical time. Ordered by wall time, then logical counter.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub wall_time: i64,
    pub logical: i32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp {
        wall_time: 0,
        logical: 0,
    };

    pub const fn new(wall_time: i64, logical: i32) -> Self {
        Self { wall_time, logical }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// The smallest timestamp strictly greater than `self`.
    pub fn next(&self) -> Self {
        if self.logical == i32::MAX {
            Self::new(self.wall_time.saturating_add(1), 0)
        } else {
            Self::new(self.wall_time, self.logical + 1)
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:010}", self.wall_time, self.logical)
    }
}

impl FromStr for Timestamp {
    type Err = String;

    /// Accepts `wall` or `wall.logical`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (wall, logical) = match s.split_once('.') {
            Some((wall, logical)) => (wall, logical),
            None => (s, "0"),
        };
        let wall_time = wall
            .parse::<i64>()
            .map_err(|e| format!("invalid wall time {:?}: {}", wall, e))?;
        let logical = logical
            .parse::<i32>()
            .map_err(|e| format!("invalid logical component {:?}: {}", logical, e))?;
        if wall_time < 0 || logical < 0 {
            return Err(format!("timestamp {:?} must not be negative", s));
        }
        Ok(Timestamp::new(wall_time, logical))
    }
}

/// Monotonic hybrid clock: physical nanoseconds, logical tie-breaker.
pub struct HybridClock {
    last: Mutex<Timestamp>,
}

impl HybridClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Timestamp::ZERO),
        }
    }

    /// Returns a timestamp strictly greater than every previously returned one.
    pub fn now(&self) -> Timestamp {
        let physical = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX);
        let mut last = self.last.lock();
        *last = if physical > last.wall_time {
            Timestamp::new(physical, 0)
        } else {
            last.next()
        };
        *last
    }

    /// Ratchets the clock forward so later readings exceed `ts`.
    pub fn observe(&self, ts: Timestamp) {
        let mut last = self.last.lock();
        if ts > *last {
            *last = ts;
        }
    }
}

impl Default for HybridClock {
    fn default() -> Self {
        Self::new()
    }
}
