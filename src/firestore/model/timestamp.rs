use std::cmp::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Point in time with nanosecond precision. Also used as a snapshot version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    /// The "no version" sentinel. Every real version sorts after it.
    pub const MIN: Timestamp = Timestamp {
        seconds: 0,
        nanos: 0,
    };

    pub fn new(seconds: i64, nanos: i32) -> Self {
        let mut timestamp = Self { seconds, nanos };
        timestamp.normalize();
        timestamp
    }

    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_millis(millis: i64) -> Self {
        Self::new(millis.div_euclid(1_000), (millis.rem_euclid(1_000) * 1_000_000) as i32)
    }

    pub fn from_micros(micros: i64) -> Self {
        Self::new(
            micros.div_euclid(1_000_000),
            (micros.rem_euclid(1_000_000) * 1_000) as i32,
        )
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(duration) => Self {
                seconds: duration.as_secs() as i64,
                nanos: duration.subsec_nanos() as i32,
            },
            Err(err) => {
                let duration = err.duration();
                Self::new(
                    -(duration.as_secs() as i64),
                    -(duration.subsec_nanos() as i32),
                )
            }
        }
    }

    pub fn to_system_time(&self) -> SystemTime {
        if self.seconds >= 0 {
            UNIX_EPOCH
                + Duration::from_secs(self.seconds as u64)
                + Duration::from_nanos(self.nanos as u64)
        } else {
            UNIX_EPOCH - Duration::from_secs(self.seconds.unsigned_abs())
                + Duration::from_nanos(self.nanos as u64)
        }
    }

    pub fn to_micros(&self) -> i64 {
        self.seconds * 1_000_000 + i64::from(self.nanos / 1_000)
    }

    pub fn is_min(&self) -> bool {
        *self == Self::MIN
    }

    fn normalize(&mut self) {
        self.seconds += i64::from(self.nanos.div_euclid(1_000_000_000));
        self.nanos = self.nanos.rem_euclid(1_000_000_000);
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.seconds.cmp(&other.seconds) {
            Ordering::Equal => self.nanos.cmp(&other.nanos),
            ordering => ordering,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_nanoseconds() {
        let timestamp = Timestamp::new(1, 1_500_000_000);
        assert_eq!(timestamp.seconds, 2);
        assert_eq!(timestamp.nanos, 500_000_000);

        let negative = Timestamp::new(1, -1);
        assert_eq!(negative, Timestamp::new(0, 999_999_999));
    }

    #[test]
    fn min_sorts_first() {
        assert!(Timestamp::MIN < Timestamp::new(0, 1));
        assert!(Timestamp::MIN.is_min());
        assert_eq!(Timestamp::from_millis(1_500), Timestamp::new(1, 500_000_000));
    }
}
