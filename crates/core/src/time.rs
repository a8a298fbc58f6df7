use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A timestamp represented as the number of milliseconds since the Unix
/// epoch.
///
/// This is the only notion of wall-clock time that appears on the wire
/// (`origin_server_ts`, `valid_until_ts`, receipt timestamps and so on).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UnixMillis(pub u64);

impl UnixMillis {
    /// The current system time.
    pub fn now() -> Self {
        Self(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        )
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    pub fn as_secs(&self) -> u64 {
        self.0 / 1000
    }

    pub fn from_system_time(time: SystemTime) -> Option<Self> {
        time.duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| Self(d.as_millis() as u64))
    }

    pub fn to_system_time(self) -> Option<SystemTime> {
        UNIX_EPOCH.checked_add(Duration::from_millis(self.0))
    }

    /// Milliseconds elapsed between `self` and `later`, zero if `later` is
    /// in the past relative to `self`.
    pub fn elapsed_until(&self, later: UnixMillis) -> u64 {
        later.0.saturating_sub(self.0)
    }

    pub fn saturating_add(self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis))
    }

    pub fn saturating_sub(self, millis: u64) -> Self {
        Self(self.0.saturating_sub(millis))
    }
}

impl fmt::Display for UnixMillis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for UnixMillis {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::UnixMillis;

    #[test]
    fn ordering_and_arithmetic() {
        let a = UnixMillis(1_000);
        let b = UnixMillis(4_000);
        assert!(a < b);
        assert_eq!(a.elapsed_until(b), 3_000);
        assert_eq!(b.elapsed_until(a), 0);
        assert_eq!(a.saturating_add(500).get(), 1_500);
        assert_eq!(a.as_secs(), 1);
    }

    #[test]
    fn serde_is_transparent() {
        let ts = UnixMillis(1_660_000_000_000);
        assert_eq!(serde_json::to_string(&ts).unwrap(), "1660000000000");
        let back: UnixMillis = serde_json::from_str("1660000000000").unwrap();
        assert_eq!(back, ts);
    }
}
