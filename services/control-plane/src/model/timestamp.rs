//! Wall-clock version timestamps.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A wall-clock instant used as a snapshot version.
///
/// Truncated to millisecond precision so that the RFC 3339 string form
/// round-trips exactly. Ordering and equality are total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// The current instant.
    #[must_use]
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// The UNIX epoch.
    #[must_use]
    pub fn zero() -> Self {
        Self(Utc.timestamp_millis_opt(0).unwrap())
    }

    /// Truncates to millisecond precision.
    #[must_use]
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        let millis = dt.timestamp_millis();
        Self(Utc.timestamp_millis_opt(millis).unwrap())
    }

    /// The current instant, guaranteed strictly greater than `prev`.
    ///
    /// Successive mutations within the same millisecond would otherwise
    /// collide on the version key.
    #[must_use]
    pub fn monotonic_after(prev: &Timestamp) -> Self {
        let now = Self::now();
        if now > *prev {
            now
        } else {
            Self(Utc.timestamp_millis_opt(prev.0.timestamp_millis() + 1).unwrap())
        }
    }

    /// The underlying instant.
    #[must_use]
    pub fn datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Milliseconds since the UNIX epoch.
    #[must_use]
    pub fn millis(&self) -> i64 {
        self.0.timestamp_millis()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = DateTime::parse_from_rfc3339(s)?;
        Ok(Self::from_datetime(dt.with_timezone(&Utc)))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
