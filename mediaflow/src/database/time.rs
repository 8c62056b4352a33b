//! Timestamps are stored as `INTEGER` Unix epoch milliseconds (UTC).

use chrono::{DateTime, Utc};

#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[inline]
pub fn to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Out-of-range values fall back to the Unix epoch.
#[inline]
pub fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_conversion_keeps_millis() {
        let now = Utc::now();
        let restored = from_ms(to_ms(now));
        assert_eq!(restored.timestamp_millis(), now.timestamp_millis());
        assert_eq!(from_ms(i64::MAX), DateTime::<Utc>::default());
    }
}
