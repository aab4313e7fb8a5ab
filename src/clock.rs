//! Monotonic microsecond clock
//!
//! Sync ordering relies on `updated_at_timestamp` strictly increasing for
//! every save within the process. Reading wall time directly cannot
//! guarantee that under rapid successive saves, so the timer latches the
//! last value handed out and bumps past it on collision.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::SyncError;

/// Process-wide monotonic microsecond timer
pub struct Timer {
    last_micros: Mutex<i64>,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            last_micros: Mutex::new(0),
        }
    }

    /// Current time in microseconds since epoch, strictly greater than any
    /// value previously returned by this instance.
    pub fn now_micros(&self) -> i64 {
        let wall = Utc::now().timestamp_micros();
        let mut last = self.last_micros.lock().unwrap_or_else(|e| e.into_inner());
        let next = if wall > *last { wall } else { *last + 1 };
        *last = next;
        next
    }

    /// Sleep for the given duration
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert an RFC 3339 date string to microseconds since epoch.
///
/// Legacy sync tokens carry their instant as a date string.
pub fn micros_from_date_string(value: &str) -> Result<i64, SyncError> {
    let parsed = DateTime::parse_from_rfc3339(value)
        .map_err(|e| SyncError::BadToken(format!("unparseable date '{}': {}", value, e)))?;
    Ok(parsed.with_timezone(&Utc).timestamp_micros())
}

/// Format microseconds since epoch as an RFC 3339 date string.
pub fn date_string_from_micros(micros: i64) -> String {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_strictly_increases() {
        let timer = Timer::new();
        let mut previous = timer.now_micros();
        for _ in 0..10_000 {
            let next = timer.now_micros();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn test_timer_tracks_wall_clock() {
        let timer = Timer::new();
        let now = timer.now_micros();
        let wall = Utc::now().timestamp_micros();
        // Within a second of wall time
        assert!((wall - now).abs() < 1_000_000);
    }

    #[test]
    fn test_date_string_round_trip() {
        let micros = 1_700_000_123_456_789i64;
        let text = date_string_from_micros(micros);
        assert_eq!(micros_from_date_string(&text).unwrap(), micros);
    }

    #[test]
    fn test_bad_date_string() {
        assert!(matches!(
            micros_from_date_string("not-a-date"),
            Err(SyncError::BadToken(_))
        ));
    }
}
