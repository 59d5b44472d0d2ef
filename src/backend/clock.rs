use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::Value;

use super::{is_server_timestamp, Fields};

/// Hands out commit timestamps that never repeat or go backwards, even when the
/// wall clock does.
#[derive(Debug, Default)]
pub struct TimestampClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl TimestampClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&self) -> DateTime<Utc> {
        let now = Utc::now();
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let next = match *last {
            Some(prev) if now <= prev => prev + Duration::nanoseconds(1),
            _ => now,
        };
        *last = Some(next);
        next
    }

    /// Moves the clock past `seen`, e.g. the newest stamp found in a reopened store.
    pub fn observe(&self, seen: DateTime<Utc>) {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if last.map(|prev| seen > prev).unwrap_or(true) {
            *last = Some(seen);
        }
    }
}

/// Fixed-width RFC 3339 so text order equals time order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn resolve_server_timestamps(fields: &mut Fields, stamp: &str) {
    for value in fields.values_mut() {
        if is_server_timestamp(value) {
            *value = Value::String(stamp.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{into_fields, server_timestamp};
    use serde_json::json;

    #[test]
    fn test_ticks_strictly_increase() {
        let clock = TimestampClock::new();
        let mut prev = clock.tick();
        for _ in 0..1000 {
            let next = clock.tick();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_observe_moves_clock_forward() {
        let clock = TimestampClock::new();
        let future = Utc::now() + Duration::hours(1);
        clock.observe(future);
        assert!(clock.tick() > future);
    }

    #[test]
    fn test_formatted_stamps_sort_as_text() {
        let clock = TimestampClock::new();
        let a = format_timestamp(clock.tick());
        let b = format_timestamp(clock.tick());
        assert_eq!(a.len(), b.len());
        assert!(a < b);
    }

    #[test]
    fn test_resolve_replaces_only_sentinels() {
        let mut fields = into_fields(json!({"text": "hi", "timestamp": server_timestamp()}));
        resolve_server_timestamps(&mut fields, "2024-01-01T00:00:00.000000000Z");
        assert_eq!(fields["timestamp"], json!("2024-01-01T00:00:00.000000000Z"));
        assert_eq!(fields["text"], json!("hi"));
    }
}
