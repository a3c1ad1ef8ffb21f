//! Registration deadline arithmetic.
//!
//! The deadline is informational: it drives the public countdown but never
//! closes registration on its own. The admin performs the draw manually once it
//! has passed.

use chrono::{DateTime, Utc};
use miam_types::Countdown;

/// Milliseconds left until `deadline`, or `None` once it has passed.
pub fn remaining_ms(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Option<u64> {
    let distance = deadline.signed_duration_since(now).num_milliseconds();
    if distance < 0 {
        return None;
    }
    Some(distance as u64)
}

/// Countdown to `deadline`, `None` when unset or expired.
pub fn countdown(deadline: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<Countdown> {
    deadline
        .and_then(|deadline| remaining_ms(deadline, now))
        .map(Countdown::from_millis)
}

/// Current wall-clock time in unix milliseconds.
pub fn unix_ms(now: DateTime<Utc>) -> u64 {
    now.timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_countdown_before_deadline() {
        let now = at("2025-12-20T18:00:00Z");
        let deadline = now + Duration::days(1) + Duration::hours(2) + Duration::seconds(30);
        let countdown = countdown(Some(deadline), now).unwrap();
        assert_eq!(countdown.days, 1);
        assert_eq!(countdown.hours, 2);
        assert_eq!(countdown.minutes, 0);
        assert_eq!(countdown.seconds, 30);
        assert_eq!(remaining_ms(deadline, now), Some(93_630_000));
    }

    #[test]
    fn test_countdown_at_and_after_deadline() {
        let now = at("2025-12-20T18:00:00Z");
        assert_eq!(
            countdown(Some(now), now),
            Some(Countdown {
                days: 0,
                hours: 0,
                minutes: 0,
                seconds: 0
            })
        );
        let past = now - Duration::milliseconds(1);
        assert_eq!(countdown(Some(past), now), None);
        assert_eq!(remaining_ms(past, now), None);
    }

    #[test]
    fn test_no_deadline_never_expires() {
        let now = at("2025-12-20T18:00:00Z");
        assert_eq!(countdown(None, now), None);
    }

    #[test]
    fn test_unix_ms_clamps_pre_epoch() {
        assert_eq!(unix_ms(at("1969-12-31T23:59:59Z")), 0);
        assert_eq!(unix_ms(at("1970-01-01T00:00:01Z")), 1_000);
    }
}
