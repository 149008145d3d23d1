use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};

use taller_core::{Clock, DomainError};

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Normalizes a wire date to an instant. Three forms are accepted:
///
/// * plain `YYYY-MM-DD`, meaning midnight at the start of that local day
/// * a naive datetime (`YYYY-MM-DDTHH:MM[:SS]`), read as local wall time
/// * an RFC 3339 timestamp with an explicit offset, taken as given
///
/// Anything else is a validation error, never a silent fallback.
pub fn parse_instant(raw: &str, clock: &dyn Clock) -> Result<DateTime<Utc>, DomainError> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(clock.local_midnight(date));
    }
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Ok(instant.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(wall) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(clock.local_instant(wall));
        }
    }
    Err(DomainError::Validation(format!("invalid date: {raw}")))
}

/// Strict `YYYY-MM-DD` parse for fields that name a calendar day.
pub fn parse_date(raw: &str) -> Result<NaiveDate, DomainError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| DomainError::Validation(format!("invalid date key: {raw}")))
}

/// The local calendar date of an instant, formatted `YYYY-MM-DD`.
pub fn date_key(instant: DateTime<Utc>, clock: &dyn Clock) -> String {
    clock.local_date(instant).format("%Y-%m-%d").to_string()
}

/// Half-open `[start, start + 1 day)` window covering one local day.
pub fn day_window(date: NaiveDate, clock: &dyn Clock) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = clock.local_midnight(date);
    (start, start + Duration::days(1))
}

/// Inclusive reporting bounds. A missing `from` reaches back to the Unix
/// epoch, a missing `to` ends at the current instant.
pub fn parse_range(
    from: Option<&str>,
    to: Option<&str>,
    clock: &dyn Clock,
) -> Result<(DateTime<Utc>, DateTime<Utc>), DomainError> {
    let from = match from {
        Some(raw) => parse_instant(raw, clock)?,
        None => DateTime::<Utc>::UNIX_EPOCH,
    };
    let to = match to {
        Some(raw) => parse_instant(raw, clock)?,
        None => clock.now(),
    };
    Ok((from, to))
}

#[cfg(test)]
mod tests {
    use chrono::FixedOffset;
    use taller_core::FixedClock;

    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn clock_at(offset_hours: i32) -> FixedClock {
        FixedClock::new(
            utc("2024-03-10T12:00:00Z"),
            FixedOffset::east_opt(offset_hours * 3600).unwrap(),
        )
    }

    #[test]
    fn plain_date_means_local_midnight() {
        let clock = clock_at(-7);
        assert_eq!(
            parse_instant("2024-03-10", &clock).unwrap(),
            utc("2024-03-10T07:00:00Z")
        );
    }

    #[test]
    fn naive_datetime_is_local_wall_time() {
        let clock = clock_at(2);
        assert_eq!(
            parse_instant("2024-03-10T15:30", &clock).unwrap(),
            utc("2024-03-10T13:30:00Z")
        );
        assert_eq!(
            parse_instant("2024-03-10 15:30:45", &clock).unwrap(),
            utc("2024-03-10T13:30:45Z")
        );
    }

    #[test]
    fn explicit_offset_is_taken_as_given() {
        let clock = clock_at(-7);
        assert_eq!(
            parse_instant("2024-03-10T12:00:00+05:30", &clock).unwrap(),
            utc("2024-03-10T06:30:00Z")
        );
        assert_eq!(
            parse_instant("2024-03-10T12:00:00Z", &clock).unwrap(),
            utc("2024-03-10T12:00:00Z")
        );
    }

    #[test]
    fn garbage_dates_are_rejected() {
        let clock = clock_at(0);
        assert!(parse_instant("yesterday", &clock).is_err());
        assert!(parse_instant("2024-13-40", &clock).is_err());
        assert!(parse_instant("", &clock).is_err());
    }

    #[test]
    fn date_key_matches_plain_date_under_any_offset() {
        // the invariant behind cash session lookup: a plain date and its
        // local-midnight instant always land on the same key
        for hours in [-7, 0, 5, 13] {
            let clock = clock_at(hours);
            let instant = parse_instant("2024-03-10", &clock).unwrap();
            assert_eq!(date_key(instant, &clock), "2024-03-10");
        }
    }

    #[test]
    fn day_window_spans_exactly_one_day() {
        let clock = clock_at(-7);
        let date = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let (start, end) = day_window(date, &clock);
        assert_eq!(start, utc("2024-03-10T07:00:00Z"));
        assert_eq!(end, utc("2024-03-11T07:00:00Z"));
    }

    #[test]
    fn range_defaults_to_epoch_and_now() {
        let clock = clock_at(0);
        let (from, to) = parse_range(None, None, &clock).unwrap();
        assert_eq!(from, DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(to, clock.now());
    }

    #[test]
    fn strict_date_rejects_timestamps() {
        assert_eq!(
            parse_date("2024-03-10").unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 10).unwrap()
        );
        assert!(parse_date("2024-03-10T00:00:00Z").is_err());
        assert!(parse_date("not-a-date").is_err());
    }
}
