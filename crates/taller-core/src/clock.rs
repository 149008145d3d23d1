use chrono::{
    DateTime, Duration, FixedOffset, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc,
};

/// Clock abstracts the current time and the shop's local timezone so date
/// interpretation stays deterministic in tests.
///
/// All calendar semantics (plain dates meaning local midnight, `dateKey`
/// derivation, daily windows) go through this trait.
pub trait Clock: Send + Sync {
    /// Returns the current UTC timestamp.
    fn now(&self) -> DateTime<Utc>;

    /// Resolves a wall-clock reading in the shop's timezone to an instant.
    fn local_instant(&self, wall: NaiveDateTime) -> DateTime<Utc>;

    /// Returns the local calendar date an instant falls on.
    fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate;

    /// Returns the instant at which the given local calendar day starts.
    fn local_midnight(&self, date: NaiveDate) -> DateTime<Utc> {
        self.local_instant(date.and_time(NaiveTime::MIN))
    }

    /// Returns the current local calendar date.
    fn today(&self) -> NaiveDate {
        self.local_date(self.now())
    }
}

/// Real-time clock using the host's local timezone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn local_instant(&self, wall: NaiveDateTime) -> DateTime<Utc> {
        if let Some(dt) = Local.from_local_datetime(&wall).earliest() {
            return dt.with_timezone(&Utc);
        }
        // wall time skipped by a DST gap, resolve to the following hour
        if let Some(dt) = Local.from_local_datetime(&(wall + Duration::hours(1))).earliest() {
            return dt.with_timezone(&Utc);
        }
        Utc.from_utc_datetime(&wall)
    }

    fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&Local).date_naive()
    }
}

/// Clock pinned to a fixed instant and UTC offset.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    now: DateTime<Utc>,
    offset: FixedOffset,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self { now, offset }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn local_instant(&self, wall: NaiveDateTime) -> DateTime<Utc> {
        // fixed offsets have no gaps or ambiguity
        match self.offset.from_local_datetime(&wall).earliest() {
            Some(dt) => dt.with_timezone(&Utc),
            None => Utc.from_utc_datetime(&wall),
        }
    }

    fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.offset).date_naive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn fixed_clock_resolves_wall_time_through_offset() {
        let clock = FixedClock::new(
            utc("2024-03-10T12:00:00Z"),
            FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap(),
        );
        let wall = NaiveDate::from_ymd_opt(2024, 3, 10)
            .unwrap()
            .and_time(NaiveTime::MIN);
        assert_eq!(clock.local_instant(wall), utc("2024-03-09T18:30:00Z"));
    }

    #[test]
    fn local_midnight_round_trips_to_the_same_date() {
        let clock = FixedClock::new(
            utc("2024-03-10T12:00:00Z"),
            FixedOffset::west_opt(7 * 3600).unwrap(),
        );
        let date = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let midnight = clock.local_midnight(date);
        assert_eq!(midnight, utc("2024-03-10T07:00:00Z"));
        assert_eq!(clock.local_date(midnight), date);
    }

    #[test]
    fn today_follows_the_offset_not_utc() {
        // 01:30 UTC on the 11th is still the 10th at UTC-7
        let clock = FixedClock::new(
            utc("2024-03-11T01:30:00Z"),
            FixedOffset::west_opt(7 * 3600).unwrap(),
        );
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());
    }
}
