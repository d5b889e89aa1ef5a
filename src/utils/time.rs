use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Utc};

use super::clock::Clock;

pub const DATE_KEY_FORMAT: &str = "%Y-%m-%d";

/// This is the standard way of converting a date to a string in tabtally.
pub fn date_to_key(date: NaiveDate) -> String {
    date.format(DATE_KEY_FORMAT).to_string()
}

pub fn key_to_date(key: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(key, DATE_KEY_FORMAT).ok()
}

/// Returns start of the next day. A fixed offset always has exactly one midnight.
pub fn next_day_start(date: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    let midnight = (date.date_naive() + Duration::days(1)).and_time(NaiveTime::MIN);
    midnight
        .and_local_timezone(*date.offset())
        .single()
        .unwrap_or(date + Duration::days(1))
}

/// Calendar date of `at` for the user of `clock`.
pub fn local_date(clock: &dyn Clock, at: DateTime<Utc>) -> NaiveDate {
    at.with_timezone(&clock.local_offset(at)).date_naive()
}

/// First instant after `at` that belongs to the next local day.
pub fn next_local_midnight(clock: &dyn Clock, at: DateTime<Utc>) -> DateTime<Utc> {
    let offset: FixedOffset = clock.local_offset(at);
    next_day_start(at.with_timezone(&offset)).with_timezone(&Utc)
}

/// Splits `[from, to)` into per-day pieces along local midnights.
pub fn split_by_local_day(
    clock: &dyn Clock,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Vec<(NaiveDate, DateTime<Utc>, DateTime<Utc>)> {
    let mut pieces = vec![];
    let mut start = from;
    while start < to {
        let boundary = next_local_midnight(clock, start);
        let end = boundary.min(to);
        pieces.push((local_date(clock, start), start, end));
        start = end;
    }
    pieces
}

/// Returns dates between start (inclusive) and end (inclusive).
pub fn date_range(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    start.iter_days().take_while(move |day| *day <= end)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate, TimeZone, Utc};

    use crate::utils::clock::testing::{ManualClock, TEST_START_DATE};

    use super::{date_range, date_to_key, key_to_date, split_by_local_day};

    #[test]
    fn test_date_key_format() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(date_to_key(date), "2024-03-09");
        assert_eq!(key_to_date("2024-03-09"), Some(date));
        assert_eq!(key_to_date("2024-3-9x"), None);
    }

    #[test]
    fn test_split_across_midnight() {
        let clock = ManualClock::at_test_start();
        let midnight = Utc.from_utc_datetime(&TEST_START_DATE);
        let from = midnight - Duration::minutes(10);
        let to = midnight + Duration::minutes(5);

        let pieces = split_by_local_day(&clock, from, to);

        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].0, TEST_START_DATE.date().pred_opt().unwrap());
        assert_eq!(pieces[0].2 - pieces[0].1, Duration::minutes(10));
        assert_eq!(pieces[1].0, TEST_START_DATE.date());
        assert_eq!(pieces[1].2 - pieces[1].1, Duration::minutes(5));
    }

    #[test]
    fn test_split_empty_interval() {
        let clock = ManualClock::at_test_start();
        let at = Utc.from_utc_datetime(&TEST_START_DATE);
        assert!(split_by_local_day(&clock, at, at).is_empty());
    }

    #[test]
    fn test_date_range_inclusive() {
        let start = NaiveDate::from_ymd_opt(2024, 2, 27).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let days = date_range(start, end).collect::<Vec<_>>();
        assert_eq!(days.len(), 4);
        assert_eq!(days.last(), Some(&end));
        assert_eq!(date_range(end, start).count(), 0);
    }
}
