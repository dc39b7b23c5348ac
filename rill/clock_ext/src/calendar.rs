/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

use chrono::DateTime;
use chrono::Datelike;
use chrono::Duration as TimeDelta;
use chrono::NaiveDate;
use chrono::Timelike;
use chrono::Utc;

/// Calendar units understood by [floor] and [add]. Units above seconds use
/// calendar semantics: weeks start on Monday and month lengths vary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    /// One thousandth of a second.
    Millisecond,
    /// One second.
    Second,
    /// Sixty seconds.
    Minute,
    /// Sixty minutes.
    Hour,
    /// A calendar day.
    Day,
    /// A calendar week, starting on Monday.
    Week,
    /// A calendar month.
    Month,
}

/// Truncates `t` down to the given unit, clearing all finer-grained fields.
/// Flooring is idempotent: `floor(floor(t, u), u) == floor(t, u)`.
pub fn floor(t: DateTime<Utc>, unit: TimeUnit) -> DateTime<Utc> {
    let t = match unit {
        TimeUnit::Millisecond => {
            let sub_ms = t.timestamp_subsec_nanos() % 1_000_000;
            return t - TimeDelta::nanoseconds(sub_ms as i64);
        }
        _ => t
            .with_nanosecond(0)
            .expect("zero nanosecond is always valid"),
    };
    let t = match unit {
        TimeUnit::Second => return t,
        _ => t.with_second(0).expect("zero second is always valid"),
    };
    let t = match unit {
        TimeUnit::Minute => return t,
        _ => t.with_minute(0).expect("zero minute is always valid"),
    };
    let t = match unit {
        TimeUnit::Hour => return t,
        _ => t.with_hour(0).expect("zero hour is always valid"),
    };
    match unit {
        TimeUnit::Day => t,
        TimeUnit::Week => {
            let days_past_monday = t.weekday().num_days_from_monday();
            t - TimeDelta::days(days_past_monday as i64)
        }
        TimeUnit::Month => t.with_day(1).expect("first of month is always valid"),
        _ => unreachable!("finer units returned above"),
    }
}

/// Advances `t` by `n` (possibly negative) units. Month arithmetic clamps
/// the day-of-month, so Jan 31 plus one month is the last day of February.
pub fn add(t: DateTime<Utc>, n: i64, unit: TimeUnit) -> DateTime<Utc> {
    match unit {
        TimeUnit::Millisecond => t + TimeDelta::milliseconds(n),
        TimeUnit::Second => t + TimeDelta::seconds(n),
        TimeUnit::Minute => t + TimeDelta::minutes(n),
        TimeUnit::Hour => t + TimeDelta::hours(n),
        TimeUnit::Day => t + TimeDelta::days(n),
        TimeUnit::Week => t + TimeDelta::days(7 * n),
        TimeUnit::Month => add_months(t, n),
    }
}

fn add_months(t: DateTime<Utc>, n: i64) -> DateTime<Utc> {
    let month0 = t.month0() as i64 + n;
    let year = t.year() as i64 + month0.div_euclid(12);
    let month = month0.rem_euclid(12) as u32 + 1;
    let year = year as i32;
    let day = t.day().min(days_in_month(year, month));
    let date = NaiveDate::from_ymd_opt(year, month, day).expect("day clamped to month length");
    DateTime::from_naive_utc_and_offset(date.and_time(t.time()), Utc)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .expect("first of month is always valid")
        .pred_opt()
        .expect("month start has a predecessor")
        .day()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use quickcheck::quickcheck;

    use super::*;

    fn utc(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    const UNITS: [TimeUnit; 7] = [
        TimeUnit::Millisecond,
        TimeUnit::Second,
        TimeUnit::Minute,
        TimeUnit::Hour,
        TimeUnit::Day,
        TimeUnit::Week,
        TimeUnit::Month,
    ];

    #[test]
    fn floor_clears_finer_fields() {
        let t = Utc.with_ymd_and_hms(2020, 5, 17, 13, 45, 59).unwrap()
            + TimeDelta::milliseconds(123);
        assert_eq!(
            floor(t, TimeUnit::Minute),
            Utc.with_ymd_and_hms(2020, 5, 17, 13, 45, 0).unwrap()
        );
        assert_eq!(
            floor(t, TimeUnit::Day),
            Utc.with_ymd_and_hms(2020, 5, 17, 0, 0, 0).unwrap()
        );
        assert_eq!(
            floor(t, TimeUnit::Month),
            Utc.with_ymd_and_hms(2020, 5, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn floor_week_lands_on_monday() {
        // 2020-05-17 is a Sunday.
        let t = Utc.with_ymd_and_hms(2020, 5, 17, 13, 45, 59).unwrap();
        let floored = floor(t, TimeUnit::Week);
        assert_eq!(floored, Utc.with_ymd_and_hms(2020, 5, 11, 0, 0, 0).unwrap());
        assert_eq!(floored.weekday(), chrono::Weekday::Mon);
    }

    quickcheck! {
        fn floor_is_idempotent(secs: i64, millis: u16, unit_index: usize) -> bool {
            let secs = secs % 4_000_000_000;
            let unit = UNITS[unit_index % UNITS.len()];
            let t = utc(secs) + TimeDelta::milliseconds(millis as i64);
            let once = floor(t, unit);
            floor(once, unit) == once && once <= t
        }
    }

    #[test]
    fn add_months_clamps_day() {
        let t = Utc.with_ymd_and_hms(2021, 1, 31, 10, 0, 0).unwrap();
        assert_eq!(
            add(t, 1, TimeUnit::Month),
            Utc.with_ymd_and_hms(2021, 2, 28, 10, 0, 0).unwrap()
        );
        assert_eq!(
            add(t, 13, TimeUnit::Month),
            Utc.with_ymd_and_hms(2022, 2, 28, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn add_months_crosses_year_boundaries() {
        let t = Utc.with_ymd_and_hms(2021, 11, 15, 0, 0, 0).unwrap();
        assert_eq!(
            add(t, 3, TimeUnit::Month),
            Utc.with_ymd_and_hms(2022, 2, 15, 0, 0, 0).unwrap()
        );
        assert_eq!(
            add(t, -12, TimeUnit::Month),
            Utc.with_ymd_and_hms(2020, 11, 15, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn add_fixed_units() {
        let t = utc(1_000_000);
        assert_eq!(add(t, 1, TimeUnit::Second), utc(1_000_001));
        assert_eq!(add(t, -2, TimeUnit::Minute), utc(999_880));
        assert_eq!(add(t, 1, TimeUnit::Week), utc(1_000_000 + 7 * 86_400));
    }
}
