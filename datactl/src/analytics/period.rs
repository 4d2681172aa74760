//! Calendar period resolution.
//!
//! A period is determined by a [`PeriodType`] and a reference instant: the
//! instant is truncated to the start of its containing day / ISO week /
//! calendar month / calendar year, and the end is the last millisecond of
//! that bucket. `period_end > period_start` holds by construction.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};

pub use crate::db::models::analytics::PeriodType;

/// A resolved `[start, end]` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub period_type: PeriodType,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Resolve the period containing `reference`.
pub fn resolve(period_type: PeriodType, reference: DateTime<Utc>) -> Period {
    let date = reference.date_naive();
    let (start_date, next_start_date) = match period_type {
        PeriodType::Daily => (date, date + Duration::days(1)),
        PeriodType::Weekly => {
            let monday = date - Duration::days(i64::from(date.weekday().num_days_from_monday()));
            (monday, monday + Duration::days(7))
        }
        PeriodType::Monthly => {
            let first = date.with_day(1).expect("day 1 exists in every month");
            (first, next_month(first))
        }
        PeriodType::Yearly => {
            let first = NaiveDate::from_ymd_opt(date.year(), 1, 1).expect("january 1st exists");
            let next = NaiveDate::from_ymd_opt(date.year() + 1, 1, 1).expect("january 1st exists");
            (first, next)
        }
    };

    let start = start_of_day(start_date);
    let end = start_of_day(next_start_date) - Duration::milliseconds(1);
    Period {
        period_type,
        start,
        end,
    }
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight exists"))
}

fn next_month(first_of_month: NaiveDate) -> NaiveDate {
    let (year, month) = if first_of_month.month() == 12 {
        (first_of_month.year() + 1, 1)
    } else {
        (first_of_month.year(), first_of_month.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).expect("first of month exists")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn daily_spans_the_calendar_day() {
        let period = resolve(PeriodType::Daily, at(2025, 3, 10, 14, 22));
        assert_eq!(period.start, at(2025, 3, 10, 0, 0));
        assert_eq!(period.end.to_rfc3339(), "2025-03-10T23:59:59.999+00:00");
        assert!(period.end > period.start);
    }

    #[test]
    fn weekly_starts_on_iso_monday() {
        // 2025-03-10 is a Monday.
        let period = resolve(PeriodType::Weekly, at(2025, 3, 12, 9, 0));
        assert_eq!(period.start, at(2025, 3, 10, 0, 0));
        assert_eq!(period.end.to_rfc3339(), "2025-03-16T23:59:59.999+00:00");

        // A Monday reference is its own week start.
        let monday = resolve(PeriodType::Weekly, at(2025, 3, 10, 0, 0));
        assert_eq!(monday.start, at(2025, 3, 10, 0, 0));
    }

    #[test]
    fn monthly_spans_the_whole_calendar_month() {
        let period = resolve(PeriodType::Monthly, at(2025, 3, 10, 14, 22));
        assert_eq!(period.start, at(2025, 3, 1, 0, 0));
        assert_eq!(period.end.to_rfc3339(), "2025-03-31T23:59:59.999+00:00");
    }

    #[test]
    fn monthly_handles_february_and_december() {
        let feb = resolve(PeriodType::Monthly, at(2024, 2, 15, 0, 0));
        assert_eq!(feb.end.to_rfc3339(), "2024-02-29T23:59:59.999+00:00");

        let dec = resolve(PeriodType::Monthly, at(2025, 12, 31, 23, 59));
        assert_eq!(dec.start, at(2025, 12, 1, 0, 0));
        assert_eq!(dec.end.to_rfc3339(), "2025-12-31T23:59:59.999+00:00");
    }

    #[test]
    fn yearly_spans_the_calendar_year() {
        let period = resolve(PeriodType::Yearly, at(2025, 7, 4, 12, 0));
        assert_eq!(period.start, at(2025, 1, 1, 0, 0));
        assert_eq!(period.end.to_rfc3339(), "2025-12-31T23:59:59.999+00:00");
    }
}
