use crate::error::{LedgerError, Result};
use chrono::{Datelike, Days, Months, NaiveDate};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Day,
    Week,
    Month,
}

/// Adds `count` units to `date`. Month arithmetic rolls over year boundaries
/// and clamps the day to the last valid day of the target month.
pub fn add_calendar_interval(date: NaiveDate, unit: IntervalUnit, count: u32) -> Result<NaiveDate> {
    let shifted = match unit {
        IntervalUnit::Day => date.checked_add_days(Days::new(u64::from(count))),
        IntervalUnit::Week => date.checked_add_days(Days::new(u64::from(count) * 7)),
        IntervalUnit::Month => date.checked_add_months(Months::new(count)),
    };

    shifted.ok_or_else(|| {
        LedgerError::DateOutOfRange(format!("{} + {} {:?} overflows the calendar", date, count, unit))
    })
}

pub fn last_day_of_month(year: i32, month: u32) -> Result<NaiveDate> {
    let (next_year, next_month) = shift_month(year, month, 1)?;

    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.checked_sub_days(Days::new(1)))
        .ok_or_else(|| LedgerError::DateOutOfRange(format!("{}-{:02}", year, month)))
}

pub fn days_in_month(year: i32, month: u32) -> Result<u32> {
    Ok(last_day_of_month(year, month)?.day())
}

/// Moves a (year, month) pair by `delta` months, rolling the year over in
/// either direction. Months are 1-based.
pub fn shift_month(year: i32, month: u32, delta: i32) -> Result<(i32, u32)> {
    if !(1..=12).contains(&month) {
        return Err(LedgerError::InvalidMonth(month));
    }

    let index = i64::from(year) * 12 + i64::from(month) - 1 + i64::from(delta);
    let new_year = i32::try_from(index.div_euclid(12))
        .map_err(|_| LedgerError::DateOutOfRange(format!("{}-{:02} + {} months", year, month, delta)))?;
    let new_month = index.rem_euclid(12) as u32 + 1;

    Ok((new_year, new_month))
}

pub fn months_between(start: (i32, u32), end: (i32, u32)) -> i64 {
    let year_diff = i64::from(end.0) - i64::from(start.0);
    let month_diff = i64::from(end.1) - i64::from(start.1);
    year_diff * 12 + month_diff
}

/// True when `date` is strictly after `today`. Both are calendar days, so
/// time of day never participates.
pub fn is_future_date(date: NaiveDate, today: NaiveDate) -> bool {
    date > today
}

pub fn first_day_of_month(year: i32, month: u32) -> Result<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| LedgerError::DateOutOfRange(format!("{}-{:02}-01", year, month)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_add_months_clamps_to_month_end() {
        assert_eq!(
            add_calendar_interval(d(2024, 1, 31), IntervalUnit::Month, 1).unwrap(),
            d(2024, 2, 29)
        );
        assert_eq!(
            add_calendar_interval(d(2023, 1, 31), IntervalUnit::Month, 1).unwrap(),
            d(2023, 2, 28)
        );
        assert_eq!(
            add_calendar_interval(d(2024, 1, 31), IntervalUnit::Month, 2).unwrap(),
            d(2024, 3, 31)
        );
    }

    #[test]
    fn test_add_months_rolls_year() {
        assert_eq!(
            add_calendar_interval(d(2024, 11, 15), IntervalUnit::Month, 3).unwrap(),
            d(2025, 2, 15)
        );
        assert_eq!(
            add_calendar_interval(d(2024, 12, 31), IntervalUnit::Month, 14).unwrap(),
            d(2026, 2, 28)
        );
    }

    #[test]
    fn test_add_days_and_weeks() {
        assert_eq!(
            add_calendar_interval(d(2024, 12, 25), IntervalUnit::Day, 10).unwrap(),
            d(2025, 1, 4)
        );
        assert_eq!(
            add_calendar_interval(d(2024, 2, 22), IntervalUnit::Week, 1).unwrap(),
            d(2024, 2, 29)
        );
        assert_eq!(
            add_calendar_interval(d(2024, 2, 22), IntervalUnit::Day, 0).unwrap(),
            d(2024, 2, 22)
        );
    }

    #[test]
    fn test_last_day_of_month() {
        assert_eq!(last_day_of_month(2023, 2).unwrap(), d(2023, 2, 28));
        assert_eq!(last_day_of_month(2024, 2).unwrap(), d(2024, 2, 29));
        assert_eq!(last_day_of_month(2023, 12).unwrap(), d(2023, 12, 31));
        assert_eq!(days_in_month(2023, 4).unwrap(), 30);
        assert!(matches!(last_day_of_month(2023, 13), Err(LedgerError::InvalidMonth(13))));
    }

    #[test]
    fn test_shift_month_both_directions() {
        assert_eq!(shift_month(2024, 12, 1).unwrap(), (2025, 1));
        assert_eq!(shift_month(2024, 1, -1).unwrap(), (2023, 12));
        assert_eq!(shift_month(2024, 3, -15).unwrap(), (2022, 12));
        assert_eq!(months_between((2023, 11), (2024, 2)), 3);
    }

    #[test]
    fn test_is_future_date() {
        let today = d(2024, 6, 15);
        assert!(!is_future_date(d(2024, 6, 15), today));
        assert!(!is_future_date(d(2024, 6, 14), today));
        assert!(is_future_date(d(2024, 6, 16), today));
    }
}
