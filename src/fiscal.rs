use chrono::{DateTime, Datelike, NaiveDate, TimeZone};
use chrono_tz::Tz;

/// pure, total, timezone-aware fiscal calendar math (spec.md §3.7 / §4.2).
/// all functions take `start_month` in 1..=12 and a `Tz` used only to
/// project a `DateTime<Utc>` down to a local calendar date before these
/// pure functions run; the functions themselves never touch wall-clock
/// time.

/// the fiscal year containing `date`, named by its ending calendar year.
pub fn fiscal_year_of(date: NaiveDate, start_month: u32) -> i32 {
    debug_assert!((1..=12).contains(&start_month));
    if date.month() >= start_month {
        date.year() + 1
    } else {
        date.year()
    }
}

/// `[start, end)` calendar bounds of fiscal year `year`
pub fn fiscal_year_bounds(year: i32, start_month: u32) -> (NaiveDate, NaiveDate) {
    let start = NaiveDate::from_ymd_opt(year - 1, start_month, 1).expect("valid fiscal year start");
    let end = NaiveDate::from_ymd_opt(year, start_month, 1).expect("valid fiscal year end");
    (start, end)
}

/// calendar month/year for fiscal-month index `index` (0..=11) of fiscal year `year`
fn calendar_month_of_index(year: i32, index: u32, start_month: u32) -> (i32, u32) {
    debug_assert!(index < 12);
    let offset = (start_month - 1) + index;
    let calendar_month = offset % 12 + 1;
    let calendar_year = year - 1 + (offset / 12) as i32;
    (calendar_year, calendar_month)
}

/// due date for fiscal-month index `index` (0..=11) of fiscal year `year`:
/// the first day of the corresponding calendar month.
pub fn due_date_of_fiscal_month(year: i32, index: u32, start_month: u32) -> NaiveDate {
    let (calendar_year, calendar_month) = calendar_month_of_index(year, index, start_month);
    NaiveDate::from_ymd_opt(calendar_year, calendar_month, 1).expect("valid fiscal month date")
}

/// due date for fiscal quarter `q` (1..=4) of fiscal year `year`: the first
/// day of the quarter's first calendar month (fiscal-month index `3*(q-1)`).
pub fn due_date_of_fiscal_quarter(year: i32, q: u32, start_month: u32) -> NaiveDate {
    debug_assert!((1..=4).contains(&q));
    due_date_of_fiscal_month(year, 3 * (q - 1), start_month)
}

/// the fiscal-month index (0..=11) that `date` falls within, given its fiscal year
pub fn fiscal_month_index_of(date: NaiveDate, start_month: u32) -> u32 {
    let year = fiscal_year_of(date, start_month);
    for index in 0..12 {
        let (calendar_year, calendar_month) = calendar_month_of_index(year, index, start_month);
        if date.year() == calendar_year && date.month() == calendar_month {
            return index;
        }
    }
    unreachable!("every date falls within exactly one fiscal-month index of its fiscal year")
}

/// the fiscal quarter (1..=4) that `date` falls within
pub fn fiscal_quarter_of(date: NaiveDate, start_month: u32) -> u32 {
    fiscal_month_index_of(date, start_month) / 3 + 1
}

/// project a UTC instant down to a local calendar date in the configured timezone
pub fn local_date(instant: DateTime<chrono::Utc>, tz: Tz) -> NaiveDate {
    tz.from_utc_datetime(&instant.naive_utc()).date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiscal_year_named_by_ending_year() {
        // start month July: a date in July 2025 belongs to fiscal year 2026
        let d = NaiveDate::from_ymd_opt(2025, 7, 15).unwrap();
        assert_eq!(fiscal_year_of(d, 7), 2026);
        // a date in June 2025 belongs to fiscal year 2025
        let d = NaiveDate::from_ymd_opt(2025, 6, 15).unwrap();
        assert_eq!(fiscal_year_of(d, 7), 2025);
    }

    #[test]
    fn test_calendar_year_fiscal_year_is_identity() {
        let d = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        assert_eq!(fiscal_year_of(d, 1), 2026);
    }

    #[test]
    fn test_fiscal_year_bounds() {
        let (start, end) = fiscal_year_bounds(2026, 7);
        assert_eq!(start, NaiveDate::from_ymd_opt(2025, 7, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2026, 7, 1).unwrap());
    }

    #[test]
    fn test_due_date_of_fiscal_month_wraps_year() {
        // fiscal year 2026, start month 7: index 0 -> 2025-07, index 5 -> 2025-12, index 6 -> 2026-01
        assert_eq!(due_date_of_fiscal_month(2026, 0, 7), NaiveDate::from_ymd_opt(2025, 7, 1).unwrap());
        assert_eq!(due_date_of_fiscal_month(2026, 5, 7), NaiveDate::from_ymd_opt(2025, 12, 1).unwrap());
        assert_eq!(due_date_of_fiscal_month(2026, 6, 7), NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());
        assert_eq!(due_date_of_fiscal_month(2026, 11, 7), NaiveDate::from_ymd_opt(2026, 6, 1).unwrap());
    }

    #[test]
    fn test_due_date_of_fiscal_quarter() {
        assert_eq!(due_date_of_fiscal_quarter(2026, 1, 7), NaiveDate::from_ymd_opt(2025, 7, 1).unwrap());
        assert_eq!(due_date_of_fiscal_quarter(2026, 2, 7), NaiveDate::from_ymd_opt(2025, 10, 1).unwrap());
        assert_eq!(due_date_of_fiscal_quarter(2026, 3, 7), NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());
        assert_eq!(due_date_of_fiscal_quarter(2026, 4, 7), NaiveDate::from_ymd_opt(2026, 4, 1).unwrap());
    }

    #[test]
    fn test_fiscal_month_index_roundtrip() {
        for index in 0..12u32 {
            let due = due_date_of_fiscal_month(2026, index, 7);
            assert_eq!(fiscal_month_index_of(due, 7), index);
        }
    }

    #[test]
    fn test_fiscal_quarter_of_matches_due_dates() {
        let q2_start = due_date_of_fiscal_quarter(2026, 2, 7);
        assert_eq!(fiscal_quarter_of(q2_start, 7), 2);
    }

    #[test]
    fn test_january_start_month_fiscal_year_is_calendar_year_plus_one() {
        // start month 1: fiscal year N spans [N-1 -01-01, N-01-01), exactly
        // calendar year N-1, so every date in calendar year Y is in fiscal year Y+1
        let d = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        assert_eq!(fiscal_year_of(d, 1), 2027);
        assert_eq!(due_date_of_fiscal_month(2027, 0, 1), d);
    }
}
