//! A-share trading calendar.
//!
//! A trading day is a weekday that is not a statutory holiday. Holiday sets
//! are compiled per year; the DB-backed variant infers trading days from
//! quote coverage instead.

use chrono::{Datelike, Duration, Local, NaiveDate, Weekday};
use lazy_static::lazy_static;
use std::collections::HashSet;
use tracing::warn;

use crate::core::errors::DatacenterError;
use crate::persistence::ConfigurablePersistence;

fn d(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid holiday date")
}

lazy_static! {
    static ref HOLIDAYS_2024: Vec<NaiveDate> = vec![
        d(2024, 1, 1),
        d(2024, 2, 10), d(2024, 2, 11), d(2024, 2, 12), d(2024, 2, 13),
        d(2024, 2, 14), d(2024, 2, 15), d(2024, 2, 16), d(2024, 2, 17),
        d(2024, 4, 4), d(2024, 4, 5), d(2024, 4, 6),
        d(2024, 5, 1), d(2024, 5, 2), d(2024, 5, 3), d(2024, 5, 4), d(2024, 5, 5),
        d(2024, 6, 10),
        d(2024, 9, 15), d(2024, 9, 16), d(2024, 9, 17),
        d(2024, 10, 1), d(2024, 10, 2), d(2024, 10, 3), d(2024, 10, 4), d(2024, 10, 7),
    ];
    static ref HOLIDAYS_2025: Vec<NaiveDate> = vec![
        d(2025, 1, 1),
        d(2025, 1, 28), d(2025, 1, 29), d(2025, 1, 30), d(2025, 1, 31),
        d(2025, 2, 1), d(2025, 2, 2), d(2025, 2, 3), d(2025, 2, 4),
        d(2025, 4, 4), d(2025, 4, 5), d(2025, 4, 6),
        d(2025, 5, 1), d(2025, 5, 2), d(2025, 5, 3), d(2025, 5, 4), d(2025, 5, 5),
        d(2025, 5, 31), d(2025, 6, 1), d(2025, 6, 2),
        d(2025, 10, 1), d(2025, 10, 2), d(2025, 10, 3), d(2025, 10, 4),
        d(2025, 10, 5), d(2025, 10, 6), d(2025, 10, 7), d(2025, 10, 8),
    ];
    static ref HOLIDAYS_2026: Vec<NaiveDate> = vec![
        d(2026, 1, 1), d(2026, 1, 2), d(2026, 1, 3),
        d(2026, 2, 16), d(2026, 2, 17), d(2026, 2, 18), d(2026, 2, 19), d(2026, 2, 20),
        d(2026, 4, 5), d(2026, 4, 6), d(2026, 4, 7),
        d(2026, 5, 1), d(2026, 5, 2), d(2026, 5, 3), d(2026, 5, 4), d(2026, 5, 5),
        d(2026, 6, 19), d(2026, 6, 20), d(2026, 6, 21),
        d(2026, 10, 1), d(2026, 10, 2), d(2026, 10, 3), d(2026, 10, 4),
        d(2026, 10, 5), d(2026, 10, 6), d(2026, 10, 7), d(2026, 10, 8),
    ];
    static ref ALL_HOLIDAYS: HashSet<NaiveDate> = HOLIDAYS_2024
        .iter()
        .chain(HOLIDAYS_2025.iter())
        .chain(HOLIDAYS_2026.iter())
        .copied()
        .collect();
}

/// Bounded scan window for previous/next lookups.
const MAX_SCAN_DAYS: u32 = 30;

/// Trading calendar with an optional extra holiday set (used for markets or
/// tests that need their own closures).
#[derive(Debug, Clone, Default)]
pub struct TradingCalendar {
    extra_holidays: HashSet<NaiveDate>,
}

impl TradingCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_holidays(holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            extra_holidays: holidays.into_iter().collect(),
        }
    }

    pub fn is_weekend(&self, date: NaiveDate) -> bool {
        matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        ALL_HOLIDAYS.contains(&date) || self.extra_holidays.contains(&date)
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !self.is_weekend(date) && !self.is_holiday(date)
    }

    /// Today if it trades, otherwise the most recent trading day before it.
    pub fn latest_trading_day(&self, date: Option<NaiveDate>) -> NaiveDate {
        let date = date.unwrap_or_else(today);
        if self.is_trading_day(date) {
            date
        } else {
            self.previous_trading_day(Some(date))
        }
    }

    /// Nearest trading day strictly before `date` (bounded lookback).
    pub fn previous_trading_day(&self, date: Option<NaiveDate>) -> NaiveDate {
        let date = date.unwrap_or_else(today);
        let mut current = date;
        for _ in 0..MAX_SCAN_DAYS {
            current -= Duration::days(1);
            if self.is_trading_day(current) {
                return current;
            }
        }
        warn!("no trading day found in the {MAX_SCAN_DAYS} days before {date}");
        current
    }

    /// Nearest trading day strictly after `date` (bounded lookahead).
    pub fn next_trading_day(&self, date: Option<NaiveDate>) -> NaiveDate {
        let date = date.unwrap_or_else(today);
        let mut current = date;
        for _ in 0..MAX_SCAN_DAYS {
            current += Duration::days(1);
            if self.is_trading_day(current) {
                return current;
            }
        }
        warn!("no trading day found in the {MAX_SCAN_DAYS} days after {date}");
        current
    }

    /// All trading days in `[start, end]`, ascending.
    pub fn trading_days_between(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        let mut days = Vec::new();
        let mut current = start;
        while current <= end {
            if self.is_trading_day(current) {
                days.push(current);
            }
            current += Duration::days(1);
        }
        days
    }

    /// The most recent `count` trading days up to and including `end`,
    /// ascending.
    pub fn recent_trading_days(&self, count: usize, end: Option<NaiveDate>) -> Vec<NaiveDate> {
        let mut days = Vec::with_capacity(count);
        let mut current = end.unwrap_or_else(today);
        while days.len() < count {
            if self.is_trading_day(current) {
                days.push(current);
            }
            current -= Duration::days(1);
        }
        days.reverse();
        days
    }

    /// Trading days inferred from stored quotes: a date counts only when at
    /// least `min_symbols` distinct codes reported for it.
    pub fn trading_days_from_db(
        &self,
        persistence: &ConfigurablePersistence,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        min_symbols: u32,
    ) -> Result<Vec<NaiveDate>, DatacenterError> {
        persistence.quote_trading_days(start, end, min_symbols)
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calendar() -> TradingCalendar {
        TradingCalendar::new()
    }

    #[test]
    fn weekends_never_trade() {
        let cal = calendar();
        assert!(cal.is_weekend(d(2024, 10, 5))); // Saturday
        assert!(cal.is_weekend(d(2024, 10, 6))); // Sunday
        assert!(!cal.is_weekend(d(2024, 10, 7))); // Monday (holiday, not weekend)
        assert!(!cal.is_trading_day(d(2024, 10, 5)));
    }

    #[test]
    fn trading_day_excludes_weekends_and_holidays() {
        let cal = calendar();
        assert!(cal.is_holiday(d(2024, 10, 1)));
        assert!(!cal.is_trading_day(d(2024, 10, 1)));
        assert!(cal.is_trading_day(d(2024, 9, 30))); // Monday before golden week
        for day in cal.trading_days_between(d(2024, 1, 1), d(2024, 12, 31)) {
            assert!(!cal.is_weekend(day));
            assert!(!cal.is_holiday(day));
        }
    }

    #[test]
    fn latest_trading_day_skips_the_holiday_week() {
        let cal = calendar();
        // 2024-10-05 is a Saturday inside the national holiday week; the
        // last session before it was Monday 2024-09-30.
        assert_eq!(cal.latest_trading_day(Some(d(2024, 10, 5))), d(2024, 9, 30));
        // A trading day is its own latest.
        assert_eq!(cal.latest_trading_day(Some(d(2024, 9, 30))), d(2024, 9, 30));
    }

    #[test]
    fn trading_days_between_spans_the_holiday_gap() {
        let cal = calendar();
        assert_eq!(
            cal.trading_days_between(d(2024, 9, 27), d(2024, 10, 8)),
            vec![d(2024, 9, 27), d(2024, 9, 30), d(2024, 10, 8)]
        );
    }

    #[test]
    fn previous_and_next_are_strict_and_trading() {
        let cal = calendar();
        let prev = cal.previous_trading_day(Some(d(2024, 10, 8)));
        assert_eq!(prev, d(2024, 9, 30));
        assert!(prev < d(2024, 10, 8));
        assert!(cal.is_trading_day(prev));

        let next = cal.next_trading_day(Some(d(2024, 9, 30)));
        assert_eq!(next, d(2024, 10, 8));
        assert!(cal.is_trading_day(next));
    }

    #[test]
    fn between_is_strictly_increasing() {
        let cal = calendar();
        let days = cal.trading_days_between(d(2024, 9, 1), d(2024, 10, 31));
        for pair in days.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn recent_trading_days_ascending() {
        let cal = calendar();
        let days = cal.recent_trading_days(3, Some(d(2024, 10, 8)));
        assert_eq!(days, vec![d(2024, 9, 27), d(2024, 9, 30), d(2024, 10, 8)]);
    }

    #[test]
    fn extra_holidays_are_respected() {
        let cal = TradingCalendar::with_holidays([d(2024, 6, 3)]);
        assert!(!cal.is_trading_day(d(2024, 6, 3)));
        assert_eq!(cal.latest_trading_day(Some(d(2024, 6, 3))), d(2024, 5, 31));
    }
}
