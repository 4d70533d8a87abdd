//! Lightweight cron expression evaluator.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds), evaluated in UTC.
//! Field syntax: *, N, A-B, */S, A-B/S, N/S and comma lists of those.
//! Example: "0 2 1 * *" = 02:00 on the first day of every month.
//!
//! No cron crate dependency: the grammar the platform uses is small.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

/// How far the search walks before giving up (covers Feb 29 schedules).
const SEARCH_YEARS: i32 = 5;

/// A parsed five-field schedule. Each field is a bitmask of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    /// Parse an expression; the error names the offending field.
    pub fn parse(expression: &str) -> Result<Self, String> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(format!(
                "Invalid cron expression: '{expression}' (need 5 fields: MIN HOUR DOM MON DOW)"
            ));
        }

        let field = |idx: usize, name: &str, min: u32, max: u32| {
            parse_field(parts[idx], min, max)
                .ok_or_else(|| format!("Invalid {name} field '{}' in '{expression}'", parts[idx]))
        };

        let minutes = field(0, "minute", 0, 59)?;
        let hours = field(1, "hour", 0, 23)?;
        let days_of_month = field(2, "day-of-month", 1, 31)?;
        let months = field(3, "month", 1, 12)?;
        let mut days_of_week = field(4, "day-of-week", 0, 7)?;
        // 7 is an alias for Sunday
        if days_of_week & bit(7) != 0 {
            days_of_week = (days_of_week & !bit(7)) | bit(0);
        }

        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: !parts[2].starts_with('*'),
            dow_restricted: !parts[4].starts_with('*'),
        })
    }

    /// Whether the minute containing `at` is a scheduled minute.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.month_matches(at) && self.day_matches(at) && self.hour_matches(at) && self.minute_matches(at)
    }

    fn minute_matches(&self, at: DateTime<Utc>) -> bool {
        self.minutes & bit(at.minute()) != 0
    }

    fn hour_matches(&self, at: DateTime<Utc>) -> bool {
        self.hours & bit(at.hour()) != 0
    }

    fn month_matches(&self, at: DateTime<Utc>) -> bool {
        self.months & bit(at.month()) != 0
    }

    /// Classic cron rule: with both DOM and DOW restricted, either may match.
    fn day_matches(&self, at: DateTime<Utc>) -> bool {
        let dom = self.days_of_month & bit(at.day()) != 0;
        let dow = self.days_of_week & bit(at.weekday().num_days_from_sunday()) != 0;
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// First scheduled minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let limit = after.year() + SEARCH_YEARS;
        let mut candidate = truncate_to_minute(after) + Duration::minutes(1);

        while candidate.year() <= limit {
            if !self.month_matches(candidate) {
                candidate = start_of_next_month(candidate)?;
            } else if !self.day_matches(candidate) {
                candidate = start_of_day(candidate)? + Duration::days(1);
            } else if !self.hour_matches(candidate) {
                candidate = candidate.with_minute(0)? + Duration::hours(1);
            } else if !self.minute_matches(candidate) {
                candidate += Duration::minutes(1);
            } else {
                return Some(candidate);
            }
        }
        None
    }

    /// Latest scheduled minute at or before `at`.
    pub fn prev_at_or_before(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let limit = at.year() - SEARCH_YEARS;
        let mut candidate = truncate_to_minute(at);

        while candidate.year() >= limit {
            if !self.month_matches(candidate) {
                candidate = start_of_month(candidate)? - Duration::minutes(1);
            } else if !self.day_matches(candidate) {
                candidate = start_of_day(candidate)? - Duration::minutes(1);
            } else if !self.hour_matches(candidate) {
                candidate = candidate.with_minute(0)? - Duration::minutes(1);
            } else if !self.minute_matches(candidate) {
                candidate -= Duration::minutes(1);
            } else {
                return Some(candidate);
            }
        }
        None
    }
}

/// Whether the expression parses.
pub fn is_valid_cron(expression: &str) -> bool {
    CronSchedule::parse(expression).is_ok()
}

/// Compute the next run time after `after`.
pub fn next_run(expression: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match CronSchedule::parse(expression) {
        Ok(schedule) => schedule.next_after(after),
        Err(e) => {
            tracing::debug!("{e}");
            None
        }
    }
}

/// Compute the most recent due time at or before `at`.
pub fn prev_run(expression: &str, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match CronSchedule::parse(expression) {
        Ok(schedule) => schedule.prev_at_or_before(at),
        Err(e) => {
            tracing::debug!("{e}");
            None
        }
    }
}

/// Whether an automation is due on the tick happening at `now`.
///
/// The most recent due time must fall in `(now - tolerance, now]`. The window
/// is half-open so a ticker running every `tolerance` minutes fires each due
/// time exactly once. A tolerance of 0 is treated as 1 (exact minute).
/// Malformed expressions are never due.
pub fn should_run_now(expression: &str, tolerance_minutes: u32, now: DateTime<Utc>) -> bool {
    let Some(prev) = prev_run(expression, now) else {
        return false;
    };
    let window = Duration::minutes(i64::from(tolerance_minutes.max(1)));
    now - prev < window
}

/// Parse a cron field into a bitmask of matching values.
fn parse_field(field: &str, min: u32, max: u32) -> Option<u64> {
    let mut mask = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let n: u32 = step.parse().ok()?;
                if n == 0 {
                    return None;
                }
                (range, Some(n))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let a: u32 = a.parse().ok()?;
            let b: u32 = b.parse().ok()?;
            if a > b {
                return None;
            }
            (a, b)
        } else {
            let n: u32 = range.parse().ok()?;
            // "N/S" means from N to the end of the range
            if step.is_some() { (n, max) } else { (n, n) }
        };

        if lo < min || hi > max {
            return None;
        }
        for v in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
            mask |= bit(v);
        }
    }
    Some(mask)
}

fn bit(v: u32) -> u64 {
    1u64 << v
}

fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

fn start_of_day(at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(at.date_naive().and_hms_opt(0, 0, 0)?.and_utc())
}

fn start_of_month(at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(at.year(), at.month(), 1, 0, 0, 0).single()
}

fn start_of_next_month(at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if at.month() == 12 {
        (at.year() + 1, 1)
    } else {
        (at.year(), at.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_valid_expressions() {
        assert!(is_valid_cron("0 2 1 * *"));
        assert!(is_valid_cron("*/5 * * * *"));
        assert!(is_valid_cron("0 9 * * *"));
        assert!(is_valid_cron("0 0 * * 0"));
        assert!(is_valid_cron("15,45 8-18/2 * 1-6 1-5"));
        assert!(is_valid_cron("0 0 * * 7"));
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(!is_valid_cron("not a cron"));
        assert!(!is_valid_cron(""));
        assert!(!is_valid_cron("60 25 32 13 8"));
        assert!(!is_valid_cron("*/0 * * * *"));
        assert!(!is_valid_cron("5-1 * * * *"));
        assert!(!is_valid_cron("0 * * *"));
        assert!(!is_valid_cron("0 * 0 * *"));
    }

    #[test]
    fn test_every_hour() {
        let next = next_run("0 * * * *", at(2026, 2, 22, 10, 30)).unwrap();
        assert_eq!(next, at(2026, 2, 22, 11, 0));
    }

    #[test]
    fn test_specific_time() {
        let next = next_run("0 8 * * *", at(2026, 2, 22, 7, 0)).unwrap();
        assert_eq!(next, at(2026, 2, 22, 8, 0));
        // strictly after: an exact match moves to the next day
        let next = next_run("0 8 * * *", at(2026, 2, 22, 8, 0)).unwrap();
        assert_eq!(next, at(2026, 2, 23, 8, 0));
    }

    #[test]
    fn test_every_15_minutes() {
        let next = next_run("*/15 * * * *", at(2026, 2, 22, 10, 2)).unwrap();
        assert_eq!(next.minute(), 15);
    }

    #[test]
    fn test_monthly_billing_schedule() {
        let next = next_run("0 2 1 * *", at(2026, 2, 19, 10, 0)).unwrap();
        assert_eq!(next, at(2026, 3, 1, 2, 0));
        let next = next_run("0 2 1 * *", at(2026, 12, 5, 0, 0)).unwrap();
        assert_eq!(next, at(2027, 1, 1, 2, 0));
    }

    #[test]
    fn test_leap_day() {
        let next = next_run("0 0 29 2 *", at(2026, 3, 1, 0, 0)).unwrap();
        assert_eq!(next, at(2028, 2, 29, 0, 0));
    }

    #[test]
    fn test_dom_or_dow_rule() {
        // the 13th or any Friday; 2026-02-20 is a Friday
        let next = next_run("0 0 13 * 5", at(2026, 2, 14, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 2, 20, 0, 0));
        // Sunday given as 7; 2026-02-22 is a Sunday
        let next = next_run("30 6 * * 7", at(2026, 2, 19, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 2, 22, 6, 30));
    }

    #[test]
    fn test_prev_run() {
        let prev = prev_run("0 * * * *", at(2026, 2, 19, 10, 3)).unwrap();
        assert_eq!(prev, at(2026, 2, 19, 10, 0));
        // at-or-before includes the current minute
        let prev = prev_run("0 * * * *", at(2026, 2, 19, 10, 0)).unwrap();
        assert_eq!(prev, at(2026, 2, 19, 10, 0));
        let prev = prev_run("0 2 1 * *", at(2026, 2, 19, 10, 0)).unwrap();
        assert_eq!(prev, at(2026, 2, 1, 2, 0));
        let prev = prev_run("0 2 1 * *", at(2026, 1, 1, 1, 0)).unwrap();
        assert_eq!(prev, at(2025, 12, 1, 2, 0));
    }

    #[test]
    fn test_should_run_within_tolerance() {
        let now = Utc.with_ymd_and_hms(2026, 2, 19, 10, 3, 0).unwrap();
        assert!(should_run_now("0 * * * *", 5, now));
    }

    #[test]
    fn test_should_not_run_outside_tolerance() {
        let now = Utc.with_ymd_and_hms(2026, 2, 19, 9, 30, 0).unwrap();
        assert!(!should_run_now("0 * * * *", 5, now));
    }

    #[test]
    fn test_tolerance_window_is_half_open() {
        // ticks at 10:00 and 10:05 must not both fire a 10:00 schedule
        assert!(should_run_now("0 10 * * *", 5, at(2026, 2, 19, 10, 0)));
        assert!(!should_run_now("0 10 * * *", 5, at(2026, 2, 19, 10, 5)));
        let late = Utc.with_ymd_and_hms(2026, 2, 19, 10, 4, 59).unwrap();
        assert!(should_run_now("0 10 * * *", 5, late));
    }

    #[test]
    fn test_zero_tolerance_means_exact_minute() {
        assert!(should_run_now("0 10 * * *", 0, at(2026, 2, 19, 10, 0)));
        assert!(!should_run_now("0 10 * * *", 0, at(2026, 2, 19, 10, 1)));
    }

    #[test]
    fn test_invalid_expression_never_due() {
        assert!(!should_run_now("not valid", 5, Utc::now()));
        assert!(next_run("bad", Utc::now()).is_none());
    }
}
