// Cron schedule parsing and matching for scheduled workflows

//! # Cron Schedules
//!
//! Scheduled workflows carry a standard 5-field cron expression
//! (`minute hour day-of-month month day-of-week`). The scheduler loop polls
//! on a short interval and asks the parsed [`CronExpr`] whether the current
//! minute matches; a workflow fires at most once per matching minute.
//!
//! Supported field syntax: `*`, single values, lists (`1,15,30`), ranges
//! (`9-17`), and steps (`*/5`, `10-50/10`). Day-of-week accepts both 0 and 7
//! for Sunday. Invalid expressions are rejected when the workflow definition
//! is validated, before it ever reaches the scheduler.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One parsed cron field: the set of accepted values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CronField {
    values: BTreeSet<u32>,
}

impl CronField {
    fn parse(spec: &str, min: u32, max: u32) -> Result<Self, String> {
        let mut values = BTreeSet::new();
        for part in spec.split(',') {
            let (range_part, step) = match part.split_once('/') {
                Some((r, s)) => {
                    let step: u32 = s
                        .parse()
                        .map_err(|_| format!("invalid step '{}' in '{}'", s, spec))?;
                    if step == 0 {
                        return Err(format!("step must be positive in '{}'", spec));
                    }
                    (r, step)
                }
                None => (part, 1),
            };

            let (lo, hi) = if range_part == "*" {
                (min, max)
            } else if let Some((a, b)) = range_part.split_once('-') {
                let lo: u32 = a
                    .parse()
                    .map_err(|_| format!("invalid value '{}' in '{}'", a, spec))?;
                let hi: u32 = b
                    .parse()
                    .map_err(|_| format!("invalid value '{}' in '{}'", b, spec))?;
                (lo, hi)
            } else {
                let v: u32 = range_part
                    .parse()
                    .map_err(|_| format!("invalid value '{}' in '{}'", range_part, spec))?;
                (v, v)
            };

            if lo > hi {
                return Err(format!("inverted range '{}' in '{}'", range_part, spec));
            }
            if lo < min || hi > max {
                return Err(format!(
                    "value out of range {}-{} in '{}'",
                    min, max, spec
                ));
            }

            let mut v = lo;
            while v <= hi {
                values.insert(v);
                v += step;
            }
        }
        Ok(CronField { values })
    }

    fn matches(&self, value: u32) -> bool {
        self.values.contains(&value)
    }
}

/// A parsed 5-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronExpr {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronExpr {
    /// Parse a 5-field cron expression.
    pub fn parse(expr: &str) -> Result<Self, String> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(format!(
                "expected 5 cron fields, got {} in '{}'",
                fields.len(),
                expr
            ));
        }

        // Day-of-week allows 7 as an alias for Sunday; normalize after parse.
        let mut day_of_week = CronField::parse(fields[4], 0, 7)?;
        if day_of_week.values.remove(&7) {
            day_of_week.values.insert(0);
        }

        Ok(CronExpr {
            minute: CronField::parse(fields[0], 0, 59)?,
            hour: CronField::parse(fields[1], 0, 23)?,
            day_of_month: CronField::parse(fields[2], 1, 31)?,
            month: CronField::parse(fields[3], 1, 12)?,
            day_of_week,
        })
    }

    /// Whether this expression matches the given instant's minute.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.minute.matches(at.minute())
            && self.hour.matches(at.hour())
            && self.day_of_month.matches(at.day())
            && self.month.matches(at.month())
            && self.day_of_week.matches(at.weekday().num_days_from_sunday())
    }
}

/// Truncate a timestamp to its minute.
///
/// The scheduler uses this to fire a cron match at most once per minute:
/// a workflow whose `last_run_at` falls in the current minute is skipped.
pub fn minute_of(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_parse_rejects_malformed_expressions() {
        assert!(CronExpr::parse("").is_err());
        assert!(CronExpr::parse("* * * *").is_err());
        assert!(CronExpr::parse("60 * * * *").is_err());
        assert!(CronExpr::parse("* 24 * * *").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("5-1 * * * *").is_err());
        assert!(CronExpr::parse("abc * * * *").is_err());
    }

    #[test]
    fn test_daily_schedule_matches_only_its_minute() {
        let cron = CronExpr::parse("0 6 * * *").unwrap();
        assert!(cron.matches(at(2026, 8, 24, 6, 0)));
        assert!(!cron.matches(at(2026, 8, 24, 6, 1)));
        assert!(!cron.matches(at(2026, 8, 24, 7, 0)));
    }

    #[test]
    fn test_step_and_list_fields() {
        let cron = CronExpr::parse("*/15 9-17 * * 1,3,5").unwrap();
        // 2026-08-24 is a Monday
        assert!(cron.matches(at(2026, 8, 24, 9, 0)));
        assert!(cron.matches(at(2026, 8, 24, 17, 45)));
        assert!(!cron.matches(at(2026, 8, 24, 9, 7)));
        assert!(!cron.matches(at(2026, 8, 24, 8, 0)));
        // 2026-08-25 is a Tuesday
        assert!(!cron.matches(at(2026, 8, 25, 9, 0)));
    }

    #[test]
    fn test_sunday_aliases() {
        let zero = CronExpr::parse("0 0 * * 0").unwrap();
        let seven = CronExpr::parse("0 0 * * 7").unwrap();
        // 2026-08-23 is a Sunday
        assert!(zero.matches(at(2026, 8, 23, 0, 0)));
        assert!(seven.matches(at(2026, 8, 23, 0, 0)));
        assert_eq!(zero, seven);
    }

    #[test]
    fn test_minute_of_truncates() {
        let t = Utc.with_ymd_and_hms(2026, 8, 24, 6, 30, 45).unwrap();
        assert_eq!(minute_of(t), at(2026, 8, 24, 6, 30));
    }
}
