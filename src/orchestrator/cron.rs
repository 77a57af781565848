//! Cron expression handling.
//!
//! Schedules are written in the usual five-field form
//! (`minute hour day-of-month month day-of-week`, Sunday = 0 or 7). The
//! `cron` crate wants a leading seconds field and numbers weekdays from
//! Sunday = 1, so expressions are normalised before parsing.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

const WEEKDAYS: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

/// Rewrite a five-field expression into the crate's six-field dialect.
///
/// Expressions that already carry six or seven fields pass through as-is.
pub fn normalize(expr: &str) -> Result<String, String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => {
            let dow = normalize_weekdays(fields[4])?;
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], dow
            ))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(format!("expected 5 fields, got {n}")),
    }
}

/// Map numeric weekdays to names so `1` keeps meaning Monday.
///
/// Step values after `/` are counts, not weekdays, and stay numeric.
fn normalize_weekdays(field: &str) -> Result<String, String> {
    let items: Result<Vec<String>, String> = field
        .split(',')
        .map(|item| {
            let (base, step) = match item.split_once('/') {
                Some((base, step)) => (base, Some(step)),
                None => (item, None),
            };
            let base: Result<Vec<String>, String> = base
                .split('-')
                .map(|part| match part.parse::<usize>() {
                    Ok(n) if n < WEEKDAYS.len() => Ok(WEEKDAYS[n].to_string()),
                    Ok(n) => Err(format!("day of week {n} out of range")),
                    Err(_) => Ok(part.to_string()),
                })
                .collect();
            let base = base?.join("-");
            Ok(match step {
                Some(step) => format!("{base}/{step}"),
                None => base,
            })
        })
        .collect();
    Ok(items?.join(","))
}

/// Parse and validate an expression.
pub fn parse_schedule(expr: &str) -> Result<Schedule, String> {
    let normalized = normalize(expr)?;
    Schedule::from_str(&normalized).map_err(|e| format!("invalid cron: {e}"))
}

/// First fire time strictly after `after`, or `None` if the schedule never fires again.
pub fn next_run_after(expr: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, String> {
    let schedule = parse_schedule(expr)?;
    Ok(schedule.after(&after).next())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn five_fields_get_seconds() {
        assert_eq!(normalize("*/5 * * * *").unwrap(), "0 */5 * * * *");
    }

    #[test]
    fn six_fields_pass_through() {
        assert_eq!(normalize("30 */5 * * * *").unwrap(), "30 */5 * * * *");
    }

    #[test]
    fn wrong_field_count_rejected() {
        assert!(normalize("* * *").is_err());
        assert!(parse_schedule("").is_err());
    }

    #[test]
    fn weekday_numbers_become_names() {
        assert_eq!(normalize("0 9 * * 1-5").unwrap(), "0 0 9 * * MON-FRI");
        assert_eq!(normalize("0 9 * * 0,7").unwrap(), "0 0 9 * * SUN,SUN");
        assert_eq!(normalize("0 9 * * */2").unwrap(), "0 0 9 * * */2");
        assert_eq!(normalize("0 9 * * MON").unwrap(), "0 0 9 * * MON");
        assert!(normalize("0 9 * * 8").is_err());
    }

    #[test]
    fn next_five_minute_boundary() {
        let t0 = at("2026-03-01T10:02:30Z");
        let next = next_run_after("*/5 * * * *", t0).unwrap().unwrap();
        assert_eq!(next, at("2026-03-01T10:05:00Z"));
    }

    #[test]
    fn next_is_strictly_after() {
        let t0 = at("2026-03-01T10:05:00Z");
        let next = next_run_after("*/5 * * * *", t0).unwrap().unwrap();
        assert_eq!(next, at("2026-03-01T10:10:00Z"));
    }

    #[test]
    fn monday_means_monday() {
        // 2026-03-01 is a Sunday.
        let t0 = at("2026-03-01T12:00:00Z");
        let next = next_run_after("0 9 * * 1", t0).unwrap().unwrap();
        assert_eq!(next, at("2026-03-02T09:00:00Z"));
    }

    #[test]
    fn invalid_expression_is_error() {
        assert!(next_run_after("61 * * * *", Utc::now()).is_err());
        assert!(next_run_after("not a cron", Utc::now()).is_err());
    }
}
