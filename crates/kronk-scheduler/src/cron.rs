//! 5-field cron evaluation (minute hour dom month dow), UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, Timelike, Utc};

use kronk_domain::{Error, Result};

/// Parse a cron field and check if a value matches.
fn field_matches(field: &str, value: u32) -> bool {
    if field == "*" {
        return true;
    }
    if let Some(step) = field.strip_prefix("*/") {
        if let Ok(n) = step.parse::<u32>() {
            return n > 0 && value % n == 0;
        }
    }
    for part in field.split(',') {
        if let Some((start_s, end_s)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start_s.parse::<u32>(), end_s.parse::<u32>()) {
                if value >= start && value <= end {
                    return true;
                }
            }
        } else if let Ok(n) = part.parse::<u32>() {
            if value == n {
                return true;
            }
        }
    }
    false
}

/// Validate a 5-field cron expression.
pub fn validate_cron(cron: &str) -> Result<()> {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(Error::invalid(format!(
            "cron: expected 5 fields (minute hour dom month dow), got {}",
            fields.len()
        )));
    }
    let names = ["minute", "hour", "day-of-month", "month", "day-of-week"];
    let ranges: [(u32, u32); 5] = [(0, 59), (0, 23), (1, 31), (1, 12), (0, 6)];
    for (i, field) in fields.iter().enumerate() {
        validate_field(field, names[i], ranges[i].0, ranges[i].1)?;
    }
    Ok(())
}

fn validate_field(field: &str, name: &str, min: u32, max: u32) -> Result<()> {
    if field == "*" {
        return Ok(());
    }
    if let Some(step) = field.strip_prefix("*/") {
        let n: u32 = step
            .parse()
            .map_err(|_| Error::invalid(format!("cron {name}: invalid step '*/{step}'")))?;
        if n == 0 || n > max {
            return Err(Error::invalid(format!(
                "cron {name}: step {n} out of range 1..={max}"
            )));
        }
        return Ok(());
    }
    for part in field.split(',') {
        if let Some((start_s, end_s)) = part.split_once('-') {
            let start: u32 = start_s
                .parse()
                .map_err(|_| Error::invalid(format!("cron {name}: invalid range start '{start_s}'")))?;
            let end: u32 = end_s
                .parse()
                .map_err(|_| Error::invalid(format!("cron {name}: invalid range end '{end_s}'")))?;
            if start < min || start > max || end < min || end > max {
                return Err(Error::invalid(format!(
                    "cron {name}: range {start}-{end} out of bounds {min}..={max}"
                )));
            }
            if start > end {
                return Err(Error::invalid(format!(
                    "cron {name}: range start {start} > end {end}"
                )));
            }
        } else {
            let n: u32 = part
                .parse()
                .map_err(|_| Error::invalid(format!("cron {name}: invalid value '{part}'")))?;
            if n < min || n > max {
                return Err(Error::invalid(format!(
                    "cron {name}: value {n} out of range {min}..={max}"
                )));
            }
        }
    }
    Ok(())
}

fn matches_naive(cron: &str, dt: &NaiveDateTime) -> bool {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    field_matches(fields[0], dt.minute())
        && field_matches(fields[1], dt.hour())
        && field_matches(fields[2], dt.day())
        && field_matches(fields[3], dt.month())
        && field_matches(fields[4], dt.weekday().num_days_from_sunday())
}

/// Does this UTC instant's minute match the expression?
pub fn cron_matches(cron: &str, dt: &DateTime<Utc>) -> bool {
    matches_naive(cron, &dt.naive_utc())
}

/// The next occurrence strictly after `after`, scanning minute by
/// minute, bounded at one year.
pub fn cron_next(cron: &str, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    let naive = after.naive_utc();
    let mut candidate = (naive + Duration::seconds(60 - i64::from(naive.second())))
        .with_second(0)
        .unwrap_or(naive);

    let max_checks = 366 * 24 * 60;
    for _ in 0..max_checks {
        if matches_naive(cron, &candidate) {
            return Some(DateTime::from_naive_utc_and_offset(candidate, Utc));
        }
        candidate += Duration::minutes(1);
    }
    None
}
