//! Cron expression parser and next-fire-time evaluator.
//!
//! Supports the classic 5-field form `MIN HOUR DOM MON DOW` and a 6-field
//! form with a leading seconds field. Per field: `*`, `N`, `A-B`, `*/S`,
//! `A-B/S`, `N/S` and comma-separated lists of those. Months accept
//! `JAN`..`DEC`, weekdays `SUN`..`SAT`; weekday `0` and `7` are both Sunday.
//! `?` is accepted as a synonym of `*` in the day fields, and the usual
//! `@daily`-style macros are expanded.
//!
//! When both day-of-month and day-of-week are restricted, a day matches if
//! *either* matches (Vixie cron semantics).
//!
//! All evaluation is in UTC and side-effect free.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};

use crate::EngineError;

/// How far ahead [`CronSchedule::next_after`] searches before giving up.
const SEARCH_YEARS: i32 = 5;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Compute the earliest instant strictly after `after` matching `expression`.
///
/// # Errors
/// [`EngineError::InvalidCronExpression`] for malformed expressions and for
/// expressions that never fire (e.g. `0 0 30 2 *`).
pub fn next_fire_time(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, EngineError> {
    CronSchedule::parse(expression)?.next_after(after)
}

// ---------------------------------------------------------------------------
// Field bit sets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BitSet(u64);

impl BitSet {
    fn contains(&self, v: u32) -> bool {
        v < 64 && self.0 & (1u64 << v) != 0
    }

    fn insert(&mut self, v: u32) {
        self.0 |= 1u64 << v;
    }
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: Option<&'static [&'static str]>,
    /// Offset added to a name's index to get its value.
    name_base: u32,
}

const SECOND: FieldSpec = FieldSpec { name: "second", min: 0, max: 59, names: None, name_base: 0 };
const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: None, name_base: 0 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: None, name_base: 0 };
const DAY_OF_MONTH: FieldSpec =
    FieldSpec { name: "day-of-month", min: 1, max: 31, names: None, name_base: 0 };
const MONTH: FieldSpec =
    FieldSpec { name: "month", min: 1, max: 12, names: Some(&MONTH_NAMES), name_base: 1 };
// 7 is accepted and folded onto 0 after parsing.
const DAY_OF_WEEK: FieldSpec =
    FieldSpec { name: "day-of-week", min: 0, max: 7, names: Some(&WEEKDAY_NAMES), name_base: 0 };

fn parse_value(raw: &str, spec: &FieldSpec) -> Result<u32, String> {
    if let Some(names) = spec.names {
        let upper = raw.to_ascii_uppercase();
        if let Some(idx) = names.iter().position(|n| *n == upper) {
            return Ok(idx as u32 + spec.name_base);
        }
    }
    let value: u32 = raw
        .parse()
        .map_err(|_| format!("'{raw}' is not a valid {} value", spec.name))?;
    if value < spec.min || value > spec.max {
        return Err(format!(
            "{} value {value} out of range {}-{}",
            spec.name, spec.min, spec.max
        ));
    }
    Ok(value)
}

/// Parse one field into its set of allowed values.
fn parse_field(field: &str, spec: &FieldSpec) -> Result<BitSet, String> {
    let mut set = BitSet(0);

    for part in field.split(',') {
        if part.is_empty() {
            return Err(format!("empty list element in {} field '{field}'", spec.name));
        }

        let (base, step) = match part.split_once('/') {
            Some((base, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}' in {} field", spec.name))?;
                if step == 0 {
                    return Err(format!("step of zero in {} field", spec.name));
                }
                (base, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if base == "*" || base == "?" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = base.split_once('-') {
            let (a, b) = (parse_value(a, spec)?, parse_value(b, spec)?);
            if a > b {
                return Err(format!("descending range '{base}' in {} field", spec.name));
            }
            (a, b)
        } else {
            let v = parse_value(base, spec)?;
            // `N/S` means "from N to the end, every S".
            if step.is_some() { (v, spec.max) } else { (v, v) }
        };

        let step = step.unwrap_or(1) as usize;
        for v in (start..=end).step_by(step) {
            set.insert(v);
        }
    }

    Ok(set)
}

fn expand_macro(expression: &str) -> Result<&str, String> {
    Ok(match expression {
        "@yearly" | "@annually" => "0 0 1 1 *",
        "@monthly" => "0 0 1 * *",
        "@weekly" => "0 0 * * 0",
        "@daily" | "@midnight" => "0 0 * * *",
        "@hourly" => "0 * * * *",
        other if other.starts_with('@') => return Err(format!("unsupported macro '{other}'")),
        other => other,
    })
}

// ---------------------------------------------------------------------------
// CronSchedule
// ---------------------------------------------------------------------------

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    seconds: BitSet,
    minutes: BitSet,
    hours: BitSet,
    days_of_month: BitSet,
    months: BitSet,
    days_of_week: BitSet,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    /// # Errors
    /// [`EngineError::InvalidCronExpression`] describing the first bad field.
    pub fn parse(expression: &str) -> Result<Self, EngineError> {
        let trimmed = expression.trim();
        let expanded = expand_macro(trimmed).map_err(|e| EngineError::cron(expression, e))?;
        let fields: Vec<&str> = expanded.split_whitespace().collect();

        let (sec, rest) = match fields.len() {
            5 => ("0", &fields[..]),
            6 => (fields[0], &fields[1..]),
            n => {
                return Err(EngineError::cron(
                    expression,
                    format!("expected 5 or 6 fields, found {n}"),
                ))
            }
        };

        let parse = |f: &str, spec: &FieldSpec| {
            parse_field(f, spec).map_err(|e| EngineError::cron(expression, e))
        };

        let mut days_of_week = parse(rest[4], &DAY_OF_WEEK)?;
        if days_of_week.contains(7) {
            days_of_week.insert(0);
            days_of_week.0 &= !(1u64 << 7);
        }

        let restricted = |f: &str| !(f.starts_with('*') || f.starts_with('?'));

        Ok(Self {
            expression: trimmed.to_string(),
            seconds: parse(sec, &SECOND)?,
            minutes: parse(rest[0], &MINUTE)?,
            hours: parse(rest[1], &HOUR)?,
            days_of_month: parse(rest[2], &DAY_OF_MONTH)?,
            months: parse(rest[3], &MONTH)?,
            days_of_week,
            dom_restricted: restricted(rest[2]),
            dow_restricted: restricted(rest[4]),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self.days_of_week.contains(date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// Whether `t` (to the second) satisfies every field.
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.months.contains(t.month())
            && self.day_matches(t.date_naive())
            && self.hours.contains(t.hour())
            && self.minutes.contains(t.minute())
            && self.seconds.contains(t.second())
    }

    /// The earliest matching instant strictly after `after`.
    ///
    /// # Errors
    /// [`EngineError::InvalidCronExpression`] if nothing matches within the
    /// search horizon.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, EngineError> {
        let never = || EngineError::cron(&self.expression, "expression never fires");

        let start = after.naive_utc().with_nanosecond(0).ok_or_else(never)? + Duration::seconds(1);
        let limit = start.year() + SEARCH_YEARS;
        let mut t: NaiveDateTime = start;

        loop {
            if t.year() > limit {
                return Err(never());
            }

            if !self.months.contains(t.month()) {
                let (y, m) = if t.month() == 12 { (t.year() + 1, 1) } else { (t.year(), t.month() + 1) };
                t = NaiveDate::from_ymd_opt(y, m, 1)
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .ok_or_else(never)?;
                continue;
            }

            if !self.day_matches(t.date()) {
                t = t
                    .date()
                    .succ_opt()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .ok_or_else(never)?;
                continue;
            }

            if !self.hours.contains(t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0).ok_or_else(never)? + Duration::hours(1);
                continue;
            }

            if !self.minutes.contains(t.minute()) {
                t = t.date().and_hms_opt(t.hour(), t.minute(), 0).ok_or_else(never)?
                    + Duration::minutes(1);
                continue;
            }

            if !self.seconds.contains(t.second()) {
                t += Duration::seconds(1);
                continue;
            }

            return Ok(Utc.from_utc_datetime(&t));
        }
    }
}

impl FromStr for CronSchedule {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}
