//! Five-field cron expressions.
//!
//! `minute hour day-of-month month day-of-week`, each field accepting `*`,
//! `*/n`, `a`, `a-b`, `a-b/n`, `a/n` and comma lists of those. Months and
//! weekdays also take three-letter names (`JAN`, `MON`); weekday `7` is
//! Sunday. When both day fields are restricted a time matches if *either*
//! does, as in Vixie cron. The `@hourly`, `@daily`/`@midnight`, `@weekly`,
//! `@monthly` and `@yearly`/`@annually` shorthands are accepted.

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::domain::TaskDefinition;
use crate::error::{Result, TaskError};

/// Decides whether a recurring definition fires at a given minute.
pub trait CronMatcher: Send + Sync {
    /// Reject expressions this matcher cannot evaluate.
    fn validate(&self, expression: &str) -> Result<()>;

    fn fires_at(&self, task: &TaskDefinition, at: DateTime<Utc>) -> bool;
}

/// The standard five-field matcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardCron;

impl CronMatcher for StandardCron {
    fn validate(&self, expression: &str) -> Result<()> {
        CronSchedule::parse(expression).map(|_| ())
    }

    fn fires_at(&self, task: &TaskDefinition, at: DateTime<Utc>) -> bool {
        task.cron_expression
            .as_deref()
            .and_then(|expr| CronSchedule::parse(expr).ok())
            .is_some_and(|schedule| schedule.matches(at))
    }
}

const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Bit set of allowed values for one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(self, value: u32) -> bool {
        value < 64 && self.0 & (1u64 << value) != 0
    }
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Offset of `names[0]`.
    names_base: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[], names_base: 0 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[], names_base: 0 };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[], names_base: 0 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12, names: &MONTHS, names_base: 1 };
// 7 is accepted and folded onto 0 (Sunday).
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 7, names: &WEEKDAYS, names_base: 0 };

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let expanded = match expression.trim() {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            other => other,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        let &[minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(invalid(
                expression,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        };

        let mut days_of_week = parse_field(expression, dow, &DAY_OF_WEEK)?;
        if days_of_week.contains(7) {
            days_of_week = FieldSet((days_of_week.0 | 1) & !(1u64 << 7));
        }

        Ok(Self {
            minutes: parse_field(expression, minute, &MINUTE)?,
            hours: parse_field(expression, hour, &HOUR)?,
            days_of_month: parse_field(expression, dom, &DAY_OF_MONTH)?,
            months: parse_field(expression, month, &MONTH)?,
            days_of_week,
            dom_restricted: !dom.starts_with('*'),
            dow_restricted: !dow.starts_with('*'),
        })
    }

    /// Whether the minute containing `at` is a firing minute.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        if !self.minutes.contains(at.minute())
            || !self.hours.contains(at.hour())
            || !self.months.contains(at.month())
        {
            return false;
        }

        let dom = self.days_of_month.contains(at.day());
        let dow = self.days_of_week.contains(at.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

fn invalid(expression: &str, reason: impl Into<String>) -> TaskError {
    TaskError::InvalidCron {
        expression: expression.to_string(),
        reason: reason.into(),
    }
}

fn parse_field(expression: &str, text: &str, spec: &FieldSpec) -> Result<FieldSet> {
    let mut set = 0u64;
    for item in text.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| invalid(expression, format!("bad step '{step}' in {} field", spec.name)))?;
                if step == 0 {
                    return Err(invalid(expression, format!("zero step in {} field", spec.name)));
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (value(expression, lo, spec)?, value(expression, hi, spec)?)
        } else {
            let start = value(expression, range, spec)?;
            // `a/n` runs from a to the end of the field.
            (start, if step.is_some() { spec.max } else { start })
        };

        if start > end {
            return Err(invalid(
                expression,
                format!("range {start}-{end} is backwards in {} field", spec.name),
            ));
        }

        let step = step.unwrap_or(1);
        let mut v = start;
        while v <= end {
            set |= 1u64 << v;
            match v.checked_add(step) {
                Some(next) => v = next,
                None => break,
            }
        }
    }
    Ok(FieldSet(set))
}

fn value(expression: &str, text: &str, spec: &FieldSpec) -> Result<u32> {
    let parsed = match text.parse::<u32>() {
        Ok(n) => Some(n),
        Err(_) => spec
            .names
            .iter()
            .position(|name| name.eq_ignore_ascii_case(text))
            .map(|i| i as u32 + spec.names_base),
    };

    match parsed {
        Some(n) if (spec.min..=spec.max).contains(&n) => Ok(n),
        Some(n) => Err(invalid(
            expression,
            format!("{n} is outside {}-{} in {} field", spec.min, spec.max, spec.name),
        )),
        None => Err(invalid(expression, format!("bad value '{text}' in {} field", spec.name))),
    }
}
