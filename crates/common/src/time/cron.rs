//! Cron expression parsing and evaluation
//!
//! Supports the standard five-field format `minute hour day-of-month month
//! day-of-week` with `*`, comma lists, `a-b` ranges, `*/n` and `a-b/n` steps,
//! and three-letter month/day names. Each field resolves to either "all" or a
//! sorted, deduplicated set of values.
//!
//! Named macros (`@hourly`, `@daily`, ...) expand to their canonical
//! expressions. `@reboot` is not a cron expression; callers check
//! [`is_reboot_macro`] before parsing.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Marker for "run once at process start"
pub const REBOOT_MACRO: &str = "@reboot";

const MONTH_NAMES: [&str; 12] =
    ["jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec"];
const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Error type for cron parsing
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CronParseError {
    /// The text does not split into exactly five fields (or is an unknown
    /// macro)
    #[error("Invalid cron expression: {0}")]
    InvalidExpression(String),

    /// A field's tokens fall outside the valid range or are not integers
    #[error("Invalid {field} field: {raw}")]
    InvalidField { field: CronFieldKind, raw: String },
}

/// Which of the five cron fields an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronFieldKind {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl CronFieldKind {
    fn bounds(self) -> (u32, u32) {
        match self {
            Self::Minute => (0, 59),
            Self::Hour => (0, 23),
            Self::DayOfMonth => (1, 31),
            Self::Month => (1, 12),
            Self::DayOfWeek => (0, 6),
        }
    }

    fn names(self) -> &'static [&'static str] {
        match self {
            Self::Month => &MONTH_NAMES,
            Self::DayOfWeek => &DAY_NAMES,
            _ => &[],
        }
    }

    /// Value the first name maps to (`jan` is 1, `sun` is 0)
    fn name_offset(self) -> u32 {
        match self {
            Self::Month => 1,
            _ => 0,
        }
    }
}

impl fmt::Display for CronFieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::DayOfMonth => "day_of_month",
            Self::Month => "month",
            Self::DayOfWeek => "day_of_week",
        };
        f.write_str(name)
    }
}

/// Resolved values of one cron field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValues {
    /// `*`: every value in range
    All,
    /// Sorted, deduplicated explicit values
    Values(Vec<u32>),
}

impl FieldValues {
    /// Whether `value` is selected by this field
    pub fn contains(&self, value: u32) -> bool {
        match self {
            Self::All => true,
            Self::Values(values) => values.binary_search(&value).is_ok(),
        }
    }

    /// Whether the field is restricted (anything other than `*`)
    pub fn is_restricted(&self) -> bool {
        matches!(self, Self::Values(_))
    }
}

/// Returns the canonical expression for a named macro
pub fn expand_macro(text: &str) -> Option<&'static str> {
    match text.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => Some("0 0 1 1 *"),
        "@monthly" => Some("0 0 1 * *"),
        "@weekly" => Some("0 0 * * 0"),
        "@daily" | "@midnight" => Some("0 0 * * *"),
        "@hourly" => Some("0 * * * *"),
        _ => None,
    }
}

/// Whether the text is the `@reboot` marker
pub fn is_reboot_macro(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case(REBOOT_MACRO)
}

/// A parsed cron expression
///
/// Immutable once parsed. `Display` yields the original text.
///
/// # Examples
///
/// ```
/// use cadence_common::time::cron::CronExpression;
///
/// let cron = CronExpression::parse("*/15 9-17 * * MON-FRI").unwrap();
/// assert_eq!(cron.to_string(), "*/15 9-17 * * MON-FRI");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    minute: FieldValues,
    hour: FieldValues,
    day_of_month: FieldValues,
    month: FieldValues,
    day_of_week: FieldValues,
    source: String,
}

impl CronExpression {
    /// Parse a cron expression (or named macro) from a string
    pub fn parse(expr: &str) -> Result<Self, CronParseError> {
        let source = expr.trim();
        let body = if source.starts_with('@') {
            expand_macro(source)
                .ok_or_else(|| CronParseError::InvalidExpression(source.to_string()))?
        } else {
            source
        };

        let parts: Vec<&str> = body.split_whitespace().collect();
        let [minute, hour, day_of_month, month, day_of_week] = parts.as_slice() else {
            return Err(CronParseError::InvalidExpression(source.to_string()));
        };

        Ok(Self {
            minute: parse_field(minute, CronFieldKind::Minute)?,
            hour: parse_field(hour, CronFieldKind::Hour)?,
            day_of_month: parse_field(day_of_month, CronFieldKind::DayOfMonth)?,
            month: parse_field(month, CronFieldKind::Month)?,
            day_of_week: parse_field(day_of_week, CronFieldKind::DayOfWeek)?,
            source: source.to_string(),
        })
    }

    /// Minute field
    pub fn minute(&self) -> &FieldValues {
        &self.minute
    }

    /// Hour field
    pub fn hour(&self) -> &FieldValues {
        &self.hour
    }

    /// Day-of-month field
    pub fn day_of_month(&self) -> &FieldValues {
        &self.day_of_month
    }

    /// Month field
    pub fn month(&self) -> &FieldValues {
        &self.month
    }

    /// Day-of-week field (0 = Sunday)
    pub fn day_of_week(&self) -> &FieldValues {
        &self.day_of_week
    }

    /// Check whether a (local) timestamp matches this expression
    ///
    /// When both day-of-month and day-of-week are restricted, either one
    /// matching is enough (POSIX cron semantics).
    pub fn matches<T: Datelike + Timelike>(&self, dt: &T) -> bool {
        self.minute.contains(dt.minute())
            && self.hour.contains(dt.hour())
            && self.month.contains(dt.month())
            && self.day_matches(dt)
    }

    /// Day check alone, combining day-of-month and day-of-week
    pub fn day_matches<T: Datelike>(&self, dt: &T) -> bool {
        let dom = self.day_of_month.contains(dt.day());
        let dow = self.day_of_week.contains(dt.weekday().num_days_from_sunday());

        match (self.day_of_month.is_restricted(), self.day_of_week.is_restricted()) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for CronExpression {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_field(raw: &str, kind: CronFieldKind) -> Result<FieldValues, CronParseError> {
    if raw == "*" {
        return Ok(FieldValues::All);
    }

    let invalid = || CronParseError::InvalidField { field: kind, raw: raw.to_string() };
    let substituted = substitute_names(raw, kind).ok_or_else(invalid)?;
    let (min, max) = kind.bounds();

    let mut values = Vec::new();
    for token in substituted.split(',') {
        let (range, step) = match token.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid())?;
                if step == 0 {
                    return Err(invalid());
                }
                (range, step)
            }
            None => (token, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let a: u32 = a.parse().map_err(|_| invalid())?;
            let b: u32 = b.parse().map_err(|_| invalid())?;
            (a, b)
        } else {
            let a: u32 = range.parse().map_err(|_| invalid())?;
            // `a/n` means "from a to the end of the range every n"
            if token.contains('/') {
                (a, max)
            } else {
                (a, a)
            }
        };

        if start < min || end > max || start > end {
            return Err(invalid());
        }

        values.extend((start..=end).step_by(step as usize));
    }

    values.sort_unstable();
    values.dedup();
    Ok(FieldValues::Values(values))
}

/// Replace three-letter month/day names with their numbers
///
/// Returns `None` when an alphabetic token is not a known name for the
/// field.
fn substitute_names(raw: &str, kind: CronFieldKind) -> Option<String> {
    let names = kind.names();
    let mut out = String::with_capacity(raw.len());
    let mut word = String::new();

    let flush = |word: &mut String, out: &mut String| -> Option<()> {
        if word.is_empty() {
            return Some(());
        }
        let lower = word.to_ascii_lowercase();
        let index = names.iter().position(|name| *name == lower)?;
        out.push_str(&(index as u32 + kind.name_offset()).to_string());
        word.clear();
        Some(())
    };

    for ch in raw.chars() {
        if ch.is_ascii_alphabetic() {
            word.push(ch);
        } else {
            flush(&mut word, &mut out)?;
            out.push(ch);
        }
    }
    flush(&mut word, &mut out)?;
    Some(out)
}
