//! Human-friendly setting values.
//!
//! Settings such as `"15m"`, `"70%"` or `"20k"` are kept as written in the
//! file and interpreted when the stamp mode is built, so that errors can
//! name the offending field.

use crate::error::{Error, Result};
use crate::stamp::{Amount, BatchId};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Length in bytes of a stamp id.
const BATCH_ID_LEN: usize = 32;

/// Shallowest depth accepted for purchases.
pub const MIN_DEPTH: u8 = 20;

/// Deepest depth accepted for purchases.
pub const MAX_DEPTH: u8 = 64;

/// A raw setting value as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UnitValue {
    /// A TOML integer.
    Integer(i64),
    /// A TOML float.
    Float(f64),
    /// A string, possibly carrying a unit suffix.
    Text(String),
}

impl fmt::Display for UnitValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) if s.is_empty() => f.write_str("nothing"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for UnitValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for UnitValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

fn parsing_error(field: &str, value: &UnitValue, label: &str, example: &str) -> Error {
    Error::Config(format!(
        "Could not parse {field} as {label}, got {value}. Example: {example}"
    ))
}

fn out_of_bounds(field: &str, value: &UnitValue, reason: &str) -> Error {
    Error::Config(format!(
        "Value {value} for {field} is not acceptable. {reason}"
    ))
}

/// Split `"15m"` into `("15", "m")`.
fn split_unit(text: &str) -> (&str, &str) {
    let text = text.trim();
    let end = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    (&text[..end], text[end..].trim())
}

/// Parse a duration: `<int><s|m|h|d>` or whole seconds.
///
/// # Errors
///
/// Returns [`Error::Config`] naming `field` if the value is malformed or negative.
pub fn parse_duration(value: &UnitValue, field: &str) -> Result<Duration> {
    let text = match value {
        UnitValue::Integer(n) => {
            return u64::try_from(*n)
                .map(Duration::from_secs)
                .map_err(|_| out_of_bounds(field, value, "Time must be positive."));
        }
        UnitValue::Float(_) => return Err(parsing_error(field, value, "time", "20s")),
        UnitValue::Text(text) => text.trim(),
    };

    if text.starts_with('-') {
        return Err(out_of_bounds(field, value, "Time must be positive."));
    }

    let (number, unit) = split_unit(text);
    let number: u64 = number
        .parse()
        .map_err(|_| parsing_error(field, value, "time", "20s"))?;

    let multiplier = match unit.chars().next().map(|c| c.to_ascii_lowercase()) {
        None | Some('s') => 1,
        Some('m') => 60,
        Some('h') => 60 * 60,
        Some('d') => 24 * 60 * 60,
        Some(_) => {
            return Err(out_of_bounds(
                field,
                value,
                "Unit must be 's', 'm', 'h' or 'd'.",
            ))
        }
    };

    number
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| out_of_bounds(field, value, "Time is too large."))
}

/// Parse a percentage into a fraction in `[0, 1]`.
///
/// Strings and integers are percentages (`"70%"`, `"70"`, `70`); floats are
/// already fractions (`0.7`).
///
/// # Errors
///
/// Returns [`Error::Config`] naming `field` if the value is malformed or out of range.
pub fn parse_percentage(value: &UnitValue, field: &str) -> Result<f64> {
    let percent = match value {
        UnitValue::Float(fraction) => {
            if !(0.0..=1.0).contains(fraction) {
                return Err(out_of_bounds(
                    field,
                    value,
                    "Fraction must be between 0 and 1.",
                ));
            }
            return Ok(*fraction);
        }
        #[allow(clippy::cast_precision_loss)]
        UnitValue::Integer(n) => *n as f64,
        UnitValue::Text(text) => text
            .trim()
            .trim_end_matches('%')
            .trim()
            .parse::<f64>()
            .map_err(|_| parsing_error(field, value, "percentage", "85%"))?,
    };

    if percent.is_nan() {
        return Err(parsing_error(field, value, "percentage", "85%"));
    }
    if !(0.0..=100.0).contains(&percent) {
        return Err(out_of_bounds(
            field,
            value,
            "Percentage must be between 0 and 100.",
        ));
    }
    Ok(percent / 100.0)
}

/// Parse an amount: `<decimal>[k|m|b|t]` (`"20k"`, `"1.5m"`) or an integer.
///
/// # Errors
///
/// Returns [`Error::Config`] naming `field` if the value is malformed, not
/// positive, or not a whole number once the multiplier is applied.
pub fn parse_amount(value: &UnitValue, field: &str) -> Result<Amount> {
    let text = match value {
        UnitValue::Integer(n) if *n > 0 => return Ok(Amount::from_u64(n.unsigned_abs())),
        UnitValue::Integer(_) => {
            return Err(out_of_bounds(field, value, "Number must be positive."))
        }
        UnitValue::Float(_) => return Err(parsing_error(field, value, "number", "20m")),
        UnitValue::Text(text) => text.trim(),
    };

    if text.starts_with('-') {
        return Err(out_of_bounds(field, value, "Number must be positive."));
    }

    let (number, unit) = split_unit(text);
    let exponent: usize = match unit.chars().next().map(|c| c.to_ascii_lowercase()) {
        None => 0,
        Some('k') => 3,
        Some('m') => 6,
        Some('b') => 9,
        Some('t') => 12,
        Some(_) => return Err(parsing_error(field, value, "number", "20m")),
    };

    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    let fraction = fraction.trim_end_matches('0');
    if whole.is_empty() || fraction.contains('.') {
        return Err(parsing_error(field, value, "number", "20m"));
    }
    if fraction.len() > exponent {
        return Err(out_of_bounds(field, value, "Number must be a whole number."));
    }

    let digits = format!("{whole}{fraction}{}", "0".repeat(exponent - fraction.len()));
    let amount: BigUint = digits
        .parse()
        .map_err(|_| parsing_error(field, value, "number", "20m"))?;

    let amount = Amount::from(amount);
    if amount.is_zero() {
        return Err(out_of_bounds(field, value, "Number must be positive."));
    }
    Ok(amount)
}

/// Parse a stamp depth in `20..=64`.
///
/// # Errors
///
/// Returns [`Error::Config`] naming `field` if the value is malformed or out of range.
pub fn parse_depth(value: &UnitValue, field: &str) -> Result<u8> {
    let depth = match value {
        UnitValue::Integer(n) => *n,
        UnitValue::Float(_) => return Err(parsing_error(field, value, "depth", "22")),
        UnitValue::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| parsing_error(field, value, "depth", "22"))?,
    };

    if depth == 0 {
        return Err(parsing_error(field, value, "depth", "22"));
    }
    u8::try_from(depth)
        .ok()
        .filter(|d| (MIN_DEPTH..=MAX_DEPTH).contains(d))
        .ok_or_else(|| {
            out_of_bounds(
                field,
                value,
                &format!("Depth must be between {MIN_DEPTH} and {MAX_DEPTH}."),
            )
        })
}

/// Parse a stamp id: 64 hex characters.
///
/// # Errors
///
/// Returns [`Error::Config`] naming `field` if the id is not 32 hex-encoded bytes.
pub fn parse_batch_id(text: &str, field: &str) -> Result<BatchId> {
    let text = text.trim();
    match hex::decode(text) {
        Ok(bytes) if bytes.len() == BATCH_ID_LEN => Ok(BatchId::new(text.to_ascii_lowercase())),
        _ => Err(parsing_error(
            field,
            &UnitValue::from(text),
            "batch id",
            "64 hex characters",
        )),
    }
}
