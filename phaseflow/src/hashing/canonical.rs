//! Canonical text form of record values.
//!
//! Two values that mean the same thing must canonicalize to the same bytes:
//! map keys are emitted in sorted order, every number is rendered as a
//! fixed-precision decimal (integers included, so `3` and `3.0` agree),
//! negative zero collapses to zero and timestamps are ISO-8601 UTC with
//! microsecond precision.

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use super::FieldValue;
use crate::errors::{PhaseflowError, Result};

/// Default number of fractional digits kept for numbers.
pub const DEFAULT_FLOAT_DIGITS: u32 = 6;

/// Renders [`FieldValue`]s into their canonical text form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Canonicalizer {
    /// Fractional digits kept for numbers.
    pub float_digits: u32,
}

impl Default for Canonicalizer {
    fn default() -> Self {
        Self {
            float_digits: DEFAULT_FLOAT_DIGITS,
        }
    }
}

impl Canonicalizer {
    /// Creates a canonicalizer keeping `float_digits` fractional digits.
    #[must_use]
    pub fn new(float_digits: u32) -> Self {
        Self { float_digits }
    }

    /// Canonicalizes a value.
    ///
    /// Fails with `PhaseflowError::Serialization` on NaN or infinite floats,
    /// naming the offending path.
    pub fn canonicalize(&self, value: &FieldValue) -> Result<String> {
        let mut out = String::new();
        self.write_value(value, "$", &mut out)?;
        Ok(out)
    }

    fn write_value(&self, value: &FieldValue, path: &str, out: &mut String) -> Result<()> {
        match value {
            FieldValue::Null => out.push_str("null"),
            FieldValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            FieldValue::Int(i) => out.push_str(&self.format_int(*i)),
            FieldValue::Float(f) => out.push_str(&self.format_float(*f, path)?),
            FieldValue::Text(s) => out.push_str(&quote(s)?),
            FieldValue::Date(d) => {
                let _ = write!(out, "@d{}", d.format("%Y-%m-%d"));
            }
            FieldValue::Timestamp(t) => {
                out.push_str("@t");
                out.push_str(&t.to_rfc3339_opts(SecondsFormat::Micros, true));
            }
            FieldValue::List(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    self.write_value(item, &format!("{path}[{i}]"), out)?;
                }
                out.push(']');
            }
            FieldValue::Map(map) => {
                // BTreeMap iteration is already in sorted key order.
                out.push('{');
                for (i, (key, item)) in map.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&quote(key)?);
                    out.push(':');
                    self.write_value(item, &format!("{path}.{key}"), out)?;
                }
                out.push('}');
            }
        }
        Ok(())
    }

    fn format_int(&self, value: i64) -> String {
        if self.float_digits == 0 {
            value.to_string()
        } else {
            format!("{value}.{}", "0".repeat(self.float_digits as usize))
        }
    }

    fn format_float(&self, value: f64, path: &str) -> Result<String> {
        if !value.is_finite() {
            return Err(PhaseflowError::Serialization(format!(
                "{path}: non-finite number {value} cannot be canonicalized"
            )));
        }

        let rendered = format!("{:.*}", self.float_digits as usize, value);
        let is_negative_zero = rendered
            .strip_prefix('-')
            .is_some_and(|rest| rest.chars().all(|c| c == '0' || c == '.'));

        if is_negative_zero {
            Ok(rendered[1..].to_string())
        } else {
            Ok(rendered)
        }
    }
}

fn quote(s: &str) -> Result<String> {
    serde_json::to_string(s).map_err(|e| PhaseflowError::Serialization(e.to_string()))
}
