//! Tagged values flowing through expressions, records, and alarm state.
//!
//! Every value that reaches a test or an action carries the timestamp of the
//! sample it was derived from, so aggregates and log annotations stay keyed
//! to source time rather than wall time.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EvalError;

/// A single datalogger value.
///
/// Numeric comparisons coerce both sides to double; string comparisons are
/// lexical; mixing a number with a string is a type error the evaluator
/// reports rather than papering over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Double(f64),
    Int(i64),
    Str(String),
    /// A timestamp value (nanosecond resolution).
    Date(DateTime<Utc>),
}

impl Value {
    /// True when the value is numeric (including dates, which coerce to
    /// their nanosecond count like the original engine's date values).
    pub fn is_numeric(&self) -> bool {
        !matches!(self, Value::Str(_))
    }

    /// Coerce to double. Strings must parse fully as a number.
    pub fn as_f64(&self) -> Result<f64, EvalError> {
        match self {
            Value::Double(v) => Ok(*v),
            Value::Int(v) => Ok(*v as f64),
            Value::Date(d) => Ok(date_nanos(d) as f64),
            Value::Str(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| EvalError::TypeMismatch {
                    expected: "number",
                    found: format!("string \"{s}\""),
                }),
        }
    }

    /// Coerce to int64, truncating doubles toward zero.
    pub fn as_i64(&self) -> Result<i64, EvalError> {
        match self {
            Value::Int(v) => Ok(*v),
            Value::Double(v) => Ok(*v as i64),
            Value::Date(d) => Ok(date_nanos(d)),
            Value::Str(s) => {
                if let Ok(v) = s.trim().parse::<i64>() {
                    Ok(v)
                } else {
                    self.as_f64().map(|v| v as i64)
                }
            }
        }
    }

    /// Truthiness: nonzero numeric value. Used for on/off expressions.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Int(v) => *v != 0,
            Value::Double(v) => *v != 0.0 && !v.is_nan(),
            Value::Date(d) => date_nanos(d) != 0,
            Value::Str(s) => !s.is_empty(),
        }
    }

    /// Compare two values for the comparison operators.
    ///
    /// Returns `None` for unordered numeric comparisons (a NaN side), which
    /// the operators treat as "not equal, not less, not greater".
    pub fn compare(&self, other: &Value) -> Result<Option<Ordering>, EvalError> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
            (Value::Str(_), _) | (_, Value::Str(_)) => Err(EvalError::TypeMismatch {
                expected: "matching operand types",
                found: "numeric compared with string".to_string(),
            }),
            _ => {
                let a = self.as_f64()?;
                let b = other.as_f64()?;
                Ok(a.partial_cmp(&b))
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Double(v) => write_float(f, *v),
            Value::Int(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d %H:%M:%S%.3f")),
        }
    }
}

/// Format a double using the engine's finite spellings.
fn write_float(f: &mut fmt::Formatter<'_>, v: f64) -> fmt::Result {
    if v.is_nan() {
        write!(f, "NAN")
    } else if v.is_infinite() {
        write!(f, "{}", if v > 0.0 { "INF" } else { "-INF" })
    } else {
        write!(f, "{v}")
    }
}

/// Nanoseconds since the Unix epoch, saturating at the chrono range limits.
pub fn date_nanos(d: &DateTime<Utc>) -> i64 {
    d.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// A value together with the timestamp of the sample that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operand {
    pub value: Value,
    pub stamp: DateTime<Utc>,
}

impl Operand {
    pub fn new(value: Value, stamp: DateTime<Utc>) -> Self {
        Self { value, stamp }
    }

    pub fn double(v: f64, stamp: DateTime<Utc>) -> Self {
        Self::new(Value::Double(v), stamp)
    }

    pub fn int(v: i64, stamp: DateTime<Utc>) -> Self {
        Self::new(Value::Int(v), stamp)
    }

    pub fn is_truthy(&self) -> bool {
        self.value.is_truthy()
    }

    /// The schema type reported on the JSON status surface.
    pub fn value_type_name(&self) -> &'static str {
        match self.value {
            Value::Double(_) | Value::Int(_) => "xsd:double",
            Value::Str(_) | Value::Date(_) => "xsd:string",
        }
    }

    /// ISO 8601 extended stamp used by the alarm log `date` attribute.
    pub fn format_stamp(&self) -> String {
        self.stamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}
