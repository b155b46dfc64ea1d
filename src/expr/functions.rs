//! Stateless operator and function application.
//!
//! Arithmetic follows IEEE 754 for doubles: division by zero yields
//! ±Infinity or NaN without raising. Integer division and modulo by zero are
//! the only arithmetic errors. Comparisons produce int 0/1 and never fail on
//! numeric operands; numeric-vs-string comparison is a type error.

use std::cmp::Ordering;

use chrono::{DateTime, TimeZone, Utc};

use super::EvalCtx;
use crate::error::EvalError;
use crate::expr::token::OpCode;
use crate::value::{Operand, Value};

pub fn apply_op(op: OpCode, args: &[Operand], ctx: &EvalCtx) -> Result<Operand, EvalError> {
    use OpCode::*;
    if args.len() != op.arity() {
        return Err(EvalError::MissingOperands(op.name(), op.arity()));
    }
    let stamp = args
        .iter()
        .map(|a| a.stamp)
        .max()
        .unwrap_or(ctx.source_time.unwrap_or(ctx.now));
    let value = match op {
        // ---------------- arithmetic ----------------
        Add => match (&args[0].value, &args[1].value) {
            (Value::Str(a), Value::Str(b)) => Value::Str(format!("{a}{b}")),
            (Value::Str(_), _) | (_, Value::Str(_)) => {
                return Err(type_mismatch("two numbers or two strings"))
            }
            (Value::Int(a), Value::Int(b)) => match a.checked_add(*b) {
                Some(v) => Value::Int(v),
                None => Value::Double(*a as f64 + *b as f64),
            },
            _ => Value::Double(args[0].value.as_f64()? + args[1].value.as_f64()?),
        },
        Sub => match (&args[0].value, &args[1].value) {
            (Value::Int(a), Value::Int(b)) => match a.checked_sub(*b) {
                Some(v) => Value::Int(v),
                None => Value::Double(*a as f64 - *b as f64),
            },
            _ => Value::Double(args[0].value.as_f64()? - args[1].value.as_f64()?),
        },
        Mul => match (&args[0].value, &args[1].value) {
            (Value::Int(a), Value::Int(b)) => match a.checked_mul(*b) {
                Some(v) => Value::Int(v),
                None => Value::Double(*a as f64 * *b as f64),
            },
            _ => Value::Double(args[0].value.as_f64()? * args[1].value.as_f64()?),
        },
        Div => match (&args[0].value, &args[1].value) {
            (Value::Int(_), Value::Int(0)) => return Err(EvalError::DivideByZero),
            _ => Value::Double(args[0].value.as_f64()? / args[1].value.as_f64()?),
        },
        Mod => match (&args[0].value, &args[1].value) {
            (Value::Int(_), Value::Int(0)) => return Err(EvalError::DivideByZero),
            (Value::Int(a), Value::Int(b)) => Value::Int(a % b),
            _ => Value::Double(args[0].value.as_f64()? % args[1].value.as_f64()?),
        },
        Pow | Pwr => Value::Double(args[0].value.as_f64()?.powf(args[1].value.as_f64()?)),
        Neg => match &args[0].value {
            Value::Int(v) => Value::Int(-v),
            _ => Value::Double(-args[0].value.as_f64()?),
        },

        // ---------------- comparison ----------------
        Eq => bool_int(args[0].value.compare(&args[1].value)? == Some(Ordering::Equal)),
        Ne => bool_int(args[0].value.compare(&args[1].value)? != Some(Ordering::Equal)),
        Lt => bool_int(args[0].value.compare(&args[1].value)? == Some(Ordering::Less)),
        Le => bool_int(matches!(
            args[0].value.compare(&args[1].value)?,
            Some(Ordering::Less) | Some(Ordering::Equal)
        )),
        Gt => bool_int(args[0].value.compare(&args[1].value)? == Some(Ordering::Greater)),
        Ge => bool_int(matches!(
            args[0].value.compare(&args[1].value)?,
            Some(Ordering::Greater) | Some(Ordering::Equal)
        )),

        // ---------------- logical ----------------
        And => bool_int(args[0].is_truthy() && args[1].is_truthy()),
        Or => bool_int(args[0].is_truthy() || args[1].is_truthy()),
        Xor => bool_int(args[0].is_truthy() ^ args[1].is_truthy()),
        Not => bool_int(!args[0].is_truthy()),
        Iif => {
            if args[0].is_truthy() {
                args[1].value.clone()
            } else {
                args[2].value.clone()
            }
        }

        // ---------------- math ----------------
        Abs => match &args[0].value {
            Value::Int(v) => Value::Int(v.abs()),
            _ => Value::Double(args[0].value.as_f64()?.abs()),
        },
        Sqr => Value::Double(args[0].value.as_f64()?.sqrt()),
        Exp => Value::Double(args[0].value.as_f64()?.exp()),
        Log => Value::Double(args[0].value.as_f64()?.ln()),
        Log10 => Value::Double(args[0].value.as_f64()?.log10()),
        Sin => Value::Double(args[0].value.as_f64()?.sin()),
        Cos => Value::Double(args[0].value.as_f64()?.cos()),
        Tan => Value::Double(args[0].value.as_f64()?.tan()),
        Asin => Value::Double(args[0].value.as_f64()?.asin()),
        Acos => Value::Double(args[0].value.as_f64()?.acos()),
        Atn => Value::Double(args[0].value.as_f64()?.atan()),
        Atn2 => Value::Double(args[0].value.as_f64()?.atan2(args[1].value.as_f64()?)),
        Floor => Value::Double(args[0].value.as_f64()?.floor()),
        Ceiling => Value::Double(args[0].value.as_f64()?.ceil()),
        Round => {
            let v = args[0].value.as_f64()?;
            let digits = args[1].value.as_i64()?;
            let scale = 10f64.powi(digits as i32);
            Value::Double((v * scale).round() / scale)
        }
        Frac => {
            let v = args[0].value.as_f64()?;
            Value::Double(v - v.trunc())
        }
        Int => Value::Double(args[0].value.as_f64()?.floor()),
        Fix => Value::Double(args[0].value.as_f64()?.trunc()),
        Sgn => {
            let v = args[0].value.as_f64()?;
            Value::Int(if v > 0.0 {
                1
            } else if v < 0.0 {
                -1
            } else {
                0
            })
        }
        Rnd => Value::Double(rand::random::<f64>()),

        // ---------------- string ----------------
        Len => Value::Int(args[0].value.to_string().chars().count() as i64),
        Left => {
            let s = string_arg(&args[0]);
            let n = args[1].value.as_i64()?.max(0) as usize;
            Value::Str(s.chars().take(n).collect())
        }
        Right => {
            let s = string_arg(&args[0]);
            let n = args[1].value.as_i64()?.max(0) as usize;
            let count = s.chars().count();
            Value::Str(s.chars().skip(count.saturating_sub(n)).collect())
        }
        Mid => {
            let s = string_arg(&args[0]);
            // 1-based start offset
            let start = (args[1].value.as_i64()?.max(1) - 1) as usize;
            let len = args[2].value.as_i64()?.max(0) as usize;
            Value::Str(s.chars().skip(start).take(len).collect())
        }
        Trim => Value::Str(string_arg(&args[0]).trim().to_string()),
        LTrim => Value::Str(string_arg(&args[0]).trim_start().to_string()),
        RTrim => Value::Str(string_arg(&args[0]).trim_end().to_string()),
        InStr => {
            let hay = string_arg(&args[0]);
            let needle = string_arg(&args[1]);
            match hay.find(&needle) {
                // 1-based index, 0 when absent
                Some(byte_pos) => Value::Int(hay[..byte_pos].chars().count() as i64 + 1),
                None => Value::Int(0),
            }
        }
        Replace => {
            let s = string_arg(&args[0]);
            Value::Str(s.replace(&string_arg(&args[1]), &string_arg(&args[2])))
        }
        StrComp => {
            let a = string_arg(&args[0]);
            let b = string_arg(&args[1]);
            Value::Int(match a.cmp(&b) {
                Ordering::Less => -1,
                Ordering::Equal => 0,
                Ordering::Greater => 1,
            })
        }
        Upper => Value::Str(string_arg(&args[0]).to_uppercase()),
        Lower => Value::Str(string_arg(&args[0]).to_lowercase()),
        Hex => Value::Str(format!("{:X}", args[0].value.as_i64()?)),
        HexToDec => {
            let raw = string_arg(&args[0]);
            let trimmed = raw
                .trim()
                .trim_start_matches("0x")
                .trim_start_matches("0X")
                .trim_start_matches("&H")
                .trim_start_matches("&h");
            match i64::from_str_radix(trimmed, 16) {
                Ok(v) => Value::Int(v),
                Err(_) => Value::Double(f64::NAN),
            }
        }
        Space => {
            let n = args[0].value.as_i64()?.max(0) as usize;
            Value::Str(" ".repeat(n))
        }
        StrReverse => Value::Str(string_arg(&args[0]).chars().rev().collect()),

        // ---------------- conversion ----------------
        ToFloat => Value::Double(args[0].value.as_f64().unwrap_or(f64::NAN)),
        ToInt => Value::Int(args[0].value.as_f64().map(|v| v as i64).unwrap_or(0)),
        ToDate => Value::Date(to_date(&args[0].value)),
        FormatFloat => {
            let v = args[0].value.as_f64()?;
            let digits = args[1].value.as_i64()?.clamp(0, 17) as usize;
            Value::Str(format!("{v:.digits$}"))
        }
        FormatTime => {
            let stamp_val = to_date(&args[0].value);
            let fmt = string_arg(&args[1]);
            Value::Str(stamp_val.format(&fmt).to_string())
        }

        // ---------------- time ----------------
        Timestamp => Value::Date(args[0].stamp),
        SetTimestamp => {
            let new_stamp = to_date(&args[1].value);
            return Ok(Operand::new(args[0].value.clone(), new_stamp));
        }
        SystemTime => Value::Date(ctx.now),
        SourceTime => Value::Date(ctx.source_time.unwrap_or(ctx.now)),
    };
    Ok(Operand::new(value, stamp))
}

fn bool_int(v: bool) -> Value {
    Value::Int(i64::from(v))
}

fn type_mismatch(expected: &'static str) -> EvalError {
    EvalError::TypeMismatch {
        expected,
        found: "mixed operand types".to_string(),
    }
}

fn string_arg(op: &Operand) -> String {
    op.value.to_string()
}

/// Interpret a value as a timestamp: dates pass through, numbers are
/// nanoseconds since the epoch, strings are parsed in the log stamp format.
pub(super) fn to_date(value: &Value) -> DateTime<Utc> {
    match value {
        Value::Date(d) => *d,
        Value::Int(ns) => Utc.timestamp_nanos(*ns),
        Value::Double(v) => Utc.timestamp_nanos(*v as i64),
        Value::Str(s) => {
            let trimmed = s.trim();
            DateTime::parse_from_rfc3339(trimmed)
                .map(|d| d.with_timezone(&Utc))
                .or_else(|_| {
                    chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S")
                        .map(|n| Utc.from_utc_datetime(&n))
                })
                .unwrap_or_else(|_| Utc.timestamp_nanos(0))
        }
    }
}
