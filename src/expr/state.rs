//! Stateful token application: running aggregates and historic lookups.
//!
//! Each stateful token owns a private sample window keyed on the timestamps
//! supplied at evaluation time, never on the wall clock. `reset_state` (on
//! expression start) clears every window so a restarted alarm begins from
//! scratch.

use chrono::{DateTime, Datelike, Duration, Utc};

use super::functions::to_date;
use super::token::{AggKind, Stateful, StatefulKind, WindowKind};
use crate::error::EvalError;
use crate::value::Operand;

pub fn apply_stateful(st: &mut Stateful, args: &[Operand]) -> Result<Operand, EvalError> {
    if args.len() != st.arity() {
        return Err(EvalError::MissingOperands("stateful function", st.arity()));
    }
    match st.kind {
        StatefulKind::Last => {
            let result = st.prev.clone().unwrap_or_else(|| args[0].clone());
            st.prev = Some(args[0].clone());
            Ok(result)
        }
        StatefulKind::Running(agg, window) => apply_running(st, agg, window, args),
        StatefulKind::ValueAtTime => apply_value_at_time(st, args),
    }
}

fn apply_running(
    st: &mut Stateful,
    agg: AggKind,
    window: WindowKind,
    args: &[Operand],
) -> Result<Operand, EvalError> {
    let sample = args[0].value.as_f64()?;
    match window {
        WindowKind::Count => {
            let count = args[1].value.as_i64()?.max(1) as usize;
            if !sample.is_nan() {
                st.samples.push_back((sample, args[0].stamp));
            }
            while st.samples.len() > count {
                st.samples.pop_front();
            }
        }
        WindowKind::OverTime => {
            let stamp = to_date(&args[1].value);
            let window_ms = args[2].value.as_i64()?.max(0);
            let cutoff = stamp - Duration::milliseconds(window_ms);
            // Entries older than the window go before the new sample lands.
            while st.samples.front().is_some_and(|(_, s)| *s < cutoff) {
                st.samples.pop_front();
            }
            if !sample.is_nan() {
                st.samples.push_back((sample, stamp));
            }
        }
        WindowKind::OverTimeWithReset => {
            let stamp = to_date(&args[1].value);
            let reset = args[2].value.as_i64()?;
            if let Some(last) = st.last_stamp {
                if boundary_key(last, reset) != boundary_key(stamp, reset) {
                    st.samples.clear();
                }
            }
            if !sample.is_nan() {
                st.samples.push_back((sample, stamp));
            }
            st.last_stamp = Some(stamp);
        }
    }
    let stamp = st
        .samples
        .back()
        .map(|(_, s)| *s)
        .unwrap_or(args[0].stamp);
    Ok(Operand::double(compute(agg, &st.samples), stamp))
}

/// `VALUEATTIME(v, stamp, age_ms, default)`: the closest sample whose stamp
/// is at or before `stamp - age_ms`; the default when none qualifies.
fn apply_value_at_time(st: &mut Stateful, args: &[Operand]) -> Result<Operand, EvalError> {
    let sample = args[0].value.as_f64()?;
    let stamp = to_date(&args[1].value);
    let age_ms = args[2].value.as_i64()?.max(0);
    let requested = stamp - Duration::milliseconds(age_ms);
    if !sample.is_nan() {
        st.samples.push_back((sample, stamp));
    }
    // Drop entries older than the best candidate at or before the requested
    // time; the newest of them stays as the closest match.
    while st.samples.len() >= 2 && st.samples[1].1 <= requested {
        st.samples.pop_front();
    }
    let hit = st
        .samples
        .front()
        .filter(|(_, s)| *s <= requested)
        .map(|(v, _)| *v);
    match hit {
        Some(v) => Ok(Operand::double(v, requested)),
        None => Ok(Operand::new(args[3].value.clone(), requested)),
    }
}

fn compute(agg: AggKind, samples: &std::collections::VecDeque<(f64, DateTime<Utc>)>) -> f64 {
    if samples.is_empty() {
        return f64::NAN;
    }
    let values: Vec<f64> = samples.iter().map(|(v, _)| *v).collect();
    let n = values.len() as f64;
    match agg {
        AggKind::Total => values.iter().sum(),
        AggKind::Avg => values.iter().sum::<f64>() / n,
        AggKind::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        AggKind::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        AggKind::Median => {
            let mut sorted = values.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let mid = sorted.len() / 2;
            if sorted.len() % 2 == 1 {
                sorted[mid]
            } else {
                (sorted[mid - 1] + sorted[mid]) / 2.0
            }
        }
        AggKind::StdDev => {
            let mean = values.iter().sum::<f64>() / n;
            let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
            var.sqrt()
        }
    }
}

/// Bucket key for reset boundaries: 1=hour, 2=day, 3=month, 4=year, larger
/// values are a custom interval in milliseconds aligned to the epoch.
fn boundary_key(t: DateTime<Utc>, reset: i64) -> i64 {
    match reset {
        1 => t.timestamp() / 3600,
        2 => t.timestamp() / 86_400,
        3 => i64::from(t.year()) * 12 + i64::from(t.month0()),
        4 => i64::from(t.year()),
        ms if ms > 4 => t.timestamp_millis().div_euclid(ms),
        _ => 0,
    }
}
