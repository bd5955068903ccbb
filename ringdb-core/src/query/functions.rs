//! Time-series UDFs
//!
//! All arithmetic is IEEE-754 double; NaN propagates, NULL absorbs. Integer
//! intermediates are signed 64-bit with floor division, matching the slot
//! math of the storage layer. Negative counter deltas clamp to zero so a
//! process restart reads as a flat rate instead of a spike.

use super::plan::{AggFunc, WinFunc};
use super::Value;
use crate::{Result, RingError};

/// Columns are plain value vectors; every argument arrives pre-broadcast to
/// the batch length
pub type Column = Vec<Value>;

const SCALARS: &[&str] = &[
    "ts_bucket",
    "align_time",
    "shift_ts",
    "clamp",
    "null_if_outside",
    "bucket_rate",
    "series_add",
    "series_sub",
    "series_mul",
    "series_div",
    "abs",
    "round",
];

pub fn is_scalar(name: &str) -> bool {
    SCALARS.contains(&name)
}

pub fn check_arity(name: &str, arity: usize) -> Result<()> {
    let expected: &[usize] = match name {
        "ts_bucket" | "shift_ts" => &[2],
        "align_time" => &[2, 3],
        "clamp" | "null_if_outside" | "bucket_rate" => &[3],
        "series_add" | "series_sub" | "series_mul" | "series_div" => &[2],
        "abs" => &[1],
        "round" => &[1, 2],
        _ => return Err(RingError::Validation(format!("unknown function '{}'", name))),
    };
    if expected.contains(&arity) {
        Ok(())
    } else {
        Err(RingError::Validation(format!(
            "{}() takes {} argument(s), got {}",
            name,
            expected
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(" or "),
            arity
        )))
    }
}

/// Evaluate a scalar function over aligned argument columns
pub fn eval_scalar(name: &str, args: &[Column], rows: usize) -> Result<Column> {
    let arg = |idx: usize, row: usize| -> &Value {
        args.get(idx).map(|col| &col[row]).unwrap_or(&Value::Null)
    };
    let mut out = Vec::with_capacity(rows);
    for row in 0..rows {
        let value = match name {
            "ts_bucket" => ts_bucket(arg(0, row), arg(1, row)),
            "align_time" => {
                let origin = if args.len() > 2 { arg(2, row) } else { &Value::Null };
                align_time(arg(0, row), arg(1, row), origin)
            }
            "shift_ts" => match (arg(0, row).as_i64(), arg(1, row).as_i64()) {
                (Some(ts), Some(offset)) => Value::Int(ts.saturating_add(offset)),
                _ => Value::Null,
            },
            "clamp" => clamp(arg(0, row), arg(1, row), arg(2, row)),
            "null_if_outside" => null_if_outside(arg(0, row), arg(1, row), arg(2, row)),
            "bucket_rate" => bucket_rate(arg(0, row), arg(1, row), arg(2, row)),
            "series_add" => series_op(arg(0, row), arg(1, row), |a, b| Some(a + b)),
            "series_sub" => series_op(arg(0, row), arg(1, row), |a, b| Some(a - b)),
            "series_mul" => series_op(arg(0, row), arg(1, row), |a, b| Some(a * b)),
            "series_div" => series_op(arg(0, row), arg(1, row), |a, b| {
                if b == 0.0 {
                    None
                } else {
                    Some(a / b)
                }
            }),
            "abs" => match arg(0, row).as_f64() {
                Some(v) => Value::Float(v.abs()),
                None => Value::Null,
            },
            "round" => match arg(0, row).as_f64() {
                Some(v) => {
                    let digits = if args.len() > 1 {
                        arg(1, row).as_i64().unwrap_or(0)
                    } else {
                        0
                    };
                    let factor = 10f64.powi(digits.clamp(-18, 18) as i32);
                    Value::Float((v * factor).round() / factor)
                }
                None => Value::Null,
            },
            _ => return Err(RingError::Validation(format!("unknown function '{}'", name))),
        };
        out.push(value);
    }
    Ok(out)
}

/// `(ts // width) * width`; NULL when either input is NULL or width < 1
fn ts_bucket(ts: &Value, width: &Value) -> Value {
    match (ts.as_i64(), width.as_i64()) {
        (Some(ts), Some(width)) if width >= 1 => Value::Int(ts.div_euclid(width) * width),
        _ => Value::Null,
    }
}

/// `((ts - origin) // step) * step + origin`; origin defaults to zero
fn align_time(ts: &Value, step: &Value, origin: &Value) -> Value {
    let origin = match origin {
        Value::Null => 0,
        other => match other.as_i64() {
            Some(v) => v,
            None => return Value::Null,
        },
    };
    match (ts.as_i64(), step.as_i64()) {
        (Some(ts), Some(step)) if step >= 1 => {
            Value::Int((ts - origin).div_euclid(step) * step + origin)
        }
        _ => Value::Null,
    }
}

fn clamp(value: &Value, lo: &Value, hi: &Value) -> Value {
    match (value.as_f64(), lo.as_f64(), hi.as_f64()) {
        (Some(v), Some(lo), Some(hi)) => {
            if v.is_nan() || lo.is_nan() || hi.is_nan() {
                Value::Float(f64::NAN)
            } else {
                Value::Float(lo.max(v.min(hi)))
            }
        }
        _ => Value::Null,
    }
}

fn null_if_outside(value: &Value, lo: &Value, hi: &Value) -> Value {
    match (value.as_f64(), lo.as_f64(), hi.as_f64()) {
        (Some(v), Some(lo), Some(hi)) => {
            if v.is_nan() {
                Value::Float(v)
            } else if v >= lo && v <= hi {
                Value::Float(v)
            } else {
                Value::Null
            }
        }
        _ => Value::Null,
    }
}

/// `max(0, curr - prev) / width`; NULL when prev is NULL or width <= 0
fn bucket_rate(curr: &Value, prev: &Value, width: &Value) -> Value {
    let (Some(curr), Some(prev), Some(width)) = (curr.as_f64(), prev.as_f64(), width.as_f64())
    else {
        return Value::Null;
    };
    if width <= 0.0 {
        return Value::Null;
    }
    let delta = curr - prev;
    if delta.is_nan() {
        Value::Float(f64::NAN)
    } else {
        Value::Float(delta.max(0.0) / width)
    }
}

fn series_op(a: &Value, b: &Value, op: impl Fn(f64, f64) -> Option<f64>) -> Value {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => match op(a, b) {
            Some(v) => Value::Float(v),
            None => Value::Null,
        },
        _ => Value::Null,
    }
}

/// Evaluate a window function over one partition, already sorted by the
/// window's ORDER BY. `args[i]` holds the i-th argument in partition order.
pub fn eval_window(func: WinFunc, args: &[Column], rows: usize) -> Result<Column> {
    match func {
        WinFunc::Lag => {
            let offset = constant_i64(args.get(1), 1).max(0) as usize;
            let values = args.first().cloned().unwrap_or_default();
            let default = args
                .get(2)
                .and_then(|col| col.first().cloned())
                .unwrap_or(Value::Null);
            Ok((0..rows)
                .map(|i| {
                    if i >= offset {
                        values[i - offset].clone()
                    } else {
                        default.clone()
                    }
                })
                .collect())
        }
        WinFunc::CounterRate => {
            let values = numeric(args.first(), rows);
            let buckets = numeric(args.get(1), rows);
            Ok((0..rows)
                .map(|i| {
                    if i == 0 {
                        return Value::Null;
                    }
                    match (values[i], values[i - 1], buckets[i], buckets[i - 1]) {
                        (Some(curr), Some(prev), Some(b1), Some(b0)) => {
                            let span = b1 - b0;
                            if span <= 0.0 {
                                return Value::Null;
                            }
                            let delta = curr - prev;
                            if delta.is_nan() {
                                Value::Float(f64::NAN)
                            } else {
                                Value::Float(delta.max(0.0) / span)
                            }
                        }
                        _ => Value::Null,
                    }
                })
                .collect())
        }
        WinFunc::Diff => {
            let periods = constant_i64(args.get(1), 1).max(1) as usize;
            let values = numeric(args.first(), rows);
            Ok((0..rows)
                .map(|i| {
                    if i < periods {
                        return Value::Null;
                    }
                    match (values[i], values[i - periods]) {
                        (Some(curr), Some(prev)) => Value::Float(curr - prev),
                        _ => Value::Null,
                    }
                })
                .collect())
        }
        WinFunc::PctChange => {
            let periods = constant_i64(args.get(1), 1).max(1) as usize;
            let values = numeric(args.first(), rows);
            Ok((0..rows)
                .map(|i| {
                    if i < periods {
                        return Value::Null;
                    }
                    match (values[i], values[i - periods]) {
                        (Some(curr), Some(prev)) if prev != 0.0 => {
                            Value::Float((curr - prev) / prev)
                        }
                        _ => Value::Null,
                    }
                })
                .collect())
        }
        WinFunc::RollingMean | WinFunc::RollingSum => {
            let window = constant_i64(args.get(1), 1).max(1) as usize;
            let values = numeric(args.first(), rows);
            let mut out = Vec::with_capacity(rows);
            // NaN never enters the running sum: subtracting it back out on
            // eviction cannot restore a finite value, so NaNs are counted
            // separately and poison the result only while one is inside
            // the window
            let mut sum = 0.0;
            let mut count = 0usize;
            let mut nans = 0usize;
            for i in 0..rows {
                if let Some(v) = values[i] {
                    if v.is_nan() {
                        nans += 1;
                    } else {
                        sum += v;
                        count += 1;
                    }
                }
                if i >= window {
                    if let Some(old) = values[i - window] {
                        if old.is_nan() {
                            nans -= 1;
                        } else {
                            sum -= old;
                            count -= 1;
                        }
                    }
                }
                if nans > 0 {
                    out.push(Value::Float(f64::NAN));
                } else if count == 0 {
                    out.push(Value::Null);
                } else if func == WinFunc::RollingMean {
                    out.push(Value::Float(sum / count as f64));
                } else {
                    out.push(Value::Float(sum));
                }
            }
            Ok(out)
        }
    }
}

/// Aggregate one group; `indices` are the group's row positions in `column`
pub fn eval_aggregate(func: AggFunc, column: Option<&Column>, indices: &[usize]) -> Value {
    let Some(column) = column else {
        // count(*)
        return Value::Int(indices.len() as i64);
    };
    match func {
        AggFunc::Count => Value::Int(
            indices
                .iter()
                .filter(|&&i| !matches!(column[i], Value::Null))
                .count() as i64,
        ),
        AggFunc::First => indices
            .iter()
            .map(|&i| &column[i])
            .find(|v| !matches!(v, Value::Null))
            .cloned()
            .unwrap_or(Value::Null),
        AggFunc::Last => indices
            .iter()
            .rev()
            .map(|&i| &column[i])
            .find(|v| !matches!(v, Value::Null))
            .cloned()
            .unwrap_or(Value::Null),
        AggFunc::Sum | AggFunc::Avg | AggFunc::Min | AggFunc::Max => {
            let values: Vec<f64> = indices
                .iter()
                .filter_map(|&i| column[i].as_f64())
                .collect();
            if values.is_empty() {
                return Value::Null;
            }
            // f64::min/max would silently drop NaN operands
            if values.iter().any(|v| v.is_nan()) {
                return Value::Float(f64::NAN);
            }
            match func {
                AggFunc::Sum => Value::Float(values.iter().sum()),
                AggFunc::Avg => Value::Float(values.iter().sum::<f64>() / values.len() as f64),
                AggFunc::Min => Value::Float(values.iter().copied().fold(f64::INFINITY, f64::min)),
                AggFunc::Max => {
                    Value::Float(values.iter().copied().fold(f64::NEG_INFINITY, f64::max))
                }
                _ => unreachable!(),
            }
        }
    }
}

/// Window sizes and offsets are constant arguments; read row zero
fn constant_i64(column: Option<&Column>, default: i64) -> i64 {
    column
        .and_then(|col| col.first())
        .and_then(|v| v.as_i64())
        .unwrap_or(default)
}

fn numeric(column: Option<&Column>, rows: usize) -> Vec<Option<f64>> {
    match column {
        Some(col) => col.iter().map(|v| v.as_f64()).collect(),
        None => vec![None; rows],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floats(values: &[Option<f64>]) -> Column {
        values
            .iter()
            .map(|v| v.map(Value::Float).unwrap_or(Value::Null))
            .collect()
    }

    #[test]
    fn test_ts_bucket() {
        let ts = vec![Value::Int(0), Value::Int(59), Value::Int(60), Value::Int(-1)];
        let width = vec![Value::Int(60); 4];
        let out = eval_scalar("ts_bucket", &[ts, width], 4).unwrap();
        assert_eq!(
            out,
            vec![Value::Int(0), Value::Int(0), Value::Int(60), Value::Int(-60)]
        );
        // invalid width is NULL, not an error
        let out = eval_scalar("ts_bucket", &[vec![Value::Int(5)], vec![Value::Int(0)]], 1).unwrap();
        assert_eq!(out, vec![Value::Null]);
    }

    #[test]
    fn test_ts_bucket_residue_property() {
        for ts in [-130i64, -1, 0, 1, 59, 61, 3600] {
            let out = eval_scalar(
                "ts_bucket",
                &[vec![Value::Int(ts)], vec![Value::Int(60)]],
                1,
            )
            .unwrap();
            let Value::Int(bucket) = out[0] else { panic!("expected int") };
            assert!(bucket <= ts && ts - bucket < 60, "ts={} bucket={}", ts, bucket);
        }
    }

    #[test]
    fn test_bucket_rate_clamps_resets_to_zero() {
        let curr = floats(&[Some(160.0), Some(180.0), Some(50.0), Some(10.0)]);
        let prev = floats(&[Some(100.0), Some(160.0), Some(180.0), None]);
        let width = vec![Value::Int(60); 4];
        let out = eval_scalar("bucket_rate", &[curr, prev, width], 4).unwrap();
        assert_eq!(out[0], Value::Float(1.0));
        assert!(matches!(out[1], Value::Float(v) if (v - 1.0 / 3.0).abs() < 1e-12));
        // reset: clamped to zero rather than a spurious spike
        assert_eq!(out[2], Value::Float(0.0));
        // NULL prev yields NULL
        assert_eq!(out[3], Value::Null);

        let out = eval_scalar(
            "bucket_rate",
            &[floats(&[Some(1.0)]), floats(&[Some(0.0)]), vec![Value::Int(0)]],
            1,
        )
        .unwrap();
        assert_eq!(out[0], Value::Null);
    }

    #[test]
    fn test_clamp_and_null_if_outside() {
        let values = floats(&[Some(-5.0), Some(0.5), Some(5.0), Some(15.0)]);
        let lo = vec![Value::Float(0.0); 4];
        let hi = vec![Value::Float(10.0); 4];
        let clamped = eval_scalar("clamp", &[values.clone(), lo.clone(), hi.clone()], 4).unwrap();
        assert_eq!(
            clamped,
            floats(&[Some(0.0), Some(0.5), Some(5.0), Some(10.0)])
        );
        let gated = eval_scalar("null_if_outside", &[values, lo, hi], 4).unwrap();
        assert_eq!(gated, floats(&[None, Some(0.5), Some(5.0), None]));
    }

    #[test]
    fn test_nan_propagates_through_clamp() {
        let out = eval_scalar(
            "clamp",
            &[
                floats(&[Some(f64::NAN)]),
                floats(&[Some(0.0)]),
                floats(&[Some(1.0)]),
            ],
            1,
        )
        .unwrap();
        assert!(matches!(out[0], Value::Float(v) if v.is_nan()));
    }

    #[test]
    fn test_series_math() {
        let a = floats(&[Some(1.0), Some(2.0), None]);
        let b = floats(&[Some(10.0), Some(0.0), Some(3.0)]);
        assert_eq!(
            eval_scalar("series_add", &[a.clone(), b.clone()], 3).unwrap(),
            floats(&[Some(11.0), Some(2.0), None])
        );
        // division by zero is NULL
        assert_eq!(
            eval_scalar("series_div", &[a, b], 3).unwrap(),
            floats(&[Some(0.1), None, None])
        );
    }

    #[test]
    fn test_align_time_with_origin() {
        let ts = vec![Value::Int(1007)];
        let step = vec![Value::Int(60)];
        let origin = vec![Value::Int(1000)];
        let out = eval_scalar("align_time", &[ts.clone(), step.clone(), origin], 1).unwrap();
        assert_eq!(out, vec![Value::Int(1000)]);
        let out = eval_scalar("align_time", &[ts, step], 1).unwrap();
        assert_eq!(out, vec![Value::Int(960)]);
    }

    #[test]
    fn test_lag() {
        let values = floats(&[Some(1.0), Some(2.0), Some(3.0)]);
        let out = eval_window(WinFunc::Lag, &[values], 3).unwrap();
        assert_eq!(out, floats(&[None, Some(1.0), Some(2.0)]));
    }

    #[test]
    fn test_counter_rate_window() {
        let values = floats(&[Some(100.0), Some(160.0), Some(180.0), Some(50.0)]);
        let buckets: Column = [0, 60, 120, 180].iter().map(|&b| Value::Int(b)).collect();
        let out = eval_window(WinFunc::CounterRate, &[values, buckets], 4).unwrap();
        assert_eq!(out[0], Value::Null);
        assert_eq!(out[1], Value::Float(1.0));
        assert!(matches!(out[2], Value::Float(v) if (v - 1.0 / 3.0).abs() < 1e-12));
        assert_eq!(out[3], Value::Float(0.0));
    }

    #[test]
    fn test_rolling_windows() {
        let values = floats(&[Some(1.0), Some(2.0), None, Some(4.0)]);
        let width: Column = vec![Value::Int(2); 4];
        let means = eval_window(WinFunc::RollingMean, &[values.clone(), width.clone()], 4).unwrap();
        assert_eq!(means, floats(&[Some(1.0), Some(1.5), Some(2.0), Some(4.0)]));
        let sums = eval_window(WinFunc::RollingSum, &[values, width], 4).unwrap();
        assert_eq!(sums, floats(&[Some(1.0), Some(3.0), Some(2.0), Some(4.0)]));
    }

    #[test]
    fn test_rolling_windows_recover_after_nan() {
        let values = floats(&[Some(1.0), Some(f64::NAN), Some(3.0), Some(4.0)]);
        let width: Column = vec![Value::Int(2); 4];
        let means = eval_window(WinFunc::RollingMean, &[values.clone(), width.clone()], 4).unwrap();
        assert_eq!(means[0], Value::Float(1.0));
        assert!(matches!(means[1], Value::Float(v) if v.is_nan()));
        assert!(matches!(means[2], Value::Float(v) if v.is_nan()));
        // the NaN has slid out of the window; the sum must recover
        assert_eq!(means[3], Value::Float(3.5));
        let sums = eval_window(WinFunc::RollingSum, &[values, width], 4).unwrap();
        assert!(matches!(sums[2], Value::Float(v) if v.is_nan()));
        assert_eq!(sums[3], Value::Float(7.0));
    }

    #[test]
    fn test_min_max_propagate_nan() {
        let column = floats(&[Some(f64::NAN), Some(1.0), Some(2.0)]);
        let all: Vec<usize> = (0..3).collect();
        for func in [AggFunc::Min, AggFunc::Max, AggFunc::Sum, AggFunc::Avg] {
            let out = eval_aggregate(func, Some(&column), &all);
            assert!(
                matches!(out, Value::Float(v) if v.is_nan()),
                "{:?} swallowed NaN: {:?}",
                func,
                out
            );
        }
    }

    #[test]
    fn test_aggregates() {
        let column = floats(&[Some(1.0), Some(2.0), None, Some(3.0)]);
        let all: Vec<usize> = (0..4).collect();
        assert_eq!(eval_aggregate(AggFunc::Count, Some(&column), &all), Value::Int(3));
        assert_eq!(eval_aggregate(AggFunc::Count, None, &all), Value::Int(4));
        assert_eq!(eval_aggregate(AggFunc::Sum, Some(&column), &all), Value::Float(6.0));
        assert_eq!(eval_aggregate(AggFunc::Avg, Some(&column), &all), Value::Float(2.0));
        assert_eq!(eval_aggregate(AggFunc::Min, Some(&column), &all), Value::Float(1.0));
        assert_eq!(eval_aggregate(AggFunc::Max, Some(&column), &all), Value::Float(3.0));
        assert_eq!(eval_aggregate(AggFunc::First, Some(&column), &all), Value::Float(1.0));
        assert_eq!(eval_aggregate(AggFunc::Last, Some(&column), &all), Value::Float(3.0));
        assert_eq!(eval_aggregate(AggFunc::Sum, Some(&column), &[]), Value::Null);
    }

    #[test]
    fn test_arity_checks() {
        assert!(check_arity("ts_bucket", 2).is_ok());
        assert!(check_arity("ts_bucket", 3).is_err());
        assert!(check_arity("align_time", 2).is_ok());
        assert!(check_arity("align_time", 3).is_ok());
        assert!(check_arity("no_such_fn", 1).is_err());
    }
}
