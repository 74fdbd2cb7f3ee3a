//! Semantic ordering and equality of values.
//!
//! Values of different classes order by [`ValueKind`]:
//! null < bool < number < string < time < bytes < list < map.
//! Inside the numeric class, integers, unsigned integers and doubles compare
//! by their real value, with NaN after every other number. Mappings only
//! support equality.

use crate::value::{Value, ValueKind};
use std::cmp::Ordering;

/// Compares two values.
///
/// Returns `None` when both values are mappings (or lists that reach a pair
/// of mappings before differing). Mappings are never ordered, only tested
/// for equality with [`values_equal`].
#[must_use]
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    let (ka, kb) = (a.kind(), b.kind());
    if ka != kb {
        return Some(ka.cmp(&kb));
    }
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Text(x), Value::Text(y)) => Some(x.cmp(y)),
        (Value::Time(x), Value::Time(y)) => Some(x.cmp(y)),
        (Value::Bytes(x), Value::Bytes(y)) => Some(x.cmp(y)),
        (Value::Array(x), Value::Array(y)) => {
            for (xv, yv) in x.iter().zip(y.iter()) {
                match compare(xv, yv)? {
                    Ordering::Equal => {}
                    ord => return Some(ord),
                }
            }
            Some(x.len().cmp(&y.len()))
        }
        (Value::Map(_), Value::Map(_)) => None,
        _ => Some(compare_numbers(a, b)),
    }
}

/// Orders two values for sorting.
///
/// Same as [`compare`], except that mappings compare equal to each other so
/// that any slice of values can be sorted.
#[must_use]
pub fn sort_cmp(a: &Value, b: &Value) -> Ordering {
    compare(a, b).unwrap_or(Ordering::Equal)
}

/// Semantic equality.
///
/// Numbers are equal when their real values are equal (`1 == 1.0`), NaN is
/// equal to NaN, and mappings are equal when they hold the same keys with
/// semantically equal values.
#[must_use]
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Map(x), Value::Map(y)) => {
            x.len() == y.len()
                && x.iter()
                    .zip(y.iter())
                    .all(|((kx, vx), (ky, vy))| kx == ky && values_equal(vx, vy))
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(vx, vy)| values_equal(vx, vy))
        }
        _ => compare(a, b) == Some(Ordering::Equal),
    }
}

/// 2^64 as a double.
const TWO_POW_64: f64 = 18_446_744_073_709_551_616.0;
/// -2^63 as a double.
const MIN_I64_F: f64 = -9_223_372_036_854_775_808.0;

enum Num {
    Int(i128),
    Float(f64),
}

fn as_num(v: &Value) -> Num {
    match v {
        Value::Integer(n) => Num::Int(i128::from(*n)),
        Value::Unsigned(n) => Num::Int(i128::from(*n)),
        Value::Float(f) => Num::Float(*f),
        _ => Num::Float(f64::NAN),
    }
}

fn compare_numbers(a: &Value, b: &Value) -> Ordering {
    debug_assert!(a.kind() == ValueKind::Number && b.kind() == ValueKind::Number);
    match (as_num(a), as_num(b)) {
        (Num::Int(x), Num::Int(y)) => x.cmp(&y),
        (Num::Float(x), Num::Float(y)) => compare_floats(x, y),
        (Num::Int(x), Num::Float(y)) => compare_int_float(x, y),
        (Num::Float(x), Num::Int(y)) => compare_int_float(y, x).reverse(),
    }
}

fn compare_floats(x: f64, y: f64) -> Ordering {
    match (x.is_nan(), y.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
    }
}

/// Compares an integer with a double exactly, without rounding the integer.
#[allow(clippy::cast_possible_truncation)]
fn compare_int_float(i: i128, f: f64) -> Ordering {
    if f.is_nan() || f >= TWO_POW_64 {
        return Ordering::Less;
    }
    if f < MIN_I64_F {
        return Ordering::Greater;
    }
    // f is finite and within [-2^63, 2^64), so its integral part fits i128
    let whole = f.trunc();
    match i.cmp(&(whole as i128)) {
        Ordering::Equal => {
            let frac = f - whole;
            if frac > 0.0 {
                Ordering::Less
            } else if frac < 0.0 {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }
        ord => ord,
    }
}
