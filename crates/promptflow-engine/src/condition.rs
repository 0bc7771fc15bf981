use std::cmp::Ordering;

use serde_json::Value;

use promptflow_core::flow::{ConditionOperator, Operand};

use crate::bindings::{value_to_text, Bindings};

/// Resolve an operand to a value. Unbound references resolve to `None`.
pub fn resolve_operand(operand: &Operand, bindings: &Bindings) -> Option<Value> {
    match operand {
        Operand::Literal(v) => Some(v.clone()),
        Operand::Binding(path) => bindings.get_path(path.trim()).cloned(),
    }
}

/// Evaluate `left <operator> right`.
///
/// Comparisons involving a missing left value are false, except
/// `exists` which is exactly that check. Ordering operators on
/// non-numeric values are false.
pub fn evaluate(operator: ConditionOperator, left: Option<&Value>, right: Option<&Value>) -> bool {
    match operator {
        ConditionOperator::Exists => left.is_some_and(|v| !is_empty(v)),
        ConditionOperator::Equals => match (left, right) {
            (Some(l), Some(r)) => equals(l, r),
            _ => false,
        },
        ConditionOperator::NotEquals => match (left, right) {
            (Some(l), Some(r)) => !equals(l, r),
            _ => false,
        },
        ConditionOperator::Contains => match (left, right) {
            (Some(l), Some(r)) => contains(l, r),
            _ => false,
        },
        ConditionOperator::NotContains => match (left, right) {
            (Some(l), Some(r)) => !contains(l, r),
            _ => false,
        },
        ConditionOperator::GreaterThan => {
            compare_numeric(left, right).is_some_and(|o| o == Ordering::Greater)
        }
        ConditionOperator::LessThan => {
            compare_numeric(left, right).is_some_and(|o| o == Ordering::Less)
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Numeric view of a value; numeric strings count.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn equals(left: &Value, right: &Value) -> bool {
    if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
        return l == r;
    }
    value_to_text(left) == value_to_text(right)
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| equals(item, needle)),
        Value::Object(map) => map.contains_key(&value_to_text(needle)),
        other => value_to_text(other).contains(&value_to_text(needle)),
    }
}

fn compare_numeric(left: Option<&Value>, right: Option<&Value>) -> Option<Ordering> {
    let l = as_number(left?)?;
    let r = as_number(right?)?;
    l.partial_cmp(&r)
}
