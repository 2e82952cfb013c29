//! Filter document matching

use std::cmp::Ordering;

use regex::RegexBuilder;
use serde_json::{Map, Value};

use crate::models::Entity;

/// True when the entity satisfies every clause of the filter document.
#[must_use]
pub fn matches(entity: &Entity, filter: &Map<String, Value>) -> bool {
    filter.iter().all(|(key, condition)| match key.as_str() {
        "$and" => clauses(condition).all(|clause| matches(entity, clause)),
        "$or" => clauses(condition).any(|clause| matches(entity, clause)),
        "$nor" => !clauses(condition).any(|clause| matches(entity, clause)),
        field => field_matches(entity.get(field), condition),
    })
}

fn clauses(condition: &Value) -> impl Iterator<Item = &Map<String, Value>> {
    condition
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

fn field_matches(actual: Option<&Value>, condition: &Value) -> bool {
    match condition {
        Value::Object(operators) if is_operator_document(operators) => {
            operators.iter().all(|(operator, operand)| {
                operator_matches(actual, operator, operand, operators.get("$options"))
            })
        }
        expected => equals(actual, expected),
    }
}

fn is_operator_document(document: &Map<String, Value>) -> bool {
    !document.is_empty() && document.keys().all(|key| key.starts_with('$'))
}

fn operator_matches(
    actual: Option<&Value>,
    operator: &str,
    operand: &Value,
    options: Option<&Value>,
) -> bool {
    match operator {
        "$eq" => equals(actual, operand),
        "$ne" => !equals(actual, operand),
        "$gt" => ordered(actual, operand, |ordering| ordering == Ordering::Greater),
        "$gte" => ordered(actual, operand, |ordering| ordering != Ordering::Less),
        "$lt" => ordered(actual, operand, |ordering| ordering == Ordering::Less),
        "$lte" => ordered(actual, operand, |ordering| ordering != Ordering::Greater),
        "$in" => operand
            .as_array()
            .is_some_and(|candidates| candidates.iter().any(|value| equals(actual, value))),
        "$nin" => operand
            .as_array()
            .map_or(true, |candidates| {
                !candidates.iter().any(|value| equals(actual, value))
            }),
        "$exists" => operand.as_bool().unwrap_or(true) == actual.is_some_and(|v| !v.is_null()),
        "$regex" => regex_matches(actual, operand, options),
        "$options" => true,
        "$not" => !field_matches(actual, operand),
        "$size" => actual
            .and_then(Value::as_array)
            .zip(operand.as_u64())
            .is_some_and(|(items, size)| items.len() as u64 == size),
        "$all" => operand
            .as_array()
            .is_some_and(|required| required.iter().all(|value| equals(actual, value))),
        _ => false,
    }
}

/// Equality with array-membership semantics: a scalar matches an array field
/// that contains it.
fn equals(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| values_equal(item, expected))
        }
        Some(value) => values_equal(value, expected),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn ordered(actual: Option<&Value>, operand: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    match actual {
        Some(Value::Array(items)) => items
            .iter()
            .any(|item| compare_values(item, operand).is_some_and(&accept)),
        Some(value) => compare_values(value, operand).is_some_and(accept),
        None => false,
    }
}

/// Compare two JSON scalars of the same kind.
#[must_use]
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn regex_matches(actual: Option<&Value>, pattern: &Value, options: Option<&Value>) -> bool {
    let (Some(Value::String(text)), Some(pattern)) = (actual, pattern.as_str()) else {
        return false;
    };
    let case_insensitive = options
        .and_then(Value::as_str)
        .is_some_and(|flags| flags.contains('i'));
    RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .is_ok_and(|regex| regex.is_match(text))
}
