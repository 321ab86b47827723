use std::collections::HashMap;

use baton_core::types::value_to_text;

use crate::template::{lookup_path, root_of};

/// Comparison operators, in the order expressions are tried.
const OPERATORS: [&str; 7] = [" contains ", "!=", "==", ">=", "<=", ">", "<"];

/// Evaluate a simple conditional expression against workflow variables.
///
/// Supported expressions:
/// - `key == "value"` and `key != "value"` compare text forms
/// - `key contains "substr"` is a substring (or array element) match
/// - `key > 3`, `>=`, `<`, `<=` compare numerically
/// - `key` is true when the value is truthy, `not key` negates it
///
/// Keys may be dotted paths. A missing key makes every comparison false.
pub fn evaluate_condition(expr: &str, vars: &HashMap<String, serde_json::Value>) -> bool {
    let expr = expr.trim();

    for op in OPERATORS {
        if let Some((key, literal)) = parse_operator(expr, op) {
            let Some(value) = lookup_path(vars, key) else {
                return false;
            };
            return compare(value, op.trim(), literal);
        }
    }

    if let Some(key) = expr.strip_prefix("not ") {
        return !lookup_path(vars, key.trim()).is_some_and(truthy);
    }

    lookup_path(vars, expr).is_some_and(truthy)
}

/// Root variable names an expression reads.
pub fn condition_variables(expr: &str) -> Vec<String> {
    let expr = expr.trim();
    let key = OPERATORS
        .iter()
        .find_map(|op| parse_operator(expr, op).map(|(key, _)| key))
        .unwrap_or_else(|| expr.strip_prefix("not ").unwrap_or(expr).trim());
    if key.is_empty() {
        vec![]
    } else {
        vec![root_of(key).to_string()]
    }
}

fn compare(value: &serde_json::Value, op: &str, literal: &str) -> bool {
    match op {
        "contains" => match value {
            serde_json::Value::Array(items) => items.iter().any(|v| value_to_text(v) == literal),
            other => value_to_text(other).contains(literal),
        },
        "==" => value_to_text(value) == literal,
        "!=" => value_to_text(value) != literal,
        _ => {
            let (Some(left), Some(right)) = (as_number(value), literal.parse::<f64>().ok()) else {
                return false;
            };
            match op {
                ">=" => left >= right,
                "<=" => left <= right,
                ">" => left > right,
                "<" => left < right,
                _ => false,
            }
        }
    }
}

fn as_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        serde_json::Value::String(s) => {
            let s = s.trim();
            !s.is_empty() && !s.eq_ignore_ascii_case("false")
        }
        serde_json::Value::Array(items) => !items.is_empty(),
        serde_json::Value::Object(map) => !map.is_empty(),
    }
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let parts: Vec<&str> = expr.splitn(2, op).collect();
    if parts.len() != 2 {
        return None;
    }
    let key = parts[0].trim();
    let val = parts[1].trim().trim_matches('"').trim_matches('\'');
    if key.is_empty() {
        return None;
    }
    Some((key, val))
}
