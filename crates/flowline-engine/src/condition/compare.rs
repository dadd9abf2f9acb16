//! Field lookup, type coercion and comparison operators for `simple`
//! conditions (also reused by the expression fallback comparator).

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use flowline_core::error::{FlowError, Result};

/// Comparison operator of a `simple` condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[serde(alias = "eq", alias = "==")]
    Equals,
    #[serde(alias = "ne", alias = "!=")]
    NotEquals,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = ">=")]
    Gte,
    #[serde(alias = "<=")]
    Lte,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    RegexMatch,
    IsEmpty,
    IsNotEmpty,
}

impl Operator {
    /// Unary operators ignore `expected_value`.
    pub fn is_unary(&self) -> bool {
        matches!(self, Self::IsEmpty | Self::IsNotEmpty)
    }
}

/// Declared type a field is coerced to before comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Number,
    Integer,
    Boolean,
    Date,
}

/// A value after coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum Coerced {
    Null,
    Str(String),
    Num(f64),
    Int(i64),
    Bool(bool),
    Date(DateTime<Utc>),
}

impl Coerced {
    fn compare(&self, other: &Coerced) -> Option<Ordering> {
        match (self, other) {
            (Coerced::Str(a), Coerced::Str(b)) => Some(a.cmp(b)),
            (Coerced::Int(a), Coerced::Int(b)) => Some(a.cmp(b)),
            (Coerced::Num(a), Coerced::Num(b)) => a.partial_cmp(b),
            (Coerced::Int(a), Coerced::Num(b)) => (*a as f64).partial_cmp(b),
            (Coerced::Num(a), Coerced::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Coerced::Bool(a), Coerced::Bool(b)) => Some(a.cmp(b)),
            (Coerced::Date(a), Coerced::Date(b)) => Some(a.cmp(b)),
            (Coerced::Null, Coerced::Null) => Some(Ordering::Equal),
            _ => None,
        }
    }
}

/// Look up a dot-separated path. Numeric segments index into arrays.
pub fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return Some(root);
    }
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Coerce a JSON value to the requested type.
pub fn coerce(value: &Value, value_type: ValueType) -> Result<Coerced> {
    if value.is_null() {
        return Ok(Coerced::Null);
    }
    let fail = || {
        FlowError::ConditionEvaluation(format!("cannot coerce {} to {:?}", value, value_type))
    };
    match value_type {
        ValueType::String => Ok(Coerced::Str(as_plain_string(value))),
        ValueType::Number => match value {
            Value::Number(n) => n.as_f64().map(Coerced::Num).ok_or_else(fail),
            Value::String(s) => s.trim().parse::<f64>().map(Coerced::Num).map_err(|_| fail()),
            Value::Bool(b) => Ok(Coerced::Num(if *b { 1.0 } else { 0.0 })),
            _ => Err(fail()),
        },
        ValueType::Integer => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
                .map(Coerced::Int)
                .ok_or_else(fail),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .or_else(|_| s.parse::<f64>().map(|f| f.trunc() as i64))
                    .map(Coerced::Int)
                    .map_err(|_| fail())
            }
            Value::Bool(b) => Ok(Coerced::Int(i64::from(*b))),
            _ => Err(fail()),
        },
        ValueType::Boolean => match value {
            Value::Bool(b) => Ok(Coerced::Bool(*b)),
            Value::Number(n) => Ok(Coerced::Bool(n.as_f64().is_some_and(|f| f != 0.0))),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" | "y" | "on" => Ok(Coerced::Bool(true)),
                "false" | "no" | "0" | "n" | "off" | "" => Ok(Coerced::Bool(false)),
                _ => Err(fail()),
            },
            _ => Err(fail()),
        },
        ValueType::Date => match value {
            Value::String(s) => parse_date(s).map(Coerced::Date).ok_or_else(fail),
            Value::Number(n) => n
                .as_i64()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .map(Coerced::Date)
                .ok_or_else(fail),
            _ => Err(fail()),
        },
    }
}

fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Pick a type for two untyped values: numeric when both sides read as
/// numbers, boolean when both are booleans, string otherwise.
pub fn infer_type(actual: &Value, expected: &Value) -> ValueType {
    let numeric = |v: &Value| match v {
        Value::Number(_) => true,
        Value::String(s) => s.trim().parse::<f64>().is_ok(),
        _ => false,
    };
    match (actual, expected) {
        (Value::Bool(_), Value::Bool(_)) => ValueType::Boolean,
        (Value::Bool(_), Value::String(_)) | (Value::String(_), Value::Bool(_)) => {
            ValueType::Boolean
        }
        (a, e) if numeric(a) && numeric(e) && (a.is_number() || e.is_number()) => {
            ValueType::Number
        }
        _ => ValueType::String,
    }
}

/// Render a scalar as the string a user would expect (no JSON quotes).
pub fn as_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn is_empty_value(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

fn ordering(
    actual: &Value,
    expected: &Value,
    value_type: Option<ValueType>,
) -> Result<Option<Ordering>> {
    let ty = value_type.unwrap_or_else(|| infer_type(actual, expected));
    let a = coerce(actual, ty)?;
    let e = coerce(expected, ty)?;
    Ok(a.compare(&e))
}

fn values_equal(actual: &Value, expected: &Value, value_type: Option<ValueType>) -> Result<bool> {
    if value_type.is_none() && actual == expected {
        return Ok(true);
    }
    match ordering(actual, expected, value_type) {
        Ok(ord) => Ok(ord == Some(Ordering::Equal)),
        // Mismatched shapes are simply unequal.
        Err(_) if value_type.is_none() => Ok(false),
        Err(e) => Err(e),
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => s.contains(&as_plain_string(needle)),
        Value::Array(items) => items
            .iter()
            .any(|item| item == needle || as_plain_string(item) == as_plain_string(needle)),
        Value::Object(map) => map.contains_key(&as_plain_string(needle)),
        _ => false,
    }
}

fn membership(actual: &Value, expected: &Value) -> bool {
    match expected {
        Value::Array(items) => items
            .iter()
            .any(|item| item == actual || as_plain_string(item) == as_plain_string(actual)),
        Value::String(list) => {
            let needle = as_plain_string(actual);
            list.split(',').any(|part| part.trim() == needle)
        }
        other => other == actual,
    }
}

/// Apply `op` to the looked-up field (`None` when missing) and the expected value.
pub fn apply(
    op: Operator,
    actual: Option<&Value>,
    expected: &Value,
    value_type: Option<ValueType>,
) -> Result<bool> {
    match op {
        Operator::IsEmpty => return Ok(is_empty_value(actual)),
        Operator::IsNotEmpty => return Ok(!is_empty_value(actual)),
        _ => {}
    }

    let actual = match actual {
        Some(v) => v,
        // A missing field satisfies only the negative operators.
        None => return Ok(matches!(op, Operator::NotEquals | Operator::NotContains | Operator::NotIn)),
    };

    let result = match op {
        Operator::Equals => values_equal(actual, expected, value_type)?,
        Operator::NotEquals => !values_equal(actual, expected, value_type)?,
        Operator::Gt => ordering(actual, expected, value_type)? == Some(Ordering::Greater),
        Operator::Lt => ordering(actual, expected, value_type)? == Some(Ordering::Less),
        Operator::Gte => matches!(
            ordering(actual, expected, value_type)?,
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Operator::Lte => matches!(
            ordering(actual, expected, value_type)?,
            Some(Ordering::Less | Ordering::Equal)
        ),
        Operator::Contains => contains(actual, expected),
        Operator::NotContains => !contains(actual, expected),
        Operator::StartsWith => as_plain_string(actual).starts_with(&as_plain_string(expected)),
        Operator::EndsWith => as_plain_string(actual).ends_with(&as_plain_string(expected)),
        Operator::In => membership(actual, expected),
        Operator::NotIn => !membership(actual, expected),
        Operator::RegexMatch => {
            let pattern = as_plain_string(expected);
            let re = Regex::new(&pattern).map_err(|e| {
                FlowError::ConditionEvaluation(format!("invalid regex '{}': {}", pattern, e))
            })?;
            re.is_match(&as_plain_string(actual))
        }
        // handled above
        Operator::IsEmpty | Operator::IsNotEmpty => false,
    };
    Ok(result)
}
