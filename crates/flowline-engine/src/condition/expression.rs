//! `expression` conditions: variable substitution, sandboxed evaluation, and
//! the manual `left OP right` fallback.

use rhai::{Dynamic, Engine};
use serde_json::Value;
use tracing::debug;

use flowline_core::config::ConditionSettings;
use flowline_core::error::{FlowError, Result};

use super::compare::{self, Operator};

/// A rhai engine with resource limits and no access to host identifiers.
pub(crate) fn sandbox_engine(settings: &ConditionSettings) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(settings.max_operations);
    engine.set_max_call_levels(8);
    engine.set_max_expr_depths(32, 16);
    engine.set_max_string_size(64 * 1024);
    engine.set_max_array_size(10_000);
    engine.set_max_map_size(10_000);
    engine.set_strict_variables(true);
    engine.disable_symbol("eval");
    engine.on_print(|_| {});
    engine.on_debug(|_, _, _| {});
    engine
}

/// Render a JSON value as a rhai literal.
pub(crate) fn to_rhai_literal(value: &Value) -> String {
    match value {
        Value::Null => "()".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote(s),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(to_rhai_literal).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Object(map) => {
            let inner: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", quote(k), to_rhai_literal(v)))
                .collect();
            format!("#{{{}}}", inner.join(", "))
        }
    }
}

fn quote(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Substitute `${dot.path}` and `$name` references with literals, turn
/// single-quoted strings into double-quoted ones, and map the word operators
/// `and`/`or`/`not` and `True`/`False`/`None`/`null` to rhai syntax.
/// Text inside string literals is left alone.
pub fn substitute(expression: &str, context: &Value) -> String {
    let chars: Vec<char> = expression.chars().collect();
    let mut out = String::with_capacity(expression.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' => {
                // Copy a double-quoted literal verbatim, honoring escapes.
                out.push(c);
                i += 1;
                while i < chars.len() {
                    out.push(chars[i]);
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        out.push(chars[i + 1]);
                        i += 2;
                        continue;
                    }
                    i += 1;
                    if chars[i - 1] == '"' {
                        break;
                    }
                }
            }
            '\'' => {
                let mut literal = String::new();
                i += 1;
                while i < chars.len() && chars[i] != '\'' {
                    literal.push(chars[i]);
                    i += 1;
                }
                i += 1; // closing quote
                out.push_str(&quote(&literal));
            }
            '$' if chars.get(i + 1) == Some(&'{') => {
                let mut path = String::new();
                i += 2;
                while i < chars.len() && chars[i] != '}' {
                    path.push(chars[i]);
                    i += 1;
                }
                i += 1; // closing brace
                out.push_str(&literal_for(context, path.trim()));
            }
            '$' => {
                let mut path = String::new();
                i += 1;
                while i < chars.len() && (is_ident_char(chars[i]) || chars[i] == '.') {
                    path.push(chars[i]);
                    i += 1;
                }
                let path = path.trim_end_matches('.');
                if path.is_empty() {
                    out.push('$');
                } else {
                    out.push_str(&literal_for(context, path));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                out.push_str(match word.as_str() {
                    "and" => "&&",
                    "or" => "||",
                    "not" => "!",
                    "True" => "true",
                    "False" => "false",
                    "None" | "null" => "()",
                    other => other,
                });
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn literal_for(context: &Value, path: &str) -> String {
    compare::lookup(context, path)
        .map(to_rhai_literal)
        .unwrap_or_else(|| "()".to_string())
}

/// Evaluate an expression; on any sandbox failure fall back to the manual
/// comparator over the substituted text.
pub fn evaluate(engine: &Engine, expression: &str, context: &Value) -> Result<bool> {
    let text = substitute(expression, context);
    match engine.eval_expression::<Dynamic>(&text) {
        Ok(value) => value.as_bool().map_err(|type_name| {
            FlowError::ConditionEvaluation(format!(
                "expression '{}' produced {} instead of bool",
                expression, type_name
            ))
        }),
        Err(e) => {
            debug!(expression = %text, error = %e, "Sandboxed expression failed, using fallback comparator");
            fallback_compare(&text)
        }
    }
}

const FALLBACK_OPERATORS: &[(&str, Operator)] = &[
    ("==", Operator::Equals),
    ("!=", Operator::NotEquals),
    (">=", Operator::Gte),
    ("<=", Operator::Lte),
    (">", Operator::Gt),
    ("<", Operator::Lt),
    (" contains ", Operator::Contains),
];

/// Manual `left OP right` comparison for expressions the sandbox rejects.
pub fn fallback_compare(text: &str) -> Result<bool> {
    for (symbol, op) in FALLBACK_OPERATORS {
        if let Some(pos) = find_outside_quotes(text, symbol) {
            let left = parse_operand(&text[..pos]);
            let right = parse_operand(&text[pos + symbol.len()..]);
            return compare::apply(*op, Some(&left), &right, None);
        }
    }
    Err(FlowError::ConditionEvaluation(format!(
        "no comparison operator in '{}'",
        text
    )))
}

fn find_outside_quotes(text: &str, needle: &str) -> Option<usize> {
    let mut in_string = false;
    let mut escaped = false;
    for (idx, c) in text.char_indices() {
        if in_string {
            match c {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => in_string = false,
                _ => escaped = false,
            }
            continue;
        }
        if c == '"' {
            in_string = true;
            continue;
        }
        if text[idx..].starts_with(needle) {
            return Some(idx);
        }
    }
    None
}

fn parse_operand(raw: &str) -> Value {
    let raw = raw.trim();
    if raw == "()" {
        return Value::Null;
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> Engine {
        sandbox_engine(&ConditionSettings::default())
    }

    #[test]
    fn test_substitute_paths_and_names() {
        let ctx = json!({"output": {"score": 91}, "approved": true, "name": "Ada"});
        assert_eq!(
            substitute("${output.score} > 80 and $approved", &ctx),
            "91 > 80 && true"
        );
        assert_eq!(substitute("$name == 'Ada'", &ctx), r#""Ada" == "Ada""#);
        assert_eq!(substitute("$missing == None", &ctx), "() == ()");
    }

    #[test]
    fn test_substitute_leaves_string_contents() {
        let ctx = json!({});
        assert_eq!(substitute(r#""a and b" == "x""#, &ctx), r#""a and b" == "x""#);
    }

    #[test]
    fn test_object_literal() {
        let lit = to_rhai_literal(&json!({"a": [1, "two"], "b": null}));
        assert_eq!(lit, r#"#{"a": [1, "two"], "b": ()}"#);
    }

    #[test]
    fn test_evaluate_arithmetic_and_logic() {
        let ctx = json!({"output": {"score": 91, "weight": 2}});
        assert!(evaluate(&engine(), "${output.score} * $output.weight > 150", &ctx).unwrap());
        assert!(!evaluate(&engine(), "${output.score} < 50 or false", &ctx).unwrap());
        assert!(evaluate(&engine(), "not (${output.score} < 50)", &ctx).unwrap());
    }

    #[test]
    fn test_fallback_for_bare_words() {
        let ctx = json!({"status": "approved"});
        // `approved` is not a variable in the sandbox, so the fallback compares text.
        assert!(evaluate(&engine(), "$status == approved", &ctx).unwrap());
        assert!(!evaluate(&engine(), "$status == rejected", &ctx).unwrap());
    }

    #[test]
    fn test_no_ambient_functions() {
        let ctx = json!({});
        assert!(evaluate(&engine(), r#"system("rm -rf /")"#, &ctx).is_err());
    }

    #[test]
    fn test_non_boolean_result_is_error() {
        let ctx = json!({"n": 3});
        assert!(evaluate(&engine(), "$n + 1", &ctx).is_err());
    }
}
