//! Edge condition evaluation.
//!
//! A condition config is the JSON stored on a connection:
//! `{"type": "simple" | "expression" | "user_choice" | "compound" | "script", ...}`.
//! A missing or empty config always holds, so unconditional edges need no
//! special casing anywhere in the engine.

pub mod compare;
pub mod expression;
pub mod script;

use std::time::Duration;

use rhai::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use flowline_core::config::ConditionSettings;
use flowline_core::error::{FlowError, Result};

pub use compare::{Operator, ValueType};

/// Logical combinator of a `compound` condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    #[serde(alias = "AND", alias = "&&")]
    And,
    #[serde(alias = "OR", alias = "||")]
    Or,
    #[serde(alias = "NOT", alias = "!")]
    Not,
}

/// Parsed condition config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionConfig {
    Simple {
        field_path: String,
        operator: Operator,
        #[serde(default)]
        expected_value: Value,
        #[serde(default)]
        value_type: Option<ValueType>,
    },
    Expression {
        expression: String,
    },
    UserChoice {
        choice_key: String,
        /// Node instance (or node) whose selection is consulted; defaults to
        /// the edge's source.
        #[serde(default)]
        node_id: Option<String>,
        #[serde(default)]
        default_value: bool,
    },
    Compound {
        operator: LogicalOperator,
        /// Sub-conditions are kept raw so each goes through `evaluate`.
        #[serde(default)]
        conditions: Vec<Value>,
    },
    Script {
        script: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
}

/// True for `null`, `{}`, and blank strings.
pub fn is_unconditional(config: Option<&Value>) -> bool {
    match config {
        None | Some(Value::Null) => true,
        Some(Value::Object(map)) => map.is_empty(),
        Some(Value::String(s)) => s.trim().is_empty(),
        _ => false,
    }
}

/// Stateless evaluator for edge conditions.
pub struct ConditionEngine {
    settings: ConditionSettings,
    expressions: Engine,
}

impl ConditionEngine {
    pub fn new(settings: ConditionSettings) -> Self {
        let expressions = expression::sandbox_engine(&settings);
        Self {
            settings,
            expressions,
        }
    }

    /// Evaluate a condition config. Never fails: errors are logged and read
    /// as `false`.
    pub fn evaluate(&self, config: Option<&Value>, context: &Value) -> bool {
        if is_unconditional(config) {
            return true;
        }
        let result = parse(config).and_then(|parsed| self.evaluate_config(&parsed, context));
        match result {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Condition evaluation failed, treating as false");
                false
            }
        }
    }

    fn evaluate_config(&self, config: &ConditionConfig, context: &Value) -> Result<bool> {
        match config {
            ConditionConfig::Simple {
                field_path,
                operator,
                expected_value,
                value_type,
            } => compare::apply(
                *operator,
                compare::lookup(context, field_path),
                expected_value,
                *value_type,
            ),
            ConditionConfig::Expression { expression } => {
                expression::evaluate(&self.expressions, expression, context)
            }
            ConditionConfig::UserChoice {
                choice_key,
                node_id,
                default_value,
            } => Ok(user_choice(context, choice_key, node_id.as_deref())
                .unwrap_or(*default_value)),
            ConditionConfig::Compound {
                operator,
                conditions,
            } => Ok(match operator {
                LogicalOperator::And => conditions
                    .iter()
                    .all(|c| self.evaluate(Some(c), context)),
                LogicalOperator::Or => conditions
                    .iter()
                    .any(|c| self.evaluate(Some(c), context)),
                LogicalOperator::Not => match conditions.first() {
                    Some(first) => !self.evaluate(Some(first), context),
                    None => {
                        return Err(FlowError::ConditionEvaluation(
                            "'not' needs one sub-condition".to_string(),
                        ))
                    }
                },
            }),
            ConditionConfig::Script { script, timeout_ms } => {
                let timeout = Duration::from_millis(
                    timeout_ms.unwrap_or(self.settings.script_timeout_ms),
                );
                script::evaluate(&self.settings, script, timeout, context)
            }
        }
    }

    /// Structural problems of a config, without evaluating it. Empty when valid.
    pub fn validate(&self, config: Option<&Value>) -> Vec<String> {
        let mut errors = Vec::new();
        self.validate_into(config, "", &mut errors);
        errors
    }

    fn validate_into(&self, config: Option<&Value>, at: &str, errors: &mut Vec<String>) {
        if is_unconditional(config) {
            return;
        }
        let raw = match config.map(normalize) {
            Some(Ok(v)) => v,
            Some(Err(e)) => {
                errors.push(format!("{}{}", at, e));
                return;
            }
            None => return,
        };
        match raw.get("type").and_then(Value::as_str) {
            None => {
                errors.push(format!("{}missing 'type'", at));
                return;
            }
            Some("simple" | "expression" | "user_choice" | "compound" | "script") => {}
            Some(other) => {
                errors.push(format!("{}unknown condition type '{}'", at, other));
                return;
            }
        }
        let parsed: ConditionConfig = match serde_json::from_value(raw) {
            Ok(p) => p,
            Err(e) => {
                errors.push(format!("{}{}", at, e));
                return;
            }
        };
        match &parsed {
            ConditionConfig::Simple {
                field_path,
                operator,
                expected_value,
                ..
            } => {
                if field_path.trim().is_empty() {
                    errors.push(format!("{}'field_path' is empty", at));
                }
                if !operator.is_unary() && expected_value.is_null() {
                    errors.push(format!("{}'expected_value' is required for {:?}", at, operator));
                }
                if *operator == Operator::RegexMatch {
                    let pattern = compare::as_plain_string(expected_value);
                    if let Err(e) = regex::Regex::new(&pattern) {
                        errors.push(format!("{}invalid regex '{}': {}", at, pattern, e));
                    }
                }
            }
            ConditionConfig::Expression { expression } => {
                if expression.trim().is_empty() {
                    errors.push(format!("{}'expression' is empty", at));
                } else if has_unclosed_placeholder(expression) {
                    errors.push(format!("{}unclosed '${{' in expression", at));
                }
            }
            ConditionConfig::UserChoice { choice_key, .. } => {
                if choice_key.trim().is_empty() {
                    errors.push(format!("{}'choice_key' is empty", at));
                }
            }
            ConditionConfig::Compound { conditions, .. } => {
                if conditions.is_empty() {
                    errors.push(format!("{}'conditions' is empty", at));
                }
                for (i, sub) in conditions.iter().enumerate() {
                    self.validate_into(Some(sub), &format!("{}conditions[{}]: ", at, i), errors);
                }
            }
            ConditionConfig::Script { script, .. } => {
                if script.trim().is_empty() {
                    errors.push(format!("{}'script' is empty", at));
                } else if let Err(e) = script::check(&self.settings, script) {
                    errors.push(format!("{}script does not compile: {}", at, e));
                }
            }
        }
    }
}

impl Default for ConditionEngine {
    fn default() -> Self {
        Self::new(ConditionSettings::default())
    }
}

/// Configs may be stored as JSON text; parse those into objects.
fn normalize(config: &Value) -> Result<Value> {
    match config {
        Value::String(text) => serde_json::from_str(text).map_err(|e| {
            FlowError::ConditionEvaluation(format!("condition is not valid JSON: {}", e))
        }),
        other => Ok(other.clone()),
    }
}

fn has_unclosed_placeholder(expression: &str) -> bool {
    let mut rest = expression;
    while let Some(start) = rest.find("${") {
        match rest[start..].find('}') {
            Some(end) => rest = &rest[start + end + 1..],
            None => return true,
        }
    }
    false
}

fn parse(config: Option<&Value>) -> Result<ConditionConfig> {
    let raw = normalize(config.unwrap_or(&Value::Null))?;
    serde_json::from_value(raw)
        .map_err(|e| FlowError::ConditionEvaluation(format!("bad condition config: {}", e)))
}

/// Recorded selection for `choice_key`, or `None` when nothing was recorded.
///
/// Selections live under `user_selections.<node>`; a list means "these keys
/// were chosen", a map carries an explicit value per key.
fn user_choice(context: &Value, choice_key: &str, node: Option<&str>) -> Option<bool> {
    let selections = context.get("user_selections")?;
    let candidates: Vec<&str> = match node {
        Some(n) => vec![n],
        None => ["node_instance_id", "node_id"]
            .iter()
            .filter_map(|k| context.get("node").and_then(|n| n.get(*k)).and_then(Value::as_str))
            .collect(),
    };
    let recorded = candidates.iter().find_map(|key| selections.get(*key))?;
    match recorded {
        Value::Array(chosen) => Some(chosen.iter().any(|c| c.as_str() == Some(choice_key))),
        Value::Object(map) => map.get(choice_key).map(truthy),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> ConditionEngine {
        ConditionEngine::default()
    }

    #[test]
    fn test_empty_configs_hold() {
        let ctx = json!({});
        let e = engine();
        assert!(e.evaluate(None, &ctx));
        assert!(e.evaluate(Some(&Value::Null), &ctx));
        assert!(e.evaluate(Some(&json!({})), &ctx));
        assert!(e.evaluate(Some(&json!("")), &ctx));
        assert!(e.evaluate(Some(&json!("   ")), &ctx));
    }

    #[test]
    fn test_simple_approved_vs_rejected() {
        let cond = json!({
            "type": "simple",
            "field_path": "output.status",
            "operator": "equals",
            "expected_value": "approved"
        });
        let e = engine();
        assert!(e.evaluate(Some(&cond), &json!({"output": {"status": "approved"}})));
        assert!(!e.evaluate(Some(&cond), &json!({"output": {"status": "rejected"}})));
    }

    #[test]
    fn test_config_as_json_text() {
        let cond = json!(r#"{"type":"simple","field_path":"n","operator":"gt","expected_value":3}"#);
        assert!(engine().evaluate(Some(&cond), &json!({"n": 4})));
    }

    #[test]
    fn test_malformed_config_is_false() {
        let e = engine();
        assert!(!e.evaluate(Some(&json!({"type": "nonsense"})), &json!({})));
        assert!(!e.evaluate(Some(&json!("{not json")), &json!({})));
        assert!(!e.evaluate(Some(&json!(42)), &json!({})));
    }

    #[test]
    fn test_user_choice_list_and_map() {
        let cond = json!({"type": "user_choice", "choice_key": "review"});
        let ctx = json!({
            "node": {"node_instance_id": "ni-1", "node_id": "triage"},
            "user_selections": {"ni-1": ["review"]}
        });
        assert!(engine().evaluate(Some(&cond), &ctx));

        let ctx = json!({
            "node": {"node_instance_id": "ni-2", "node_id": "triage"},
            "user_selections": {"triage": {"review": false}}
        });
        assert!(!engine().evaluate(Some(&cond), &ctx));
    }

    #[test]
    fn test_user_choice_default() {
        let ctx = json!({"node": {"node_instance_id": "x"}});
        let yes = json!({"type": "user_choice", "choice_key": "k", "default_value": true});
        let no = json!({"type": "user_choice", "choice_key": "k"});
        assert!(engine().evaluate(Some(&yes), &ctx));
        assert!(!engine().evaluate(Some(&no), &ctx));
    }

    #[test]
    fn test_compound() {
        let ctx = json!({"a": 1, "b": 2});
        let is_a = json!({"type": "simple", "field_path": "a", "operator": "equals", "expected_value": 1});
        let is_b3 = json!({"type": "simple", "field_path": "b", "operator": "equals", "expected_value": 3});
        let e = engine();

        assert!(!e.evaluate(Some(&json!({"type": "compound", "operator": "and", "conditions": [is_a, is_b3]})), &ctx));
        assert!(e.evaluate(Some(&json!({"type": "compound", "operator": "or", "conditions": [is_a, is_b3]})), &ctx));
        // `not` looks at the first sub-condition only.
        assert!(e.evaluate(Some(&json!({"type": "compound", "operator": "not", "conditions": [is_b3, is_a]})), &ctx));
        assert!(e.evaluate(Some(&json!({"type": "compound", "operator": "and", "conditions": []})), &ctx));
        assert!(!e.evaluate(Some(&json!({"type": "compound", "operator": "or", "conditions": []})), &ctx));
    }

    #[test]
    fn test_expression_and_script() {
        let ctx = json!({"output": {"score": 91}});
        let e = engine();
        assert!(e.evaluate(Some(&json!({"type": "expression", "expression": "${output.score} >= 90"})), &ctx));
        assert!(e.evaluate(Some(&json!({"type": "script", "script": "output.score % 2 == 1"})), &ctx));
        assert!(!e.evaluate(Some(&json!({"type": "script", "script": "throw \"no\""})), &ctx));
    }

    #[test]
    fn test_validate() {
        let e = engine();
        assert!(e.validate(None).is_empty());
        assert!(e
            .validate(Some(&json!({"type": "simple", "field_path": "x", "operator": "is_empty"})))
            .is_empty());

        let errors = e.validate(Some(&json!({"type": "simple", "field_path": "", "operator": "equals"})));
        assert_eq!(errors.len(), 2);

        let errors = e.validate(Some(&json!({"type": "simple", "field_path": "x", "operator": "regex_match", "expected_value": "("})));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("invalid regex"));

        let errors = e.validate(Some(&json!({"type": "expression", "expression": "${a.b > 1"})));
        assert!(errors[0].contains("unclosed"));

        let errors = e.validate(Some(&json!({"type": "teleport"})));
        assert!(errors[0].contains("unknown condition type"));

        let errors = e.validate(Some(&json!({"type": "compound", "operator": "and", "conditions": [
            {"type": "script", "script": "let = 3"}
        ]})));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("conditions[0]: "));

        let errors = e.validate(Some(&json!({"type": "simple", "field_path": "x", "operator": "approximately", "expected_value": 1})));
        assert_eq!(errors.len(), 1);
    }
}
