//! `script` conditions: a rhai snippet with the context bound as `context`
//! (and its `output` field as `output`), an operation cap and a wall-clock timeout.

use std::time::{Duration, Instant};

use rhai::{Dynamic, Scope};
use serde_json::Value;

use flowline_core::config::ConditionSettings;
use flowline_core::error::{FlowError, Result};

use super::expression::sandbox_engine;

pub fn evaluate(
    settings: &ConditionSettings,
    script: &str,
    timeout: Duration,
    context: &Value,
) -> Result<bool> {
    let mut engine = sandbox_engine(settings);
    let started = Instant::now();
    engine.on_progress(move |_| {
        if started.elapsed() >= timeout {
            Some(Dynamic::from("script timed out"))
        } else {
            None
        }
    });

    let mut scope = Scope::new();
    scope.push_constant("context", to_dynamic(context)?);
    let output = match context.get("output") {
        Some(output) => to_dynamic(output)?,
        None => Dynamic::UNIT,
    };
    scope.push_constant("output", output);

    let result: Dynamic = engine
        .eval_with_scope(&mut scope, script)
        .map_err(|e| FlowError::ConditionEvaluation(format!("script failed: {}", e)))?;

    result.as_bool().map_err(|type_name| {
        FlowError::ConditionEvaluation(format!("script returned {} instead of bool", type_name))
    })
}

/// Compile without running, for validation.
pub fn check(settings: &ConditionSettings, script: &str) -> std::result::Result<(), String> {
    let mut scope = Scope::new();
    scope.push_constant("context", Dynamic::UNIT);
    scope.push_constant("output", Dynamic::UNIT);
    sandbox_engine(settings)
        .compile_with_scope(&scope, script)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

fn to_dynamic(value: &Value) -> Result<Dynamic> {
    rhai::serde::to_dynamic(value)
        .map_err(|e| FlowError::ConditionEvaluation(format!("context not representable: {}", e)))
}
