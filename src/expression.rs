//! CEL evaluation for `expression`-sourced extractors.
//!
//! The expression sees the step's `response` and `request` plus every
//! visible variable, e.g. `size(response.body.items)` or
//! `response.headers["content-type"]`.

use crate::error::{EngineError, Result};
use crate::model::VariableMap;
use cel::{Context, Program};
use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, LazyLock};
use tracing::debug;

static LEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\blen\(").expect("failed to compile len regex"));

static TYPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\btype\(").expect("failed to compile type regex"));

/// Evaluate `expr` against `vars` and convert the result to JSON.
pub fn evaluate(expr: &str, vars: &VariableMap) -> Result<Value> {
    let program = compile(expr)?;
    let context = build_context(vars)?;
    let result = program
        .execute(&context)
        .map_err(|e| EngineError::Extraction(format!("'{expr}': {e}")))?;

    result
        .json()
        .map_err(|e| EngineError::Extraction(format!("'{expr}' is not JSON-representable: {e}")))
}

/// `len(x)` → `size(x)`, `type(x)` → `type_of(x)`.
fn preprocess(expr: &str) -> String {
    let out = LEN_RE.replace_all(expr, "size(");
    TYPE_RE.replace_all(&out, "type_of(").into_owned()
}

fn compile(expr: &str) -> Result<Program> {
    let processed = preprocess(expr);
    debug!("Compiling CEL expression: {processed}");
    Program::compile(&processed)
        .map_err(|e| EngineError::config(format!("invalid expression '{processed}': {e}")))
}

fn build_context<'a>(vars: &VariableMap) -> Result<Context<'a>> {
    let mut context = Context::default();
    for (key, value) in vars {
        // CEL identifiers cannot hold every variable name a scope allows.
        if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            continue;
        }
        context
            .add_variable(key.as_str(), value.clone())
            .map_err(|e| EngineError::Extraction(format!("cannot bind '{key}': {e}")))?;
    }
    register_functions(&mut context);
    Ok(context)
}

fn register_functions(context: &mut Context<'_>) {
    context.add_function("type_of", |v: cel::Value| -> Arc<String> {
        let t = match v {
            cel::Value::Int(_) | cel::Value::UInt(_) => "int",
            cel::Value::Float(_) => "float",
            cel::Value::String(_) => "string",
            cel::Value::Bool(_) => "bool",
            cel::Value::List(_) => "list",
            cel::Value::Map(_) => "map",
            cel::Value::Null => "null",
            cel::Value::Bytes(_) => "bytes",
            _ => "unknown",
        };
        Arc::new(t.to_string())
    });

    context.add_function("urlencode", |s: Arc<String>| -> Arc<String> {
        Arc::new(url::form_urlencoded::byte_serialize(s.as_bytes()).collect::<String>())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outcome_vars() -> VariableMap {
        let mut vars = VariableMap::new();
        vars.insert(
            "response".into(),
            json!({
                "status_code": 201,
                "headers": {"content-type": "application/json"},
                "body": {"id": "us_01", "items": [1, 2, 3]}
            }),
        );
        vars
    }

    #[test]
    fn test_field_access() {
        let vars = outcome_vars();
        assert_eq!(evaluate("response.body.id", &vars).unwrap(), json!("us_01"));
        assert_eq!(
            evaluate("response.headers[\"content-type\"]", &vars).unwrap(),
            json!("application/json")
        );
    }

    #[test]
    fn test_size_and_len_alias() {
        let vars = outcome_vars();
        assert_eq!(evaluate("size(response.body.items)", &vars).unwrap(), json!(3));
        assert_eq!(
            evaluate("len(response.body.items) == 3", &vars).unwrap(),
            json!(true)
        );
    }

    #[test]
    fn test_type_alias() {
        let vars = outcome_vars();
        assert_eq!(evaluate("type(response.body.items)", &vars).unwrap(), json!("list"));
    }

    #[test]
    fn test_urlencode() {
        let mut vars = VariableMap::new();
        vars.insert("q".into(), json!("a b&c"));
        assert_eq!(evaluate("urlencode(q)", &vars).unwrap(), json!("a+b%26c"));
    }

    #[test]
    fn test_missing_field_is_extraction_error() {
        let vars = outcome_vars();
        let err = evaluate("response.body.missing", &vars).unwrap_err();
        assert!(matches!(err, EngineError::Extraction(_)));
    }

    #[test]
    fn test_compile_error_is_configuration_error() {
        let vars = VariableMap::new();
        let err = evaluate("invalid %%% expr", &vars).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }
}
