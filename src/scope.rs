//! Layered variable scopes of a case run.
//!
//! The session scope lives for the whole case run and collects
//! extracted values. The step scope is rebuilt for every step from the
//! session plus the step's declared defaults, and additionally holds
//! hook bindings and the step's `request`/`response`.

use crate::assertion::{self, ComparatorError};
use crate::backend::Outcome;
use crate::error::{EngineError, Result};
use crate::model::{CheckResult, ValidationRecord, Validator, VariableMap};
use crate::resolver::{Lookup, Resolver};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Setup,
    Teardown,
}

/// Overall result of a step's validators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Failed,
    Errored,
}

#[derive(Debug, Clone, Default)]
pub struct VariableScope {
    session: VariableMap,
    step: VariableMap,
}

impl Lookup for VariableScope {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.step.get(name).or_else(|| self.session.get(name))
    }
}

impl VariableScope {
    pub fn new(initial: VariableMap) -> Self {
        Self {
            session: initial,
            step: VariableMap::new(),
        }
    }

    pub fn session(&self) -> &VariableMap {
        &self.session
    }

    pub fn step(&self) -> &VariableMap {
        &self.step
    }

    /// Reset the step scope for a new step. Declared defaults never
    /// shadow a session value of the same name.
    pub fn init_step(&mut self, declared: &VariableMap, resolver: &Resolver<'_>) -> Result<()> {
        self.step = self.session.clone();
        let lenient = resolver.lenient();
        for (name, raw) in declared {
            if self.step.contains_key(name) {
                continue;
            }
            let value = lenient.resolve(raw, &*self)?;
            self.step.insert(name.clone(), value);
        }
        Ok(())
    }

    /// Merge bindings into the session; last writer wins. The bindings
    /// are visible to the rest of the current step as well.
    pub fn update_session(&mut self, bindings: VariableMap) {
        for (name, value) in bindings {
            self.step.insert(name.clone(), value.clone());
            self.session.insert(name, value);
        }
    }

    pub fn bind_step(&mut self, name: impl Into<String>, value: Value) {
        self.step.insert(name.into(), value);
    }

    /// Run hook expressions in order. A single-key mapping binds its
    /// resolved value into the step scope.
    pub fn run_hooks(
        &mut self,
        hooks: &[Value],
        phase: HookPhase,
        resolver: &Resolver<'_>,
    ) -> Result<()> {
        for hook in hooks {
            match hook {
                Value::Object(map) if map.len() == 1 => {
                    if let Some((name, expr)) = map.iter().next() {
                        let value = resolver.resolve(expr, &*self)?;
                        debug!(?phase, name = %name, "Hook bound variable");
                        self.step.insert(name.clone(), value);
                    }
                }
                other => {
                    resolver.resolve(other, &*self)?;
                    debug!(?phase, "Hook evaluated");
                }
            }
        }
        Ok(())
    }

    /// Check every validator and report all of them.
    pub fn validate(
        &self,
        validators: &[Validator],
        outcome: Option<&Outcome>,
        resolver: &Resolver<'_>,
    ) -> (Vec<ValidationRecord>, Verdict) {
        let records: Vec<ValidationRecord> = validators
            .iter()
            .map(|v| self.check(v, outcome, resolver))
            .collect();

        let verdict = if records.iter().any(|r| r.result == CheckResult::Error) {
            Verdict::Errored
        } else if records.iter().any(|r| r.result == CheckResult::Fail) {
            Verdict::Failed
        } else {
            Verdict::Passed
        };
        (records, verdict)
    }

    fn check(
        &self,
        validator: &Validator,
        outcome: Option<&Outcome>,
        resolver: &Resolver<'_>,
    ) -> ValidationRecord {
        let mut record = ValidationRecord {
            comparator: validator.comparator.clone(),
            actual: validator.actual.clone(),
            expected: validator.expected.clone(),
            result: CheckResult::Error,
            message: None,
        };

        let Some(entry) = assertion::lookup(&validator.comparator) else {
            record.message = Some(format!("unknown comparator '{}'", validator.comparator));
            return record;
        };
        let operands = self
            .resolve_actual(&validator.actual, outcome, resolver)
            .and_then(|actual| Ok((actual, resolver.resolve(&validator.expected, self)?)));
        let (actual, expected) = match operands {
            Ok(pair) => pair,
            Err(e) => {
                record.message = Some(e.to_string());
                return record;
            }
        };

        record.result = match (entry.func)(&actual, &expected) {
            Ok(()) => CheckResult::Pass,
            Err(ComparatorError::Mismatch(msg)) => {
                record.message = Some(msg);
                CheckResult::Fail
            }
            Err(ComparatorError::Invalid(msg)) => {
                record.message = Some(msg);
                CheckResult::Error
            }
        };
        record.actual = actual;
        record.expected = expected;
        record
    }

    /// A plain string addressing the outcome (`status_code`,
    /// `body.data.id`, `request.url`) is a field lookup; strings with
    /// tokens are resolved; anything else is a literal.
    fn resolve_actual(
        &self,
        actual: &Value,
        outcome: Option<&Outcome>,
        resolver: &Resolver<'_>,
    ) -> Result<Value> {
        match (actual, outcome) {
            (Value::String(s), _) if s.contains('$') => resolver.resolve(actual, self),
            (Value::String(s), Some(outcome)) if outcome.addresses(s) => {
                outcome.require(s).cloned()
            }
            (Value::String(_), _) => Ok(actual.clone()),
            _ => resolver.resolve(actual, self),
        }
    }
}

/// Reject validators naming an unknown comparator.
pub fn ensure_comparators(validators: &[Validator]) -> Result<()> {
    for v in validators {
        if assertion::lookup(&v.comparator).is_none() {
            return Err(EngineError::config(format!(
                "unknown comparator '{}'",
                v.comparator
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::FunctionRegistry;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> VariableMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn validator(comparator: &str, actual: Value, expected: Value) -> Validator {
        Validator {
            comparator: comparator.into(),
            actual,
            expected,
        }
    }

    #[test]
    fn test_step_defaults_do_not_shadow_session() {
        let funcs = FunctionRegistry::new();
        let resolver = Resolver::new(&funcs);
        let mut scope = VariableScope::new(vars(&[("user", json!("alice"))]));
        let declared = vars(&[
            ("user", json!("default")),
            ("greeting", json!("hi $user")),
            ("later", json!("$missing")),
        ]);
        scope.init_step(&declared, &resolver).unwrap();
        assert_eq!(scope.lookup("user"), Some(&json!("alice")));
        assert_eq!(scope.lookup("greeting"), Some(&json!("hi alice")));
        assert_eq!(scope.lookup("later"), Some(&json!("$missing")));
    }

    #[test]
    fn test_session_updates_survive_step_reset() {
        let funcs = FunctionRegistry::new();
        let resolver = Resolver::new(&funcs);
        let mut scope = VariableScope::default();
        scope.init_step(&VariableMap::new(), &resolver).unwrap();
        scope.bind_step("local", json!(1));
        scope.update_session(vars(&[("token", json!("abc"))]));
        scope.update_session(vars(&[("token", json!("xyz"))]));
        assert_eq!(scope.lookup("token"), Some(&json!("xyz")));

        scope.init_step(&VariableMap::new(), &resolver).unwrap();
        assert_eq!(scope.lookup("token"), Some(&json!("xyz")));
        assert_eq!(scope.lookup("local"), None);
    }

    #[test]
    fn test_hooks_bind_and_propagate_errors() {
        let mut funcs = FunctionRegistry::new();
        funcs.register("now", |_: &crate::functions::CallArgs| Ok(json!(1700)));
        let resolver = Resolver::new(&funcs);
        let mut scope = VariableScope::default();
        scope
            .run_hooks(&[json!({"ts": "${now()}"}), json!("${now()}")], HookPhase::Setup, &resolver)
            .unwrap();
        assert_eq!(scope.lookup("ts"), Some(&json!(1700)));

        let err = scope
            .run_hooks(&[json!("${nope()}")], HookPhase::Teardown, &resolver)
            .unwrap_err();
        assert!(matches!(err, EngineError::FunctionNotFound(_)));
    }

    #[test]
    fn test_validate_collects_every_record() {
        let funcs = FunctionRegistry::new();
        let resolver = Resolver::new(&funcs);
        let scope = VariableScope::new(vars(&[("expected_id", json!("u1"))]));
        let outcome = Outcome {
            response: json!({"status_code": 200, "body": {"id": "u1", "items": [1, 2]}}),
            ..Default::default()
        };
        let validators = vec![
            validator("equals", json!("status_code"), json!(201)),
            validator("equals", json!("body.id"), json!("$expected_id")),
            validator("_19length_equals", json!("body.items"), json!(2)),
        ];
        let (records, verdict) = scope.validate(&validators, Some(&outcome), &resolver);
        assert_eq!(verdict, Verdict::Failed);
        let results: Vec<CheckResult> = records.iter().map(|r| r.result).collect();
        assert_eq!(
            results,
            vec![CheckResult::Fail, CheckResult::Pass, CheckResult::Pass]
        );
        assert_eq!(records[1].expected, json!("u1"));
    }

    #[test]
    fn test_validate_errors_outrank_failures() {
        let funcs = FunctionRegistry::new();
        let resolver = Resolver::new(&funcs);
        let scope = VariableScope::default();
        let outcome = Outcome {
            response: json!({"body": {"count": "3"}}),
            ..Default::default()
        };
        let validators = vec![
            validator("equals", json!("literal"), json!("other")),
            validator("less_than", json!("body.count"), json!(5)),
            validator("equals", json!("body.missing"), json!(1)),
        ];
        let (records, verdict) = scope.validate(&validators, Some(&outcome), &resolver);
        assert_eq!(verdict, Verdict::Errored);
        assert_eq!(records[0].result, CheckResult::Fail);
        assert_eq!(records[1].result, CheckResult::Error);
        assert_eq!(records[2].result, CheckResult::Error);
    }

    #[test]
    fn test_no_validators_passes() {
        let funcs = FunctionRegistry::new();
        let resolver = Resolver::new(&funcs);
        let (records, verdict) = VariableScope::default().validate(&[], None, &resolver);
        assert!(records.is_empty());
        assert_eq!(verdict, Verdict::Passed);
    }

    #[test]
    fn test_ensure_comparators() {
        assert!(ensure_comparators(&[validator("eq", json!(1), json!(1))]).is_ok());
        assert!(ensure_comparators(&[validator("roughly", json!(1), json!(1))]).is_err());
    }
}
