//! Step runner.
//!
//! A step moves through skip check, preflight, setup, dispatch,
//! extraction, teardown and validation, and always ends in one of
//! `Success`, `Failed`, `Errored` or `Skipped`. Errors never escape:
//! they are recorded on the [`StepResult`] with the phase they came
//! from.

use crate::backend::{ActionBackend, Outcome};
use crate::error::{EngineError, Result};
use crate::expression;
use crate::model::{
    Action, CheckResult, ExtractSource, Extractor, RunContext, Status, Step, StepError,
    StepPhase, StepResult, ValidationRecord, Validator, VariableMap,
};
use crate::resolver::{render, Lookup, Resolver};
use crate::scope::{self, HookPhase, Verdict, VariableScope};
use crate::skip;
use indexmap::IndexMap;
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Runs the steps of one case run against a single backend.
pub struct StepRunner<'a> {
    backend: &'a mut dyn ActionBackend,
    resolver: Resolver<'a>,
    run: &'a RunContext,
    headers: &'a IndexMap<String, Value>,
}

impl<'a> StepRunner<'a> {
    pub fn new(
        backend: &'a mut dyn ActionBackend,
        resolver: Resolver<'a>,
        run: &'a RunContext,
        headers: &'a IndexMap<String, Value>,
    ) -> Self {
        Self {
            backend,
            resolver,
            run,
            headers,
        }
    }

    /// Run `step`. `case_failed` tells whether an earlier step of the
    /// case failed or errored.
    #[instrument(skip_all, fields(step = %step.name, index = index))]
    pub async fn run(
        &mut self,
        step: &Step,
        index: usize,
        scope: &mut VariableScope,
        case_failed: bool,
    ) -> StepResult {
        let started = Instant::now();

        if !step.enabled {
            debug!("Step disabled");
            return StepResult::skipped(&step.name, index, "step disabled");
        }
        if let Some(reason) = skip::evaluate(step.skip, &step.skip_if, self.run, case_failed) {
            info!("Skipping step: {reason}");
            return StepResult::skipped(&step.name, index, reason);
        }

        let mut result = StepResult::new(&step.name, index);
        result.status = Status::Running;

        let action = match preflight(step) {
            Ok(action) => action,
            Err(e) => {
                warn!("Step definition rejected: {e}");
                result.error = Some(StepError::new(StepPhase::Preflight, &e));
                return finish(result, Status::Errored, scope, started);
            }
        };

        let mut error: Option<(StepPhase, EngineError)> = None;
        let mut outcome: Option<Outcome> = None;

        if let Err(e) = scope.init_step(&step.variables, &self.resolver) {
            error = Some((StepPhase::Setup, e));
        } else if let Err(e) = scope.run_hooks(&step.setup_hooks, HookPhase::Setup, &self.resolver)
        {
            error = Some((StepPhase::Setup, e));
        }

        let check = assertion_record(&action);
        if error.is_none() {
            match self.dispatch(action, scope, &mut result).await {
                Ok(o) => outcome = Some(o),
                Err(e) => error = Some((StepPhase::Dispatch, e)),
            }
        }

        if error.is_none() {
            if let Some(o) = &outcome {
                if let Err(e) = self.extract(&step.extract, o, scope, &mut result) {
                    error = Some((StepPhase::Extract, e));
                }
            }
        }

        if let Some(o) = &outcome {
            scope.bind_step("request", o.request.clone());
            scope.bind_step("response", o.response.clone());
            result.request = Some(o.request.clone());
            result.response = Some(o.response.clone());
            result.screenshots.extend(o.screenshots.iter().cloned());
        }

        if let Err(e) = scope.run_hooks(&step.teardown_hooks, HookPhase::Teardown, &self.resolver) {
            if error.is_none() {
                error = Some((StepPhase::Teardown, e));
            } else {
                warn!("Teardown failed after an earlier error: {e}");
                result.teardown_error = Some(StepError::new(StepPhase::Teardown, &e));
            }
        }

        let status = match error {
            Some((phase, e)) => {
                let status = match &e {
                    EngineError::Assertion(message) => {
                        result.validations = failed_assertion(check, message, &step.validate);
                        Status::Failed
                    }
                    _ => Status::Errored,
                };
                warn!(?phase, ?status, "Step did not pass: {e}");
                result.error = Some(StepError::new(phase, &e));
                status
            }
            None => {
                let (records, verdict) =
                    scope.validate(&step.validate, outcome.as_ref(), &self.resolver);
                result.validations = records;
                match verdict {
                    Verdict::Passed => Status::Success,
                    Verdict::Failed => Status::Failed,
                    Verdict::Errored => Status::Errored,
                }
            }
        };
        finish(result, status, scope, started)
    }

    async fn dispatch(
        &mut self,
        action: Action,
        scope: &VariableScope,
        result: &mut StepResult,
    ) -> Result<Outcome> {
        let action = match action {
            Action::Http(mut request) => {
                request.headers = merge_headers(self.headers, &request.headers);
                Action::Http(request)
            }
            other => other,
        };
        let resolved = self.resolver.resolve_as(&action, scope)?;
        result.request = match serde_json::to_value(&resolved) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Failed to record resolved action: {e}");
                None
            }
        };
        self.backend.check(&resolved)?;

        debug!(backend = self.backend.name(), "Dispatching action");
        match self.backend.execute(&resolved).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                result.screenshots.extend(self.backend.take_screenshots());
                Err(e)
            }
        }
    }

    fn extract(
        &self,
        extractors: &[Extractor],
        outcome: &Outcome,
        scope: &mut VariableScope,
        result: &mut StepResult,
    ) -> Result<()> {
        for extractor in extractors {
            let value = self.extract_one(extractor, outcome, scope)?;
            debug!(key = %extractor.key, "Extracted variable");
            result.extracted.insert(extractor.key.clone(), value.clone());
            scope.update_session(VariableMap::from([(extractor.key.clone(), value)]));
        }
        Ok(())
    }

    fn extract_one(
        &self,
        extractor: &Extractor,
        outcome: &Outcome,
        scope: &VariableScope,
    ) -> Result<Value> {
        match extractor.source {
            ExtractSource::Response => {
                let path = render(&extractor.expression);
                outcome.require(&path).cloned()
            }
            ExtractSource::Function => self.resolver.resolve(&extractor.expression, scope),
            ExtractSource::Constant => Ok(extractor.expression.clone()),
            ExtractSource::Variable => {
                let raw = render(&extractor.expression);
                let name = raw
                    .trim()
                    .trim_start_matches('$')
                    .trim_start_matches('{')
                    .trim_end_matches('}');
                scope
                    .lookup(name)
                    .cloned()
                    .ok_or_else(|| EngineError::VariableNotFound(name.to_string()))
            }
            ExtractSource::Expression => {
                let mut vars = scope.session().clone();
                for (k, v) in scope.step() {
                    vars.insert(k.clone(), v.clone());
                }
                vars.insert("response".into(), outcome.response.clone());
                vars.insert("request".into(), outcome.request.clone());
                expression::evaluate(&render(&extractor.expression), &vars)
            }
        }
    }
}

/// Static checks that need neither scope nor backend.
fn preflight(step: &Step) -> Result<Action> {
    let action = step.action()?;
    scope::ensure_comparators(&step.validate)?;
    Ok(action)
}

/// Case headers first, step headers override them case-insensitively.
fn merge_headers(
    case: &IndexMap<String, Value>,
    step: &IndexMap<String, Value>,
) -> IndexMap<String, Value> {
    let mut merged: IndexMap<String, Value> = case
        .iter()
        .filter(|(name, _)| !step.keys().any(|k| k.eq_ignore_ascii_case(name)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    merged.extend(step.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Record describing an assertion made by the action itself.
fn assertion_record(action: &Action) -> ValidationRecord {
    let (comparator, actual, expected) = match action {
        Action::Ui(ui) => (
            ui.operation.clone(),
            ui.locator
                .as_ref()
                .map(|l| Value::String(format!("{}={}", l.by, l.value)))
                .unwrap_or(Value::Null),
            ui.text.clone().unwrap_or(Value::Null),
        ),
        Action::Http(req) => (
            "assertion".to_string(),
            Value::String(format!("{} {}", req.method, req.url)),
            Value::Null,
        ),
    };
    ValidationRecord {
        comparator,
        actual,
        expected,
        result: CheckResult::Pass,
        message: None,
    }
}

/// The failed action assertion followed by every configured validator,
/// none of which were evaluated.
fn failed_assertion(
    mut check: ValidationRecord,
    message: &str,
    validators: &[Validator],
) -> Vec<ValidationRecord> {
    check.result = CheckResult::Fail;
    check.message = Some(message.to_string());
    let skipped = validators.iter().map(|v| ValidationRecord {
        comparator: v.comparator.clone(),
        actual: v.actual.clone(),
        expected: v.expected.clone(),
        result: CheckResult::Error,
        message: Some("not evaluated: step assertion failed".to_string()),
    });
    std::iter::once(check).chain(skipped).collect()
}

fn finish(
    mut result: StepResult,
    status: Status,
    scope: &VariableScope,
    started: Instant,
) -> StepResult {
    result.status = status;
    result.variables = scope.session().clone();
    result.duration_ms = started.elapsed().as_millis() as u64;
    info!(status = ?status, duration_ms = result.duration_ms, "Step finished");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::FunctionRegistry;
    use crate::model::{HttpRequest, UiAction};
    use async_trait::async_trait;
    use serde_json::json;

    /// Answers every request with a canned response and records what
    /// it was sent.
    struct CannedBackend {
        response: Value,
        sent: Vec<Action>,
        fail_with: Option<fn() -> EngineError>,
    }

    impl CannedBackend {
        fn new(response: Value) -> Self {
            Self {
                response,
                sent: Vec::new(),
                fail_with: None,
            }
        }
    }

    #[async_trait]
    impl ActionBackend for CannedBackend {
        fn name(&self) -> &'static str {
            "canned"
        }

        fn check(&self, action: &Action) -> Result<()> {
            match action {
                Action::Http(req) => crate::backend::http::parse_method(&req.method).map(|_| ()),
                Action::Ui(_) => Ok(()),
            }
        }

        async fn execute(&mut self, action: &Action) -> Result<Outcome> {
            self.sent.push(action.clone());
            if let Some(fail) = self.fail_with {
                return Err(fail());
            }
            Ok(Outcome {
                request: serde_json::to_value(action).unwrap_or(Value::Null),
                response: self.response.clone(),
                elapsed_ms: 1,
                screenshots: Vec::new(),
            })
        }
    }

    fn http_step(name: &str, url: &str) -> Step {
        Step {
            name: name.into(),
            request: Some(HttpRequest {
                method: "GET".into(),
                url: url.into(),
                headers: IndexMap::new(),
                query: IndexMap::new(),
                body: None,
                timeout_ms: None,
            }),
            ..Default::default()
        }
    }

    fn extractor(key: &str, source: ExtractSource, expression: Value) -> Extractor {
        Extractor {
            key: key.into(),
            source,
            expression,
        }
    }

    fn validator(comparator: &str, actual: Value, expected: Value) -> Validator {
        Validator {
            comparator: comparator.into(),
            actual,
            expected,
        }
    }

    async fn run_one(
        backend: &mut CannedBackend,
        step: &Step,
        scope: &mut VariableScope,
    ) -> StepResult {
        let funcs = FunctionRegistry::new();
        let run = RunContext {
            env: "test".into(),
            ..Default::default()
        };
        let headers: IndexMap<String, Value> =
            IndexMap::from([("X-Env".to_string(), json!("$env_name"))]);
        let mut runner = StepRunner::new(backend, Resolver::new(&funcs), &run, &headers);
        runner.run(step, 0, scope, false).await
    }

    #[tokio::test]
    async fn test_extract_then_validate() {
        let mut backend = CannedBackend::new(json!({
            "status_code": 200,
            "body": {"data": {"token": "t-1", "items": [1, 2, 3]}}
        }));
        let mut step = http_step("login", "/login");
        step.extract = vec![
            extractor("token", ExtractSource::Response, json!("body.data.token")),
            extractor("count", ExtractSource::Expression, json!("size(response.body.data.items)")),
            extractor("fixed", ExtractSource::Constant, json!("$literal")),
            extractor("again", ExtractSource::Variable, json!("$token")),
        ];
        step.validate = vec![
            validator("equals", json!("status_code"), json!(200)),
            validator("_19length_equals", json!("body.data.items"), json!(3)),
        ];
        let mut scope = VariableScope::new(VariableMap::from([("env_name".to_string(), json!("qa"))]));

        let result = run_one(&mut backend, &step, &mut scope).await;
        assert_eq!(result.status, Status::Success, "{:?}", result.error);
        assert_eq!(scope.session().get("token"), Some(&json!("t-1")));
        assert_eq!(scope.session().get("count"), Some(&json!(3)));
        assert_eq!(scope.session().get("fixed"), Some(&json!("$literal")));
        assert_eq!(scope.session().get("again"), Some(&json!("t-1")));
        assert_eq!(result.validations.len(), 2);
        assert_eq!(result.variables.get("token"), Some(&json!("t-1")));

        let Action::Http(sent) = &backend.sent[0] else {
            panic!("expected http action");
        };
        assert_eq!(sent.headers.get("X-Env"), Some(&json!("qa")));
    }

    #[tokio::test]
    async fn test_missing_variable_errors_without_dispatch() {
        let mut backend = CannedBackend::new(json!({}));
        let mut step = http_step("profile", "/users/$user_id");
        step.request.as_mut().unwrap().headers.insert("X-Env".into(), json!("fixed"));
        let mut scope = VariableScope::default();

        let result = run_one(&mut backend, &step, &mut scope).await;
        assert_eq!(result.status, Status::Errored);
        let error = result.error.unwrap();
        assert_eq!(error.phase, StepPhase::Dispatch);
        assert_eq!(error.kind, crate::error::ErrorKind::VariableNotFound);
        assert!(error.message.contains("$user_id"));
        assert!(backend.sent.is_empty());
    }

    #[tokio::test]
    async fn test_missing_response_field_errors() {
        let mut backend = CannedBackend::new(json!({"status_code": 200, "body": {}}));
        let mut step = http_step("s", "http://x.test/");
        step.extract = vec![extractor("id", ExtractSource::Response, json!("body.id"))];
        step.validate = vec![validator("equals", json!("status_code"), json!(200))];
        let mut scope = VariableScope::new(VariableMap::from([("env_name".to_string(), json!("qa"))]));

        let result = run_one(&mut backend, &step, &mut scope).await;
        assert_eq!(result.status, Status::Errored);
        assert_eq!(result.error.unwrap().phase, StepPhase::Extract);
        assert!(result.validations.is_empty());
        assert!(scope.session().get("id").is_none());
    }

    #[tokio::test]
    async fn test_zero_validators_and_failed_validation() {
        let mut backend = CannedBackend::new(json!({"status_code": 500}));
        let mut scope = VariableScope::new(VariableMap::from([("env_name".to_string(), json!("qa"))]));
        let step = http_step("plain", "http://x.test/");
        assert_eq!(run_one(&mut backend, &step, &mut scope).await.status, Status::Success);

        let mut checked = http_step("checked", "http://x.test/");
        checked.validate = vec![validator("equals", json!("status_code"), json!(200))];
        let result = run_one(&mut backend, &checked, &mut scope).await;
        assert_eq!(result.status, Status::Failed);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_preflight_rejections() {
        let mut backend = CannedBackend::new(json!({}));
        let mut scope = VariableScope::default();

        let mut bad_comparator = http_step("s", "http://x.test/");
        bad_comparator.validate = vec![validator("approximately", json!(1), json!(1))];
        let result = run_one(&mut backend, &bad_comparator, &mut scope).await;
        assert_eq!(result.status, Status::Errored);
        assert_eq!(result.error.unwrap().phase, StepPhase::Preflight);

        let mut bad_method = http_step("s", "http://x.test/");
        bad_method.request.as_mut().unwrap().method = "TELEPORT".into();
        bad_method.request.as_mut().unwrap().headers.insert("X-Env".into(), json!("x"));
        let result = run_one(&mut backend, &bad_method, &mut scope).await;
        assert_eq!(result.status, Status::Errored);
        assert_eq!(result.error.unwrap().kind, crate::error::ErrorKind::Configuration);
        assert!(backend.sent.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_and_skipped_steps() {
        let mut backend = CannedBackend::new(json!({}));
        let mut scope = VariableScope::default();
        let mut disabled = http_step("off", "http://x.test/");
        disabled.enabled = false;
        assert_eq!(run_one(&mut backend, &disabled, &mut scope).await.status, Status::Skipped);

        let mut flagged = http_step("flagged", "http://x.test/");
        flagged.skip = true;
        let result = run_one(&mut backend, &flagged, &mut scope).await;
        assert_eq!(result.status, Status::Skipped);
        assert!(result.skip_reason.is_some());
        assert!(backend.sent.is_empty());
    }

    #[tokio::test]
    async fn test_backend_assertion_fails_step_and_teardown_still_runs() {
        let mut backend = CannedBackend::new(json!({}));
        backend.fail_with = Some(|| EngineError::Assertion("element #x is not visible".into()));
        let mut scope = VariableScope::new(VariableMap::from([("env_name".to_string(), json!("qa"))]));
        let mut step = http_step("s", "http://x.test/");
        step.teardown_hooks = vec![json!("${missing_fn()}")];

        let result = run_one(&mut backend, &step, &mut scope).await;
        assert_eq!(result.status, Status::Failed);
        assert_eq!(result.error.as_ref().unwrap().kind, crate::error::ErrorKind::Assertion);
        let teardown = result.teardown_error.unwrap();
        assert_eq!(teardown.phase, StepPhase::Teardown);
    }

    #[tokio::test]
    async fn test_teardown_error_becomes_main_error() {
        let mut backend = CannedBackend::new(json!({"status_code": 200}));
        let mut scope = VariableScope::new(VariableMap::from([("env_name".to_string(), json!("qa"))]));
        let mut step = http_step("s", "http://x.test/");
        step.teardown_hooks = vec![json!("${missing_fn()}")];
        step.validate = vec![validator("equals", json!("status_code"), json!(200))];

        let result = run_one(&mut backend, &step, &mut scope).await;
        assert_eq!(result.status, Status::Errored);
        assert_eq!(result.error.unwrap().phase, StepPhase::Teardown);
        assert!(result.teardown_error.is_none());
        assert!(result.validations.is_empty());
    }

    #[tokio::test]
    async fn test_ui_assertion_reports_every_validator() {
        let mut backend = CannedBackend::new(json!({}));
        backend.fail_with =
            Some(|| EngineError::Assertion("element css=#banner is not visible".into()));
        let mut scope = VariableScope::default();
        let ui: UiAction = serde_json::from_value(json!({
            "operation": "assert_visible",
            "locator": {"by": "css", "value": "#banner"},
        }))
        .unwrap();
        let step = Step {
            name: "banner".into(),
            ui: Some(ui),
            validate: vec![
                validator("equals", json!("$title"), json!("Home")),
                validator("contains", json!("$url"), json!("/home")),
            ],
            ..Default::default()
        };

        let result = run_one(&mut backend, &step, &mut scope).await;
        assert_eq!(result.status, Status::Failed);
        assert_eq!(result.validations.len(), 3);
        let check = &result.validations[0];
        assert_eq!(check.comparator, "assert_visible");
        assert_eq!(check.result, CheckResult::Fail);
        assert_eq!(check.actual, json!("css=#banner"));
        assert!(check.message.as_deref().unwrap().contains("not visible"));
        let configured: Vec<&str> = result.validations[1..]
            .iter()
            .map(|r| r.comparator.as_str())
            .collect();
        assert_eq!(configured, vec!["equals", "contains"]);
        assert!(result.validations[1..]
            .iter()
            .all(|r| r.result == CheckResult::Error));
    }

    #[tokio::test]
    async fn test_step_snapshot_excludes_later_bindings() {
        let mut backend = CannedBackend::new(json!({
            "status_code": 200,
            "body": {"token": "t-9", "name": "amy"}
        }));
        let mut scope = VariableScope::new(VariableMap::from([("env_name".to_string(), json!("qa"))]));
        let mut first = http_step("login", "/login");
        first.extract = vec![extractor("token", ExtractSource::Response, json!("body.token"))];
        let mut second = http_step("profile", "/profile");
        second.extract = vec![extractor("later", ExtractSource::Response, json!("body.name"))];

        let one = run_one(&mut backend, &first, &mut scope).await;
        let two = run_one(&mut backend, &second, &mut scope).await;
        assert_eq!(two.status, Status::Success);
        assert_eq!(one.variables.get("token"), Some(&json!("t-9")));
        assert!(one.variables.get("later").is_none());
        assert_eq!(two.variables.get("later"), Some(&json!("amy")));
        assert_eq!(two.variables.get("token"), Some(&json!("t-9")));
    }

    #[test]
    fn test_merge_headers_step_wins() {
        let case = IndexMap::from([
            ("Authorization".to_string(), json!("Bearer case")),
            ("X-Trace".to_string(), json!("1")),
        ]);
        let step = IndexMap::from([("authorization".to_string(), json!("Bearer step"))]);
        let merged = merge_headers(&case, &step);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.get("authorization"), Some(&json!("Bearer step")));
        assert!(merged.get("Authorization").is_none());
    }
}
