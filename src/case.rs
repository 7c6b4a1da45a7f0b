//! Case orchestration: quote inlining, run expansion and step
//! sequencing.

use crate::backend::ActionBackend;
use crate::config::CaseLibrary;
use crate::error::{EngineError, Result};
use crate::functions::FunctionRegistry;
use crate::model::{
    Case, CaseResult, RunContext, RunOverrides, SkipRule, Status, Step, StepResult, VariableMap,
};
use crate::report::{ResultSink, StepEvent, StepStats};
use crate::resolver::Resolver;
use crate::scope::VariableScope;
use crate::skip;
use crate::step::StepRunner;
use chrono::Utc;
use indexmap::IndexMap;
use serde_json::Value;
use std::path::Path;
use std::time::Instant;
use tracing::{info, instrument, warn};

/// A case with every quote step inlined and every step repeat
/// expanded.
#[derive(Debug, Clone)]
pub struct ResolvedCase {
    pub id: String,
    pub name: String,
    /// Variables of the case and every quoted case. The outermost
    /// declaration of a name wins.
    pub variables: VariableMap,
    pub headers: IndexMap<String, Value>,
    pub steps: Vec<Step>,
}

/// Inline the quote steps of case `id`, depth first.
pub fn resolve_case(library: &CaseLibrary, id: &str) -> Result<ResolvedCase> {
    let case = library
        .get(id)
        .ok_or_else(|| EngineError::CaseNotFound(id.to_string()))?;
    let mut resolved = ResolvedCase {
        id: case.id.clone(),
        name: case.name.clone(),
        variables: VariableMap::new(),
        headers: IndexMap::new(),
        steps: Vec::new(),
    };
    let mut stack = vec![case.id.clone()];
    inline_case(library, case, &mut stack, &mut resolved, &Inherited::default())?;
    Ok(resolved)
}

/// Skip settings a quote step passes on to the steps it inlines.
#[derive(Debug, Clone, Default)]
struct Inherited {
    skip: bool,
    skip_if: Vec<SkipRule>,
}

fn inline_case(
    library: &CaseLibrary,
    case: &Case,
    stack: &mut Vec<String>,
    out: &mut ResolvedCase,
    inherited: &Inherited,
) -> Result<()> {
    for (name, value) in &case.variables {
        out.variables.entry(name.clone()).or_insert_with(|| value.clone());
    }
    for (name, value) in &case.headers {
        out.headers.entry(name.clone()).or_insert_with(|| value.clone());
    }

    for step in &case.steps {
        let Some(quoted) = step.quoted_case() else {
            let mut step = step.clone();
            step.skip |= inherited.skip;
            step.skip_if = inherited
                .skip_if
                .iter()
                .cloned()
                .chain(step.skip_if)
                .collect();
            out.steps.extend(expand_repeat(step));
            continue;
        };

        if stack.iter().any(|id| id == quoted) {
            let mut chain = stack.clone();
            chain.push(quoted.to_string());
            return Err(EngineError::RecursiveQuote(
                quoted.to_string(),
                chain.join(" -> "),
            ));
        }
        if !step.enabled {
            out.steps.push(step.clone());
            continue;
        }
        let sub = library
            .get(quoted)
            .ok_or_else(|| EngineError::CaseNotFound(quoted.to_string()))?;
        let nested = Inherited {
            skip: inherited.skip || step.skip,
            skip_if: inherited
                .skip_if
                .iter()
                .chain(&step.skip_if)
                .cloned()
                .collect(),
        };
        stack.push(quoted.to_string());
        for _ in 0..step.repeat.max(1) {
            inline_case(library, sub, stack, out, &nested)?;
        }
        stack.pop();
    }
    Ok(())
}

/// Copies of a step named `name`, `name_2`, `name_3`, ….
fn expand_repeat(step: Step) -> Vec<Step> {
    let times = step.repeat.max(1);
    if times == 1 {
        return vec![step];
    }
    (1..=times)
        .map(|n| {
            let mut copy = step.clone();
            copy.repeat = 1;
            copy.name = run_name(&step.name, n);
            copy
        })
        .collect()
}

fn run_name(name: &str, n: u32) -> String {
    if n == 1 {
        name.to_string()
    } else {
        format!("{name}_{n}")
    }
}

/// Everything a case run needs besides its backend.
pub struct CaseContext<'a> {
    pub library: &'a CaseLibrary,
    pub functions: &'a FunctionRegistry,
    pub base_dir: Option<&'a Path>,
    pub run: &'a RunContext,
    pub run_id: &'a str,
    /// Environment variables, below case variables in precedence.
    pub variables: &'a VariableMap,
    /// One-shot overrides; only set for single-case runs.
    pub overrides: Option<&'a RunOverrides>,
    pub sink: &'a dyn ResultSink,
}

impl<'a> CaseContext<'a> {
    fn resolver(&self) -> Resolver<'a> {
        let resolver = Resolver::new(self.functions);
        match self.base_dir {
            Some(dir) => resolver.with_base_dir(dir),
            None => resolver,
        }
    }
}

/// Run case `case_id`, once per repeat and parameter record.
#[instrument(skip_all, fields(case = %case_id, index = case_index))]
pub async fn run_case(
    ctx: &CaseContext<'_>,
    backend: &mut dyn ActionBackend,
    case_index: usize,
    case_id: &str,
) -> Vec<CaseResult> {
    let Some(case) = ctx.library.get(case_id) else {
        let err = EngineError::CaseNotFound(case_id.to_string());
        return vec![errored_case(case_id, case_id, &err)];
    };

    let skip_flag = ctx.overrides.and_then(|o| o.skip).unwrap_or(case.skip);
    if let Some(reason) = skip::evaluate(skip_flag, &case.skip_if, ctx.run, false) {
        info!("Skipping case: {reason}");
        let mut result = case_result(case_id, &case.name, Vec::new(), VariableMap::new());
        result.status = Status::Skipped;
        result.success = true;
        result.error = Some(reason);
        return vec![result];
    }

    let resolved = match resolve_case(ctx.library, case_id) {
        Ok(resolved) => resolved,
        Err(e) => {
            warn!("Case cannot be resolved: {e}");
            return vec![errored_case(case_id, &case.name, &e)];
        }
    };

    let runs = match run_variables(ctx, case, &resolved) {
        Ok(runs) => runs,
        Err(e) => {
            warn!("Case variables cannot be prepared: {e}");
            return vec![errored_case(case_id, &case.name, &e)];
        }
    };

    let mut headers = resolved.headers.clone();
    if let Some(overrides) = ctx.overrides {
        for (name, value) in &overrides.headers {
            headers.retain(|k, _| !k.eq_ignore_ascii_case(name));
            headers.insert(name.clone(), value.clone());
        }
    }

    let mut results = Vec::with_capacity(runs.len());
    for (n, variables) in runs.into_iter().enumerate() {
        let name = run_name(&resolved.name, n as u32 + 1);
        info!(run = %name, "Starting case run");
        let result = run_once(
            ctx,
            backend,
            case_index,
            case,
            &resolved,
            &headers,
            name,
            variables,
        )
        .await;
        results.push(result);
    }
    results
}

/// Initial variables of every run: environment, then case, then the
/// parameter record, then one-shot overrides.
fn run_variables(
    ctx: &CaseContext<'_>,
    case: &Case,
    resolved: &ResolvedCase,
) -> Result<Vec<VariableMap>> {
    let resolver = ctx.resolver();
    let mut base = ctx.variables.clone();
    let lenient = resolver.lenient();
    for (name, raw) in &resolved.variables {
        let value = lenient.resolve(raw, &base)?;
        base.insert(name.clone(), value);
    }

    let records = match &case.parameters {
        None => vec![VariableMap::new()],
        Some(raw) => {
            let value = resolver.resolve(raw, &base)?;
            let Value::Array(items) = value else {
                return Err(EngineError::config(format!(
                    "parameters of case '{}' must be a list of records",
                    case.id
                )));
            };
            items
                .into_iter()
                .map(|item| match item {
                    Value::Object(map) => Ok(map.into_iter().collect::<VariableMap>()),
                    other => Err(EngineError::config(format!(
                        "parameter record must be a mapping, got {other}"
                    ))),
                })
                .collect::<Result<Vec<_>>>()?
        }
    };

    let mut runs = Vec::new();
    for record in records {
        for _ in 0..case.repeat.max(1) {
            let mut vars = base.clone();
            vars.extend(record.clone());
            if let Some(overrides) = ctx.overrides {
                vars.extend(overrides.variables.clone());
            }
            runs.push(vars);
        }
    }
    Ok(runs)
}

#[allow(clippy::too_many_arguments)]
async fn run_once(
    ctx: &CaseContext<'_>,
    backend: &mut dyn ActionBackend,
    case_index: usize,
    case: &Case,
    resolved: &ResolvedCase,
    headers: &IndexMap<String, Value>,
    name: String,
    variables: VariableMap,
) -> CaseResult {
    let started_at = Utc::now();
    let started = Instant::now();
    let mut scope = VariableScope::new(variables);
    let mut runner = StepRunner::new(backend, ctx.resolver(), ctx.run, headers);
    let mut steps: Vec<StepResult> = Vec::with_capacity(resolved.steps.len());
    let mut case_failed = false;

    for (index, step) in resolved.steps.iter().enumerate() {
        let result = if case.stop_on_failure && case_failed {
            StepResult::skipped(&step.name, index, "an earlier step failed")
        } else {
            runner.run(step, index, &mut scope, case_failed).await
        };
        case_failed |= result.status.is_failure();
        ctx.sink.step_completed(StepEvent {
            run_id: ctx.run_id.to_string(),
            case_index,
            case_id: resolved.id.clone(),
            step: result.clone(),
        });
        steps.push(result);
    }

    let mut result = case_result(&resolved.id, &name, steps, scope.session().clone());
    result.started_at = started_at;
    result.duration_ms = started.elapsed().as_millis() as u64;
    info!(
        status = ?result.status,
        duration_ms = result.duration_ms,
        "Case run finished: {name}"
    );
    result
}

/// Errored if any step errored, else failed if any failed, else
/// skipped if every step was skipped, else success.
pub fn case_status(steps: &[StepResult]) -> Status {
    if steps.iter().any(|s| s.status == Status::Errored) {
        Status::Errored
    } else if steps.iter().any(|s| s.status == Status::Failed) {
        Status::Failed
    } else if !steps.is_empty() && steps.iter().all(|s| s.status == Status::Skipped) {
        Status::Skipped
    } else {
        Status::Success
    }
}

fn case_result(id: &str, name: &str, steps: Vec<StepResult>, variables: VariableMap) -> CaseResult {
    let status = case_status(&steps);
    let error = steps
        .iter()
        .find(|s| s.status.is_failure())
        .map(|s| match &s.error {
            Some(e) => format!("step '{}': {}", s.name, e.message),
            None => format!("step '{}' failed validation", s.name),
        });
    CaseResult {
        case_id: id.to_string(),
        name: name.to_string(),
        status,
        success: !status.is_failure(),
        error,
        stats: StepStats::from_steps(&steps),
        steps,
        variables,
        started_at: Utc::now(),
        duration_ms: 0,
    }
}

/// Result of a case that could not start.
pub fn errored_case(id: &str, name: &str, err: &EngineError) -> CaseResult {
    let mut result = case_result(id, name, Vec::new(), VariableMap::new());
    result.status = Status::Errored;
    result.success = false;
    result.error = Some(err.to_string());
    result
}
