//! Run coordination: sequential folding or one worker per case.

use crate::backend::BackendFactory;
use crate::case::{errored_case, run_case, CaseContext};
use crate::config::CaseLibrary;
use crate::error::EngineError;
use crate::functions::FunctionRegistry;
use crate::model::{CaseResult, ConcurrencyMode, RunContext, RunOverrides, RunRequest, VariableMap};
use crate::report::{NullSink, ResultSink, RunSummary, SummaryBuilder};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

/// Runs [`RunRequest`]s against a case library.
#[derive(Clone)]
pub struct Engine {
    library: Arc<CaseLibrary>,
    functions: Arc<FunctionRegistry>,
    backends: Arc<dyn BackendFactory>,
    sink: Arc<dyn ResultSink>,
    variables: VariableMap,
    run_timeout: Option<Duration>,
}

/// State shared by every worker of one run.
struct RunShared {
    library: Arc<CaseLibrary>,
    functions: Arc<FunctionRegistry>,
    backends: Arc<dyn BackendFactory>,
    sink: Arc<dyn ResultSink>,
    run: RunContext,
    run_id: String,
    variables: VariableMap,
    overrides: Option<RunOverrides>,
    /// Run timeout and the instant it expires.
    limit: Option<(Duration, Instant)>,
}

impl Engine {
    pub fn new(library: Arc<CaseLibrary>, backends: Arc<dyn BackendFactory>) -> Self {
        Self {
            library,
            functions: Arc::new(FunctionRegistry::new()),
            backends,
            sink: Arc::new(NullSink),
            variables: VariableMap::new(),
            run_timeout: None,
        }
    }

    pub fn with_functions(mut self, functions: Arc<FunctionRegistry>) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Environment variables seeded into every case run.
    pub fn with_variables(mut self, variables: VariableMap) -> Self {
        self.variables = variables;
        self
    }

    /// Upper bound for a whole run. Cases that have not finished by
    /// then are reported as errored.
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    #[instrument(skip_all, fields(env = %request.env, mode = ?request.mode, cases = request.case_ids.len()))]
    pub async fn run(&self, request: RunRequest) -> RunSummary {
        let run_id = request
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let overrides = match (&request.overrides, request.case_ids.len()) {
            (Some(o), 1) => Some(o.clone()),
            (Some(_), n) => {
                warn!("Ignoring one-shot overrides for a run of {n} cases");
                None
            }
            (None, _) => None,
        };
        let shared = Arc::new(RunShared {
            library: Arc::clone(&self.library),
            functions: Arc::clone(&self.functions),
            backends: Arc::clone(&self.backends),
            sink: Arc::clone(&self.sink),
            run: RunContext::from(&request),
            run_id: run_id.clone(),
            variables: self.variables.clone(),
            overrides,
            limit: self.run_timeout.map(|t| (t, Instant::now() + t)),
        });

        info!(run_id = %run_id, "Starting run");
        let summary = match request.mode {
            ConcurrencyMode::Sequential => {
                self.run_sequential(&shared, &request.case_ids).await
            }
            ConcurrencyMode::Parallel => self.run_parallel(&shared, &request.case_ids).await,
        };
        info!(
            run_id = %summary.run_id,
            success = summary.success,
            cases = summary.stats.cases.total,
            duration_ms = summary.time.duration_ms,
            "Run finished"
        );
        summary
    }

    async fn run_sequential(&self, shared: &Arc<RunShared>, case_ids: &[String]) -> RunSummary {
        let mut builder = SummaryBuilder::new(shared.run_id.clone());
        for (index, case_id) in case_ids.iter().enumerate() {
            for result in run_worker(shared, index, case_id).await {
                builder = builder.with_case(result);
            }
        }
        builder.finish()
    }

    async fn run_parallel(&self, shared: &Arc<RunShared>, case_ids: &[String]) -> RunSummary {
        let (tx, mut rx) = mpsc::channel::<(usize, RunSummary)>(case_ids.len().max(1));
        let mut handles = Vec::with_capacity(case_ids.len());

        for (index, case_id) in case_ids.iter().enumerate() {
            let tx = tx.clone();
            let shared = Arc::clone(shared);
            let case_id = case_id.clone();
            handles.push(tokio::spawn(async move {
                let builder = SummaryBuilder::new(shared.run_id.clone());
                let summary = run_worker(&shared, index, &case_id)
                    .await
                    .into_iter()
                    .fold(builder, SummaryBuilder::with_case)
                    .finish();
                if tx.send((index, summary)).await.is_err() {
                    warn!(index, "Coordinator stopped listening");
                }
            }));
        }
        drop(tx);

        // Workers enforce the run timeout themselves, so this drains.
        let mut done: Vec<Option<RunSummary>> = vec![None; case_ids.len()];
        while let Some((index, summary)) = rx.recv().await {
            done[index] = Some(summary);
        }

        let mut parts = Vec::with_capacity(case_ids.len());
        for (index, (slot, handle)) in done.into_iter().zip(handles).enumerate() {
            let part = match slot {
                Some(summary) => summary,
                None => {
                    let case_id = &case_ids[index];
                    let reason = match handle.await {
                        Err(e) if e.is_panic() => "case worker panicked".to_string(),
                        Err(e) => format!("case worker failed: {e}"),
                        Ok(()) => "case worker exited without a result".to_string(),
                    };
                    error!(case = %case_id, "{reason}");
                    let result = errored_case(case_id, case_id, &EngineError::backend(reason));
                    SummaryBuilder::new(shared.run_id.clone())
                        .with_case(result)
                        .finish()
                }
            };
            parts.push(part);
        }
        RunSummary::merge_parallel(shared.run_id.clone(), parts)
    }
}

/// Run one case on a freshly created backend, then shut it down.
///
/// The run timeout bounds backend creation and the case itself. A
/// backend that was created is shut down even when the case timed out.
async fn run_worker(shared: &RunShared, index: usize, case_id: &str) -> Vec<CaseResult> {
    if let Some((limit, deadline)) = shared.limit {
        if Instant::now() >= deadline {
            return vec![timed_out(shared, case_id, limit)];
        }
    }
    let created = match shared.limit {
        Some((limit, deadline)) => {
            match tokio::time::timeout_at(deadline, shared.backends.create()).await {
                Ok(created) => created,
                Err(_) => return vec![timed_out(shared, case_id, limit)],
            }
        }
        None => shared.backends.create().await,
    };
    let mut backend = match created {
        Ok(backend) => backend,
        Err(e) => {
            error!(case = %case_id, "Backend creation failed: {e}");
            return vec![errored_case(case_id, case_id, &e)];
        }
    };
    let ctx = CaseContext {
        library: &shared.library,
        functions: &shared.functions,
        base_dir: shared.library.base_dir(),
        run: &shared.run,
        run_id: &shared.run_id,
        variables: &shared.variables,
        overrides: shared.overrides.as_ref(),
        sink: shared.sink.as_ref(),
    };
    let results = match shared.limit {
        Some((limit, deadline)) => {
            match tokio::time::timeout_at(deadline, run_case(&ctx, backend.as_mut(), index, case_id))
                .await
            {
                Ok(results) => results,
                Err(_) => vec![timed_out(shared, case_id, limit)],
            }
        }
        None => run_case(&ctx, backend.as_mut(), index, case_id).await,
    };
    if let Err(e) = backend.shutdown().await {
        warn!(case = %case_id, "Backend shutdown failed: {e}");
    }
    results
}

fn timed_out(shared: &RunShared, case_id: &str, limit: Duration) -> CaseResult {
    let ms = limit.as_millis() as u64;
    warn!(case = %case_id, "Run timeout of {ms} ms exceeded");
    let name = shared
        .library
        .get(case_id)
        .map(|c| c.name.as_str())
        .unwrap_or(case_id);
    errored_case(case_id, name, &EngineError::Timeout(ms))
}
