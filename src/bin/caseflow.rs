//! caseflow CLI: run YAML test cases against HTTP services and UIs.

use anyhow::{anyhow, bail, Context, Result};
use caseflow::{
    api_client::SummaryClient,
    backend::{
        BackendFactory, CompositeFactory, HttpActor, HttpBackendFactory, UiBackendFactory,
        WebDriverFactory,
    },
    resolver::render,
    CaseLibrary, CaseResult, ConcurrencyMode, Engine, RunOverrides, RunRequest, RunSummary,
    Settings, Status,
};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use indexmap::IndexMap;
use serde_json::Value;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// caseflow - YAML-driven HTTP and UI test case runner.
#[derive(Parser, Debug)]
#[command(name = "caseflow", version, about)]
struct Cli {
    /// Case files or directories.
    #[arg(short = 'p', long = "path", default_value = "cases")]
    paths: Vec<PathBuf>,

    /// Environment settings file.
    #[arg(short = 's', long = "settings")]
    settings: Option<PathBuf>,

    /// Environment code.
    #[arg(short = 'e', long = "env", default_value = "default")]
    env: String,

    /// Case ids to run. All loaded cases when omitted.
    #[arg(short = 'c', long = "case")]
    case_ids: Vec<String>,

    #[arg(short = 'm', long = "mode", default_value = "sequential")]
    mode: Mode,

    /// Server id visible to skip rules.
    #[arg(long = "server-id")]
    server_id: Option<String>,

    /// Device id visible to skip rules.
    #[arg(long = "device-id")]
    device_id: Option<String>,

    /// One-shot variable override, `name=value` (single-case runs).
    #[arg(long = "var", value_parser = parse_pair)]
    vars: Vec<(String, Value)>,

    /// One-shot header override, `name=value` (single-case runs).
    #[arg(long = "header", value_parser = parse_pair)]
    headers: Vec<(String, Value)>,

    /// Base URL override for HTTP steps.
    #[arg(short = 'b', long = "base-url")]
    base_url: Option<String>,

    /// WebDriver server URL; enables UI steps.
    #[arg(long = "webdriver-url", env = "CASEFLOW_WEBDRIVER_URL")]
    webdriver_url: Option<String>,

    /// Capture before/after screenshots of UI steps.
    #[arg(long = "screenshots")]
    screenshots: bool,

    /// HTTP timeout per request, in milliseconds.
    #[arg(short = 't', long = "timeout")]
    timeout_ms: Option<u64>,

    /// Upper bound for the whole run, in seconds.
    #[arg(long = "run-timeout")]
    run_timeout: Option<u64>,

    /// Directory to save the run summary.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<PathBuf>,

    #[arg(long = "report-format", default_value = "json")]
    report_format: ReportFormat,

    /// Endpoint receiving the run summary.
    #[arg(long = "api-url", env = "CASEFLOW_API_URL")]
    api_url: Option<String>,

    #[arg(long = "api-key", env = "CASEFLOW_API_KEY")]
    api_key: Option<String>,

    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum Mode {
    Sequential,
    Parallel,
}

impl From<Mode> for ConcurrencyMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Sequential => ConcurrencyMode::Sequential,
            Mode::Parallel => ConcurrencyMode::Parallel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum ReportFormat {
    Json,
    Yaml,
    Text,
}

/// `name=value`; the value is JSON when it parses as JSON, else a string.
fn parse_pair(raw: &str) -> Result<(String, Value)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected name=value, got '{raw}'"))?;
    if name.trim().is_empty() {
        bail!("empty name in '{raw}'");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.trim().to_string(), value))
}

fn init_tracing(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }

    if tracing::dispatcher::has_been_set() {
        return;
    }

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .try_init();
}

fn status_label(status: Status) -> &'static str {
    match status {
        Status::Success => "\x1b[32mPASS\x1b[0m",
        Status::Failed => "\x1b[31mFAIL\x1b[0m",
        Status::Errored => "\x1b[31mERROR\x1b[0m",
        Status::Skipped => "\x1b[33mSKIP\x1b[0m",
        Status::Pending | Status::Running => "....",
    }
}

fn step_mark(status: Status) -> &'static str {
    match status {
        Status::Success => "\x1b[32m✓\x1b[0m",
        Status::Skipped => "\x1b[33m-\x1b[0m",
        _ => "\x1b[31m✗\x1b[0m",
    }
}

fn truncated(value: &Value) -> String {
    let text = render(value);
    match text.char_indices().nth(500) {
        Some((cut, _)) => format!("{}...(truncated)", &text[..cut]),
        None => text,
    }
}

fn print_case_result(result: &CaseResult, verbose: bool) {
    info!(
        "{} case: {} ({} ms)",
        status_label(result.status),
        result.name,
        result.duration_ms
    );

    for (i, step) in result.steps.iter().enumerate() {
        info!(
            "  {}. {} {} ({} ms)",
            i + 1,
            step_mark(step.status),
            step.name,
            step.duration_ms
        );
        if let Some(reason) = &step.skip_reason {
            info!("     skipped: {reason}");
        }
        if let Some(err) = &step.error {
            error!("     \x1b[31m{:?} error: {}\x1b[0m", err.phase, err.message);
        }
        for check in step.validations.iter().filter(|v| v.message.is_some()) {
            error!(
                "     \x1b[31m{}: {}\x1b[0m",
                check.comparator,
                check.message.as_deref().unwrap_or_default()
            );
        }

        if verbose {
            if let Some(request) = &step.request {
                debug!("     Request: {}", truncated(request));
            }
            if let Some(response) = &step.response {
                debug!("     Response: {}", truncated(response));
            }
        }
    }

    if result.steps.is_empty() {
        if let Some(err) = &result.error {
            error!("     \x1b[31m{err}\x1b[0m");
        }
    }
}

fn save_summary(summary: &RunSummary, report_dir: &Path, format: ReportFormat) -> Result<PathBuf> {
    if !report_dir.exists() {
        fs::create_dir_all(report_dir)?;
    }

    let timestamp = Utc::now().timestamp();
    let stem = format!("run-{}-{timestamp}", summary.run_id);

    let (filename, content) = match format {
        ReportFormat::Json => (
            format!("{stem}.json"),
            serde_json::to_string_pretty(summary)?,
        ),
        ReportFormat::Yaml => (format!("{stem}.yaml"), serde_yaml::to_string(summary)?),
        ReportFormat::Text => {
            let mut content = String::new();
            content.push_str(&format!("Run: {}\n", summary.run_id));
            content.push_str(&format!(
                "Status: {}\n",
                if summary.success { "PASS" } else { "FAIL" }
            ));
            content.push_str(&format!(
                "Started: {}\nDuration: {} ms\n",
                summary.time.start_at.to_rfc3339(),
                summary.time.duration_ms
            ));
            let cases = &summary.stats.cases;
            content.push_str(&format!(
                "Cases: {} total, {} passed, {} failed, {} skipped\n\n",
                cases.total, cases.success, cases.fail, cases.skipped
            ));
            for case in &summary.details {
                content.push_str(&format!("{} ({:?}, {} ms)\n", case.name, case.status, case.duration_ms));
                if let Some(err) = &case.error {
                    content.push_str(&format!("  Error: {err}\n"));
                }
                for (i, step) in case.steps.iter().enumerate() {
                    content.push_str(&format!(
                        "  {}. {} ({:?}, {} ms)\n",
                        i + 1,
                        step.name,
                        step.status,
                        step.duration_ms
                    ));
                    if let Some(err) = &step.error {
                        content.push_str(&format!("     Error: {}\n", err.message));
                    }
                }
            }
            (format!("{stem}.txt"), content)
        }
    };

    let file_path = report_dir.join(filename);
    let mut file = File::create(&file_path)?;
    file.write_all(content.as_bytes())?;

    Ok(file_path)
}

fn build_backends(args: &Cli, settings: &Settings) -> Result<Arc<dyn BackendFactory>> {
    let env = settings.environment(&args.env)?;

    let mut actor = HttpActor::new().default_headers(env.headers.clone());
    if let Some(base_url) = args.base_url.as_ref().or(env.base_url.as_ref()) {
        actor = actor.base_url(base_url.clone());
    }
    if let Some(timeout) = args.timeout_ms.or(settings.timeout_ms) {
        actor = actor.timeout_ms(timeout);
    }
    let http: Arc<dyn BackendFactory> = Arc::new(HttpBackendFactory::new(actor));

    let webdriver = env.webdriver.clone();
    let ui_url = args
        .webdriver_url
        .clone()
        .or_else(|| webdriver.as_ref().map(|w| w.url.clone()));
    let ui = ui_url.map(|url| {
        let capabilities = webdriver
            .as_ref()
            .map(|w| w.capabilities.clone())
            .unwrap_or(Value::Null);
        let screenshots = args.screenshots || webdriver.as_ref().is_some_and(|w| w.screenshots);
        info!("UI steps enabled via WebDriver at {url}");
        Arc::new(
            UiBackendFactory::new(Arc::new(WebDriverFactory::new(url, capabilities)))
                .capture_screenshots(screenshots),
        ) as Arc<dyn BackendFactory>
    });

    Ok(Arc::new(CompositeFactory {
        http: Some(http),
        ui,
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.verbose);

    let library = CaseLibrary::load_paths(&args.paths).context("Failed to load cases")?;
    if library.is_empty() {
        bail!("No test cases found");
    }
    let settings = match &args.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    let env = settings.environment(&args.env)?;
    let backends = build_backends(&args, &settings)?;

    let case_ids: Vec<String> = if args.case_ids.is_empty() {
        library.ids().map(str::to_string).collect()
    } else {
        args.case_ids.clone()
    };
    let overrides = (!args.vars.is_empty() || !args.headers.is_empty()).then(|| RunOverrides {
        variables: args.vars.iter().cloned().collect(),
        headers: args.headers.iter().cloned().collect::<IndexMap<_, _>>(),
        skip: None,
    });
    if overrides.is_some() && case_ids.len() != 1 {
        warn!("--var/--header only apply when a single case is run");
    }

    let mut engine = Engine::new(Arc::new(library), backends).with_variables(env.variables);
    if let Some(secs) = args.run_timeout {
        engine = engine.with_run_timeout(Duration::from_secs(secs));
    }

    info!("Running {} case(s) in {} ...", case_ids.len(), args.env);
    let summary = engine
        .run(RunRequest {
            run_id: None,
            case_ids,
            env: args.env.clone(),
            mode: args.mode.into(),
            server_id: args.server_id.clone(),
            device_id: args.device_id.clone(),
            overrides,
        })
        .await;

    for case in &summary.details {
        print_case_result(case, args.verbose);
    }
    let cases = &summary.stats.cases;
    info!(
        "Summary:\n  Total: {}\n  \x1b[32mPassed: {}\x1b[0m\n  \x1b[31mFailed: {}\x1b[0m\n  Skipped: {}\n  Duration: {} ms",
        cases.total,
        cases.success,
        cases.fail,
        cases.skipped,
        summary.time.duration_ms
    );

    if let Some(dir) = &args.report_dir {
        match save_summary(&summary, dir, args.report_format) {
            Ok(path) => info!("Report saved: {}", path.display()),
            Err(e) => error!("Failed to save report: {e}"),
        }
    }

    if let (Some(api_url), Some(api_key)) = (&args.api_url, &args.api_key) {
        info!("Submitting run summary...");
        let client = SummaryClient::new(api_url.clone(), api_key.clone())?;
        match client.submit(&summary).await {
            Ok(resp) => {
                if let Some(url) = resp.report_url {
                    info!("Report: {url}");
                }
            }
            // Submission failures do not change the exit code.
            Err(e) => error!("Failed to submit run summary: {e:#}"),
        }
    }

    if !summary.success {
        exit(1);
    }

    Ok(())
}
