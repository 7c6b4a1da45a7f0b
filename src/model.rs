//! Case, step and result records exchanged with the surrounding
//! application.

use crate::error::{EngineError, ErrorKind, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ordered variable bindings.
pub type VariableMap = IndexMap<String, Value>;

/// A named, ordered sequence of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    /// Library key used by quote steps and run requests. Filled from
    /// the slugified name when omitted.
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Case-level variables. Declaration order matters: a value may
    /// reference a sibling declared before it.
    #[serde(default)]
    pub variables: VariableMap,
    /// Headers merged into every HTTP action of the case.
    #[serde(default)]
    pub headers: IndexMap<String, Value>,
    /// Unconditional skip flag.
    #[serde(default)]
    pub skip: bool,
    /// Conditional skip rules, evaluated in order.
    #[serde(default)]
    pub skip_if: Vec<SkipRule>,
    /// Number of independent runs of the whole resolved sequence.
    #[serde(default = "default_repeat")]
    pub repeat: u32,
    /// Parameter records (a list, or a `${P(file)}` expression). One
    /// run is produced per record, with its fields bound as variables.
    #[serde(default)]
    pub parameters: Option<Value>,
    /// Skip the remaining steps once a step failed or errored.
    #[serde(default)]
    pub stop_on_failure: bool,
    pub steps: Vec<Step>,
}

/// One step of a case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// A disabled step is skipped unconditionally.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub skip_if: Vec<SkipRule>,
    #[serde(default = "default_repeat")]
    pub repeat: u32,
    /// Step-local variable defaults.
    #[serde(default)]
    pub variables: VariableMap,
    /// Hook expressions run before dispatch. A single-key mapping
    /// `{name: expr}` binds its result.
    #[serde(default)]
    pub setup_hooks: Vec<Value>,
    #[serde(default)]
    pub teardown_hooks: Vec<Value>,

    // ── exactly one of the following ────────────────────
    /// HTTP request action.
    #[serde(default)]
    pub request: Option<HttpRequest>,
    /// UI automation action.
    #[serde(default)]
    pub ui: Option<UiAction>,
    /// Id of another case whose steps are inlined here.
    #[serde(default)]
    pub quote: Option<String>,

    #[serde(default)]
    pub extract: Vec<Extractor>,
    #[serde(default)]
    pub validate: Vec<Validator>,
}

impl Default for Step {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: None,
            enabled: true,
            skip: false,
            skip_if: Vec::new(),
            repeat: 1,
            variables: VariableMap::new(),
            setup_hooks: Vec::new(),
            teardown_hooks: Vec::new(),
            request: None,
            ui: None,
            quote: None,
            extract: Vec::new(),
            validate: Vec::new(),
        }
    }
}

impl Step {
    /// Return the case id this step quotes, if any.
    pub fn quoted_case(&self) -> Option<&str> {
        self.quote.as_deref()
    }

    /// Return the action this step dispatches.
    ///
    /// Fails when the step defines no action, or more than one of
    /// `request`, `ui` and `quote`.
    pub fn action(&self) -> Result<Action> {
        let defined = [
            self.request.is_some(),
            self.ui.is_some(),
            self.quote.is_some(),
        ]
        .iter()
        .filter(|d| **d)
        .count();
        if defined != 1 {
            return Err(EngineError::config(format!(
                "step '{}' must define exactly one of request, ui or \
                 quote ({defined} defined)",
                self.name
            )));
        }
        match (&self.request, &self.ui) {
            (Some(request), _) => Ok(Action::Http(request.clone())),
            (_, Some(ui)) => Ok(Action::Ui(ui.clone())),
            _ => Err(EngineError::config(format!(
                "step '{}' quotes case '{}' and cannot be dispatched",
                self.name,
                self.quote.as_deref().unwrap_or_default()
            ))),
        }
    }
}

fn default_repeat() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

/// Backend-specific payload of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Http(HttpRequest),
    Ui(UiAction),
}

/// HTTP request descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    /// Method name. Validated by the HTTP actor before any I/O.
    pub method: String,
    /// Absolute URL, or a path joined onto the environment base URL.
    pub url: String,
    #[serde(default)]
    pub headers: IndexMap<String, Value>,
    #[serde(default)]
    pub query: IndexMap<String, Value>,
    /// Written as a single-key map in YAML: `body: { json: ... }`.
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub body: Option<RequestBody>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Request body variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestBody {
    Json(Value),
    /// `application/x-www-form-urlencoded` fields.
    Form(IndexMap<String, Value>),
    /// Raw payload sent as UTF-8 bytes.
    Text(Value),
}

/// UI operation descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiAction {
    /// Operation name from the UI actor's registry.
    pub operation: String,
    #[serde(default)]
    pub locator: Option<Locator>,
    /// Operation input: text to type, URL to open, script to run,
    /// option to select, window to switch to, milliseconds to wait.
    #[serde(default)]
    pub text: Option<Value>,
    /// Attribute name for `get_attribute`.
    #[serde(default)]
    pub attribute: Option<String>,
    /// Upper bound for element lookup and waits.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Element locator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Locator {
    /// Strategy: id, name, css, xpath, link_text, partial_link_text,
    /// tag_name, class_name or accessibility_id.
    pub by: String,
    pub value: String,
}

/// Rule binding a name to a value after dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extractor {
    pub key: String,
    #[serde(default)]
    pub source: ExtractSource,
    pub expression: Value,
}

/// Where an extractor takes its value from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractSource {
    /// Dot path into the backend outcome (`body.data.token`).
    #[default]
    Response,
    /// Expression resolved through the function registry.
    Function,
    /// Literal value, taken verbatim.
    Constant,
    /// Existing variable, passed through.
    Variable,
    /// CEL expression over `response`, `request` and variables.
    Expression,
}

/// Assertion rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validator {
    pub comparator: String,
    pub actual: Value,
    pub expected: Value,
}

/// Conditional skip rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkipRule {
    pub skip_type: SkipPolicy,
    pub data_source: DataSource,
    pub comparator: String,
    pub expected: Value,
}

/// Polarity of a skip rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "String")]
pub enum SkipPolicy {
    /// Skip when the comparator holds.
    IfTrue,
    /// Skip when the comparator does not hold.
    IfFalse,
}

impl TryFrom<Value> for SkipPolicy {
    type Error = String;

    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        match value {
            Value::Bool(true) => Ok(SkipPolicy::IfTrue),
            Value::Bool(false) => Ok(SkipPolicy::IfFalse),
            Value::String(s) if s == "true" => Ok(SkipPolicy::IfTrue),
            Value::String(s) if s == "false" => Ok(SkipPolicy::IfFalse),
            other => Err(format!(
                "skip_type must be \"true\" or \"false\", got {other}"
            )),
        }
    }
}

impl From<SkipPolicy> for String {
    fn from(policy: SkipPolicy) -> Self {
        match policy {
            SkipPolicy::IfTrue => "true".to_string(),
            SkipPolicy::IfFalse => "false".to_string(),
        }
    }
}

/// Run attribute a skip rule compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    RunEnv,
    RunServer,
    RunDevice,
    /// Whether an earlier step of the current case failed or errored.
    CaseFailed,
}

/// How a run schedules its cases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyMode {
    #[default]
    Sequential,
    Parallel,
}

/// One-shot overrides, honoured only for single-case runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOverrides {
    #[serde(default)]
    pub variables: VariableMap,
    #[serde(default)]
    pub headers: IndexMap<String, Value>,
    /// Replaces the case's unconditional skip flag.
    #[serde(default)]
    pub skip: Option<bool>,
}

/// A run request handed over by the triggering application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub run_id: Option<String>,
    pub case_ids: Vec<String>,
    pub env: String,
    #[serde(default)]
    pub mode: ConcurrencyMode,
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub overrides: Option<RunOverrides>,
}

/// Run attributes visible to skip rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    pub env: String,
    pub server_id: Option<String>,
    pub device_id: Option<String>,
}

impl From<&RunRequest> for RunContext {
    fn from(request: &RunRequest) -> Self {
        Self {
            env: request.env.clone(),
            server_id: request.server_id.clone(),
            device_id: request.device_id.clone(),
        }
    }
}

/// Lifecycle status of a step or case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Running,
    Success,
    Failed,
    Errored,
    Skipped,
}

impl Status {
    pub fn is_failure(self) -> bool {
        matches!(self, Status::Failed | Status::Errored)
    }
}

/// Step runner phase, used to tag errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    SkipCheck,
    Preflight,
    Setup,
    Dispatch,
    Extract,
    Teardown,
    Validate,
}

/// Error record attached to a step result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: ErrorKind,
    pub phase: StepPhase,
    pub message: String,
}

impl StepError {
    pub fn new(phase: StepPhase, err: &EngineError) -> Self {
        Self {
            kind: err.kind(),
            phase,
            message: err.to_string(),
        }
    }
}

/// Outcome of one validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckResult {
    Pass,
    Fail,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub comparator: String,
    pub actual: Value,
    pub expected: Value,
    pub result: CheckResult,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShotPhase {
    Before,
    After,
}

/// Screenshot captured around a UI operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Screenshot {
    pub phase: ShotPhase,
    pub png_base64: String,
}

/// Result of running a single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub index: usize,
    pub status: Status,
    pub error: Option<StepError>,
    /// Teardown failure that did not replace an earlier error.
    pub teardown_error: Option<StepError>,
    pub skip_reason: Option<String>,
    pub request: Option<Value>,
    pub response: Option<Value>,
    #[serde(default)]
    pub screenshots: Vec<Screenshot>,
    #[serde(default)]
    pub extracted: VariableMap,
    #[serde(default)]
    pub validations: Vec<ValidationRecord>,
    /// Session scope at step end.
    #[serde(default)]
    pub variables: VariableMap,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn new(name: impl Into<String>, index: usize) -> Self {
        Self {
            name: name.into(),
            index,
            status: Status::Pending,
            error: None,
            teardown_error: None,
            skip_reason: None,
            request: None,
            response: None,
            screenshots: Vec::new(),
            extracted: VariableMap::new(),
            validations: Vec::new(),
            variables: VariableMap::new(),
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }

    pub fn skipped(
        name: impl Into<String>,
        index: usize,
        reason: impl Into<String>,
    ) -> Self {
        let mut result = Self::new(name, index);
        result.status = Status::Skipped;
        result.skip_reason = Some(reason.into());
        result
    }
}

/// Result of one run of a case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_id: String,
    pub name: String,
    pub status: Status,
    pub success: bool,
    pub error: Option<String>,
    pub steps: Vec<StepResult>,
    pub stats: crate::report::StepStats,
    /// Session scope at case end.
    #[serde(default)]
    pub variables: VariableMap,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl Case {
    /// Deserialize a case from a YAML string.
    pub fn from_yaml(yaml: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Serialize the case to a YAML string.
    pub fn to_yaml(&self) -> std::result::Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
