//! Action backends: the protocol adapters a step dispatches through.

pub mod http;
pub mod ui;
pub mod webdriver;

use crate::error::{EngineError, Result};
use crate::model::{Action, Screenshot};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use http::{HttpActor, HttpBackendFactory};
pub use ui::{DriverFactory, UiActor, UiBackendFactory, UiDriver, UiOperation};
pub use webdriver::{WebDriverFactory, WebDriverSession};

/// What a backend returns for one dispatched action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// The request as actually sent, after resolution.
    pub request: Value,
    /// Backend response object. HTTP: `status_code`, `headers`,
    /// `body`, `text`, `elapsed_ms`, `url`. UI: `operation`, `value`,
    /// `url`, `title`.
    pub response: Value,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub screenshots: Vec<Screenshot>,
}

impl Outcome {
    /// Look up a dot path in the response, or in the request when the
    /// path starts with `request.`.
    pub fn field(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if let Some(rest) = path.strip_prefix("request.") {
            return get_value_by_path(&self.request, rest);
        }
        let rest = path.strip_prefix("response.").unwrap_or(path);
        get_value_by_path(&self.response, rest)
    }

    /// Like [`Outcome::field`], but a missing path is an extraction error.
    pub fn require(&self, path: &str) -> Result<&Value> {
        self.field(path)
            .ok_or_else(|| EngineError::Extraction(format!("'{path}' not found in outcome")))
    }

    /// Whether `path` addresses the outcome at all, i.e. its first
    /// segment names a response key or the request.
    pub fn addresses(&self, path: &str) -> bool {
        let path = path.trim();
        if path.starts_with("request.") || path.starts_with("response.") {
            return true;
        }
        let head = path.split('.').next().unwrap_or_default();
        matches!(&self.response, Value::Object(map) if map.contains_key(head))
    }
}

/// Walk `path` (`a.b.0.c`) through objects and arrays.
pub fn get_value_by_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }
        match current {
            Value::Object(map) => current = map.get(part)?,
            Value::Array(items) => current = items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        }
    }
    Some(current)
}

/// A protocol adapter owned by a single case worker.
#[async_trait]
pub trait ActionBackend: Send {
    fn name(&self) -> &'static str;

    /// Reject actions this backend cannot run, before any I/O.
    fn check(&self, action: &Action) -> Result<()>;

    async fn execute(&mut self, action: &Action) -> Result<Outcome>;

    /// Screenshots captured by a failed `execute`, which could not be
    /// returned with an [`Outcome`].
    fn take_screenshots(&mut self) -> Vec<Screenshot> {
        Vec::new()
    }

    /// Release held resources (sessions, connections).
    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Creates one backend per case worker.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn ActionBackend>>;
}

/// Routes HTTP actions to one backend and UI actions to another.
pub struct CompositeBackend {
    http: Option<Box<dyn ActionBackend>>,
    ui: Option<Box<dyn ActionBackend>>,
}

impl CompositeBackend {
    pub fn new(
        http: Option<Box<dyn ActionBackend>>,
        ui: Option<Box<dyn ActionBackend>>,
    ) -> Self {
        Self { http, ui }
    }

    fn route(&self, action: &Action) -> Result<&dyn ActionBackend> {
        let (slot, kind) = match action {
            Action::Http(_) => (&self.http, "http"),
            Action::Ui(_) => (&self.ui, "ui"),
        };
        slot.as_deref()
            .ok_or_else(|| EngineError::config(format!("no {kind} backend configured")))
    }
}

#[async_trait]
impl ActionBackend for CompositeBackend {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn check(&self, action: &Action) -> Result<()> {
        self.route(action)?.check(action)
    }

    async fn execute(&mut self, action: &Action) -> Result<Outcome> {
        let slot = match action {
            Action::Http(_) => &mut self.http,
            Action::Ui(_) => &mut self.ui,
        };
        match slot {
            Some(backend) => backend.execute(action).await,
            None => Err(EngineError::config("no backend configured for action")),
        }
    }

    fn take_screenshots(&mut self) -> Vec<Screenshot> {
        self.ui.as_mut().map(|ui| ui.take_screenshots()).unwrap_or_default()
    }

    async fn shutdown(&mut self) -> Result<()> {
        let mut first_err = None;
        for backend in [self.http.as_mut(), self.ui.as_mut()].into_iter().flatten() {
            if let Err(e) = backend.shutdown().await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Factory pairing an optional HTTP factory with an optional UI factory.
pub struct CompositeFactory {
    pub http: Option<std::sync::Arc<dyn BackendFactory>>,
    pub ui: Option<std::sync::Arc<dyn BackendFactory>>,
}

#[async_trait]
impl BackendFactory for CompositeFactory {
    async fn create(&self) -> Result<Box<dyn ActionBackend>> {
        let http = match &self.http {
            Some(f) => Some(f.create().await?),
            None => None,
        };
        let ui = match &self.ui {
            Some(f) => Some(f.create().await?),
            None => None,
        };
        Ok(Box::new(CompositeBackend::new(http, ui)))
    }
}
