//! UI automation actor.
//!
//! Operations are dispatched by name through a static registry onto a
//! [`UiDriver`] session. The driver is connected lazily on the first
//! operation and quit when the backend shuts down.

use super::{ActionBackend, BackendFactory, Outcome};
use crate::error::{EngineError, Result};
use crate::model::{Action, Locator, Screenshot, ShotPhase, UiAction};
use crate::resolver::render;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Default element lookup timeout.
pub const DEFAULT_UI_TIMEOUT_MS: u64 = 10_000;

/// Locator strategies a driver must understand.
pub const LOCATOR_STRATEGIES: &[&str] = &[
    "id",
    "name",
    "css",
    "xpath",
    "link_text",
    "partial_link_text",
    "tag_name",
    "class_name",
    "accessibility_id",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiOperation {
    Open,
    Click,
    Input,
    Clear,
    Select,
    Scroll,
    SwitchWindow,
    GetAttribute,
    GetText,
    AssertVisible,
    AssertEnabled,
    AssertSelected,
    AssertText,
    Wait,
    ExecuteScript,
    Back,
    Forward,
    Refresh,
    Screenshot,
}

static OPERATIONS: &[(&str, UiOperation)] = &[
    ("open", UiOperation::Open),
    ("click", UiOperation::Click),
    ("input", UiOperation::Input),
    ("clear", UiOperation::Clear),
    ("select", UiOperation::Select),
    ("scroll", UiOperation::Scroll),
    ("switch_window", UiOperation::SwitchWindow),
    ("get_attribute", UiOperation::GetAttribute),
    ("get_text", UiOperation::GetText),
    ("assert_visible", UiOperation::AssertVisible),
    ("assert_enabled", UiOperation::AssertEnabled),
    ("assert_selected", UiOperation::AssertSelected),
    ("assert_text", UiOperation::AssertText),
    ("wait", UiOperation::Wait),
    ("execute_script", UiOperation::ExecuteScript),
    ("back", UiOperation::Back),
    ("forward", UiOperation::Forward),
    ("refresh", UiOperation::Refresh),
    ("screenshot", UiOperation::Screenshot),
];

impl UiOperation {
    pub fn parse(name: &str) -> Result<Self> {
        OPERATIONS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, op)| *op)
            .ok_or_else(|| EngineError::config(format!("unknown ui operation '{name}'")))
    }

    pub fn name(self) -> &'static str {
        OPERATIONS
            .iter()
            .find(|(_, op)| *op == self)
            .map(|(n, _)| *n)
            .unwrap_or("unknown")
    }

    pub fn all() -> impl Iterator<Item = &'static str> {
        OPERATIONS.iter().map(|(n, _)| *n)
    }

    fn needs_locator(self) -> bool {
        matches!(
            self,
            UiOperation::Click
                | UiOperation::Input
                | UiOperation::Clear
                | UiOperation::Select
                | UiOperation::GetAttribute
                | UiOperation::GetText
                | UiOperation::AssertVisible
                | UiOperation::AssertEnabled
                | UiOperation::AssertSelected
                | UiOperation::AssertText
        )
    }

    fn needs_text(self) -> bool {
        matches!(
            self,
            UiOperation::Open
                | UiOperation::Input
                | UiOperation::Select
                | UiOperation::AssertText
                | UiOperation::ExecuteScript
        )
    }
}

/// An automation session (browser or mobile).
#[async_trait]
pub trait UiDriver: Send {
    async fn open(&mut self, url: &str) -> Result<()>;
    /// Find an element, polling until `timeout`. Returns the driver's
    /// element reference.
    async fn find(&mut self, locator: &Locator, timeout: Duration) -> Result<String>;
    async fn click(&mut self, element: &str) -> Result<()>;
    async fn clear(&mut self, element: &str) -> Result<()>;
    async fn send_keys(&mut self, element: &str, text: &str) -> Result<()>;
    /// Choose the option of a select element by its visible text.
    async fn select(&mut self, element: &str, option: &str) -> Result<()>;
    async fn attribute(&mut self, element: &str, name: &str) -> Result<Option<String>>;
    async fn text(&mut self, element: &str) -> Result<String>;
    async fn is_displayed(&mut self, element: &str) -> Result<bool>;
    async fn is_enabled(&mut self, element: &str) -> Result<bool>;
    async fn is_selected(&mut self, element: &str) -> Result<bool>;
    /// Run a script; `element`, when given, is passed as `arguments[0]`.
    async fn execute_script(&mut self, script: &str, element: Option<&str>) -> Result<Value>;
    async fn window_handles(&mut self) -> Result<Vec<String>>;
    async fn switch_to_window(&mut self, handle: &str) -> Result<()>;
    async fn back(&mut self) -> Result<()>;
    async fn forward(&mut self) -> Result<()>;
    async fn refresh(&mut self) -> Result<()>;
    async fn current_url(&mut self) -> Result<String>;
    /// Base64 PNG, or `None` when the driver cannot capture.
    async fn screenshot(&mut self) -> Result<Option<String>>;
    async fn quit(&mut self) -> Result<()>;
}

/// Opens new [`UiDriver`] sessions.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn UiDriver>>;
}

/// Runs [`UiAction`]s against a lazily connected driver.
pub struct UiActor {
    drivers: Arc<dyn DriverFactory>,
    driver: Option<Box<dyn UiDriver>>,
    capture: bool,
    timeout_ms: u64,
    failed_shots: Vec<Screenshot>,
}

impl UiActor {
    pub fn new(drivers: Arc<dyn DriverFactory>) -> Self {
        Self {
            drivers,
            driver: None,
            capture: false,
            timeout_ms: DEFAULT_UI_TIMEOUT_MS,
            failed_shots: Vec::new(),
        }
    }

    /// Capture before/after screenshots around each operation.
    pub fn capture_screenshots(mut self, capture: bool) -> Self {
        self.capture = capture;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    async fn driver(&mut self) -> Result<&mut Box<dyn UiDriver>> {
        if self.driver.is_none() {
            debug!("Connecting ui driver");
            self.driver = Some(self.drivers.connect().await?);
        }
        self.driver
            .as_mut()
            .ok_or_else(|| EngineError::backend("ui driver is not connected"))
    }

    async fn capture(&mut self, phase: ShotPhase) -> Option<Screenshot> {
        if !self.capture {
            return None;
        }
        let driver = self.driver().await.ok()?;
        match driver.screenshot().await {
            Ok(Some(png_base64)) => Some(Screenshot { phase, png_base64 }),
            Ok(None) => None,
            Err(e) => {
                warn!("Screenshot failed: {e}");
                None
            }
        }
    }

    #[instrument(skip(self, action), fields(operation = %action.operation))]
    async fn perform(&mut self, action: &UiAction) -> Result<Outcome> {
        let op = validate(action)?;
        let start = Instant::now();
        let before = self.capture(ShotPhase::Before).await;

        let result = self.dispatch(op, action).await;
        let after = self.capture(ShotPhase::After).await;

        match result {
            Ok(value) => {
                let url = match self.driver().await {
                    Ok(driver) => driver.current_url().await.ok(),
                    Err(_) => None,
                };
                let mut screenshots: Vec<Screenshot> = after.into_iter().collect();
                if op == UiOperation::Screenshot {
                    if let Value::String(png) = &value {
                        screenshots.push(Screenshot {
                            phase: ShotPhase::After,
                            png_base64: png.clone(),
                        });
                    }
                }
                Ok(Outcome {
                    request: serde_json::to_value(action).unwrap_or(Value::Null),
                    response: json!({
                        "operation": op.name(),
                        "value": value,
                        "url": url,
                    }),
                    elapsed_ms: start.elapsed().as_millis() as u64,
                    screenshots,
                })
            }
            Err(e) => {
                self.failed_shots = before.into_iter().chain(after).collect();
                Err(e)
            }
        }
    }

    async fn dispatch(&mut self, op: UiOperation, action: &UiAction) -> Result<Value> {
        let timeout = Duration::from_millis(action.timeout_ms.unwrap_or(self.timeout_ms));
        let text = action.text.as_ref().map(render);
        let driver = self.driver().await?;

        let element = match (&action.locator, op.needs_locator() || op == UiOperation::Wait) {
            (Some(locator), _) => Some(driver.find(locator, timeout).await?),
            (None, true) if op != UiOperation::Wait => {
                return Err(EngineError::config(format!(
                    "ui operation '{}' requires a locator",
                    op.name()
                )))
            }
            _ => None,
        };
        let el = element.as_deref().unwrap_or_default();
        let text_ref = text.as_deref().unwrap_or_default();

        match op {
            UiOperation::Open => driver.open(text_ref).await.map(|_| Value::Null),
            UiOperation::Click => driver.click(el).await.map(|_| Value::Null),
            UiOperation::Input => driver.send_keys(el, text_ref).await.map(|_| Value::Null),
            UiOperation::Clear => driver.clear(el).await.map(|_| Value::Null),
            UiOperation::Select => driver.select(el, text_ref).await.map(|_| Value::Null),
            UiOperation::Scroll => {
                let script = match element {
                    Some(_) => "arguments[0].scrollIntoView(true);".to_string(),
                    None => {
                        let pixels: i64 = text_ref.trim().parse().unwrap_or(0);
                        format!("window.scrollBy(0, {pixels});")
                    }
                };
                driver.execute_script(&script, element.as_deref()).await
            }
            UiOperation::SwitchWindow => {
                let handles = driver.window_handles().await?;
                let target = match text.as_deref().map(str::trim) {
                    None | Some("") => handles.last().cloned(),
                    Some(t) => match t.parse::<usize>() {
                        Ok(i) => handles.get(i).cloned(),
                        Err(_) => handles.iter().find(|h| h.as_str() == t).cloned(),
                    },
                };
                let handle = target.ok_or_else(|| {
                    EngineError::backend(format!("no window matches '{text_ref}'"))
                })?;
                driver.switch_to_window(&handle).await?;
                Ok(Value::String(handle))
            }
            UiOperation::GetAttribute => {
                let name = action.attribute.as_deref().ok_or_else(|| {
                    EngineError::config("get_attribute requires an attribute name")
                })?;
                Ok(driver
                    .attribute(el, name)
                    .await?
                    .map(Value::String)
                    .unwrap_or(Value::Null))
            }
            UiOperation::GetText => driver.text(el).await.map(Value::String),
            UiOperation::AssertVisible => {
                assert_state(driver.is_displayed(el).await?, "visible", action)
            }
            UiOperation::AssertEnabled => {
                assert_state(driver.is_enabled(el).await?, "enabled", action)
            }
            UiOperation::AssertSelected => {
                assert_state(driver.is_selected(el).await?, "selected", action)
            }
            UiOperation::AssertText => {
                let actual = driver.text(el).await?;
                if actual.trim() == text_ref.trim() {
                    Ok(Value::String(actual))
                } else {
                    Err(EngineError::Assertion(format!(
                        "expected text \"{text_ref}\", got \"{actual}\""
                    )))
                }
            }
            UiOperation::Wait => {
                if element.is_none() {
                    let ms: u64 = text_ref.trim().parse().map_err(|_| {
                        EngineError::config(format!("wait needs milliseconds, got '{text_ref}'"))
                    })?;
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                Ok(Value::Null)
            }
            UiOperation::ExecuteScript => {
                driver.execute_script(text_ref, element.as_deref()).await
            }
            UiOperation::Back => driver.back().await.map(|_| Value::Null),
            UiOperation::Forward => driver.forward().await.map(|_| Value::Null),
            UiOperation::Refresh => driver.refresh().await.map(|_| Value::Null),
            UiOperation::Screenshot => Ok(driver
                .screenshot()
                .await?
                .map(Value::String)
                .unwrap_or(Value::Null)),
        }
    }
}

fn assert_state(holds: bool, state: &str, action: &UiAction) -> Result<Value> {
    if holds {
        Ok(Value::Bool(true))
    } else {
        let target = action
            .locator
            .as_ref()
            .map(|l| format!("{}={}", l.by, l.value))
            .unwrap_or_default();
        Err(EngineError::Assertion(format!("element {target} is not {state}")))
    }
}

/// Static checks that need no driver.
fn validate(action: &UiAction) -> Result<UiOperation> {
    let op = UiOperation::parse(&action.operation)?;
    if let Some(locator) = &action.locator {
        if !LOCATOR_STRATEGIES.contains(&locator.by.as_str()) {
            return Err(EngineError::config(format!(
                "unknown locator strategy '{}'",
                locator.by
            )));
        }
    } else if op.needs_locator() {
        return Err(EngineError::config(format!(
            "ui operation '{}' requires a locator",
            op.name()
        )));
    }
    if op.needs_text() && action.text.is_none() {
        return Err(EngineError::config(format!(
            "ui operation '{}' requires text",
            op.name()
        )));
    }
    Ok(op)
}

#[async_trait]
impl ActionBackend for UiActor {
    fn name(&self) -> &'static str {
        "ui"
    }

    fn check(&self, action: &Action) -> Result<()> {
        match action {
            Action::Ui(ui) => validate(ui).map(|_| ()),
            Action::Http(_) => Err(EngineError::config("ui backend cannot send http requests")),
        }
    }

    async fn execute(&mut self, action: &Action) -> Result<Outcome> {
        match action {
            Action::Ui(ui) => self.perform(ui).await,
            Action::Http(_) => Err(EngineError::config("ui backend cannot send http requests")),
        }
    }

    fn take_screenshots(&mut self) -> Vec<Screenshot> {
        std::mem::take(&mut self.failed_shots)
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(mut driver) = self.driver.take() {
            debug!("Quitting ui driver");
            driver.quit().await?;
        }
        Ok(())
    }
}

/// Creates one [`UiActor`] per case worker.
pub struct UiBackendFactory {
    drivers: Arc<dyn DriverFactory>,
    capture: bool,
    timeout_ms: u64,
}

impl UiBackendFactory {
    pub fn new(drivers: Arc<dyn DriverFactory>) -> Self {
        Self {
            drivers,
            capture: false,
            timeout_ms: DEFAULT_UI_TIMEOUT_MS,
        }
    }

    pub fn capture_screenshots(mut self, capture: bool) -> Self {
        self.capture = capture;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

#[async_trait]
impl BackendFactory for UiBackendFactory {
    async fn create(&self) -> Result<Box<dyn ActionBackend>> {
        Ok(Box::new(
            UiActor::new(Arc::clone(&self.drivers))
                .capture_screenshots(self.capture)
                .timeout_ms(self.timeout_ms),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory page: elements keyed by locator value.
    #[derive(Default)]
    struct FakePage {
        log: Vec<String>,
        hidden: Vec<String>,
        quit: bool,
    }

    struct FakeDriver(Arc<Mutex<FakePage>>);

    impl FakeDriver {
        fn record(&self, entry: String) {
            if let Ok(mut page) = self.0.lock() {
                page.log.push(entry);
            }
        }
    }

    #[async_trait]
    impl UiDriver for FakeDriver {
        async fn open(&mut self, url: &str) -> Result<()> {
            self.record(format!("open {url}"));
            Ok(())
        }
        async fn find(&mut self, locator: &Locator, _: Duration) -> Result<String> {
            if locator.value == "#missing" {
                return Err(EngineError::backend("no such element"));
            }
            Ok(locator.value.clone())
        }
        async fn click(&mut self, element: &str) -> Result<()> {
            self.record(format!("click {element}"));
            Ok(())
        }
        async fn clear(&mut self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn send_keys(&mut self, element: &str, text: &str) -> Result<()> {
            self.record(format!("keys {element} {text}"));
            Ok(())
        }
        async fn select(&mut self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        async fn attribute(&mut self, _: &str, name: &str) -> Result<Option<String>> {
            Ok(Some(format!("attr-{name}")))
        }
        async fn text(&mut self, _: &str) -> Result<String> {
            Ok("Welcome".into())
        }
        async fn is_displayed(&mut self, element: &str) -> Result<bool> {
            Ok(!self.0.lock().map(|p| p.hidden.contains(&element.to_string())).unwrap_or(false))
        }
        async fn is_enabled(&mut self, _: &str) -> Result<bool> {
            Ok(true)
        }
        async fn is_selected(&mut self, _: &str) -> Result<bool> {
            Ok(false)
        }
        async fn execute_script(&mut self, script: &str, _: Option<&str>) -> Result<Value> {
            Ok(Value::String(script.to_string()))
        }
        async fn window_handles(&mut self) -> Result<Vec<String>> {
            Ok(vec!["main".into(), "popup".into()])
        }
        async fn switch_to_window(&mut self, handle: &str) -> Result<()> {
            self.record(format!("switch {handle}"));
            Ok(())
        }
        async fn back(&mut self) -> Result<()> {
            Ok(())
        }
        async fn forward(&mut self) -> Result<()> {
            Ok(())
        }
        async fn refresh(&mut self) -> Result<()> {
            Ok(())
        }
        async fn current_url(&mut self) -> Result<String> {
            Ok("http://app.test/".into())
        }
        async fn screenshot(&mut self) -> Result<Option<String>> {
            Ok(Some("cG5n".into()))
        }
        async fn quit(&mut self) -> Result<()> {
            if let Ok(mut page) = self.0.lock() {
                page.quit = true;
            }
            Ok(())
        }
    }

    struct FakeFactory(Arc<Mutex<FakePage>>);

    #[async_trait]
    impl DriverFactory for FakeFactory {
        async fn connect(&self) -> Result<Box<dyn UiDriver>> {
            Ok(Box::new(FakeDriver(Arc::clone(&self.0))))
        }
    }

    fn ui(operation: &str, locator: Option<&str>, text: Option<&str>) -> Action {
        Action::Ui(UiAction {
            operation: operation.into(),
            locator: locator.map(|v| Locator {
                by: "css".into(),
                value: v.into(),
            }),
            text: text.map(|t| Value::String(t.into())),
            attribute: None,
            timeout_ms: Some(50),
        })
    }

    fn actor(page: &Arc<Mutex<FakePage>>) -> UiActor {
        UiActor::new(Arc::new(FakeFactory(Arc::clone(page))))
    }

    #[test]
    fn test_operation_registry() {
        assert_eq!(UiOperation::parse("get_text").unwrap(), UiOperation::GetText);
        assert_eq!(UiOperation::SwitchWindow.name(), "switch_window");
        assert_eq!(UiOperation::all().count(), 19);
        assert!(UiOperation::parse("double_click").is_err());
    }

    #[test]
    fn test_check_rejects_bad_definitions() {
        let page = Arc::new(Mutex::new(FakePage::default()));
        let actor = actor(&page);
        assert!(actor.check(&ui("click", Some("#go"), None)).is_ok());
        assert!(actor.check(&ui("click", None, None)).is_err());
        assert!(actor.check(&ui("input", Some("#q"), None)).is_err());
        assert!(actor.check(&ui("hover", Some("#q"), None)).is_err());
        let mut bad_locator = ui("click", Some("#go"), None);
        if let Action::Ui(action) = &mut bad_locator {
            action.locator = Some(Locator {
                by: "shadow".into(),
                value: "x".into(),
            });
        }
        assert!(actor.check(&bad_locator).is_err());
    }

    #[tokio::test]
    async fn test_operations_reach_driver() {
        let page = Arc::new(Mutex::new(FakePage::default()));
        let mut actor = actor(&page);
        actor.execute(&ui("open", None, Some("http://app.test"))).await.unwrap();
        actor.execute(&ui("input", Some("#q"), Some("rust"))).await.unwrap();
        let out = actor.execute(&ui("get_text", Some("#title"), None)).await.unwrap();
        assert_eq!(out.field("value"), Some(&json!("Welcome")));
        let out = actor.execute(&ui("switch_window", None, Some("1"))).await.unwrap();
        assert_eq!(out.field("value"), Some(&json!("popup")));
        actor.shutdown().await.unwrap();

        let page = page.lock().unwrap();
        assert_eq!(
            page.log,
            vec!["open http://app.test", "keys #q rust", "switch popup"]
        );
        assert!(page.quit);
    }

    #[tokio::test]
    async fn test_failed_assertion_keeps_both_screenshots() {
        let page = Arc::new(Mutex::new(FakePage {
            hidden: vec!["#banner".into()],
            ..Default::default()
        }));
        let mut actor = actor(&page).capture_screenshots(true);

        let ok = actor.execute(&ui("click", Some("#go"), None)).await.unwrap();
        assert_eq!(ok.screenshots.len(), 1);
        assert_eq!(ok.screenshots[0].phase, ShotPhase::After);

        let err = actor
            .execute(&ui("assert_visible", Some("#banner"), None))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Assertion(_)));
        let shots = actor.take_screenshots();
        assert_eq!(shots.len(), 2);
        assert_eq!(shots[0].phase, ShotPhase::Before);
        assert!(actor.take_screenshots().is_empty());
    }

    #[tokio::test]
    async fn test_assert_text() {
        let page = Arc::new(Mutex::new(FakePage::default()));
        let mut actor = actor(&page);
        assert!(actor
            .execute(&ui("assert_text", Some("#h1"), Some("Welcome")))
            .await
            .is_ok());
        let err = actor
            .execute(&ui("assert_text", Some("#h1"), Some("Goodbye")))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Assertion(_)));
    }
}
