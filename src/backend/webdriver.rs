//! W3C WebDriver client.
//!
//! Speaks the W3C WebDriver JSON protocol, which both
//! browser drivers and Appium servers accept.

use super::ui::{DriverFactory, UiDriver, DEFAULT_UI_TIMEOUT_MS};
use crate::error::{EngineError, Result};
use crate::model::Locator;
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// Key under which W3C drivers return element references.
pub const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A live WebDriver session.
#[derive(Debug)]
pub struct WebDriverSession {
    client: Client,
    session_url: String,
    session_id: String,
    /// Upper bound for a single driver command.
    command_timeout: Duration,
}

impl WebDriverSession {
    /// Open a session on `server_url` with the given capabilities.
    #[instrument(skip(client, capabilities))]
    pub async fn start(
        client: Client,
        server_url: &str,
        capabilities: Value,
        command_timeout: Duration,
    ) -> Result<Self> {
        let server = server_url.trim_end_matches('/');
        let value = send(
            &client,
            Method::POST,
            &format!("{server}/session"),
            Some(json!({ "capabilities": { "alwaysMatch": capabilities } })),
            command_timeout,
        )
        .await?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::backend("new session response has no sessionId"))?
            .to_string();
        debug!(session_id, "WebDriver session started");
        Ok(Self {
            client,
            session_url: format!("{server}/session/{session_id}"),
            session_id,
            command_timeout,
        })
    }

    pub fn id(&self) -> &str {
        &self.session_id
    }

    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        send(
            &self.client,
            method,
            &format!("{}{path}", self.session_url),
            body,
            self.command_timeout,
        )
        .await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.command(Method::POST, path, Some(body)).await
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.command(Method::GET, path, None).await
    }

    async fn find_once(&self, scope: &str, using: &str, value: &str) -> Result<Option<String>> {
        match self
            .post(&format!("{scope}/element"), json!({ "using": using, "value": value }))
            .await
        {
            Ok(found) => element_id(&found).map(Some),
            Err(EngineError::Backend(msg)) if msg.starts_with("no such element") => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Translate a locator into a W3C `(using, value)` pair.
pub fn locator_strategy(locator: &Locator) -> Result<(&'static str, String)> {
    let value = locator.value.clone();
    let pair = match locator.by.as_str() {
        "css" => ("css selector", value),
        "xpath" => ("xpath", value),
        "link_text" => ("link text", value),
        "partial_link_text" => ("partial link text", value),
        "tag_name" => ("tag name", value),
        "id" => ("css selector", format!("[id=\"{value}\"]")),
        "name" => ("css selector", format!("[name=\"{value}\"]")),
        "class_name" => ("css selector", format!(".{value}")),
        "accessibility_id" => ("accessibility id", value),
        other => {
            return Err(EngineError::config(format!("unknown locator strategy '{other}'")))
        }
    };
    Ok(pair)
}

fn element_id(value: &Value) -> Result<String> {
    value
        .get(ELEMENT_KEY)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| EngineError::backend(format!("not an element reference: {value}")))
}

/// Send one command and unwrap the `value` envelope. The whole
/// exchange, body included, must finish within `timeout`.
async fn send(
    client: &Client,
    method: Method,
    url: &str,
    body: Option<Value>,
    timeout: Duration,
) -> Result<Value> {
    let timed_out = || EngineError::Timeout(timeout.as_millis() as u64);
    let mut builder = client.request(method, url).timeout(timeout);
    if let Some(body) = body {
        builder = builder.json(&body);
    }
    let response = builder.send().await.map_err(|e| {
        if e.is_timeout() {
            timed_out()
        } else {
            EngineError::backend(format!("webdriver unreachable: {e}"))
        }
    })?;
    let status = response.status();
    let payload: Value = response.json().await.map_err(|e| {
        if e.is_timeout() {
            timed_out()
        } else {
            EngineError::backend(format!("invalid webdriver response: {e}"))
        }
    })?;
    let value = payload.get("value").cloned().unwrap_or(Value::Null);

    if !status.is_success() {
        let error = value.get("error").and_then(Value::as_str).unwrap_or("unknown error");
        let message = value.get("message").and_then(Value::as_str).unwrap_or_default();
        return Err(EngineError::backend(format!("{error}: {message}")));
    }
    Ok(value)
}

#[async_trait]
impl UiDriver for WebDriverSession {
    async fn open(&mut self, url: &str) -> Result<()> {
        self.post("/url", json!({ "url": url })).await.map(|_| ())
    }

    async fn find(&mut self, locator: &Locator, timeout: Duration) -> Result<String> {
        let (using, value) = locator_strategy(locator)?;
        let deadline = Instant::now() + timeout;
        let poll = async {
            loop {
                if let Some(id) = self.find_once("", using, &value).await? {
                    return Ok(id);
                }
                if Instant::now() >= deadline {
                    return Err(EngineError::Timeout(timeout.as_millis() as u64));
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        // A driver that stops answering mid-poll still ends at the deadline.
        tokio::time::timeout(timeout + POLL_INTERVAL, poll)
            .await
            .unwrap_or(Err(EngineError::Timeout(timeout.as_millis() as u64)))
    }

    async fn click(&mut self, element: &str) -> Result<()> {
        self.post(&format!("/element/{element}/click"), json!({})).await.map(|_| ())
    }

    async fn clear(&mut self, element: &str) -> Result<()> {
        self.post(&format!("/element/{element}/clear"), json!({})).await.map(|_| ())
    }

    async fn send_keys(&mut self, element: &str, text: &str) -> Result<()> {
        self.post(&format!("/element/{element}/value"), json!({ "text": text }))
            .await
            .map(|_| ())
    }

    async fn select(&mut self, element: &str, option: &str) -> Result<()> {
        let xpath = format!(".//option[normalize-space(.)=\"{}\"]", option.trim());
        let found = self
            .find_once(&format!("/element/{element}"), "xpath", &xpath)
            .await?
            .ok_or_else(|| EngineError::backend(format!("no option \"{option}\"")))?;
        self.click(&found).await
    }

    async fn attribute(&mut self, element: &str, name: &str) -> Result<Option<String>> {
        let value = self.get(&format!("/element/{element}/attribute/{name}")).await?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn text(&mut self, element: &str) -> Result<String> {
        let value = self.get(&format!("/element/{element}/text")).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn is_displayed(&mut self, element: &str) -> Result<bool> {
        let value = self.get(&format!("/element/{element}/displayed")).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn is_enabled(&mut self, element: &str) -> Result<bool> {
        let value = self.get(&format!("/element/{element}/enabled")).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn is_selected(&mut self, element: &str) -> Result<bool> {
        let value = self.get(&format!("/element/{element}/selected")).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn execute_script(&mut self, script: &str, element: Option<&str>) -> Result<Value> {
        let args: Vec<Value> = element
            .map(|id| json!({ ELEMENT_KEY: id }))
            .into_iter()
            .collect();
        self.post("/execute/sync", json!({ "script": script, "args": args })).await
    }

    async fn window_handles(&mut self) -> Result<Vec<String>> {
        let value = self.get("/window/handles").await?;
        Ok(value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|h| h.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn switch_to_window(&mut self, handle: &str) -> Result<()> {
        self.post("/window", json!({ "handle": handle })).await.map(|_| ())
    }

    async fn back(&mut self) -> Result<()> {
        self.post("/back", json!({})).await.map(|_| ())
    }

    async fn forward(&mut self) -> Result<()> {
        self.post("/forward", json!({})).await.map(|_| ())
    }

    async fn refresh(&mut self) -> Result<()> {
        self.post("/refresh", json!({})).await.map(|_| ())
    }

    async fn current_url(&mut self) -> Result<String> {
        let value = self.get("/url").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn screenshot(&mut self) -> Result<Option<String>> {
        let value = self.get("/screenshot").await?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn quit(&mut self) -> Result<()> {
        debug!(session_id = %self.session_id, "Closing WebDriver session");
        self.command(Method::DELETE, "", None).await.map(|_| ())
    }
}

/// Opens a fresh WebDriver session per case worker.
#[derive(Debug, Clone)]
pub struct WebDriverFactory {
    client: Client,
    server_url: String,
    capabilities: Value,
    command_timeout: Duration,
}

impl WebDriverFactory {
    pub fn new(server_url: impl Into<String>, capabilities: Value) -> Self {
        Self {
            client: Client::new(),
            server_url: server_url.into(),
            capabilities,
            command_timeout: Duration::from_millis(DEFAULT_UI_TIMEOUT_MS),
        }
    }

    /// Upper bound for each driver command, session creation included.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

#[async_trait]
impl DriverFactory for WebDriverFactory {
    async fn connect(&self) -> Result<Box<dyn UiDriver>> {
        let session = WebDriverSession::start(
            self.client.clone(),
            &self.server_url,
            self.capabilities.clone(),
            self.command_timeout,
        )
        .await?;
        Ok(Box::new(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator(by: &str, value: &str) -> Locator {
        Locator {
            by: by.into(),
            value: value.into(),
        }
    }

    #[test]
    fn test_locator_strategy_mapping() {
        assert_eq!(
            locator_strategy(&locator("id", "login")).unwrap(),
            ("css selector", "[id=\"login\"]".to_string())
        );
        assert_eq!(
            locator_strategy(&locator("class_name", "btn")).unwrap(),
            ("css selector", ".btn".to_string())
        );
        assert_eq!(
            locator_strategy(&locator("accessibility_id", "Submit")).unwrap().0,
            "accessibility id"
        );
        assert!(locator_strategy(&locator("shadow", "x")).is_err());
    }

    #[test]
    fn test_element_id() {
        let found = json!({ ELEMENT_KEY: "abc-1" });
        assert_eq!(element_id(&found).unwrap(), "abc-1");
        assert!(element_id(&json!({})).is_err());
    }

    async fn serve(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_hung_driver_commands_time_out() {
        use axum::routing::post;

        let router = axum::Router::new()
            .route(
                "/session",
                post(|| async { axum::Json(json!({ "value": { "sessionId": "s1" } })) }),
            )
            .route(
                "/session/s1/element",
                post(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    axum::Json(json!({ "value": {} }))
                }),
            )
            .route(
                "/stalled/session",
                post(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    axum::Json(json!({ "value": { "sessionId": "late" } }))
                }),
            );
        let base = serve(router).await;

        let stalled = WebDriverFactory::new(format!("{base}/stalled"), json!({}))
            .command_timeout(Duration::from_millis(100));
        let started = Instant::now();
        let err = stalled.connect().await.err().unwrap();
        assert!(matches!(err, EngineError::Timeout(100)), "{err}");
        assert!(started.elapsed() < Duration::from_secs(2));

        let factory =
            WebDriverFactory::new(base, json!({})).command_timeout(Duration::from_millis(100));
        let mut driver = factory.connect().await.unwrap();
        let started = Instant::now();
        let err = driver
            .find(&locator("css", "#slow"), Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)), "{err}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
