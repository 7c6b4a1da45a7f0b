//! HTTP request actor.

use super::{ActionBackend, BackendFactory, Outcome};
use crate::error::{EngineError, Result};
use crate::model::{Action, HttpRequest, RequestBody};
use crate::resolver::render;
use async_trait::async_trait;
use indexmap::IndexMap;
use reqwest::{Client, Method};
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Sends [`HttpRequest`] actions with a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpActor {
    client: Client,
    base_url: Option<String>,
    headers: IndexMap<String, String>,
    timeout_ms: u64,
}

impl HttpActor {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            base_url: None,
            headers: IndexMap::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Base URL that relative request paths are joined onto.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Headers sent with every request unless the request sets them.
    pub fn default_headers(mut self, headers: IndexMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    fn build_url(&self, url: &str) -> Result<String> {
        if url.contains("://") {
            return Ok(url.to_string());
        }
        let Some(base_url) = &self.base_url else {
            return Err(EngineError::config(format!(
                "relative url '{url}' without a base url"
            )));
        };
        let base = reqwest::Url::parse(base_url)
            .map_err(|e| EngineError::config(format!("invalid base url '{base_url}': {e}")))?;
        if url.is_empty() {
            return Ok(base.to_string());
        }
        // Keep any path prefix of the base url.
        let mut prefix = base.to_string();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        let joined = format!("{prefix}{}", url.trim_start_matches('/'));
        reqwest::Url::parse(&joined)
            .map(|u| u.to_string())
            .map_err(|e| EngineError::config(format!("cannot join '{base_url}' and '{url}': {e}")))
    }

    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn send(&self, request: &HttpRequest) -> Result<Outcome> {
        let method = parse_method(&request.method)?;
        let url = self.build_url(&request.url)?;

        let mut headers: IndexMap<String, String> = self.headers.clone();
        for (name, value) in &request.headers {
            // Request headers win, whatever their case.
            headers.retain(|k, _| !k.eq_ignore_ascii_case(name));
            headers.insert(name.clone(), render(value));
        }
        let query: Vec<(String, String)> = request
            .query
            .iter()
            .map(|(k, v)| (k.clone(), render(v)))
            .collect();
        let timeout_ms = request.timeout_ms.unwrap_or(self.timeout_ms);

        let mut builder = self
            .client
            .request(method.clone(), &url)
            .timeout(Duration::from_millis(timeout_ms));
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !query.is_empty() {
            builder = builder.query(&query);
        }

        let mut sent_body = Value::Null;
        if let Some(body) = &request.body {
            match body {
                RequestBody::Json(value) => {
                    builder = builder.json(value);
                    sent_body = value.clone();
                }
                RequestBody::Form(fields) => {
                    let encoded = url::form_urlencoded::Serializer::new(String::new())
                        .extend_pairs(fields.iter().map(|(k, v)| (k.as_str(), render(v))))
                        .finish();
                    builder = builder
                        .header("Content-Type", "application/x-www-form-urlencoded")
                        .body(encoded.clone());
                    sent_body = Value::String(encoded);
                }
                RequestBody::Text(value) => {
                    let text = render(value);
                    builder = builder.body(text.clone().into_bytes());
                    sent_body = Value::String(text);
                }
            }
        }

        let request_value = json!({
            "method": method.as_str(),
            "url": url,
            "headers": headers,
            "query": request.query,
            "body": sent_body,
        });

        debug!("Sending request to {}", url);
        let start = Instant::now();
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::Timeout(timeout_ms)
            } else {
                EngineError::backend(format!("failed to send request: {e}"))
            }
        })?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let response_headers: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    Value::String(value.to_str().unwrap_or("").to_string()),
                )
            })
            .collect();
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::Timeout(timeout_ms)
            } else {
                EngineError::backend(format!("failed to read response body: {e}"))
            }
        })?;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        debug!(status, elapsed_ms, "Received response");

        let body = serde_json::from_str::<Value>(&text).unwrap_or_else(|_| Value::String(text.clone()));
        Ok(Outcome {
            request: request_value,
            response: json!({
                "status_code": status,
                "headers": response_headers,
                "body": body,
                "text": text,
                "elapsed_ms": elapsed_ms,
                "url": final_url,
            }),
            elapsed_ms,
            screenshots: Vec::new(),
        })
    }
}

impl Default for HttpActor {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a method name onto a [`Method`], rejecting anything outside the
/// usual verbs.
pub fn parse_method(method: &str) -> Result<Method> {
    match method.trim().to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "DELETE" => Ok(Method::DELETE),
        "PATCH" => Ok(Method::PATCH),
        "HEAD" => Ok(Method::HEAD),
        "OPTIONS" => Ok(Method::OPTIONS),
        other => Err(EngineError::config(format!("unsupported HTTP method '{other}'"))),
    }
}

#[async_trait]
impl ActionBackend for HttpActor {
    fn name(&self) -> &'static str {
        "http"
    }

    fn check(&self, action: &Action) -> Result<()> {
        match action {
            Action::Http(request) => parse_method(&request.method).map(|_| ()),
            Action::Ui(ui) => Err(EngineError::config(format!(
                "http backend cannot run ui operation '{}'",
                ui.operation
            ))),
        }
    }

    async fn execute(&mut self, action: &Action) -> Result<Outcome> {
        self.check(action)?;
        match action {
            Action::Http(request) => self.send(request).await,
            Action::Ui(_) => Err(EngineError::config("not an http action")),
        }
    }
}

/// Creates [`HttpActor`]s sharing one connection pool.
#[derive(Debug, Clone, Default)]
pub struct HttpBackendFactory {
    actor: HttpActor,
}

impl HttpBackendFactory {
    pub fn new(actor: HttpActor) -> Self {
        Self { actor }
    }
}

#[async_trait]
impl BackendFactory for HttpBackendFactory {
    async fn create(&self) -> Result<Box<dyn ActionBackend>> {
        Ok(Box::new(self.actor.clone()))
    }
}
