use crate::report::RunSummary;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Response returned after submitting a run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub run_id: String,
    #[serde(default)]
    pub report_url: Option<String>,
}

/// Hands finished run summaries to the triggering application.
pub struct SummaryClient {
    api_url: String,
    api_key: String,
    http: reqwest::Client,
    max_retries: u32,
    backoff: Duration,
    request_timeout: Duration,
}

/// Result of one submission attempt.
enum Attempt {
    Accepted(SubmitResponse),
    /// Transient failure worth another try.
    Retry(String),
    Rejected(anyhow::Error),
}

impl SummaryClient {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            http,
            max_retries: 3,
            backoff: Duration::from_millis(500),
            request_timeout: Duration::from_secs(30),
        })
    }

    /// Base delay of the exponential backoff.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Upper bound for a single submission attempt.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// POST the summary to `{api_url}/v1/runs/{run_id}/summary`.
    ///
    /// Server errors, timeouts and connection failures are retried up
    /// to three times, doubling the delay each attempt. Other rejections
    /// fail at once.
    pub async fn submit(&self, summary: &RunSummary) -> Result<SubmitResponse> {
        let url = format!(
            "{}/v1/runs/{}/summary",
            self.api_url.trim_end_matches('/'),
            summary.run_id
        );

        let mut delay = self.backoff;
        let mut attempt = 0u32;
        loop {
            let reason = match self.attempt(&url, summary).await {
                Attempt::Accepted(body) => {
                    info!(run_id = %body.run_id, attempt = attempt + 1, "Run summary submitted");
                    return Ok(body);
                }
                Attempt::Rejected(e) => return Err(e),
                Attempt::Retry(reason) => reason,
            };
            if attempt == self.max_retries {
                anyhow::bail!("failed to submit summary after {attempt} retries: {reason}");
            }
            attempt += 1;
            warn!(attempt, "{reason}, retrying in {delay:?}");
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    async fn attempt(&self, url: &str, summary: &RunSummary) -> Attempt {
        let sent = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .timeout(self.request_timeout)
            .json(summary)
            .send()
            .await;
        let resp = match sent {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                return Attempt::Retry(format!(
                    "submission timed out after {} ms",
                    self.request_timeout.as_millis()
                ))
            }
            Err(e) => return Attempt::Retry(format!("summary endpoint unreachable: {e}")),
        };

        let status = resp.status();
        if status.is_success() {
            return match resp.json::<SubmitResponse>().await {
                Ok(body) => Attempt::Accepted(body),
                Err(e) => Attempt::Rejected(
                    anyhow::Error::new(e).context("failed to parse submit response"),
                ),
            };
        }
        let body = resp.text().await.unwrap_or_default();
        if is_retryable(status) {
            Attempt::Retry(format!("server error {status} - {body}"))
        } else {
            Attempt::Rejected(anyhow::anyhow!(
                "summary submission rejected: {status} - {body}"
            ))
        }
    }
}

/// Server errors and throttling are transient.
fn is_retryable(status: reqwest::StatusCode) -> bool {
    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::SummaryBuilder;
    use axum::{extract::Path, http::StatusCode, routing::post, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_submit_retries_server_errors() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let router = Router::new().route(
            "/v1/runs/:run_id/summary",
            post(move |Path(run_id): Path<String>| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(StatusCode::SERVICE_UNAVAILABLE)
                    } else {
                        Ok(Json(serde_json::json!({"run_id": run_id})))
                    }
                }
            }),
        );
        let base = serve(router).await;

        let client = SummaryClient::new(base, "secret")
            .unwrap()
            .with_backoff(Duration::from_millis(10));
        let summary = SummaryBuilder::new("run-7").finish();
        let resp = client.submit(&summary).await.unwrap();
        assert_eq!(resp.run_id, "run-7");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_submit_does_not_retry_client_errors() {
        let router = Router::new().route(
            "/v1/runs/:run_id/summary",
            post(|| async { StatusCode::UNAUTHORIZED }),
        );
        let base = serve(router).await;
        let client = SummaryClient::new(base, "wrong").unwrap();
        let err = client
            .submit(&SummaryBuilder::new("r").finish())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("401"), "{err}");
    }

    #[tokio::test]
    async fn test_submit_retries_timeouts() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let router = Router::new().route(
            "/v1/runs/:run_id/summary",
            post(move |Path(run_id): Path<String>| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                    Json(serde_json::json!({"run_id": run_id}))
                }
            }),
        );
        let base = serve(router).await;

        let client = SummaryClient::new(base, "secret")
            .unwrap()
            .with_backoff(Duration::from_millis(10))
            .with_request_timeout(Duration::from_millis(100));
        let resp = client.submit(&SummaryBuilder::new("run-8").finish()).await.unwrap();
        assert_eq!(resp.run_id, "run-8");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_submit_gives_up_after_retries() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let router = Router::new().route(
            "/v1/runs/:run_id/summary",
            post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { StatusCode::BAD_GATEWAY }
            }),
        );
        let base = serve(router).await;
        let client = SummaryClient::new(base, "secret")
            .unwrap()
            .with_backoff(Duration::from_millis(1));
        let err = client
            .submit(&SummaryBuilder::new("r").finish())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("after 3 retries"), "{err}");
        assert!(err.to_string().contains("502"), "{err}");
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }
}
