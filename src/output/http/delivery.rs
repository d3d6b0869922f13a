//! Delivery stage: backlog -> metrics API, with retry and exponential backoff.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use super::batcher::Batch;
use super::payload::{Payload, PayloadOptions};
use crate::config::HttpConfig;
use crate::output::OutputError;

/// Attempts per batch before it is dropped.
pub const MAX_ATTEMPTS: u32 = 4;

/// Wait before the first retry; doubled after every further failure.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Why a batch was not delivered.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The API answered with a status in `300..500`. Not retried.
    #[error("rejected by metrics API with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Every attempt failed with a transport error or a 5xx response.
    #[error("giving up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

enum Attempt {
    Delivered,
    Retry(String),
    Rejected(DeliveryError),
}

fn user_agent() -> String {
    format!(
        "vigil/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Sends batches one at a time, in backlog order.
pub struct Delivery {
    client: Client,
    url: Url,
    user: Option<String>,
    token: Option<String>,
    network_timeout: Duration,
    initial_backoff: Duration,
    options: PayloadOptions,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("url", &self.url.as_str())
            .field("user", &self.user)
            .field("network_timeout", &self.network_timeout)
            .field("initial_backoff", &self.initial_backoff)
            .finish_non_exhaustive()
    }
}

impl Delivery {
    /// Build the HTTP client and resolve credentials.
    ///
    /// Credentials embedded in the URL are used only where `user`/`token`
    /// are not configured; they are always stripped from the request URL.
    pub fn new(http: &HttpConfig, options: PayloadOptions) -> Result<Self, OutputError> {
        let mut url = Url::parse(&http.url).map_err(|e| OutputError::Url {
            url: http.url.clone(),
            reason: e.to_string(),
        })?;

        let url_user = Some(url.username().to_string()).filter(|u| !u.is_empty());
        let url_token = url.password().map(str::to_string);
        if url.set_username("").is_err() || url.set_password(None).is_err() {
            return Err(OutputError::Url {
                url: http.url.clone(),
                reason: "url cannot carry credentials".to_string(),
            });
        }

        let client = Client::builder()
            .connect_timeout(http.network_timeout)
            .user_agent(user_agent())
            .build()?;

        Ok(Self {
            client,
            url,
            user: http.user.clone().or(url_user),
            token: http.token.clone().or(url_token),
            network_timeout: http.network_timeout,
            initial_backoff: INITIAL_BACKOFF,
            options,
        })
    }

    /// Override the first retry delay.
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Deliver every batch from the backlog until it closes.
    pub async fn run(self, mut backlog: mpsc::Receiver<Batch>) {
        while let Some(batch) = backlog.recv().await {
            let size = batch.len();
            match self.deliver(&batch).await {
                Ok(()) => tracing::debug!(output = "http", size, "Batch delivered"),
                Err(e) => tracing::error!(output = "http", size, error = %e, "Batch dropped"),
            }
        }
        tracing::debug!(output = "http", "Delivery stopped, backlog closed");
    }

    /// Render, encode and send one batch.
    pub async fn deliver(&self, batch: &Batch) -> Result<(), DeliveryError> {
        let payload = Payload::from_batch(batch, &self.options);
        let body = serde_json::to_vec(&payload)?;
        self.send_with_backoff(body).await
    }

    /// POST `body`, retrying transport errors and 5xx responses.
    ///
    /// At most [`MAX_ATTEMPTS`] requests are made. The task sleeps between
    /// attempts, doubling the delay each time; there is no sleep after the
    /// last attempt.
    pub async fn send_with_backoff(&self, body: Vec<u8>) -> Result<(), DeliveryError> {
        let mut backoff = self.initial_backoff;
        let mut last_error = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            match self.attempt(&body).await {
                Attempt::Delivered => return Ok(()),
                Attempt::Rejected(e) => return Err(e),
                Attempt::Retry(reason) => {
                    if attempt < MAX_ATTEMPTS {
                        tracing::warn!(
                            output = "http",
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %reason,
                            "Delivery failed, backing off"
                        );
                        sleep(backoff).await;
                        backoff = backoff.saturating_mul(2);
                    } else {
                        tracing::warn!(output = "http", attempt, error = %reason, "Delivery failed");
                    }
                    last_error = reason;
                }
            }
        }

        Err(DeliveryError::Exhausted {
            attempts: MAX_ATTEMPTS,
            last_error,
        })
    }

    async fn attempt(&self, body: &[u8]) -> Attempt {
        let mut request = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec());
        if self.user.is_some() || self.token.is_some() {
            request = request.basic_auth(self.user.as_deref().unwrap_or(""), self.token.as_deref());
        }

        let response = match timeout(self.network_timeout, request.send()).await {
            Err(_) => {
                return Attempt::Retry(format!(
                    "no response within {}ms",
                    self.network_timeout.as_millis()
                ));
            }
            Ok(Err(e)) => return Attempt::Retry(e.to_string()),
            Ok(Ok(response)) => response,
        };

        let status = response.status().as_u16();
        if status < 300 {
            return Attempt::Delivered;
        }

        // The body is bounded like the headers; a stalled body must not wedge delivery.
        let body = match timeout(self.network_timeout, response.text()).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                tracing::debug!(output = "http", status, error = %e, "Failed to read response body");
                String::new()
            }
            Err(_) => {
                tracing::debug!(output = "http", status, "Response body stalled, abandoning it");
                String::new()
            }
        };
        if status >= 500 {
            tracing::debug!(output = "http", status, body = %body, "Server error response");
            Attempt::Retry(format!("server error {status}"))
        } else {
            Attempt::Rejected(DeliveryError::Rejected { status, body })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{Measurement, Unit};
    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use chrono::Utc;
    use std::io::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    /// Scripted metrics API: answers with `statuses[n]` on the n-th request,
    /// repeating the last status once the script runs out.
    #[derive(Clone)]
    struct MockApi {
        statuses: Arc<Vec<u16>>,
        attempts: Arc<AtomicUsize>,
        requests: Arc<Mutex<Vec<(HeaderMap, String)>>>,
    }

    async fn metrics(
        State(api): State<MockApi>,
        headers: HeaderMap,
        body: String,
    ) -> (StatusCode, &'static str) {
        let n = api.attempts.fetch_add(1, Ordering::SeqCst);
        api.requests.lock().unwrap().push((headers, body));
        let status = api
            .statuses
            .get(n)
            .or(api.statuses.last())
            .copied()
            .unwrap_or(200);
        (StatusCode::from_u16(status).unwrap(), "scripted response")
    }

    async fn start_mock(statuses: Vec<u16>) -> Option<(MockApi, String)> {
        let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
            Ok(l) => l,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                // Some sandboxed environments disallow binding; skip the test.
                return None;
            }
            Err(e) => panic!("Failed to bind mock API: {e}"),
        };
        let addr = listener.local_addr().unwrap();
        let api = MockApi {
            statuses: Arc::new(statuses),
            attempts: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        };
        let app = Router::new()
            .route("/v1/metrics", post(metrics))
            .with_state(api.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Some((api, format!("http://{addr}/v1/metrics")))
    }

    fn delivery(url: &str) -> Delivery {
        let http = HttpConfig {
            url: url.to_string(),
            user: Some("user".to_string()),
            token: Some("token".to_string()),
            ..Default::default()
        };
        Delivery::new(&http, PayloadOptions::default())
            .unwrap()
            .with_initial_backoff(Duration::from_millis(20))
    }

    fn sample_batch() -> Batch {
        Batch::new(vec![Measurement::gauge(
            Utc::now(),
            "self",
            ["queue", "length"],
            3,
            Unit::METRICS,
        )])
        .unwrap()
    }

    #[tokio::test]
    async fn test_retries_server_errors_until_success() {
        let Some((api, url)) = start_mock(vec![500, 500, 200]).await else {
            return;
        };
        delivery(&url).deliver(&sample_batch()).await.unwrap();
        assert_eq!(api.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_four_attempts() {
        let Some((api, url)) = start_mock(vec![500]).await else {
            return;
        };
        let start = Instant::now();
        let err = delivery(&url).deliver(&sample_batch()).await.unwrap_err();

        assert!(matches!(err, DeliveryError::Exhausted { attempts: 4, .. }));
        assert_eq!(api.attempts.load(Ordering::SeqCst), 4);
        // 20ms + 40ms + 80ms of backoff between the four attempts.
        assert!(start.elapsed() >= Duration::from_millis(140));
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let Some((api, url)) = start_mock(vec![401]).await else {
            return;
        };
        let err = delivery(&url).deliver(&sample_batch()).await.unwrap_err();

        match err {
            DeliveryError::Rejected { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "scripted response");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(api.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transport_errors_are_retried() {
        // Grab a free port, then close it so connections are refused.
        let listener = match std::net::TcpListener::bind("127.0.0.1:0") {
            Ok(l) => l,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => return,
            Err(e) => panic!("Failed to bind: {e}"),
        };
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = delivery(&format!("http://{addr}/v1/metrics"))
            .send_with_backoff(b"{}".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Exhausted { attempts: 4, .. }));
    }

    #[tokio::test]
    async fn test_stalled_error_body_does_not_wedge_delivery() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Answers 500 with a truncated body, then keeps the connection open.
        let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
            Ok(l) => l,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => return,
            Err(e) => panic!("Failed to bind: {e}"),
        };
        let addr = listener.local_addr().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream
                        .write_all(b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 100\r\n\r\npartial")
                        .await;
                    tokio::time::sleep(Duration::from_secs(60)).await;
                });
            }
        });

        let http = HttpConfig {
            url: format!("http://{addr}/v1/metrics"),
            network_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let delivery = Delivery::new(&http, PayloadOptions::default())
            .unwrap()
            .with_initial_backoff(Duration::from_millis(10));

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            delivery.send_with_backoff(b"{}".to_vec()),
        )
        .await
        .expect("delivery hung on a stalled response body");
        assert!(matches!(result, Err(DeliveryError::Exhausted { attempts: 4, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_request_headers_and_body() {
        let Some((api, url)) = start_mock(vec![200]).await else {
            return;
        };
        delivery(&url).deliver(&sample_batch()).await.unwrap();

        let requests = api.requests.lock().unwrap();
        let (headers, body) = &requests[0];
        assert_eq!(headers["content-type"], "application/json");
        assert!(headers["user-agent"].to_str().unwrap().starts_with("vigil/"));
        // base64("user:token")
        assert_eq!(headers["authorization"], "Basic dXNlcjp0b2tlbg==");

        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["gauges"][0]["name"], "self.queue.length");
        assert_eq!(json["gauges"][0]["value"], 3);
        assert_eq!(json["counters"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_url_credentials_and_precedence() {
        let Some((api, url)) = start_mock(vec![200]).await else {
            return;
        };
        let with_userinfo = url.replacen("http://", "http://user:pass@", 1);

        let http = HttpConfig {
            url: with_userinfo.clone(),
            ..Default::default()
        };
        Delivery::new(&http, PayloadOptions::default())
            .unwrap()
            .send_with_backoff(b"{}".to_vec())
            .await
            .unwrap();

        let http = HttpConfig {
            url: with_userinfo,
            user: Some("u".to_string()),
            token: Some("t".to_string()),
            ..Default::default()
        };
        let explicit = Delivery::new(&http, PayloadOptions::default()).unwrap();
        assert!(!format!("{explicit:?}").contains("pass"));
        explicit.send_with_backoff(b"{}".to_vec()).await.unwrap();

        let requests = api.requests.lock().unwrap();
        // base64("user:pass"), then base64("u:t")
        assert_eq!(requests[0].0["authorization"], "Basic dXNlcjpwYXNz");
        assert_eq!(requests[1].0["authorization"], "Basic dTp0");
    }

    #[test]
    fn test_invalid_url_rejected() {
        let http = HttpConfig {
            url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            Delivery::new(&http, PayloadOptions::default()),
            Err(OutputError::Url { .. })
        ));
    }
}
