//! One HTTP exchange, with transient network failures retried.

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use reqwest::cookie::Jar;
use reqwest::{Client, Method};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Failure below the HTTP layer. HTTP error statuses are not errors here.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Connectivity problem worth retrying.
    #[error("network error: {0}")]
    Network(String),

    /// The request could not be built or sent and retrying will not help.
    #[error("request failed: {0}")]
    Request(String),

    #[error("request aborted by kill switch")]
    Aborted,
}

/// An outbound request, fully materialized so it can be resent verbatim.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name.to_string(), value)),
        }
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// JSON body with the matching content type.
    pub fn json(self, value: &serde_json::Value) -> Self {
        self.header("content-type", "application/json; charset=UTF-8")
            .body(value.to_string())
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// A fully read response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub content_type: String,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Performs a single HTTP exchange.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Production transport on top of `reqwest`.
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str) -> Result<Self, TransportError> {
        Self::build(Client::builder().user_agent(user_agent))
    }

    /// Transport whose requests carry (and update) the cookies in `jar`.
    pub fn with_cookie_jar(user_agent: &str, jar: Arc<Jar>) -> Result<Self, TransportError> {
        Self::build(Client::builder().user_agent(user_agent).cookie_provider(jar))
    }

    fn build(builder: reqwest::ClientBuilder) -> Result<Self, TransportError> {
        let client = builder
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self { client })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_connect() || err.is_timeout() || err.is_request() || err.is_body() {
        TransportError::Network(err.to_string())
    } else {
        TransportError::Request(err.to_string())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self.client.request(request.method, request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.bytes().await.map_err(classify)?;

        Ok(HttpResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            content_type,
            body,
        })
    }
}

/// Host-settable flag that stops any further transport attempts.
#[derive(Debug, Clone, Default)]
pub struct KillSwitch(Arc<AtomicBool>);

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_tripped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Backoff schedule for network failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    /// Once the next backoff would exceed this, the failure is returned.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(10_000),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), or `None` when retries are exhausted.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        let factor = 2u32.checked_pow(attempt.saturating_sub(1))?;
        let delay = self.initial_backoff.checked_mul(factor)?;
        (delay <= self.max_backoff).then_some(delay)
    }
}

/// Wraps a transport and retries network failures with exponential backoff.
pub struct ResilientTransport {
    inner: Arc<dyn HttpTransport>,
    policy: RetryPolicy,
    kill_switch: KillSwitch,
}

impl ResilientTransport {
    pub fn new(
        inner: Arc<dyn HttpTransport>,
        policy: RetryPolicy,
        kill_switch: KillSwitch,
    ) -> Self {
        Self {
            inner,
            policy,
            kill_switch,
        }
    }

    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill_switch
    }

    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut attempt = 0;
        loop {
            if self.kill_switch.is_tripped() {
                warn!("Kill switch set, not sending {} {}", request.method, request.url);
                return Err(TransportError::Aborted);
            }

            match self.inner.send(request.clone()).await {
                Ok(response) => {
                    debug!("{} {} -> {}", request.method, request.url, response.status);
                    return Ok(response);
                }
                Err(TransportError::Network(message)) => {
                    attempt += 1;
                    let Some(delay) = self.policy.delay_for_attempt(attempt) else {
                        return Err(TransportError::Network(message));
                    };
                    warn!(
                        "{} during {} {}, retrying in {}ms",
                        message,
                        request.method,
                        request.url,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl HttpTransport for ResilientTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        ResilientTransport::send(self, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{json_response, ScriptedTransport};

    fn request() -> HttpRequest {
        HttpRequest::new(Method::GET, Url::parse("https://www.reddit.com/api/me.json").unwrap())
    }

    fn resilient(inner: Arc<ScriptedTransport>, kill_switch: KillSwitch) -> ResilientTransport {
        ResilientTransport::new(inner, RetryPolicy::default(), kill_switch)
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Some(Duration::from_millis(1000)));
        assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_millis(2000)));
        assert_eq!(policy.delay_for_attempt(3), Some(Duration::from_millis(4000)));
        assert_eq!(policy.delay_for_attempt(4), Some(Duration::from_millis(8000)));
        assert_eq!(policy.delay_for_attempt(5), None);
    }

    #[test]
    fn test_header_replaces_case_insensitively() {
        let request = request()
            .header("Content-Type", "text/plain")
            .header("content-type", "application/json");
        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.header_value("CONTENT-TYPE"), Some("application/json"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_failures_are_retried_with_backoff() {
        let scripted = Arc::new(ScriptedTransport::new());
        for _ in 0..3 {
            scripted.push_err(TransportError::Network("connection reset".to_string()));
        }
        scripted.push(json_response(200, serde_json::json!({"ok": true})));

        let transport = resilient(scripted.clone(), KillSwitch::new());
        let started = tokio::time::Instant::now();
        let response = transport.send(request()).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(response.status, 200);
        assert_eq!(scripted.requests().len(), 4);
        assert!(elapsed >= Duration::from_millis(7000), "slept {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(7500), "slept {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_failure_propagates_once_backoff_exceeds_cap() {
        let scripted = Arc::new(ScriptedTransport::new());
        for _ in 0..5 {
            scripted.push_err(TransportError::Network("offline".to_string()));
        }

        let transport = resilient(scripted.clone(), KillSwitch::new());
        let err = transport.send(request()).await.unwrap_err();

        assert!(matches!(err, TransportError::Network(_)));
        assert_eq!(scripted.requests().len(), 5);
    }

    #[tokio::test]
    async fn test_http_error_status_is_returned_not_retried() {
        let scripted = Arc::new(ScriptedTransport::new());
        scripted.push(json_response(503, serde_json::json!({})));

        let transport = resilient(scripted.clone(), KillSwitch::new());
        assert_eq!(transport.send(request()).await.unwrap().status, 503);
        assert_eq!(scripted.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_request_errors_are_not_retried() {
        let scripted = Arc::new(ScriptedTransport::new());
        scripted.push_err(TransportError::Request("bad header".to_string()));

        let transport = resilient(scripted.clone(), KillSwitch::new());
        assert!(matches!(transport.send(request()).await, Err(TransportError::Request(_))));
        assert_eq!(scripted.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_switch_stops_retry_loop() {
        let scripted = Arc::new(ScriptedTransport::new());
        scripted.push_err(TransportError::Network("offline".to_string()));
        scripted.push(json_response(200, serde_json::json!({})));

        let kill_switch = KillSwitch::new();
        let transport = resilient(scripted.clone(), kill_switch.clone());

        let switch = kill_switch.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            switch.trip();
        });

        assert!(matches!(transport.send(request()).await, Err(TransportError::Aborted)));
        assert_eq!(scripted.requests().len(), 1);

        kill_switch.reset();
        assert_eq!(transport.send(request()).await.unwrap().status, 200);
    }
}
