//! HTTP transport with retry, backoff and rate limiting.
//!
//! Every collector owns one `HttpClient`. The client keeps a persistent
//! connection pool, spaces outbound requests to honor the configured rate
//! limit, and retries retryable failures with exponential backoff.

use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::core::errors::DatacenterError;

/// Retry policy for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub retryable_status: HashSet<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            retryable_status: [429, 500, 502, 503, 504].into_iter().collect(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Default::default()
        }
    }

    /// Delay before retry `attempt` (0-based): `base * exp_base^attempt`,
    /// capped at `max_delay`.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.as_secs_f64() * self.exponential_base.powi(attempt as i32);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_status.contains(&status)
    }
}

/// Outbound request pacing. The guarantee is per client instance.
#[derive(Debug, Clone, Default)]
pub struct RateLimitPolicy {
    pub requests_per_second: Option<f64>,
    pub requests_per_minute: Option<u32>,
    pub burst_size: u32,
}

impl RateLimitPolicy {
    pub fn per_second(rate: f64) -> Self {
        Self {
            requests_per_second: Some(rate),
            ..Default::default()
        }
    }

    pub fn per_minute(rate: u32) -> Self {
        Self {
            requests_per_minute: Some(rate),
            ..Default::default()
        }
    }

    pub fn min_interval(&self) -> Option<Duration> {
        if let Some(rps) = self.requests_per_second.filter(|r| *r > 0.0) {
            return Some(Duration::from_secs_f64(1.0 / rps));
        }
        if let Some(rpm) = self.requests_per_minute.filter(|r| *r > 0) {
            return Some(Duration::from_secs_f64(60.0 / rpm as f64));
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl HttpMethod {
    fn as_reqwest(&self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Patch => reqwest::Method::PATCH,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
        }
    }
}

/// One outbound request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub params: Vec<(String, String)>,
    pub headers: HashMap<String, String>,
    pub form: Option<HashMap<String, String>>,
    pub json: Option<Value>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            params: Vec::new(),
            headers: HashMap::new(),
            form: None,
            json: None,
            timeout: None,
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Post,
            ..Self::get(url)
        }
    }

    pub fn with_params(mut self, params: Vec<(String, String)>) -> Self {
        self.params = params;
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_json(mut self, body: Value) -> Self {
        self.json = Some(body);
        self
    }

    pub fn with_form(mut self, form: HashMap<String, String>) -> Self {
        self.form = Some(form);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Captured response with the originating request attached.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub json: Option<Value>,
    pub elapsed: Duration,
    pub request: HttpRequest,
}

impl HttpResponse {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_json(&self) -> bool {
        self.headers
            .get("content-type")
            .map(|ct| ct.contains("application/json"))
            .unwrap_or(false)
    }
}

/// HTTP client with retry and rate limiting.
pub struct HttpClient {
    inner: reqwest::Client,
    retry_policy: RetryPolicy,
    rate_limit: Option<RateLimitPolicy>,
    default_headers: HashMap<String, String>,
    default_timeout: Duration,
    // Held across the pacing sleep so concurrent callers queue up.
    last_dispatch: tokio::sync::Mutex<Option<Instant>>,
    request_count: AtomicU64,
    error_count: AtomicU64,
}

impl HttpClient {
    pub fn new(
        retry_policy: RetryPolicy,
        rate_limit: Option<RateLimitPolicy>,
        default_headers: HashMap<String, String>,
        default_timeout: Duration,
    ) -> Result<Self, DatacenterError> {
        let inner = reqwest::Client::builder()
            .timeout(default_timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| DatacenterError::internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            inner,
            retry_policy,
            rate_limit,
            default_headers,
            default_timeout,
            last_dispatch: tokio::sync::Mutex::new(None),
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        })
    }

    pub fn with_defaults() -> Result<Self, DatacenterError> {
        Self::new(
            RetryPolicy::default(),
            None,
            HashMap::new(),
            Duration::from_secs(30),
        )
    }

    pub async fn get(
        &self,
        url: impl Into<String>,
        params: Vec<(String, String)>,
        headers: HashMap<String, String>,
    ) -> Result<HttpResponse, DatacenterError> {
        self.request(HttpRequest::get(url).with_params(params).with_headers(headers))
            .await
    }

    pub async fn post_json(
        &self,
        url: impl Into<String>,
        body: Value,
        headers: HashMap<String, String>,
    ) -> Result<HttpResponse, DatacenterError> {
        self.request(HttpRequest::post(url).with_json(body).with_headers(headers))
            .await
    }

    /// Execute a request with rate limiting and retry.
    ///
    /// Non-retryable error statuses are returned as responses; the caller
    /// decides via [`HttpResponse::ok`]. A transport-level failure after
    /// exhausting retries becomes a network error.
    pub async fn request(&self, request: HttpRequest) -> Result<HttpResponse, DatacenterError> {
        let mut last_response: Option<HttpResponse> = None;
        let mut last_error: Option<DatacenterError> = None;

        for attempt in 0..=self.retry_policy.max_retries {
            match self.execute_once(&request).await {
                Ok(response) => {
                    if response.ok() {
                        return Ok(response);
                    }
                    if !self.retry_policy.is_retryable_status(response.status) {
                        return Ok(response);
                    }
                    warn!(
                        url = %request.url,
                        status = response.status,
                        attempt = attempt + 1,
                        "retryable status"
                    );
                    last_response = Some(response);
                }
                Err(e) => {
                    warn!(url = %request.url, attempt = attempt + 1, "request failed: {e}");
                    last_error = Some(e);
                }
            }

            if attempt < self.retry_policy.max_retries {
                let delay = self.retry_policy.calculate_delay(attempt);
                debug!(url = %request.url, "retrying in {:.2}s", delay.as_secs_f64());
                sleep(delay).await;
            }
        }

        if let Some(response) = last_response {
            return Ok(response);
        }

        Err(last_error.unwrap_or_else(|| {
            DatacenterError::network(format!(
                "request failed after {} retries: {}",
                self.retry_policy.max_retries, request.url
            ))
        }))
    }

    async fn execute_once(&self, request: &HttpRequest) -> Result<HttpResponse, DatacenterError> {
        self.apply_rate_limit().await;
        self.request_count.fetch_add(1, Ordering::Relaxed);

        let mut builder = self
            .inner
            .request(request.method.as_reqwest(), &request.url)
            .timeout(request.timeout.unwrap_or(self.default_timeout));

        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        for (name, value) in self.default_headers.iter().chain(request.headers.iter()) {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(form) = &request.form {
            builder = builder.form(form);
        }
        if let Some(body) = &request.json {
            builder = builder.json(body);
        }

        let started = Instant::now();
        let response = builder.send().await.map_err(|e| {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            DatacenterError::network(format!("{}: {e}", request.url))
        })?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_ascii_lowercase(),
                    v.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();

        let body = response.text().await.map_err(|e| {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            DatacenterError::network(format!("{}: failed to read body: {e}", request.url))
        })?;
        let elapsed = started.elapsed();

        let json = headers
            .get("content-type")
            .filter(|ct| ct.contains("application/json"))
            .and_then(|_| serde_json::from_str(&body).ok());

        if !(200..300).contains(&status) {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }

        Ok(HttpResponse {
            status,
            headers,
            body,
            json,
            elapsed,
            request: request.clone(),
        })
    }

    /// Sleep until the minimum inter-request interval has elapsed.
    async fn apply_rate_limit(&self) {
        let Some(min_interval) = self.rate_limit.as_ref().and_then(|p| p.min_interval()) else {
            return;
        };

        let mut last = self.last_dispatch.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < min_interval {
                let wait = min_interval - elapsed;
                debug!("rate limiting: waiting {}ms", wait.as_millis());
                sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }

    pub fn stats(&self) -> Value {
        let requests = self.request_count.load(Ordering::Relaxed);
        let errors = self.error_count.load(Ordering::Relaxed);
        json!({
            "request_count": requests,
            "error_count": errors,
            "error_rate": if requests > 0 { errors as f64 / requests as f64 } else { 0.0 },
        })
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_monotonically_to_the_cap() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            exponential_base: 2.0,
            ..Default::default()
        };

        let mut previous = Duration::ZERO;
        for attempt in 0..10 {
            let delay = policy.calculate_delay(attempt);
            assert!(delay >= previous, "attempt {attempt}");
            assert!(delay <= Duration::from_secs(2));
            previous = delay;
        }
        assert_eq!(policy.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(9), Duration::from_secs(2));
    }

    #[test]
    fn min_interval_from_either_rate() {
        assert_eq!(
            RateLimitPolicy::per_second(10.0).min_interval(),
            Some(Duration::from_millis(100))
        );
        assert_eq!(
            RateLimitPolicy::per_minute(60).min_interval(),
            Some(Duration::from_secs(1))
        );
        assert_eq!(RateLimitPolicy::default().min_interval(), None);
    }

    #[test]
    fn default_retryable_statuses() {
        let policy = RetryPolicy::default();
        for status in [429, 500, 502, 503, 504] {
            assert!(policy.is_retryable_status(status));
        }
        assert!(!policy.is_retryable_status(404));
        assert!(!policy.is_retryable_status(200));
    }
}
