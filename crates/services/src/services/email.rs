//! Outbound delivery client for the external email API.
//!
//! One `send` invocation wraps the whole per-message conversation with the
//! remote: bounded exponential retry over transient failures, a per-attempt
//! request timeout, and a process-local circuit breaker that fails fast once
//! the remote looks down.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::services::config::EmailConfig;

#[derive(Debug, Error)]
pub enum EmailError {
    /// The breaker is open; no I/O was performed.
    #[error("circuit breaker is open")]
    BreakerOpen,
    /// The remote rejected the request with a non-retryable status.
    #[error("delivery rejected with status {0}")]
    Terminal(u16),
    /// Transient failures outlasted the retry budget.
    #[error("delivery failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
    /// Shutdown arrived at a retry boundary.
    #[error("delivery cancelled by shutdown")]
    Cancelled,
}

#[derive(Serialize)]
struct SendEmailRequest<'a> {
    email: &'a str,
    message: &'a str,
}

/// 5xx, 408, 429 and transport-level failures are worth retrying; any other
/// non-2xx status is terminal.
fn retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// Consecutive-failure gate in front of the delivery API. Failures are
/// counted per `send` invocation; once the threshold is reached the breaker
/// opens for the reset window, then lets a single trial call through.
pub struct CircuitBreaker {
    failures: AtomicU32,
    /// Unix millis when the breaker opened; 0 = closed.
    opened_at_ms: AtomicU64,
    threshold: u32,
    reset: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset: Duration) -> Self {
        Self {
            failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            threshold,
            reset,
        }
    }

    pub fn is_open(&self) -> bool {
        let opened_at = self.opened_at_ms.load(Ordering::Relaxed);
        if opened_at == 0 {
            return false;
        }
        // Past the reset window the next caller is the half-open trial.
        now_ms().saturating_sub(opened_at) < self.reset.as_millis() as u64
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    fn record_success(&self) {
        let was_open = self.opened_at_ms.swap(0, Ordering::Relaxed) > 0;
        let prev_failures = self.failures.swap(0, Ordering::Relaxed);
        if was_open {
            tracing::info!(prev_failures, "circuit breaker closed after successful delivery");
        }
    }

    /// Returns true when this failure opened (or re-opened) the breaker. The
    /// open timestamp is refreshed on every failure past the threshold, so a
    /// failed half-open trial starts a fresh window.
    fn record_failure(&self) -> bool {
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures < self.threshold {
            return false;
        }
        let was_closed = self.opened_at_ms.swap(now_ms(), Ordering::Relaxed) == 0;
        if was_closed {
            tracing::warn!(
                failures,
                reset_ms = self.reset.as_millis() as u64,
                "circuit breaker opened after consecutive delivery failures"
            );
        }
        true
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Process-wide delivery counters, exposed for observability and tests.
#[derive(Default)]
pub struct EmailMetrics {
    total_attempts: AtomicU64,
    success_count: AtomicU64,
    timeout_count: AtomicU64,
    circuit_blocked: AtomicU64,
    last_error: Mutex<Option<String>>,
    last_success: Mutex<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone)]
pub struct EmailMetricsSnapshot {
    pub total_attempts: u64,
    pub success_count: u64,
    pub consecutive_failures: u32,
    pub timeout_count: u64,
    pub circuit_blocked: u64,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
}

pub struct EmailClient {
    http: reqwest::Client,
    config: EmailConfig,
    breaker: CircuitBreaker,
    metrics: EmailMetrics,
    shutdown: watch::Receiver<bool>,
}

impl EmailClient {
    pub fn new(config: EmailConfig, shutdown: watch::Receiver<bool>) -> Self {
        let breaker = CircuitBreaker::new(config.breaker_threshold, config.breaker_reset);
        Self {
            http: reqwest::Client::new(),
            config,
            breaker,
            metrics: EmailMetrics::default(),
            shutdown,
        }
    }

    pub fn metrics(&self) -> EmailMetricsSnapshot {
        EmailMetricsSnapshot {
            total_attempts: self.metrics.total_attempts.load(Ordering::Relaxed),
            success_count: self.metrics.success_count.load(Ordering::Relaxed),
            consecutive_failures: self.breaker.failure_count(),
            timeout_count: self.metrics.timeout_count.load(Ordering::Relaxed),
            circuit_blocked: self.metrics.circuit_blocked.load(Ordering::Relaxed),
            last_error: self.metrics.last_error.lock().unwrap().clone(),
            last_success: *self.metrics.last_success.lock().unwrap(),
        }
    }

    /// Deliver one message. Returns after success or a terminal outcome;
    /// transient failures are retried in-call with exponential backoff
    /// (`base · 2^n`). Backoff state does not outlive the invocation.
    pub async fn send(&self, email: &str, message: &str) -> Result<(), EmailError> {
        if self.breaker.is_open() {
            self.metrics.circuit_blocked.fetch_add(1, Ordering::Relaxed);
            return Err(EmailError::BreakerOpen);
        }

        let url = format!("{}/send-email", self.config.base_url);
        let payload = SendEmailRequest { email, message };
        let mut last_error = String::new();

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = self.retry_delay(attempt - 1);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying delivery after backoff"
                );
                if self.wait_or_shutdown(delay).await {
                    return Err(EmailError::Cancelled);
                }
            }

            self.metrics.total_attempts.fetch_add(1, Ordering::Relaxed);
            let response = self
                .http
                .post(&url)
                .header(reqwest::header::ACCEPT, "application/json")
                .json(&payload)
                .timeout(self.config.request_timeout)
                .send()
                .await;

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        self.breaker.record_success();
                        self.metrics.success_count.fetch_add(1, Ordering::Relaxed);
                        *self.metrics.last_success.lock().unwrap() = Some(Utc::now());
                        return Ok(());
                    }
                    if retryable_status(status) {
                        last_error = format!("delivery service returned {status}");
                        tracing::debug!(attempt, %status, "transient delivery failure");
                        continue;
                    }
                    let err = EmailError::Terminal(status.as_u16());
                    *self.metrics.last_error.lock().unwrap() = Some(err.to_string());
                    self.breaker.record_failure();
                    return Err(err);
                }
                Err(err) => {
                    if err.is_timeout() {
                        self.metrics.timeout_count.fetch_add(1, Ordering::Relaxed);
                    }
                    last_error = err.to_string();
                    tracing::debug!(attempt, error = %err, "transport-level delivery failure");
                }
            }
        }

        *self.metrics.last_error.lock().unwrap() = Some(last_error.clone());
        self.breaker.record_failure();
        Err(EmailError::Exhausted {
            attempts: self.config.max_retries + 1,
            last_error,
        })
    }

    fn retry_delay(&self, exponent: u32) -> Duration {
        self.config.retry_base_delay * (1u32 << exponent.min(6))
    }

    /// Sleep out the backoff, or return true when shutdown arrives first.
    async fn wait_or_shutdown(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return true;
        }
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                changed = shutdown.changed() => match changed {
                    Ok(()) if *shutdown.borrow() => return true,
                    Ok(()) => continue,
                    // Sender gone means shutdown can never arrive.
                    Err(_) => {
                        sleep.as_mut().await;
                        return false;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    use axum::{Json, Router, http::StatusCode, routing::post};

    use super::*;

    fn test_config(base_url: String) -> EmailConfig {
        EmailConfig {
            base_url,
            request_timeout: Duration::from_secs(2),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1),
            breaker_threshold: 100,
            breaker_reset: Duration::from_millis(60_000),
        }
    }

    fn client(config: EmailConfig) -> EmailClient {
        let (_tx, rx) = watch::channel(false);
        EmailClient::new(config, rx)
    }

    async fn spawn_stub(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn classifier_matches_the_failure_taxonomy() {
        assert!(retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(retryable_status(StatusCode::BAD_GATEWAY));
        assert!(retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!retryable_status(StatusCode::BAD_REQUEST));
        assert!(!retryable_status(StatusCode::NOT_FOUND));
        assert!(!retryable_status(StatusCode::UNPROCESSABLE_ENTITY));
    }

    #[test]
    fn backoff_doubles_from_the_base_delay() {
        let config = test_config("http://unused".to_string());
        let client = client(EmailConfig {
            retry_base_delay: Duration::from_millis(2_000),
            ..config
        });
        assert_eq!(client.retry_delay(0), Duration::from_millis(2_000));
        assert_eq!(client.retry_delay(1), Duration::from_millis(4_000));
        assert_eq!(client.retry_delay(2), Duration::from_millis(8_000));
    }

    #[test]
    fn breaker_opens_at_threshold_and_closes_on_success() {
        let breaker = CircuitBreaker::new(3, Duration::from_millis(50));
        assert!(!breaker.is_open());
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(breaker.is_open());

        // Past the window the next call is let through (half-open).
        std::thread::sleep(Duration::from_millis(60));
        assert!(!breaker.is_open());

        // A failed trial re-opens a fresh window.
        breaker.record_failure();
        assert!(breaker.is_open());

        breaker.record_success();
        assert!(!breaker.is_open());
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let hits = Arc::new(AtomicU32::new(0));
        let seen = Arc::new(Mutex::new(Vec::<serde_json::Value>::new()));
        let hits_handler = hits.clone();
        let seen_handler = seen.clone();
        let app = Router::new().route(
            "/send-email",
            post(move |Json(body): Json<serde_json::Value>| {
                let hits = hits_handler.clone();
                let seen = seen_handler.clone();
                async move {
                    seen.lock().unwrap().push(body);
                    if hits.fetch_add(1, Ordering::SeqCst) < 2 {
                        StatusCode::INTERNAL_SERVER_ERROR
                    } else {
                        StatusCode::OK
                    }
                }
            }),
        );
        let base_url = spawn_stub(app).await;
        let client = client(test_config(base_url));

        client
            .send("john.doe@example.com", "Hey, John Doe it's your birthday")
            .await
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 3);
        let metrics = client.metrics();
        assert_eq!(metrics.total_attempts, 3);
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.consecutive_failures, 0);
        assert!(metrics.last_success.is_some());

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0]["email"], "john.doe@example.com");
        assert_eq!(seen[0]["message"], "Hey, John Doe it's your birthday");
    }

    #[tokio::test]
    async fn terminal_status_fails_without_retry() {
        let hits = Arc::new(AtomicU32::new(0));
        let hits_handler = hits.clone();
        let app = Router::new().route(
            "/send-email",
            post(move || {
                let hits = hits_handler.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    StatusCode::BAD_REQUEST
                }
            }),
        );
        let base_url = spawn_stub(app).await;
        let client = client(test_config(base_url));

        let err = client.send("x@example.com", "hi").await.unwrap_err();
        assert!(matches!(err, EmailError::Terminal(400)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn breaker_blocks_after_consecutive_failed_invocations() {
        let hits = Arc::new(AtomicU32::new(0));
        let hits_handler = hits.clone();
        let app = Router::new().route(
            "/send-email",
            post(move || {
                let hits = hits_handler.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }),
        );
        let base_url = spawn_stub(app).await;
        let client = client(EmailConfig {
            max_retries: 0,
            breaker_threshold: 3,
            ..test_config(base_url)
        });

        for _ in 0..3 {
            let err = client.send("x@example.com", "hi").await.unwrap_err();
            assert!(matches!(err, EmailError::Exhausted { .. }));
        }

        // The fourth call fails fast without touching the remote.
        let err = client.send("x@example.com", "hi").await.unwrap_err();
        assert!(matches!(err, EmailError::BreakerOpen));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(client.metrics().circuit_blocked, 1);
    }

    #[tokio::test]
    async fn shutdown_aborts_at_the_retry_boundary() {
        let app = Router::new().route(
            "/send-email",
            post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        );
        let base_url = spawn_stub(app).await;
        let (tx, rx) = watch::channel(false);
        let client = Arc::new(EmailClient::new(
            EmailConfig {
                retry_base_delay: Duration::from_secs(30),
                ..test_config(base_url)
            },
            rx,
        ));

        let sender = client.clone();
        let handle = tokio::spawn(async move { sender.send("x@example.com", "hi").await });
        // Let the first attempt fail, then signal shutdown during backoff.
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("send returned promptly")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, EmailError::Cancelled));
    }
}
