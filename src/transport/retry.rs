//! Retrying dispatcher with bounded exponential backoff and jitter.
//!
//! The delay for retry `n` (0-indexed) is `base × multiplier^min(n, 15)`,
//! capped at `max_delay_ms`. With jitter enabled the capped delay is scaled by
//! a factor drawn from `[0.5, 0.5 + max_jitter_factor]` and capped again.
//! Waiting is a `tokio::time::sleep`, so other tasks keep running.
//!
//! ```rust
//! use std::time::Duration;
//! use taskq::transport::RetryPolicy;
//!
//! let policy = RetryPolicy { disable_jitter: true, ..RetryPolicy::default() };
//! assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
//! assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
//! assert_eq!(policy.delay_for_attempt(15), Duration::from_secs(30));
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, info, warn};
use uuid::Uuid;

use super::classify::{self, retry_cause};
use super::client::Transport;
use super::types::{HttpRequest, HttpResponse, TransportFailure};
use crate::error::{Error, ErrorCode, NetworkErrorKind};
use crate::metrics::{CorrelationTable, MetricsRecorder, NoopMetrics};

/// Exponent cap; keeps `multiplier^n` finite for any attempt count.
const MAX_BACKOFF_EXPONENT: u32 = 15;

/// Upper bound for `max_jitter_factor`.
const MAX_JITTER_FACTOR: f64 = 16.0;

/// When and how long to wait before resending a failed request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero disables retrying.
    #[serde(default = "default_max_retries", alias = "maxRetries")]
    pub max_retries: u32,

    #[serde(default = "default_status_codes", alias = "statusCodes")]
    pub status_codes: BTreeSet<u16>,

    #[serde(default = "default_error_codes", alias = "errorCodes")]
    pub error_codes: BTreeSet<ErrorCode>,

    #[serde(
        default = "default_initial_base_retry_delay_ms",
        alias = "initialBaseRetryDelayMs"
    )]
    pub initial_base_retry_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier", alias = "backoffMultiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_max_delay_ms", alias = "maxDelayMs")]
    pub max_delay_ms: u64,

    #[serde(default, alias = "disableJitter")]
    pub disable_jitter: bool,

    #[serde(default = "default_max_jitter_factor", alias = "maxJitterFactor")]
    pub max_jitter_factor: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_status_codes() -> BTreeSet<u16> {
    BTreeSet::from([500, 502, 503, 504])
}

fn default_error_codes() -> BTreeSet<ErrorCode> {
    BTreeSet::from([
        ErrorCode::ConnectionReset,
        ErrorCode::ConnectionRefused,
        ErrorCode::Timeout,
        ErrorCode::DnsFailure,
        ErrorCode::TemporaryDnsFailure,
    ])
}

fn default_initial_base_retry_delay_ms() -> u64 {
    100
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_jitter_factor() -> f64 {
    1.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            status_codes: default_status_codes(),
            error_codes: default_error_codes(),
            initial_base_retry_delay_ms: default_initial_base_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            disable_jitter: false,
            max_jitter_factor: default_max_jitter_factor(),
        }
    }
}

impl RetryPolicy {
    /// Clamps values that would break the backoff contract: a multiplier below
    /// 1 (delays would shrink) and a jitter factor outside `[0, 16]`.
    pub fn sanitized(mut self) -> Self {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            self.backoff_multiplier = 1.0;
        }
        self.max_jitter_factor = if self.max_jitter_factor.is_nan() {
            0.0
        } else {
            self.max_jitter_factor.clamp(0.0, MAX_JITTER_FACTOR)
        };
        self
    }

    /// Unjittered delay before retry `attempt` (0-indexed).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(MAX_BACKOFF_EXPONENT) as i32;
        let max_ms = self.max_delay_ms as f64;
        let ms = self.initial_base_retry_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        if !ms.is_finite() || ms < 0.0 || ms > max_ms {
            Duration::from_millis(self.max_delay_ms)
        } else {
            Duration::from_nanos((ms * 1_000_000.0).round() as u64)
        }
    }

    /// Delay before retry `attempt`, with jitter unless disabled.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.disable_jitter {
            return base;
        }
        let max = Duration::from_millis(self.max_delay_ms);
        let spread = if self.max_jitter_factor.is_finite() {
            self.max_jitter_factor.max(0.0)
        } else {
            0.0
        };
        let factor = rand::rng().random_range(0.5..=0.5 + spread);
        Duration::try_from_secs_f64(base.as_secs_f64() * factor)
            .map_or(max, |jittered| jittered.min(max))
    }

    /// Whether a failed attempt is eligible for another try.
    ///
    /// Cancellations never are; connection failures need a code from
    /// `error_codes`, HTTP failures a status from `status_codes`.
    pub fn should_retry(&self, err: &Error) -> bool {
        match err {
            Error::Network(e) => {
                !matches!(
                    e.kind,
                    NetworkErrorKind::RequestCancelled | NetworkErrorKind::RequestAborted
                ) && e.code.is_some_and(|code| self.error_codes.contains(&code))
            }
            Error::Http(e) => self.status_codes.contains(&e.status),
            _ => false,
        }
    }
}

/// Sends requests through a [`Transport`], retrying per [`RetryPolicy`].
pub struct Dispatcher<T> {
    transport: T,
    policy: RetryPolicy,
    metrics: Arc<dyn MetricsRecorder>,
    correlation: Arc<CorrelationTable>,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy: policy.sanitized(),
            metrics: Arc::new(NoopMetrics),
            correlation: Arc::new(CorrelationTable::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn metrics(&self) -> Arc<dyn MetricsRecorder> {
        Arc::clone(&self.metrics)
    }

    /// In-flight measurements; empty whenever no request is running.
    pub fn correlation(&self) -> &CorrelationTable {
        &self.correlation
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Sends `request` until it succeeds, fails permanently, or retries run out.
    pub async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, Error> {
        self.send_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Like [`send`](Self::send), stopping early once `cancel` fires.
    ///
    /// On exhaustion the last attempt's error is returned unchanged.
    pub async fn send_with_cancel(
        &self,
        request: &HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, Error> {
        let span = debug_span!(
            "http_request",
            request_id = %Uuid::new_v4(),
            method = %request.method,
            url = %request.url,
        );
        self.retry_loop(request, cancel).instrument(span).await
    }

    async fn retry_loop(
        &self,
        request: &HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, Error> {
        let mut attempt: u32 = 0;
        loop {
            let err = match self.attempt(request, cancel).await {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            if !self.policy.should_retry(&err) {
                debug!(kind = %err.kind(), "request failed, not retryable");
                return Err(err);
            }

            if attempt >= self.policy.max_retries {
                warn!(
                    attempts = attempt + 1,
                    kind = %err.kind(),
                    "retries exhausted"
                );
                return Err(err);
            }

            let delay = self.policy.delay_for_attempt(attempt);
            attempt += 1;
            let cause = retry_cause(&err);
            info!(
                attempt,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                cause = cause.as_str(),
                "retrying request"
            );
            if !request.is_idempotent() {
                // TODO: make retries of POST/PATCH opt-in once the service
                // accepts idempotency keys.
                warn!("retrying a non-idempotent request; the server may apply it twice");
            }
            self.metrics.record_retry(cause, attempt);

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Network(classify::network_error(
                        TransportFailure::cancelled(request.method.clone(), request.url.as_str()),
                    )));
                }
                _ = sleep(delay) => {}
            }
        }
    }

    /// One attempt, with failure classification and optional measurement.
    async fn attempt(
        &self,
        request: &HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, Error> {
        let method = request.method.clone();
        let url = request.url.as_str();

        if cancel.is_cancelled() {
            return Err(Error::Network(classify::network_error(
                TransportFailure::cancelled(method, url),
            )));
        }

        let key = self
            .metrics
            .enabled()
            .then(|| self.correlation.begin(&method, url));

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportFailure::aborted(
                method.clone(),
                url,
                "in-flight request aborted by cancellation",
            )),
            result = self.transport.send(request) => result,
        };

        if let Some(key) = key {
            let elapsed = self.correlation.finish(&key).unwrap_or_default();
            let (status, bytes) = match &result {
                Ok(response) => (classify::normalize_status(response.status), response.body.len()),
                Err(_) => ("other".to_string(), 0),
            };
            self.metrics
                .record_request(method.as_str(), &status, elapsed, bytes);
        }

        match result {
            Ok(response) if response.is_success() => Ok(response),
            Ok(response) => Err(Error::Http(classify::http_error(&method, url, &response))),
            Err(failure) => Err(Error::Network(classify::network_error(failure))),
        }
    }
}
