//! Optional instrumentation.
//!
//! The client talks to a [`MetricsRecorder`] chosen at construction time.
//! [`NoopMetrics`] is the default and turns every call into nothing.
//! [`FacadeMetrics`] forwards measurements to the `metrics` facade, where the
//! application's installed recorder (Prometheus, StatsD, ...) picks them up.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use reqwest::Method;
use ::metrics::{counter, histogram};

use crate::state_machine::{StageType, TaskStatus};
use crate::transport::RetryCause;

/// Result of a dequeue call, as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueOutcome {
    Task,
    Empty,
    Error,
}

impl DequeueOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DequeueOutcome::Task => "task",
            DequeueOutcome::Empty => "empty",
            DequeueOutcome::Error => "error",
        }
    }
}

/// Sink for client measurements. Every method defaults to doing nothing.
pub trait MetricsRecorder: Send + Sync + fmt::Debug {
    /// When false the dispatcher skips per-request timing altogether.
    fn enabled(&self) -> bool {
        true
    }

    /// One finished attempt. `status` is already normalized (see
    /// [`normalize_status`](crate::transport::normalize_status)).
    fn record_request(&self, _method: &str, _status: &str, _duration: Duration, _bytes: usize) {}

    fn record_retry(&self, _cause: RetryCause, _attempt: u32) {}

    fn record_dequeue(&self, _stage_type: &StageType, _outcome: DequeueOutcome) {}

    fn record_transition(&self, _status: TaskStatus) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn enabled(&self) -> bool {
        false
    }
}

/// Records through the `metrics` facade.
///
/// Emitted series:
/// - `taskq.requests` counter and `taskq.request.duration_seconds` histogram,
///   labelled `method` and `status`
/// - `taskq.response.bytes` histogram, labelled `method`
/// - `taskq.retries` counter, labelled `cause`
/// - `taskq.dequeues` counter, labelled `stage_type` and `outcome`
/// - `taskq.transitions` counter, labelled `status`
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeMetrics;

impl MetricsRecorder for FacadeMetrics {
    fn record_request(&self, method: &str, status: &str, duration: Duration, bytes: usize) {
        counter!("taskq.requests", "method" => method.to_string(), "status" => status.to_string())
            .increment(1);
        histogram!(
            "taskq.request.duration_seconds",
            "method" => method.to_string(),
            "status" => status.to_string()
        )
        .record(duration.as_secs_f64());
        histogram!("taskq.response.bytes", "method" => method.to_string()).record(bytes as f64);
    }

    fn record_retry(&self, cause: RetryCause, _attempt: u32) {
        counter!("taskq.retries", "cause" => cause.as_str()).increment(1);
    }

    fn record_dequeue(&self, stage_type: &StageType, outcome: DequeueOutcome) {
        counter!(
            "taskq.dequeues",
            "stage_type" => stage_type.as_str().to_string(),
            "outcome" => outcome.as_str()
        )
        .increment(1);
    }

    fn record_transition(&self, status: TaskStatus) {
        counter!("taskq.transitions", "status" => status.as_str()).increment(1);
    }
}

/// Start times of in-flight requests, keyed per logical request.
///
/// Keys are `"<METHOD> <url> <unix-nanos>"`; identical concurrent requests
/// get distinct keys because the timestamp is bumped until the slot is free.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    inner: Mutex<HashMap<String, Instant>>,
}

impl CorrelationTable {
    pub fn begin(&self, method: &Method, url: &str) -> String {
        let mut nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let key = format!("{method} {url} {nanos}");
            match inner.entry(key) {
                Entry::Vacant(slot) => {
                    let key = slot.key().clone();
                    slot.insert(Instant::now());
                    return key;
                }
                Entry::Occupied(_) => nanos += 1,
            }
        }
    }

    /// Removes the entry and returns how long ago it began.
    pub fn finish(&self, key: &str) -> Option<Duration> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .map(|started| started.elapsed())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
