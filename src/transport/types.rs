//! Request, response and failure values exchanged with a [`Transport`](super::Transport).
//!
//! Requests are plain data so the dispatcher can resend the very same value on
//! every attempt. Responses carry the already-read body bytes.

use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::BoxError;

/// One logical HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    /// JSON body, if any.
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            body: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Attaches an already-built JSON body.
    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Whether repeating this request may duplicate a side effect on the server.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self.method, Method::POST | Method::PATCH)
    }
}

/// A received response with its body fully read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Why a request stopped before completing, when it was stopped on purpose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interruption {
    /// Cancelled before the request went out (or while waiting to retry).
    Cancelled,
    /// Torn down while in flight; carries the abort cause.
    Aborted(String),
}

/// A request that produced no HTTP response.
///
/// The cause chain is flattened to strings for classification; the original
/// error is kept as `source` for diagnostics.
#[derive(Debug)]
pub struct TransportFailure {
    pub method: Method,
    pub url: String,
    chain: Vec<String>,
    timed_out: bool,
    interruption: Option<Interruption>,
    source: Option<BoxError>,
}

impl TransportFailure {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            chain: Vec::new(),
            timed_out: false,
            interruption: None,
            source: None,
        }
    }

    /// Appends one link to the cause chain (outermost first).
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.chain.push(cause.into());
        self
    }

    pub fn with_timeout(mut self) -> Self {
        self.timed_out = true;
        self
    }

    pub fn cancelled(method: Method, url: impl Into<String>) -> Self {
        let mut failure = Self::new(method, url);
        failure.interruption = Some(Interruption::Cancelled);
        failure
    }

    pub fn aborted(method: Method, url: impl Into<String>, cause: impl Into<String>) -> Self {
        let cause = cause.into();
        let mut failure = Self::new(method, url).with_cause(cause.clone());
        failure.interruption = Some(Interruption::Aborted(cause));
        failure
    }

    /// Captures a reqwest error together with every `source()` below it.
    ///
    /// The URL is stripped from the error first; it is kept in `url` and must
    /// not leak into the chain that classification reads.
    pub fn from_reqwest(method: Method, url: impl Into<String>, err: reqwest::Error) -> Self {
        let mut failure = Self::new(method, url);
        failure.timed_out = err.is_timeout();
        let err = err.without_url();

        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(&err);
        while let Some(e) = current {
            failure.chain.push(e.to_string());
            current = e.source();
        }

        failure.source = Some(Box::new(err));
        failure
    }

    pub fn chain(&self) -> &[String] {
        &self.chain
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn interruption(&self) -> Option<&Interruption> {
        self.interruption.as_ref()
    }

    pub(crate) fn into_source(self) -> Option<BoxError> {
        self.source
    }
}
