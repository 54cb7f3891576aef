//! Error taxonomy shared by the transport and the task consumer.
//!
//! Every failure the crate surfaces maps to exactly one [`ErrorKind`]. The
//! concrete error structs keep the original cause (`#[source]`) so the low-level
//! chain survives for diagnostics.

use std::fmt;

use reqwest::Method;
use serde::Deserialize;
use thiserror::Error;

use crate::state_machine::{TaskId, TaskStatus};

/// Boxed low-level cause kept on network errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Closed set of semantic error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NetworkConnectionRefused,
    NetworkTimeout,
    NetworkDnsFailure,
    NetworkHostUnreachable,
    NetworkTlsError,
    NetworkRequestCancelled,
    NetworkRequestAborted,
    NetworkUnknown,
    HttpBadRequest,
    HttpNotFound,
    HttpInternalError,
    HttpBadGateway,
    HttpServiceUnavailable,
    HttpGatewayTimeout,
    HttpUnexpectedStatus,
    /// A 2xx response whose body is not the expected record.
    HttpInvalidBody,
    ConsumerTraceContextError,
    ConsumerInvalidStateTransition,
    ConsumerRequestFailed,
    ConfigurationInvalidUrl,
    ConfigurationMissingRequiredField,
    ConfigurationInvalidTransport,
}

impl ErrorKind {
    /// Stable kebab-case code, suitable for logs and exit messages.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NetworkConnectionRefused => "network-connection-refused",
            ErrorKind::NetworkTimeout => "network-timeout",
            ErrorKind::NetworkDnsFailure => "network-dns-failure",
            ErrorKind::NetworkHostUnreachable => "network-host-unreachable",
            ErrorKind::NetworkTlsError => "network-tls-error",
            ErrorKind::NetworkRequestCancelled => "network-request-cancelled",
            ErrorKind::NetworkRequestAborted => "network-request-aborted",
            ErrorKind::NetworkUnknown => "network-unknown",
            ErrorKind::HttpBadRequest => "http-bad-request",
            ErrorKind::HttpNotFound => "http-not-found",
            ErrorKind::HttpInternalError => "http-internal-error",
            ErrorKind::HttpBadGateway => "http-bad-gateway",
            ErrorKind::HttpServiceUnavailable => "http-service-unavailable",
            ErrorKind::HttpGatewayTimeout => "http-gateway-timeout",
            ErrorKind::HttpUnexpectedStatus => "http-unexpected-status",
            ErrorKind::HttpInvalidBody => "http-invalid-body",
            ErrorKind::ConsumerTraceContextError => "consumer-trace-context-error",
            ErrorKind::ConsumerInvalidStateTransition => "consumer-invalid-state-transition",
            ErrorKind::ConsumerRequestFailed => "consumer-request-failed",
            ErrorKind::ConfigurationInvalidUrl => "configuration-invalid-url",
            ErrorKind::ConfigurationMissingRequiredField => {
                "configuration-missing-required-field"
            }
            ErrorKind::ConfigurationInvalidTransport => "configuration-invalid-transport",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection-level failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkErrorKind {
    ConnectionRefused,
    Timeout,
    DnsFailure,
    HostUnreachable,
    TlsError,
    RequestCancelled,
    RequestAborted,
    Unknown,
}

impl From<NetworkErrorKind> for ErrorKind {
    fn from(kind: NetworkErrorKind) -> Self {
        match kind {
            NetworkErrorKind::ConnectionRefused => ErrorKind::NetworkConnectionRefused,
            NetworkErrorKind::Timeout => ErrorKind::NetworkTimeout,
            NetworkErrorKind::DnsFailure => ErrorKind::NetworkDnsFailure,
            NetworkErrorKind::HostUnreachable => ErrorKind::NetworkHostUnreachable,
            NetworkErrorKind::TlsError => ErrorKind::NetworkTlsError,
            NetworkErrorKind::RequestCancelled => ErrorKind::NetworkRequestCancelled,
            NetworkErrorKind::RequestAborted => ErrorKind::NetworkRequestAborted,
            NetworkErrorKind::Unknown => ErrorKind::NetworkUnknown,
        }
    }
}

/// HTTP-level failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpErrorKind {
    BadRequest,
    NotFound,
    InternalError,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
    UnexpectedStatus,
    InvalidBody,
}

impl HttpErrorKind {
    /// 502/503/504: produced by proxies and load balancers rather than the
    /// service itself, so they are classified without reading the body.
    pub const fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            HttpErrorKind::BadGateway
                | HttpErrorKind::ServiceUnavailable
                | HttpErrorKind::GatewayTimeout
        )
    }
}

impl From<HttpErrorKind> for ErrorKind {
    fn from(kind: HttpErrorKind) -> Self {
        match kind {
            HttpErrorKind::BadRequest => ErrorKind::HttpBadRequest,
            HttpErrorKind::NotFound => ErrorKind::HttpNotFound,
            HttpErrorKind::InternalError => ErrorKind::HttpInternalError,
            HttpErrorKind::BadGateway => ErrorKind::HttpBadGateway,
            HttpErrorKind::ServiceUnavailable => ErrorKind::HttpServiceUnavailable,
            HttpErrorKind::GatewayTimeout => ErrorKind::HttpGatewayTimeout,
            HttpErrorKind::UnexpectedStatus => ErrorKind::HttpUnexpectedStatus,
            HttpErrorKind::InvalidBody => ErrorKind::HttpInvalidBody,
        }
    }
}

/// Low-level transport error codes, matched against the retryable `error_codes` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "connection-reset", alias = "ECONNRESET")]
    ConnectionReset,
    #[serde(rename = "connection-refused", alias = "ECONNREFUSED")]
    ConnectionRefused,
    #[serde(rename = "timeout", alias = "ETIMEDOUT")]
    Timeout,
    #[serde(rename = "dns-failure", alias = "ENOTFOUND")]
    DnsFailure,
    #[serde(rename = "temporary-dns-failure", alias = "EAI_AGAIN")]
    TemporaryDnsFailure,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            ErrorCode::ConnectionReset => "ECONNRESET",
            ErrorCode::ConnectionRefused => "ECONNREFUSED",
            ErrorCode::Timeout => "ETIMEDOUT",
            ErrorCode::DnsFailure => "ENOTFOUND",
            ErrorCode::TemporaryDnsFailure => "EAI_AGAIN",
        };
        f.write_str(code)
    }
}

/// A request that never produced an HTTP response.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct NetworkError {
    pub kind: NetworkErrorKind,
    pub code: Option<ErrorCode>,
    pub method: Method,
    pub url: String,
    pub message: String,
    #[source]
    pub source: Option<BoxError>,
}

/// The resource named by the URL of a 404 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingResource {
    /// Singular, capitalized collection name (`/tasks/abc` gives `Task`).
    pub resource_type: String,
    pub id: String,
}

/// A response with a non-success status (or an undecodable success body).
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HttpError {
    pub kind: HttpErrorKind,
    pub status: u16,
    pub method: Method,
    pub url: String,
    pub message: String,
    /// Service-specific error code from the response body, when present.
    pub code: Option<String>,
    pub resource: Option<MissingResource>,
}

/// Which consumer operation a wrapped failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Dequeue,
    FetchTask,
    UpdateStatus,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Dequeue => write!(f, "dequeue"),
            Operation::FetchTask => write!(f, "fetch task"),
            Operation::UpdateStatus => write!(f, "status update"),
        }
    }
}

/// Failures raised by the task lifecycle client.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// The trace carrier on a task could not be parsed. Never fatal.
    #[error("invalid trace context on task {task_id}: {reason}")]
    TraceContext { task_id: TaskId, reason: String },

    /// Rejected locally, before any mutating request was sent.
    #[error("invalid state transition for task {task_id}: status is {found}, expected {expected}")]
    InvalidStateTransition {
        task_id: TaskId,
        found: TaskStatus,
        expected: TaskStatus,
    },

    #[error("{operation} failed: {source}")]
    RequestFailed {
        operation: Operation,
        #[source]
        source: Box<Error>,
    },
}

impl ConsumerError {
    pub(crate) fn request_failed(operation: Operation, source: Error) -> Self {
        ConsumerError::RequestFailed {
            operation,
            source: Box::new(source),
        }
    }
}

/// Invalid client configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid URL '{value}': {reason}")]
    InvalidUrl { value: String, reason: String },

    #[error("missing required configuration field: {0}")]
    MissingField(&'static str),

    #[error("failed to build HTTP transport: {0}")]
    Transport(#[source] reqwest::Error),
}

/// Top-level error returned by every public operation.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Consumer(#[from] ConsumerError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// The semantic kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Network(e) => e.kind.into(),
            Error::Http(e) => e.kind.into(),
            Error::Consumer(ConsumerError::TraceContext { .. }) => {
                ErrorKind::ConsumerTraceContextError
            }
            Error::Consumer(ConsumerError::InvalidStateTransition { .. }) => {
                ErrorKind::ConsumerInvalidStateTransition
            }
            Error::Consumer(ConsumerError::RequestFailed { .. }) => {
                ErrorKind::ConsumerRequestFailed
            }
            Error::Config(ConfigError::InvalidUrl { .. }) => ErrorKind::ConfigurationInvalidUrl,
            Error::Config(ConfigError::MissingField(_)) => {
                ErrorKind::ConfigurationMissingRequiredField
            }
            Error::Config(ConfigError::Transport(_)) => ErrorKind::ConfigurationInvalidTransport,
        }
    }

    /// The classified cause: for wrapped request failures this is the kind of
    /// the underlying transport or HTTP error, otherwise the same as [`kind`](Self::kind).
    pub fn cause_kind(&self) -> ErrorKind {
        match self {
            Error::Consumer(ConsumerError::RequestFailed { source, .. }) => source.cause_kind(),
            other => other.kind(),
        }
    }

    /// HTTP status of the response behind this error, if there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Http(e) => Some(e.status),
            Error::Consumer(ConsumerError::RequestFailed { source, .. }) => source.status(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_error(kind: HttpErrorKind, status: u16) -> HttpError {
        HttpError {
            kind,
            status,
            method: Method::GET,
            url: "http://host/tasks/t-1".into(),
            message: format!("HTTP {status} error for GET http://host/tasks/t-1"),
            code: None,
            resource: None,
        }
    }

    #[test]
    fn kind_codes_are_kebab_case() {
        assert_eq!(
            ErrorKind::NetworkConnectionRefused.to_string(),
            "network-connection-refused"
        );
        assert_eq!(
            ErrorKind::ConsumerInvalidStateTransition.as_str(),
            "consumer-invalid-state-transition"
        );
        assert_eq!(
            ErrorKind::ConfigurationMissingRequiredField.as_str(),
            "configuration-missing-required-field"
        );
    }

    #[test]
    fn request_failed_exposes_classified_cause() {
        let inner = Error::Http(http_error(HttpErrorKind::ServiceUnavailable, 503));
        let err: Error = ConsumerError::request_failed(Operation::Dequeue, inner).into();

        assert_eq!(err.kind(), ErrorKind::ConsumerRequestFailed);
        assert_eq!(err.cause_kind(), ErrorKind::HttpServiceUnavailable);
        assert_eq!(err.status(), Some(503));
        assert!(err.to_string().starts_with("dequeue failed: HTTP 503"));
    }

    #[test]
    fn invalid_transition_display() {
        let err = ConsumerError::InvalidStateTransition {
            task_id: TaskId::new("t-9"),
            found: TaskStatus::Failed,
            expected: TaskStatus::InProgress,
        };
        assert_eq!(
            err.to_string(),
            "invalid state transition for task t-9: status is FAILED, expected IN_PROGRESS"
        );
    }

    #[test]
    fn error_code_accepts_posix_aliases() {
        let codes: Vec<ErrorCode> =
            serde_json::from_str(r#"["ECONNRESET", "timeout", "EAI_AGAIN"]"#).unwrap();
        assert_eq!(
            codes,
            vec![
                ErrorCode::ConnectionReset,
                ErrorCode::Timeout,
                ErrorCode::TemporaryDnsFailure
            ]
        );
    }

    #[test]
    fn infrastructure_statuses() {
        assert!(HttpErrorKind::BadGateway.is_infrastructure());
        assert!(HttpErrorKind::GatewayTimeout.is_infrastructure());
        assert!(!HttpErrorKind::InternalError.is_infrastructure());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }
}
