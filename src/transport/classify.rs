//! Deterministic classification of failed requests.
//!
//! Connection failures are recognised by substrings and POSIX codes found in
//! the cause chain, with any request URL scrubbed out first. HTTP failures are keyed on the status code; application
//! errors (4xx/5xx other than 502/503/504) additionally read the body for the
//! service's `{message, code}` payload.
//!
//! Everything here is a pure function of its input.

use reqwest::{Method, Url};
use serde::Deserialize;

use super::types::{HttpResponse, Interruption, TransportFailure};
use crate::error::{
    ConsumerError, Error, ErrorCode, HttpError, HttpErrorKind, MissingResource, NetworkError,
    NetworkErrorKind,
};

/// Raw bodies longer than this are cut before going into a message.
const MAX_RAW_BODY_CHARS: usize = 200;

const REFUSED: &[&str] = &["econnrefused", "connection refused"];
const DNS: &[&str] = &[
    "enotfound",
    "eai_again",
    "dns error",
    "failed to lookup address",
    "name or service not known",
    "no such host",
    "temporary failure in name resolution",
];
const TIMEOUT: &[&str] = &["etimedout", "timeout", "timed out"];
const UNREACHABLE: &[&str] = &[
    "ehostunreach",
    "enetunreach",
    "host unreachable",
    "no route to host",
    "network is unreachable",
];
const TLS: &[&str] = &["certificate", "tls", "ssl", "handshake"];
const RESET: &[&str] = &["econnreset", "connection reset"];
const TEMPORARY_DNS: &[&str] = &["eai_again", "temporary failure in name resolution"];

/// Lowercased cause chain with the request URL removed, so path segments
/// such as `timeout-jobs` never take part in matching.
fn chain_text(failure: &TransportFailure) -> String {
    let url = failure.url.to_lowercase();
    failure
        .chain()
        .iter()
        .map(|link| scrub_url(&link.to_lowercase(), &url))
        .collect::<Vec<_>>()
        .join(": ")
}

/// Drops `url` and any `url (...)` fragment reqwest puts in its messages.
fn scrub_url(link: &str, url: &str) -> String {
    let mut text = if url.is_empty() {
        link.to_string()
    } else {
        link.replace(url, "")
    };
    while let Some(start) = text.find("url (") {
        let end = text[start..]
            .find(')')
            .map_or(text.len(), |offset| start + offset + 1);
        text.replace_range(start..end, "");
    }
    text
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Semantic kind of a connection-level failure.
pub fn classify_failure(failure: &TransportFailure) -> NetworkErrorKind {
    match failure.interruption() {
        Some(Interruption::Aborted(_)) => return NetworkErrorKind::RequestAborted,
        Some(Interruption::Cancelled) => return NetworkErrorKind::RequestCancelled,
        None => {}
    }

    let text = chain_text(failure);
    if contains_any(&text, REFUSED) {
        NetworkErrorKind::ConnectionRefused
    } else if contains_any(&text, DNS) {
        NetworkErrorKind::DnsFailure
    } else if failure.timed_out() || contains_any(&text, TIMEOUT) {
        NetworkErrorKind::Timeout
    } else if contains_any(&text, UNREACHABLE) {
        NetworkErrorKind::HostUnreachable
    } else if contains_any(&text, TLS) {
        NetworkErrorKind::TlsError
    } else {
        NetworkErrorKind::Unknown
    }
}

/// Low-level code of a connection failure, matched against the retryable set.
pub fn error_code(failure: &TransportFailure) -> Option<ErrorCode> {
    let text = chain_text(failure);
    if contains_any(&text, RESET) {
        return Some(ErrorCode::ConnectionReset);
    }
    match classify_failure(failure) {
        NetworkErrorKind::ConnectionRefused => Some(ErrorCode::ConnectionRefused),
        NetworkErrorKind::Timeout => Some(ErrorCode::Timeout),
        NetworkErrorKind::DnsFailure if contains_any(&text, TEMPORARY_DNS) => {
            Some(ErrorCode::TemporaryDnsFailure)
        }
        NetworkErrorKind::DnsFailure => Some(ErrorCode::DnsFailure),
        _ => None,
    }
}

/// Converts a transport failure into a [`NetworkError`], keeping its source.
pub fn network_error(failure: TransportFailure) -> NetworkError {
    let kind = classify_failure(&failure);
    let code = error_code(&failure);
    let url = failure.url.clone();
    let method = failure.method.clone();

    let message = match kind {
        NetworkErrorKind::ConnectionRefused => {
            format!("Failed to connect to {url}: Connection refused")
        }
        NetworkErrorKind::Timeout => format!("Request to {url} timed out"),
        NetworkErrorKind::DnsFailure => {
            format!("Failed to resolve host for {url}: DNS lookup failed")
        }
        NetworkErrorKind::HostUnreachable => format!("Failed to connect to {url}: Host unreachable"),
        NetworkErrorKind::TlsError => format!("TLS error while connecting to {url}"),
        NetworkErrorKind::RequestCancelled => format!("Request to {url} was cancelled"),
        NetworkErrorKind::RequestAborted => match failure.interruption() {
            Some(Interruption::Aborted(cause)) => format!("Request to {url} was aborted: {cause}"),
            _ => format!("Request to {url} was aborted"),
        },
        NetworkErrorKind::Unknown => {
            let detail = failure
                .chain()
                .last()
                .map(String::as_str)
                .unwrap_or("unknown error");
            format!("Network error for {method} {url}: {detail}")
        }
    };

    NetworkError {
        kind,
        code,
        method,
        url,
        message,
        source: failure.into_source(),
    }
}

/// Semantic kind of a non-success status code.
pub fn classify_status(status: u16) -> HttpErrorKind {
    match status {
        400 => HttpErrorKind::BadRequest,
        404 => HttpErrorKind::NotFound,
        500 => HttpErrorKind::InternalError,
        502 => HttpErrorKind::BadGateway,
        503 => HttpErrorKind::ServiceUnavailable,
        504 => HttpErrorKind::GatewayTimeout,
        401..=499 => HttpErrorKind::BadRequest,
        501..=599 => HttpErrorKind::InternalError,
        _ => HttpErrorKind::UnexpectedStatus,
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<serde_json::Value>,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

/// What the error body contributed to the message.
#[derive(Debug, Default, PartialEq, Eq)]
struct BodyDetail {
    message: Option<String>,
    code: Option<String>,
    raw: Option<String>,
}

fn body_detail(body: &[u8]) -> BodyDetail {
    if body.iter().all(u8::is_ascii_whitespace) {
        return BodyDetail::default();
    }
    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(parsed) => BodyDetail {
            message: parsed.message.and_then(|m| m.as_str().map(str::to_string)),
            code: parsed.code.and_then(|c| c.as_str().map(str::to_string)),
            raw: None,
        },
        Err(_) if serde_json::from_slice::<serde_json::Value>(body).is_ok() => {
            BodyDetail::default()
        }
        Err(_) => BodyDetail {
            raw: Some(truncate(&String::from_utf8_lossy(body))),
            ..BodyDetail::default()
        },
    }
}

fn truncate(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() > MAX_RAW_BODY_CHARS {
        let cut: String = trimmed.chars().take(MAX_RAW_BODY_CHARS).collect();
        format!("{cut}...")
    } else {
        trimmed.to_string()
    }
}

fn singular(segment: &str) -> String {
    if let Some(stem) = segment.strip_suffix("ies") {
        format!("{stem}y")
    } else if let Some(stem) = segment.strip_suffix('s') {
        stem.to_string()
    } else {
        segment.to_string()
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Resource type and id from the last two non-empty path segments.
pub fn missing_resource(url: &str) -> Option<MissingResource> {
    let parsed = Url::parse(url).ok()?;
    let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        [.., collection, id] => Some(MissingResource {
            resource_type: capitalize(&singular(collection)),
            id: (*id).to_string(),
        }),
        _ => None,
    }
}

/// Converts a non-success response into an [`HttpError`].
pub fn http_error(method: &Method, url: &str, response: &HttpResponse) -> HttpError {
    let status = response.status;
    let kind = classify_status(status);
    let generic = format!("HTTP {status} error for {method} {url}");

    let (message, code) = match kind {
        HttpErrorKind::BadGateway => (
            format!("Bad gateway for {method} {url}: upstream unavailable, retry later"),
            None,
        ),
        HttpErrorKind::ServiceUnavailable => (
            format!("Service unavailable for {method} {url}: retry later"),
            None,
        ),
        HttpErrorKind::GatewayTimeout => (
            format!("Gateway timeout for {method} {url}: retry later"),
            None,
        ),
        HttpErrorKind::UnexpectedStatus | HttpErrorKind::InvalidBody => (
            format!("Unexpected HTTP status {status} for {method} {url}"),
            None,
        ),
        _ => {
            let detail = body_detail(&response.body);
            let message = match (detail.message, detail.raw) {
                (Some(message), _) => message,
                (None, Some(raw)) => format!("{generic}: {raw}"),
                (None, None) => generic,
            };
            (message, detail.code)
        }
    };

    let resource = match kind {
        HttpErrorKind::NotFound => missing_resource(url),
        _ => None,
    };

    HttpError {
        kind,
        status,
        method: method.clone(),
        url: url.to_string(),
        message,
        code,
        resource,
    }
}

/// A 2xx whose body did not decode into the expected record.
pub fn invalid_body(method: &Method, url: &str, status: u16, err: &serde_json::Error) -> HttpError {
    HttpError {
        kind: HttpErrorKind::InvalidBody,
        status,
        method: method.clone(),
        url: url.to_string(),
        message: format!("Invalid response body for {method} {url}: {err}"),
        code: None,
        resource: None,
    }
}

/// Coarse cause bucket used as a metrics label for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryCause {
    StatusCode,
    Timeout,
    NetworkError,
}

impl RetryCause {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RetryCause::StatusCode => "status_code",
            RetryCause::Timeout => "timeout",
            RetryCause::NetworkError => "network_error",
        }
    }
}

/// Buckets a failed attempt for the retry metrics label.
///
/// Only the classification is read. The URL and the service's message never
/// influence the bucket, so a 504 is a status code and a refused
/// `PUT .../status` is a network error.
pub fn retry_cause(err: &Error) -> RetryCause {
    match err {
        Error::Http(_) => RetryCause::StatusCode,
        Error::Network(e)
            if e.kind == NetworkErrorKind::Timeout || e.code == Some(ErrorCode::Timeout) =>
        {
            RetryCause::Timeout
        }
        Error::Consumer(ConsumerError::RequestFailed { source, .. }) => retry_cause(source),
        _ => RetryCause::NetworkError,
    }
}

/// Collapses a status code into a bounded label set.
pub fn normalize_status(status: u16) -> String {
    match status {
        200 | 201 | 204 | 404 | 500 | 502 | 503 | 504 => status.to_string(),
        200..=299 => "2xx".to_string(),
        300..=399 => "3xx".to_string(),
        400..=499 => "4xx".to_string(),
        500..=599 => "5xx".to_string(),
        _ => "other".to_string(),
    }
}
