//! In-memory transport for dispatcher and consumer tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use reqwest::Method;

use super::client::Transport;
use super::types::{HttpRequest, HttpResponse, TransportFailure};

/// Replays a fixed list of outcomes, one per call.
pub(crate) struct ScriptedTransport {
    outcomes: Mutex<VecDeque<Result<HttpResponse, TransportFailure>>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub(crate) fn new(outcomes: Vec<Result<HttpResponse, TransportFailure>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transport for ScriptedTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.outcomes.lock().unwrap().pop_front();
        next.unwrap_or_else(|| {
            Err(TransportFailure::new(request.method.clone(), request.url.as_str())
                .with_cause("script exhausted"))
        })
    }
}

/// A connection-refused failure as reqwest would report it.
pub(crate) fn refused(url: &str) -> TransportFailure {
    TransportFailure::new(Method::GET, url)
        .with_cause("tcp connect error")
        .with_cause("Connection refused (os error 111)")
}
