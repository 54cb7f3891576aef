pub mod classify;
pub mod client;
pub mod retry;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use classify::{RetryCause, normalize_status, retry_cause};
pub use client::{ConnectionOptions, ReqwestTransport, Transport};
pub use retry::{Dispatcher, RetryPolicy};
pub use types::{HttpRequest, HttpResponse, Interruption, TransportFailure};
