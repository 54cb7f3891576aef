//! Client for a remote job-processing service.
//!
//! Workers use [`TaskConsumer`] to dequeue tasks of a stage type and to report
//! them COMPLETED or FAILED. Every request goes through a retrying
//! [`Dispatcher`](transport::Dispatcher), and every failure is classified into
//! an [`ErrorKind`].
//!
//! ```no_run
//! # async fn run() -> Result<(), taskq::Error> {
//! use taskq::{ClientConfig, StageType, TaskConsumer};
//!
//! let config = ClientConfig {
//!     base_url: Some("http://queue.local/api/".into()),
//!     ..ClientConfig::default()
//! };
//! let consumer = TaskConsumer::from_config(&config)?;
//!
//! if let Some(task) = consumer.dequeue(&StageType::new("render")).await? {
//!     // ... do the work ...
//!     consumer.mark_completed(&task).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod consumer;
pub mod error;
pub mod events;
pub mod logging;
pub mod metrics;
pub mod state_machine;
pub mod transport;
pub mod ui;

pub use config::ClientConfig;
pub use consumer::{TaskConsumer, TaskRef, TraceContext, TracePropagator, W3cPropagator};
pub use error::{
    ConfigError, ConsumerError, Error, ErrorCode, ErrorKind, HttpError, HttpErrorKind,
    NetworkError, NetworkErrorKind,
};
pub use events::{EventBus, TaskEvent};
pub use crate::metrics::{FacadeMetrics, MetricsRecorder, NoopMetrics};
pub use state_machine::{JobId, StageId, StageType, Task, TaskId, TaskStatus, TraceCarrier};
pub use transport::{Dispatcher, ReqwestTransport, RetryPolicy, Transport};
