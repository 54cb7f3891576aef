pub mod client;
pub mod trace;

pub use client::{TaskConsumer, TaskRef};
pub use trace::{TraceContext, TracePropagator, W3cPropagator};
