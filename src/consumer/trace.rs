//! Bridge between task trace carriers and the consumer's spans.
//!
//! Producers embed a W3C `traceparent` in each task. The consumer extracts it
//! to link its own spans to the producer's trace; it never fails an operation
//! because the carrier is missing or malformed.

use std::fmt;

use crate::state_machine::TraceCarrier;

pub const TRACEPARENT: &str = "traceparent";
pub const TRACESTATE: &str = "tracestate";

/// Span context recovered from a carrier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceContext {
    /// 32 lowercase hex chars; empty for the default context.
    pub trace_id: String,
    /// 16 lowercase hex chars; empty for the default context.
    pub span_id: String,
    pub sampled: bool,
    pub trace_state: Option<String>,
}

impl TraceContext {
    /// True for the default, empty context.
    pub fn is_empty(&self) -> bool {
        self.trace_id.is_empty() && self.span_id.is_empty()
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "<empty>");
        }
        let flags = if self.sampled { "01" } else { "00" };
        write!(f, "00-{}-{}-{flags}", self.trace_id, self.span_id)
    }
}

/// Reads and writes trace context on task carriers.
pub trait TracePropagator: Send + Sync + fmt::Debug {
    /// `Ok(None)` when the carrier holds no context, `Err(reason)` when it
    /// holds one that cannot be parsed.
    fn extract(&self, carrier: &TraceCarrier) -> Result<Option<TraceContext>, String>;

    fn inject(&self, context: &TraceContext, carrier: &mut TraceCarrier);
}

/// W3C Trace Context (`traceparent` / `tracestate`).
#[derive(Debug, Default, Clone, Copy)]
pub struct W3cPropagator;

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl TracePropagator for W3cPropagator {
    fn extract(&self, carrier: &TraceCarrier) -> Result<Option<TraceContext>, String> {
        let Some(header) = carrier.get(TRACEPARENT) else {
            return Ok(None);
        };

        let parts: Vec<&str> = header.trim().split('-').collect();
        let [version, trace_id, span_id, flags] = parts.as_slice() else {
            return Err(format!("traceparent '{header}' must have four fields"));
        };
        if !is_lower_hex(version, 2) || *version == "ff" {
            return Err(format!("unsupported traceparent version '{version}'"));
        }
        if !is_lower_hex(trace_id, 32) || trace_id.bytes().all(|b| b == b'0') {
            return Err(format!("invalid trace id '{trace_id}'"));
        }
        if !is_lower_hex(span_id, 16) || span_id.bytes().all(|b| b == b'0') {
            return Err(format!("invalid span id '{span_id}'"));
        }
        let flags = Some(*flags)
            .filter(|f| is_lower_hex(f, 2))
            .and_then(|f| u8::from_str_radix(f, 16).ok())
            .ok_or_else(|| format!("invalid trace flags '{flags}'"))?;

        Ok(Some(TraceContext {
            trace_id: (*trace_id).to_string(),
            span_id: (*span_id).to_string(),
            sampled: flags & 0x01 == 0x01,
            trace_state: carrier.get(TRACESTATE).cloned(),
        }))
    }

    fn inject(&self, context: &TraceContext, carrier: &mut TraceCarrier) {
        if context.is_empty() {
            return;
        }
        carrier.insert(TRACEPARENT.to_string(), context.to_string());
        if let Some(state) = &context.trace_state {
            carrier.insert(TRACESTATE.to_string(), state.clone());
        }
    }
}
