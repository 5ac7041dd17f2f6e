//! Trace-context extraction for request events.
//!
//! Accepts the W3C `traceparent` form (`00-<32hex>-<16hex>-<2hex>`) and the
//! `sentry-trace` form (`<32hex>-<16hex>[-<flag>]`).

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

impl TraceContext {
    /// First match wins: `traceparent`, then `sentry-trace`.
    pub fn from_headers(traceparent: Option<&str>, sentry_trace: Option<&str>) -> Self {
        traceparent
            .and_then(parse_traceparent)
            .or_else(|| sentry_trace.and_then(parse_sentry_trace))
            .unwrap_or_default()
    }
}

pub fn parse_traceparent(value: &str) -> Option<TraceContext> {
    let mut parts = value.trim().split('-');
    let version = parts.next()?;
    let trace_id = parts.next()?;
    let span_id = parts.next()?;
    let flags = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    if version.len() != 2 || !is_hex(version) {
        return None;
    }
    if trace_id.len() != 32 || !is_hex(trace_id) || span_id.len() != 16 || !is_hex(span_id) {
        return None;
    }
    if flags.len() != 2 || !is_hex(flags) {
        return None;
    }
    Some(TraceContext {
        trace_id: Some(trace_id.to_string()),
        span_id: Some(span_id.to_string()),
    })
}

pub fn parse_sentry_trace(value: &str) -> Option<TraceContext> {
    let mut parts = value.trim().split('-');
    let trace_id = parts.next()?;
    if trace_id.len() != 32 || !is_hex(trace_id) {
        return None;
    }
    let span_id = match parts.next() {
        Some(s) if s.len() == 16 && is_hex(s) => Some(s.to_string()),
        Some(_) => return None,
        None => None,
    };
    Some(TraceContext {
        trace_id: Some(trace_id.to_string()),
        span_id,
    })
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}
