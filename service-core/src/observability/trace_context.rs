//! W3C Trace Context propagation for outbound collaborator calls.
//!
//! See: https://www.w3.org/TR/trace-context/

use opentelemetry::trace::TraceContextExt;
use reqwest::header::HeaderMap;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

pub const TRACEPARENT_HEADER: &str = "traceparent";

pub const TRACESTATE_HEADER: &str = "tracestate";

/// Inject the current span's context as `traceparent`/`tracestate` headers.
///
/// Does nothing when no OpenTelemetry layer is installed.
pub fn inject_trace_context(headers: &mut HeaderMap) {
    let span = Span::current();
    let context = span.context();
    let otel_span = context.span();
    let span_context = otel_span.span_context();

    if span_context.is_valid() {
        // version-trace_id-span_id-trace_flags
        let traceparent = format!(
            "00-{}-{}-{:02x}",
            span_context.trace_id(),
            span_context.span_id(),
            span_context.trace_flags().to_u8()
        );

        if let Ok(value) = traceparent.parse() {
            headers.insert(TRACEPARENT_HEADER, value);
        }

        let tracestate = span_context.trace_state().header();
        if !tracestate.is_empty()
            && let Ok(value) = tracestate.parse()
        {
            headers.insert(TRACESTATE_HEADER, value);
        }
    }
}

/// Extension for `reqwest::RequestBuilder` that attaches trace headers.
pub trait TracedClientExt {
    fn with_trace_context(self) -> Self;
}

impl TracedClientExt for reqwest::RequestBuilder {
    fn with_trace_context(self) -> Self {
        let mut headers = HeaderMap::new();
        inject_trace_context(&mut headers);
        self.headers(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_headers_without_active_otel_span() {
        let mut headers = HeaderMap::new();
        inject_trace_context(&mut headers);
        assert!(headers.get(TRACEPARENT_HEADER).is_none());
    }
}
