use tracing::{Span, field};

use super::TraceId;

/// Span covering one whole run (a simulation, a batch).
pub fn root_span(name: &'static str, trace_id: &TraceId) -> Span {
    tracing::info_span!(
        "root",
        name = %name,
        trace_id = %trace_id,
        seed = field::Empty
    )
}

/// Nested span; picks up the trace id from its parent.
pub fn child_span(name: &'static str) -> Span {
    tracing::info_span!("child", name = %name)
}
