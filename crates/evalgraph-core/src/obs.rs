//! Structured observability hooks for evaluation lifecycle events.
//!
//! Spans and events are emitted through `tracing`; install a subscriber
//! (e.g. `tracing-subscriber` with an env filter) to see them.

use tracing::info;

/// Span covering one `evaluate` call, tagged with its evaluation id.
pub fn evaluation_span(eval_id: &str) -> tracing::Span {
    tracing::info_span!("evalgraph.evaluate", eval_id = %eval_id)
}

/// Emit event: an evaluation started for a set of root keys.
pub fn emit_evaluation_started(eval_id: &str, root_count: usize, keep_going: bool) {
    info!(
        event = "evaluation.started",
        eval_id = %eval_id,
        roots = root_count,
        keep_going = keep_going,
    );
}

/// Emit event: an evaluation finished with per-root outcome counts.
pub fn emit_evaluation_finished(
    eval_id: &str,
    value_count: usize,
    failure_count: usize,
    interrupted: bool,
) {
    info!(
        event = "evaluation.finished",
        eval_id = %eval_id,
        values = value_count,
        failures = failure_count,
        interrupted = interrupted,
    );
}
