//! Dependency-tracking environment handed to a node computation attempt.
//!
//! One environment is constructed per attempt and owned exclusively by it;
//! nothing in it is shared or mutated after the attempt concludes. A
//! request never blocks the computation: when a dependency is unavailable
//! the environment records it as missing and the function is expected to
//! abort cleanly by returning `Incomplete`.
//!
//! Keeping "ask for a value" separate from "fail if missing" lets a
//! function gather all of its outstanding dependencies in one pass, so the
//! scheduler can compute the whole missing set in parallel.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{EngineError, FailureKind, NodeFailure};
use crate::events::{EventRecord, EventSeverity};
use crate::graph::{EvalGraph, NodeState};
use crate::model::{NodeKey, NodeValue};

/// Per-attempt record handed back to the scheduler when the attempt
/// concludes.
pub(crate) struct AttemptRecord {
    /// Every key requested, in first-request order, deduplicated.
    pub(crate) deps: Vec<NodeKey>,
    /// Requested keys that were not available, in first-request order.
    pub(crate) missing: Vec<NodeKey>,
    /// Requested keys that had already failed with a kind this computation
    /// did not declare, with the originating error.
    pub(crate) opaque_failures: Vec<(NodeKey, EngineError)>,
    /// Diagnostics buffered by this attempt.
    pub(crate) events: Vec<EventRecord>,
}

/// Handle through which a node computation reads other nodes, reports
/// diagnostics, and observes cancellation.
pub struct Environment {
    graph: Arc<EvalGraph>,
    key: NodeKey,
    cancelled: Arc<AtomicBool>,
    deps: Vec<NodeKey>,
    seen: HashSet<NodeKey>,
    missing: Vec<NodeKey>,
    missing_set: HashSet<NodeKey>,
    opaque_failures: Vec<(NodeKey, EngineError)>,
    events: Vec<EventRecord>,
}

impl Environment {
    pub(crate) fn new(graph: Arc<EvalGraph>, key: NodeKey, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            graph,
            key,
            cancelled,
            deps: Vec::new(),
            seen: HashSet::new(),
            missing: Vec::new(),
            missing_set: HashSet::new(),
            opaque_failures: Vec::new(),
            events: Vec::new(),
        }
    }

    /// The key this attempt is computing.
    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    /// Request the value of another key.
    ///
    /// Returns `Some` if the dependency is already `Done` in this
    /// generation. Otherwise records it (missing, or opaquely failed) and
    /// returns `None`; the computation should finish gathering its requests
    /// and then return `Incomplete`.
    pub async fn request(&mut self, key: &NodeKey) -> Option<Arc<dyn NodeValue>> {
        self.record_dep(key);
        match self.graph.state_of(key).await {
            Some(NodeState::Done(value)) => Some(value),
            Some(NodeState::Failed(err)) => {
                self.record_opaque(key, err);
                None
            }
            Some(NodeState::Pending) | None => {
                self.record_missing(key);
                None
            }
        }
    }

    /// Request the value of another key, declaring which failure kinds of
    /// that dependency this computation knows how to interpret.
    ///
    /// If the dependency already failed with a recognized kind, that typed
    /// failure is returned as `Err` for the computation to handle. Any other
    /// failure stays opaque: the environment is marked as having missing
    /// values and the failure will surface through the scheduler instead.
    pub async fn request_or_fail(
        &mut self,
        key: &NodeKey,
        recognized: &[FailureKind],
    ) -> std::result::Result<Option<Arc<dyn NodeValue>>, NodeFailure> {
        self.record_dep(key);
        match self.graph.state_of(key).await {
            Some(NodeState::Done(value)) => Ok(Some(value)),
            Some(NodeState::Failed(err)) => {
                if let Some(failure) = err.origin_failure() {
                    if recognized.contains(&failure.kind) {
                        return Err(failure.clone());
                    }
                }
                self.record_opaque(key, err);
                Ok(None)
            }
            Some(NodeState::Pending) | None => {
                self.record_missing(key);
                Ok(None)
            }
        }
    }

    /// True once any request has resolved to "not yet available". A node
    /// function must check this before treating its computation as complete.
    pub fn has_missing_values(&self) -> bool {
        !self.missing.is_empty()
    }

    /// Buffer a diagnostic for replay once this key's computation concludes.
    pub fn emit(&mut self, severity: EventSeverity, message: impl Into<String>) {
        self.events
            .push(EventRecord::new(self.key.clone(), severity, message));
    }

    /// Cooperative cancellation flag; long-running computations should poll
    /// this and abort early. Any outcome produced after cancellation is
    /// discarded without committing.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn into_attempt(self) -> AttemptRecord {
        AttemptRecord {
            deps: self.deps,
            missing: self.missing,
            opaque_failures: self.opaque_failures,
            events: self.events,
        }
    }

    fn record_dep(&mut self, key: &NodeKey) {
        if self.seen.insert(key.clone()) {
            self.deps.push(key.clone());
        }
    }

    fn record_missing(&mut self, key: &NodeKey) {
        if self.missing_set.insert(key.clone()) {
            self.missing.push(key.clone());
        }
    }

    fn record_opaque(&mut self, key: &NodeKey, err: EngineError) {
        // An opaquely failed dependency also counts as missing: the attempt
        // must abort and the scheduler surfaces the originating failure.
        self.record_missing(key);
        self.opaque_failures.push((key.clone(), err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorTransience;

    fn env_for(graph: Arc<EvalGraph>) -> Environment {
        Environment::new(
            graph,
            NodeKey::of("consumer", "x"),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[tokio::test]
    async fn test_request_returns_done_value_and_records_edge() {
        let graph = Arc::new(EvalGraph::new());
        let dep = NodeKey::of("dep", "a");
        graph
            .inner
            .lock()
            .await
            .commit_value(&dep, Arc::new(42u64), Vec::new());

        let mut env = env_for(graph);
        let value = env.request(&dep).await.expect("value available");
        assert_eq!(*crate::model::downcast_value::<u64>(&value).unwrap(), 42);
        assert!(!env.has_missing_values());
        let attempt = env.into_attempt();
        assert_eq!(attempt.deps, vec![dep]);
        assert!(attempt.missing.is_empty());
    }

    #[tokio::test]
    async fn test_request_on_unrequested_dep_marks_missing() {
        let graph = Arc::new(EvalGraph::new());
        let dep = NodeKey::of("dep", "a");
        let mut env = env_for(graph);
        assert!(env.request(&dep).await.is_none());
        assert!(env.has_missing_values());
        let attempt = env.into_attempt();
        assert_eq!(attempt.missing, vec![dep]);
    }

    #[tokio::test]
    async fn test_request_or_fail_surfaces_recognized_kind() {
        let graph = Arc::new(EvalGraph::new());
        let dep = NodeKey::of("dep", "a");
        let failure = NodeFailure::new(
            FailureKind::new("file-not-found"),
            "no such file",
            ErrorTransience::Persistent,
        );
        graph.inner.lock().await.commit_failure(
            &dep,
            EngineError::NodeFailed {
                key: dep.clone(),
                failure: failure.clone(),
            },
        );

        let mut env = env_for(graph.clone());
        let err = env
            .request_or_fail(&dep, &[FailureKind::new("file-not-found")])
            .await
            .expect_err("recognized kind is surfaced");
        assert_eq!(err, failure);
        // A recognized failure is not a missing value; the computation may
        // recover and complete.
        assert!(!env.has_missing_values());

        // The same failure stays opaque when undeclared.
        let mut env = env_for(graph);
        let got = env.request_or_fail(&dep, &[]).await.expect("opaque");
        assert!(got.is_none());
        assert!(env.has_missing_values());
        assert_eq!(env.into_attempt().opaque_failures.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_requests_record_one_edge() {
        let graph = Arc::new(EvalGraph::new());
        let dep = NodeKey::of("dep", "a");
        let mut env = env_for(graph);
        env.request(&dep).await;
        env.request(&dep).await;
        let attempt = env.into_attempt();
        assert_eq!(attempt.deps.len(), 1);
        assert_eq!(attempt.missing.len(), 1);
    }

    #[tokio::test]
    async fn test_emit_buffers_in_fifo_order() {
        let graph = Arc::new(EvalGraph::new());
        let mut env = env_for(graph);
        env.emit(EventSeverity::Info, "first");
        env.emit(EventSeverity::Warning, "second");
        let events = env.into_attempt().events;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "first");
        assert_eq!(events[1].message, "second");
    }
}
