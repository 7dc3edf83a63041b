//! Evaluator: schedules node computations, drives the restart protocol,
//! detects cycles, classifies failures, and assembles per-root results.
//!
//! Each key is claimed by exactly one driver task; concurrent requesters
//! subscribe to the key's cell and wait, so a node function executes at most
//! once concurrently per key. A driver re-invokes its function from scratch
//! ("restart") whenever an attempt returns `Incomplete`, after scheduling
//! and waiting for the missing dependencies. Independent subgraphs run in
//! parallel on spawned tasks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

use crate::env::{AttemptRecord, Environment};
use crate::error::EngineError;
use crate::events::{EventRecord, EventSink, TracingSink};
use crate::graph::{EvalGraph, NodeCell, NodeState};
use crate::model::{NodeKey, NodeValue};
use crate::obs;
use crate::registry::{NodeFunctionRegistry, NodeOutcome};

/// Tunables for one evaluator instance.
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Upper bound on attempts for a single key before its computation is
    /// declared non-stabilizing. Restarting is normal; a key that restarts
    /// this many times is treated as a contract violation, not a loop.
    pub max_restarts_per_key: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            max_restarts_per_key: 1000,
        }
    }
}

/// Outcome of [`Evaluator::evaluate`] for one set of root keys.
#[derive(Debug)]
pub struct EvaluationResult {
    /// Committed values, per root key that resolved successfully.
    pub values: HashMap<NodeKey, Arc<dyn NodeValue>>,
    /// Classified failures, per root key that did not.
    pub failures: HashMap<NodeKey, EngineError>,
    /// True when the evaluation was cancelled before completing.
    pub interrupted: bool,
    /// True iff every root resolved to a value and nothing was interrupted.
    pub success: bool,
}

impl EvaluationResult {
    pub fn value(&self, key: &NodeKey) -> Option<&Arc<dyn NodeValue>> {
        self.values.get(key)
    }

    pub fn failure(&self, key: &NodeKey) -> Option<&EngineError> {
        self.failures.get(key)
    }
}

/// Demand-driven evaluator over one generation of the graph.
///
/// One instance is one evaluation generation: values committed by earlier
/// `evaluate` calls are memoized and re-served without re-invoking their
/// functions.
pub struct Evaluator {
    graph: Arc<EvalGraph>,
    registry: Arc<NodeFunctionRegistry>,
    config: EvaluatorConfig,
    sink: Arc<dyn EventSink>,
    cancelled: Arc<AtomicBool>,
    halted: Arc<AtomicBool>,
}

impl Evaluator {
    pub fn new(registry: NodeFunctionRegistry) -> Self {
        Self::with_config(registry, EvaluatorConfig::default())
    }

    pub fn with_config(registry: NodeFunctionRegistry, config: EvaluatorConfig) -> Self {
        Self {
            graph: Arc::new(EvalGraph::new()),
            registry: Arc::new(registry),
            config,
            sink: Arc::new(TracingSink),
            cancelled: Arc::new(AtomicBool::new(false)),
            halted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the sink committed diagnostics are replayed to.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Request cancellation. Cooperative: in-flight attempts observe it via
    /// `Environment::is_cancelled`, conclude without committing, and no new
    /// work is scheduled. Cleared by the next `evaluate` call.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Committed value of a key, if it is already `Done`.
    pub async fn value_of(&self, key: &NodeKey) -> Option<Arc<dyn NodeValue>> {
        self.graph.value_of(key).await
    }

    /// Direct dependencies recorded by the key's committed attempt.
    pub async fn direct_deps(&self, key: &NodeKey) -> Option<Vec<NodeKey>> {
        self.graph.direct_deps(key).await
    }

    /// Keys whose committed attempt read `key`.
    pub async fn dependents_of(&self, key: &NodeKey) -> Vec<NodeKey> {
        self.graph.dependents_of(key).await
    }

    /// Drop transiently failed keys so a later `evaluate` can retry them.
    pub async fn clear_transient_failures(&self) -> usize {
        self.graph.clear_transient_failures().await
    }

    /// Evaluate a set of root keys to completion.
    ///
    /// Under `keep_going = false` the first committed failure halts
    /// scheduling of new work while in-flight work drains; under
    /// `keep_going = true` independent subgraphs run to completion and all
    /// reachable root failures are reported together.
    pub async fn evaluate(&self, roots: &[NodeKey], keep_going: bool) -> EvaluationResult {
        let eval_id = Uuid::new_v4().to_string();
        let span = obs::evaluation_span(&eval_id);
        self.evaluate_inner(roots, keep_going, eval_id.clone())
            .instrument(span)
            .await
    }

    async fn evaluate_inner(
        &self,
        roots: &[NodeKey],
        keep_going: bool,
        eval_id: String,
    ) -> EvaluationResult {
        self.cancelled.store(false, Ordering::SeqCst);
        self.halted.store(false, Ordering::SeqCst);

        let mut seen = HashSet::new();
        let roots: Vec<NodeKey> = roots
            .iter()
            .filter(|k| seen.insert((*k).clone()))
            .cloned()
            .collect();
        obs::emit_evaluation_started(&eval_id, roots.len(), keep_going);

        let ctx = SchedCtx {
            graph: Arc::clone(&self.graph),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
            sink: Arc::clone(&self.sink),
            cancelled: Arc::clone(&self.cancelled),
            halted: Arc::clone(&self.halted),
            keep_going,
        };

        for root in &roots {
            ensure_scheduled(&ctx, root).await;
        }

        let mut values = HashMap::new();
        let mut failures = HashMap::new();
        for root in &roots {
            match wait_resolution(&ctx, root).await {
                Some(NodeState::Done(value)) => {
                    values.insert(root.clone(), value);
                }
                Some(NodeState::Failed(err)) => {
                    failures.insert(root.clone(), err);
                }
                Some(NodeState::Pending) => unreachable!("wait_resolution returns resolved states"),
                None => {
                    failures.insert(root.clone(), EngineError::Interrupted);
                }
            }
        }

        let interrupted = self.cancelled.load(Ordering::SeqCst);
        let success = !interrupted && failures.is_empty();
        obs::emit_evaluation_finished(&eval_id, values.len(), failures.len(), interrupted);
        EvaluationResult {
            values,
            failures,
            interrupted,
            success,
        }
    }
}

/// Scheduling context cloned into every driver task.
#[derive(Clone)]
struct SchedCtx {
    graph: Arc<EvalGraph>,
    registry: Arc<NodeFunctionRegistry>,
    config: EvaluatorConfig,
    sink: Arc<dyn EventSink>,
    cancelled: Arc<AtomicBool>,
    halted: Arc<AtomicBool>,
    keep_going: bool,
}

impl SchedCtx {
    fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// True once no new work may be scheduled: external cancellation, or a
    /// failure under `keep_going = false`.
    fn stopped(&self) -> bool {
        self.cancelled() || self.halted.load(Ordering::SeqCst)
    }
}

/// Claim the key's cell and spawn its driver if no one has yet. Returns
/// false when scheduling is refused because the evaluation has stopped.
async fn ensure_scheduled(ctx: &SchedCtx, key: &NodeKey) -> bool {
    if ctx.stopped() {
        return false;
    }
    let mut inner = ctx.graph.inner.lock().await;
    if inner.cells.contains_key(key) {
        return true;
    }
    inner.cells.insert(key.clone(), NodeCell::new_pending());
    debug!(key = %key, "scheduling node computation");
    tokio::spawn(drive(ctx.clone(), key.clone()));
    true
}

/// Boxing indirection so the driver can recursively schedule dependencies.
fn drive(ctx: SchedCtx, key: NodeKey) -> BoxFuture<'static, ()> {
    async move { run_key(ctx, key).await }.boxed()
}

/// Wait until the key resolves to `Done` or `Failed`. Returns `None` when
/// the key was unwound without resolving (evaluation stopped).
async fn wait_resolution(ctx: &SchedCtx, key: &NodeKey) -> Option<NodeState> {
    loop {
        let rx = {
            let inner = ctx.graph.inner.lock().await;
            match inner.cells.get(key) {
                Some(cell) => match &cell.state {
                    NodeState::Pending => Some(cell.subscribe()),
                    resolved => return Some(resolved.clone()),
                },
                None => None,
            }
        };
        match rx {
            Some(mut rx) => {
                // A send or a dropped sender both wake us; re-check state.
                let _ = rx.changed().await;
            }
            None => {
                if ctx.stopped() {
                    return None;
                }
                if !ensure_scheduled(ctx, key).await {
                    return None;
                }
            }
        }
    }
}

/// Driver for one claimed key: owns its restart loop end to end. Exactly
/// one driver exists per cell, so attempts of the same key are strictly
/// sequential.
async fn run_key(ctx: SchedCtx, key: NodeKey) {
    let Some(function) = ctx.registry.get(&key.kind) else {
        let err = EngineError::InternalConsistency {
            key: key.clone(),
            detail: format!("no node function registered for kind '{}'", key.kind),
        };
        commit_failure(&ctx, &key, err, Vec::new()).await;
        return;
    };

    let mut attempts = 0usize;
    loop {
        // The cell may have been committed externally (cycle detection) or
        // already resolved; never run a second attempt past that.
        {
            let inner = ctx.graph.inner.lock().await;
            match inner.cells.get(&key) {
                Some(cell) if matches!(cell.state, NodeState::Pending) => {}
                _ => return,
            }
        }
        if ctx.stopped() {
            unwind(&ctx, &key).await;
            return;
        }

        attempts += 1;
        if attempts > ctx.config.max_restarts_per_key {
            let err = EngineError::InternalConsistency {
                key: key.clone(),
                detail: format!(
                    "computation did not stabilize after {} attempts",
                    ctx.config.max_restarts_per_key
                ),
            };
            commit_failure(&ctx, &key, err, Vec::new()).await;
            return;
        }

        let mut env = Environment::new(
            Arc::clone(&ctx.graph),
            key.clone(),
            Arc::clone(&ctx.cancelled),
        );
        debug!(key = %key, attempt = attempts, "invoking node function");
        let outcome = function.compute(&key, &mut env).await;

        if ctx.cancelled() {
            // The attempt concluded after cancellation: discard it, events
            // included, without committing.
            unwind(&ctx, &key).await;
            return;
        }

        let attempt = env.into_attempt();
        match outcome {
            Ok(NodeOutcome::Value(value)) => {
                if !attempt.missing.is_empty() {
                    let err = EngineError::InternalConsistency {
                        key: key.clone(),
                        detail: format!(
                            "claimed completion while {} dependencies were still missing",
                            attempt.missing.len()
                        ),
                    };
                    commit_failure(&ctx, &key, err, attempt.events).await;
                } else {
                    commit_value(&ctx, &key, value, attempt.deps, attempt.events).await;
                }
                return;
            }
            Ok(NodeOutcome::Incomplete) => {
                if attempt.missing.is_empty() {
                    let err = EngineError::InternalConsistency {
                        key: key.clone(),
                        detail: "returned Incomplete with no missing dependencies".to_string(),
                    };
                    commit_failure(&ctx, &key, err, attempt.events).await;
                    return;
                }
                let (unresolved, failed) = partition_missing(&ctx, &attempt).await;
                if unresolved.is_empty() {
                    if let Some((origin, cause)) = failed.into_iter().next() {
                        let err = propagated(&key, &origin, cause);
                        commit_failure(&ctx, &key, err, attempt.events).await;
                        return;
                    }
                    // Everything resolved while the attempt ran; retry now.
                    continue;
                }
                if let Some(cycle) = register_waits(&ctx, &key, &unresolved).await {
                    fail_cycle(&ctx, cycle).await;
                    return;
                }
                for dep in &unresolved {
                    ensure_scheduled(&ctx, dep).await;
                }
                for dep in &unresolved {
                    if wait_resolution(&ctx, dep).await.is_none() {
                        unwind(&ctx, &key).await;
                        return;
                    }
                }
                clear_waits(&ctx, &key).await;
                // This attempt is discarded; its buffered events drop here.
            }
            Err(failure) => {
                warn!(key = %key, kind = %failure.kind, "node function failed");
                let err = EngineError::NodeFailed {
                    key: key.clone(),
                    failure,
                };
                commit_failure(&ctx, &key, err, attempt.events).await;
                return;
            }
        }
    }
}

/// Split the attempt's missing set into deps still unresolved and deps that
/// failed. Failures the attempt itself observed take precedence; the rest of
/// the missing set is classified against the graph as of now.
async fn partition_missing(
    ctx: &SchedCtx,
    attempt: &AttemptRecord,
) -> (Vec<NodeKey>, Vec<(NodeKey, EngineError)>) {
    let observed: HashSet<NodeKey> = attempt
        .opaque_failures
        .iter()
        .map(|(key, _)| key.clone())
        .collect();
    let mut failed = attempt.opaque_failures.clone();
    let inner = ctx.graph.inner.lock().await;
    let mut unresolved = Vec::new();
    for dep in &attempt.missing {
        if observed.contains(dep) {
            continue;
        }
        match inner.cells.get(dep).map(|c| &c.state) {
            Some(NodeState::Failed(err)) => failed.push((dep.clone(), err.clone())),
            Some(NodeState::Done(_)) => {} // became available; the retry will see it
            Some(NodeState::Pending) | None => unresolved.push(dep.clone()),
        }
    }
    (unresolved, failed)
}

/// Rewrap a dependency's error so the committed failure always names the
/// originating key and cause, not a derived symptom.
fn propagated(key: &NodeKey, dep: &NodeKey, cause: EngineError) -> EngineError {
    match cause {
        EngineError::DependencyFailed { origin, cause, .. } => EngineError::DependencyFailed {
            key: key.clone(),
            origin,
            cause,
        },
        other => EngineError::DependencyFailed {
            key: key.clone(),
            origin: dep.clone(),
            cause: Box::new(other),
        },
    }
}

/// Record which keys this driver is about to block on and check, atomically
/// with that recording, whether the wait closes a dependency cycle.
async fn register_waits(ctx: &SchedCtx, key: &NodeKey, deps: &[NodeKey]) -> Option<Vec<NodeKey>> {
    let mut inner = ctx.graph.inner.lock().await;
    if let Some(cell) = inner.cells.get_mut(key) {
        cell.waiting_on = deps.iter().cloned().collect();
    }
    inner.find_cycle_from(key)
}

async fn clear_waits(ctx: &SchedCtx, key: &NodeKey) {
    let mut inner = ctx.graph.inner.lock().await;
    if let Some(cell) = inner.cells.get_mut(key) {
        cell.waiting_on.clear();
    }
}

/// Fail every key on a detected cycle with the same cycle error. Blocked
/// drivers wake through their dependencies' resolution and observe their
/// own cell committed.
async fn fail_cycle(ctx: &SchedCtx, cycle: Vec<NodeKey>) {
    warn!(keys = ?cycle, "dependency cycle detected");
    {
        let mut inner = ctx.graph.inner.lock().await;
        for key in &cycle {
            inner.commit_failure(key, EngineError::Cycle { keys: cycle.clone() });
        }
    }
    if !ctx.keep_going {
        ctx.halted.store(true, Ordering::SeqCst);
    }
}

async fn commit_value(
    ctx: &SchedCtx,
    key: &NodeKey,
    value: Arc<dyn NodeValue>,
    deps: Vec<NodeKey>,
    events: Vec<EventRecord>,
) {
    {
        let mut inner = ctx.graph.inner.lock().await;
        inner.commit_value(key, value, deps);
    }
    debug!(key = %key, "node value committed");
    if !events.is_empty() {
        ctx.sink.replay(&events);
    }
}

async fn commit_failure(ctx: &SchedCtx, key: &NodeKey, err: EngineError, events: Vec<EventRecord>) {
    {
        let mut inner = ctx.graph.inner.lock().await;
        inner.commit_failure(key, err.clone());
    }
    debug!(key = %key, error = %err, "node failure committed");
    if !events.is_empty() {
        ctx.sink.replay(&events);
    }
    if !ctx.keep_going {
        ctx.halted.store(true, Ordering::SeqCst);
    }
}

async fn unwind(ctx: &SchedCtx, key: &NodeKey) {
    let mut inner = ctx.graph.inner.lock().await;
    inner.unwind(key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorTransience, NodeFailure};

    fn sched_ctx() -> SchedCtx {
        SchedCtx {
            graph: Arc::new(EvalGraph::new()),
            registry: Arc::new(NodeFunctionRegistry::new()),
            config: EvaluatorConfig::default(),
            sink: Arc::new(TracingSink),
            cancelled: Arc::new(AtomicBool::new(false)),
            halted: Arc::new(AtomicBool::new(false)),
            keep_going: true,
        }
    }

    #[tokio::test]
    async fn test_partition_prefers_failures_the_attempt_observed() {
        let ctx = sched_ctx();
        let dep = NodeKey::of("dep", "a");
        let pending = NodeKey::of("dep", "b");
        let observed = EngineError::NodeFailed {
            key: dep.clone(),
            failure: NodeFailure::transient("io-error", "seen by the attempt"),
        };
        // The graph carries a different failure for the same dep; the one
        // the attempt actually read must win.
        ctx.graph.inner.lock().await.commit_failure(
            &dep,
            EngineError::NodeFailed {
                key: dep.clone(),
                failure: NodeFailure::persistent("io-error", "committed later"),
            },
        );

        let attempt = AttemptRecord {
            deps: vec![dep.clone(), pending.clone()],
            missing: vec![dep.clone(), pending.clone()],
            opaque_failures: vec![(dep.clone(), observed.clone())],
            events: Vec::new(),
        };
        let (unresolved, failed) = partition_missing(&ctx, &attempt).await;

        assert_eq!(unresolved, vec![pending]);
        assert_eq!(failed.len(), 1);
        let (key, err) = &failed[0];
        assert_eq!(key, &dep);
        assert_eq!(err.origin_failure(), observed.origin_failure());
        assert_eq!(err.transience(), ErrorTransience::Transient);
    }

    #[tokio::test]
    async fn test_partition_classifies_unobserved_deps_against_the_graph() {
        let ctx = sched_ctx();
        let done = NodeKey::of("dep", "done");
        let failed_dep = NodeKey::of("dep", "failed");
        {
            let mut inner = ctx.graph.inner.lock().await;
            inner.commit_value(&done, Arc::new(1u64), Vec::new());
            inner.commit_failure(
                &failed_dep,
                EngineError::NodeFailed {
                    key: failed_dep.clone(),
                    failure: NodeFailure::persistent("boom", "broke"),
                },
            );
        }

        let attempt = AttemptRecord {
            deps: vec![done.clone(), failed_dep.clone()],
            missing: vec![done.clone(), failed_dep.clone()],
            opaque_failures: Vec::new(),
            events: Vec::new(),
        };
        let (unresolved, failed) = partition_missing(&ctx, &attempt).await;

        // A dep that resolved while the attempt ran is neither unresolved
        // nor failed; the retry reads it directly.
        assert!(unresolved.is_empty());
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, failed_dep);
    }
}
