//! Shared evaluation graph state: per-key cells, committed dependency
//! edges, and in-progress wait tracking for cycle detection.
//!
//! The key -> cell map is the only widely shared mutable structure in the
//! engine. Every state transition, value commit and edge commit happens
//! under one lock, so a concurrent reader never observes a half-committed
//! value or edge set.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use crate::error::{EngineError, ErrorTransience};
use crate::model::{NodeKey, NodeValue};

/// Lifecycle of one key within a generation. A key with no cell at all is
/// unrequested.
#[derive(Debug, Clone)]
pub enum NodeState {
    /// Claimed by a driver; a computation attempt or restart wait is in
    /// flight.
    Pending,
    /// Value committed by the last successful attempt.
    Done(Arc<dyn NodeValue>),
    /// Classified failure committed as this key's outcome.
    Failed(EngineError),
}

pub(crate) struct NodeCell {
    pub(crate) state: NodeState,
    /// Keys this cell's driver is currently blocked on. Non-empty only
    /// while `Pending`; feeds cycle detection.
    pub(crate) waiting_on: HashSet<NodeKey>,
    /// Direct dependencies recorded by the committed successful attempt.
    pub(crate) deps: Vec<NodeKey>,
    resolved_tx: watch::Sender<bool>,
}

impl NodeCell {
    pub(crate) fn new_pending() -> Self {
        let (resolved_tx, _rx) = watch::channel(false);
        Self {
            state: NodeState::Pending,
            waiting_on: HashSet::new(),
            deps: Vec::new(),
            resolved_tx,
        }
    }

    /// Subscribe for the resolution signal. Must be called under the map
    /// lock so a commit cannot race past the subscription.
    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.resolved_tx.subscribe()
    }

    fn mark_resolved(&self) {
        let _ = self.resolved_tx.send(true);
    }
}

#[derive(Default)]
pub(crate) struct GraphInner {
    pub(crate) cells: HashMap<NodeKey, NodeCell>,
    /// Reverse edges: producer -> consumers whose committed attempt read it.
    pub(crate) rdeps: HashMap<NodeKey, HashSet<NodeKey>>,
}

impl GraphInner {
    /// Commit a value and the dependency edges of the attempt that produced
    /// it, atomically, and wake waiters.
    pub(crate) fn commit_value(
        &mut self,
        key: &NodeKey,
        value: Arc<dyn NodeValue>,
        deps: Vec<NodeKey>,
    ) {
        for dep in &deps {
            self.rdeps
                .entry(dep.clone())
                .or_default()
                .insert(key.clone());
        }
        let cell = self
            .cells
            .entry(key.clone())
            .or_insert_with(NodeCell::new_pending);
        cell.state = NodeState::Done(value);
        cell.deps = deps;
        cell.waiting_on.clear();
        cell.mark_resolved();
    }

    /// Commit a classified failure as the key's outcome and wake waiters.
    /// Failed attempts contribute no dependency edges.
    pub(crate) fn commit_failure(&mut self, key: &NodeKey, error: EngineError) {
        let cell = self
            .cells
            .entry(key.clone())
            .or_insert_with(NodeCell::new_pending);
        cell.state = NodeState::Failed(error);
        cell.deps.clear();
        cell.waiting_on.clear();
        cell.mark_resolved();
    }

    /// Discard a pending cell without committing, waking waiters so they can
    /// observe the key as unrequested again.
    pub(crate) fn unwind(&mut self, key: &NodeKey) {
        if let Some(cell) = self.cells.remove(key) {
            cell.mark_resolved();
        }
    }

    /// DFS over the `waiting_on` edges of pending cells, looking for a path
    /// from `start` back to itself. Returns the keys on the cycle.
    pub(crate) fn find_cycle_from(&self, start: &NodeKey) -> Option<Vec<NodeKey>> {
        let mut visited = HashSet::new();
        let mut path = vec![start.clone()];
        if self.dfs_cycle(start, start, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn dfs_cycle(
        &self,
        node: &NodeKey,
        start: &NodeKey,
        visited: &mut HashSet<NodeKey>,
        path: &mut Vec<NodeKey>,
    ) -> bool {
        let Some(cell) = self.cells.get(node) else {
            return false;
        };
        for next in &cell.waiting_on {
            if next == start {
                return true;
            }
            if visited.insert(next.clone()) {
                path.push(next.clone());
                if self.dfs_cycle(next, start, visited, path) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }
}

/// In-memory key -> state map for one evaluation generation.
#[derive(Default)]
pub struct EvalGraph {
    pub(crate) inner: Mutex<GraphInner>,
}

impl EvalGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current lifecycle state of a key, if it has been requested at all.
    pub async fn state_of(&self, key: &NodeKey) -> Option<NodeState> {
        self.inner.lock().await.cells.get(key).map(|c| c.state.clone())
    }

    /// Committed value of a key, if it is `Done`.
    pub async fn value_of(&self, key: &NodeKey) -> Option<Arc<dyn NodeValue>> {
        match self.state_of(key).await {
            Some(NodeState::Done(value)) => Some(value),
            _ => None,
        }
    }

    /// Direct dependencies recorded by the key's committed successful
    /// attempt. `None` until the key is `Done`.
    pub async fn direct_deps(&self, key: &NodeKey) -> Option<Vec<NodeKey>> {
        let inner = self.inner.lock().await;
        match inner.cells.get(key) {
            Some(cell) if matches!(cell.state, NodeState::Done(_)) => Some(cell.deps.clone()),
            _ => None,
        }
    }

    /// Keys whose committed attempt read `key`. Structural support for
    /// invalidation by a surrounding system.
    pub async fn dependents_of(&self, key: &NodeKey) -> Vec<NodeKey> {
        let inner = self.inner.lock().await;
        inner
            .rdeps
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every failed cell whose failure is classified transient, so a
    /// higher-level driver can retry them from a clean cache. Returns how
    /// many keys were cleared.
    pub async fn clear_transient_failures(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let to_clear: Vec<NodeKey> = inner
            .cells
            .iter()
            .filter_map(|(key, cell)| match &cell.state {
                NodeState::Failed(err) if err.transience() == ErrorTransience::Transient => {
                    Some(key.clone())
                }
                _ => None,
            })
            .collect();
        for key in &to_clear {
            inner.cells.remove(key);
        }
        to_clear.len()
    }
}
