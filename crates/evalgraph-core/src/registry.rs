//! Node function contract and the kind -> function dispatch table.
//!
//! Dispatch is an explicit table constructed at process start; no runtime
//! reflection. Each node kind maps to one capability object implementing
//! [`NodeFunction`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::env::Environment;
use crate::error::NodeFailure;
use crate::model::{NodeKey, NodeKind, NodeValue};

/// What one computation attempt produced.
#[derive(Debug)]
pub enum NodeOutcome {
    /// All requested dependencies were satisfied during this attempt; the
    /// scheduler commits the value and the recorded edge set atomically.
    Value(Arc<dyn NodeValue>),
    /// Cannot finish yet. Legal only when the environment has missing
    /// values; the function will be re-invoked from scratch once they
    /// resolve.
    Incomplete,
}

impl NodeOutcome {
    /// Wrap a concrete payload as a committed value.
    pub fn value<T: NodeValue>(payload: T) -> Self {
        NodeOutcome::Value(Arc::new(payload))
    }
}

/// Computation logic for one node kind.
///
/// The dependency set is dynamic: a function may request different, larger
/// sets of keys on successive restarts as earlier reads reveal further
/// inputs. Until it returns `Value` it must have no externally visible side
/// effects, so re-invoking it from scratch with a fresh environment is
/// always safe.
#[async_trait]
pub trait NodeFunction: Send + Sync {
    /// Compute the value for `key`, requesting dependencies through `env`.
    async fn compute(
        &self,
        key: &NodeKey,
        env: &mut Environment,
    ) -> std::result::Result<NodeOutcome, NodeFailure>;
}

/// Explicit dispatch table mapping node kinds to their functions.
#[derive(Default, Clone)]
pub struct NodeFunctionRegistry {
    functions: HashMap<NodeKind, Arc<dyn NodeFunction>>,
}

impl NodeFunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the function for a kind. Re-registering a kind replaces the
    /// previous function.
    pub fn register(&mut self, kind: NodeKind, function: Arc<dyn NodeFunction>) -> &mut Self {
        self.functions.insert(kind, function);
        self
    }

    pub fn get(&self, kind: &NodeKind) -> Option<Arc<dyn NodeFunction>> {
        self.functions.get(kind).cloned()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ConstantFunction(u64);

    #[async_trait]
    impl NodeFunction for ConstantFunction {
        async fn compute(
            &self,
            _key: &NodeKey,
            _env: &mut Environment,
        ) -> std::result::Result<NodeOutcome, NodeFailure> {
            Ok(NodeOutcome::value(self.0))
        }
    }

    #[test]
    fn test_register_and_get_by_kind() {
        let mut registry = NodeFunctionRegistry::new();
        assert!(registry.is_empty());
        registry.register(NodeKind::new("constant"), Arc::new(ConstantFunction(7)));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&NodeKind::new("constant")).is_some());
        assert!(registry.get(&NodeKind::new("unknown")).is_none());
    }

    #[test]
    fn test_reregistering_replaces_function() {
        let mut registry = NodeFunctionRegistry::new();
        registry.register(NodeKind::new("constant"), Arc::new(ConstantFunction(1)));
        registry.register(NodeKind::new("constant"), Arc::new(ConstantFunction(2)));
        assert_eq!(registry.len(), 1);
    }
}
