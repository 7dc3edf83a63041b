//! Error taxonomy for the evaluation engine.
//!
//! Node functions raise typed, transience-classified [`NodeFailure`]s; the
//! scheduler wraps them (and its own cycle / consistency errors) into
//! [`EngineError`], always preserving the originating failure through
//! opaque propagation chains.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::NodeKey;

/// Whether a failure may legitimately succeed if the evaluation is retried
/// from a clean cache in a later generation.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum ErrorTransience {
    /// May succeed on retry, e.g. an external resource hiccup.
    Transient,
    /// Stable failure; must not be silently retried.
    Persistent,
}

/// Tag identifying one failure kind a node function can raise, or declare
/// that it knows how to interpret when a dependency raises it.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct FailureKind {
    /// Canonical kind name, e.g. "file-not-found".
    pub name: String,
}

impl FailureKind {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Typed failure raised by a node function.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct NodeFailure {
    pub kind: FailureKind,
    pub message: String,
    pub transience: ErrorTransience,
}

impl NodeFailure {
    pub fn new(
        kind: FailureKind,
        message: impl Into<String>,
        transience: ErrorTransience,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            transience,
        }
    }

    /// A failure that may succeed if retried in a later generation.
    pub fn transient(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FailureKind::new(kind), message, ErrorTransience::Transient)
    }

    /// A stable failure that must not be silently retried.
    pub fn persistent(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FailureKind::new(kind), message, ErrorTransience::Persistent)
    }
}

/// Classified outcome of a computation that did not produce a value.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The node's own function raised a typed failure.
    #[error("node {key} failed: {failure}")]
    NodeFailed { key: NodeKey, failure: NodeFailure },

    /// A dependency failed with a kind this node did not declare it could
    /// interpret. `origin` and `cause` always identify the key and error
    /// where the failure originated, however long the propagation chain.
    #[error("node {key} failed because dependency {origin} failed: {cause}")]
    DependencyFailed {
        key: NodeKey,
        origin: NodeKey,
        cause: Box<EngineError>,
    },

    /// Raised uniformly for every key participating in a dependency cycle.
    #[error("dependency cycle detected involving keys: {keys:?}")]
    Cycle { keys: Vec<NodeKey> },

    /// A node function violated the compute contract (claimed completion
    /// with missing dependencies, returned Incomplete with nothing missing,
    /// exhausted the restart budget, or its kind was never registered).
    #[error("internal consistency violation at {key}: {detail}")]
    InternalConsistency { key: NodeKey, detail: String },

    /// The evaluation was cancelled (or halted by an unrelated failure)
    /// before this key resolved.
    #[error("evaluation interrupted before the key resolved")]
    Interrupted,
}

impl EngineError {
    /// The typed failure this error originated from, if it traces back to a
    /// node function raising one.
    pub fn origin_failure(&self) -> Option<&NodeFailure> {
        match self {
            EngineError::NodeFailed { failure, .. } => Some(failure),
            EngineError::DependencyFailed { cause, .. } => cause.origin_failure(),
            _ => None,
        }
    }

    /// Transience classification for retry policy. Cycles and contract
    /// violations are stable; interruption is safe to retry.
    pub fn transience(&self) -> ErrorTransience {
        match self {
            EngineError::NodeFailed { failure, .. } => failure.transience,
            EngineError::DependencyFailed { cause, .. } => cause.transience(),
            EngineError::Cycle { .. } => ErrorTransience::Persistent,
            EngineError::InternalConsistency { .. } => ErrorTransience::Persistent,
            EngineError::Interrupted => ErrorTransience::Transient,
        }
    }

    pub fn is_cycle(&self) -> bool {
        matches!(self, EngineError::Cycle { .. })
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_failure_display_shows_kind_and_message() {
        let failure = NodeFailure::persistent("file-not-found", "no such file: lib.ext");
        let msg = failure.to_string();
        assert!(msg.contains("file-not-found"));
        assert!(msg.contains("lib.ext"));
    }

    #[test]
    fn test_origin_failure_traverses_propagation_chain() {
        let origin = NodeKey::of("ast", "base.ext");
        let failure = NodeFailure::transient("io-error", "read interrupted");
        let root = EngineError::NodeFailed {
            key: origin.clone(),
            failure: failure.clone(),
        };
        let propagated = EngineError::DependencyFailed {
            key: NodeKey::of("import", "lib.ext"),
            origin,
            cause: Box::new(root),
        };
        assert_eq!(propagated.origin_failure(), Some(&failure));
        assert_eq!(propagated.transience(), ErrorTransience::Transient);
    }

    #[test]
    fn test_cycle_error_displays_all_keys() {
        let err = EngineError::Cycle {
            keys: vec![NodeKey::of("a", "1"), NodeKey::of("b", "2")],
        };
        let msg = err.to_string();
        assert!(msg.contains("a"));
        assert!(msg.contains("b"));
        assert!(err.is_cycle());
        assert_eq!(err.transience(), ErrorTransience::Persistent);
    }

    #[test]
    fn test_interrupted_is_transient() {
        assert_eq!(
            EngineError::Interrupted.transience(),
            ErrorTransience::Transient
        );
    }
}
