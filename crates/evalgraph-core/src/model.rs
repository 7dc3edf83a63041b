//! Node identity and value model: keys addressing units of computation and
//! the opaque values they produce.
//!
//! Keys are the sole addressing mechanism into the graph. Two keys are equal
//! iff their kind and argument are equal; a key never changes after creation.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Kind tag of a node: selects which registered function computes it.
#[derive(Debug, Clone, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKind {
    /// Canonical kind name, e.g. "ast" or "import".
    pub name: String,
}

impl NodeKind {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Immutable address of one unit of computation: a kind tag plus an argument
/// (a file path, an import specifier, ...).
#[derive(Debug, Clone, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub kind: NodeKind,
    pub arg: String,
}

impl NodeKey {
    pub fn new(kind: NodeKind, arg: impl Into<String>) -> Self {
        Self {
            kind,
            arg: arg.into(),
        }
    }

    /// Shorthand constructing both the kind tag and the key in one step.
    pub fn of(kind: impl Into<String>, arg: impl Into<String>) -> Self {
        Self::new(NodeKind::new(kind), arg)
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind, self.arg)
    }
}

/// Opaque result of successfully computing a key.
///
/// The engine never inspects values; node kinds agree on concrete payload
/// types among themselves and recover them with [`downcast_value`]. Values
/// are shared as `Arc<dyn NodeValue>` and never mutated after commit.
pub trait NodeValue: Any + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + fmt::Debug + Send + Sync> NodeValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Recover the concrete payload type of a committed value.
pub fn downcast_value<T: NodeValue>(value: &Arc<dyn NodeValue>) -> Option<&T> {
    value.as_any().downcast_ref::<T>()
}
