//! evalgraph-core: incremental, demand-driven evaluation engine.
//!
//! A graph of named computations ("nodes") whose results are computed
//! lazily, memoized, and kept consistent as dependencies are discovered.
//! Node functions request other nodes through a dependency-tracking
//! [`Environment`]; when a request cannot be satisfied yet, the function
//! aborts cleanly by returning [`NodeOutcome::Incomplete`] and the
//! [`Evaluator`] restarts it from scratch once the missing dependencies
//! resolve. Failures are typed and transience-classified; dependency cycles
//! are detected and reported rather than deadlocking.
//!
//! ```rust,ignore
//! let mut registry = NodeFunctionRegistry::new();
//! registry.register(NodeKind::new("ast"), Arc::new(AstFunction::default()));
//! registry.register(NodeKind::new("import"), Arc::new(ImportFunction::default()));
//!
//! let evaluator = Evaluator::new(registry);
//! let root = NodeKey::of("import", "lib.ext");
//! let result = evaluator.evaluate(&[root.clone()], true).await;
//! let value = result.value(&root).expect("import resolved");
//! ```

pub mod env;
pub mod error;
pub mod events;
pub mod evaluator;
pub mod graph;
pub mod model;
pub mod obs;
pub mod registry;

pub use env::Environment;
pub use error::{EngineError, ErrorTransience, FailureKind, NodeFailure, Result};
pub use evaluator::{EvaluationResult, Evaluator, EvaluatorConfig};
pub use events::{EventRecord, EventSeverity, EventSink, MemorySink, TracingSink};
pub use graph::{EvalGraph, NodeState};
pub use model::{downcast_value, NodeKey, NodeKind, NodeValue};
pub use registry::{NodeFunction, NodeFunctionRegistry, NodeOutcome};
