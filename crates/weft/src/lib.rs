//! Reactive graph evaluation engine.
//!
//! Application state and derived computation are a graph of immutable node
//! definitions. Operations resolved against instantiated nodes are memoized
//! per scope, invalidated by push and recomputed by pull, and any part of the
//! graph can be proxied to a remote engine through a middleware pipeline.

pub mod address;
pub mod arena;
pub mod config;
pub mod dependency;
pub mod engine;
pub mod error;
pub mod graph;
pub mod node;
pub mod nodes;
pub mod operation;
pub mod query;
pub mod registry;
pub mod remote;
pub mod transduce;
pub mod value;

pub use address::{ContextId, GraphNode, ScopeId};
pub use config::GraphConfig;
pub use dependency::{NodeDependency, Target, Until};
pub use engine::{DepsContext, EngineStats, RunContext};
pub use error::{GraphError, NodeError, ShapeError};
pub use graph::{Driver, Graph, ServeStream, Subscription};
pub use node::{Func, NodeDefinition, Opaque, Prop, Props};
pub use operation::{OpKind, Operation};
pub use query::{Query, QuerySet, QuerySubscription, Selection};
pub use registry::{Handler, NodeType, Outcome, PropKind, Registry, StateSpec};
pub use value::{ErrorValue, Key, Value};
