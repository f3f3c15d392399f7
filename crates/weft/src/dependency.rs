//! Dependencies declared by a handler's first phase.

use crate::address::GraphNode;
use crate::node::NodeDefinition;
use crate::operation::{OpKind, Operation};

/// Continuation predicate. Resolution keeps hopping (`Evaluate`) from the
/// dependency's current node until the predicate holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Until {
    /// Stop at the first result of the operation.
    Any,
    /// Stop at a node without an `Evaluate` handler.
    Static,
    Supports(OpKind),
    SupportsOrStatic(OpKind),
    Tag(&'static str),
}

impl Until {
    pub fn describe(&self) -> String {
        match self {
            Until::Any => "any node".to_string(),
            Until::Static => "a static node".to_string(),
            Until::Supports(op) => format!("a node supporting `{op}`"),
            Until::SupportsOrStatic(op) => format!("a static node or one supporting `{op}`"),
            Until::Tag(tag) => format!("a `{tag}` node"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// Instantiated in the declaring node's scope and context.
    Definition(NodeDefinition),
    Node(GraphNode),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeDependency {
    pub target: Target,
    pub operation: Operation,
    pub until: Until,
    pub allow_errors: bool,
    pub allow_pending: bool,
}

impl NodeDependency {
    /// Evaluate `definition` until it is static.
    pub fn new(definition: NodeDefinition) -> Self {
        Self::on(Target::Definition(definition))
    }

    pub fn node(node: GraphNode) -> Self {
        Self::on(Target::Node(node))
    }

    fn on(target: Target) -> Self {
        Self {
            target,
            operation: Operation::Evaluate,
            until: Until::Static,
            allow_errors: false,
            allow_pending: false,
        }
    }

    pub fn operation(mut self, operation: Operation) -> Self {
        self.operation = operation;
        self
    }

    pub fn until(mut self, until: Until) -> Self {
        self.until = until;
        self
    }

    pub fn allow_errors(mut self) -> Self {
        self.allow_errors = true;
        self
    }

    pub fn allow_pending(mut self) -> Self {
        self.allow_pending = true;
        self
    }

    pub fn tolerant(mut self, allow_errors: bool, allow_pending: bool) -> Self {
        self.allow_errors = allow_errors;
        self.allow_pending = allow_pending;
        self
    }
}
