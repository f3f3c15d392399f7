//! Identity of instantiated nodes.
//!
//! A `GraphNode` is the triple (definition, scope, context). Scopes and
//! contexts are arena handles owned by the engine, so graph nodes are plain
//! values that can be cloned, hashed and compared.

use crate::arena::SlotId;
use crate::node::NodeDefinition;
use std::fmt;

/// Isolation and cache boundary.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ScopeId(pub(crate) SlotId);

/// Chained binding environment, always owned by exactly one scope.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ContextId(pub(crate) SlotId);

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct GraphNode {
    pub definition: NodeDefinition,
    pub scope: ScopeId,
    pub context: ContextId,
}

impl GraphNode {
    /// Pure constructor; the engine validates the handles when the node is used.
    pub fn create(definition: NodeDefinition, scope: ScopeId, context: ContextId) -> Self {
        Self {
            definition,
            scope,
            context,
        }
    }

    /// Rebind `definition` into this node's scope and context, so the new node
    /// shares caching, events and bindings with it.
    pub fn with_scope_from(&self, definition: NodeDefinition) -> Self {
        Self {
            definition,
            scope: self.scope,
            context: self.context,
        }
    }

    pub fn tag(&self) -> &str {
        self.definition.tag()
    }
}

impl fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}@s{}.{}/c{}.{}",
            self.definition,
            self.scope.0.index,
            self.scope.0.generation,
            self.context.0.index,
            self.context.0.generation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::data;

    fn ids() -> (ScopeId, ContextId, ContextId) {
        let scope = ScopeId(SlotId { index: 0, generation: 0 });
        let a = ContextId(SlotId { index: 0, generation: 0 });
        let b = ContextId(SlotId { index: 1, generation: 0 });
        (scope, a, b)
    }

    #[test]
    fn identity_is_the_triple() {
        let (scope, a, b) = ids();
        let one = GraphNode::create(data::nil(), scope, a);
        assert_eq!(one, GraphNode::create(data::nil(), scope, a));
        assert_ne!(one, GraphNode::create(data::nil(), scope, b));
    }

    #[test]
    fn with_scope_from_keeps_scope_and_context() {
        let (scope, _, b) = ids();
        let parent = GraphNode::create(data::nil(), scope, b);
        let child = parent.with_scope_from(data::pending());
        assert_eq!(child.scope, scope);
        assert_eq!(child.context, b);
        assert!(child.definition.is_pending());
    }
}
