//! Node types: behavior tables keyed by tag.
//!
//! Capability checks ("does this node support `call`?") are structural
//! lookups into the handler map, never nominal inheritance.

use crate::address::GraphNode;
use crate::dependency::NodeDependency;
use crate::engine::{DepsContext, RunContext};
use crate::error::{NodeError, ShapeError};
use crate::node::{NodeDefinition, Prop};
use crate::operation::{OpKind, Operation};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

pub type DepsFn = fn(&DepsContext<'_>, &Operation) -> Result<Vec<NodeDependency>, NodeError>;
pub type RunFn = fn(&mut RunContext<'_>, &Operation, &[GraphNode]) -> Result<Outcome, NodeError>;
pub type HookFn = fn(&mut RunContext<'_>) -> Result<(), NodeError>;
pub type InitialStateFn = fn(&NodeDefinition) -> Result<Box<dyn Any>, NodeError>;

/// What a handler's `run` phase produced.
#[derive(Debug)]
pub enum Outcome {
    /// A definition instantiated in the running node's scope and context.
    Done(NodeDefinition),
    /// Continue with an already instantiated node.
    Node(GraphNode),
    /// Forward a (possibly different) operation to another node; its result
    /// becomes this operation's result.
    Delegate(GraphNode, Operation),
}

#[derive(Clone, Copy)]
pub struct Handler {
    pub deps: Option<DepsFn>,
    pub run: RunFn,
}

pub struct StateSpec {
    pub initial: InitialStateFn,
    pub on_subscribe: Option<HookFn>,
    pub on_unsubscribe: Option<HookFn>,
    /// Runs when the host or an event explicitly invalidates the instance.
    pub on_invalidate: Option<HookFn>,
}

impl StateSpec {
    pub fn new(initial: InitialStateFn) -> Self {
        Self {
            initial,
            on_subscribe: None,
            on_unsubscribe: None,
            on_invalidate: None,
        }
    }

    pub fn on_subscribe(mut self, hook: HookFn) -> Self {
        self.on_subscribe = Some(hook);
        self
    }

    pub fn on_unsubscribe(mut self, hook: HookFn) -> Self {
        self.on_unsubscribe = Some(hook);
        self
    }

    pub fn on_invalidate(mut self, hook: HookFn) -> Self {
        self.on_invalidate = Some(hook);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropKind {
    Value,
    Node,
    Nodes,
    Named,
    Func,
    Opaque,
}

impl PropKind {
    fn matches(self, prop: &Prop) -> bool {
        matches!(
            (self, prop),
            (PropKind::Value, Prop::Value(_))
                | (PropKind::Node, Prop::Node(_))
                | (PropKind::Nodes, Prop::Nodes(_))
                | (PropKind::Named, Prop::Named(_))
                | (PropKind::Func, Prop::Func(_))
                | (PropKind::Opaque, Prop::Opaque(_))
        )
    }

    fn label(self) -> &'static str {
        match self {
            PropKind::Value => "value",
            PropKind::Node => "node",
            PropKind::Nodes => "nodes",
            PropKind::Named => "named nodes",
            PropKind::Func => "function",
            PropKind::Opaque => "opaque handle",
        }
    }
}

struct PropSpec {
    name: &'static str,
    kind: PropKind,
    optional: bool,
}

pub struct NodeType {
    name: Arc<str>,
    shape: Vec<PropSpec>,
    state: Option<StateSpec>,
    handlers: FxHashMap<OpKind, Handler>,
    one_shot: bool,
    continuation: bool,
}

impl NodeType {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            shape: Vec::new(),
            state: None,
            handlers: FxHashMap::default(),
            one_shot: false,
            continuation: false,
        }
    }

    pub fn prop(mut self, name: &'static str, kind: PropKind) -> Self {
        self.shape.push(PropSpec {
            name,
            kind,
            optional: false,
        });
        self
    }

    pub fn optional(mut self, name: &'static str, kind: PropKind) -> Self {
        self.shape.push(PropSpec {
            name,
            kind,
            optional: true,
        });
        self
    }

    pub fn state(mut self, state: StateSpec) -> Self {
        self.state = Some(state);
        self
    }

    /// Handler with a dependency phase.
    pub fn handler(mut self, op: OpKind, deps: DepsFn, run: RunFn) -> Self {
        self.handlers.insert(op, Handler { deps: Some(deps), run });
        self
    }

    /// Handler without dependencies.
    pub fn run(mut self, op: OpKind, run: RunFn) -> Self {
        self.handlers.insert(op, Handler { deps: None, run });
        self
    }

    /// Every operation on this type runs at most once per slot.
    pub fn one_shot(mut self) -> Self {
        self.one_shot = true;
        self
    }

    /// Evaluation of this type hands control to the next step of a loop.
    /// Walks through such nodes are not charged against the hop limit.
    pub fn continuation(mut self) -> Self {
        self.continuation = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler_for(&self, op: OpKind) -> Option<Handler> {
        self.handlers.get(&op).copied()
    }

    pub fn supports(&self, op: OpKind) -> bool {
        self.handlers.contains_key(&op)
    }

    /// Static nodes have no `Evaluate` handler: they are their own value.
    pub fn is_static(&self) -> bool {
        !self.supports(OpKind::Evaluate)
    }

    pub fn state_spec(&self) -> Option<&StateSpec> {
        self.state.as_ref()
    }

    pub fn is_one_shot(&self) -> bool {
        self.one_shot
    }

    pub fn is_continuation(&self) -> bool {
        self.continuation
    }

    pub fn validate(&self, definition: &NodeDefinition) -> Result<(), ShapeError> {
        for spec in &self.shape {
            match definition.prop(spec.name) {
                Some(prop) if !spec.kind.matches(prop) => {
                    return Err(ShapeError::WrongKind {
                        tag: self.name.clone(),
                        prop: spec.name,
                        expected: spec.kind.label(),
                        found: prop.kind(),
                    });
                }
                Some(_) => {}
                None if spec.optional => {}
                None => {
                    return Err(ShapeError::Missing {
                        tag: self.name.clone(),
                        prop: spec.name,
                    });
                }
            }
        }
        if let Some(name) = definition
            .props()
            .keys()
            .find(|name| !self.shape.iter().any(|spec| spec.name == name.as_ref()))
        {
            return Err(ShapeError::Unexpected {
                tag: self.name.clone(),
                prop: name.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ops: Vec<_> = self.handlers.keys().map(|op| op.name()).collect();
        ops.sort_unstable();
        f.debug_struct("NodeType")
            .field("name", &self.name)
            .field("operations", &ops)
            .field("stateful", &self.state.is_some())
            .finish()
    }
}

#[derive(Default)]
pub struct Registry {
    types: FxHashMap<Arc<str>, Rc<NodeType>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in node library, transducers,
    /// query executors and remote proxies.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::nodes::register(&mut registry);
        crate::transduce::register(&mut registry);
        crate::query::register(&mut registry);
        crate::remote::register(&mut registry);
        registry
    }

    /// Register a node type. A later registration for the same tag replaces the earlier one.
    pub fn register(&mut self, node_type: NodeType) -> &mut Self {
        self.types
            .insert(node_type.name.clone(), Rc::new(node_type));
        self
    }

    pub fn get(&self, tag: &str) -> Option<&Rc<NodeType>> {
        self.types.get(tag)
    }

    pub fn supports(&self, tag: &str, op: OpKind) -> bool {
        self.get(tag).is_some_and(|ty| ty.supports(op))
    }

    pub fn is_static(&self, tag: &str) -> bool {
        self.get(tag).is_none_or(|ty| ty.is_static())
    }

    pub fn is_continuation(&self, tag: &str) -> bool {
        self.get(tag).is_some_and(|ty| ty.is_continuation())
    }

    /// Look up the type and check the definition's shape.
    pub fn validate(&self, definition: &NodeDefinition) -> Result<&Rc<NodeType>, NodeError> {
        let ty = self
            .get(definition.tag())
            .ok_or_else(|| NodeError::UnknownType(definition.tag().into()))?;
        ty.validate(definition)?;
        Ok(ty)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.types.keys().collect();
        names.sort_unstable();
        f.debug_struct("Registry").field("types", &names).finish()
    }
}
