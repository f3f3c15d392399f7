//! Per-instance state and the contexts handed to node handlers.
//!
//! State is created on the first slot of a node identity and destroyed with
//! the last one, so `on_subscribe`/`on_unsubscribe` run exactly once per
//! identity however many callers share it.

use super::scope::{Listener, ListenerAction};
use super::Engine;
use crate::address::{ContextId, GraphNode};
use crate::arena::SlotId;
use crate::error::NodeError;
use crate::node::NodeDefinition;
use crate::operation::OpKind;
use crate::registry::Registry;
use futures_util::stream::LocalBoxStream;
use rustc_hash::FxHashSet;
use std::any::Any;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

pub struct Instance {
    pub state: Option<Box<dyn Any>>,
    /// Latest value pushed by an attached stream or a scope event.
    pub source: Option<NodeDefinition>,
    /// Slots that read `state` or `source` during their last computation.
    pub readers: FxHashSet<SlotId>,
    /// Live slots of this identity.
    pub slots: usize,
}

pub struct SourceStream {
    pub node: GraphNode,
    pub stream: LocalBoxStream<'static, NodeDefinition>,
}

impl Engine {
    pub(crate) fn attach_instance(&mut self, node: &GraphNode, slot: SlotId) {
        if let Some(instance) = self.instances.get_mut(node) {
            instance.slots += 1;
            return;
        }
        let Some(ty) = self.registry.get(node.tag()).cloned() else {
            return;
        };
        let Some(spec) = ty.state_spec() else {
            return;
        };
        let state = match (spec.initial)(&node.definition) {
            Ok(state) => Some(state),
            Err(error) => {
                log::warn!("initial state for {:?} failed: {error}", node);
                None
            }
        };
        self.instances.insert(
            node.clone(),
            Instance {
                state,
                source: None,
                readers: FxHashSet::default(),
                slots: 1,
            },
        );
        log::debug!("instance created {:?}", node);
        if let Some(hook) = spec.on_subscribe {
            let mut cx = RunContext::new(self, Some(slot), node);
            if let Err(error) = hook(&mut cx) {
                log::warn!("on_subscribe for {:?} failed: {error}", node);
            }
        }
    }

    pub(crate) fn detach_instance(&mut self, node: &GraphNode) {
        let Some(instance) = self.instances.get_mut(node) else {
            return;
        };
        instance.slots = instance.slots.saturating_sub(1);
        if instance.slots > 0 {
            return;
        }
        if let Some(hook) = self
            .registry
            .get(node.tag())
            .and_then(|ty| ty.state_spec())
            .and_then(|spec| spec.on_unsubscribe)
        {
            let mut cx = RunContext::new(self, None, node);
            if let Err(error) = hook(&mut cx) {
                log::warn!("on_unsubscribe for {:?} failed: {error}", node);
            }
        }
        self.scopes.unlisten(node);
        self.streams.retain(|source| &source.node != node);
        self.instances.remove(node);
        log::debug!("instance destroyed {:?}", node);
    }

    /// Run the `on_invalidate` hook of a live instance.
    pub(crate) fn invalidate_instance(&mut self, node: &GraphNode) {
        if !self.instances.contains_key(node) {
            return;
        }
        if let Some(hook) = self
            .registry
            .get(node.tag())
            .and_then(|ty| ty.state_spec())
            .and_then(|spec| spec.on_invalidate)
        {
            let mut cx = RunContext::new(self, None, node);
            if let Err(error) = hook(&mut cx) {
                log::warn!("on_invalidate for {:?} failed: {error}", node);
            }
        }
    }

    /// Store a pushed value and mark the readers of the instance.
    pub(crate) fn push_source(&mut self, node: &GraphNode, value: NodeDefinition) -> bool {
        let Some(instance) = self.instances.get_mut(node) else {
            return false;
        };
        if instance.source.as_ref() == Some(&value) {
            return false;
        }
        instance.source = Some(value);
        let readers: Vec<SlotId> = instance.readers.iter().copied().collect();
        for reader in readers {
            self.mark_dirty(reader);
        }
        true
    }

    fn mark_readers(&mut self, node: &GraphNode, except: Option<SlotId>) {
        let Some(instance) = self.instances.get(node) else {
            return;
        };
        let readers: Vec<SlotId> = instance
            .readers
            .iter()
            .copied()
            .filter(|reader| Some(*reader) != except)
            .collect();
        for reader in readers {
            self.mark_dirty(reader);
        }
    }
}

/// Read-only view for the dependency phase.
pub struct DepsContext<'a> {
    pub(crate) engine: &'a Engine,
    pub(crate) node: &'a GraphNode,
}

impl DepsContext<'_> {
    pub fn node(&self) -> &GraphNode {
        self.node
    }

    pub fn definition(&self) -> &NodeDefinition {
        &self.node.definition
    }

    pub fn registry(&self) -> &Registry {
        &self.engine.registry
    }

    pub fn supports(&self, definition: &NodeDefinition, op: OpKind) -> bool {
        self.engine.registry.supports(definition.tag(), op)
    }
}

/// Mutable view handed to `run` handlers and lifecycle hooks.
pub struct RunContext<'a> {
    engine: &'a mut Engine,
    slot: Option<SlotId>,
    node: &'a GraphNode,
}

impl<'a> RunContext<'a> {
    pub(crate) fn new(engine: &'a mut Engine, slot: Option<SlotId>, node: &'a GraphNode) -> Self {
        Self { engine, slot, node }
    }

    pub fn node(&self) -> &GraphNode {
        self.node
    }

    pub fn definition(&self) -> &NodeDefinition {
        &self.node.definition
    }

    pub fn registry(&self) -> Rc<Registry> {
        self.engine.registry.clone()
    }

    pub fn supports(&self, node: &GraphNode, op: OpKind) -> bool {
        self.engine.registry.supports(node.tag(), op)
    }

    pub fn is_static(&self, node: &GraphNode) -> bool {
        self.engine.registry.is_static(node.tag())
    }

    fn register_reader(&mut self, node: &GraphNode) {
        if let (Some(slot), Some(instance)) = (self.slot, self.engine.instances.get_mut(node)) {
            instance.readers.insert(slot);
        }
    }

    /// Read this node's state; the running slot is recomputed when it changes.
    pub fn with_state<T: 'static, R>(&mut self, read: impl FnOnce(&T) -> R) -> Result<R, NodeError> {
        let node = self.node;
        self.register_reader(node);
        let state = self
            .engine
            .instances
            .get(node)
            .and_then(|instance| instance.state.as_ref())
            .and_then(|state| state.downcast_ref::<T>())
            .ok_or_else(|| missing_state(node))?;
        Ok(read(state))
    }

    /// Mutate this node's state and mark every other reader for recomputation.
    pub fn update_state<T: 'static, R>(
        &mut self,
        update: impl FnOnce(&mut T) -> R,
    ) -> Result<R, NodeError> {
        let node = self.node;
        self.update_state_of(node, update)
    }

    pub fn update_state_of<T: 'static, R>(
        &mut self,
        node: &GraphNode,
        update: impl FnOnce(&mut T) -> R,
    ) -> Result<R, NodeError> {
        let state = self
            .engine
            .instances
            .get_mut(node)
            .and_then(|instance| instance.state.as_mut())
            .and_then(|state| state.downcast_mut::<T>())
            .ok_or_else(|| missing_state(node))?;
        let result = update(state);
        self.engine.mark_readers(node, self.slot);
        Ok(result)
    }

    /// Latest pushed value (stream item or event payload), if any.
    pub fn source(&mut self) -> Option<NodeDefinition> {
        let node = self.node;
        self.register_reader(node);
        self.engine
            .instances
            .get(node)
            .and_then(|instance| instance.source.clone())
    }

    /// Attach a stream feeding this node's source value. Polled by `Graph::flush`.
    pub fn attach(&mut self, stream: LocalBoxStream<'static, NodeDefinition>) {
        self.engine.streams.push(SourceStream {
            node: self.node.clone(),
            stream,
        });
    }

    /// Drop streams attached to this node and forget its source value.
    pub fn detach(&mut self) {
        let node = self.node;
        self.engine.streams.retain(|source| &source.node != node);
        if let Some(instance) = self.engine.instances.get_mut(node) {
            instance.source = None;
        }
    }

    pub fn lookup(&self, name: &str) -> Result<GraphNode, NodeError> {
        self.engine.scopes.lookup(self.node.context, name)
    }

    /// Child of this node's context.
    pub fn create_context(
        &mut self,
        bindings: BTreeMap<Arc<str>, GraphNode>,
    ) -> Result<ContextId, NodeError> {
        self.engine.scopes.create_context(self.node.context, bindings)
    }

    /// Root node of a child scope minted by this node. Re-entering from the
    /// same node reuses the scope and its cache.
    pub fn child_scope(&mut self, root: NodeDefinition) -> Result<GraphNode, NodeError> {
        let scope = self.engine.scopes.child_scope(self.node, root)?;
        self.engine.scopes.scope_root(scope)
    }

    pub fn scope_root(&self) -> Result<GraphNode, NodeError> {
        self.engine.scopes.scope_root(self.node.scope)
    }

    /// Scope-owned counter.
    pub fn next_id(&mut self) -> Result<u64, NodeError> {
        self.engine
            .scopes
            .next_id(self.node.scope)
            .ok_or(NodeError::StaleHandle)
    }

    pub fn emit_event(&mut self, name: &str, payload: NodeDefinition) {
        let scope = self.node.scope;
        self.engine.emit_event(scope, name, payload);
    }

    /// Receive `name` events of this scope as this node's source value.
    pub fn listen(&mut self, name: &str) {
        let listener = Listener {
            node: self.node.clone(),
            action: ListenerAction::Latest,
        };
        self.engine.scopes.listen(self.node.scope, name, listener);
    }

    /// Invalidate `target` whenever `name` is emitted in this scope.
    pub fn invalidate_on(&mut self, name: &str, target: GraphNode) {
        let listener = Listener {
            node: self.node.clone(),
            action: ListenerAction::Invalidate(target),
        };
        self.engine.scopes.listen(self.node.scope, name, listener);
    }
}

fn missing_state(node: &GraphNode) -> NodeError {
    NodeError::custom(format!("no state for `{}` instance", node.tag()))
}
