//! Scopes and contexts.
//!
//! Both live in arenas and are interned by content: contexts by (scope,
//! parent, bindings), child scopes by (parent scope, minting node). Records
//! hold handles, never ownership, and are torn down by reference count:
//! a context counts the slots and outputs using it, its child contexts and
//! bindings pointing at it; a scope counts its live contexts and child scopes.

use super::slot::SlotKey;
use crate::address::{ContextId, GraphNode, ScopeId};
use crate::arena::{Arena, SlotId};
use crate::error::NodeError;
use crate::node::NodeDefinition;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

pub type Bindings = Rc<BTreeMap<Arc<str>, GraphNode>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenerAction {
    /// Store the payload as the listening node's latest source value.
    Latest,
    /// Force recomputation of a node.
    Invalidate(GraphNode),
}

#[derive(Clone, Debug)]
pub struct Listener {
    pub node: GraphNode,
    pub action: ListenerAction,
}

pub struct ScopeRecord {
    pub parent: Option<ScopeId>,
    pub minted_by: Option<GraphNode>,
    pub root: NodeDefinition,
    pub root_context: ContextId,
    /// Memoization table owned by this scope.
    pub cache: FxHashMap<SlotKey, SlotId>,
    pub listeners: FxHashMap<Arc<str>, Vec<Listener>>,
    pub refs: usize,
    pub next_id: u64,
}

pub struct ContextRecord {
    pub scope: ScopeId,
    pub parent: Option<ContextId>,
    pub bindings: Bindings,
    pub refs: usize,
}

type ContextKey = (ScopeId, ContextId, Bindings);

pub struct Scopes {
    scopes: Arena<ScopeRecord>,
    contexts: Arena<ContextRecord>,
    context_index: FxHashMap<ContextKey, ContextId>,
    scope_index: FxHashMap<(ScopeId, GraphNode), ScopeId>,
    root: ScopeId,
    root_context: ContextId,
    released: Vec<ContextId>,
    new_contexts: Vec<ContextId>,
    new_scopes: Vec<ScopeId>,
}

impl Scopes {
    pub fn new(root: NodeDefinition) -> Self {
        let mut scopes = Arena::new();
        let mut contexts = Arena::new();
        let placeholder = SlotId {
            index: u32::MAX,
            generation: 0,
        };
        let scope = ScopeId(scopes.alloc(ScopeRecord::new(None, None, root, ContextId(placeholder))));
        let context = ContextId(contexts.alloc(ContextRecord {
            scope,
            parent: None,
            bindings: Rc::default(),
            refs: 0,
        }));
        if let Some(record) = scopes.get_mut(scope.0) {
            record.root_context = context;
            // The root scope is pinned for the lifetime of the graph.
            record.refs = 1;
        }
        Self {
            scopes,
            contexts,
            context_index: FxHashMap::default(),
            scope_index: FxHashMap::default(),
            root: scope,
            root_context: context,
            released: Vec::new(),
            new_contexts: Vec::new(),
            new_scopes: Vec::new(),
        }
    }

    pub fn root(&self) -> ScopeId {
        self.root
    }

    pub fn root_context(&self) -> ContextId {
        self.root_context
    }

    pub fn scope(&self, id: ScopeId) -> Option<&ScopeRecord> {
        self.scopes.get(id.0)
    }

    pub fn scope_mut(&mut self, id: ScopeId) -> Option<&mut ScopeRecord> {
        self.scopes.get_mut(id.0)
    }

    pub fn context(&self, id: ContextId) -> Option<&ContextRecord> {
        self.contexts.get(id.0)
    }

    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// The scope's root node in its root context.
    pub fn scope_root(&self, id: ScopeId) -> Result<GraphNode, NodeError> {
        let record = self.scope(id).ok_or(NodeError::StaleHandle)?;
        Ok(GraphNode::create(record.root.clone(), id, record.root_context))
    }

    /// A node handle is usable when its context is live and belongs to its scope.
    pub fn is_live(&self, node: &GraphNode) -> bool {
        self.scope(node.scope).is_some()
            && self
                .context(node.context)
                .is_some_and(|context| context.scope == node.scope)
    }

    /// Child context of `parent`. Every binding must belong to the parent's scope.
    pub fn create_context(
        &mut self,
        parent: ContextId,
        bindings: BTreeMap<Arc<str>, GraphNode>,
    ) -> Result<ContextId, NodeError> {
        let scope = self.context(parent).ok_or(NodeError::StaleHandle)?.scope;
        if let Some((name, _)) = bindings.iter().find(|(_, node)| node.scope != scope) {
            return Err(NodeError::ForeignBinding(name.clone()));
        }
        if bindings.is_empty() {
            return Ok(parent);
        }
        let bindings: Bindings = Rc::new(bindings);
        let key = (scope, parent, bindings.clone());
        if let Some(&id) = self.context_index.get(&key) {
            return Ok(id);
        }
        let id = ContextId(self.contexts.alloc(ContextRecord {
            scope,
            parent: Some(parent),
            bindings: bindings.clone(),
            refs: 0,
        }));
        self.context_index.insert(key, id);
        self.acquire_context(parent);
        for node in bindings.values() {
            self.acquire_context(node.context);
        }
        self.new_contexts.push(id);
        Ok(id)
    }

    /// Child scope minted by `minted_by`, rooted at `root`. Re-minting from the
    /// same node returns the same scope.
    pub fn child_scope(
        &mut self,
        minted_by: &GraphNode,
        root: NodeDefinition,
    ) -> Result<ScopeId, NodeError> {
        let parent = minted_by.scope;
        if self.scope(parent).is_none() {
            return Err(NodeError::StaleHandle);
        }
        let key = (parent, minted_by.clone());
        if let Some(&id) = self.scope_index.get(&key) {
            if self.scope(id).is_some_and(|record| record.root == root) {
                return Ok(id);
            }
        }
        let placeholder = ContextId(SlotId {
            index: u32::MAX,
            generation: 0,
        });
        let scope = ScopeId(self.scopes.alloc(ScopeRecord::new(
            Some(parent),
            Some(minted_by.clone()),
            root,
            placeholder,
        )));
        let context = ContextId(self.contexts.alloc(ContextRecord {
            scope,
            parent: None,
            bindings: Rc::default(),
            refs: 0,
        }));
        if let Some(record) = self.scope_mut(scope) {
            record.root_context = context;
        }
        self.scope_index.insert(key, scope);
        self.acquire_scope(parent);
        self.new_scopes.push(scope);
        log::debug!("scope {:?} minted by {:?}", scope, minted_by);
        Ok(scope)
    }

    /// Walk the context chain. Lookups stop at the scope's root context and
    /// never continue into another scope.
    pub fn lookup(&self, context: ContextId, name: &str) -> Result<GraphNode, NodeError> {
        let record = self.context(context).ok_or(NodeError::StaleHandle)?;
        let scope = record.scope;
        let mut current = Some(context);
        while let Some(id) = current {
            let Some(record) = self.context(id) else {
                return Err(NodeError::StaleHandle);
            };
            if record.scope != scope {
                break;
            }
            if let Some(node) = record.bindings.get(name) {
                return Ok(node.clone());
            }
            current = record.parent;
        }
        Err(NodeError::NameNotFound(name.into()))
    }

    pub fn next_id(&mut self, scope: ScopeId) -> Option<u64> {
        let record = self.scope_mut(scope)?;
        record.next_id += 1;
        Some(record.next_id)
    }

    pub fn listen(&mut self, scope: ScopeId, name: &str, listener: Listener) {
        if let Some(record) = self.scope_mut(scope) {
            record
                .listeners
                .entry(Arc::from(name))
                .or_default()
                .push(listener);
        }
    }

    pub fn unlisten(&mut self, node: &GraphNode) {
        if let Some(record) = self.scope_mut(node.scope) {
            for listeners in record.listeners.values_mut() {
                listeners.retain(|listener| &listener.node != node);
            }
            record.listeners.retain(|_, listeners| !listeners.is_empty());
        }
    }

    pub fn listeners(&self, scope: ScopeId, name: &str) -> Vec<Listener> {
        self.scope(scope)
            .and_then(|record| record.listeners.get(name))
            .cloned()
            .unwrap_or_default()
    }

    pub fn acquire_context(&mut self, id: ContextId) {
        let Some(record) = self.contexts.get_mut(id.0) else {
            return;
        };
        record.refs += 1;
        if record.refs == 1 {
            let scope = record.scope;
            self.acquire_scope(scope);
        }
    }

    /// Releases are applied by `collect`, never while a refresh is running.
    pub fn release_context(&mut self, id: ContextId) {
        self.released.push(id);
    }

    fn acquire_scope(&mut self, id: ScopeId) {
        if let Some(record) = self.scope_mut(id) {
            record.refs += 1;
        }
    }

    /// Apply deferred releases and free everything that reached zero.
    pub fn collect(&mut self) {
        let mut scopes_to_release = Vec::new();
        let mut contexts_to_free = Vec::new();
        let mut released = std::mem::take(&mut self.released);
        while !released.is_empty() || !contexts_to_free.is_empty() || !scopes_to_release.is_empty() {
            while let Some(id) = released.pop() {
                let Some(record) = self.contexts.get_mut(id.0) else {
                    continue;
                };
                record.refs = record.refs.saturating_sub(1);
                if record.refs == 0 {
                    scopes_to_release.push(record.scope);
                    if record.parent.is_some() {
                        contexts_to_free.push(id);
                    }
                }
            }
            while let Some(id) = contexts_to_free.pop() {
                if let Some(freed) = self.free_context(id) {
                    released.extend(freed);
                }
            }
            while let Some(id) = scopes_to_release.pop() {
                self.release_scope(id);
            }
        }

        // Contexts and scopes created but never used.
        for id in std::mem::take(&mut self.new_contexts) {
            if self.context(id).is_some_and(|record| record.refs == 0) {
                for context in self.free_context(id).unwrap_or_default() {
                    self.release_context(context);
                }
            }
        }
        for id in std::mem::take(&mut self.new_scopes) {
            if self.scope(id).is_some_and(|record| record.refs == 0) {
                if let Some(parent) = self.free_scope(id) {
                    self.release_scope(parent);
                }
            }
        }
        if !self.released.is_empty() {
            self.collect();
        }
    }

    /// Drop one reference; scopes reaching zero are freed along with the
    /// references they held on their parents.
    fn release_scope(&mut self, id: ScopeId) {
        let mut current = Some(id);
        while let Some(id) = current.take() {
            let Some(record) = self.scope_mut(id) else {
                break;
            };
            record.refs = record.refs.saturating_sub(1);
            if record.refs == 0 {
                current = self.free_scope(id);
            }
        }
    }

    /// Free a non-root context; returns the contexts it held.
    fn free_context(&mut self, id: ContextId) -> Option<Vec<ContextId>> {
        let record = self.contexts.get(id.0)?;
        if record.refs > 0 {
            return None;
        }
        let record = self.contexts.free(id.0)?;
        let parent = record.parent?;
        self.context_index
            .remove(&(record.scope, parent, record.bindings.clone()));
        let mut held = vec![parent];
        held.extend(record.bindings.values().map(|node| node.context));
        Some(held)
    }

    /// Free a scope and its root context; returns the parent scope to release.
    fn free_scope(&mut self, id: ScopeId) -> Option<ScopeId> {
        if id == self.root {
            return None;
        }
        let record = self.scopes.free(id.0)?;
        self.contexts.free(record.root_context.0);
        if let (Some(parent), Some(minted_by)) = (record.parent, record.minted_by) {
            if self.scope_index.get(&(parent, minted_by.clone())) == Some(&id) {
                self.scope_index.remove(&(parent, minted_by));
            }
        }
        log::debug!("scope {:?} freed", id);
        record.parent
    }
}

impl ScopeRecord {
    fn new(
        parent: Option<ScopeId>,
        minted_by: Option<GraphNode>,
        root: NodeDefinition,
        root_context: ContextId,
    ) -> Self {
        Self {
            parent,
            minted_by,
            root,
            root_context,
            cache: FxHashMap::default(),
            listeners: FxHashMap::default(),
            refs: 0,
            next_id: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::data;
    use crate::value::Value;

    fn bind(name: &str, node: GraphNode) -> BTreeMap<Arc<str>, GraphNode> {
        BTreeMap::from([(Arc::from(name), node)])
    }

    #[test]
    fn lookup_walks_parent_chain() {
        let mut scopes = Scopes::new(data::nil());
        let root = scopes.scope_root(scopes.root()).unwrap();
        let x = root.with_scope_from(data::value(Value::number(1.0)));
        let outer = scopes.create_context(root.context, bind("x", x.clone())).unwrap();
        let y = root.with_scope_from(data::value(Value::number(2.0)));
        let inner = scopes.create_context(outer, bind("y", y)).unwrap();
        assert_eq!(scopes.lookup(inner, "x").unwrap(), x);
        assert!(matches!(
            scopes.lookup(inner, "z"),
            Err(NodeError::NameNotFound(_))
        ));
    }

    #[test]
    fn contexts_are_interned() {
        let mut scopes = Scopes::new(data::nil());
        let root = scopes.scope_root(scopes.root()).unwrap();
        let x = root.with_scope_from(data::nil());
        let a = scopes.create_context(root.context, bind("x", x.clone())).unwrap();
        let b = scopes.create_context(root.context, bind("x", x)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn foreign_bindings_fail_closed() {
        let mut scopes = Scopes::new(data::nil());
        let root = scopes.scope_root(scopes.root()).unwrap();
        let child = scopes.child_scope(&root, data::nil()).unwrap();
        let child_root = scopes.scope_root(child).unwrap();
        let err = scopes
            .create_context(child_root.context, bind("leak", root.clone()))
            .unwrap_err();
        assert!(matches!(err, NodeError::ForeignBinding(_)));

        // Outer bindings are invisible from the child scope.
        let outer = scopes.create_context(root.context, bind("x", root.clone())).unwrap();
        assert!(scopes.lookup(outer, "x").is_ok());
        assert!(scopes.lookup(child_root.context, "x").is_err());
    }

    #[test]
    fn unused_context_and_scope_are_collected() {
        let mut scopes = Scopes::new(data::nil());
        let root = scopes.scope_root(scopes.root()).unwrap();
        let ctx = scopes
            .create_context(root.context, bind("x", root.clone()))
            .unwrap();
        let child = scopes.child_scope(&root, data::nil()).unwrap();
        scopes.collect();
        assert!(scopes.context(ctx).is_none());
        assert!(scopes.scope(child).is_none());
        assert_eq!(scopes.scope_count(), 1);
        assert_eq!(scopes.context_count(), 1);
    }

    #[test]
    fn released_context_frees_scope() {
        let mut scopes = Scopes::new(data::nil());
        let root = scopes.scope_root(scopes.root()).unwrap();
        let child = scopes.child_scope(&root, data::nil()).unwrap();
        let child_root = scopes.scope_root(child).unwrap();
        scopes.acquire_context(child_root.context);
        scopes.collect();
        assert!(scopes.scope(child).is_some());

        scopes.release_context(child_root.context);
        scopes.collect();
        assert!(scopes.scope(child).is_none());
    }
}
