//! The evaluation kernel.
//!
//! Slots memoize (node, operation) results per scope. Changes are pushed:
//! a changed input marks its slot dirty and every transitive dependent
//! stale, queueing subscribed roots. Values are pulled: `stabilize` refreshes
//! each queued root with an explicit stack, verifying stale slots against
//! the revisions they read and recomputing only where an input really changed.

mod edges;
mod lifecycle;
mod resolve;
mod scope;
mod slot;

pub use lifecycle::{DepsContext, RunContext};

use crate::address::GraphNode;
use crate::arena::{Arena, SlotId};
use crate::config::GraphConfig;
use crate::error::NodeError;
use crate::node::NodeDefinition;
use crate::operation::Operation;
use crate::registry::Registry;
use edges::Edges;
use futures_channel::mpsc;
use lifecycle::{Instance, SourceStream};
use rustc_hash::{FxHashMap, FxHashSet};
use scope::{ListenerAction, Scopes};
use slot::{Revision, Slot, Status};
use std::rc::Rc;

struct Subscriber {
    id: u64,
    sender: mpsc::UnboundedSender<NodeDefinition>,
    last: Option<NodeDefinition>,
}

/// Counters exposed for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStats {
    pub slots: usize,
    pub instances: usize,
    pub scopes: usize,
    pub contexts: usize,
    pub streams: usize,
}

pub(crate) struct Engine {
    pub(crate) registry: Rc<Registry>,
    pub(crate) config: GraphConfig,
    slots: Arena<Slot>,
    edges: Edges,
    pub(crate) scopes: Scopes,
    instances: FxHashMap<GraphNode, Instance>,
    pub(crate) streams: Vec<SourceStream>,
    revision: Revision,
    pending_roots: Vec<SlotId>,
    queued: FxHashSet<SlotId>,
    orphans: Vec<SlotId>,
    subscribers: FxHashMap<SlotId, Vec<Subscriber>>,
    next_subscriber: u64,
    /// Computations started per slot in the current stabilization.
    computes: FxHashMap<SlotId, usize>,
}

impl Engine {
    pub(crate) fn new(registry: Rc<Registry>, root: NodeDefinition, config: GraphConfig) -> Self {
        Self {
            registry,
            config,
            slots: Arena::new(),
            edges: Edges::new(),
            scopes: Scopes::new(root),
            instances: FxHashMap::default(),
            streams: Vec::new(),
            revision: Revision(1),
            pending_roots: Vec::new(),
            queued: FxHashSet::default(),
            orphans: Vec::new(),
            subscribers: FxHashMap::default(),
            next_subscriber: 0,
            computes: FxHashMap::default(),
        }
    }

    /// Node in the root scope and root context.
    pub(crate) fn root_node(&self, definition: NodeDefinition) -> GraphNode {
        GraphNode::create(definition, self.scopes.root(), self.scopes.root_context())
    }

    pub(crate) fn stats(&self) -> EngineStats {
        EngineStats {
            slots: self.slots.len(),
            instances: self.instances.len(),
            scopes: self.scopes.scope_count(),
            contexts: self.scopes.context_count(),
            streams: self.streams.len(),
        }
    }

    /// Hold `operation` on `node` for a host subscriber.
    pub(crate) fn subscribe(
        &mut self,
        node: GraphNode,
        operation: Operation,
    ) -> Result<(SlotId, u64, mpsc::UnboundedReceiver<NodeDefinition>), NodeError> {
        let slot = self.slot_for(node, operation)?;
        let (sender, receiver) = mpsc::unbounded();
        self.next_subscriber += 1;
        let id = self.next_subscriber;
        if let Some(record) = self.slots.get_mut(slot) {
            record.external += 1;
        }
        self.subscribers.entry(slot).or_default().push(Subscriber {
            id,
            sender,
            last: None,
        });
        self.queue_root(slot);
        log::debug!("subscriber {id} added on slot {:?}", slot);
        Ok((slot, id, receiver))
    }

    pub(crate) fn release(&mut self, slot: SlotId, subscriber: u64) {
        let Some(subscribers) = self.subscribers.get_mut(&slot) else {
            return;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.id != subscriber);
        if subscribers.len() == before {
            return;
        }
        if let Some(record) = self.slots.get_mut(slot) {
            record.external = record.external.saturating_sub(1);
        }
        self.orphans.push(slot);
        log::debug!("subscriber {subscriber} released slot {:?}", slot);
        if self.config.sweep_on_release {
            self.sweep();
        }
    }

    fn queue_root(&mut self, slot: SlotId) {
        if self.queued.insert(slot) {
            self.pending_roots.push(slot);
        }
    }

    /// Whether `node` has live per-instance state.
    pub(crate) fn has_instance(&self, node: &GraphNode) -> bool {
        self.instances.contains_key(node)
    }

    pub(crate) fn has_pending_work(&self) -> bool {
        !self.pending_roots.is_empty()
    }

    /// A direct input of `slot` changed: force recomputation and mark every
    /// transitive dependent stale.
    pub(crate) fn mark_dirty(&mut self, slot: SlotId) {
        let Some(record) = self.slots.get_mut(slot) else {
            return;
        };
        if record.is_sealed() {
            return;
        }
        self.revision = self.revision.next();
        if record.status != Status::Uncomputed {
            record.status = Status::Dirty;
        }
        record.progress = None;
        let external = record.external > 0;
        if external {
            self.queue_root(slot);
        }
        let mut work = vec![slot];
        while let Some(current) = work.pop() {
            let dependents: Vec<SlotId> = self.edges.dependents(current).to_vec();
            for dependent in dependents {
                let Some(record) = self.slots.get_mut(dependent) else {
                    continue;
                };
                if record.status != Status::Fresh || record.is_sealed() {
                    continue;
                }
                record.status = Status::Stale;
                if record.external > 0 {
                    self.queue_root(dependent);
                }
                work.push(dependent);
            }
        }
    }

    /// Force every slot of `node` to recompute, running its `on_invalidate` hook first.
    pub(crate) fn invalidate(&mut self, node: &GraphNode) {
        self.invalidate_instance(node);
        let slots: Vec<SlotId> = self
            .scopes
            .scope(node.scope)
            .map(|record| {
                record
                    .cache
                    .iter()
                    .filter(|(key, _)| &key.node == node)
                    .map(|(_, id)| *id)
                    .collect()
            })
            .unwrap_or_default();
        log::debug!("invalidate {:?}: {} slots", node, slots.len());
        for slot in slots {
            self.mark_dirty(slot);
        }
    }

    pub(crate) fn emit_event(
        &mut self,
        scope: crate::address::ScopeId,
        name: &str,
        payload: NodeDefinition,
    ) {
        let listeners = self.scopes.listeners(scope, name);
        log::debug!("event `{name}` to {} listeners", listeners.len());
        for listener in listeners {
            match listener.action {
                ListenerAction::Latest => {
                    self.push_source(&listener.node, payload.clone());
                }
                ListenerAction::Invalidate(target) => self.invalidate(&target),
            }
        }
    }

    /// Refresh queued roots to a fixed point, notify subscribers, then sweep.
    pub(crate) fn stabilize(&mut self) {
        self.computes.clear();
        loop {
            let roots = std::mem::take(&mut self.pending_roots);
            self.queued.clear();
            if roots.is_empty() {
                break;
            }
            for root in roots {
                if !self.slots.is_valid(root) {
                    continue;
                }
                self.refresh(root);
                self.notify(root);
            }
        }
        self.sweep();
    }

    fn notify(&mut self, root: SlotId) {
        let Some(record) = self.slots.get(root) else {
            return;
        };
        if !record.is_fresh() {
            self.queue_root(root);
            return;
        }
        let Some(output) = record.output.as_ref() else {
            return;
        };
        let definition = output.definition.clone();
        let Some(subscribers) = self.subscribers.get_mut(&root) else {
            return;
        };
        for subscriber in subscribers.iter_mut() {
            if subscriber.last.as_ref() == Some(&definition) {
                continue;
            }
            subscriber.last = Some(definition.clone());
            if subscriber.sender.unbounded_send(definition.clone()).is_err() {
                log::warn!("subscriber {} channel closed", subscriber.id);
            }
        }
    }

    /// Free slots nobody reads, then the instances, contexts and scopes they held.
    pub(crate) fn sweep(&mut self) {
        let mut freed = 0usize;
        while let Some(id) = self.orphans.pop() {
            let Some(record) = self.slots.get(id) else {
                continue;
            };
            if record.external > 0 || self.edges.has_dependents(id) {
                continue;
            }
            let Some(record) = self.slots.free(id) else {
                continue;
            };
            freed += 1;
            if let Some(scope) = self.scopes.scope_mut(record.key.node.scope) {
                scope.cache.remove(&record.key);
            }
            for read in &record.reads {
                self.edges.remove(read.slot, id);
                self.orphans.push(read.slot);
            }
            if let Some(progress) = &record.progress {
                self.orphans.extend(progress.reads.iter().map(|read| read.slot));
                self.orphans.extend(progress.continuation);
            }
            self.edges.remove_slot(id);
            self.subscribers.remove(&id);
            self.scopes.release_context(record.key.node.context);
            if let Some(output) = &record.output {
                self.scopes.release_context(output.context);
            }
            self.detach_instance(&record.key.node);
        }
        self.scopes.collect();
        if freed > 0 {
            log::trace!("sweep freed {freed} slots");
        }
    }
}
