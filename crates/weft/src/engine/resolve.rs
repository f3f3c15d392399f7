//! Dependency resolution.
//!
//! Resolving an operation runs the handler's dependency phase, walks every
//! dependency (logically concurrently) until its `until` predicate holds,
//! then runs the handler. Each hop of a walk is itself a memoized slot, so a
//! blocked walk records the slot it needs, the refresh loop computes that
//! slot, and the walk resumes where it stopped. Handlers returning another
//! node are followed by the consumer's next hop rather than by recursion,
//! which keeps native stack depth constant regardless of graph depth.

use super::slot::{
    dedup_reads, record_read, Phase, Plan, Progress, Read, Reads, Slot, SlotKey, Status, Walk,
};
use super::{DepsContext, Engine, RunContext};
use crate::address::GraphNode;
use crate::arena::SlotId;
use crate::dependency::{NodeDependency, Target, Until};
use crate::error::NodeError;
use crate::nodes::data;
use crate::operation::{OpKind, Operation};
use crate::registry::Outcome;
use rustc_hash::FxHashSet;
use smallvec::{smallvec, SmallVec};

pub(super) enum Step {
    Done,
    Continue,
    Need(SmallVec<[SlotId; 4]>),
}

enum Advance {
    Ready(GraphNode),
    Blocked(SlotId),
}

enum Begin {
    Ready(Progress),
    Finished(GraphNode),
}

fn error_node(node: &GraphNode, error: NodeError) -> GraphNode {
    node.with_scope_from(data::error(error.into_value()))
}

impl Progress {
    fn new(node: &GraphNode, deps: Vec<NodeDependency>, plan: Plan) -> Self {
        let walks = deps
            .iter()
            .map(|dep| Walk {
                current: match &dep.target {
                    Target::Definition(definition) => node.with_scope_from(definition.clone()),
                    Target::Node(target) => target.clone(),
                },
                phase: if dep.operation == Operation::Evaluate {
                    Phase::Until
                } else {
                    Phase::Seek
                },
                hops: 0,
                loops: 0,
                result: None,
            })
            .collect();
        Self {
            deps,
            walks,
            reads: Reads::new(),
            plan,
            continuation: None,
        }
    }
}

impl Engine {
    /// The slot memoizing `operation` on `node`, created on first use.
    pub(crate) fn slot_for(
        &mut self,
        node: GraphNode,
        operation: Operation,
    ) -> Result<SlotId, NodeError> {
        if !self.scopes.is_live(&node) {
            return Err(NodeError::StaleHandle);
        }
        let key = SlotKey { node, operation };
        if let Some(&id) = self
            .scopes
            .scope(key.node.scope)
            .and_then(|scope| scope.cache.get(&key))
        {
            return Ok(id);
        }
        let once = key.operation.is_mutation()
            || self
                .registry
                .get(key.node.tag())
                .is_some_and(|ty| ty.is_one_shot());
        let node = key.node.clone();
        let id = self.slots.alloc(Slot::new(key.clone(), once));
        log::trace!("slot {:?} created for {} on {:?}", id, key.operation.name(), node);
        if let Some(scope) = self.scopes.scope_mut(node.scope) {
            scope.cache.insert(key, id);
        }
        self.scopes.acquire_context(node.context);
        self.orphans.push(id);
        self.attach_instance(&node, id);
        Ok(id)
    }

    /// Bring `root` up to date. Uses an explicit stack; slots needed by the
    /// top of the stack are pushed above it.
    pub(super) fn refresh(&mut self, root: SlotId) {
        let mut stack: Vec<SlotId> = vec![root];
        let mut on_stack: FxHashSet<SlotId> = FxHashSet::default();
        on_stack.insert(root);
        while let Some(&top) = stack.last() {
            match self.step(top) {
                Step::Done => {
                    stack.pop();
                    on_stack.remove(&top);
                }
                Step::Continue => {}
                Step::Need(needs) => {
                    // One need at a time keeps the stack a single dependency path,
                    // so a need already on it is a real cycle.
                    let Some(&need) = needs.first() else {
                        continue;
                    };
                    if on_stack.contains(&need) {
                        let label = self
                            .slots
                            .get(need)
                            .map(|slot| format!("{:?} {}", slot.key.node, slot.key.operation.name()))
                            .unwrap_or_default();
                        self.fail(top, NodeError::Cycle(label));
                        continue;
                    }
                    if stack.len() >= self.config.depth_limit {
                        self.fail(top, NodeError::StepLimit(self.config.depth_limit));
                        continue;
                    }
                    on_stack.insert(need);
                    stack.push(need);
                }
            }
        }
    }

    fn step(&mut self, id: SlotId) -> Step {
        let Some(slot) = self.slots.get(id) else {
            return Step::Done;
        };
        match slot.status {
            Status::Fresh => Step::Done,
            Status::Stale => self.verify(id),
            Status::Dirty | Status::Uncomputed => self.attempt(id),
        }
    }

    /// A stale slot is fresh again if every read still has the revision it saw.
    fn verify(&mut self, id: SlotId) -> Step {
        let Some(slot) = self.slots.get(id) else {
            return Step::Done;
        };
        let reads = slot.reads.clone();
        let mut changed = false;
        for read in &reads {
            match self.slots.get(read.slot) {
                Some(dep) if dep.status != Status::Fresh => return Step::Need(smallvec![read.slot]),
                Some(dep) if dep.changed_at == read.seen => {}
                _ => {
                    changed = true;
                    break;
                }
            }
        }
        let revision = self.revision;
        if let Some(slot) = self.slots.get_mut(id) {
            if changed {
                slot.status = Status::Dirty;
            } else {
                slot.status = Status::Fresh;
                slot.verified_at = revision;
            }
        }
        Step::Continue
    }

    fn attempt(&mut self, id: SlotId) -> Step {
        let Some(slot) = self.slots.get_mut(id) else {
            return Step::Done;
        };
        let key = slot.key.clone();
        let mut progress = match slot.progress.take() {
            Some(progress) => progress,
            None if self.over_budget(id) => {
                self.fail(id, NodeError::StepLimit(self.config.step_limit));
                return Step::Continue;
            }
            None => match self.begin(&key) {
                Ok(Begin::Ready(progress)) => {
                    log::trace!("compute {} on {:?}", key.operation.name(), key.node);
                    progress
                }
                Ok(Begin::Finished(output)) => {
                    self.finish(id, output, Reads::new());
                    return Step::Continue;
                }
                Err(error) => {
                    self.finish(id, error_node(&key.node, error), Reads::new());
                    return Step::Continue;
                }
            },
        };

        let mut needs: SmallVec<[SlotId; 4]> = SmallVec::new();
        for index in 0..progress.walks.len() {
            if progress.walks[index].result.is_some() {
                continue;
            }
            let dep = &progress.deps[index];
            let walk = &mut progress.walks[index];
            match self.advance(&key, dep, walk, &mut progress.reads) {
                Advance::Ready(node) => walk.result = Some(node),
                Advance::Blocked(slot) => needs.push(slot),
            }
        }
        if !needs.is_empty() {
            self.park(id, progress);
            return Step::Need(needs);
        }

        let results: Vec<GraphNode> = progress
            .walks
            .iter()
            .filter_map(|walk| walk.result.clone())
            .collect();
        for (dep, result) in progress.deps.iter().zip(&results) {
            let definition = &result.definition;
            if (definition.is_error() && !dep.allow_errors)
                || (definition.is_pending() && !dep.allow_pending)
            {
                self.finish(id, result.clone(), progress.reads);
                return Step::Continue;
            }
        }

        let run = match progress.plan {
            Plan::Forward => {
                let output = results
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| key.node.with_scope_from(data::nil()));
                self.finish(id, output, progress.reads);
                return Step::Continue;
            }
            Plan::Run(run) => run,
        };

        if progress.continuation.is_none() {
            let outcome = {
                let mut cx = RunContext::new(self, Some(id), &key.node);
                run(&mut cx, &key.operation, &results)
            };
            match outcome {
                Ok(Outcome::Done(definition)) => {
                    self.finish(id, key.node.with_scope_from(definition), progress.reads);
                    return Step::Continue;
                }
                Ok(Outcome::Node(node)) => {
                    self.finish(id, node, progress.reads);
                    return Step::Continue;
                }
                Ok(Outcome::Delegate(target, operation)) => match self.slot_for(target, operation) {
                    Ok(slot) => progress.continuation = Some(slot),
                    Err(error) => {
                        self.finish(id, error_node(&key.node, error), progress.reads);
                        return Step::Continue;
                    }
                },
                Err(error) => {
                    self.finish(id, error_node(&key.node, error), progress.reads);
                    return Step::Continue;
                }
            }
        }

        let Some(continuation) = progress.continuation else {
            return Step::Continue;
        };
        match self.slots.get(continuation) {
            Some(target) if target.is_fresh() => {
                let output = target.output.clone();
                let seen = target.changed_at;
                record_read(
                    &mut progress.reads,
                    Read {
                        slot: continuation,
                        seen,
                    },
                );
                let output = output.unwrap_or_else(|| key.node.with_scope_from(data::nil()));
                self.finish(id, output, progress.reads);
                Step::Continue
            }
            Some(_) => {
                self.park(id, progress);
                Step::Need(smallvec![continuation])
            }
            None => {
                self.finish(id, error_node(&key.node, NodeError::StaleHandle), progress.reads);
                Step::Continue
            }
        }
    }

    /// Count a fresh computation of `id`; true once it went past the step limit.
    fn over_budget(&mut self, id: SlotId) -> bool {
        let computes = self.computes.entry(id).or_default();
        *computes += 1;
        *computes > self.config.step_limit
    }

    fn park(&mut self, id: SlotId, progress: Progress) {
        if let Some(slot) = self.slots.get_mut(id) {
            slot.progress = Some(progress);
        }
    }

    fn begin(&self, key: &SlotKey) -> Result<Begin, NodeError> {
        let ty = self.registry.validate(&key.node.definition)?;
        let kind = key.operation.kind();
        if kind == OpKind::Resolve && !ty.supports(OpKind::Resolve) {
            let resolved = key
                .node
                .with_scope_from(data::resolved(key.node.definition.clone()));
            let dep = NodeDependency::node(resolved).tolerant(true, true);
            return Ok(Begin::Ready(Progress::new(&key.node, vec![dep], Plan::Forward)));
        }
        let Some(handler) = ty.handler_for(kind) else {
            if kind == OpKind::Evaluate {
                return Ok(Begin::Finished(key.node.clone()));
            }
            return Err(NodeError::UnsupportedOperation {
                tag: key.node.tag().into(),
                operation: kind.name(),
            });
        };
        let deps = match handler.deps {
            Some(deps) => {
                let cx = DepsContext {
                    engine: self,
                    node: &key.node,
                };
                deps(&cx, &key.operation)?
            }
            None => Vec::new(),
        };
        Ok(Begin::Ready(Progress::new(&key.node, deps, Plan::Run(handler.run))))
    }

    fn is_static(&self, node: &GraphNode) -> bool {
        self.registry.is_static(node.tag())
    }

    fn supports(&self, node: &GraphNode, op: OpKind) -> bool {
        op == OpKind::Resolve || self.registry.supports(node.tag(), op)
    }

    fn holds(&self, until: &Until, walk: &Walk) -> bool {
        let node = &walk.current;
        match until {
            Until::Any => walk.hops > 0 || self.is_static(node),
            Until::Static => self.is_static(node),
            Until::Supports(op) => self.supports(node, *op),
            Until::SupportsOrStatic(op) => self.supports(node, *op) || self.is_static(node),
            Until::Tag(tag) => node.tag() == *tag,
        }
    }

    fn mismatch(&self, key: &SlotKey, expected: String, node: &GraphNode) -> GraphNode {
        let received = node
            .definition
            .to_value()
            .map(|value| format!("`{}` ({})", node.tag(), value.kind()))
            .unwrap_or_else(|| format!("`{}`", node.tag()));
        error_node(node, NodeError::mismatch(key.operation.name(), expected, received))
    }

    /// Move one dependency walk forward as far as fresh slots allow.
    fn advance(
        &mut self,
        key: &SlotKey,
        dep: &NodeDependency,
        walk: &mut Walk,
        reads: &mut Reads,
    ) -> Advance {
        let op = dep.operation.kind();
        loop {
            if walk.hops - walk.loops > self.config.hop_limit {
                return Advance::Ready(error_node(
                    &walk.current,
                    NodeError::StepLimit(self.config.hop_limit),
                ));
            }
            if walk.loops > self.config.loop_limit {
                return Advance::Ready(error_node(
                    &walk.current,
                    NodeError::StepLimit(self.config.loop_limit),
                ));
            }
            let definition = &walk.current.definition;
            match walk.phase {
                Phase::Seek => {
                    if self.supports(&walk.current, op) {
                        walk.phase = Phase::Apply;
                        continue;
                    }
                    if definition.is_error() || definition.is_pending() {
                        return Advance::Ready(walk.current.clone());
                    }
                    if self.is_static(&walk.current) {
                        let expected = format!("a node supporting `{op}`");
                        return Advance::Ready(self.mismatch(key, expected, &walk.current));
                    }
                    if let Some(blocked) = self.hop(walk, Operation::Evaluate, reads) {
                        return Advance::Blocked(blocked);
                    }
                }
                Phase::Apply => {
                    if let Some(blocked) = self.hop(walk, dep.operation.clone(), reads) {
                        return Advance::Blocked(blocked);
                    }
                    walk.phase = Phase::Until;
                }
                Phase::Until => {
                    if definition.is_error() || definition.is_pending() {
                        return Advance::Ready(walk.current.clone());
                    }
                    if self.holds(&dep.until, walk) {
                        return Advance::Ready(walk.current.clone());
                    }
                    if self.is_static(&walk.current) {
                        let expected = dep.until.describe();
                        return Advance::Ready(self.mismatch(key, expected, &walk.current));
                    }
                    if let Some(blocked) = self.hop(walk, Operation::Evaluate, reads) {
                        return Advance::Blocked(blocked);
                    }
                }
            }
        }
    }

    /// Apply `operation` to the walk's current node through its slot.
    /// Returns the slot when it still has to be computed.
    fn hop(&mut self, walk: &mut Walk, operation: Operation, reads: &mut Reads) -> Option<SlotId> {
        let id = match self.slot_for(walk.current.clone(), operation) {
            Ok(id) => id,
            Err(error) => {
                walk.current = error_node(&walk.current, error);
                return None;
            }
        };
        let slot = self.slots.get(id)?;
        if !slot.is_fresh() {
            return Some(id);
        }
        let output = slot.output.clone()?;
        record_read(
            reads,
            Read {
                slot: id,
                seen: slot.changed_at,
            },
        );
        if self.registry.is_continuation(walk.current.tag()) {
            walk.loops += 1;
        }
        walk.current = output;
        walk.hops += 1;
        None
    }

    /// Store a computed output, bump `changed_at` only when it differs, and
    /// rewire dependency edges.
    fn finish(&mut self, id: SlotId, output: GraphNode, mut reads: Reads) {
        dedup_reads(&mut reads);
        let revision = self.revision;
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        let context = output.context;
        let previous = slot.output.replace(output);
        let changed = previous.as_ref() != slot.output.as_ref();
        if changed {
            slot.changed_at = revision;
        }
        slot.verified_at = revision;
        slot.status = Status::Fresh;
        slot.progress = None;
        let sealed = slot.is_sealed();
        let old_reads = std::mem::replace(&mut slot.reads, reads.clone());

        self.scopes.acquire_context(context);
        if let Some(previous) = previous {
            self.scopes.release_context(previous.context);
        }
        for read in &old_reads {
            self.edges.remove(read.slot, id);
            self.orphans.push(read.slot);
        }
        for read in &reads {
            self.edges.add(read.slot, id);
        }
        // An input that moved while this slot was computing leaves it stale.
        let outdated = !sealed
            && reads.iter().any(|read| {
                self.slots
                    .get(read.slot)
                    .is_none_or(|dep| !dep.is_fresh() || dep.changed_at != read.seen)
            });
        if outdated {
            if let Some(slot) = self.slots.get_mut(id) {
                slot.status = Status::Stale;
            }
        }
    }

    fn fail(&mut self, id: SlotId, error: NodeError) {
        let Some(slot) = self.slots.get(id) else {
            return;
        };
        log::warn!("{:?} {} failed: {error}", slot.key.node, slot.key.operation.name());
        let output = error_node(&slot.key.node, error);
        self.finish(id, output, Reads::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphConfig;
    use crate::registry::Registry;
    use std::rc::Rc;

    #[test]
    fn recomputation_budget_is_per_slot_and_per_stabilization() {
        let config = GraphConfig {
            step_limit: 2,
            ..GraphConfig::default()
        };
        let mut engine = Engine::new(Rc::new(Registry::new()), data::nil(), config);
        let slot = SlotId {
            index: 0,
            generation: 0,
        };
        let other = SlotId {
            index: 1,
            generation: 0,
        };
        assert!(!engine.over_budget(slot));
        assert!(!engine.over_budget(slot));
        assert!(!engine.over_budget(other));
        assert!(engine.over_budget(slot));

        engine.stabilize();
        assert!(!engine.over_budget(slot));
    }
}
