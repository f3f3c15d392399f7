//! Memoized (node, operation) results.
//!
//! A slot tracks the last output, the revision it last changed at and the
//! dependency slots it read (with the revision observed), so a stale slot can
//! verify its inputs before deciding to recompute.

use crate::address::GraphNode;
use crate::arena::SlotId;
use crate::dependency::NodeDependency;
use crate::operation::Operation;
use crate::registry::RunFn;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;

/// Monotonic change counter, bumped on every external change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Revision(pub u64);

impl Revision {
    pub fn next(self) -> Self {
        Revision(self.0 + 1)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub node: GraphNode,
    pub operation: Operation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Uncomputed,
    Fresh,
    /// Some transitive input may have changed; verify reads first.
    Stale,
    /// A direct input changed; must recompute.
    Dirty,
}

/// A dependency slot read during the last computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Read {
    pub slot: SlotId,
    pub seen: Revision,
}

pub type Reads = SmallVec<[Read; 4]>;

/// Append a read. Repeats of the latest read are dropped here; the rest are
/// removed by [`dedup_reads`] once the computation finishes.
pub fn record_read(reads: &mut Reads, read: Read) {
    if reads.last().is_none_or(|last| last.slot != read.slot) {
        reads.push(read);
    }
}

/// Keep the first read of every slot, in order.
pub fn dedup_reads(reads: &mut Reads) {
    if reads.len() < 2 {
        return;
    }
    let mut seen = FxHashSet::default();
    reads.retain(|read| seen.insert(read.slot));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Hop `Evaluate` until the current node supports the operation.
    Seek,
    /// Apply the dependency's operation once.
    Apply,
    /// Hop `Evaluate` until the predicate holds.
    Until,
}

/// Position of one dependency's resolution. Kept across retries so a
/// blocked walk resumes where it stopped.
#[derive(Debug, Clone)]
pub struct Walk {
    pub current: GraphNode,
    pub phase: Phase,
    pub hops: usize,
    /// Hops out of loop continuations, charged apart from `hops`.
    pub loops: usize,
    pub result: Option<GraphNode>,
}

#[derive(Clone, Copy)]
pub enum Plan {
    Run(RunFn),
    /// Output is the single dependency's result.
    Forward,
}

pub struct Progress {
    pub deps: Vec<NodeDependency>,
    pub walks: Vec<Walk>,
    pub reads: Reads,
    pub plan: Plan,
    /// Slot the handler delegated to, once `run` has executed.
    pub continuation: Option<SlotId>,
}

pub struct Slot {
    pub key: SlotKey,
    pub status: Status,
    pub output: Option<GraphNode>,
    pub changed_at: Revision,
    pub verified_at: Revision,
    pub reads: Reads,
    /// Host subscriptions holding this slot.
    pub external: usize,
    /// Computed at most once (mutations, actions).
    pub once: bool,
    pub progress: Option<Progress>,
}

impl Slot {
    pub fn new(key: SlotKey, once: bool) -> Self {
        Self {
            key,
            status: Status::Uncomputed,
            output: None,
            changed_at: Revision::default(),
            verified_at: Revision::default(),
            reads: SmallVec::new(),
            external: 0,
            once,
            progress: None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.status == Status::Fresh
    }

    /// A once slot is sealed after it produced a settled (non-pending) output.
    pub fn is_sealed(&self) -> bool {
        self.once
            && self.is_fresh()
            && !self
                .output
                .as_ref()
                .is_some_and(|output| output.definition.is_pending())
    }
}
