use crate::arena::SlotId;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Reverse dependency edges: dependency slot -> slots that read it.
#[derive(Debug, Default)]
pub struct Edges {
    dependents: FxHashMap<SlotId, SmallVec<[SlotId; 4]>>,
}

impl Edges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `dependent` read `dependency`.
    pub fn add(&mut self, dependency: SlotId, dependent: SlotId) {
        let targets = self.dependents.entry(dependency).or_default();
        if !targets.contains(&dependent) {
            targets.push(dependent);
        }
    }

    pub fn remove(&mut self, dependency: SlotId, dependent: SlotId) {
        if let Some(targets) = self.dependents.get_mut(&dependency) {
            targets.retain(|t| *t != dependent);
            if targets.is_empty() {
                self.dependents.remove(&dependency);
            }
        }
    }

    pub fn dependents(&self, dependency: SlotId) -> &[SlotId] {
        self.dependents
            .get(&dependency)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn has_dependents(&self, dependency: SlotId) -> bool {
        self.dependents.contains_key(&dependency)
    }

    /// Drop the edge list of a freed slot.
    pub fn remove_slot(&mut self, slot: SlotId) {
        self.dependents.remove(&slot);
    }
}
