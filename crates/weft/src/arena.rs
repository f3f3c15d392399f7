/// Generational index into an arena.
/// Allows safe reuse of slots with use-after-free detection.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SlotId {
    pub index: u32,
    pub generation: u32,
}

struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena allocator for engine records (slots, scopes, contexts).
pub struct Arena<T> {
    entries: Vec<Entry<T>>,
    free_list: Vec<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_list: Vec::new(),
            len: 0,
        }
    }

    /// Allocate a new slot in the arena.
    pub fn alloc(&mut self, value: T) -> SlotId {
        self.len += 1;
        if let Some(index) = self.free_list.pop() {
            // Reuse freed slot, bump generation
            let entry = &mut self.entries[index as usize];
            entry.generation += 1;
            entry.value = Some(value);
            SlotId {
                index,
                generation: entry.generation,
            }
        } else {
            let index = self.entries.len() as u32;
            self.entries.push(Entry {
                generation: 0,
                value: Some(value),
            });
            SlotId {
                index,
                generation: 0,
            }
        }
    }

    /// Free a slot, returning its value. Stale ids return `None`.
    pub fn free(&mut self, id: SlotId) -> Option<T> {
        let entry = self.entries.get_mut(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        let value = entry.value.take()?;
        self.free_list.push(id.index);
        self.len -= 1;
        Some(value)
    }

    /// Check if a SlotId is still valid (generation matches and not freed).
    pub fn is_valid(&self, id: SlotId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: SlotId) -> Option<&T> {
        self.entries
            .get(id.index as usize)
            .filter(|entry| entry.generation == id.generation)
            .and_then(|entry| entry.value.as_ref())
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        self.entries
            .get_mut(id.index as usize)
            .filter(|entry| entry.generation == id.generation)
            .and_then(|entry| entry.value.as_mut())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &T)> {
        self.entries.iter().enumerate().filter_map(|(index, entry)| {
            entry.value.as_ref().map(|value| {
                (
                    SlotId {
                        index: index as u32,
                        generation: entry.generation,
                    },
                    value,
                )
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_alloc_and_free() {
        let mut arena = Arena::new();
        let id1 = arena.alloc("a");
        let id2 = arena.alloc("b");

        assert_ne!(id1, id2);
        assert!(arena.is_valid(id1));
        assert!(arena.is_valid(id2));
        assert_eq!(arena.len(), 2);

        assert_eq!(arena.free(id1), Some("a"));
        assert!(!arena.is_valid(id1));
        assert_eq!(arena.len(), 1);

        // Reuse should bump generation
        let id3 = arena.alloc("c");
        assert_eq!(id3.index, id1.index);
        assert_ne!(id3.generation, id1.generation);
    }

    #[test]
    fn arena_generation_check() {
        let mut arena = Arena::new();
        let id = arena.alloc(1);
        arena.free(id);
        let _ = arena.alloc(2);

        // Old id should be invalid
        assert!(arena.get(id).is_none());
        assert!(arena.free(id).is_none());
    }

    #[test]
    fn arena_iterates_live_entries() {
        let mut arena = Arena::new();
        let a = arena.alloc(10);
        let b = arena.alloc(20);
        arena.free(a);
        let live: Vec<_> = arena.iter().collect();
        assert_eq!(live, vec![(b, &20)]);
    }
}
