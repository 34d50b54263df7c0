use super::cell::Property;

/// Generational index into the property arena.
/// Allows safe reuse of slots with use-after-free detection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PropertyId {
    pub index: u32,
    pub generation: u32,
}

impl PropertyId {
    pub const INVALID: Self = Self { index: u32::MAX, generation: 0 };

    pub fn is_valid(&self) -> bool {
        self.index != u32::MAX
    }
}

struct Slot {
    generation: u32,
    cell: Option<Property>,
}

/// Arena allocator for property cells.
///
/// A slot's occupancy is the "strong owner" of its cell: releasing a slot
/// bumps its generation, which instantly invalidates every outstanding
/// `PropertyId` pointing at it. Dependency edges hold such handles and treat
/// a failed resolution as a reclaimed cell.
pub struct PropertyArena {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
}

impl PropertyArena {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free_list: Vec::new(),
        }
    }

    /// Insert a cell, reusing a freed slot when one is available.
    pub fn insert(&mut self, cell: Property) -> PropertyId {
        if let Some(index) = self.free_list.pop() {
            // Reuse freed slot, bump generation
            let slot = &mut self.slots[index as usize];
            slot.generation += 1;
            slot.cell = Some(cell);
            PropertyId { index, generation: slot.generation }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot { generation: 0, cell: Some(cell) });
            PropertyId { index, generation: 0 }
        }
    }

    /// Release a slot, making it available for reuse and invalidating every
    /// outstanding handle to it.
    pub fn release(&mut self, id: PropertyId) -> Option<Property> {
        if !self.contains(id) {
            return None;
        }
        let slot = &mut self.slots[id.index as usize];
        slot.generation += 1;
        self.free_list.push(id.index);
        slot.cell.take()
    }

    /// Check whether a handle still resolves (correct generation, occupied).
    pub fn contains(&self, id: PropertyId) -> bool {
        self.slots
            .get(id.index as usize)
            .is_some_and(|slot| slot.generation == id.generation && slot.cell.is_some())
    }

    pub fn get(&self, id: PropertyId) -> Option<&Property> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.cell.as_ref())
    }

    pub fn get_mut(&mut self, id: PropertyId) -> Option<&mut Property> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.cell.as_mut())
    }

    /// Number of slots in the arena (including freed slots).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Default for PropertyArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::cell::ElementId;
    use crate::engine::declaration::Declaration;
    use std::sync::Arc;

    struct AnyDecl;
    impl Declaration for AnyDecl {}

    fn cell() -> Property {
        Property::new(ElementId(0), Arc::new(AnyDecl))
    }

    #[test]
    fn arena_insert_and_release() {
        let mut arena = PropertyArena::new();

        let slot1 = arena.insert(cell());
        let slot2 = arena.insert(cell());

        assert!(arena.contains(slot1));
        assert!(arena.contains(slot2));
        assert_ne!(slot1, slot2);

        arena.release(slot1);
        assert!(!arena.contains(slot1));

        // Reuse freed slot
        let slot3 = arena.insert(cell());
        assert_eq!(slot3.index, slot1.index);
        assert_ne!(slot3.generation, slot1.generation);
    }

    #[test]
    fn arena_get_mut() {
        let mut arena = PropertyArena::new();
        let slot = arena.insert(cell());

        {
            let property = arena.get_mut(slot).unwrap();
            property.out_of_date = false;
        }

        let property = arena.get(slot).unwrap();
        assert!(!property.out_of_date);
    }

    #[test]
    fn arena_generation_check() {
        let mut arena = PropertyArena::new();

        let slot1 = arena.insert(cell());
        arena.release(slot1);
        let slot2 = arena.insert(cell()); // Reuses slot1's index

        // Old handle must not resolve to the new occupant
        assert!(!arena.contains(slot1));
        assert!(arena.contains(slot2));
        assert!(arena.get(slot1).is_none());
    }
}
