use itertools::Itertools;

use super::{Entity, EntityGen, EntityIndex, GEN_MASK};
use crate::{error::Result, table::TableId, Error};
use core::{
    iter::Enumerate,
    mem::{self, ManuallyDrop},
    ops::Range,
    slice,
    sync::atomic::{AtomicI64, Ordering::Relaxed},
};

#[derive(Clone, Copy, Debug)]
struct Vacant;

union SlotValue<T> {
    occupied: ManuallyDrop<T>,
    vacant: Vacant,
}

struct Slot<T> {
    value: SlotValue<T>,
    // even = dead, odd = alive
    gen: u32,
}

impl<T> Slot<T> {
    fn vacant() -> Self {
        Self {
            value: SlotValue { vacant: Vacant },
            gen: 0,
        }
    }

    fn is_alive(&self) -> bool {
        self.gen & 1 == 1
    }

    fn make_alive(&mut self, value: T) -> (EntityGen, &mut T) {
        debug_assert!(!self.is_alive());

        self.gen |= 1;
        self.value = SlotValue {
            occupied: ManuallyDrop::new(value),
        };

        (from_slot_gen(self.gen), unsafe { &mut self.value.occupied })
    }

    fn make_dead(&mut self) -> T {
        debug_assert!(self.is_alive());

        let val = mem::replace(&mut self.value, SlotValue { vacant: Vacant });
        let val = unsafe { ManuallyDrop::<T>::into_inner(val.occupied) };

        // Since the slot is alive, the gen is odd, adding one makes it even
        self.gen = self.gen.wrapping_add(1) & ((GEN_MASK << 1) | 1);
        val
    }
}

fn to_slot_gen(gen: EntityGen) -> u32 {
    ((gen & GEN_MASK) << 1) | 1
}

fn from_slot_gen(gen: u32) -> EntityGen {
    (gen >> 1) & GEN_MASK
}

bitflags::bitflags! {
    /// Describes how an entity is referenced by the table graph
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct RecordFlags: u8 {
        /// The entity is the target of at least one pair in some table
        const TARGET = 1;
        /// The entity is the relationship of at least one pair in some table
        const RELATIONSHIP = 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// An entity's location within the table graph
pub struct EntityRecord {
    pub(crate) table: TableId,
    pub(crate) row: usize,
    pub(crate) flags: RecordFlags,
}

impl EntityRecord {
    /// The table which currently stores the entity
    pub fn table(&self) -> TableId {
        self.table
    }

    /// The row of the entity in its table.
    ///
    /// Rows are not stable across structural changes.
    pub fn row(&self) -> usize {
        self.row
    }

    /// Returns how the entity is referenced by pairs
    pub fn flags(&self) -> RecordFlags {
        self.flags
    }
}

/// A generational slot map.
///
/// Index `0` is a permanently vacant sentinel. Freed indices are kept in descending order so that
/// the lowest free index is always handed out first.
pub(crate) struct EntityStore<V = EntityRecord> {
    slots: Vec<Slot<V>>,
    free: Vec<EntityIndex>,
    /// Increases for each freed item
    /// Decreases for each reserved id
    ///
    /// If there are more reserved ids than free, the value is negative and indicates that ids are
    /// taken from not yet allocated slots.
    cursor: AtomicI64,
    len: usize,
}

impl<V> core::fmt::Debug for EntityStore<V>
where
    V: core::fmt::Debug,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EntityStore")
            .field("slots", &self.iter().collect_vec())
            .field("len", &self.len)
            .finish()
    }
}

impl<'a, V> IntoIterator for &'a EntityStore<V> {
    type Item = (Entity, &'a V);

    type IntoIter = EntityStoreIter<'a, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<V> EntityStore<V> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(cap: usize) -> Self {
        let mut slots = Vec::with_capacity(cap + 1);
        slots.push(Slot::vacant());

        Self {
            slots,
            free: Vec::new(),
            len: 0,
            cursor: AtomicI64::new(0),
        }
    }

    /// Reserves a single id which becomes alive at the next [`Self::flush_reserved`]
    pub fn reserve_one(&self) -> Entity {
        let cursor = self.cursor.fetch_sub(1, Relaxed);

        if cursor > 0 {
            let index = self.free[cursor as usize - 1];
            let gen = from_slot_gen(self.slots[index as usize].gen);
            Entity::from_parts(index, gen)
        } else {
            let next_slot = (self.slots.len() + (-cursor).max(0) as usize) as u32;
            Entity::from_parts(next_slot, 0)
        }
    }

    /// Reserves `count` new entity ids
    pub fn reserve(&self, count: usize) -> ReservedIter<V> {
        // Use as many free as possible
        let cursor = self.cursor.fetch_sub(count as _, Relaxed);

        // ----------------------------------
        // | free list             | cursor |
        // ----------------------------------
        let free = &self.free[(cursor - count as i64).max(0) as usize..cursor.max(0) as usize];
        let next_slot = (self.slots.len() + (-cursor).max(0) as usize) as u32;

        let new = next_slot..next_slot + (count as i64 - cursor.max(0)).max(0) as u32;

        ReservedIter {
            slots: &self.slots,
            free: free.iter().rev(),
            new,
        }
    }

    /// Returns true if ids have been reserved but not yet flushed
    pub fn has_reserved(&self) -> bool {
        self.cursor.load(Relaxed) != self.free.len() as i64
    }

    /// Converts all reserved ids into actual entities using the provided values
    pub fn flush_reserved(&mut self, mut acquire: impl FnMut(Entity) -> V) {
        let cursor = self.cursor.load(Relaxed);
        let free = &self.free[(cursor.max(0) as usize)..self.free.len()];

        for &index in free {
            let slot = &mut self.slots[index as usize];
            let gen = from_slot_gen(slot.gen);
            let id = Entity::from_parts(index, gen);

            slot.make_alive(acquire(id));
        }

        self.len += (self.free.len() as i64 - cursor.max(0)) as usize;
        self.free.truncate(cursor.max(0) as usize);

        let next_slot = self.slots.len() as u32;
        let new_count = (-cursor).max(0) as usize;
        let new = next_slot..next_slot + new_count as u32;

        self.slots.reserve(new_count);

        for index in new {
            let id = Entity::from_parts(index, 0);

            self.slots.push(Slot {
                value: SlotValue {
                    occupied: ManuallyDrop::new(acquire(id)),
                },
                gen: to_slot_gen(0),
            });
        }

        self.len += new_count;
        self.cursor.store(self.free.len() as _, Relaxed);
    }

    #[inline]
    fn assert_reserved(&self) {
        #[cfg(debug_assertions)]
        if self.has_reserved() {
            panic!("Attempt to spawn while there are reserved ids");
        }
    }

    pub fn spawn(&mut self, value: V) -> Entity {
        self.assert_reserved();

        if let Some(index) = self.free.pop() {
            self.cursor.fetch_sub(1, Relaxed);

            let slot = &mut self.slots[index as usize];
            let (gen, _) = slot.make_alive(value);

            self.len += 1;
            Entity::from_parts(index, gen)
        } else {
            let index = self.slots.len() as u32;

            self.slots.push(Slot {
                value: SlotValue {
                    occupied: ManuallyDrop::new(value),
                },
                gen: to_slot_gen(0),
            });

            self.len += 1;
            Entity::from_parts(index, 0)
        }
    }

    pub fn despawn(&mut self, id: Entity) -> Result<V> {
        self.assert_reserved();
        if !self.is_alive(id) {
            return Err(Error::NotAlive(id));
        }

        let index = id.index();
        let val = self.slots[index as usize].make_dead();

        // Keep the free list descending so the lowest index is popped first
        let pos = self.free.partition_point(|&v| v > index);
        self.free.insert(pos, index);
        self.cursor.fetch_add(1, Relaxed);

        self.len -= 1;

        Ok(val)
    }

    #[inline]
    fn slot(&self, index: EntityIndex) -> Option<&Slot<V>> {
        self.slots.get(index as usize)
    }

    #[inline]
    fn slot_mut(&mut self, index: EntityIndex) -> Option<&mut Slot<V>> {
        self.slots.get_mut(index as usize)
    }

    #[inline]
    pub(crate) fn get_disjoint(&mut self, a: Entity, b: Entity) -> Option<(&mut V, &mut V)> {
        if a == b || !self.is_alive(a) || !self.is_alive(b) {
            return None;
        }

        unsafe {
            let base = self.slots.as_mut_ptr();
            let a = base.add(a.index() as usize);
            let b = base.add(b.index() as usize);

            assert_ne!(a, b);
            let a = &mut (*a).value.occupied;
            let b = &mut (*b).value.occupied;

            Some((a, b))
        }
    }

    #[inline]
    pub fn get_mut(&mut self, id: Entity) -> Option<&mut V> {
        unsafe {
            self.slot_mut(id.index())
                .filter(|v| v.is_alive() && v.gen == to_slot_gen(id.gen()))
                .map(|v| &mut *v.value.occupied)
        }
    }

    #[inline]
    pub fn get(&self, id: Entity) -> Option<&V> {
        unsafe {
            self.slot(id.index())
                .filter(|v| v.is_alive() && v.gen == to_slot_gen(id.gen()))
                .map(|v| &*v.value.occupied)
        }
    }

    /// Returns the live entity at `index`, regardless of generation
    #[inline]
    pub fn reconstruct(&self, index: EntityIndex) -> Option<(Entity, &V)> {
        let slot = self.slot(index)?;

        if slot.is_alive() {
            let val = unsafe { &slot.value.occupied };
            Some((Entity::from_parts(index, from_slot_gen(slot.gen)), val))
        } else {
            None
        }
    }

    /// Mutable version of [`Self::reconstruct`]
    #[inline]
    pub fn reconstruct_mut(&mut self, index: EntityIndex) -> Option<(Entity, &mut V)> {
        let slot = self.slot_mut(index)?;

        if slot.is_alive() {
            let gen = from_slot_gen(slot.gen);
            let val = unsafe { &mut *slot.value.occupied };
            Some((Entity::from_parts(index, gen), val))
        } else {
            None
        }
    }

    #[inline]
    pub fn is_alive(&self, id: Entity) -> bool {
        self.slot(id.index())
            .filter(|v| v.is_alive() && v.gen == to_slot_gen(id.gen()))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn iter(&self) -> EntityStoreIter<V> {
        EntityStoreIter {
            iter: self.slots.iter().enumerate(),
        }
    }

    pub fn iter_mut(&mut self) -> EntityStoreIterMut<V> {
        EntityStoreIterMut {
            iter: self.slots.iter_mut().enumerate(),
        }
    }

    /// Spawns an entity at the provided id.
    ///
    /// Fails if the index is occupied.
    pub(crate) fn spawn_at(&mut self, id: Entity, value: V) -> Result<&mut V> {
        let index = id.index();
        if index == 0 {
            return Err(Error::EntityOccupied(id));
        }

        self.take_slot(index)?;
        self.len += 1;

        let slot = &mut self.slots[index as usize];
        debug_assert!(!slot.is_alive());

        slot.gen = to_slot_gen(id.gen());
        slot.value = SlotValue {
            occupied: ManuallyDrop::new(value),
        };

        Ok(unsafe { &mut slot.value.occupied })
    }

    fn take_slot(&mut self, index: EntityIndex) -> Result<()> {
        self.assert_reserved();
        if index as usize >= self.slots.len() {
            // Every skipped slot becomes free. They are all larger than the current free indices.
            let new_free = self.slots.len() as u32..index;
            self.cursor.fetch_add(new_free.len() as _, Relaxed);

            self.free.splice(0..0, new_free.rev());

            self.slots
                .resize_with(index as usize + 1, || Slot::vacant());
        } else if let Some(pos) = self.free.iter().position(|&v| v == index) {
            self.cursor.fetch_sub(1, Relaxed);
            self.free.remove(pos);
        } else if let Some((id, _)) = self.reconstruct(index) {
            return Err(Error::EntityOccupied(id));
        }

        Ok(())
    }
}

impl<V> Drop for EntityStore<V> {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if slot.is_alive() {
                unsafe {
                    ManuallyDrop::<V>::drop(&mut slot.value.occupied);
                }
            }
        }
    }
}

pub(crate) struct EntityStoreIter<'a, V> {
    iter: Enumerate<slice::Iter<'a, Slot<V>>>,
}

impl<'a, V> Iterator for EntityStoreIter<'a, V> {
    type Item = (Entity, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        for (index, slot) in self.iter.by_ref() {
            if slot.is_alive() {
                let val = unsafe { &slot.value.occupied };
                let id = Entity::from_parts(index as u32, from_slot_gen(slot.gen));

                return Some((id, val));
            }
        }

        None
    }
}

pub(crate) struct EntityStoreIterMut<'a, V> {
    iter: Enumerate<slice::IterMut<'a, Slot<V>>>,
}

impl<'a, V> Iterator for EntityStoreIterMut<'a, V> {
    type Item = (Entity, &'a mut V);

    fn next(&mut self) -> Option<Self::Item> {
        for (index, slot) in self.iter.by_ref() {
            if slot.is_alive() {
                let val = unsafe { &mut slot.value.occupied };
                let id = Entity::from_parts(index as u32, from_slot_gen(slot.gen));

                return Some((id, val));
            }
        }

        None
    }
}

/// Iterates upon newly reserved entity ids
pub(crate) struct ReservedIter<'a, V = EntityRecord> {
    slots: &'a [Slot<V>],
    free: core::iter::Rev<slice::Iter<'a, EntityIndex>>,
    new: Range<EntityIndex>,
}

impl<'a, V> ExactSizeIterator for ReservedIter<'a, V> {
    fn len(&self) -> usize {
        self.free.len() + self.new.len()
    }
}

impl<'a, V> Iterator for ReservedIter<'a, V> {
    type Item = Entity;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(&index) = self.free.next() {
            // The gen as if alive
            let slot = &self.slots[index as usize];
            let gen = from_slot_gen(slot.gen);
            Some(Entity::from_parts(index, gen))
        } else {
            self.new.next().map(|index| Entity::from_parts(index, 0))
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.len(), Some(self.len()))
    }
}
