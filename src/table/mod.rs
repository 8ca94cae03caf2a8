use core::fmt;
use std::collections::BTreeMap;

use atomic_refcell::{AtomicRef, AtomicRefCell, AtomicRefMut};
use itertools::Itertools;

use crate::{
    component::Registry, error::Result, id::UNION, ComponentInfo, ComponentValue, Entity,
    EntityIndex, Error, Id,
};

mod storage;

pub(crate) use storage::*;

/// Weak reference to a table.
///
/// Tables live in a generational arena, so a stale id never resolves to a recycled table.
pub type TableId = Entity;

/// Per row targets of a union relationship
#[derive(Debug)]
pub(crate) struct UnionColumn {
    pub(crate) relationship: EntityIndex,
    pub(crate) targets: Vec<Entity>,
}

/// A collection of entities with the exact same ids.
///
/// Components are stored as contiguous columns which are parallel to the entity array.
pub struct Table {
    ty: Box<[Id]>,
    column_ids: Box<[Id]>,
    column_infos: Box<[ComponentInfo]>,
    columns: Box<[AtomicRefCell<Column>]>,
    pub(crate) unions: Box<[UnionColumn]>,
    /// Row to entity
    pub(crate) entities: Vec<Entity>,

    pub(crate) add: BTreeMap<Id, TableId>,
    pub(crate) remove: BTreeMap<Id, TableId>,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("ty", &self.ty)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl Table {
    pub(crate) fn empty() -> Self {
        Self::new(Box::new([]), &Registry::default())
    }

    /// Create a new table.
    /// Assumes `ty` is sorted and deduplicated.
    pub(crate) fn new(ty: Box<[Id]>, registry: &Registry) -> Self {
        debug_assert!(ty.iter().tuple_windows().all(|(a, b)| a < b));

        let (column_ids, column_infos, columns): (Vec<_>, Vec<_>, Vec<_>) = ty
            .iter()
            .filter_map(|&id| {
                let info = *registry.data_info(id)?;
                Some((id, info, AtomicRefCell::new(Column::new(info))))
            })
            .multiunzip();

        let unions = ty
            .iter()
            .filter(|id| id.second() == Some(UNION.index()))
            .map(|id| UnionColumn {
                relationship: id.first(),
                targets: Vec::new(),
            })
            .collect_vec();

        Self {
            ty,
            column_ids: column_ids.into_boxed_slice(),
            column_infos: column_infos.into_boxed_slice(),
            columns: columns.into_boxed_slice(),
            unions: unions.into_boxed_slice(),
            entities: Vec::new(),
            add: BTreeMap::new(),
            remove: BTreeMap::new(),
        }
    }

    /// Returns the sorted ids of the table
    pub fn ids(&self) -> &[Id] {
        &self.ty
    }

    /// Returns the ids which store data
    pub fn data_ids(&self) -> &[Id] {
        &self.column_ids
    }

    /// Returns the number of rows
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Returns true if the table has no rows
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Returns the entities stored in the table, indexed by row
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// Returns the entity at `row`
    pub fn entity(&self, row: usize) -> Option<Entity> {
        self.entities.get(row).copied()
    }

    /// Returns true if the table has the exact id
    pub fn has(&self, id: Id) -> bool {
        self.ty.binary_search(&id).is_ok()
    }

    /// Returns the position of `id` in the table type
    pub fn position(&self, id: Id) -> Option<usize> {
        self.ty.binary_search(&id).ok()
    }

    /// Returns all ids matching a pattern, in type order.
    ///
    /// Union relationships are represented by `(R, Union)`.
    pub fn find(&self, pattern: Id) -> impl Iterator<Item = Id> + '_ {
        let ids = if pattern.is_wildcard() {
            self.pairs_of(pattern)
        } else {
            let pos = self.position(pattern);
            match pos {
                Some(pos) => &self.ty[pos..=pos],
                None => &[],
            }
        };

        ids.iter().copied().filter(move |v| v.matches(pattern))
    }

    /// Narrows the searched ids for a wildcard pattern
    fn pairs_of(&self, pattern: Id) -> &[Id] {
        if !pattern.is_pair() {
            return &self.ty;
        }

        let first = pattern.first();
        if crate::id::is_wildcard_index(first) {
            let start = self.ty.partition_point(|v| !v.is_pair());
            return &self.ty[start..];
        }

        let start = self
            .ty
            .partition_point(|&v| v < Id::pair_indices(first, 0));
        let end = self
            .ty
            .partition_point(|&v| v <= Id::pair_indices(first, u32::MAX));

        &self.ty[start..end]
    }

    /// Returns information about each column
    pub fn columns(&self) -> &[ComponentInfo] {
        &self.column_infos
    }

    #[inline]
    pub(crate) fn column_index(&self, id: Id) -> Option<usize> {
        self.column_ids.binary_search(&id).ok()
    }

    pub(crate) fn column(&self, id: Id) -> Option<&AtomicRefCell<Column>> {
        Some(&self.columns[self.column_index(id)?])
    }

    pub(crate) fn union_index(&self, relationship: EntityIndex) -> Option<usize> {
        self.unions
            .iter()
            .position(|v| v.relationship == relationship)
    }

    /// Returns the target of a union relationship for the entity at `row`
    pub fn union_target(&self, relationship: EntityIndex, row: usize) -> Option<Entity> {
        let index = self.union_index(relationship)?;
        self.unions[index].targets.get(row).copied()
    }

    pub(crate) fn set_union_target(&mut self, relationship: EntityIndex, row: usize, target: Entity) {
        if let Some(index) = self.union_index(relationship) {
            self.unions[index].targets[row] = target;
        }
    }

    /// Borrow a column
    pub fn borrow<T: ComponentValue>(&self, id: Id) -> Result<AtomicRef<[T]>> {
        let column = self.typed_column::<T>(id)?;
        let column = column.try_borrow().map_err(|_| Error::Borrow(id))?;

        Ok(AtomicRef::map(column, |v| unsafe { v.as_slice::<T>() }))
    }

    /// Borrow a column mutably
    pub fn borrow_mut<T: ComponentValue>(&self, id: Id) -> Result<AtomicRefMut<[T]>> {
        let column = self.typed_column::<T>(id)?;
        let column = column.try_borrow_mut().map_err(|_| Error::BorrowMut(id))?;

        Ok(AtomicRefMut::map(column, |v| unsafe { v.as_mut_slice::<T>() }))
    }

    fn typed_column<T: ComponentValue>(&self, id: Id) -> Result<&AtomicRefCell<Column>> {
        let index = self
            .column_index(id)
            .ok_or(Error::MissingComponent(Entity::NULL, id))?;

        if !self.column_infos[index].is::<T>() {
            return Err(Error::MismatchedType {
                id,
                expected: core::any::type_name::<T>(),
            });
        }

        Ok(&self.columns[index])
    }

    /// Returns a pointer to the value of `id` at `row`
    pub(crate) fn get_ptr(&mut self, id: Id, row: usize) -> Option<(*mut u8, ComponentInfo)> {
        let column = self.columns[self.column_index(id)?].get_mut();
        if row >= column.len() {
            return None;
        }

        Some(unsafe { (column.at(row), *column.info()) })
    }

    /// Returns the outgoing edge for adding `id`
    pub fn add_edge(&self, id: Id) -> Option<TableId> {
        self.add.get(&id).copied()
    }

    /// Returns the outgoing edge for removing `id`
    pub fn remove_edge(&self, id: Id) -> Option<TableId> {
        self.remove.get(&id).copied()
    }

    pub(crate) fn reserve(&mut self, additional: usize) {
        self.entities.reserve(additional);
        for column in self.columns.iter_mut() {
            column.get_mut().reserve(additional);
        }
    }

    /// Appends a new row.
    ///
    /// Union targets are initialized to [`Entity::NULL`].
    ///
    /// # Safety
    /// `init` must initialize every value it is given
    pub(crate) unsafe fn push(
        &mut self,
        entity: Entity,
        mut init: impl FnMut(Id, &ComponentInfo, *mut u8),
    ) -> usize {
        let row = self.entities.len();
        self.entities.push(entity);

        for (&id, column) in self.column_ids.iter().zip(self.columns.iter_mut()) {
            let column = column.get_mut();
            let ptr = column.push_uninit();
            init(id, column.info(), ptr);
        }

        for union in self.unions.iter_mut() {
            union.targets.push(Entity::NULL);
        }

        row
    }

    /// Moves the row to `dst`.
    ///
    /// Values of ids present in both tables are moved, values of ids only present in `dst` are
    /// initialized by `init`, and values only present in `self` are dropped.
    ///
    /// Returns the row in `dst` and the entity which was swapped into `row`, if any.
    ///
    /// # Safety
    /// `init` must initialize every value it is given
    pub(crate) unsafe fn move_to(
        &mut self,
        dst: &mut Self,
        row: usize,
        mut init: impl FnMut(Id, &ComponentInfo, *mut u8),
    ) -> (usize, Option<Entity>) {
        let entity = self.entities[row];
        let dst_row = dst.entities.len();
        dst.entities.push(entity);

        for (&id, column) in dst.column_ids.iter().zip(dst.columns.iter_mut()) {
            let column = column.get_mut();
            let ptr = column.push_uninit();

            match self.column_index(id) {
                Some(src) => self.columns[src].get_mut().swap_remove(row, Some(ptr)),
                None => init(id, column.info(), ptr),
            }
        }

        for (&id, column) in self.column_ids.iter().zip(self.columns.iter_mut()) {
            if dst.column_index(id).is_none() {
                column.get_mut().swap_remove(row, None);
            }
        }

        for union in dst.unions.iter_mut() {
            let target = self
                .unions
                .iter()
                .find(|v| v.relationship == union.relationship)
                .map(|v| v.targets[row])
                .unwrap_or(Entity::NULL);

            union.targets.push(target);
        }

        (dst_row, self.remove_row(row))
    }

    /// Removes the row, dropping all values
    ///
    /// Returns the entity which was swapped into `row`, if any.
    pub(crate) fn remove(&mut self, row: usize) -> Option<Entity> {
        for column in self.columns.iter_mut() {
            unsafe { column.get_mut().swap_remove(row, None) }
        }

        self.remove_row(row)
    }

    fn remove_row(&mut self, row: usize) -> Option<Entity> {
        for union in self.unions.iter_mut() {
            union.targets.swap_remove(row);
        }

        self.entities.swap_remove(row);
        self.entities.get(row).copied()
    }
}
