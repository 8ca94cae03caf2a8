use core::{
    any::{type_name, TypeId},
    fmt,
    mem::{self, ManuallyDrop},
    sync::atomic::{AtomicU64, Ordering::Relaxed},
};
use std::collections::{BTreeMap, BTreeSet};

use atomic_refcell::{AtomicRef, AtomicRefCell, AtomicRefMut};
use itertools::Itertools;

use crate::{
    buffer::MultiComponentBuffer,
    component::Registry,
    entity::{EntityRecord, EntityStore, RecordFlags},
    error::Result,
    id::{is_wildcard_index, BUILTINS, CHILD_OF, IS_A, UNION, WILDCARD},
    stage::DeferState,
    table::{Table, TableId},
    tables::Tables,
    CommandBuffer, Component, ComponentDesc, ComponentInfo, ComponentValue, Entity, EntityIndex,
    Error, Id, IdTraits, Stage,
};

static NEXT_WORLD_ID: AtomicU64 = AtomicU64::new(1);

/// Configures a [`World`]
#[derive(Debug, Clone)]
pub struct WorldBuilder {
    stages: usize,
    traversal_depth: usize,
    entity_capacity: usize,
    builtins: bool,
}

impl Default for WorldBuilder {
    fn default() -> Self {
        Self {
            stages: 1,
            traversal_depth: 32,
            entity_capacity: 0,
            builtins: true,
        }
    }
}

impl WorldBuilder {
    /// Sets the number of stages. There is always at least one.
    pub fn stages(mut self, stages: usize) -> Self {
        self.stages = stages.max(1);
        self
    }

    /// Sets how far upward traversal and transitive matching walk before giving up
    pub fn traversal_depth(mut self, depth: usize) -> Self {
        self.traversal_depth = depth;
        self
    }

    /// Preallocates room for `capacity` entities
    pub fn entity_capacity(mut self, capacity: usize) -> Self {
        self.entity_capacity = capacity;
        self
    }

    /// Whether [`IS_A`] is transitive and [`CHILD_OF`] exclusive and cascading.
    ///
    /// The builtin entities themselves always exist.
    pub fn builtins(mut self, enabled: bool) -> Self {
        self.builtins = enabled;
        self
    }

    /// Creates the world
    pub fn build(self) -> World {
        let mut world = World {
            id: NEXT_WORLD_ID.fetch_add(1, Relaxed),
            entities: EntityStore::with_capacity(self.entity_capacity),
            tables: Tables::new(),
            registry: Registry::default(),
            stages: (0..self.stages)
                .map(|_| AtomicRefCell::new(CommandBuffer::new()))
                .collect(),
            state: DeferState::Live,
            readonly: false,
            traversal_depth: self.traversal_depth,
            target_gen: 0,
        };

        for builtin in BUILTINS {
            let id = world.spawn_direct();
            debug_assert_eq!(id, builtin);
        }

        if self.builtins {
            for (id, traits) in [
                (IS_A, IdTraits::TRANSITIVE),
                (CHILD_OF, IdTraits::EXCLUSIVE | IdTraits::CASCADE),
            ] {
                let result = world.registry.set_traits(id, traits);
                debug_assert!(result.is_ok());
            }
        }

        world
    }
}

/// Holds the entities and their components.
///
/// Every entity lives in the table of its exact set of ids. Adding or removing an id moves the
/// entity along the edges of the table graph.
///
/// Structural changes made while the world is [deferred](Self::begin_defer) or
/// [read only](Self::readonly_begin) are recorded and applied at the matching merge point.
pub struct World {
    pub(crate) id: u64,
    pub(crate) entities: EntityStore<EntityRecord>,
    pub(crate) tables: Tables,
    pub(crate) registry: Registry,
    pub(crate) stages: Box<[AtomicRefCell<CommandBuffer>]>,
    state: DeferState,
    readonly: bool,
    pub(crate) traversal_depth: usize,
    /// Incremented whenever an entity which is the target of a pair changes table
    pub(crate) target_gen: u64,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("entities", &self.entities.len())
            .field("tables", &self.tables.len())
            .field("state", &self.state)
            .field("readonly", &self.readonly)
            .finish_non_exhaustive()
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    /// Creates a new world with the default configuration
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Configure a new world
    pub fn builder() -> WorldBuilder {
        WorldBuilder::default()
    }

    /// Converts entities reserved by stages into live entities in the root table
    fn flush_reserved(&mut self) {
        if !self.entities.has_reserved() {
            return;
        }

        let root = self.tables.root();
        let table = self.tables.get_mut(root);

        self.entities.flush_reserved(|id| {
            let row = unsafe { table.push(id, |_, _, _| {}) };
            EntityRecord {
                table: root,
                row,
                flags: RecordFlags::empty(),
            }
        });
    }

    fn spawn_direct(&mut self) -> Entity {
        self.flush_reserved();

        let root = self.tables.root();
        let table = self.tables.get_mut(root);
        let entity = self.entities.spawn(EntityRecord {
            table: root,
            row: table.len(),
            flags: RecordFlags::empty(),
        });

        unsafe { table.push(entity, |_, _, _| {}) };
        entity
    }

    /// Creates a new empty entity, reusing the lowest free index.
    ///
    /// While the world is deferred the id is reserved and becomes alive at the merge point.
    pub fn create(&mut self) -> Entity {
        if self.is_deferred() {
            return self.entities.reserve_one();
        }

        self.spawn_direct()
    }

    /// Creates an empty entity with a specific id.
    ///
    /// Fails if the index is taken by a live entity.
    pub fn create_at(&mut self, entity: Entity) -> Result<Entity> {
        self.flush_reserved();

        let root = self.tables.root();
        let table = self.tables.get_mut(root);
        self.entities.spawn_at(
            entity,
            EntityRecord {
                table: root,
                row: table.len(),
                flags: RecordFlags::empty(),
            },
        )?;

        unsafe { table.push(entity, |_, _, _| {}) };
        Ok(entity)
    }

    /// Returns true if the entity is alive
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    /// Returns the live entity at `index`, with its current generation
    pub fn get_alive(&self, index: EntityIndex) -> Option<Entity> {
        self.entities.reconstruct(index).map(|(id, _)| id)
    }

    /// Returns the location of the entity
    pub fn record(&self, entity: Entity) -> Result<EntityRecord> {
        self.entities
            .get(entity)
            .copied()
            .ok_or(Error::NotAlive(entity))
    }

    /// Returns the number of live entities, builtins included
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Returns true if structural changes are currently recorded instead of applied
    pub fn is_deferred(&self) -> bool {
        self.readonly || matches!(self.state, DeferState::Deferred(_))
    }

    /// Returns the current defer state
    pub fn defer_state(&self) -> DeferState {
        self.state
    }

    /// Returns true if the world is in read only mode
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub(crate) fn main_stage(&mut self) -> &mut CommandBuffer {
        self.stages[0].get_mut()
    }

    /// Returns the id which is actually stored in the table type
    fn storage_id(&self, id: Id) -> Id {
        match id.second() {
            Some(_) if self.is_union(id.first()) => id.with_second(UNION.index()),
            _ => id,
        }
    }

    pub(crate) fn is_union(&self, relationship: EntityIndex) -> bool {
        !is_wildcard_index(relationship) && self.registry.traits(relationship).contains(IdTraits::UNION)
    }

    /// Validates an id which is about to be attached to an entity or table
    fn check_id(&self, id: Id) -> Result<()> {
        if id == Id::NULL || id.is_wildcard() {
            return Err(Error::InconsistentComponentInfo {
                id,
                reason: "null and wildcard ids can not be attached",
            });
        }

        match id.second() {
            None => {
                if let Some(entity) = id.as_entity() {
                    if !self.is_alive(entity) {
                        return Err(Error::NotAlive(entity));
                    }
                }
            }
            Some(second) => {
                if id.first() == UNION.index() || second == UNION.index() {
                    return Err(Error::InconsistentComponentInfo {
                        id,
                        reason: "the union marker is managed by union relationships",
                    });
                }

                for index in [id.first(), second] {
                    if self.get_alive(index).is_none() {
                        return Err(Error::NotAlive(Entity::from_parts(index, 0)));
                    }
                }
            }
        }

        Ok(())
    }

    fn mark(&mut self, index: EntityIndex, flags: RecordFlags) {
        if let Some((_, record)) = self.entities.reconstruct_mut(index) {
            record.flags |= flags;
        }
    }

    fn mark_pair(&mut self, id: Id) {
        if let Some(second) = id.second() {
            self.mark(id.first(), RecordFlags::RELATIONSHIP);
            self.mark(second, RecordFlags::TARGET);
        }
    }

    /// Moves an entity to another table, returning its new row.
    ///
    /// # Safety
    /// `init` must initialize every value it is given
    unsafe fn migrate(
        &mut self,
        entity: Entity,
        dst: TableId,
        init: impl FnMut(Id, &ComponentInfo, *mut u8),
    ) -> Result<usize> {
        let record = self.record(entity)?;
        if record.table == dst {
            return Ok(record.row);
        }

        let (src_table, dst_table) = match self.tables.get_disjoint(record.table, dst) {
            Some(v) => v,
            None => panic!("Invalid migration {} => {dst}", record.table),
        };

        let (row, swapped) = src_table.move_to(dst_table, record.row, init);

        if let Some(swapped) = swapped {
            if let Some(swapped) = self.entities.get_mut(swapped) {
                swapped.row = record.row;
            }
        }

        if let Some(record) = self.entities.get_mut(entity) {
            record.table = dst;
            record.row = row;
        }

        if record.flags.contains(RecordFlags::TARGET) {
            self.target_gen += 1;
        }

        tracing::trace!(%entity, src = %record.table, %dst, "migrated");
        Ok(row)
    }

    /// Adds an id to the entity.
    ///
    /// Data components are constructed with their constructor hook, and it is an error to add one
    /// which has none. Adding an id which is already present does nothing.
    ///
    /// Adding a pair of an exclusive relationship replaces the current target.
    pub fn add(&mut self, entity: Entity, id: impl Into<Id>) -> Result<()> {
        let id = id.into();
        if self.is_deferred() {
            self.main_stage().add(entity, id);
            return Ok(());
        }

        self.add_inner(entity, id, None)
    }

    /// Adds `id`, moving `value` into its column if given.
    ///
    /// `value` is only consumed on success.
    fn add_inner(&mut self, entity: Entity, id: Id, value: Option<*mut u8>) -> Result<()> {
        self.flush_reserved();
        let record = self.record(entity)?;
        self.check_id(id)?;

        if let Some(second) = id.second() {
            let relationship = id.first();
            if self.registry.traits(relationship).contains(IdTraits::TRANSITIVE)
                && self.registry.traits(second).contains(IdTraits::FINAL)
            {
                return Err(Error::FinalOverride {
                    relationship: self.get_alive(relationship).unwrap_or_default(),
                    target: self.get_alive(second).unwrap_or_default(),
                });
            }

            if self.is_union(relationship) {
                let target = self.get_alive(second).unwrap_or_default();
                let storage = id.with_second(UNION.index());

                let dst = self.tables.add_id(record.table, storage, &self.registry);
                let row = unsafe {
                    self.migrate(entity, dst, |_, _, _| {
                        unreachable!("union relationships carry no data")
                    })?
                };

                self.tables
                    .get_mut(dst)
                    .set_union_target(relationship, row, target);

                self.mark_pair(id);
                return Ok(());
            }
        }

        if self.tables.get(record.table).has(id) {
            if let Some(src) = value {
                if let Some((ptr, info)) = self.tables.get_mut(record.table).get_ptr(id, record.row)
                {
                    unsafe {
                        info.drop(ptr);
                        info.move_to(ptr, src);
                    }
                }
            }

            return Ok(());
        }

        if let Some(info) = self.registry.data_info(id) {
            if value.is_none() && info.hooks().ctor.is_none() {
                return Err(Error::MissingConstructor(id));
            }
        }

        let dst = self.tables.add_id(record.table, id, &self.registry);
        let mut value = value;

        unsafe {
            self.migrate(entity, dst, |_, info, ptr| match value.take() {
                Some(src) => info.move_to(ptr, src),
                None => {
                    let constructed = info.construct(ptr);
                    debug_assert!(constructed);
                }
            })?;
        }

        self.mark_pair(id);
        Ok(())
    }

    /// Removes an id from the entity.
    ///
    /// `(R, *)` removes every pair of `R`, and `(*, T)` every pair targeting `T`. Removing an id
    /// which is not present does nothing.
    pub fn remove(&mut self, entity: Entity, id: impl Into<Id>) -> Result<()> {
        let id = id.into();
        if self.is_deferred() {
            self.main_stage().remove(entity, id);
            return Ok(());
        }

        self.flush_reserved();
        let record = self.record(entity)?;
        let table = self.tables.get(record.table);

        if let Some(second) = id.second() {
            let relationship = id.first();
            if self.is_union(relationship) {
                let storage = id.with_second(UNION.index());
                let Some(target) = table.union_target(relationship, record.row) else {
                    return Ok(());
                };

                if !is_wildcard_index(second) && target.index() != second {
                    return Ok(());
                }

                let dst = self.tables.remove_id(record.table, storage, &self.registry);
                unsafe {
                    self.migrate(entity, dst, |_, _, _| {
                        unreachable!("removing ids never constructs values")
                    })?;
                }

                return Ok(());
            }
        }

        let ids = table.find(id).collect_vec();
        if ids.is_empty() {
            return Ok(());
        }

        let mut dst = record.table;
        for id in ids {
            dst = self.tables.remove_id(dst, id, &self.registry);
        }

        unsafe {
            self.migrate(entity, dst, |_, _, _| {
                unreachable!("removing ids never constructs values")
            })?;
        }

        Ok(())
    }

    /// Removes every id from the entity, leaving it alive
    pub fn clear(&mut self, entity: Entity) -> Result<()> {
        if self.is_deferred() {
            self.main_stage().clear(entity);
            return Ok(());
        }

        self.flush_reserved();
        let root = self.tables.root();
        unsafe {
            self.migrate(entity, root, |_, _, _| {
                unreachable!("the root table has no columns")
            })?;
        }

        Ok(())
    }

    /// Fails if `id` does not store values of type `T`
    pub(crate) fn check_type<T: ComponentValue>(&self, entity: Entity, id: Id) -> Result<()> {
        match self.registry.data_info(id) {
            Some(info) if info.is::<T>() => Ok(()),
            Some(_) => Err(Error::MismatchedType {
                id,
                expected: type_name::<T>(),
            }),
            None if mem::size_of::<T>() == 0 => Ok(()),
            None => Err(Error::MissingComponent(entity, id)),
        }
    }

    /// Sets the value of a component, adding it if necessary.
    ///
    /// The old value is dropped.
    pub fn set<T: ComponentValue>(
        &mut self,
        entity: Entity,
        component: Component<T>,
        value: T,
    ) -> Result<()> {
        let id = component.id();
        self.check_type::<T>(entity, id)?;

        if self.is_deferred() {
            self.main_stage().set(entity, component, value);
            return Ok(());
        }

        if mem::size_of::<T>() == 0 {
            return self.add_inner(entity, id, None);
        }

        let mut value = ManuallyDrop::new(value);
        let result = unsafe {
            self.set_dyn(
                entity,
                id,
                Some(TypeId::of::<T>()),
                type_name::<T>(),
                (&mut *value as *mut T).cast(),
            )
        };

        if result.is_err() {
            unsafe { ManuallyDrop::drop(&mut value) }
        }

        result
    }

    /// Sets a type erased value, moving it out of `src` on success.
    ///
    /// # Safety
    /// `src` must point to a valid value of the component storing the data of `id`. On error
    /// ownership of the value stays with the caller.
    pub(crate) unsafe fn set_dyn(
        &mut self,
        entity: Entity,
        id: Id,
        type_id: Option<TypeId>,
        name: &'static str,
        src: *mut u8,
    ) -> Result<()> {
        self.flush_reserved();
        if !self.is_alive(entity) {
            return Err(Error::NotAlive(entity));
        }

        let info = self
            .registry
            .data_info(id)
            .ok_or(Error::MissingComponent(entity, id))?;

        if info.desc.type_id != type_id {
            return Err(Error::MismatchedType { id, expected: name });
        }

        self.add_inner(entity, id, Some(src))
    }

    /// Sets a component by copying the value at `src` with the copy hook of the component.
    ///
    /// # Safety
    /// `src` must point to a valid value of the component storing the data of `id`
    pub unsafe fn set_ptr(&mut self, entity: Entity, id: impl Into<Id>, src: *const u8) -> Result<()> {
        let id = id.into();
        let info = *self
            .registry
            .data_info(id)
            .ok_or(Error::MissingComponent(entity, id))?;

        if !info.is_copyable() {
            return Err(Error::MissingCopy(id));
        }

        if self.is_deferred() {
            self.main_stage().set_copy(entity, id, &info, src)?;
            return Ok(());
        }

        if !self.is_alive(entity) {
            return Err(Error::NotAlive(entity));
        }

        let mut value = MultiComponentBuffer::default();
        let offset = value.push_copy(&info, src);

        self.set_dyn(entity, id, info.desc.type_id, info.name(), value.get_dyn(offset))?;
        value.take_dyn(offset);

        Ok(())
    }

    /// Borrows the value of a component
    pub fn get<T: ComponentValue>(
        &self,
        entity: Entity,
        component: Component<T>,
    ) -> Result<AtomicRef<T>> {
        let record = self.record(entity)?;
        let column = self
            .tables
            .get(record.table)
            .borrow::<T>(component.id())
            .map_err(|err| with_entity(err, entity))?;

        Ok(AtomicRef::map(column, |v| &v[record.row]))
    }

    /// Mutably borrows the value of a component
    pub fn get_mut<T: ComponentValue>(
        &self,
        entity: Entity,
        component: Component<T>,
    ) -> Result<AtomicRefMut<T>> {
        let record = self.record(entity)?;
        let column = self
            .tables
            .get(record.table)
            .borrow_mut::<T>(component.id())
            .map_err(|err| with_entity(err, entity))?;

        Ok(AtomicRefMut::map(column, |v| &mut v[record.row]))
    }

    /// Returns true if the entity has an id matching `id`, which may contain wildcards
    pub fn has(&self, entity: Entity, id: impl Into<Id>) -> bool {
        let Ok(record) = self.record(entity) else {
            return false;
        };

        let id = id.into();
        let table = self.tables.get(record.table);

        if let Some(second) = id.second() {
            let relationship = id.first();
            if self.is_union(relationship) {
                return match table.union_target(relationship, record.row) {
                    Some(target) => is_wildcard_index(second) || target.index() == second,
                    None => false,
                };
            }
        }

        table.find(id).next().is_some()
    }

    /// Returns the `nth` target of `relationship` for the entity
    pub fn target(&self, entity: Entity, relationship: Entity, nth: usize) -> Option<Entity> {
        let record = self.record(entity).ok()?;
        let table = self.tables.get(record.table);

        if self.is_union(relationship.index()) {
            return table
                .union_target(relationship.index(), record.row)
                .filter(|_| nth == 0);
        }

        table
            .find(Id::wildcard_of(relationship))
            .nth(nth)
            .and_then(|id| self.get_alive(id.second()?))
    }

    /// Returns the table the entity is stored in
    pub fn table_of(&self, entity: Entity) -> Result<TableId> {
        Ok(self.record(entity)?.table)
    }

    /// Returns the ids of the entity, in table order.
    ///
    /// Union relationships appear as `(R, Union)`.
    pub fn ids(&self, entity: Entity) -> Result<&[Id]> {
        Ok(self.tables.get(self.record(entity)?.table).ids())
    }

    /// Creates a new entity with copies of every id and value of `entity`
    pub fn clone_entity(&mut self, entity: Entity) -> Result<Entity> {
        let record = self.record(entity)?;
        self.check_copyable(record.table)?;

        if self.is_deferred() {
            let dst = self.entities.reserve_one();
            self.main_stage().clone_into(entity, dst);
            return Ok(dst);
        }

        let dst = self.spawn_direct();
        self.clone_into(entity, dst)?;
        Ok(dst)
    }

    fn check_copyable(&self, table: TableId) -> Result<()> {
        let table = self.tables.get(table);
        for (&id, info) in table.data_ids().iter().zip(table.columns()) {
            if !info.is_copyable() {
                return Err(Error::MissingCopy(id));
            }
        }

        Ok(())
    }

    /// Moves `dst` into the table of `src` and copies the values it is missing from `src`.
    ///
    /// Ids only `dst` has are removed, along with their values. Ids both entities have keep the
    /// values of `dst`.
    pub(crate) fn clone_into(&mut self, src: Entity, dst: Entity) -> Result<()> {
        self.flush_reserved();
        let record = self.record(src)?;
        self.record(dst)?;
        self.check_copyable(record.table)?;

        let table_id = record.table;
        let table = self.tables.get_mut(table_id);
        // The source values must stay in place while the destination row is pushed
        table.reserve(1);

        let sources = table
            .data_ids()
            .to_vec()
            .into_iter()
            .filter_map(|id| {
                let (ptr, _) = table.get_ptr(id, record.row)?;
                Some((id, ptr as *const u8))
            })
            .collect::<BTreeMap<_, _>>();

        let row = unsafe {
            self.migrate(dst, table_id, |id, info, ptr| match sources.get(&id) {
                Some(&src) => info.copy_to(ptr, src),
                None => unreachable!("the destination table is the source table"),
            })?
        };

        let src_row = self.record(src)?.row;
        let table = self.tables.get_mut(table_id);
        for union in table.unions.iter_mut() {
            union.targets[row] = union.targets[src_row];
        }

        Ok(())
    }

    /// Deletes the entity.
    ///
    /// Every id which refers to the entity is removed from all other entities. Entities which
    /// refer to it through a cascading relationship, such as [`CHILD_OF`], are deleted as well.
    ///
    /// Deleting a dead entity does nothing. Deleting a builtin fails with [`Error::Builtin`],
    /// also while deferred.
    pub fn delete(&mut self, entity: Entity) -> Result<()> {
        if BUILTINS.contains(&entity) {
            return Err(Error::Builtin(entity));
        }

        if self.is_deferred() {
            self.main_stage().delete(entity);
            return Ok(());
        }

        self.flush_reserved();
        if !self.is_alive(entity) {
            return Ok(());
        }

        self.delete_all(vec![entity]);
        Ok(())
    }

    /// Deletes the entity and every entity which has it as target of `relationship`,
    /// recursively, regardless of the traits of the relationship.
    ///
    /// Nothing is deleted if a builtin would be, and [`Error::Builtin`] is returned instead.
    pub fn delete_recursive(&mut self, entity: Entity, relationship: Entity) -> Result<()> {
        if BUILTINS.contains(&entity) {
            return Err(Error::Builtin(entity));
        }

        if self.is_deferred() {
            self.main_stage().delete_recursive(entity, relationship);
            return Ok(());
        }

        self.flush_reserved();
        if !self.is_alive(entity) {
            return Ok(());
        }

        let union = self.is_union(relationship.index());
        let mut stack = vec![entity];
        let mut visited = BTreeSet::new();

        while let Some(entity) = stack.pop() {
            if !visited.insert(entity) {
                continue;
            }

            if union {
                stack.extend(
                    self.union_sources(entity)
                        .into_iter()
                        .filter(|&(_, rel)| rel == relationship.index())
                        .map(|(source, _)| source),
                );
            } else if let Some(records) = self.tables.index.find(Id::pair(relationship, entity)) {
                for &table in records.keys() {
                    stack.extend_from_slice(self.tables.get(table).entities());
                }
            }
        }

        if let Some(&builtin) = visited.iter().find(|v| BUILTINS.contains(v)) {
            return Err(Error::Builtin(builtin));
        }

        self.delete_all(visited.into_iter().collect_vec());
        Ok(())
    }

    /// Returns `(entity, relationship)` for every union row which targets `target`
    fn union_sources(&self, target: Entity) -> Vec<(Entity, EntityIndex)> {
        let Some(records) = self.tables.index.find(Id::pair(WILDCARD, UNION)) else {
            return Vec::new();
        };

        let mut sources = Vec::new();
        for &table_id in records.keys() {
            let table = self.tables.get(table_id);
            for union in table.unions.iter() {
                for (row, &t) in union.targets.iter().enumerate() {
                    if t == target {
                        sources.push((table.entities[row], union.relationship));
                    }
                }
            }
        }

        sources
    }

    fn delete_all(&mut self, mut queue: Vec<Entity>) {
        profile_function!();
        let mut pending = queue.iter().copied().collect::<BTreeSet<_>>();
        let mut referencing = BTreeSet::new();

        while let Some(entity) = queue.pop() {
            let Some(&record) = self.entities.get(entity) else {
                continue;
            };

            if let Some(swapped) = self.tables.get_mut(record.table).remove(record.row) {
                if let Some(swapped) = self.entities.get_mut(swapped) {
                    swapped.row = record.row;
                }
            }

            if self.entities.despawn(entity).is_err() {
                continue;
            }

            if record.flags.contains(RecordFlags::TARGET) {
                self.target_gen += 1;
                self.cleanup_union_targets(entity, &mut queue, &mut pending);
            }

            self.cleanup_references(entity, &mut queue, &mut pending, &mut referencing);
            self.registry.remove(entity);

            tracing::trace!(%entity, "deleted");
        }

        let empty = referencing
            .into_iter()
            .filter(|&table| self.tables.try_get(table).is_some_and(Table::is_empty))
            .collect::<BTreeSet<_>>();

        self.tables.despawn_all(&empty);
    }

    /// Removes every id referring to `entity` from the entities which still have one, or
    /// queues them for deletion if the relationship cascades
    fn cleanup_references(
        &mut self,
        entity: Entity,
        queue: &mut Vec<Entity>,
        pending: &mut BTreeSet<Entity>,
        referencing: &mut BTreeSet<TableId>,
    ) {
        let index = entity.index();
        let refers = |id: Id| {
            id == Id::from(entity)
                || (id.is_pair() && (id.first() == index || id.second() == Some(index)))
        };

        let tables = [
            Id::from(entity),
            Id::pair_indices(index, WILDCARD.index()),
            Id::pair_indices(WILDCARD.index(), index),
        ]
        .into_iter()
        .filter_map(|key| self.tables.index.find(key))
        .flat_map(|records| records.keys().copied())
        .collect::<BTreeSet<_>>();

        for table_id in tables {
            referencing.insert(table_id);

            let table = self.tables.get(table_id);
            let ids = table.ids().iter().copied().filter(|&id| refers(id)).collect_vec();
            let cascade = ids.iter().any(|id| {
                id.second() == Some(index)
                    && self.registry.traits(id.first()).contains(IdTraits::CASCADE)
            });

            let entities = table
                .entities()
                .iter()
                .copied()
                .filter(|v| !pending.contains(v))
                .collect_vec();

            if entities.is_empty() {
                continue;
            }

            if cascade {
                pending.extend(entities.iter().copied());
                queue.extend(entities);
                continue;
            }

            let mut dst = table_id;
            for id in ids {
                dst = self.tables.remove_id(dst, id, &self.registry);
            }

            for entity in entities {
                let result = unsafe {
                    self.migrate(entity, dst, |_, _, _| {
                        unreachable!("removing ids never constructs values")
                    })
                };

                debug_assert!(result.is_ok());
            }
        }
    }

    fn cleanup_union_targets(
        &mut self,
        target: Entity,
        queue: &mut Vec<Entity>,
        pending: &mut BTreeSet<Entity>,
    ) {
        for (source, relationship) in self.union_sources(target) {
            if pending.contains(&source) {
                continue;
            }

            if self.registry.traits(relationship).contains(IdTraits::CASCADE) {
                pending.insert(source);
                queue.push(source);
            } else {
                let result = self.remove(source, Id::pair_indices(relationship, WILDCARD.index()));
                debug_assert!(result.is_ok());
            }
        }
    }

    /// Registers `entity` as a component.
    ///
    /// Registering the same layout and type again is a no-op. It is an error to give an id data
    /// once it is used as a tag.
    pub fn register_component(&mut self, entity: Entity, desc: ComponentDesc) -> Result<Id> {
        self.flush_reserved();
        if !self.is_alive(entity) {
            return Err(Error::NotAlive(entity));
        }

        if self.registry.get(entity.index()).is_none()
            && desc.layout().size() > 0
            && self.tables.index.is_used(entity.into())
        {
            return Err(Error::InconsistentComponentInfo {
                id: entity.into(),
                reason: "the id is already in use as a tag",
            });
        }

        self.registry.register(entity, desc)?;
        Ok(entity.into())
    }

    /// Returns the component for the Rust type `T`, registering it on first use
    pub fn component<T: ComponentValue>(&mut self) -> Component<T> {
        if let Some(&id) = self.registry.types.get(&TypeId::of::<T>()) {
            return Component::from_id(id);
        }

        let id = self.spawn_direct();
        if let Err(err) = self.registry.register(id, ComponentDesc::of::<T>()) {
            unreachable!("Registration of a fresh component failed: {err}");
        }

        tracing::debug!(%id, name = tynm::type_name::<T>(), "registered component");
        Component::from_id(id)
    }

    /// Returns the component for the Rust type `T`, registering it with custom hooks on first
    /// use.
    ///
    /// An existing registration keeps its hooks.
    pub fn component_with<T: ComponentValue>(&mut self, desc: ComponentDesc) -> Result<Component<T>> {
        if desc.type_id != Some(TypeId::of::<T>()) {
            return Err(Error::MismatchedType {
                id: Id::NULL,
                expected: type_name::<T>(),
            });
        }

        let id = match self.registry.types.get(&TypeId::of::<T>()) {
            Some(&id) => id,
            None => self.spawn_direct(),
        };

        self.registry.register(id, desc)?;
        Ok(Component::from_id(id))
    }

    /// Returns the registration of the component which stores the data of `id`.
    ///
    /// Pairs take their data from the relationship, or from the target if the relationship is a
    /// tag.
    pub fn component_info(&self, id: impl Into<Id>) -> Option<&ComponentInfo> {
        self.registry.data_info(id.into())
    }

    /// Sets the relationship traits of an entity.
    ///
    /// Traits can only be changed before the entity is first used in a table.
    pub fn set_traits(&mut self, entity: Entity, traits: IdTraits) -> Result<()> {
        if !self.is_alive(entity) {
            return Err(Error::NotAlive(entity));
        }

        if self.registry.traits(entity.index()) != traits && self.tables.index.is_used(entity.into())
        {
            return Err(Error::InconsistentComponentInfo {
                id: entity.into(),
                reason: "traits must be set before the id is first used",
            });
        }

        self.registry.set_traits(entity, traits)
    }

    /// Returns the relationship traits of an entity
    pub fn traits(&self, entity: Entity) -> IdTraits {
        self.registry.traits(entity.index())
    }

    /// Returns a table by id
    pub fn table(&self, id: TableId) -> Option<&Table> {
        self.tables.try_get(id)
    }

    /// Iterates all tables
    pub fn tables(&self) -> impl Iterator<Item = (TableId, &Table)> {
        self.tables.iter()
    }

    /// Returns the table for a set of ids, creating it if necessary.
    ///
    /// Pairs of union relationships are stored as `(R, Union)`.
    pub fn table_for(&mut self, ids: &[Id]) -> Result<TableId> {
        if self.readonly {
            return Err(Error::ReadonlyViolation);
        }

        for &id in ids {
            self.check_id(id)?;
        }

        let ty = ids
            .iter()
            .map(|&id| self.storage_id(id))
            .sorted()
            .dedup()
            .collect_vec();

        Ok(self.tables.find_or_create(&ty, &self.registry))
    }

    /// Follows the edge of `table` for adding `id`
    pub fn add_to_table(&mut self, table: TableId, id: impl Into<Id>) -> Result<TableId> {
        let id = id.into();
        if self.readonly {
            return Err(Error::ReadonlyViolation);
        }

        if !self.tables.is_alive(table) {
            return Err(Error::NotAlive(table));
        }

        self.check_id(id)?;
        let id = self.storage_id(id);
        Ok(self.tables.add_id(table, id, &self.registry))
    }

    /// Follows the edge of `table` for removing `id`
    pub fn remove_from_table(&mut self, table: TableId, id: impl Into<Id>) -> Result<TableId> {
        let id = id.into();
        if self.readonly {
            return Err(Error::ReadonlyViolation);
        }

        if !self.tables.is_alive(table) {
            return Err(Error::NotAlive(table));
        }

        let id = self.storage_id(id);
        Ok(self.tables.remove_id(table, id, &self.registry))
    }

    /// Deletes all empty tables except the root, returning how many were deleted.
    ///
    /// Queries drop the deleted tables from their caches before their next iteration.
    pub fn compact(&mut self) -> Result<usize> {
        if self.readonly {
            return Err(Error::ReadonlyViolation);
        }

        let count = self.tables.prune_all();
        tracing::debug!(count, "compacted tables");
        Ok(count)
    }

    /// Starts recording structural changes into the main stage.
    ///
    /// Scopes nest, and only the outermost [`Self::end_defer`] applies the changes.
    pub fn begin_defer(&mut self) {
        self.state = match self.state {
            DeferState::Live => DeferState::Deferred(1),
            DeferState::Deferred(depth) => DeferState::Deferred(depth + 1),
        };
    }

    /// Ends a defer scope, applying the recorded changes if it was the outermost.
    ///
    /// Closing the outermost scope merges every stage in index order, which includes stages
    /// recorded by a read only scope that ended while the world was deferred.
    ///
    /// Every recorded change is applied even if some fail. The failures are returned.
    pub fn end_defer(&mut self) -> anyhow::Result<()> {
        match self.state {
            DeferState::Live => {
                tracing::warn!("end_defer without a matching begin_defer");
                Ok(())
            }
            DeferState::Deferred(depth) if depth > 1 => {
                self.state = DeferState::Deferred(depth - 1);
                Ok(())
            }
            DeferState::Deferred(_) => {
                self.state = DeferState::Live;
                if self.readonly {
                    return Ok(());
                }

                self.merge()
            }
        }
    }

    fn replay(&mut self, stage: usize) -> anyhow::Result<()> {
        profile_function!();
        let mut result = Ok(());

        loop {
            let mut commands = mem::take(self.stages[stage].get_mut());
            if commands.is_empty() {
                break;
            }

            tracing::debug!(stage, commands = commands.len(), "replaying stage");
            if let Err(err) = commands.apply(self) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        result
    }

    /// Enters read only mode.
    ///
    /// Until [`Self::readonly_end`], changes are recorded into [stages](Self::stage) and the table
    /// graph can not be modified directly.
    pub fn readonly_begin(&mut self) {
        self.readonly = true;
    }

    /// Leaves read only mode and merges all stages
    pub fn readonly_end(&mut self) -> anyhow::Result<()> {
        self.readonly = false;
        self.merge()
    }

    /// Applies the changes recorded in every stage, in stage index order.
    ///
    /// Does nothing while the world is deferred, as the changes would only be recorded again.
    /// The stages are merged when the outermost defer scope ends instead.
    pub fn merge(&mut self) -> anyhow::Result<()> {
        if self.is_deferred() {
            return Ok(());
        }

        self.flush_reserved();

        let mut result = Ok(());
        for stage in 0..self.stages.len() {
            if let Err(err) = self.replay(stage) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        result
    }

    /// Returns a handle to a stage
    ///
    /// # Panics
    /// If `index` is out of bounds
    #[track_caller]
    pub fn stage(&self, index: usize) -> Stage<'_> {
        assert!(
            index < self.stages.len(),
            "Stage {index} out of bounds for {} stages",
            self.stages.len()
        );

        Stage { world: self, index }
    }

    /// Returns the number of stages
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Iterates all stages
    pub fn stages(&self) -> impl Iterator<Item = Stage<'_>> {
        (0..self.stages.len()).map(move |index| Stage { world: self, index })
    }

    /// Iterates all stages in parallel
    #[cfg(feature = "rayon")]
    pub fn par_stages(&self) -> impl rayon::iter::IndexedParallelIterator<Item = Stage<'_>> {
        use rayon::prelude::*;
        (0..self.stages.len())
            .into_par_iter()
            .map(move |index| Stage { world: self, index })
    }
}

fn with_entity(err: Error, entity: Entity) -> Error {
    match err {
        Error::MissingComponent(_, id) => Error::MissingComponent(entity, id),
        err => err,
    }
}
