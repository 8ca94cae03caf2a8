use std::collections::{BTreeMap, BTreeSet, VecDeque};

use itertools::Itertools;

use crate::{
    component::Registry,
    entity::{EntityStore, EntityStoreIter},
    id::WILDCARD,
    table::{Table, TableId},
    Id,
};

/// Structural changes of the table set, consumed by query caches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TableEvent {
    Created(TableId),
    Deleted(TableId),
}

/// Events are kept until the log outgrows this, or twice the number of live tables
const MIN_EVENTS: usize = 64;

/// A log of table events addressed by a monotonic cursor.
///
/// Old events are discarded once the log outgrows the table set. Readers whose cursor points
/// before the discarded events have to resynchronize from the tables themselves.
#[derive(Debug)]
pub(crate) struct EventLog {
    events: VecDeque<TableEvent>,
    /// Cursor of the oldest retained event
    base: usize,
}

impl EventLog {
    fn new() -> Self {
        Self {
            events: VecDeque::new(),
            base: 0,
        }
    }

    fn push(&mut self, event: TableEvent, live_tables: usize) {
        self.events.push_back(event);

        let limit = (live_tables * 2).max(MIN_EVENTS);
        if self.events.len() > limit {
            let count = self.events.len() - limit / 2;
            self.events.drain(..count);
            self.base += count;
        }
    }

    /// Returns the cursor after the latest event
    pub fn cursor(&self) -> usize {
        self.base + self.events.len()
    }

    /// Returns the events after `cursor`, or `None` if some of them have been discarded
    pub fn since(&self, cursor: usize) -> Option<impl Iterator<Item = &TableEvent>> {
        let start = cursor.checked_sub(self.base)?;
        Some(self.events.range(start.min(self.events.len())..))
    }

    /// Returns the number of retained events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableEvent> {
        self.events.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IdRecord {
    /// Position of the first matching id in the table type
    pub(crate) position: usize,
    /// The number of matching ids.
    ///
    /// Pairs of the same relationship are sorted sequentially, so `(R, *)` matches continue
    /// from `position` for `count` ids.
    pub(crate) count: usize,
}

pub(crate) type IdRecords = BTreeMap<TableId, IdRecord>;

/// Maps every id, including the `(R, *)` and `(*, T)` wildcards of each pair, to the tables
/// which contain it
#[derive(Default, Debug)]
pub(crate) struct IdIndex {
    ids: BTreeMap<Id, IdRecords>,
}

impl IdIndex {
    fn register_wildcard(&mut self, table_id: TableId, key: Id, position: usize) {
        let record = self
            .ids
            .entry(key)
            .or_default()
            .entry(table_id)
            .or_insert(IdRecord { position, count: 0 });

        record.count += 1;
    }

    pub(crate) fn register(&mut self, table_id: TableId, table: &Table) {
        profile_function!();
        for (position, &id) in table.ids().iter().enumerate() {
            if let Some(second) = id.second() {
                self.register_wildcard(table_id, Id::pair_indices(id.first(), WILDCARD.index()), position);
                self.register_wildcard(table_id, Id::pair_indices(WILDCARD.index(), second), position);
            }

            self.ids
                .entry(id)
                .or_default()
                .insert(table_id, IdRecord { position, count: 1 });
        }
    }

    pub(crate) fn unregister(&mut self, table_id: TableId, table: &Table) {
        profile_function!();
        let mut remove = |key: Id| {
            if let Some(records) = self.ids.get_mut(&key) {
                records.remove(&table_id);
                if records.is_empty() {
                    self.ids.remove(&key);
                }
            }
        };

        for &id in table.ids() {
            if let Some(second) = id.second() {
                remove(Id::pair_indices(id.first(), WILDCARD.index()));
                remove(Id::pair_indices(WILDCARD.index(), second));
            }

            remove(id);
        }
    }

    /// Returns the tables containing `id`.
    ///
    /// `id` may be an exact id, `(R, *)` or `(*, T)`.
    pub(crate) fn find(&self, id: Id) -> Option<&IdRecords> {
        self.ids.get(&id)
    }

    /// Returns true if any table refers to the entity with the given index, either as a plain
    /// id or as a half of a pair
    pub(crate) fn is_used(&self, id: Id) -> bool {
        let index = id.first();
        [
            id,
            Id::pair_indices(index, WILDCARD.index()),
            Id::pair_indices(WILDCARD.index(), index),
        ]
        .iter()
        .any(|v| self.ids.get(v).is_some_and(|v| !v.is_empty()))
    }
}

/// Owns all tables and the edges between them
pub(crate) struct Tables {
    inner: EntityStore<Table>,
    lookup: BTreeMap<Box<[Id]>, TableId>,
    pub(crate) index: IdIndex,
    root: TableId,
    events: EventLog,
}

impl Tables {
    pub fn new() -> Self {
        let mut inner = EntityStore::new();
        let root = inner.spawn(Table::empty());

        let mut lookup = BTreeMap::new();
        lookup.insert(Box::default(), root);

        let mut events = EventLog::new();
        events.push(TableEvent::Created(root), 1);

        Self {
            inner,
            lookup,
            index: IdIndex::default(),
            root,
            events,
        }
    }

    /// The table without any ids
    pub fn root(&self) -> TableId {
        self.root
    }

    #[track_caller]
    pub fn get(&self, table_id: TableId) -> &Table {
        match self.inner.get(table_id) {
            Some(v) => v,
            None => panic!("Invalid table: {table_id}"),
        }
    }

    #[track_caller]
    pub fn get_mut(&mut self, table_id: TableId) -> &mut Table {
        match self.inner.get_mut(table_id) {
            Some(v) => v,
            None => panic!("Invalid table: {table_id}"),
        }
    }

    pub fn try_get(&self, table_id: TableId) -> Option<&Table> {
        self.inner.get(table_id)
    }

    pub fn is_alive(&self, table_id: TableId) -> bool {
        self.inner.is_alive(table_id)
    }

    pub fn get_disjoint(&mut self, a: TableId, b: TableId) -> Option<(&mut Table, &mut Table)> {
        self.inner.get_disjoint(a, b)
    }

    pub fn iter(&self) -> EntityStoreIter<Table> {
        self.inner.iter()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Returns the table for an exact type, creating it if it does not exist.
    ///
    /// `ty` must be sorted and deduplicated.
    pub fn find_or_create(&mut self, ty: &[Id], registry: &Registry) -> TableId {
        if let Some(&id) = self.lookup.get(ty) {
            return id;
        }

        profile_function!();
        let table = Table::new(ty.into(), registry);
        let table_id = self.inner.spawn(table);

        if let Some(table) = self.inner.get(table_id) {
            self.index.register(table_id, table);
        }
        self.lookup.insert(ty.into(), table_id);
        self.events
            .push(TableEvent::Created(table_id), self.inner.len());

        tracing::debug!(%table_id, ?ty, "created table");

        table_id
    }

    /// Follows or creates the edge for adding `id`.
    ///
    /// Adding a pair of an exclusive relationship replaces any other pair of that relationship.
    pub fn add_id(&mut self, src_id: TableId, id: Id, registry: &Registry) -> TableId {
        let src = self.get(src_id);
        if let Some(dst) = src.add_edge(id) {
            return dst;
        }

        if src.has(id) {
            return src_id;
        }

        let exclusive = id.is_pair() && registry.traits(id.first()).is_exclusive();

        let mut replaced = false;
        let ty = src
            .ids()
            .iter()
            .copied()
            .filter(|v| {
                let keep = !(exclusive && v.is_pair() && v.first() == id.first());
                replaced |= !keep;
                keep
            })
            .merge([id])
            .collect_vec();

        let dst_id = self.find_or_create(&ty, registry);

        self.get_mut(src_id).add.insert(id, dst_id);
        if !replaced {
            self.get_mut(dst_id).remove.insert(id, src_id);
        }

        dst_id
    }

    /// Follows or creates the edge for removing `id`
    pub fn remove_id(&mut self, src_id: TableId, id: Id, registry: &Registry) -> TableId {
        let src = self.get(src_id);
        if let Some(dst) = src.remove_edge(id) {
            return dst;
        }

        if !src.has(id) {
            return src_id;
        }

        let ty = src.ids().iter().copied().filter(|&v| v != id).collect_vec();

        let dst_id = self.find_or_create(&ty, registry);

        self.get_mut(src_id).remove.insert(id, dst_id);
        self.get_mut(dst_id).add.insert(id, src_id);

        dst_id
    }

    /// Deletes the given tables and all edges pointing to them.
    ///
    /// The tables must be empty, and can not include the root.
    pub fn despawn_all(&mut self, tables: &BTreeSet<TableId>) -> usize {
        profile_function!();
        let mut count = 0;
        for &table_id in tables {
            assert_ne!(table_id, self.root, "Attempt to delete the root table");

            let Ok(table) = self.inner.despawn(table_id) else {
                continue;
            };

            debug_assert!(table.is_empty());

            self.index.unregister(table_id, &table);
            self.lookup.remove(table.ids());
            self.events
                .push(TableEvent::Deleted(table_id), self.inner.len());
            count += 1;
        }

        if count > 0 {
            for (_, table) in self.inner.iter_mut() {
                table.add.retain(|_, dst| !tables.contains(dst));
                table.remove.retain(|_, dst| !tables.contains(dst));
            }

            tracing::debug!(count, "deleted tables");
        }

        count
    }

    /// Deletes all empty tables, except the root
    pub fn prune_all(&mut self) -> usize {
        let empty = self
            .inner
            .iter()
            .filter(|(id, table)| *id != self.root && table.is_empty())
            .map(|(id, _)| id)
            .collect::<BTreeSet<_>>();

        self.despawn_all(&empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ComponentDesc, Entity, IdTraits};

    #[test]
    fn edges_are_memoized() {
        let mut registry = Registry::default();
        let a = Entity::from_parts(10, 0);
        let b = Entity::from_parts(11, 0);
        registry.register(a, ComponentDesc::of::<i32>()).unwrap();

        let mut tables = Tables::new();
        let root = tables.root();

        let t_a = tables.add_id(root, a.into(), &registry);
        let t_ab = tables.add_id(t_a, b.into(), &registry);
        let t_b = tables.remove_id(t_ab, a.into(), &registry);

        assert_eq!(tables.get(t_ab).ids(), [Id::from(a), Id::from(b)]);
        assert_eq!(tables.get(t_b).ids(), [Id::from(b)]);

        // Same type regardless of order
        assert_eq!(tables.add_id(t_b, a.into(), &registry), t_ab);
        assert_eq!(tables.remove_id(t_ab, b.into(), &registry), t_a);
        assert_eq!(tables.get(t_a).remove_edge(a.into()), Some(root));

        // Self loops
        assert_eq!(tables.add_id(t_a, a.into(), &registry), t_a);
        assert_eq!(tables.remove_id(t_b, a.into(), &registry), t_b);

        assert_eq!(tables.len(), 4);
        assert_eq!(
            tables.events().iter().filter(|v| matches!(v, TableEvent::Created(_))).count(),
            4
        );
    }

    #[test]
    fn exclusive_replaces() {
        let mut registry = Registry::default();
        let parent_of = Entity::from_parts(10, 0);
        let x = Entity::from_parts(11, 0);
        let y = Entity::from_parts(12, 0);
        registry.set_traits(parent_of, IdTraits::EXCLUSIVE).unwrap();

        let mut tables = Tables::new();
        let t_x = tables.add_id(tables.root(), Id::pair(parent_of, x), &registry);
        let t_y = tables.add_id(t_x, Id::pair(parent_of, y), &registry);

        assert_eq!(tables.get(t_y).ids(), [Id::pair(parent_of, y)]);
        // No reverse edge, as removing `y` does not restore `x`
        assert_eq!(tables.get(t_y).remove_edge(Id::pair(parent_of, y)), None);

        let records = tables.index.find(Id::wildcard_of(parent_of)).unwrap();
        assert_eq!(records.len(), 2);
        assert!(tables.index.is_used(y.into()));
    }

    #[test]
    fn prune() {
        let registry = Registry::default();
        let a = Entity::from_parts(10, 0);
        let b = Entity::from_parts(11, 0);

        let mut tables = Tables::new();
        let t_a = tables.add_id(tables.root(), a.into(), &registry);
        let t_ab = tables.add_id(t_a, b.into(), &registry);

        assert_eq!(tables.prune_all(), 2);
        assert!(!tables.is_alive(t_a));
        assert!(!tables.is_alive(t_ab));
        assert!(tables.get(tables.root()).add_edge(a.into()).is_none());
        assert!(tables.index.find(a.into()).is_none());

        // Recreated with a new id
        let t_a2 = tables.add_id(tables.root(), a.into(), &registry);
        assert_ne!(t_a2, t_a);
        assert_eq!(
            tables.events().iter().last(),
            Some(&TableEvent::Created(t_a2))
        );
    }

    #[test]
    fn event_log_is_bounded() {
        let registry = Registry::default();
        let a = Entity::from_parts(10, 0);

        let mut tables = Tables::new();
        let start = tables.events().cursor();

        for _ in 0..1000 {
            tables.add_id(tables.root(), a.into(), &registry);
            tables.prune_all();
        }

        assert_eq!(tables.len(), 1);
        assert_eq!(tables.events().cursor(), start + 2000);
        assert!(tables.events().len() <= MIN_EVENTS);

        // Readers which fell behind have to resynchronize
        assert!(tables.events().since(start).is_none());

        let cursor = tables.events().cursor();
        tables.add_id(tables.root(), a.into(), &registry);
        let events = tables.events().since(cursor).unwrap().copied().collect_vec();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TableEvent::Created(_)));
    }
}
