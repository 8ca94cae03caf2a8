use core::{fmt, slice};

use atomic_refcell::{AtomicRef, AtomicRefMut};
use smallvec::SmallVec;

use super::{
    matcher::{CacheEntry, FixedMatch, UnionFilter},
    Access, Oper, Source, Term,
};
use crate::{
    component::ComponentValue,
    error::Result,
    id::UNION,
    table::{Table, TableId},
    Entity, Error, Id, World,
};

/// Iterates the matching tables of a query as contiguous batches of rows
pub struct QueryIter<'q, 'w> {
    pub(super) world: &'w World,
    pub(super) terms: &'q [Term],
    pub(super) vars: &'q [String],
    pub(super) fixed: &'q [FixedMatch],
    pub(super) entries: slice::Iter<'q, CacheEntry>,
    /// An entry whose rows are restricted by union targets
    pub(super) current: Option<(&'q CacheEntry, &'w Table)>,
    pub(super) row: usize,
    pub(super) done: bool,
}

impl fmt::Debug for QueryIter<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryIter")
            .field("remaining", &self.entries.len())
            .field("row", &self.row)
            .finish()
    }
}

fn row_matches(table: &Table, filters: &[UnionFilter], row: usize) -> bool {
    filters.iter().all(|filter| {
        match table.union_target(filter.relationship, row) {
            Some(target) if !target.is_null() => {
                filter.target.map_or(true, |v| v == target.index())
            }
            _ => false,
        }
    })
}

impl<'q, 'w> QueryIter<'q, 'w> {
    fn batch(&self, entry: &'q CacheEntry, table: &'w Table, offset: usize, count: usize) -> Batch<'q, 'w> {
        Batch {
            world: self.world,
            table,
            entry,
            fixed: self.fixed,
            terms: self.terms,
            vars: self.vars,
            offset,
            count,
        }
    }

    /// Yields the next run of rows of the current entry which pass its union filters
    fn next_run(&mut self) -> Option<Batch<'q, 'w>> {
        let (entry, table) = self.current?;
        let len = table.len();
        let single = entry.filters.iter().any(|v| v.target.is_none());

        let start = (self.row..len).find(|&row| row_matches(table, &entry.filters, row));
        let Some(start) = start else {
            self.current = None;
            return None;
        };

        let end = if single {
            start + 1
        } else {
            (start + 1..len)
                .find(|&row| !row_matches(table, &entry.filters, row))
                .unwrap_or(len)
        };

        self.row = end;
        Some(self.batch(entry, table, start, end - start))
    }
}

impl<'q, 'w> Iterator for QueryIter<'q, 'w> {
    type Item = Batch<'q, 'w>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            if self.current.is_some() {
                if let Some(batch) = self.next_run() {
                    return Some(batch);
                }

                continue;
            }

            let entry = self.entries.next()?;
            let Some(table) = self.world.tables.try_get(entry.table) else {
                continue;
            };

            if table.is_empty() {
                continue;
            }

            if entry.filters.is_empty() {
                return Some(self.batch(entry, table, 0, table.len()));
            }

            self.current = Some((entry, table));
            self.row = 0;
        }
    }
}

/// A contiguous range of rows in one table, all matching the query in the same way.
///
/// Term indices refer to the terms in the order they were given to the query.
pub struct Batch<'q, 'w> {
    world: &'w World,
    table: &'w Table,
    entry: &'q CacheEntry,
    fixed: &'q [FixedMatch],
    terms: &'q [Term],
    vars: &'q [String],
    offset: usize,
    count: usize,
}

impl fmt::Debug for Batch<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("table", &self.entry.table)
            .field("offset", &self.offset)
            .field("count", &self.count)
            .finish()
    }
}

impl<'q, 'w> Batch<'q, 'w> {
    /// Returns the table the rows belong to
    pub fn table(&self) -> &'w Table {
        self.table
    }

    /// Returns the id of the table
    pub fn table_id(&self) -> TableId {
        self.entry.table
    }

    /// Returns the first row of the batch
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Returns the number of rows in the batch
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns the entities of the batch
    pub fn entities(&self) -> &'w [Entity] {
        &self.table.entities()[self.offset..self.offset + self.count]
    }

    /// Returns the entity at `i`, relative to the start of the batch
    pub fn entity(&self, i: usize) -> Option<Entity> {
        self.entities().get(i).copied()
    }

    fn resolve(&self, term: usize) -> (Id, Entity, bool) {
        match self.terms[term].src {
            Source::Fixed(_) => match self.fixed.iter().find(|v| v.term == term) {
                Some(v) => (v.id, v.source, v.set),
                None => (self.terms[term].id, Entity::NULL, false),
            },
            _ => (
                self.entry.ids[term],
                self.entry.sources[term],
                self.entry.set[term],
            ),
        }
    }

    /// Returns the concrete id matched by a term.
    ///
    /// Pairs of union relationships carry the target of the first row of the batch, except
    /// for `(R, Any)` terms which match the whole table and return `(R, Union)`. Unset terms
    /// return their pattern.
    pub fn id(&self, term: usize) -> Id {
        let (id, _, set) = self.resolve(term);
        let union = id.second() == Some(UNION.index()) && self.world.is_union(id.first());
        if !set || !union || self.terms[term].id.is_any() {
            return id;
        }

        match self.pair_target(term) {
            Some(target) => Id::pair_indices(id.first(), target.index()),
            None => id,
        }
    }

    /// Returns the target matched by a pair term, for the first row of the batch
    pub fn pair_target(&self, term: usize) -> Option<Entity> {
        let (id, source, set) = self.resolve(term);
        if !set {
            return None;
        }

        let second = id.second()?;
        if second == UNION.index() && self.world.is_union(id.first()) {
            if source.is_null() {
                return self.table.union_target(id.first(), self.offset);
            }

            let relationship = self.world.get_alive(id.first())?;
            return self.world.target(source, relationship, 0);
        }

        self.world.get_alive(second)
    }

    /// Returns the entity a term was matched on.
    ///
    /// Returns `None` for terms matched on the iterated entities.
    pub fn source(&self, term: usize) -> Option<Entity> {
        let (_, source, set) = self.resolve(term);
        (set && !source.is_null()).then_some(source)
    }

    /// Returns true if an optional term was matched
    pub fn is_set(&self, term: usize) -> bool {
        self.resolve(term).2
    }

    /// Returns true if the term was matched on the iterated entities
    pub fn is_self(&self, term: usize) -> bool {
        self.resolve(term).1.is_null()
    }

    /// Returns the data matched by a term.
    ///
    /// Terms matched on another entity yield a single shared value.
    pub fn field<T: ComponentValue>(&self, term: usize) -> Result<AtomicRef<'w, [T]>> {
        let (id, source, set) = self.resolve(term);
        if !set || self.terms[term].oper == Oper::Not {
            return Err(Error::InvalidAccess(term));
        }

        if !self.world.component_info(id).is_some_and(|v| v.has_data()) {
            return Err(Error::InvalidAccess(term));
        }

        if source.is_null() {
            let (start, end) = (self.offset, self.offset + self.count);
            let column = self.table.borrow::<T>(id)?;
            return Ok(AtomicRef::map(column, |v| &v[start..end]));
        }

        let record = self.world.record(source)?;
        let table = self.world.tables.get(record.table);
        let row = record.row;
        let column = table.borrow::<T>(id)?;
        Ok(AtomicRef::map(column, |v| &v[row..=row]))
    }

    /// Returns the data matched by a writable term
    pub fn field_mut<T: ComponentValue>(&self, term: usize) -> Result<AtomicRefMut<'w, [T]>> {
        let (id, source, set) = self.resolve(term);
        let desc = &self.terms[term];
        if !set || desc.access != Access::InOut || !source.is_null() || desc.oper == Oper::Not {
            return Err(Error::InvalidAccess(term));
        }

        if !self.world.component_info(id).is_some_and(|v| v.has_data()) {
            return Err(Error::InvalidAccess(term));
        }

        let (start, end) = (self.offset, self.offset + self.count);
        let column = self.table.borrow_mut::<T>(id)?;
        Ok(AtomicRefMut::map(column, |v| &mut v[start..end]))
    }

    /// Returns the entity bound to a named variable
    pub fn var(&self, name: &str) -> Option<Entity> {
        let index = self.vars.iter().position(|v| v == name)?;
        self.world.get_alive(self.entry.vars[index])
    }

    /// Returns every target the table holds for the pattern of a wildcard pair term.
    ///
    /// For terms which are matched once per pair, this includes targets matched by other
    /// entries of the same table.
    pub fn targets(&self, term: usize) -> SmallVec<[Entity; 4]> {
        let (id, source, set) = self.resolve(term);
        let pattern = self.terms[term].id;
        if !set || !pattern.is_pair() {
            return SmallVec::new();
        }

        if self.world.is_union(pattern.first()) {
            return self.pair_target(term).into_iter().collect();
        }

        let table = if source.is_null() {
            Some(self.table)
        } else {
            self.world
                .record(source)
                .ok()
                .and_then(|v| self.world.tables.try_get(v.table))
        };

        let Some(table) = table else {
            return SmallVec::new();
        };

        let pattern = if pattern.is_wildcard() {
            pattern
        } else {
            id
        };

        table
            .find(pattern)
            .filter_map(|v| v.second())
            .filter_map(|v| self.world.get_alive(v))
            .collect()
    }
}
