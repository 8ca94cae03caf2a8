mod iter;
mod matcher;
mod term;

use core::fmt;

use itertools::Itertools;

pub use iter::{Batch, QueryIter};
pub use term::{Access, Oper, Source, Term};

use self::matcher::{CacheEntry, FixedMatch, Matcher, Plan};
use crate::{error::Result, tables::TableEvent, Entity, Id, World};

/// A compiled set of terms along with the tables they match.
///
/// The matched tables are cached and updated incrementally as new tables are created, which
/// makes iterating proportional to the number of matching tables rather than all tables.
/// Queries which traverse relationships are rebuilt when an entity used as a relationship
/// target changes its table.
///
/// A query is bound to the world it was compiled for.
pub struct Query {
    terms: Vec<Term>,
    plan: Plan,
    cache: Vec<CacheEntry>,
    fixed: Vec<FixedMatch>,
    world_id: u64,
    /// Position in the table event log of the world
    cursor: usize,
    target_gen: u64,
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("terms", &self.terms)
            .field("entries", &self.cache.len())
            .finish()
    }
}

impl Query {
    /// Compiles the terms and matches them against all existing tables
    pub fn new(world: &World, terms: impl IntoIterator<Item = Term>) -> Result<Self> {
        let terms = terms.into_iter().collect_vec();
        let plan = Plan::compile(world, &terms)?;

        let mut query = Self {
            terms,
            plan,
            cache: Vec::new(),
            fixed: Vec::new(),
            world_id: world.id,
            cursor: 0,
            target_gen: world.target_gen,
        };

        query.rebuild(world);
        Ok(query)
    }

    /// Construct a query term by term
    pub fn builder() -> QueryBuilder {
        QueryBuilder::default()
    }

    /// Returns the terms of the query
    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    fn rebuild(&mut self, world: &World) {
        profile_function!();
        self.cache.clear();

        let matcher = Matcher {
            world,
            terms: &self.terms,
            plan: &self.plan,
        };

        match self.plan.narrow.and_then(|id| world.tables.index.find(id)) {
            Some(tables) => {
                for &table_id in tables.keys() {
                    if let Some(table) = world.tables.try_get(table_id) {
                        matcher.match_table(table_id, table, &mut self.cache);
                    }
                }
            }
            None if self.plan.narrow.is_some() => {}
            None => {
                for (table_id, table) in world.tables.iter() {
                    matcher.match_table(table_id, table, &mut self.cache);
                }
            }
        }

        self.cursor = world.tables.events().cursor();
        self.target_gen = world.target_gen;

        tracing::debug!(entries = self.cache.len(), "rebuilt query cache");
    }

    fn update(&mut self, world: &World) {
        assert_eq!(
            self.world_id, world.id,
            "Query used with a world it was not created for"
        );

        if self.plan.traverses && self.target_gen != world.target_gen {
            self.rebuild(world);
            return;
        }

        let log = world.tables.events();
        if self.cursor == log.cursor() {
            return;
        }

        let Some(events) = log.since(self.cursor) else {
            tracing::debug!("table events were discarded before being read");
            self.rebuild(world);
            return;
        };

        profile_scope!("update query cache");
        let matcher = Matcher {
            world,
            terms: &self.terms,
            plan: &self.plan,
        };

        for &event in events {
            match event {
                TableEvent::Created(table_id) => {
                    if let Some(table) = world.tables.try_get(table_id) {
                        matcher.match_table(table_id, table, &mut self.cache);
                    }
                }
                TableEvent::Deleted(table_id) => {
                    self.cache.retain(|v| v.table != table_id);
                }
            }
        }

        self.cursor = log.cursor();
    }

    /// Iterates the batches of matching rows.
    ///
    /// # Panics
    /// If the world is not the one the query was compiled for
    pub fn iter<'q, 'w>(&'q mut self, world: &'w World) -> QueryIter<'q, 'w> {
        self.update(world);

        let matcher = Matcher {
            world,
            terms: &self.terms,
            plan: &self.plan,
        };

        self.fixed.clear();
        self.fixed
            .extend(self.plan.fixed.iter().map(|&term| matcher.fixed(term)));

        let done = self.fixed.iter().any(|v| match self.terms[v.term].oper {
            Oper::And => !v.set,
            Oper::Not => v.set,
            Oper::Optional => false,
        });

        QueryIter {
            world,
            terms: &self.terms,
            vars: &self.plan.vars,
            fixed: &self.fixed,
            entries: self.cache.iter(),
            current: None,
            row: 0,
            done,
        }
    }

    /// Returns the number of rows the query yields.
    ///
    /// Entities matched through several entries are counted once per entry.
    pub fn count(&mut self, world: &World) -> usize {
        self.iter(world).map(|v| v.count()).sum()
    }

    /// Collects the entities of every yielded row
    pub fn entities(&mut self, world: &World) -> Vec<Entity> {
        self.iter(world)
            .flat_map(|v| v.entities().iter().copied())
            .collect()
    }

    /// Returns the number of distinct tables the query matches, including empty ones
    pub fn table_count(&mut self, world: &World) -> usize {
        self.update(world);
        self.cache.iter().map(|v| v.table).unique().count()
    }
}

/// Incrementally constructs a [`Query`]
#[derive(Default, Debug, Clone)]
pub struct QueryBuilder {
    terms: Vec<Term>,
}

impl QueryBuilder {
    /// Requires `id`, reading its data
    pub fn with(self, id: impl Into<Id>) -> Self {
        self.term(Term::new(id))
    }

    /// Requires `id`, allowing its data to be written
    pub fn with_mut(self, id: impl Into<Id>) -> Self {
        self.term(Term::new(id).access(Access::InOut))
    }

    /// Excludes entities which have `id`
    pub fn without(self, id: impl Into<Id>) -> Self {
        self.term(Term::new(id).oper(Oper::Not).access(Access::None))
    }

    /// Matches `id` if present
    pub fn optional(self, id: impl Into<Id>) -> Self {
        self.term(Term::new(id).oper(Oper::Optional))
    }

    /// Appends a term
    pub fn term(mut self, term: Term) -> Self {
        self.terms.push(term);
        self
    }

    /// Compiles the query for `world`
    pub fn build(self, world: &World) -> Result<Query> {
        Query::new(world, self.terms)
    }
}
