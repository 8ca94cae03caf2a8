use itertools::Itertools;
use smallvec::{smallvec, SmallVec};

use super::{Oper, Source, Term};
use crate::{
    error::Result,
    id::{is_wildcard_index, ANY, UNION, WILDCARD},
    table::{Table, TableId},
    Access, Entity, EntityIndex, Error, Id, IdTraits, World,
};

/// Restricts the rows of a table by the per row target of a union relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UnionFilter {
    pub(crate) relationship: EntityIndex,
    /// `None` accepts any target, but yields every row on its own
    pub(crate) target: Option<EntityIndex>,
}

/// One way the terms of a query match a table
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub(crate) table: TableId,
    /// The concrete id matched by each term
    pub(crate) ids: SmallVec<[Id; 8]>,
    /// The entity each term was matched on, or null for the iterated entity
    pub(crate) sources: SmallVec<[Entity; 8]>,
    pub(crate) set: SmallVec<[bool; 8]>,
    /// Index of the entity bound to each variable
    pub(crate) vars: SmallVec<[EntityIndex; 4]>,
    pub(crate) filters: SmallVec<[UnionFilter; 2]>,
}

/// Result of a term with a fixed source, evaluated once per iteration
#[derive(Debug, Clone, Copy)]
pub(crate) struct FixedMatch {
    pub(crate) term: usize,
    pub(crate) id: Id,
    pub(crate) source: Entity,
    pub(crate) set: bool,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: Id,
    source: Entity,
    filter: Option<UnionFilter>,
}

/// Validated terms, ready to be matched against tables
#[derive(Debug, Clone)]
pub(crate) struct Plan {
    /// Terms evaluated per table, required terms first
    pub(crate) order: Vec<usize>,
    /// Terms with a fixed source
    pub(crate) fixed: Vec<usize>,
    pub(crate) vars: Vec<String>,
    pub(crate) term_vars: Vec<Option<usize>>,
    /// Matches depend on the tables of other entities
    pub(crate) traverses: bool,
    /// An id which every matching table is indexed under
    pub(crate) narrow: Option<Id>,
}

fn invalid<T>(term: usize, reason: &'static str) -> Result<T> {
    Err(Error::InvalidQueryShape { term, reason })
}

fn is_transitive_pair(world: &World, id: Id) -> bool {
    match id.second() {
        Some(second) => {
            !is_wildcard_index(id.first())
                && !is_wildcard_index(second)
                && world
                    .registry
                    .traits(id.first())
                    .contains(IdTraits::TRANSITIVE)
        }
        None => false,
    }
}

impl Plan {
    pub(crate) fn compile(world: &World, terms: &[Term]) -> Result<Self> {
        profile_function!();
        let mut vars: Vec<String> = Vec::new();
        let mut term_vars = Vec::with_capacity(terms.len());

        for (i, term) in terms.iter().enumerate() {
            let id = term.id;
            if id == Id::NULL {
                return invalid(i, "the null id matches nothing");
            }

            let union = id.is_pair() && world.is_union(id.first());

            match term.src {
                Source::This => {}
                Source::Fixed(entity) => {
                    if is_wildcard_index(entity.index()) {
                        return invalid(i, "a wildcard can not be a source");
                    }
                }
                Source::Up(rel) | Source::SelfUp(rel) => {
                    if is_wildcard_index(rel.index()) {
                        return invalid(i, "traversal needs a concrete relationship");
                    }

                    if world.is_union(rel.index()) {
                        return invalid(i, "union relationships can not be traversed");
                    }

                    if union {
                        return invalid(i, "union pairs can only be matched on the iterated entity");
                    }
                }
            }

            if term.access == Access::InOut && term.src != Source::This {
                return invalid(i, "fields of other entities are read only");
            }

            if union && term.oper != Oper::And && id.second().is_some_and(|v| !is_wildcard_index(v)) {
                return invalid(i, "union pairs with a target can only be required");
            }

            let var = match &term.var {
                None => None,
                Some(name) => {
                    if !id.second().is_some_and(is_wildcard_index) {
                        return invalid(i, "variables bind the wildcard target of a pair");
                    }

                    if term.src != Source::This {
                        return invalid(i, "variables can only be bound on the iterated entity");
                    }

                    if union {
                        return invalid(i, "union targets are stored per row and can not bind variables");
                    }

                    match vars.iter().position(|v| v == name) {
                        Some(index) => Some(index),
                        None => {
                            vars.push(name.clone());
                            Some(vars.len() - 1)
                        }
                    }
                }
            };

            term_vars.push(var);
        }

        for (var, _) in vars.iter().enumerate() {
            let bound = terms
                .iter()
                .zip(&term_vars)
                .any(|(term, &v)| v == Some(var) && term.oper == Oper::And);

            if !bound {
                let term = term_vars.iter().position(|&v| v == Some(var)).unwrap_or_default();
                return invalid(term, "variables must be bound by a required term");
            }
        }

        let order = [Oper::And, Oper::Optional, Oper::Not]
            .into_iter()
            .flat_map(|oper| {
                terms
                    .iter()
                    .enumerate()
                    .filter(move |(_, term)| term.oper == oper && !matches!(term.src, Source::Fixed(_)))
                    .map(|(i, _)| i)
            })
            .collect_vec();

        let fixed = terms
            .iter()
            .positions(|term| matches!(term.src, Source::Fixed(_)))
            .collect_vec();

        let traverses = terms
            .iter()
            .any(|term| term.src.traversal().is_some() || is_transitive_pair(world, term.id));

        let narrow = terms
            .iter()
            .filter(|term| term.oper == Oper::And && term.src == Source::This)
            .find_map(|term| narrow_key(world, term.id));

        Ok(Self {
            order,
            fixed,
            vars,
            term_vars,
            traverses,
            narrow,
        })
    }
}

/// Returns an id which every table matching `id` is indexed under
fn narrow_key(world: &World, id: Id) -> Option<Id> {
    let Some(second) = id.second() else {
        return (!id.is_wildcard()).then_some(id);
    };

    let first = id.first();
    if is_wildcard_index(first) && is_wildcard_index(second) {
        return None;
    }

    if world.is_union(first) {
        return Some(Id::pair_indices(first, UNION.index()));
    }

    if is_transitive_pair(world, id) {
        return Some(Id::pair_indices(first, WILDCARD.index()));
    }

    let any_to_wildcard = |v| if v == ANY.index() { WILDCARD.index() } else { v };
    Some(Id::pair_indices(any_to_wildcard(first), any_to_wildcard(second)))
}

struct State {
    ids: SmallVec<[Id; 8]>,
    sources: SmallVec<[Entity; 8]>,
    set: SmallVec<[bool; 8]>,
    vars: SmallVec<[EntityIndex; 4]>,
    filters: SmallVec<[UnionFilter; 2]>,
}

/// Matches the terms of a query against tables
pub(crate) struct Matcher<'a> {
    pub(crate) world: &'a World,
    pub(crate) terms: &'a [Term],
    pub(crate) plan: &'a Plan,
}

impl<'a> Matcher<'a> {
    /// Appends an entry for every way the table matches
    pub(crate) fn match_table(&self, table_id: TableId, table: &Table, out: &mut Vec<CacheEntry>) {
        let n = self.terms.len();
        let mut state = State {
            ids: self.terms.iter().map(|v| v.id).collect(),
            sources: smallvec![Entity::NULL; n],
            set: smallvec![false; n],
            vars: smallvec![0; self.plan.vars.len()],
            filters: SmallVec::new(),
        };

        let len = out.len();
        self.visit(table_id, table, 0, &mut state, out);

        if out.len() > len {
            tracing::trace!(%table_id, entries = out.len() - len, "matched table");
        }
    }

    fn visit(
        &self,
        table_id: TableId,
        table: &Table,
        step: usize,
        state: &mut State,
        out: &mut Vec<CacheEntry>,
    ) {
        let Some(&index) = self.plan.order.get(step) else {
            out.push(CacheEntry {
                table: table_id,
                ids: state.ids.clone(),
                sources: state.sources.clone(),
                set: state.set.clone(),
                vars: state.vars.clone(),
                filters: state.filters.clone(),
            });
            return;
        };

        let term = &self.terms[index];
        let candidates = self.candidates(table, index, state);

        match term.oper {
            Oper::Not => {
                if candidates.is_empty() {
                    self.visit(table_id, table, step + 1, state, out);
                }
            }
            Oper::Optional if candidates.is_empty() => {
                self.visit(table_id, table, step + 1, state, out);
            }
            Oper::And | Oper::Optional => {
                for candidate in candidates {
                    let var = self.plan.term_vars[index];
                    let prev = var.map(|v| state.vars[v]);

                    state.ids[index] = candidate.id;
                    state.sources[index] = candidate.source;
                    state.set[index] = true;

                    if let (Some(var), Some(second)) = (var, candidate.id.second()) {
                        state.vars[var] = second;
                    }

                    if let Some(filter) = candidate.filter {
                        state.filters.push(filter);
                    }

                    self.visit(table_id, table, step + 1, state, out);

                    if candidate.filter.is_some() {
                        state.filters.pop();
                    }

                    if let (Some(var), Some(prev)) = (var, prev) {
                        state.vars[var] = prev;
                    }

                    state.ids[index] = term.id;
                    state.sources[index] = Entity::NULL;
                    state.set[index] = false;
                }
            }
        }
    }

    fn candidates(&self, table: &Table, index: usize, state: &State) -> SmallVec<[Candidate; 4]> {
        let term = &self.terms[index];

        let mut pattern = term.id;
        if let Some(var) = self.plan.term_vars[index] {
            let bound = state.vars[var];
            if bound != 0 {
                pattern = pattern.with_second(bound);
            }
        }

        let mut candidates = match term.src {
            Source::This => self.self_candidates(table, pattern),
            Source::Up(rel) => self
                .up(table, rel.index(), pattern, self.world.traversal_depth)
                .into_iter()
                .collect(),
            Source::SelfUp(rel) => {
                let candidates = self.self_candidates(table, pattern);
                if candidates.is_empty() {
                    self.up(table, rel.index(), pattern, self.world.traversal_depth)
                        .into_iter()
                        .collect()
                } else {
                    candidates
                }
            }
            Source::Fixed(_) => SmallVec::new(),
        };

        if pattern.is_any() {
            candidates.truncate(1);
        }

        candidates
    }

    fn self_candidates(&self, table: &Table, pattern: Id) -> SmallVec<[Candidate; 4]> {
        if let Some(second) = pattern.second() {
            let rel = pattern.first();

            if self.world.is_union(rel) {
                let storage = Id::pair_indices(rel, UNION.index());
                if !table.has(storage) {
                    return SmallVec::new();
                }

                let target = if second == ANY.index() {
                    None
                } else if second == WILDCARD.index() {
                    Some(UnionFilter {
                        relationship: rel,
                        target: None,
                    })
                } else {
                    Some(UnionFilter {
                        relationship: rel,
                        target: Some(second),
                    })
                };

                return smallvec![Candidate {
                    id: storage,
                    source: Entity::NULL,
                    filter: target,
                }];
            }

            if is_transitive_pair(self.world, pattern) && !table.has(pattern) {
                return table
                    .find(Id::pair_indices(rel, WILDCARD.index()))
                    .filter(|id| {
                        id.second().is_some_and(|from| {
                            self.reaches(rel, from, second, self.world.traversal_depth)
                        })
                    })
                    .map(|id| Candidate {
                        id,
                        source: Entity::NULL,
                        filter: None,
                    })
                    .collect();
            }
        }

        table
            .find(pattern)
            .map(|id| Candidate {
                id,
                source: Entity::NULL,
                filter: None,
            })
            .collect()
    }

    /// Returns true if `target` can be reached from `from` by following `rel`
    fn reaches(&self, rel: EntityIndex, from: EntityIndex, target: EntityIndex, depth: usize) -> bool {
        if depth == 0 {
            return false;
        }

        let Some(table) = self.table_of(from) else {
            return false;
        };

        table
            .find(Id::pair_indices(rel, WILDCARD.index()))
            .filter_map(|id| id.second())
            .any(|next| next == target || self.reaches(rel, next, target, depth - 1))
    }

    fn table_of(&self, index: EntityIndex) -> Option<&'a Table> {
        let entity = self.world.get_alive(index)?;
        let record = self.world.record(entity).ok()?;
        self.world.tables.try_get(record.table)
    }

    /// Finds the closest entity above `table` which has `pattern`
    fn up(&self, table: &Table, rel: EntityIndex, pattern: Id, depth: usize) -> Option<Candidate> {
        if depth == 0 {
            return None;
        }

        for id in table.find(Id::pair_indices(rel, WILDCARD.index())) {
            let Some(target) = id.second().and_then(|v| self.world.get_alive(v)) else {
                continue;
            };

            let Some(target_table) = self.table_of(target.index()) else {
                continue;
            };

            if let Some(found) = self.self_candidates(target_table, pattern).first() {
                return Some(Candidate {
                    id: found.id,
                    source: target,
                    filter: None,
                });
            }

            if let Some(found) = self.up(target_table, rel, pattern, depth - 1) {
                return Some(found);
            }
        }

        None
    }

    /// Evaluates a term with a fixed source
    pub(crate) fn fixed(&self, index: usize) -> FixedMatch {
        let term = &self.terms[index];
        let Source::Fixed(source) = term.src else {
            unreachable!("term {index} does not have a fixed source");
        };

        let mut result = FixedMatch {
            term: index,
            id: term.id,
            source,
            set: false,
        };

        let found = match self.world.record(source) {
            Ok(record) => {
                let table = self.world.tables.get(record.table);
                if term.id.is_pair() && self.world.is_union(term.id.first()) {
                    self.world
                        .has(source, term.id)
                        .then(|| Id::pair_indices(term.id.first(), UNION.index()))
                } else {
                    self.self_candidates(table, term.id).first().map(|v| v.id)
                }
            }
            Err(_) => None,
        };

        if let Some(id) = found {
            result.id = id;
            result.set = true;
        }

        result
    }
}
