use core::fmt;

use crate::{Entity, Id};

/// Where the id of a term is looked up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Source {
    /// The entity being iterated
    #[default]
    This,
    /// A specific entity. Evaluated once per iteration.
    Fixed(Entity),
    /// The closest entity found by following the relationship upward, excluding the entity
    /// itself
    Up(Entity),
    /// The entity itself, or else the closest entity found by following the relationship
    /// upward
    SelfUp(Entity),
}

impl Source {
    /// Returns the relationship followed by upward traversal
    pub fn traversal(&self) -> Option<Entity> {
        match *self {
            Source::Up(rel) | Source::SelfUp(rel) => Some(rel),
            _ => None,
        }
    }
}

/// How the data of a term is accessed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Access {
    /// Read only
    #[default]
    In,
    /// Read and write
    InOut,
    /// The term only filters, its data is not accessed
    None,
}

/// How a term contributes to matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Oper {
    /// The id is required
    #[default]
    And,
    /// The id must not be present
    Not,
    /// The id is matched if present
    Optional,
}

/// A single condition of a query
#[derive(Clone, PartialEq, Eq)]
pub struct Term {
    /// The id or id pattern to match
    pub id: Id,
    /// Where to look for the id
    pub src: Source,
    /// How the data is accessed
    pub access: Access,
    /// How the term contributes to matching
    pub oper: Oper,
    /// Names the entity bound by the wildcard target of a pair.
    ///
    /// All terms using the same variable must bind the same entity.
    pub var: Option<String>,
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Term");
        s.field("id", &self.id);

        if self.src != Source::This {
            s.field("src", &self.src);
        }

        s.field("access", &self.access).field("oper", &self.oper);

        if let Some(var) = &self.var {
            s.field("var", var);
        }

        s.finish()
    }
}

impl Term {
    /// A required, read only term on the iterated entity
    pub fn new(id: impl Into<Id>) -> Self {
        Self {
            id: id.into(),
            src: Source::This,
            access: Access::In,
            oper: Oper::And,
            var: None,
        }
    }

    /// Sets the source
    pub fn src(mut self, src: Source) -> Self {
        self.src = src;
        self
    }

    /// Sets the access
    pub fn access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    /// Sets the operator
    pub fn oper(mut self, oper: Oper) -> Self {
        self.oper = oper;
        self
    }

    /// Binds the wildcard target to a named variable
    pub fn var(mut self, name: impl Into<String>) -> Self {
        self.var = Some(name.into());
        self
    }

    /// Looks for the id by following `relationship` upward
    pub fn up(self, relationship: Entity) -> Self {
        self.src(Source::Up(relationship))
    }

    /// Looks for the id on the entity itself, then by following `relationship` upward
    pub fn self_up(self, relationship: Entity) -> Self {
        self.src(Source::SelfUp(relationship))
    }

    /// Returns true if the term is evaluated against the iterated entity itself
    pub fn is_this(&self) -> bool {
        self.src == Source::This
    }
}
