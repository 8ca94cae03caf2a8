use core::fmt::{self, Display, Formatter};

use crate::{Entity, Id};

/// The different kinds of errors which can occur when interacting with a [`World`](crate::World)
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The entity does not exist or has been deleted and recycled
    NotAlive(Entity),
    /// The requested entity index is already taken by another live entity
    EntityOccupied(Entity),
    /// A component was registered again with a different shape
    InconsistentComponentInfo {
        /// The offending id
        id: Id,
        /// Which part of the registration conflicted
        reason: &'static str,
    },
    /// The query terms describe something the matcher can not represent
    InvalidQueryShape {
        /// Index of the offending term
        term: usize,
        /// Why the term was rejected
        reason: &'static str,
    },
    /// A structural change was attempted directly while the world is read only
    ReadonlyViolation,
    /// Attempt to inherit from an entity which is marked as final
    FinalOverride {
        /// The inheriting relationship
        relationship: Entity,
        /// The final target
        target: Entity,
    },
    /// The entity does not have the requested component, or the id carries no data
    MissingComponent(Entity, Id),
    /// A data component was added without a value and has no constructor hook
    MissingConstructor(Id),
    /// A payload could not be duplicated since the component has no copy hook
    MissingCopy(Id),
    /// The component was registered for another Rust type
    MismatchedType {
        /// The component id
        id: Id,
        /// The type the caller asked for
        expected: &'static str,
    },
    /// The component column is already borrowed mutably
    Borrow(Id),
    /// The component column can not be borrowed mutably as it is already borrowed
    BorrowMut(Id),
    /// The query field is not writable or the term has no data
    InvalidAccess(usize),
    /// Builtin entities can not be deleted
    Builtin(Entity),
}

/// Result alias for the crate
pub type Result<T, E = Error> = core::result::Result<T, E>;

impl Error {
    /// Convert the error into an anyhow report
    pub fn into_anyhow(self) -> anyhow::Error {
        anyhow::Error::new(self)
    }

    /// Returns true if the error stems from a dead or recycled handle
    pub fn is_not_alive(&self) -> bool {
        matches!(self, Self::NotAlive(_))
    }
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotAlive(id) => write!(f, "Entity {id} is not alive"),
            Error::EntityOccupied(id) => write!(f, "Entity index of {id} is already in use"),
            Error::InconsistentComponentInfo { id, reason } => {
                write!(f, "Inconsistent registration of {id}: {reason}")
            }
            Error::InvalidQueryShape { term, reason } => {
                write!(f, "Invalid query term {term}: {reason}")
            }
            Error::ReadonlyViolation => {
                write!(f, "Attempt to modify the table graph while the world is read only")
            }
            Error::FinalOverride {
                relationship,
                target,
            } => write!(
                f,
                "Entity {target} is final and can not be a target of {relationship}"
            ),
            Error::MissingComponent(id, component) => {
                write!(f, "Entity {id} does not have a value for {component}")
            }
            Error::MissingConstructor(id) => {
                write!(f, "Component {id} has no constructor and no value was given")
            }
            Error::MissingCopy(id) => write!(f, "Component {id} can not be copied"),
            Error::MismatchedType { id, expected } => {
                write!(f, "Component {id} is not of type {expected}")
            }
            Error::Borrow(id) => write!(f, "Component {id} is already borrowed mutably"),
            Error::BorrowMut(id) => write!(f, "Component {id} is already borrowed"),
            Error::InvalidAccess(term) => write!(f, "Field {term} can not be accessed this way"),
            Error::Builtin(id) => write!(f, "Builtin entity {id} can not be deleted"),
        }
    }
}
