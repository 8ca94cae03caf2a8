use core::fmt;

use crate::{entity::GEN_MASK, Entity, EntityIndex};

const PAIR: u64 = 1 << 63;
const FIRST_MASK: u64 = GEN_MASK as u64;
const SECOND_MASK: u64 = 0xFFFF_FFFF;

/// Matches any id, and yields one result for every match
pub const WILDCARD: Entity = Entity::from_parts(1, 0);
/// Matches any id, but yields at most one result per table
pub const ANY: Entity = Entity::from_parts(2, 0);
/// Transitive inheritance relationship
pub const IS_A: Entity = Entity::from_parts(3, 0);
/// Exclusive hierarchy relationship. Deleting a parent deletes its children.
pub const CHILD_OF: Entity = Entity::from_parts(4, 0);
/// Marker target used in the table type of union relationships
pub const UNION: Entity = Entity::from_parts(5, 0);

pub(crate) const BUILTINS: [Entity; 5] = [WILDCARD, ANY, IS_A, CHILD_OF, UNION];

/// An id which can be attached to an entity.
///
/// An id is either a plain entity, which is a component when it carries data or a tag
/// otherwise, or a `(relationship, target)` pair.
///
/// # Structure
///
/// Plain ids share the bit layout of [`Entity`]. Pairs set the top bit and store the indices of
/// both halves, dropping their generations:
///
/// | 1    | 7        | 24           | 32     |
/// | Pair | Reserved | Relationship | Target |
///
/// The numeric order of ids is total and sorts pairs after plain ids, grouped by relationship.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Id(u64);

impl Id {
    /// The null id, never attached to any entity
    pub const NULL: Id = Id(0);

    /// Creates a pair id.
    ///
    /// Pairs only store the indices of their halves. A pair built from a stale handle refers
    /// to whichever entity currently lives at that index, so check
    /// [`World::is_alive`](crate::World::is_alive) first when a handle may have been deleted.
    ///
    /// The relationship index must fit in 24 bits.
    pub const fn pair(relationship: Entity, target: Entity) -> Self {
        Self::pair_indices(relationship.index(), target.index())
    }

    pub(crate) const fn pair_indices(relationship: EntityIndex, target: EntityIndex) -> Self {
        debug_assert!(relationship as u64 <= FIRST_MASK);
        Self(PAIR | (relationship as u64 & FIRST_MASK) << 32 | target as u64)
    }

    /// Returns the pair `(relationship, *)`
    pub const fn wildcard_of(relationship: Entity) -> Self {
        Self::pair(relationship, WILDCARD)
    }

    /// Returns the pair `(*, target)`
    pub const fn wildcard_to(target: Entity) -> Self {
        Self::pair(WILDCARD, target)
    }

    /// Returns true if the id is a pair
    #[inline]
    pub const fn is_pair(self) -> bool {
        self.0 & PAIR != 0
    }

    /// Returns the index of the relationship for a pair, or the entity index of a plain id
    #[inline]
    pub const fn first(self) -> EntityIndex {
        if self.is_pair() {
            ((self.0 >> 32) & FIRST_MASK) as u32
        } else {
            self.0 as u32
        }
    }

    /// Returns the index of the target of a pair
    #[inline]
    pub const fn second(self) -> Option<EntityIndex> {
        if self.is_pair() {
            Some((self.0 & SECOND_MASK) as u32)
        } else {
            None
        }
    }

    /// Returns the entity of a plain id
    pub const fn as_entity(self) -> Option<Entity> {
        if self.is_pair() {
            None
        } else {
            Some(Entity::from_bits(self.0))
        }
    }

    /// Returns the same pair, but with a different target
    pub(crate) const fn with_second(self, target: EntityIndex) -> Self {
        Self::pair_indices(self.first(), target)
    }

    /// Returns true if the id contains a wildcard.
    ///
    /// Both [`WILDCARD`] and [`ANY`] count as wildcards.
    pub const fn is_wildcard(self) -> bool {
        if self.is_pair() {
            is_wildcard_index(self.first()) || matches!(self.second(), Some(v) if is_wildcard_index(v))
        } else {
            is_wildcard_index(self.first()) && self.0 >> 32 == 0
        }
    }

    /// Returns true if any half of the id is [`ANY`]
    pub const fn is_any(self) -> bool {
        if self.is_pair() {
            self.first() == ANY.index() || matches!(self.second(), Some(v) if v == ANY.index())
        } else {
            self.0 == ANY.to_bits()
        }
    }

    /// Returns true if `self` is matched by `pattern`, which may contain wildcards
    pub fn matches(self, pattern: Id) -> bool {
        if self == pattern {
            return true;
        }

        if !pattern.is_pair() {
            return pattern.is_wildcard();
        }

        if !self.is_pair() {
            return false;
        }

        let first = pattern.first();
        let second = pattern.second().unwrap_or_default();

        (is_wildcard_index(first) || first == self.first())
            && (is_wildcard_index(second) || Some(second) == self.second())
    }

    /// Returns the raw bits
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    /// Creates an id from raw bits
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }
}

#[inline]
pub(crate) const fn is_wildcard_index(index: EntityIndex) -> bool {
    index == WILDCARD.index() || index == ANY.index()
}

impl From<Entity> for Id {
    fn from(value: Entity) -> Self {
        Self(value.to_bits())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.second() {
            Some(second) => write!(f, "({}, {})", self.first(), second),
            None => write!(f, "{}", Entity::from_bits(self.0)),
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;

    #[test]
    fn pair_halves() {
        let rel = Entity::from_parts(40, 3);
        let target = Entity::from_parts(9000, 17);

        let id = Id::pair(rel, target);
        assert!(id.is_pair());
        assert_eq!(id.first(), 40);
        assert_eq!(id.second(), Some(9000));
        assert_eq!(id.as_entity(), None);

        let plain = Id::from(target);
        assert!(!plain.is_pair());
        assert_eq!(plain.as_entity(), Some(target));
        assert_eq!(plain.first(), 9000);
        assert_eq!(plain.second(), None);
    }

    #[test]
    fn ordering() {
        let a = Entity::from_parts(10, 0);
        let b = Entity::from_parts(11, 0);
        let c = Entity::from_parts(12, 4);

        let ids = [
            Id::pair(b, a),
            Id::from(c),
            Id::pair(a, c),
            Id::from(a),
            Id::pair(a, b),
        ];

        let sorted = ids.into_iter().sorted().collect_vec();

        assert_eq!(
            sorted,
            [
                Id::from(a),
                Id::from(c),
                Id::pair(a, b),
                Id::pair(a, c),
                Id::pair(b, a),
            ]
        );
    }

    #[test]
    fn wildcard_matching() {
        let likes = Entity::from_parts(10, 0);
        let apples = Entity::from_parts(11, 0);
        let pears = Entity::from_parts(12, 0);

        let id = Id::pair(likes, apples);
        assert!(id.matches(Id::wildcard_of(likes)));
        assert!(id.matches(Id::wildcard_to(apples)));
        assert!(id.matches(Id::pair(WILDCARD, WILDCARD)));
        assert!(id.matches(Id::pair(likes, ANY)));
        assert!(!id.matches(Id::wildcard_to(pears)));
        assert!(!Id::from(likes).matches(Id::wildcard_of(likes)));
        assert!(Id::from(likes).matches(WILDCARD.into()));

        assert!(Id::wildcard_of(likes).is_wildcard());
        assert!(Id::pair(ANY, apples).is_any());
        assert!(!id.is_wildcard());
    }
}
