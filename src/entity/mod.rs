mod store;

use core::fmt;

pub(crate) use store::*;
pub use store::{EntityRecord, RecordFlags};

/// The index of an entity in the entity store
pub type EntityIndex = u32;
/// The generation of an entity. Only the low 24 bits are significant
pub type EntityGen = u32;

/// Number of significant generation bits.
///
/// The top byte of an id is reserved for flags, which allows every entity
/// handle to be used as an [`Id`](crate::Id) as-is.
pub(crate) const GEN_BITS: u32 = 24;
pub(crate) const GEN_MASK: u32 = (1 << GEN_BITS) - 1;

/// Represents an entity.
///
/// An entity is a handle without any data of its own. It is valid for as long as its generation
/// matches the live generation of the slot it points to.
///
/// # Structure
///
/// | 8        | 24         | 32    |
/// | Reserved | Generation | Index |
///
/// Index `0` is never handed out, which means `Entity::NULL` never aliases a real entity.
#[derive(PartialOrd, Clone, Copy, PartialEq, Eq, Ord, Hash)]
#[repr(transparent)]
pub struct Entity(u64);

impl Entity {
    /// An entity which is never alive
    pub const NULL: Entity = Entity(0);

    /// Create an entity from its parts
    #[inline]
    pub const fn from_parts(index: EntityIndex, gen: EntityGen) -> Self {
        Self(((gen & GEN_MASK) as u64) << 32 | index as u64)
    }

    #[inline]
    /// Returns the entity index
    pub const fn index(self) -> EntityIndex {
        self.0 as u32
    }

    #[inline]
    /// Extract the generation from the entity
    pub const fn gen(self) -> EntityGen {
        (self.0 >> 32) as u32 & GEN_MASK
    }

    /// Convert the entity into its parts
    pub const fn into_parts(self) -> (EntityIndex, EntityGen) {
        (self.index(), self.gen())
    }

    #[inline]
    /// Returns the raw bits of the entity
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    #[inline]
    /// Creates an entity from raw bits, masking off any flag bits
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits & 0x00FF_FFFF_FFFF_FFFF)
    }

    /// Returns true if this is the null entity
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl Default for Entity {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (index, gen) = self.into_parts();
        write!(f, "{index}v{gen}")
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
