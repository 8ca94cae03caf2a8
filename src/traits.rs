bitflags::bitflags! {
    /// Relationship metadata attached to an id.
    ///
    /// Traits are read by the table graph and the query engine and must be set before the id is
    /// first used.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IdTraits: u8 {
        /// An entity can have at most one target of the relationship. Adding a new target
        /// replaces the old one.
        const EXCLUSIVE = 1;
        /// `(R, A)` and `(R, B)` on `A` implies `(R, B)`.
        const TRANSITIVE = 2;
        /// The entity can not be the target of a transitive relationship.
        const FINAL = 4;
        /// All targets of the relationship share a single table, the target is stored per row.
        const UNION = 8;
        /// Deleting a target deletes every entity which has it as target of the relationship.
        const CASCADE = 16;
    }
}

impl IdTraits {
    /// Returns true if adding a new target should replace the existing one
    pub fn is_exclusive(&self) -> bool {
        self.intersects(Self::EXCLUSIVE | Self::UNION)
    }
}
