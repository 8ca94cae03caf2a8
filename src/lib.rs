//! An archetypal entity store with relationships, cached queries and deferred commands.
//!
//! Entities are plain generational handles. Every entity is stored in the table matching its
//! exact, sorted set of ids, where each id is either a component carrying data, a tag or a
//! `(relationship, target)` pair.
//!
//! Tables are connected through memoized add and remove edges, which means moving an entity
//! between tables never re-derives a type from scratch.
//!
//! Queries match tables rather than entities and keep a cache which is updated incrementally as
//! new tables are created.
//!
//! Structural changes can be deferred, either through [`World::begin_defer`] or by entering read
//! only mode and recording into per thread [`Stage`]s, which are replayed in order at the merge
//! point.
//!
//! ```rust
//! use tessera::*;
//!
//! #[derive(Debug, PartialEq)]
//! struct Position(f32, f32);
//! struct Velocity(f32, f32);
//!
//! let mut world = World::new();
//! let position = world.component::<Position>();
//! let velocity = world.component::<Velocity>();
//!
//! let a = world.create();
//! world.set(a, position, Position(0.0, 0.0)).unwrap();
//! world.set(a, velocity, Velocity(1.0, 0.0)).unwrap();
//!
//! let mut query = Query::builder()
//!     .with_mut(position)
//!     .with(velocity)
//!     .build(&world)
//!     .unwrap();
//!
//! for batch in query.iter(&world) {
//!     let mut pos = batch.field_mut::<Position>(0).unwrap();
//!     let vel = batch.field::<Velocity>(1).unwrap();
//!     for (pos, vel) in pos.iter_mut().zip(vel.iter()) {
//!         pos.0 += vel.0;
//!         pos.1 += vel.1;
//!     }
//! }
//!
//! assert_eq!(*world.get(a, position).unwrap(), Position(1.0, 0.0));
//! ```
#![warn(missing_docs)]

#[cfg(feature = "puffin")]
macro_rules! profile_function {
    ($($tt: tt)*) => {
        puffin::profile_function!($($tt)*);
    };
}

#[cfg(not(feature = "puffin"))]
macro_rules! profile_function {
    ($($tt: tt)*) => {};
}

#[cfg(feature = "puffin")]
macro_rules! profile_scope {
    ($($tt: tt)*) => {
        puffin::profile_scope!($($tt)*);
    };
}

#[cfg(not(feature = "puffin"))]
macro_rules! profile_scope {
    ($($tt: tt)*) => {};
}

mod buffer;
/// Deferred structural changes
pub mod commands;
mod component;
mod entity;
/// Error types
pub mod error;
mod id;
/// Cached, incrementally updated queries
pub mod query;
mod stage;
/// Table storage
pub mod table;
mod tables;
mod traits;
mod world;

pub use commands::CommandBuffer;
pub use component::*;
pub use entity::{Entity, EntityGen, EntityIndex, EntityRecord, RecordFlags};
pub use error::{Error, Result};
pub use id::*;
pub use query::{Access, Batch, Oper, Query, QueryBuilder, Source, Term};
pub use stage::*;
pub use table::{Table, TableId};
pub use traits::*;
pub use world::*;
