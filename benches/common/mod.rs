#![allow(clippy::new_without_default)]

pub mod add_remove;
pub mod deferred;
pub mod frag_iter;
pub mod simple_insert;
pub mod simple_iter;
pub mod union_switch;
