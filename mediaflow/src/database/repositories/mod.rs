//! Repository layer for database access.
//!
//! Each repository is a trait with a SQLite implementation and an in-memory
//! implementation that shares the same semantics.

pub mod dead_letter;
pub mod memory;
pub mod stage_result;
pub mod work_item;

pub use dead_letter::*;
pub use memory::*;
pub use stage_result::*;
pub use work_item::*;
