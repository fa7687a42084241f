//! Memory for fiber stacks.
//!
//! [`StackArena`] reserves one region and slices it into fixed-size blocks;
//! [`FreeList`] recycles released blocks without allocating.

pub mod free_list;
pub mod stack_arena;

pub use free_list::FreeList;
pub use stack_arena::{StackArena, StackLease};
