//! Coordination ensemble abstraction.
//!
//! The lease manager only needs a small slice of a ZooKeeper-style service:
//! persistent and session-scoped (ephemeral) nodes, child listing, a
//! mutual-exclusion lock and a stream of connectivity transitions.
//! [`Ensemble`] captures exactly that; [`MemoryEnsemble`] is an in-process
//! implementation with full session semantics.

mod error;
mod interface;
mod memory;
mod retry;

pub use error::*;
pub use interface::*;
pub use memory::*;
pub use retry::*;
