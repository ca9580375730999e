//! Time-ordered 64-bit Snowflake identifiers whose instance field comes from
//! a static pair, a slot leased from a coordination ensemble, or the local
//! network address.

mod ensemble;
mod error;
mod fallback;
mod generator;
mod id;
mod lease;
mod provider;
mod rand;
mod time;

pub use crate::ensemble::*;
pub use crate::error::*;
pub use crate::fallback::*;
pub use crate::generator::*;
pub use crate::id::*;
pub use crate::lease::*;
pub use crate::provider::*;
pub use crate::rand::*;
pub use crate::time::*;
