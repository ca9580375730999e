mod config;
mod manager;
mod slot;

pub use config::*;
pub use manager::*;
pub use slot::*;
