//! CLI command implementations

pub mod energy;
pub mod healing;
pub mod network;
pub mod towers;
