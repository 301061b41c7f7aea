//! Subcommand implementations.

pub mod keygen;
pub mod lineage;
pub mod sign;
pub mod verify;
