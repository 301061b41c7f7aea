//! Shared wire-level types for the apkseal signing-block engine.
//!
//! Everything in this crate is plain data: algorithm identifiers, rotation
//! capability flags, and platform API levels. The engine itself lives in
//! `apkseal-core`.

pub mod algorithm;
pub mod capabilities;
pub mod sdk;

pub use algorithm::{ContentDigestAlgorithm, SignatureAlgorithm};
pub use capabilities::Capabilities;
pub use sdk::{ApiLevel, PlatformEnv};
