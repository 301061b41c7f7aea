//! Multi-scheme package signing-block engine.
//!
//! The crate signs and verifies the dedicated signing block spliced into a
//! zip-shaped package between the entries region and the central directory.
//! [`orchestrator::sign`] and [`orchestrator::verify`] are the entry
//! points; everything else is the machinery behind them: content digesting,
//! per-scheme signed-data payloads, rotation lineages, target resolution
//! and the block container codec.

pub mod block;
pub mod config;
pub mod crypto;
pub mod digest;
pub mod error;
pub mod lineage;
pub mod orchestrator;
pub mod resolver;
pub mod signed_data;
mod wire;

pub use config::{SealedRequest, SigningRequest};
pub use crypto::{Certificate, KeyringSigner, SignerCapability, SignerIdentity};
pub use digest::{ContentSource, SlicedContent};
pub use error::{ConfigError, CryptoError, Result, SealError};
pub use lineage::Lineage;
pub use orchestrator::{SignedBlock, VerificationReport, sign, verify, write_atomically};
pub use resolver::{SchemeSet, TargetedSignerConfig};
