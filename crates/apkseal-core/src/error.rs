//! Error taxonomy for signing and verification.
//!
//! Four families with different recovery stories: malformed containers are
//! always fatal; configuration errors are caller-fixable and reported before
//! cryptographic work where possible; a missing scheme entry is recoverable
//! for a verifier; cryptographic failures abort the operation.

use apkseal_schema::sdk::ApiLevel;
use thiserror::Error;

/// Top-level error for signing-block operations.
#[derive(Error, Debug)]
pub enum SealError {
    /// The signing-block container itself is damaged: truncated trailer,
    /// bad magic, or inconsistent lengths. Always fatal.
    #[error("malformed signing block: {0}")]
    Malformed(String),

    /// The caller's configuration cannot produce a consistent block.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// No entry with the requested id exists in the block. A verifier
    /// treats this as "scheme not used" unless the scheme was mandatory
    /// for the checked platform range.
    #[error("no signature entry with id {0:#010x}")]
    SignatureNotFound(u32),

    /// A signing-primitive failure or unusable key/digest combination.
    #[error("cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Filesystem failure while emitting output.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Caller-fixable configuration problems, rejected at finalize or resolve
/// time with no partial output.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No signer configs were supplied at all.
    #[error("at least one signer is required")]
    NoSigners,

    /// The rotation lineage's original signer is required for the legacy
    /// schemes but is not among the supplied configs.
    #[error("lineage's oldest signer is not among the supplied signer configs")]
    MissingOriginalSigner,

    /// Legacy-compatible schemes cap the signer count.
    #[error("{count} signers exceeds the maximum of {max} for legacy-compatible schemes")]
    TooManySigners {
        /// Number of signers supplied.
        count: usize,
        /// Hard cap.
        max: usize,
    },

    /// Two targeted configs claim the same rotation target, or more than
    /// one config folds into the coarse v3 block.
    #[error("conflicting rotation target at API level {0}")]
    ConflictingTarget(ApiLevel),

    /// Supplied lineages do not share a common prefix.
    #[error("divergent lineages: chains disagree at a shared position")]
    DivergentLineage,

    /// A certificate was expected in a lineage but is not a member.
    #[error("signer certificate not present in lineage")]
    SignerNotInLineage,

    /// A lineage node's proof-of-rotation signature does not verify
    /// against the previous node's key.
    #[error("lineage node {0}: proof-of-rotation signature does not verify")]
    InvalidProof(usize),

    /// The package is debuggable and the request did not permit that.
    #[error("package is debuggable and debuggable signing was not permitted")]
    DebuggablePackage,

    /// A rotation target the resolver cannot express, e.g. below the
    /// coarse scheme's floor.
    #[error("unsupported rotation target: API level {0}")]
    UnsupportedRotationTarget(ApiLevel),
}

/// Failures inside the pluggable signing capability or key handling.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// The algorithm id is known but this build cannot produce or check
    /// signatures with it.
    #[error("unsupported signature algorithm id {0:#06x}")]
    UnsupportedAlgorithm(u32),

    /// The underlying primitive rejected the operation.
    #[error("signature primitive failure: {0}")]
    Primitive(String),

    /// A key does not match the algorithm family it was asked to serve.
    #[error("key type does not match requested algorithm")]
    KeyMismatch,

    /// Key too weak for the digest strength the targeted platform range
    /// requires.
    #[error("{bits}-bit key too weak for the requested algorithm at min API level {min_sdk}")]
    WeakKey {
        /// Modulus or group size in bits.
        bits: usize,
        /// Minimum platform level the signer targets.
        min_sdk: ApiLevel,
    },

    /// Public key bytes could not be parsed as SPKI DER.
    #[error("malformed public key: {0}")]
    MalformedKey(String),
}

/// Shorthand used throughout the crate.
pub type Result<T, E = SealError> = std::result::Result<T, E>;
