//! Signature and content-digest algorithm identifiers.
//!
//! The numeric ids are the wire values carried inside signed-data payloads;
//! they must survive round-trips with blocks produced by other signers, so
//! they are fixed here and never renumbered.

use serde::{Deserialize, Serialize};

use crate::sdk::{self, ApiLevel};

/// A signature algorithm recognized by the signing-block formats.
///
/// Each variant carries its wire id and implies a [`ContentDigestAlgorithm`]
/// that signers using it must compute over the package content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    /// RSASSA-PSS with SHA2-256, randomized salt (0x0101).
    RsaPssSha256,
    /// RSASSA-PSS with SHA2-512, randomized salt (0x0102).
    RsaPssSha512,
    /// RSASSA-PKCS1-v1_5 with SHA2-256 (0x0103).
    RsaPkcs1Sha256,
    /// RSASSA-PKCS1-v1_5 with SHA2-512 (0x0104).
    RsaPkcs1Sha512,
    /// ECDSA over P-256 with SHA2-256 (0x0201).
    EcdsaSha256,
    /// DSA with SHA2-256 (0x0301). Decoded for interop; signing with it is
    /// not supported.
    DsaSha256,
    /// Ed25519 (0x0801). Extension id outside the upstream table.
    Ed25519,
}

impl SignatureAlgorithm {
    /// All algorithms this build can produce signatures with.
    pub const SUPPORTED: &'static [SignatureAlgorithm] = &[
        SignatureAlgorithm::RsaPssSha256,
        SignatureAlgorithm::RsaPssSha512,
        SignatureAlgorithm::RsaPkcs1Sha256,
        SignatureAlgorithm::RsaPkcs1Sha512,
        SignatureAlgorithm::EcdsaSha256,
        SignatureAlgorithm::Ed25519,
    ];

    /// Wire id of this algorithm.
    pub fn id(self) -> u32 {
        match self {
            Self::RsaPssSha256 => 0x0101,
            Self::RsaPssSha512 => 0x0102,
            Self::RsaPkcs1Sha256 => 0x0103,
            Self::RsaPkcs1Sha512 => 0x0104,
            Self::EcdsaSha256 => 0x0201,
            Self::DsaSha256 => 0x0301,
            Self::Ed25519 => 0x0801,
        }
    }

    /// Look an algorithm up by wire id. Unknown ids return `None`; callers
    /// decide whether that is an error or opaque pass-through.
    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0x0101 => Some(Self::RsaPssSha256),
            0x0102 => Some(Self::RsaPssSha512),
            0x0103 => Some(Self::RsaPkcs1Sha256),
            0x0104 => Some(Self::RsaPkcs1Sha512),
            0x0201 => Some(Self::EcdsaSha256),
            0x0301 => Some(Self::DsaSha256),
            0x0801 => Some(Self::Ed25519),
            _ => None,
        }
    }

    /// The content digest a signer using this algorithm signs over.
    pub fn digest_algorithm(self) -> ContentDigestAlgorithm {
        match self {
            Self::RsaPssSha512 | Self::RsaPkcs1Sha512 => ContentDigestAlgorithm::ChunkedSha512,
            Self::RsaPssSha256
            | Self::RsaPkcs1Sha256
            | Self::EcdsaSha256
            | Self::DsaSha256
            | Self::Ed25519 => ContentDigestAlgorithm::ChunkedSha256,
        }
    }

    /// Earliest platform API level that recognizes this algorithm.
    ///
    /// The whole id table ships with the first signing-block-aware platform
    /// release; the Ed25519 extension rides on the same floor since only our
    /// own tooling consumes it.
    pub fn min_sdk_version(self) -> ApiLevel {
        sdk::N
    }

    /// Whether two signing passes over identical input produce identical
    /// bytes. PSS salts are random; RFC 6979 makes our ECDSA deterministic.
    pub fn is_deterministic(self) -> bool {
        !matches!(self, Self::RsaPssSha256 | Self::RsaPssSha512 | Self::DsaSha256)
    }

    /// Preference order used when a verifier must pick exactly one of a
    /// signer's signatures: higher wins.
    pub fn strength_rank(self) -> u32 {
        match self {
            Self::DsaSha256 => 0,
            Self::RsaPkcs1Sha256 => 1,
            Self::RsaPkcs1Sha512 => 2,
            Self::RsaPssSha256 => 3,
            Self::RsaPssSha512 => 4,
            Self::EcdsaSha256 => 5,
            Self::Ed25519 => 6,
        }
    }
}

/// A content-digest algorithm: the two-level chunked hash every scheme
/// signs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ContentDigestAlgorithm {
    /// 1 MiB chunks hashed with SHA2-256, combined with SHA2-256.
    ChunkedSha256,
    /// 1 MiB chunks hashed with SHA2-512, combined with SHA2-512.
    ChunkedSha512,
}

impl ContentDigestAlgorithm {
    /// Output size of this digest in bytes.
    pub fn digest_len(self) -> usize {
        match self {
            Self::ChunkedSha256 => 32,
            Self::ChunkedSha512 => 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip() {
        for alg in [
            SignatureAlgorithm::RsaPssSha256,
            SignatureAlgorithm::RsaPssSha512,
            SignatureAlgorithm::RsaPkcs1Sha256,
            SignatureAlgorithm::RsaPkcs1Sha512,
            SignatureAlgorithm::EcdsaSha256,
            SignatureAlgorithm::DsaSha256,
            SignatureAlgorithm::Ed25519,
        ] {
            assert_eq!(SignatureAlgorithm::from_id(alg.id()), Some(alg));
        }
    }

    #[test]
    fn unknown_id_is_none() {
        assert_eq!(SignatureAlgorithm::from_id(0xdead_beef), None);
    }

    #[test]
    fn sha512_variants_pick_sha512_digest() {
        assert_eq!(
            SignatureAlgorithm::RsaPkcs1Sha512.digest_algorithm(),
            ContentDigestAlgorithm::ChunkedSha512
        );
        assert_eq!(
            SignatureAlgorithm::EcdsaSha256.digest_algorithm(),
            ContentDigestAlgorithm::ChunkedSha256
        );
    }

    #[test]
    fn pss_is_not_deterministic() {
        assert!(!SignatureAlgorithm::RsaPssSha256.is_deterministic());
        assert!(SignatureAlgorithm::RsaPkcs1Sha256.is_deterministic());
        assert!(SignatureAlgorithm::Ed25519.is_deterministic());
    }
}
