//! Per-scheme signed-data payloads.
//!
//! Each scheme entry in the signing block is a length-prefixed sequence of
//! signers. A signer is the signed-data payload (digests, certificates,
//! attributes, and for v3+ an SDK range), one or more signatures over the
//! exact encoded payload bytes, and the signer's public key. Everything is
//! little-endian with u32 length prefixes.

use apkseal_schema::SignatureAlgorithm;
use apkseal_schema::sdk::ApiLevel;

use crate::crypto::{Certificate, SignerIdentity};
use crate::error::{Result, SealError};
use crate::wire::{Reader, put_len_prefixed, put_u32};

/// v2 attribute invalidating the signature if a newer scheme's entry is
/// stripped; the value is the highest scheme version present at signing.
pub const STRIPPING_PROTECTION_ATTR_ID: u32 = 0xbeef_f00d;
/// v3/v3.1 attribute carrying the serialized rotation lineage.
pub const PROOF_OF_ROTATION_ATTR_ID: u32 = 0x3ba0_6f8c;
/// v3.1 attribute recording the rotation-minimum SDK the signer targets.
pub const ROTATION_MIN_SDK_ATTR_ID: u32 = 0x559f_8b02;
/// v3.1 attribute marking a rotation that targets the development release.
pub const ROTATION_ON_DEV_RELEASE_ATTR_ID: u32 = 0xc2a6_b3ba;
/// v2/v3 attribute holding the SHA2-256 digest of the source-stamp
/// certificate.
pub const SOURCE_STAMP_CERT_DIGEST_ATTR_ID: u32 = 0xe43c_5946;

/// Which scheme a signer block is encoded for. v3 and v3.1 share a layout;
/// v2 has no SDK range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemeVersion {
    /// Whole-block scheme, platform `v2_floor`+.
    V2,
    /// Rotation-aware scheme, platform `v3_floor`+.
    V3,
    /// Targeted-rotation scheme, platform `v31_threshold`+.
    V31,
}

impl SchemeVersion {
    /// Signing-block entry id for this scheme.
    pub fn block_id(self) -> u32 {
        match self {
            Self::V2 => crate::block::V2_BLOCK_ID,
            Self::V3 => crate::block::V3_BLOCK_ID,
            Self::V31 => crate::block::V31_BLOCK_ID,
        }
    }

    /// Whether signer and signed data carry a min/max SDK range.
    pub fn has_sdk_range(self) -> bool {
        !matches!(self, Self::V2)
    }

    /// Ordering for "which scheme does an in-range verifier check first".
    pub fn priority(self) -> u32 {
        match self {
            Self::V2 => 2,
            Self::V3 => 3,
            Self::V31 => 4,
        }
    }
}

impl std::fmt::Display for SchemeVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::V2 => "v2",
            Self::V3 => "v3",
            Self::V31 => "v3.1",
        })
    }
}

/// A signer ready for encoding, one variant per scheme version.
#[derive(Debug, Clone)]
pub enum SchemeSigner {
    /// v2: no SDK range.
    V2(SignerBlock),
    /// v3: SDK range present.
    V3(SignerBlock),
    /// v3.1: SDK range plus rotation-targeting attributes.
    V31(SignerBlock),
}

impl SchemeSigner {
    /// The scheme this signer is encoded for.
    pub fn version(&self) -> SchemeVersion {
        match self {
            Self::V2(_) => SchemeVersion::V2,
            Self::V3(_) => SchemeVersion::V3,
            Self::V31(_) => SchemeVersion::V31,
        }
    }

    /// The underlying block.
    pub fn block(&self) -> &SignerBlock {
        match self {
            Self::V2(b) | Self::V3(b) | Self::V31(b) => b,
        }
    }
}

/// An auxiliary (id, value) attribute inside signed data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Attribute id.
    pub id: u32,
    /// Raw value bytes.
    pub value: Vec<u8>,
}

impl Attribute {
    /// Attribute with a little-endian u32 value.
    pub fn of_u32(id: u32, value: u32) -> Self {
        Self {
            id,
            value: value.to_le_bytes().to_vec(),
        }
    }

    /// Attribute with no value (presence is the signal).
    pub fn marker(id: u32) -> Self {
        Self { id, value: Vec::new() }
    }

    /// Read the value as a little-endian u32.
    pub fn as_u32(&self) -> Result<u32> {
        let bytes: [u8; 4] = self.value.as_slice().try_into().map_err(|_| {
            SealError::Malformed(format!("attribute {:#010x} is not 4 bytes", self.id))
        })?;
        Ok(u32::from_le_bytes(bytes))
    }
}

/// The signed-data payload for one signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedData {
    /// Content digests, tagged by the signature algorithm that covers them.
    pub digests: Vec<(SignatureAlgorithm, Vec<u8>)>,
    /// Certificate chain, leaf first.
    pub certificates: Vec<Certificate>,
    /// Min/max SDK range; `None` for v2.
    pub sdk_range: Option<(ApiLevel, ApiLevel)>,
    /// Auxiliary attributes in encoded order.
    pub attributes: Vec<Attribute>,
}

impl SignedData {
    /// First attribute with `id`.
    pub fn attribute(&self, id: u32) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.id == id)
    }
}

/// One fully-assembled signer: payload, signatures over its exact encoded
/// bytes, and the signer's public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerBlock {
    /// The parsed payload.
    pub signed_data: SignedData,
    /// The exact bytes the signatures cover. Kept verbatim so re-encoding
    /// quirks of foreign tooling can never break verification.
    pub signed_data_raw: Vec<u8>,
    /// SDK range repeated outside the payload; must mirror the payload's.
    pub sdk_range: Option<(ApiLevel, ApiLevel)>,
    /// Signatures, algorithm-tagged.
    pub signatures: Vec<(SignatureAlgorithm, Vec<u8>)>,
    /// SPKI DER of the signing key.
    pub public_key: Vec<u8>,
}

/// Assembles and signs one signer's payload for one scheme.
#[derive(Debug)]
pub struct SignedDataBuilder<'a> {
    version: SchemeVersion,
    identity: &'a SignerIdentity,
    digests: Vec<(SignatureAlgorithm, Vec<u8>)>,
    sdk_range: Option<(ApiLevel, ApiLevel)>,
    attributes: Vec<Attribute>,
}

impl<'a> SignedDataBuilder<'a> {
    /// Start a builder for `identity` under `version`.
    pub fn new(version: SchemeVersion, identity: &'a SignerIdentity) -> Self {
        Self {
            version,
            identity,
            digests: Vec::new(),
            sdk_range: None,
            attributes: Vec::new(),
        }
    }

    /// Add a content digest covered by `algorithm`.
    pub fn digest(mut self, algorithm: SignatureAlgorithm, digest: Vec<u8>) -> Self {
        self.digests.push((algorithm, digest));
        self
    }

    /// Set the signer's SDK range (v3/v3.1 only).
    pub fn sdk_range(mut self, min: ApiLevel, max: ApiLevel) -> Self {
        self.sdk_range = Some((min, max));
        self
    }

    /// Append an auxiliary attribute.
    pub fn attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Encode the payload and sign it with every algorithm that has a
    /// digest, producing the finished signer block.
    pub fn build(self) -> Result<SchemeSigner> {
        if self.version.has_sdk_range() != self.sdk_range.is_some() {
            return Err(SealError::Malformed(
                "SDK range presence does not match scheme version".into(),
            ));
        }
        let signed_data = SignedData {
            digests: self.digests,
            certificates: self.identity.certificates.clone(),
            sdk_range: self.sdk_range,
            attributes: self.attributes,
        };
        let raw = encode_signed_data(&signed_data);

        let mut signatures = Vec::with_capacity(signed_data.digests.len());
        for (algorithm, _) in &signed_data.digests {
            let signature = self.identity.capability.sign(*algorithm, &raw)?;
            signatures.push((*algorithm, signature));
        }

        let block = SignerBlock {
            signed_data,
            signed_data_raw: raw,
            sdk_range: self.sdk_range,
            signatures,
            public_key: self.identity.leaf().encoded().to_vec(),
        };
        Ok(match self.version {
            SchemeVersion::V2 => SchemeSigner::V2(block),
            SchemeVersion::V3 => SchemeSigner::V3(block),
            SchemeVersion::V31 => SchemeSigner::V31(block),
        })
    }
}

/// Encode a scheme entry value: a length-prefixed sequence of signers.
pub fn encode_scheme_block(signers: &[SchemeSigner]) -> Vec<u8> {
    let mut seq = Vec::new();
    for signer in signers {
        let encoded = encode_signer(signer.block(), signer.version());
        put_len_prefixed(&mut seq, &encoded);
    }
    let mut out = Vec::with_capacity(seq.len() + 4);
    put_len_prefixed(&mut out, &seq);
    out
}

/// Decode a scheme entry value back into signer blocks.
pub fn decode_scheme_block(version: SchemeVersion, bytes: &[u8]) -> Result<Vec<SignerBlock>> {
    let mut outer = Reader::new(bytes);
    let seq = outer.len_prefixed()?;
    if !outer.is_empty() {
        return Err(SealError::Malformed("trailing bytes after signer sequence".into()));
    }
    let mut r = Reader::new(seq);
    let mut signers = Vec::new();
    while !r.is_empty() {
        let signer_bytes = r.len_prefixed()?;
        signers.push(decode_signer(version, signer_bytes)?);
    }
    if signers.is_empty() {
        return Err(SealError::Malformed("scheme entry contains no signers".into()));
    }
    Ok(signers)
}

fn encode_signer(block: &SignerBlock, version: SchemeVersion) -> Vec<u8> {
    let mut out = Vec::new();
    put_len_prefixed(&mut out, &block.signed_data_raw);
    if version.has_sdk_range() {
        let (min, max) = block.sdk_range.unwrap_or((0, 0));
        put_u32(&mut out, min);
        put_u32(&mut out, max);
    }
    let mut sigs = Vec::new();
    for (algorithm, signature) in &block.signatures {
        let mut one = Vec::with_capacity(signature.len() + 8);
        put_u32(&mut one, algorithm.id());
        put_len_prefixed(&mut one, signature);
        put_len_prefixed(&mut sigs, &one);
    }
    put_len_prefixed(&mut out, &sigs);
    put_len_prefixed(&mut out, &block.public_key);
    out
}

fn decode_signer(version: SchemeVersion, bytes: &[u8]) -> Result<SignerBlock> {
    let mut r = Reader::new(bytes);
    let raw = r.len_prefixed()?.to_vec();
    let outer_range = if version.has_sdk_range() {
        Some((r.u32()?, r.u32()?))
    } else {
        None
    };
    let mut signatures = Vec::new();
    let mut sigs = Reader::new(r.len_prefixed()?);
    while !sigs.is_empty() {
        let mut one = Reader::new(sigs.len_prefixed()?);
        let alg_id = one.u32()?;
        let signature = one.len_prefixed()?.to_vec();
        // Unknown algorithm ids from newer tooling are skipped, not fatal:
        // some other signature in the set may still be checkable.
        if let Some(algorithm) = SignatureAlgorithm::from_id(alg_id) {
            signatures.push((algorithm, signature));
        }
    }
    let public_key = r.len_prefixed()?.to_vec();
    if !r.is_empty() {
        return Err(SealError::Malformed("trailing bytes after signer".into()));
    }

    let signed_data = decode_signed_data(version, &raw)?;
    if signed_data.sdk_range != outer_range {
        return Err(SealError::Malformed(
            "signer SDK range does not match signed data".into(),
        ));
    }
    Ok(SignerBlock {
        signed_data,
        signed_data_raw: raw,
        sdk_range: outer_range,
        signatures,
        public_key,
    })
}

fn encode_signed_data(data: &SignedData) -> Vec<u8> {
    let mut out = Vec::new();

    let mut digests = Vec::new();
    for (algorithm, digest) in &data.digests {
        let mut one = Vec::with_capacity(digest.len() + 8);
        put_u32(&mut one, algorithm.id());
        put_len_prefixed(&mut one, digest);
        put_len_prefixed(&mut digests, &one);
    }
    put_len_prefixed(&mut out, &digests);

    let mut certs = Vec::new();
    for cert in &data.certificates {
        put_len_prefixed(&mut certs, cert.encoded());
    }
    put_len_prefixed(&mut out, &certs);

    if let Some((min, max)) = data.sdk_range {
        put_u32(&mut out, min);
        put_u32(&mut out, max);
    }

    let mut attrs = Vec::new();
    for attr in &data.attributes {
        let mut one = Vec::with_capacity(attr.value.len() + 4);
        put_u32(&mut one, attr.id);
        one.extend_from_slice(&attr.value);
        put_len_prefixed(&mut attrs, &one);
    }
    put_len_prefixed(&mut out, &attrs);

    out
}

fn decode_signed_data(version: SchemeVersion, bytes: &[u8]) -> Result<SignedData> {
    let mut r = Reader::new(bytes);

    let mut digests = Vec::new();
    let mut dr = Reader::new(r.len_prefixed()?);
    while !dr.is_empty() {
        let mut one = Reader::new(dr.len_prefixed()?);
        let alg_id = one.u32()?;
        let digest = one.len_prefixed()?.to_vec();
        if let Some(algorithm) = SignatureAlgorithm::from_id(alg_id) {
            digests.push((algorithm, digest));
        }
    }

    let mut certificates = Vec::new();
    let mut cr = Reader::new(r.len_prefixed()?);
    while !cr.is_empty() {
        let der = cr.len_prefixed()?;
        let cert = Certificate::from_spki_der(der)
            .map_err(|e| SealError::Malformed(format!("unparseable signer certificate: {e}")))?;
        certificates.push(cert);
    }
    if certificates.is_empty() {
        return Err(SealError::Malformed("signer carries no certificates".into()));
    }

    let sdk_range = if version.has_sdk_range() {
        Some((r.u32()?, r.u32()?))
    } else {
        None
    };

    let mut attributes = Vec::new();
    let mut ar = Reader::new(r.len_prefixed()?);
    while !ar.is_empty() {
        let mut one = Reader::new(ar.len_prefixed()?);
        let id = one.u32()?;
        let value = one.take(one.remaining())?.to_vec();
        attributes.push(Attribute { id, value });
    }

    if !r.is_empty() {
        return Err(SealError::Malformed("trailing bytes after signed data".into()));
    }
    Ok(SignedData {
        digests,
        certificates,
        sdk_range,
        attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyringSigner;
    use std::sync::Arc;

    fn identity() -> SignerIdentity {
        use rand::RngCore;
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        let signer =
            KeyringSigner::from_ed25519(ed25519_dalek::SigningKey::from_bytes(&seed)).unwrap();
        SignerIdentity::new(Arc::new(signer))
    }

    fn digest32() -> Vec<u8> {
        vec![0x5e; 32]
    }

    #[test]
    fn v2_signer_round_trips() {
        let id = identity();
        let signer = SignedDataBuilder::new(SchemeVersion::V2, &id)
            .digest(SignatureAlgorithm::Ed25519, digest32())
            .attribute(Attribute::of_u32(STRIPPING_PROTECTION_ATTR_ID, 3))
            .build()
            .unwrap();
        let bytes = encode_scheme_block(std::slice::from_ref(&signer));
        let decoded = decode_scheme_block(SchemeVersion::V2, &bytes).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0], *signer.block());
        assert_eq!(
            decoded[0]
                .signed_data
                .attribute(STRIPPING_PROTECTION_ATTR_ID)
                .unwrap()
                .as_u32()
                .unwrap(),
            3
        );
    }

    #[test]
    fn v3_signer_carries_sdk_range_in_both_places() {
        let id = identity();
        let signer = SignedDataBuilder::new(SchemeVersion::V3, &id)
            .digest(SignatureAlgorithm::Ed25519, digest32())
            .sdk_range(28, u32::MAX)
            .build()
            .unwrap();
        let bytes = encode_scheme_block(std::slice::from_ref(&signer));
        let decoded = decode_scheme_block(SchemeVersion::V3, &bytes).unwrap();
        assert_eq!(decoded[0].sdk_range, Some((28, u32::MAX)));
        assert_eq!(decoded[0].signed_data.sdk_range, Some((28, u32::MAX)));
    }

    #[test]
    fn signature_covers_raw_signed_data() {
        let id = identity();
        let signer = SignedDataBuilder::new(SchemeVersion::V2, &id)
            .digest(SignatureAlgorithm::Ed25519, digest32())
            .build()
            .unwrap();
        let block = signer.block();
        let (alg, sig) = &block.signatures[0];
        assert!(
            id.capability
                .certificate()
                .verify(*alg, &block.signed_data_raw, sig)
                .unwrap()
        );
    }

    #[test]
    fn missing_sdk_range_for_v3_is_rejected() {
        let id = identity();
        let err = SignedDataBuilder::new(SchemeVersion::V3, &id)
            .digest(SignatureAlgorithm::Ed25519, digest32())
            .build()
            .unwrap_err();
        assert!(matches!(err, SealError::Malformed(_)));
    }

    #[test]
    fn mismatched_outer_range_is_malformed() {
        let id = identity();
        let signer = SignedDataBuilder::new(SchemeVersion::V3, &id)
            .digest(SignatureAlgorithm::Ed25519, digest32())
            .sdk_range(28, 32)
            .build()
            .unwrap();
        let mut bytes = encode_scheme_block(std::slice::from_ref(&signer));
        // Outer min-SDK sits right after the two sequence length prefixes
        // and the raw signed data.
        let raw_len = signer.block().signed_data_raw.len();
        let outer_min_pos = 4 + 4 + 4 + raw_len;
        bytes[outer_min_pos] ^= 0x01;
        assert!(matches!(
            decode_scheme_block(SchemeVersion::V3, &bytes),
            Err(SealError::Malformed(_))
        ));
    }

    #[test]
    fn empty_scheme_block_is_malformed() {
        let bytes = encode_scheme_block(&[]);
        assert!(matches!(
            decode_scheme_block(SchemeVersion::V2, &bytes),
            Err(SealError::Malformed(_))
        ));
    }

    #[test]
    fn marker_attribute_round_trips_empty() {
        let id = identity();
        let signer = SignedDataBuilder::new(SchemeVersion::V31, &id)
            .digest(SignatureAlgorithm::Ed25519, digest32())
            .sdk_range(33, u32::MAX)
            .attribute(Attribute::marker(ROTATION_ON_DEV_RELEASE_ATTR_ID))
            .build()
            .unwrap();
        let bytes = encode_scheme_block(std::slice::from_ref(&signer));
        let decoded = decode_scheme_block(SchemeVersion::V31, &bytes).unwrap();
        let attr = decoded[0]
            .signed_data
            .attribute(ROTATION_ON_DEV_RELEASE_ATTR_ID)
            .unwrap();
        assert!(attr.value.is_empty());
    }
}
