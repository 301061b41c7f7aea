//! Drives a whole signing or verification pass.
//!
//! Signing: resolve signer targets, digest the content once, build each
//! enabled scheme's signer blocks, merge preserved foreign entries and
//! serialize the container. Verification is the mirror image, except that
//! nothing short of a damaged container aborts early: every scheme is
//! checked and every finding lands in the [`VerificationReport`].

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use apkseal_schema::sdk::ApiLevel;
use apkseal_schema::{ContentDigestAlgorithm, PlatformEnv, SignatureAlgorithm};

use sha2::{Digest, Sha256};

use crate::block::{
    self, BlockEntry, SigningBlock, V2_BLOCK_ID, V3_BLOCK_ID, V31_BLOCK_ID,
};
use crate::config::SealedRequest;
use crate::crypto::{Certificate, SignerIdentity};
use crate::digest::{ContentSource, compute_digests};
use crate::error::{Result, SealError};
use crate::lineage::Lineage;
use crate::resolver::{ResolvedTargets, SchemeSet, resolve};
use crate::signed_data::{
    Attribute, PROOF_OF_ROTATION_ATTR_ID, ROTATION_MIN_SDK_ATTR_ID,
    ROTATION_ON_DEV_RELEASE_ATTR_ID, SOURCE_STAMP_CERT_DIGEST_ATTR_ID, SchemeSigner,
    SchemeVersion, SignedDataBuilder, SignerBlock, STRIPPING_PROTECTION_ATTR_ID,
    decode_scheme_block, encode_scheme_block,
};

/// Digest handoff for a streaming side-channel signer: the verified
/// content digest of the strongest scheme actually written, plus the
/// certificates a consumer should pin.
#[derive(Debug, Clone)]
pub struct V4Handoff {
    /// Which content digest `digest` is.
    pub algorithm: ContentDigestAlgorithm,
    /// The top-level content digest.
    pub digest: Vec<u8>,
    /// Certificate chain of the handoff signer, leaf first.
    pub certificates: Vec<Certificate>,
}

/// Output of a signing pass.
#[derive(Debug, Clone)]
pub struct SignedBlock {
    /// The serialized signing block, ready to splice between the entries
    /// region and the central directory.
    pub bytes: Vec<u8>,
    /// Digest handoff, when the request asked for it.
    pub v4_digest: Option<V4Handoff>,
}

/// Sign `source` under `request`, producing the serialized block.
///
/// `existing_block` is the raw signing block already present in the
/// package, if any; recognized scheme entries in it are always replaced,
/// and foreign entries survive only when the request says to preserve
/// them.
pub fn sign(
    request: &SealedRequest,
    source: &dyn ContentSource,
    existing_block: Option<&[u8]>,
) -> Result<SignedBlock> {
    let resolved = resolve(
        &request.signers,
        request.schemes,
        request.lineage.as_ref(),
        request.rotation_min_sdk,
        &request.env,
    )?;

    // One digest pass covers every algorithm any emitted signer signs with.
    let mut digest_algorithms: Vec<ContentDigestAlgorithm> = Vec::new();
    for identity in emitted_identities(&resolved, request.schemes) {
        for algorithm in identity.capability.algorithms() {
            let digest = algorithm.digest_algorithm();
            if !digest_algorithms.contains(&digest) {
                digest_algorithms.push(digest);
            }
        }
    }
    let digests = compute_digests(source, &digest_algorithms)?;

    let v31_written = request.schemes.v31 && !resolved.v31.is_empty();
    let v3_written = request.schemes.v3 && resolved.v3.is_some();
    let stamp_attr = request
        .source_stamp_certificate
        .as_ref()
        .map(|cert| Attribute {
            id: SOURCE_STAMP_CERT_DIGEST_ATTR_ID,
            value: Sha256::digest(cert.encoded()).to_vec(),
        });

    let mut entries: Vec<BlockEntry> = Vec::new();
    let mut handoff: Option<(&SignerIdentity, SchemeVersion)> = None;

    if request.schemes.v2 {
        let mut signers = Vec::with_capacity(resolved.v2.len());
        for identity in &resolved.v2 {
            let mut attributes = Vec::new();
            if v3_written || v31_written {
                // Invalidates this entry if a newer scheme's entry is
                // later stripped from the block.
                attributes.push(Attribute::of_u32(STRIPPING_PROTECTION_ATTR_ID, 3));
            }
            if let Some(attr) = &stamp_attr {
                attributes.push(attr.clone());
            }
            signers.push(scheme_signer(
                SchemeVersion::V2,
                identity,
                &digests,
                None,
                attributes,
            )?);
        }
        entries.push(BlockEntry::new(V2_BLOCK_ID, encode_scheme_block(&signers)));
        handoff = resolved.v2.first().map(|i| (i, SchemeVersion::V2));
    }

    if request.schemes.v3 && let Some(assignment) = &resolved.v3 {
        let mut attributes = Vec::new();
        if let Some(lineage) = &assignment.lineage
            && lineage.len() >= 2
        {
            attributes.push(Attribute {
                id: PROOF_OF_ROTATION_ATTR_ID,
                value: lineage.encode(),
            });
        }
        if let Some(attr) = &stamp_attr {
            attributes.push(attr.clone());
        }
        let signer = scheme_signer(
            SchemeVersion::V3,
            &assignment.identity,
            &digests,
            Some((assignment.min_sdk, assignment.max_sdk)),
            attributes,
        )?;
        entries.push(BlockEntry::new(
            V3_BLOCK_ID,
            encode_scheme_block(std::slice::from_ref(&signer)),
        ));
        handoff = Some((&assignment.identity, SchemeVersion::V3));
    }

    if v31_written {
        let mut signers = Vec::with_capacity(resolved.v31.len());
        for assignment in &resolved.v31 {
            let mut attributes = Vec::new();
            if let Some(lineage) = &assignment.lineage
                && lineage.len() >= 2
            {
                attributes.push(Attribute {
                    id: PROOF_OF_ROTATION_ATTR_ID,
                    value: lineage.encode(),
                });
            }
            attributes.push(Attribute::of_u32(
                ROTATION_MIN_SDK_ATTR_ID,
                assignment.min_sdk,
            ));
            if assignment.dev_release {
                attributes.push(Attribute::marker(ROTATION_ON_DEV_RELEASE_ATTR_ID));
            }
            signers.push(scheme_signer(
                SchemeVersion::V31,
                &assignment.identity,
                &digests,
                Some((assignment.min_sdk, assignment.max_sdk)),
                attributes,
            )?);
        }
        entries.push(BlockEntry::new(V31_BLOCK_ID, encode_scheme_block(&signers)));
        handoff = resolved
            .v31
            .last()
            .map(|a| (&a.identity, SchemeVersion::V31));
    }

    if request.preserve_foreign_entries
        && let Some(existing) = existing_block
    {
        let parsed = SigningBlock::parse(existing)?;
        entries.extend(block::carryover_entries(
            &parsed.entries,
            &[V2_BLOCK_ID, V3_BLOCK_ID, V31_BLOCK_ID],
        ));
    }

    let bytes = block::serialize(&entries, source.entries().len(), request.alignment);
    tracing::debug!(
        entries = entries.len(),
        size = bytes.len(),
        "serialized signing block"
    );

    let v4_digest = if request.schemes.v4 {
        handoff
            .map(|(identity, _)| -> Result<V4Handoff> {
                let algorithm = strongest_digest(identity, &digests)?;
                Ok(V4Handoff {
                    algorithm,
                    digest: digests[&algorithm].clone(),
                    certificates: identity.certificates.clone(),
                })
            })
            .transpose()?
    } else {
        None
    };

    Ok(SignedBlock { bytes, v4_digest })
}

/// Identities a signing pass will actually emit, over all enabled schemes.
fn emitted_identities<'a>(
    resolved: &'a ResolvedTargets,
    schemes: SchemeSet,
) -> Vec<&'a SignerIdentity> {
    let mut out = Vec::new();
    if schemes.v2 {
        out.extend(resolved.v2.iter());
    }
    if schemes.v3 && let Some(assignment) = &resolved.v3 {
        out.push(&assignment.identity);
    }
    if schemes.v31 {
        out.extend(resolved.v31.iter().map(|a| &a.identity));
    }
    out
}

fn scheme_signer(
    version: SchemeVersion,
    identity: &SignerIdentity,
    digests: &BTreeMap<ContentDigestAlgorithm, Vec<u8>>,
    sdk_range: Option<(ApiLevel, ApiLevel)>,
    attributes: Vec<Attribute>,
) -> Result<SchemeSigner> {
    let mut builder = SignedDataBuilder::new(version, identity);
    for algorithm in identity.capability.algorithms() {
        let digest = digests.get(&algorithm.digest_algorithm()).ok_or_else(|| {
            SealError::Malformed(format!(
                "no content digest computed for algorithm {:#06x}",
                algorithm.id()
            ))
        })?;
        builder = builder.digest(algorithm, digest.clone());
    }
    if let Some((min, max)) = sdk_range {
        builder = builder.sdk_range(min, max);
    }
    for attribute in attributes {
        builder = builder.attribute(attribute);
    }
    builder.build()
}

fn strongest_digest(
    identity: &SignerIdentity,
    digests: &BTreeMap<ContentDigestAlgorithm, Vec<u8>>,
) -> Result<ContentDigestAlgorithm> {
    identity
        .capability
        .algorithms()
        .iter()
        .map(|a| a.digest_algorithm())
        .filter(|d| digests.contains_key(d))
        .max()
        .ok_or_else(|| SealError::Malformed("signer has no computed content digest".into()))
}

/// Outcome of checking one scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemeStatus {
    /// No entry with this scheme's id exists in the block.
    NotUsed,
    /// Every signer in the entry checked out.
    Verified,
    /// The entry exists but at least one check failed.
    Failed,
}

/// Per-scheme verification result.
#[derive(Debug, Clone)]
pub struct SchemeReport {
    /// The scheme checked.
    pub version: SchemeVersion,
    /// Overall outcome for this scheme.
    pub status: SchemeStatus,
    /// Leaf certificates of the entry's signers, in entry order.
    pub certificates: Vec<Certificate>,
    /// Everything that went wrong, in discovery order.
    pub errors: Vec<String>,
}

/// Accumulated result of a verification pass.
///
/// Per-scheme findings live in `schemes`; `errors` holds cross-scheme
/// problems no single entry owns (coverage gaps, divergent lineages,
/// stripping).
#[derive(Debug, Clone)]
pub struct VerificationReport {
    /// One report per requested scheme, strongest first.
    pub schemes: Vec<SchemeReport>,
    /// The rotation lineage all schemes agreed on, if any carried one.
    pub lineage: Option<Lineage>,
    /// Cross-scheme errors.
    pub errors: Vec<String>,
}

impl VerificationReport {
    /// Whether the package verifies: at least one scheme checked out and
    /// nothing failed anywhere.
    pub fn verified(&self) -> bool {
        self.errors.is_empty()
            && self
                .schemes
                .iter()
                .any(|s| s.status == SchemeStatus::Verified)
            && self
                .schemes
                .iter()
                .all(|s| s.status != SchemeStatus::Failed)
    }

    /// The report for `version`, if that scheme was requested.
    pub fn scheme(&self, version: SchemeVersion) -> Option<&SchemeReport> {
        self.schemes.iter().find(|s| s.version == version)
    }

    /// Machine-readable rendering for tooling output.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "verified": self.verified(),
            "schemes": self.schemes.iter().map(|s| serde_json::json!({
                "scheme": s.version.to_string(),
                "status": match s.status {
                    SchemeStatus::NotUsed => "not used",
                    SchemeStatus::Verified => "verified",
                    SchemeStatus::Failed => "failed",
                },
                "certificates": s.certificates.iter()
                    .map(Certificate::fingerprint)
                    .collect::<Vec<_>>(),
                "errors": s.errors,
            })).collect::<Vec<_>>(),
            "lineage": self.lineage.as_ref().map(|l| l.nodes().iter().map(|n| {
                serde_json::json!({
                    "certificate": n.certificate.fingerprint(),
                    "capabilities": n.capabilities.bits(),
                })
            }).collect::<Vec<_>>()),
            "errors": self.errors,
        })
    }
}

enum DecodedEntry {
    NotUsed,
    Malformed(String),
    Signers(Vec<SignerBlock>),
}

/// Verify `block` against `source` for platforms in `platform_range`.
///
/// Only a damaged container or an unreadable source is an `Err`; every
/// signature, digest or consistency finding is accumulated in the report.
pub fn verify(
    source: &dyn ContentSource,
    block: &[u8],
    requested: SchemeSet,
    platform_range: (ApiLevel, ApiLevel),
    env: &PlatformEnv,
) -> Result<VerificationReport> {
    let parsed = SigningBlock::parse(block)?;

    let checked: Vec<SchemeVersion> = [
        (requested.v31, SchemeVersion::V31),
        (requested.v3, SchemeVersion::V3),
        (requested.v2, SchemeVersion::V2),
    ]
    .into_iter()
    .filter_map(|(on, v)| on.then_some(v))
    .collect();

    let mut decoded: Vec<(SchemeVersion, DecodedEntry)> = Vec::with_capacity(checked.len());
    for version in checked {
        let entry = match parsed.find(version.block_id()) {
            Ok(value) => match decode_scheme_block(version, value) {
                Ok(signers) => DecodedEntry::Signers(signers),
                Err(e) => DecodedEntry::Malformed(e.to_string()),
            },
            Err(SealError::SignatureNotFound(_)) => DecodedEntry::NotUsed,
            Err(e) => return Err(e),
        };
        decoded.push((version, entry));
    }

    // Digest the content once, over every algorithm any signer will be
    // checked with.
    let mut digest_algorithms: Vec<ContentDigestAlgorithm> = Vec::new();
    for (_, entry) in &decoded {
        if let DecodedEntry::Signers(signers) = entry {
            for signer in signers {
                if let Some((algorithm, _)) = best_signature(signer) {
                    let digest = algorithm.digest_algorithm();
                    if !digest_algorithms.contains(&digest) {
                        digest_algorithms.push(digest);
                    }
                }
            }
        }
    }
    let digests = compute_digests(source, &digest_algorithms)?;

    let mut report = VerificationReport {
        schemes: Vec::new(),
        lineage: None,
        errors: Vec::new(),
    };
    let mut lineages: Vec<Lineage> = Vec::new();
    let mut coverage: Vec<(ApiLevel, ApiLevel)> = Vec::new();
    let mut v2_signers: Vec<SignerBlock> = Vec::new();

    for (version, entry) in decoded {
        let scheme_report = match entry {
            DecodedEntry::NotUsed => SchemeReport {
                version,
                status: SchemeStatus::NotUsed,
                certificates: Vec::new(),
                errors: Vec::new(),
            },
            DecodedEntry::Malformed(message) => SchemeReport {
                version,
                status: SchemeStatus::Failed,
                certificates: Vec::new(),
                errors: vec![message],
            },
            DecodedEntry::Signers(signers) => {
                let scheme_report =
                    check_scheme(version, &signers, &digests, &mut lineages);
                if scheme_report.status == SchemeStatus::Verified {
                    coverage.extend(scheme_coverage(version, &signers, env));
                }
                if version == SchemeVersion::V2 {
                    v2_signers = signers;
                }
                scheme_report
            }
        };
        report.schemes.push(scheme_report);
    }

    // Cross-scheme lineage agreement.
    let mut merged: Option<Lineage> = None;
    for lineage in &lineages {
        merged = Some(match merged {
            None => lineage.clone(),
            Some(existing) => match Lineage::merge(&existing, lineage) {
                Ok(m) => m,
                Err(_) => {
                    report
                        .errors
                        .push("schemes carry divergent rotation lineages".into());
                    existing
                }
            },
        });
    }
    report.lineage = merged;

    // Stripping protection: a verified v2 entry that promised a v3 entry
    // invalidates the block when that entry is gone.
    let v2_verified = report
        .scheme(SchemeVersion::V2)
        .is_some_and(|s| s.status == SchemeStatus::Verified);
    let v3_missing = report
        .scheme(SchemeVersion::V3)
        .is_some_and(|s| s.status == SchemeStatus::NotUsed);
    let v31_missing = report
        .scheme(SchemeVersion::V31)
        .is_some_and(|s| s.status == SchemeStatus::NotUsed);
    if v2_verified && v3_missing && v31_missing {
        let promised = v2_signers.iter().any(|s| {
            s.signed_data
                .attribute(STRIPPING_PROTECTION_ATTR_ID)
                .and_then(|a| a.as_u32().ok())
                .is_some_and(|v| v >= 3)
        });
        if promised {
            report
                .errors
                .push("v3 signature promised by stripping protection is gone".into());
        }
    }

    if let Some((gap_min, gap_max)) = coverage_gap(coverage, platform_range, env) {
        report.errors.push(format!(
            "no verified scheme covers API levels {gap_min}..={gap_max}"
        ));
    }

    tracing::debug!(
        verified = report.verified(),
        errors = report.errors.len(),
        "verification finished"
    );
    Ok(report)
}

/// Strongest signature present on a signer, if any is usable.
fn best_signature(signer: &SignerBlock) -> Option<(SignatureAlgorithm, &[u8])> {
    signer
        .signatures
        .iter()
        .max_by_key(|(algorithm, _)| algorithm.strength_rank())
        .map(|(algorithm, signature)| (*algorithm, signature.as_slice()))
}

fn check_scheme(
    version: SchemeVersion,
    signers: &[SignerBlock],
    digests: &BTreeMap<ContentDigestAlgorithm, Vec<u8>>,
    lineages: &mut Vec<Lineage>,
) -> SchemeReport {
    let mut errors = Vec::new();
    let mut certificates = Vec::new();

    for (index, signer) in signers.iter().enumerate() {
        let Some(cert) = signer.signed_data.certificates.first().cloned() else {
            errors.push(format!("signer {index}: no certificate"));
            continue;
        };

        if signer.public_key != cert.encoded() {
            errors.push(format!(
                "signer {index}: public key does not match leaf certificate"
            ));
        }

        match best_signature(signer) {
            None => errors.push(format!("signer {index}: no usable signature")),
            Some((algorithm, signature)) => {
                match cert.verify(algorithm, &signer.signed_data_raw, signature) {
                    Ok(true) => {}
                    Ok(false) => errors.push(format!(
                        "signer {index}: signature {:#06x} does not verify",
                        algorithm.id()
                    )),
                    Err(e) => errors.push(format!("signer {index}: {e}")),
                }

                let expected = digests.get(&algorithm.digest_algorithm());
                let claimed = signer
                    .signed_data
                    .digests
                    .iter()
                    .find(|(a, _)| *a == algorithm)
                    .map(|(_, d)| d);
                match (expected, claimed) {
                    (Some(expected), Some(claimed)) if expected == claimed => {}
                    (_, None) => errors.push(format!(
                        "signer {index}: signed data carries no digest for \
                         algorithm {:#06x}",
                        algorithm.id()
                    )),
                    _ => errors.push(format!("signer {index}: content digest mismatch")),
                }
            }
        }

        if let Some((min, max)) = signer.sdk_range
            && min > max
        {
            errors.push(format!("signer {index}: inverted SDK range {min}..{max}"));
        }

        if let Some(attr) = signer.signed_data.attribute(PROOF_OF_ROTATION_ATTR_ID) {
            match Lineage::from_bytes(&attr.value) {
                Err(e) => errors.push(format!("signer {index}: {e}")),
                Ok(lineage) => {
                    if lineage.newest().certificate != cert {
                        errors.push(format!(
                            "signer {index}: rotation lineage does not end at the \
                             signing certificate"
                        ));
                    }
                    lineages.push(lineage);
                }
            }
        }

        if version == SchemeVersion::V31
            && let Some(attr) = signer.signed_data.attribute(ROTATION_MIN_SDK_ATTR_ID)
        {
            match attr.as_u32() {
                Err(e) => errors.push(format!("signer {index}: {e}")),
                Ok(declared) => {
                    if Some(declared) != signer.sdk_range.map(|(min, _)| min) {
                        errors.push(format!(
                            "signer {index}: rotation-min-sdk attribute disagrees \
                             with the SDK range"
                        ));
                    }
                }
            }
        }

        certificates.push(cert);
    }

    SchemeReport {
        version,
        status: if errors.is_empty() {
            SchemeStatus::Verified
        } else {
            SchemeStatus::Failed
        },
        certificates,
        errors,
    }
}

/// Platform levels a verified scheme entry vouches for.
fn scheme_coverage(
    version: SchemeVersion,
    signers: &[SignerBlock],
    env: &PlatformEnv,
) -> Vec<(ApiLevel, ApiLevel)> {
    match version {
        SchemeVersion::V2 => vec![(env.v2_floor, ApiLevel::MAX)],
        SchemeVersion::V3 | SchemeVersion::V31 => {
            let floor = if version == SchemeVersion::V3 {
                env.v3_floor
            } else {
                env.v31_threshold
            };
            signers
                .iter()
                .filter_map(|s| s.sdk_range)
                .map(|(min, max)| (min.max(floor), max))
                .filter(|(min, max)| min <= max)
                .collect()
        }
    }
}

/// First uncovered sub-range of `platform_range`, if any.
fn coverage_gap(
    mut intervals: Vec<(ApiLevel, ApiLevel)>,
    platform_range: (ApiLevel, ApiLevel),
    env: &PlatformEnv,
) -> Option<(ApiLevel, ApiLevel)> {
    // Nothing below the first block-aware platform can be covered by any
    // scheme; the checked range starts there.
    let min = platform_range.0.max(env.v2_floor);
    let max = platform_range.1;
    if min > max {
        return None;
    }
    intervals.sort_unstable();
    let mut cursor = min;
    for &(start, end) in &intervals {
        if start > cursor {
            return Some((cursor, max.min(start - 1)));
        }
        if end >= cursor {
            if end == ApiLevel::MAX {
                return None;
            }
            cursor = end + 1;
        }
        if cursor > max {
            return None;
        }
    }
    if cursor > max {
        None
    } else {
        Some((cursor, max))
    }
}

/// Write `bytes` to `path` through a same-directory temp file, so a crash
/// never leaves a half-written artifact behind.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| SealError::Io(e.error))?;
    Ok(())
}
