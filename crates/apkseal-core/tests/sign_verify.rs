//! End-to-end sign/verify passes over an in-memory package.

use std::sync::Arc;

use apkseal_core::block::{self, BlockEntry, SigningBlock};
use apkseal_core::signed_data::SchemeVersion;
use apkseal_core::{
    KeyringSigner, Lineage, SchemeSet, SignerCapability, SignerIdentity, SigningRequest,
    SlicedContent, TargetedSignerConfig, sign, verify, write_atomically,
};
use apkseal_schema::sdk::ApiLevel;
use apkseal_schema::{Capabilities, PlatformEnv, SignatureAlgorithm};
use rand::RngCore;

fn package() -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    // Three regions shaped like a zip: entries, central directory, and a
    // minimal end-of-central-directory record with the CD offset at byte 16.
    let entries: Vec<u8> = (0..3 * 1024 * 1024 + 17).map(|i| (i % 251) as u8).collect();
    let cd = vec![0xcd; 120];
    let mut eocd = vec![0u8; 22];
    eocd[0..4].copy_from_slice(&0x0605_4b50u32.to_le_bytes());
    eocd[12..16].copy_from_slice(&(cd.len() as u32).to_le_bytes());
    eocd[16..20].copy_from_slice(&(entries.len() as u32).to_le_bytes());
    (entries, cd, eocd)
}

fn ed25519_key() -> Arc<KeyringSigner> {
    let mut seed = [0u8; 32];
    rand::rng().fill_bytes(&mut seed);
    Arc::new(KeyringSigner::from_ed25519(ed25519_dalek::SigningKey::from_bytes(&seed)).unwrap())
}

fn identity(key: &Arc<KeyringSigner>) -> SignerIdentity {
    SignerIdentity::new(key.clone())
}

fn rsa_key() -> Arc<KeyringSigner> {
    Arc::new(KeyringSigner::from_pkcs8_der(include_bytes!("data/rsa-2048.pk8")).unwrap())
}

fn source<'a>(entries: &'a [u8], cd: &'a [u8], eocd: &'a [u8]) -> SlicedContent<'a> {
    SlicedContent {
        entries,
        central_directory: cd,
        eocd,
    }
}

fn full_range() -> (ApiLevel, ApiLevel) {
    (1, ApiLevel::MAX)
}

#[test]
fn single_signer_round_trip() {
    let (entries, cd, eocd) = package();
    let src = source(&entries, &cd, &eocd);
    let key = ed25519_key();

    let request = SigningRequest {
        signers: vec![TargetedSignerConfig::untargeted(identity(&key))],
        ..SigningRequest::default()
    }
    .finalize()
    .unwrap();
    let signed = sign(&request, &src, None).unwrap();

    let report = verify(
        &src,
        &signed.bytes,
        SchemeSet::default(),
        full_range(),
        &PlatformEnv::default(),
    )
    .unwrap();
    assert!(report.verified(), "errors: {:?}", report.errors);

    let v2 = report.scheme(SchemeVersion::V2).unwrap();
    assert_eq!(v2.certificates, vec![key.certificate().clone()]);
    let v3 = report.scheme(SchemeVersion::V3).unwrap();
    assert_eq!(v3.certificates, vec![key.certificate().clone()]);
}

#[test]
fn block_end_is_aligned() {
    let (entries, cd, eocd) = package();
    let src = source(&entries, &cd, &eocd);
    let key = ed25519_key();

    let request = SigningRequest {
        signers: vec![TargetedSignerConfig::untargeted(identity(&key))],
        ..SigningRequest::default()
    }
    .finalize()
    .unwrap();
    let signed = sign(&request, &src, None).unwrap();
    assert_eq!((entries.len() + signed.bytes.len()) % 4096, 0);
}

#[test]
fn tampered_content_fails_digest_check() {
    let (mut entries, cd, eocd) = package();
    let key = ed25519_key();

    let request = SigningRequest {
        signers: vec![TargetedSignerConfig::untargeted(identity(&key))],
        ..SigningRequest::default()
    }
    .finalize()
    .unwrap();
    let signed = {
        let src = source(&entries, &cd, &eocd);
        sign(&request, &src, None).unwrap()
    };

    entries[1024 * 1024 + 3] ^= 0x40;
    let src = source(&entries, &cd, &eocd);
    let report = verify(
        &src,
        &signed.bytes,
        SchemeSet::default(),
        full_range(),
        &PlatformEnv::default(),
    )
    .unwrap();
    assert!(!report.verified());
    let v2 = report.scheme(SchemeVersion::V2).unwrap();
    assert!(v2.errors.iter().any(|e| e.contains("digest mismatch")));
}

#[test]
fn stripped_v3_entry_is_detected() {
    let (entries, cd, eocd) = package();
    let src = source(&entries, &cd, &eocd);
    let key = ed25519_key();

    let request = SigningRequest {
        signers: vec![TargetedSignerConfig::untargeted(identity(&key))],
        alignment: None,
        ..SigningRequest::default()
    }
    .finalize()
    .unwrap();
    let signed = sign(&request, &src, None).unwrap();

    // Rebuild the block without its v3 entry, as a downgrade attack would.
    let parsed = SigningBlock::parse(&signed.bytes).unwrap();
    let stripped: Vec<BlockEntry> = parsed
        .entries
        .into_iter()
        .filter(|e| e.id != block::V3_BLOCK_ID)
        .collect();
    let stripped = block::serialize(&stripped, 0, None);

    let report = verify(
        &src,
        &stripped,
        SchemeSet::default(),
        full_range(),
        &PlatformEnv::default(),
    )
    .unwrap();
    assert!(!report.verified());
    assert!(
        report
            .errors
            .iter()
            .any(|e| e.contains("stripping protection"))
    );
}

#[test]
fn rotation_keeps_original_in_legacy_schemes() {
    let (entries, cd, eocd) = package();
    let src = source(&entries, &cd, &eocd);

    let key_a = ed25519_key();
    let key_b = ed25519_key();
    let root = Lineage::new_root(key_a.certificate().clone(), Capabilities::all());
    let lineage = root
        .rotate(
            key_a.as_ref(),
            key_b.certificate().clone(),
            Capabilities::default(),
            SignatureAlgorithm::Ed25519,
        )
        .unwrap();

    let request = SigningRequest {
        signers: vec![
            TargetedSignerConfig::untargeted(identity(&key_a)),
            TargetedSignerConfig::untargeted(identity(&key_b)),
        ],
        lineage: Some(lineage),
        rotation_min_sdk: Some(28),
        ..SigningRequest::default()
    }
    .finalize()
    .unwrap();
    let signed = sign(&request, &src, None).unwrap();

    let report = verify(
        &src,
        &signed.bytes,
        SchemeSet::default(),
        full_range(),
        &PlatformEnv::default(),
    )
    .unwrap();
    assert!(report.verified(), "errors: {:?}", report.errors);

    // Pre-rotation verifiers see the original key, rotation-aware ones the
    // rotated key with its lineage.
    let v2 = report.scheme(SchemeVersion::V2).unwrap();
    assert_eq!(v2.certificates, vec![key_a.certificate().clone()]);
    let v3 = report.scheme(SchemeVersion::V3).unwrap();
    assert_eq!(v3.certificates, vec![key_b.certificate().clone()]);
    assert_eq!(report.lineage.as_ref().unwrap().len(), 2);
}

#[test]
fn targeted_rotation_lands_in_v31() {
    let (entries, cd, eocd) = package();
    let src = source(&entries, &cd, &eocd);

    let key_a = ed25519_key();
    let key_b = ed25519_key();
    let root = Lineage::new_root(key_a.certificate().clone(), Capabilities::all());
    let lineage = root
        .rotate(
            key_a.as_ref(),
            key_b.certificate().clone(),
            Capabilities::default(),
            SignatureAlgorithm::Ed25519,
        )
        .unwrap();

    let env = PlatformEnv::default();
    let request = SigningRequest {
        signers: vec![
            TargetedSignerConfig::untargeted(identity(&key_a)),
            TargetedSignerConfig::targeting(identity(&key_b), env.v31_threshold)
                .with_lineage(lineage),
        ],
        ..SigningRequest::default()
    }
    .finalize()
    .unwrap();
    let signed = sign(&request, &src, None).unwrap();

    let report = verify(&src, &signed.bytes, SchemeSet::default(), full_range(), &env).unwrap();
    assert!(report.verified(), "errors: {:?}", report.errors);

    let v31 = report.scheme(SchemeVersion::V31).unwrap();
    assert_eq!(v31.certificates, vec![key_b.certificate().clone()]);
    // The coarse entry keeps showing the original key below the threshold.
    let v3 = report.scheme(SchemeVersion::V3).unwrap();
    assert_eq!(v3.certificates, vec![key_a.certificate().clone()]);
}

#[test]
fn v2_only_carries_multiple_signers() {
    let (entries, cd, eocd) = package();
    let src = source(&entries, &cd, &eocd);
    let keys: Vec<_> = (0..3).map(|_| ed25519_key()).collect();

    let schemes = SchemeSet {
        v1: false,
        v2: true,
        v3: false,
        v31: false,
        v4: false,
    };
    let request = SigningRequest {
        signers: keys
            .iter()
            .map(|k| TargetedSignerConfig::untargeted(identity(k)))
            .collect(),
        schemes,
        ..SigningRequest::default()
    }
    .finalize()
    .unwrap();
    let signed = sign(&request, &src, None).unwrap();

    let report = verify(&src, &signed.bytes, schemes, full_range(), &PlatformEnv::default())
        .unwrap();
    assert!(report.verified(), "errors: {:?}", report.errors);
    let v2 = report.scheme(SchemeVersion::V2).unwrap();
    assert_eq!(v2.certificates.len(), 3);
}

#[test]
fn v3_only_block_leaves_a_coverage_gap_below_its_floor() {
    let (entries, cd, eocd) = package();
    let src = source(&entries, &cd, &eocd);
    let key = ed25519_key();

    let schemes = SchemeSet {
        v1: false,
        v2: false,
        v3: true,
        v31: false,
        v4: false,
    };
    let request = SigningRequest {
        signers: vec![TargetedSignerConfig::untargeted(identity(&key))],
        schemes,
        ..SigningRequest::default()
    }
    .finalize()
    .unwrap();
    let signed = sign(&request, &src, None).unwrap();

    let env = PlatformEnv::default();
    let low = verify(&src, &signed.bytes, schemes, (env.v2_floor, ApiLevel::MAX), &env).unwrap();
    assert!(!low.verified());
    assert!(low.errors.iter().any(|e| e.contains("covers")));

    let high = verify(&src, &signed.bytes, schemes, (env.v3_floor, ApiLevel::MAX), &env).unwrap();
    assert!(high.verified(), "errors: {:?}", high.errors);
}

#[test]
fn ed25519_signing_is_deterministic() {
    let (entries, cd, eocd) = package();
    let src = source(&entries, &cd, &eocd);
    let key = ed25519_key();

    let request = SigningRequest {
        signers: vec![TargetedSignerConfig::untargeted(identity(&key))],
        ..SigningRequest::default()
    }
    .finalize()
    .unwrap();
    let first = sign(&request, &src, None).unwrap();
    let second = sign(&request, &src, None).unwrap();
    assert_eq!(first.bytes, second.bytes);
}

#[test]
fn pss_signing_differs_between_passes_but_both_verify() {
    let (entries, cd, eocd) = package();
    let src = source(&entries, &cd, &eocd);
    let key = Arc::new(
        KeyringSigner::from_pkcs8_der(include_bytes!("data/rsa-2048.pk8"))
            .unwrap()
            .with_algorithms(vec![SignatureAlgorithm::RsaPssSha256]),
    );

    let request = SigningRequest {
        signers: vec![TargetedSignerConfig::untargeted(SignerIdentity::new(key))],
        ..SigningRequest::default()
    }
    .finalize()
    .unwrap();
    let first = sign(&request, &src, None).unwrap();
    let second = sign(&request, &src, None).unwrap();
    assert_ne!(first.bytes, second.bytes);

    for signed in [&first, &second] {
        let report = verify(
            &src,
            &signed.bytes,
            SchemeSet::default(),
            full_range(),
            &PlatformEnv::default(),
        )
        .unwrap();
        assert!(report.verified(), "errors: {:?}", report.errors);
    }
}

#[test]
fn rsa_pkcs1_round_trip() {
    let (entries, cd, eocd) = package();
    let src = source(&entries, &cd, &eocd);
    let key = rsa_key();

    let request = SigningRequest {
        signers: vec![TargetedSignerConfig::untargeted(identity(&key))],
        ..SigningRequest::default()
    }
    .finalize()
    .unwrap();
    let signed = sign(&request, &src, None).unwrap();

    let report = verify(
        &src,
        &signed.bytes,
        SchemeSet::default(),
        full_range(),
        &PlatformEnv::default(),
    )
    .unwrap();
    assert!(report.verified(), "errors: {:?}", report.errors);
}

#[test]
fn foreign_entries_survive_resigning_when_preserved() {
    let (entries, cd, eocd) = package();
    let src = source(&entries, &cd, &eocd);
    let key = ed25519_key();

    let foreign = BlockEntry::new(0xcafe_f00d, b"store metadata".to_vec());
    let existing = block::serialize(std::slice::from_ref(&foreign), 0, None);

    let request = SigningRequest {
        signers: vec![TargetedSignerConfig::untargeted(identity(&key))],
        preserve_foreign_entries: true,
        ..SigningRequest::default()
    }
    .finalize()
    .unwrap();
    let signed = sign(&request, &src, Some(&existing)).unwrap();

    let parsed = SigningBlock::parse(&signed.bytes).unwrap();
    assert!(parsed.entries.contains(&foreign));

    let report = verify(
        &src,
        &signed.bytes,
        SchemeSet::default(),
        full_range(),
        &PlatformEnv::default(),
    )
    .unwrap();
    assert!(report.verified(), "errors: {:?}", report.errors);
}

#[test]
fn v4_handoff_reports_written_scheme_digest() {
    let (entries, cd, eocd) = package();
    let src = source(&entries, &cd, &eocd);
    let key = ed25519_key();

    let request = SigningRequest {
        signers: vec![TargetedSignerConfig::untargeted(identity(&key))],
        schemes: SchemeSet {
            v4: true,
            ..SchemeSet::default()
        },
        ..SigningRequest::default()
    }
    .finalize()
    .unwrap();
    let signed = sign(&request, &src, None).unwrap();

    let handoff = signed.v4_digest.unwrap();
    assert_eq!(handoff.digest.len(), handoff.algorithm.digest_len());
    assert_eq!(handoff.certificates, vec![key.certificate().clone()]);
}

#[test]
fn atomic_write_leaves_complete_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("signed.bin");
    write_atomically(&path, b"complete artifact").unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"complete artifact");
}
