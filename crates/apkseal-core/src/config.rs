//! The caller-facing signing configuration.
//!
//! A [`SigningRequest`] is a plain bag of named fields with workable
//! defaults; nothing is validated while the caller fills it in. A single
//! [`SigningRequest::finalize`] call checks everything once and produces an
//! immutable [`SealedRequest`] the orchestrator consumes, so a rejected
//! request has had no side effects at all.

use apkseal_schema::PlatformEnv;
use apkseal_schema::sdk::ApiLevel;

use crate::block::DEFAULT_ALIGNMENT;
use crate::crypto::Certificate;
use crate::error::{ConfigError, CryptoError, Result};
use crate::lineage::Lineage;
use crate::resolver::{SchemeSet, TargetedSignerConfig};

/// Most signers the legacy-compatible scheme implementations accept.
pub const LEGACY_SIGNER_CAP: usize = 10;

/// Everything the caller decides about one signing pass.
#[derive(Debug, Clone)]
pub struct SigningRequest {
    /// Signer configs, original-first when a rotation chain is involved.
    pub signers: Vec<TargetedSignerConfig>,
    /// Which schemes to emit.
    pub schemes: SchemeSet,
    /// Minimum platform level the package itself supports.
    pub min_sdk: ApiLevel,
    /// Platform level at which a whole-package rotation takes effect.
    pub rotation_min_sdk: Option<ApiLevel>,
    /// Rotation lineage shared by the whole request.
    pub lineage: Option<Lineage>,
    /// Keep unrecognized entries from an existing signing block instead of
    /// dropping them.
    pub preserve_foreign_entries: bool,
    /// Whether the package manifest marks it debuggable, when known.
    pub debuggable: Option<bool>,
    /// Allow signing a debuggable package.
    pub permit_debuggable: bool,
    /// Boundary the byte after the block is aligned to; `None` disables
    /// the padding entry.
    pub alignment: Option<usize>,
    /// Version thresholds for scheme selection.
    pub env: PlatformEnv,
    /// Source-stamp certificate whose digest is pinned into v2/v3 signed
    /// data.
    pub source_stamp_certificate: Option<Certificate>,
}

impl Default for SigningRequest {
    fn default() -> Self {
        Self {
            signers: Vec::new(),
            schemes: SchemeSet::default(),
            min_sdk: 1,
            rotation_min_sdk: None,
            lineage: None,
            preserve_foreign_entries: false,
            debuggable: None,
            permit_debuggable: true,
            alignment: Some(DEFAULT_ALIGNMENT),
            env: PlatformEnv::default(),
            source_stamp_certificate: None,
        }
    }
}

impl SigningRequest {
    /// Validate the request and freeze it for the orchestrator.
    pub fn finalize(self) -> Result<SealedRequest> {
        if self.signers.is_empty() {
            return Err(ConfigError::NoSigners.into());
        }
        if self.debuggable == Some(true) && !self.permit_debuggable {
            return Err(ConfigError::DebuggablePackage.into());
        }

        // The legacy-compatible schemes carry every untargeted signer, and
        // their implementations cap how many they accept.
        if self.schemes.v1 || self.schemes.v2 {
            let untargeted = self.signers.iter().filter(|c| c.min_sdk == 0).count();
            if untargeted > LEGACY_SIGNER_CAP {
                return Err(ConfigError::TooManySigners {
                    count: untargeted,
                    max: LEGACY_SIGNER_CAP,
                }
                .into());
            }
        }

        for config in &self.signers {
            let leaf = config.identity.leaf();
            if !leaf.meets_minimum_strength() {
                let min_sdk = if config.min_sdk == 0 {
                    self.min_sdk
                } else {
                    config.min_sdk
                };
                return Err(CryptoError::WeakKey {
                    bits: leaf.key_bits(),
                    min_sdk,
                }
                .into());
            }
        }

        Ok(SealedRequest {
            signers: self.signers,
            schemes: self.schemes,
            min_sdk: self.min_sdk,
            rotation_min_sdk: self.rotation_min_sdk,
            lineage: self.lineage,
            preserve_foreign_entries: self.preserve_foreign_entries,
            alignment: self.alignment,
            env: self.env,
            source_stamp_certificate: self.source_stamp_certificate,
        })
    }
}

/// A validated, immutable request. Only [`SigningRequest::finalize`] builds
/// one.
#[derive(Debug, Clone)]
pub struct SealedRequest {
    pub(crate) signers: Vec<TargetedSignerConfig>,
    pub(crate) schemes: SchemeSet,
    pub(crate) min_sdk: ApiLevel,
    pub(crate) rotation_min_sdk: Option<ApiLevel>,
    pub(crate) lineage: Option<Lineage>,
    pub(crate) preserve_foreign_entries: bool,
    pub(crate) alignment: Option<usize>,
    pub(crate) env: PlatformEnv,
    pub(crate) source_stamp_certificate: Option<Certificate>,
}

impl SealedRequest {
    /// The scheme set this request will emit.
    pub fn schemes(&self) -> SchemeSet {
        self.schemes
    }

    /// The version thresholds in effect.
    pub fn env(&self) -> &PlatformEnv {
        &self.env
    }

    /// Minimum platform level the package supports.
    pub fn min_sdk(&self) -> ApiLevel {
        self.min_sdk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyringSigner, SignerIdentity};
    use crate::error::SealError;
    use std::sync::Arc;

    fn identity() -> SignerIdentity {
        use rand::RngCore;
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        let signer =
            KeyringSigner::from_ed25519(ed25519_dalek::SigningKey::from_bytes(&seed)).unwrap();
        SignerIdentity::new(Arc::new(signer))
    }

    #[test]
    fn empty_request_is_rejected() {
        let err = SigningRequest::default().finalize().unwrap_err();
        assert!(matches!(err, SealError::Config(ConfigError::NoSigners)));
    }

    #[test]
    fn debuggable_requires_permission() {
        let request = SigningRequest {
            signers: vec![TargetedSignerConfig::untargeted(identity())],
            debuggable: Some(true),
            permit_debuggable: false,
            ..SigningRequest::default()
        };
        let err = request.finalize().unwrap_err();
        assert!(matches!(
            err,
            SealError::Config(ConfigError::DebuggablePackage)
        ));

        let request = SigningRequest {
            signers: vec![TargetedSignerConfig::untargeted(identity())],
            debuggable: Some(true),
            permit_debuggable: true,
            ..SigningRequest::default()
        };
        assert!(request.finalize().is_ok());
    }

    #[test]
    fn eleven_untargeted_signers_exceed_the_legacy_cap() {
        let signers: Vec<_> = (0..=LEGACY_SIGNER_CAP)
            .map(|_| TargetedSignerConfig::untargeted(identity()))
            .collect();
        let request = SigningRequest {
            signers,
            ..SigningRequest::default()
        };
        let err = request.finalize().unwrap_err();
        assert!(matches!(
            err,
            SealError::Config(ConfigError::TooManySigners { count: 11, max: 10 })
        ));
    }

    #[test]
    fn cap_does_not_apply_without_legacy_schemes() {
        let signers: Vec<_> = (0..=LEGACY_SIGNER_CAP)
            .map(|_| TargetedSignerConfig::untargeted(identity()))
            .collect();
        let request = SigningRequest {
            signers,
            schemes: SchemeSet {
                v1: false,
                v2: false,
                v3: true,
                v31: true,
                v4: false,
            },
            ..SigningRequest::default()
        };
        assert!(request.finalize().is_ok());
    }
}
