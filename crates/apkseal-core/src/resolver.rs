//! Assigns signers to scheme sub-blocks.
//!
//! Callers describe signers as an ordered list of [`TargetedSignerConfig`];
//! the resolver decides which identity lands in the v2 entry, the v3 entry
//! and each v3.1 entry, with which SDK range and which lineage slice. All
//! inconsistencies are rejected here, before any digest or signature work.

use apkseal_schema::PlatformEnv;
use apkseal_schema::sdk::ApiLevel;

use crate::crypto::SignerIdentity;
use crate::error::{ConfigError, Result};
use crate::lineage::Lineage;

/// One caller-supplied signer.
#[derive(Debug, Clone)]
pub struct TargetedSignerConfig {
    /// The signer.
    pub identity: SignerIdentity,
    /// Minimum platform level this signer targets; `0` means untargeted,
    /// the classic whole-package mechanism.
    pub min_sdk: ApiLevel,
    /// Rotation lineage ending at this signer, when it is a rotated key.
    pub lineage: Option<Lineage>,
}

impl TargetedSignerConfig {
    /// An untargeted signer with no rotation history.
    pub fn untargeted(identity: SignerIdentity) -> Self {
        Self {
            identity,
            min_sdk: 0,
            lineage: None,
        }
    }

    /// A signer bound to a minimum platform level.
    pub fn targeting(identity: SignerIdentity, min_sdk: ApiLevel) -> Self {
        Self {
            identity,
            min_sdk,
            lineage: None,
        }
    }

    /// Attach this signer's lineage fragment.
    pub fn with_lineage(mut self, lineage: Lineage) -> Self {
        self.lineage = Some(lineage);
        self
    }
}

/// A signer bound to one scheme sub-block.
#[derive(Debug, Clone)]
pub struct SignerAssignment {
    /// The signing identity.
    pub identity: SignerIdentity,
    /// Lineage slice ending at this identity, when rotation applies.
    pub lineage: Option<Lineage>,
    /// Minimum platform level of the sub-block.
    pub min_sdk: ApiLevel,
    /// Maximum platform level of the sub-block.
    pub max_sdk: ApiLevel,
    /// Whether this entry targets the development release and must carry
    /// the marker attribute.
    pub dev_release: bool,
}

/// Resolver output: the full signer → sub-block map.
#[derive(Debug, Clone)]
pub struct ResolvedTargets {
    /// v3.1 entries, ascending by `min_sdk`, ranges non-overlapping.
    pub v31: Vec<SignerAssignment>,
    /// The single v3 entry, when the scheme applies.
    pub v3: Option<SignerAssignment>,
    /// Identities for the v2 entry (and the v1 collaborator): the
    /// lineage's oldest signer under rotation, else every untargeted
    /// signer.
    pub v2: Vec<SignerIdentity>,
    /// The merged lineage all fragments agreed on, if any.
    pub common_lineage: Option<Lineage>,
}

/// Per-scheme enable flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemeSet {
    /// Legacy jar scheme (emitted by a collaborator, fed by this resolver).
    pub v1: bool,
    /// Whole-block scheme.
    pub v2: bool,
    /// Rotation-aware scheme.
    pub v3: bool,
    /// Targeted-rotation scheme.
    pub v31: bool,
    /// Streaming side-channel digest handoff.
    pub v4: bool,
}

impl Default for SchemeSet {
    fn default() -> Self {
        Self {
            v1: false,
            v2: true,
            v3: true,
            v31: true,
            v4: false,
        }
    }
}

/// Compute the signer → sub-block assignment.
pub fn resolve(
    configs: &[TargetedSignerConfig],
    schemes: SchemeSet,
    global_lineage: Option<&Lineage>,
    rotation_min_sdk: Option<ApiLevel>,
    env: &PlatformEnv,
) -> Result<ResolvedTargets> {
    if configs.is_empty() {
        return Err(ConfigError::NoSigners.into());
    }
    for config in configs {
        if let Some(lineage) = &config.lineage
            && &lineage.newest().certificate != config.identity.leaf()
        {
            return Err(ConfigError::SignerNotInLineage.into());
        }
    }

    // Rule 2: every supplied lineage must collapse into one chain.
    let mut common: Option<Lineage> = global_lineage.cloned();
    for config in configs {
        if let Some(lineage) = &config.lineage {
            common = Some(match common {
                Some(existing) => Lineage::merge(&existing, lineage)?,
                None => lineage.clone(),
            });
        }
    }
    let rotation_present = common.as_ref().is_some_and(|l| l.len() >= 2);

    let untargeted: Vec<&TargetedSignerConfig> =
        configs.iter().filter(|c| c.min_sdk == 0).collect();
    let targeted: Vec<&TargetedSignerConfig> =
        configs.iter().filter(|c| c.min_sdk != 0).collect();

    // Rule 6: legacy-compatible schemes always get the chain's oldest
    // identity, which therefore must be among the supplied configs.
    let original = if rotation_present {
        let root_cert = &common.as_ref().expect("rotation implies lineage").oldest().certificate;
        let identity = configs
            .iter()
            .map(|c| &c.identity)
            .find(|i| i.leaf() == root_cert)
            .ok_or(ConfigError::MissingOriginalSigner)?;
        Some(identity.clone())
    } else {
        None
    };

    // Rules 3, 4, 7: partition rotation targets around the v3.1 threshold.
    let mut fine: Vec<(ApiLevel, SignerAssignment)> = Vec::new();
    let mut folded: Option<&TargetedSignerConfig> = None;
    let mut dev_release_present = false;

    for config in &targeted {
        let raw_target = config.min_sdk;
        let (target, dev) = if env.is_dev_release(raw_target) {
            // Rule 7: resolve the sentinel to the last finalized level and
            // mark the entry so a finalized verifier at that exact level
            // skips it.
            (env.last_finalized, true)
        } else {
            (raw_target, false)
        };
        if target >= env.v31_threshold {
            if !schemes.v31 {
                return Err(ConfigError::UnsupportedRotationTarget(raw_target).into());
            }
            if fine.iter().any(|(t, _)| *t == target) {
                return Err(ConfigError::ConflictingTarget(target).into());
            }
            dev_release_present |= dev;
            fine.push((
                target,
                SignerAssignment {
                    identity: config.identity.clone(),
                    lineage: lineage_ending_at(common.as_ref(), config)?,
                    min_sdk: target,
                    max_sdk: ApiLevel::MAX,
                    dev_release: dev,
                },
            ));
        } else {
            if target < env.v3_floor {
                return Err(ConfigError::UnsupportedRotationTarget(raw_target).into());
            }
            // Rule 4: the coarse mechanism cannot distinguish sub-ranges,
            // so only one config may fold into it.
            if folded.is_some() {
                return Err(ConfigError::ConflictingTarget(target).into());
            }
            folded = Some(config);
        }
    }

    // A global lineage plus rotation-min-sdk is the classic whole-package
    // rotation; route it through the same threshold logic.
    if rotation_present && targeted.is_empty() {
        let rotation_target = rotation_min_sdk.unwrap_or(env.v3_floor);
        let newest_cert = &common.as_ref().expect("checked").newest().certificate;
        let rotated = configs
            .iter()
            .map(|c| &c.identity)
            .find(|i| i.leaf() == newest_cert)
            .ok_or(ConfigError::SignerNotInLineage)?
            .clone();
        let (rotation_target, dev) = if env.is_dev_release(rotation_target) {
            (env.last_finalized, true)
        } else {
            (rotation_target, false)
        };
        if rotation_target >= env.v31_threshold && schemes.v31 {
            dev_release_present |= dev;
            fine.push((
                rotation_target,
                SignerAssignment {
                    identity: rotated,
                    lineage: common.clone(),
                    min_sdk: rotation_target,
                    max_sdk: ApiLevel::MAX,
                    dev_release: dev,
                },
            ));
        } else if rotation_target < env.v3_floor {
            return Err(ConfigError::UnsupportedRotationTarget(rotation_target).into());
        }
        // Otherwise the rotation folds into v3; the coarse assignment below
        // picks the rotated identity back up through `rotation_present`.
    }

    // Rule 4: a folded targeted config and a sub-threshold global rotation
    // would both claim the single coarse slot.
    if folded.is_some()
        && global_lineage.is_some()
        && rotation_min_sdk.is_some_and(|t| t < env.v31_threshold)
    {
        return Err(ConfigError::ConflictingTarget(env.v3_floor).into());
    }

    // Rule 3 output ordering: ascending targets, each capped by the next.
    fine.sort_by_key(|(t, _)| *t);
    let mut v31: Vec<SignerAssignment> = fine.into_iter().map(|(_, a)| a).collect();
    for idx in 1..v31.len() {
        v31[idx - 1].max_sdk = v31[idx].min_sdk - 1;
    }

    // Rule 5: pick the v3 entry's signer.
    let v3_cap = v31.first().map_or(ApiLevel::MAX, |a| a.min_sdk - 1);
    // Rule 7: a dev-release target would otherwise leave the finalized
    // level uncovered between the coarse and fine-grained ranges.
    let v3_cap = if dev_release_present && !v31.is_empty() {
        env.dev_release
    } else {
        v3_cap
    };

    let v3 = if !schemes.v3 {
        None
    } else if let Some(config) = folded {
        // Folded rotation: the rotated identity covers the whole coarse
        // range from the floor.
        Some(SignerAssignment {
            identity: config.identity.clone(),
            lineage: lineage_ending_at(common.as_ref(), config)?,
            min_sdk: env.v3_floor,
            max_sdk: v3_cap,
            dev_release: false,
        })
    } else if rotation_present && !v31.is_empty() {
        // Rotation lives entirely at or above the threshold; pre-threshold
        // verifiers must keep seeing the original identity.
        let original = original.clone().ok_or(ConfigError::MissingOriginalSigner)?;
        let lineage = common
            .as_ref()
            .expect("rotation implies lineage")
            .truncate(original.leaf())?;
        Some(SignerAssignment {
            identity: original,
            lineage: Some(lineage),
            min_sdk: env.v3_floor,
            max_sdk: v3_cap,
            dev_release: false,
        })
    } else if rotation_present {
        // Classic global rotation folded to the floor.
        let newest_cert = &common.as_ref().expect("checked").newest().certificate;
        let rotated = configs
            .iter()
            .map(|c| &c.identity)
            .find(|i| i.leaf() == newest_cert)
            .ok_or(ConfigError::SignerNotInLineage)?
            .clone();
        Some(SignerAssignment {
            identity: rotated,
            lineage: common.clone(),
            min_sdk: env.v3_floor,
            max_sdk: v3_cap,
            dev_release: false,
        })
    } else {
        // No rotation: the sole untargeted signer.
        if untargeted.len() > 1 {
            return Err(ConfigError::TooManySigners {
                count: untargeted.len(),
                max: 1,
            }
            .into());
        }
        let config = untargeted.first().ok_or(ConfigError::NoSigners)?;
        Some(SignerAssignment {
            identity: config.identity.clone(),
            lineage: None,
            min_sdk: env.v3_floor,
            max_sdk: v3_cap,
            dev_release: false,
        })
    };

    // Rule 6 output: legacy schemes have no rotation awareness.
    let v2 = if rotation_present {
        vec![original.expect("rotation implies original signer")]
    } else {
        let identities: Vec<SignerIdentity> =
            untargeted.iter().map(|c| c.identity.clone()).collect();
        if identities.is_empty() {
            return Err(ConfigError::NoSigners.into());
        }
        identities
    };

    Ok(ResolvedTargets {
        v31,
        v3,
        v2,
        common_lineage: common,
    })
}

/// Lineage slice ending at `config`'s identity, reconstructed from the
/// common chain when the config did not carry its own fragment.
fn lineage_ending_at(
    common: Option<&Lineage>,
    config: &TargetedSignerConfig,
) -> Result<Option<Lineage>> {
    if let Some(lineage) = &config.lineage {
        return Ok(Some(lineage.clone()));
    }
    match common {
        Some(lineage) if lineage.contains(config.identity.leaf()) => {
            Ok(Some(lineage.truncate(config.identity.leaf())?))
        }
        Some(_) => Err(ConfigError::SignerNotInLineage.into()),
        None => Ok(None),
    }
}
