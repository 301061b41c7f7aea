//! Platform API levels and the injectable version thresholds.
//!
//! The thresholds that gate scheme selection track an external release
//! calendar, so nothing outside this module hard-codes them: the engine
//! receives a [`PlatformEnv`] and the constants here are only its defaults.

use serde::{Deserialize, Serialize};

/// A platform API level.
pub type ApiLevel = u32;

/// First release that verifies whole-block (v2) signatures.
pub const N: ApiLevel = 24;
/// First release that verifies v3 signatures and rotation lineages.
pub const P: ApiLevel = 28;
/// Release following `P`; smallest meaningful v3-only rotation target.
pub const Q: ApiLevel = 29;
/// Last release before v3.1 targeting support.
pub const S_V2: ApiLevel = 32;
/// First release that recognizes the v3.1 targeted-rotation block.
pub const T: ApiLevel = 33;
/// Sentinel for "the in-progress, unreleased platform version".
pub const DEV_RELEASE: ApiLevel = 10_000;

/// Version thresholds the resolver and verifier consult.
///
/// `Default` reflects the current release calendar; embedders tracking a
/// different platform fork inject their own values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformEnv {
    /// Floor of the v2 scheme (and the verifier's oldest block-aware level).
    pub v2_floor: ApiLevel,
    /// Floor of the v3 scheme; targets below the v3.1 threshold fold here.
    pub v3_floor: ApiLevel,
    /// Level at which the v3.1 targeted-rotation block is recognized.
    pub v31_threshold: ApiLevel,
    /// Most recent finalized release; a development-release target resolves
    /// to this level plus a marker attribute.
    pub last_finalized: ApiLevel,
    /// Sentinel value callers use to target the development release.
    pub dev_release: ApiLevel,
}

impl Default for PlatformEnv {
    fn default() -> Self {
        Self {
            v2_floor: N,
            v3_floor: P,
            v31_threshold: T,
            last_finalized: T + 1,
            dev_release: DEV_RELEASE,
        }
    }
}

impl PlatformEnv {
    /// Whether `target` names the development release.
    pub fn is_dev_release(&self, target: ApiLevel) -> bool {
        target == self.dev_release
    }
}
