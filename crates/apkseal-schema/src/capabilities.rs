//! Capability flags retained by historical signing keys after rotation.

use serde::{Deserialize, Serialize};

/// Bit-set of permissions a key in a rotation lineage keeps.
///
/// The root key of a fresh lineage defaults to all flags set; rotated-away
/// keys are typically narrowed at append time. The bits are wire values
/// stored verbatim in lineage nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(u32);

impl Capabilities {
    /// Data installed by an app signed with this key remains trusted.
    pub const INSTALLED_DATA: u32 = 1;
    /// Packages signed with this key may join a shared identity.
    pub const SHARED_UID: u32 = 1 << 1;
    /// This key may continue granting signature-level permissions.
    pub const PERMISSION: u32 = 1 << 2;
    /// Updates signed with this key are accepted as rollbacks.
    pub const ROLLBACK: u32 = 1 << 3;
    /// This key remains valid for authenticator binding.
    pub const AUTH: u32 = 1 << 4;

    const ALL: u32 = Self::INSTALLED_DATA
        | Self::SHARED_UID
        | Self::PERMISSION
        | Self::ROLLBACK
        | Self::AUTH;

    /// All capabilities set; the default for a lineage root.
    pub fn all() -> Self {
        Self(Self::ALL)
    }

    /// No capabilities set.
    pub fn none() -> Self {
        Self(0)
    }

    /// Build from raw wire bits. Unknown bits are preserved so newer
    /// lineages survive being rewritten by older tooling.
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw wire bits.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit in `flag` is set.
    pub fn has(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    /// Copy with `flag` set.
    pub fn with(self, flag: u32) -> Self {
        Self(self.0 | flag)
    }

    /// Copy with `flag` cleared.
    pub fn without(self, flag: u32) -> Self {
        Self(self.0 & !flag)
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_all() {
        let caps = Capabilities::default();
        for flag in [
            Capabilities::INSTALLED_DATA,
            Capabilities::SHARED_UID,
            Capabilities::PERMISSION,
            Capabilities::ROLLBACK,
            Capabilities::AUTH,
        ] {
            assert!(caps.has(flag));
        }
    }

    #[test]
    fn narrow_and_widen() {
        let caps = Capabilities::all().without(Capabilities::SHARED_UID);
        assert!(!caps.has(Capabilities::SHARED_UID));
        assert!(caps.has(Capabilities::ROLLBACK));
        assert!(caps.with(Capabilities::SHARED_UID).has(Capabilities::SHARED_UID));
    }

    #[test]
    fn unknown_bits_survive() {
        let caps = Capabilities::from_bits(1 << 20 | Capabilities::AUTH);
        assert_eq!(caps.bits(), 1 << 20 | Capabilities::AUTH);
    }
}
