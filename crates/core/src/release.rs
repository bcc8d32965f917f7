//! Release tracking types: upgrade stages, commit maps, and the canonical
//! fingerprint used to serialize exact-set release deduplication.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Free-form string-to-string map, used for release metadata.
///
/// A `BTreeMap` keeps the JSON encoding deterministic, so two maps with
/// equal contents serialize to identical strings and the store's
/// only-update-on-change guards compare correctly.
pub type KvMap = BTreeMap<String, String>;

/// Per-repo commit identifiers reported by an appliance, e.g.
/// `{"WRT": "8d3f…", "PS": "02ab…"}`.
pub type CommitMap = KvMap;

/// Stage of an appliance upgrade, as recorded in the release history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpgradeStage {
    /// The appliance was told about its target release.
    Notified,
    /// The release was installed, pending a reboot into it.
    Installed,
    /// The appliance reports it is running the release.
    Complete,
}

impl UpgradeStage {
    /// The stage name stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Notified => "notified",
            Self::Installed => "installed",
            Self::Complete => "complete",
        }
    }
}

impl FromStr for UpgradeStage {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "notified" => Ok(Self::Notified),
            "installed" => Ok(Self::Installed),
            "complete" => Ok(Self::Complete),
            other => Err(crate::Error::InvalidUpgradeStage(other.to_string())),
        }
    }
}

impl fmt::Display for UpgradeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonicalize an artifact-UUID set: sorted, duplicates removed.
///
/// Release membership is a set; callers may hand us the same artifact twice
/// (e.g. a retried pipeline stage), and the fingerprint below must not
/// depend on input order.
pub fn canonical_artifact_set(mut uuids: Vec<Uuid>) -> Vec<Uuid> {
    uuids.sort_unstable();
    uuids.dedup();
    uuids
}

/// Derive the advisory-lock key for a canonical artifact set.
///
/// The key is the first eight bytes of a SHA-256 over the concatenated UUID
/// bytes. Two concurrent proposals of the same set therefore contend on the
/// same lock, which is what makes the exact-set dedup check-then-insert
/// atomic on PostgreSQL.
pub fn advisory_lock_key(canonical: &[Uuid]) -> i64 {
    let mut hasher = Sha256::new();
    for uuid in canonical {
        hasher.update(uuid.as_bytes());
    }
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_round_trip() {
        for stage in [
            UpgradeStage::Notified,
            UpgradeStage::Installed,
            UpgradeStage::Complete,
        ] {
            assert_eq!(stage.as_str().parse::<UpgradeStage>().unwrap(), stage);
        }
        assert!("rebooted".parse::<UpgradeStage>().is_err());
    }

    #[test]
    fn test_canonical_set_sorts_and_dedups() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let canonical = canonical_artifact_set(vec![b, a, b, a]);
        let mut expected = vec![a, b];
        expected.sort_unstable();
        assert_eq!(canonical, expected);
    }

    #[test]
    fn test_lock_key_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let k1 = advisory_lock_key(&canonical_artifact_set(vec![a, b]));
        let k2 = advisory_lock_key(&canonical_artifact_set(vec![b, a, a]));
        assert_eq!(k1, k2);

        let k3 = advisory_lock_key(&canonical_artifact_set(vec![a]));
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_commit_map_encoding_is_deterministic() {
        let mut m1 = CommitMap::new();
        m1.insert("WRT".to_string(), "abc".to_string());
        m1.insert("PS".to_string(), "def".to_string());

        let mut m2 = CommitMap::new();
        m2.insert("PS".to_string(), "def".to_string());
        m2.insert("WRT".to_string(), "abc".to_string());

        assert_eq!(
            serde_json::to_string(&m1).unwrap(),
            serde_json::to_string(&m2).unwrap()
        );
    }
}
