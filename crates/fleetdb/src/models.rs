//! Database models mapping to the fleet control-plane schema.

use crate::error::{FleetError, FleetResult};
use roost_core::{CommandState, CommitMap, KvMap, UpgradeStage};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Sites and appliances
// =============================================================================

/// Customer site record. Commands are queued per site.
#[derive(Debug, Clone, FromRow)]
pub struct SiteRow {
    pub site_uuid: Uuid,
    pub name: String,
    pub created_at: OffsetDateTime,
}

/// Appliance record. Release state is tracked per appliance.
#[derive(Debug, Clone, FromRow)]
pub struct ApplianceRow {
    pub appliance_uuid: Uuid,
    pub site_uuid: Uuid,
    pub name: String,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Artifacts
// =============================================================================

/// Immutable build artifact record.
///
/// The tuple (platform_name, repo_name, commit_hash, generation, filename,
/// hash, hash_type) is the artifact's identity and is unique; the UUID is
/// generated at insert time.
#[derive(Debug, Clone, FromRow, PartialEq, Eq)]
pub struct ArtifactRow {
    pub artifact_uuid: Uuid,
    pub platform_name: String,
    pub repo_name: String,
    pub commit_hash: Vec<u8>,
    pub generation: i32,
    pub filename: String,
    pub hash: Vec<u8>,
    pub hash_type: String,
}

/// Artifact identity as submitted by a build pipeline, before a UUID is
/// assigned.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub platform_name: String,
    pub repo_name: String,
    pub commit_hash: Vec<u8>,
    pub generation: i32,
    pub filename: String,
    pub hash: Vec<u8>,
    pub hash_type: String,
}

/// Outcome of an artifact insert.
///
/// A duplicate identity is not a failure: the pipeline re-registering a
/// build gets the canonical existing row back, marked so a UI can report it.
#[derive(Debug, Clone)]
pub enum ArtifactInsert {
    /// A new artifact row was created.
    Created(ArtifactRow),
    /// An identical artifact already existed; no row was written.
    AlreadyExists(ArtifactRow),
}

impl ArtifactInsert {
    /// The canonical artifact row, whether freshly created or pre-existing.
    pub fn artifact(&self) -> &ArtifactRow {
        match self {
            Self::Created(a) | Self::AlreadyExists(a) => a,
        }
    }

    /// Consume, returning the canonical artifact row.
    pub fn into_artifact(self) -> ArtifactRow {
        match self {
            Self::Created(a) | Self::AlreadyExists(a) => a,
        }
    }

    pub fn already_existed(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

// =============================================================================
// Releases
// =============================================================================

/// Raw release row. `metadata` is a JSON-encoded string map.
#[derive(Debug, Clone, FromRow)]
pub struct ReleaseRow {
    pub release_uuid: Uuid,
    pub create_ts: OffsetDateTime,
    pub metadata: Option<String>,
}

/// A release joined with its full artifact set.
#[derive(Debug, Clone)]
pub struct Release {
    pub release_uuid: Uuid,
    pub create_ts: OffsetDateTime,
    pub metadata: KvMap,
    /// Platform shared by the release's artifacts (the minimum platform name
    /// when they disagree; see [`Release::one_platform`]).
    pub platform: String,
    pub artifacts: Vec<ArtifactRow>,
}

impl Release {
    /// Whether all artifacts agree on platform. Disagreement is a
    /// consistency anomaly: nothing prevents it at write time, so readers
    /// check.
    pub fn one_platform(&self) -> bool {
        self.artifacts
            .iter()
            .all(|a| a.platform_name == self.platform)
    }

    /// The release's display name from its metadata, if any.
    pub fn name(&self) -> Option<&str> {
        self.metadata.get("name").map(String::as_str)
    }
}

/// One release-membership bridge row joined with its artifact, as fetched
/// by the listing query. The alias keeps the bridge's release UUID from
/// colliding with artifact columns.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct BridgedArtifactRow {
    pub bridge_release_uuid: Uuid,
    #[sqlx(flatten)]
    pub artifact: ArtifactRow,
}

/// Result of listing the release catalog.
///
/// Releases whose artifacts disagree on platform are pulled out of
/// `releases` and reported by UUID in `inconsistent`; callers still get the
/// consistent subset.
#[derive(Debug, Default)]
pub struct ReleaseListing {
    pub releases: Vec<Release>,
    pub inconsistent: Vec<Uuid>,
}

impl ReleaseListing {
    /// Convert to a hard error when any release is inconsistent.
    pub fn strict(self) -> FleetResult<Vec<Release>> {
        if self.inconsistent.is_empty() {
            Ok(self.releases)
        } else {
            Err(FleetError::InconsistentReleases {
                release_uuids: self.inconsistent,
            })
        }
    }
}

/// Decode a JSON-encoded metadata/commit-map column.
pub(crate) fn decode_kv_map(raw: Option<&str>) -> FleetResult<KvMap> {
    match raw {
        None => Ok(KvMap::new()),
        Some(s) => serde_json::from_str(s).map_err(|e| {
            FleetError::InvalidState(roost_core::Error::Serialization(format!(
                "malformed JSON map column: {e}"
            )))
        }),
    }
}

// =============================================================================
// Site commands
// =============================================================================

/// An entry in the persisted per-site command queue.
#[derive(Debug, Clone, FromRow, PartialEq, Eq)]
pub struct SiteCommandRow {
    pub id: i64,
    pub site_uuid: Uuid,
    pub enq_ts: OffsetDateTime,
    pub sent_ts: Option<OffsetDateTime>,
    /// Number of times the command was re-claimed after its first delivery;
    /// NULL until the first re-claim.
    pub resent_n: Option<i32>,
    pub done_ts: Option<OffsetDateTime>,
    pub state: String,
    pub config_query: Vec<u8>,
    pub config_response: Option<Vec<u8>>,
}

impl SiteCommandRow {
    /// Parse the persisted state string.
    pub fn command_state(&self) -> FleetResult<CommandState> {
        Ok(self.state.parse()?)
    }
}

/// Pre- and post-transition snapshots from a cancel/complete call.
///
/// `old == new` when the command was already terminal and the call was an
/// idempotent no-op.
#[derive(Debug, Clone)]
pub struct CommandTransition {
    pub old: SiteCommandRow,
    pub new: SiteCommandRow,
}

impl CommandTransition {
    /// Whether the call actually moved the command to a new state.
    pub fn transitioned(&self) -> bool {
        self.old.state != self.new.state
    }
}

// =============================================================================
// Release tracking
// =============================================================================

/// Single mutable target-release pointer for an appliance.
#[derive(Debug, Clone, FromRow)]
pub struct ReleaseTargetRow {
    pub appliance_uuid: Uuid,
    pub release_uuid: Uuid,
}

/// Per-appliance, per-stage release history record.
///
/// `release_uuid` is the nil UUID when the appliance's running commit set
/// matches no cataloged release; `repo_commits` is then the authoritative
/// record of what is running.
#[derive(Debug, Clone, FromRow)]
pub struct ReleaseHistoryRow {
    pub appliance_uuid: Uuid,
    pub release_uuid: Uuid,
    pub stage: String,
    pub updated_ts: OffsetDateTime,
    pub success: Option<bool>,
    pub message: Option<String>,
    pub log_url: Option<String>,
    pub repo_commits: Option<String>,
}

impl ReleaseHistoryRow {
    /// Parse the persisted stage string.
    pub fn upgrade_stage(&self) -> FleetResult<UpgradeStage> {
        Ok(self.stage.parse()?)
    }

    /// Decode the per-repo commit map, empty if none was recorded.
    pub fn commit_map(&self) -> FleetResult<CommitMap> {
        decode_kv_map(self.repo_commits.as_deref())
    }
}

// =============================================================================
// Fleet status
// =============================================================================

/// Joined release status for one appliance: what it runs, what it should
/// run, and how the last upgrade step went.
#[derive(Debug, Clone, Default)]
pub struct ApplianceReleaseStatus {
    /// Release the appliance most recently reported running. `Some(nil)`
    /// means it reported an off-catalog commit set; `None` means it has
    /// never reported.
    pub current_release_uuid: Option<Uuid>,
    pub current_release_name: Option<String>,
    /// When the current release was first (or last meaningfully) reported.
    pub running_since: Option<OffsetDateTime>,
    /// Raw per-repo commits from the latest report.
    pub commits: CommitMap,
    pub target_release_uuid: Option<Uuid>,
    pub target_release_name: Option<String>,
    /// Most recent upgrade-stage outcome, regardless of stage kind.
    pub stage: Option<UpgradeStage>,
    pub success: Option<bool>,
    pub message: Option<String>,
    pub log_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_one_platform() {
        let artifact = |platform: &str| ArtifactRow {
            artifact_uuid: Uuid::new_v4(),
            platform_name: platform.to_string(),
            repo_name: "WRT".to_string(),
            commit_hash: vec![1, 2, 3],
            generation: 0,
            filename: "root.squashfs".to_string(),
            hash: vec![4, 5, 6],
            hash_type: "SHA256".to_string(),
        };

        let mut release = Release {
            release_uuid: Uuid::new_v4(),
            create_ts: OffsetDateTime::UNIX_EPOCH,
            metadata: KvMap::new(),
            platform: "mt7623".to_string(),
            artifacts: vec![artifact("mt7623"), artifact("mt7623")],
        };
        assert!(release.one_platform());

        release.artifacts.push(artifact("x86"));
        assert!(!release.one_platform());
    }

    #[test]
    fn test_decode_kv_map() {
        assert!(decode_kv_map(None).unwrap().is_empty());

        let map = decode_kv_map(Some(r#"{"WRT":"abc"}"#)).unwrap();
        assert_eq!(map.get("WRT").map(String::as_str), Some("abc"));

        let err = decode_kv_map(Some("not json")).unwrap_err();
        assert!(matches!(err, FleetError::InvalidState(_)));
    }

    #[test]
    fn test_listing_strict() {
        let good = ReleaseListing::default();
        assert!(good.strict().unwrap().is_empty());

        let bad_uuid = Uuid::new_v4();
        let bad = ReleaseListing {
            releases: vec![],
            inconsistent: vec![bad_uuid],
        };
        match bad.strict().unwrap_err() {
            FleetError::InconsistentReleases { release_uuids } => {
                assert_eq!(release_uuids, vec![bad_uuid]);
            }
            other => panic!("expected InconsistentReleases, got {other:?}"),
        }
    }
}
