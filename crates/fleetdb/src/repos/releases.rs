//! Release catalog repository.

use crate::error::FleetResult;
use crate::models::{
    ArtifactRow, BridgedArtifactRow, Release, ReleaseListing, ReleaseRow, decode_kv_map,
};
use async_trait::async_trait;
use roost_core::KvMap;
use std::collections::HashMap;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for the release catalog: deduplicated sets of artifacts.
#[async_trait]
pub trait ReleaseRepo: Send + Sync {
    /// Create a release from a set of registered artifacts.
    ///
    /// The artifact set is exact-set deduplicated: if an existing release
    /// has precisely this membership (not a subset or superset), nothing is
    /// written and `FleetError::ReleaseExists` reports the canonical release
    /// UUID. The check and insert are a single atomic unit; two concurrent
    /// callers proposing the same set cannot both create a release.
    ///
    /// An empty set is rejected with `FleetError::EmptyRelease`; an unknown
    /// artifact UUID is a `FleetError::ForeignKey` naming `artifact`.
    async fn insert_release(
        &self,
        artifact_uuids: &[Uuid],
        metadata: &KvMap,
        now: OffsetDateTime,
    ) -> FleetResult<Uuid>;

    /// Get a release with its full artifact set.
    ///
    /// The nil UUID is the reserved "no release" sentinel and returns
    /// `Ok(None)` rather than NotFound: it stands for appliances with no
    /// cataloged release, not for a lookup failure.
    async fn get_release(&self, release_uuid: Uuid) -> FleetResult<Option<Release>>;

    /// List every release with its artifact set and computed platform,
    /// ordered by creation time.
    ///
    /// Releases whose artifacts disagree on platform (a write-time
    /// unchecked anomaly) are excluded from the main result and reported in
    /// [`ReleaseListing::inconsistent`].
    async fn list_releases(&self) -> FleetResult<ReleaseListing>;
}

/// Build a [`Release`] from its raw row and artifact set. The platform is
/// the minimum artifact platform name, which is also the release's platform
/// whenever the set is consistent.
pub(crate) fn assemble_release(
    row: ReleaseRow,
    artifacts: Vec<ArtifactRow>,
) -> FleetResult<Release> {
    let platform = artifacts
        .iter()
        .map(|a| a.platform_name.as_str())
        .min()
        .unwrap_or_default()
        .to_string();
    Ok(Release {
        release_uuid: row.release_uuid,
        create_ts: row.create_ts,
        metadata: decode_kv_map(row.metadata.as_deref())?,
        platform,
        artifacts,
    })
}

/// Assemble the catalog listing, partitioning out releases whose artifacts
/// disagree on platform. Nothing prevents such a release from being written
/// (platform agreement is not checked at insert time), so the listing is
/// where the anomaly gets detected and reported.
pub(crate) fn assemble_listing(
    rows: Vec<ReleaseRow>,
    bridged: Vec<BridgedArtifactRow>,
) -> FleetResult<ReleaseListing> {
    let mut by_release: HashMap<Uuid, Vec<ArtifactRow>> = HashMap::new();
    for bridge in bridged {
        by_release
            .entry(bridge.bridge_release_uuid)
            .or_default()
            .push(bridge.artifact);
    }

    let mut listing = ReleaseListing::default();
    for row in rows {
        let artifacts = by_release.remove(&row.release_uuid).unwrap_or_default();
        let release = assemble_release(row, artifacts)?;
        if release.one_platform() {
            listing.releases.push(release);
        } else {
            listing.inconsistent.push(release.release_uuid);
        }
    }

    if !listing.inconsistent.is_empty() {
        tracing::warn!(
            releases = ?listing.inconsistent,
            "excluding releases with inconsistent platforms from catalog listing"
        );
    }

    Ok(listing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn artifact(platform: &str, repo: &str) -> ArtifactRow {
        ArtifactRow {
            artifact_uuid: Uuid::new_v4(),
            platform_name: platform.to_string(),
            repo_name: repo.to_string(),
            commit_hash: vec![0xaa],
            generation: 0,
            filename: format!("{repo}.ipk"),
            hash: vec![0xbb],
            hash_type: "SHA256".to_string(),
        }
    }

    fn release_row(metadata: Option<&str>) -> ReleaseRow {
        ReleaseRow {
            release_uuid: Uuid::new_v4(),
            create_ts: OffsetDateTime::UNIX_EPOCH,
            metadata: metadata.map(str::to_string),
        }
    }

    #[test]
    fn test_assemble_release_metadata_and_platform() {
        let row = release_row(Some(r#"{"name":"candidate"}"#));
        let release =
            assemble_release(row, vec![artifact("mt7623", "WRT"), artifact("mt7623", "PS")])
                .unwrap();
        assert_eq!(release.platform, "mt7623");
        assert_eq!(release.name(), Some("candidate"));
        assert!(release.one_platform());

        let no_meta = assemble_release(release_row(None), vec![artifact("x86", "PS")]).unwrap();
        assert!(no_meta.metadata.is_empty());
        assert_eq!(no_meta.name(), None);
    }

    #[test]
    fn test_assemble_listing_partitions_inconsistent() {
        let good_row = release_row(None);
        let bad_row = release_row(None);
        let good_uuid = good_row.release_uuid;
        let bad_uuid = bad_row.release_uuid;

        let bridged = vec![
            BridgedArtifactRow {
                bridge_release_uuid: good_uuid,
                artifact: artifact("mt7623", "WRT"),
            },
            BridgedArtifactRow {
                bridge_release_uuid: bad_uuid,
                artifact: artifact("mt7623", "WRT"),
            },
            BridgedArtifactRow {
                bridge_release_uuid: bad_uuid,
                artifact: artifact("x86", "PS"),
            },
        ];

        let listing = assemble_listing(vec![good_row, bad_row], bridged).unwrap();
        assert_eq!(listing.releases.len(), 1);
        assert_eq!(listing.releases[0].release_uuid, good_uuid);
        assert_eq!(listing.inconsistent, vec![bad_uuid]);
    }
}
