//! Shared test fixtures: artifacts in the shape a firmware pipeline
//! produces, plus site/appliance registration helpers.

use roost_fleetdb::FleetStore;
use roost_fleetdb::models::{ApplianceRow, NewArtifact, SiteRow};
use roost_fleetdb::repos::ApplianceRepo;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Deterministic pseudo-random bytes; unique per seed.
#[allow(dead_code)]
pub fn hash_bytes(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_mul(151).wrapping_add((i as u8).wrapping_mul(7)))
        .collect()
}

/// A stable timestamp `hours` hours past the epoch.
#[allow(dead_code)]
pub fn ts(hours: i64) -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::hours(hours)
}

/// The three firmware images a WRT build produces for one commit.
#[allow(dead_code)]
pub fn wrt_artifacts(seed: u8, generation: i32) -> (NewArtifact, NewArtifact, NewArtifact) {
    let commit = hash_bytes(seed, 20); // SHA-1 length
    let base = |filename: &str, hash_seed: u8| NewArtifact {
        platform_name: "mt7623".to_string(),
        repo_name: "WRT".to_string(),
        commit_hash: commit.clone(),
        generation,
        filename: filename.to_string(),
        hash: hash_bytes(hash_seed, 32), // SHA-256 length
        hash_type: "SHA256".to_string(),
    };
    (
        base("root.squashfs", seed.wrapping_add(1)),
        base("uImage.itb", seed.wrapping_add(2)),
        base("uImage-ramdisk.itb", seed.wrapping_add(3)),
    )
}

/// A single appliance-stack package artifact.
#[allow(dead_code)]
pub fn ps_artifact(seed: u8, generation: i32, platform: &str) -> NewArtifact {
    NewArtifact {
        platform_name: platform.to_string(),
        repo_name: "PS".to_string(),
        commit_hash: hash_bytes(seed, 20),
        generation,
        filename: "fleet-appliance_0.0.1-1_arm_cortex-a7.ipk".to_string(),
        hash: hash_bytes(seed.wrapping_add(4), 32),
        hash_type: "SHA256".to_string(),
    }
}

/// Register a site and return its UUID.
#[allow(dead_code)]
pub async fn mk_site(store: &dyn FleetStore, name: &str) -> Uuid {
    let site = SiteRow {
        site_uuid: Uuid::new_v4(),
        name: name.to_string(),
        created_at: ts(0),
    };
    store.create_site(&site).await.expect("create_site failed");
    site.site_uuid
}

/// Register an appliance under a site and return its UUID.
#[allow(dead_code)]
pub async fn mk_appliance(store: &dyn FleetStore, site_uuid: Uuid, name: &str) -> Uuid {
    let appliance = ApplianceRow {
        appliance_uuid: Uuid::new_v4(),
        site_uuid,
        name: name.to_string(),
        created_at: ts(0),
    };
    store
        .create_appliance(&appliance)
        .await
        .expect("create_appliance failed");
    appliance.appliance_uuid
}
