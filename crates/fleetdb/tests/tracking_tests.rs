//! Integration tests for appliance release tracking and fleet status.

mod common;

use common::TestFleet;
use common::fixtures::{mk_appliance, mk_site, ps_artifact, ts, wrt_artifacts};
use roost_core::{CommitMap, KvMap, UpgradeStage};
use roost_fleetdb::FleetError;
use roost_fleetdb::repos::{ApplianceRepo, ArtifactRepo, ReleaseRepo, ReleaseTrackingRepo, StatusRepo};
use uuid::Uuid;

/// Insert a full firmware artifact set and catalog it as a release.
async fn mk_release(fleet: &TestFleet, seed: u8, name: &str) -> Uuid {
    let (root, kernel, ramdisk) = wrt_artifacts(seed, 0);
    let mut uuids = Vec::new();
    for artifact in [&root, &kernel, &ramdisk] {
        uuids.push(
            fleet
                .store
                .insert_artifact(artifact)
                .await
                .unwrap()
                .into_artifact()
                .artifact_uuid,
        );
    }
    uuids.push(
        fleet
            .store
            .insert_artifact(&ps_artifact(seed.wrapping_add(100), 0, "mt7623"))
            .await
            .unwrap()
            .into_artifact()
            .artifact_uuid,
    );
    let metadata = KvMap::from([("name".to_string(), name.to_string())]);
    fleet
        .store
        .insert_release(&uuids, &metadata, ts(0))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_appliance_registry() {
    let fleet = TestFleet::new().await.expect("store setup failed");
    let site = mk_site(fleet.store.as_ref(), "site1").await;
    let app1 = mk_appliance(fleet.store.as_ref(), site, "gw0").await;
    let app2 = mk_appliance(fleet.store.as_ref(), site, "gw1").await;

    let row = fleet
        .store
        .get_appliance(app1)
        .await
        .unwrap()
        .expect("appliance should exist");
    assert_eq!(row.site_uuid, site);
    assert_eq!(row.name, "gw0");
    assert!(fleet.store.get_appliance(Uuid::new_v4()).await.unwrap().is_none());

    let all = fleet.store.list_appliances().await.unwrap();
    let uuids: Vec<Uuid> = all.iter().map(|a| a.appliance_uuid).collect();
    assert!(uuids.contains(&app1) && uuids.contains(&app2));

    // An appliance cannot hang off an unregistered site.
    let err = fleet
        .store
        .create_appliance(&roost_fleetdb::models::ApplianceRow {
            appliance_uuid: Uuid::new_v4(),
            site_uuid: Uuid::new_v4(),
            name: "orphan".to_string(),
            created_at: ts(0),
        })
        .await
        .unwrap_err();
    match err {
        FleetError::ForeignKey { relation, .. } => assert_eq!(relation, "site"),
        other => panic!("expected ForeignKey, got {other:?}"),
    }
}

#[tokio::test]
async fn test_target_release_round_trip() {
    let fleet = TestFleet::new().await.expect("store setup failed");
    let release1 = mk_release(&fleet, 1, "one").await;
    let release2 = mk_release(&fleet, 2, "two").await;
    let site = mk_site(fleet.store.as_ref(), "site1").await;
    let appliance = mk_appliance(fleet.store.as_ref(), site, "gw0").await;

    // Never-assigned appliances are NotFound, not empty.
    let err = fleet.store.get_target_release(appliance).await.unwrap_err();
    assert!(matches!(err, FleetError::NotFound(_)));

    fleet
        .store
        .set_target_release(appliance, release1)
        .await
        .unwrap();
    assert_eq!(
        fleet.store.get_target_release(appliance).await.unwrap(),
        release1
    );

    // Reassignment overwrites; no history of targets is kept.
    fleet
        .store
        .set_target_release(appliance, release2)
        .await
        .unwrap();
    assert_eq!(
        fleet.store.get_target_release(appliance).await.unwrap(),
        release2
    );
}

#[tokio::test]
async fn test_referential_integrity_names_the_relation() {
    let fleet = TestFleet::new().await.expect("store setup failed");
    let release = mk_release(&fleet, 3, "rel").await;
    let site = mk_site(fleet.store.as_ref(), "site1").await;
    let appliance = mk_appliance(fleet.store.as_ref(), site, "gw0").await;

    // Unknown appliance.
    let err = fleet
        .store
        .set_target_release(Uuid::new_v4(), release)
        .await
        .unwrap_err();
    match err {
        FleetError::ForeignKey { relation, .. } => assert_eq!(relation, "appliance"),
        other => panic!("expected ForeignKey, got {other:?}"),
    }
    let err = fleet
        .store
        .set_current_release(Uuid::new_v4(), release, ts(1), &CommitMap::new())
        .await
        .unwrap_err();
    match err {
        FleetError::ForeignKey { relation, .. } => assert_eq!(relation, "appliance"),
        other => panic!("expected ForeignKey, got {other:?}"),
    }

    // Unknown release.
    let err = fleet
        .store
        .set_target_release(appliance, Uuid::new_v4())
        .await
        .unwrap_err();
    match err {
        FleetError::ForeignKey { relation, .. } => assert_eq!(relation, "release"),
        other => panic!("expected ForeignKey, got {other:?}"),
    }
    let err = fleet
        .store
        .set_upgrade_stage(
            appliance,
            Uuid::new_v4(),
            ts(1),
            UpgradeStage::Notified,
            true,
            None,
        )
        .await
        .unwrap_err();
    match err {
        FleetError::ForeignKey { relation, .. } => assert_eq!(relation, "release"),
        other => panic!("expected ForeignKey, got {other:?}"),
    }
}

#[tokio::test]
async fn test_current_release_round_trip() {
    let fleet = TestFleet::new().await.expect("store setup failed");
    let release1 = mk_release(&fleet, 4, "one").await;
    let release2 = mk_release(&fleet, 5, "two").await;
    let site = mk_site(fleet.store.as_ref(), "site1").await;
    let appliance = mk_appliance(fleet.store.as_ref(), site, "gw0").await;

    let err = fleet.store.get_current_release(appliance).await.unwrap_err();
    assert!(matches!(err, FleetError::NotFound(_)));

    fleet
        .store
        .set_current_release(appliance, release1, ts(1), &CommitMap::new())
        .await
        .unwrap();
    assert_eq!(
        fleet.store.get_current_release(appliance).await.unwrap(),
        release1
    );

    fleet
        .store
        .set_current_release(appliance, release2, ts(2), &CommitMap::new())
        .await
        .unwrap();
    assert_eq!(
        fleet.store.get_current_release(appliance).await.unwrap(),
        release2
    );
}

#[tokio::test]
async fn test_identical_heartbeats_do_not_advance_timestamp() {
    let fleet = TestFleet::new().await.expect("store setup failed");
    let site = mk_site(fleet.store.as_ref(), "site1").await;
    let appliance = mk_appliance(fleet.store.as_ref(), site, "gw0").await;

    // Off-catalog report: the nil release plus the raw commit map.
    let commits = CommitMap::from([("repoA".to_string(), "abc".to_string())]);
    fleet
        .store
        .set_current_release(appliance, Uuid::nil(), ts(1), &commits)
        .await
        .unwrap();

    // The same content later must not churn the timestamp.
    fleet
        .store
        .set_current_release(appliance, Uuid::nil(), ts(2), &commits)
        .await
        .unwrap();
    let history = fleet.store.get_release_history(appliance).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].updated_ts, ts(1));
    assert_eq!(
        history[0].commit_map().unwrap().get("repoA").unwrap(),
        "abc"
    );

    // A changed commit map is a real report and advances it.
    let changed = CommitMap::from([("repoA".to_string(), "def".to_string())]);
    fleet
        .store
        .set_current_release(appliance, Uuid::nil(), ts(3), &changed)
        .await
        .unwrap();
    let history = fleet.store.get_release_history(appliance).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].updated_ts, ts(3));
}

#[tokio::test]
async fn test_current_release_success_tracks_target() {
    let fleet = TestFleet::new().await.expect("store setup failed");
    let release = mk_release(&fleet, 6, "rel").await;
    let site = mk_site(fleet.store.as_ref(), "site1").await;
    let appliance = mk_appliance(fleet.store.as_ref(), site, "gw0").await;

    // With no target, success is unknown.
    fleet
        .store
        .set_current_release(appliance, release, ts(1), &CommitMap::new())
        .await
        .unwrap();
    let history = fleet.store.get_release_history(appliance).await.unwrap();
    assert_eq!(history[0].success, None);

    // Landing on the assigned target is a success.
    fleet
        .store
        .set_target_release(appliance, release)
        .await
        .unwrap();
    fleet
        .store
        .set_current_release(
            appliance,
            release,
            ts(2),
            &CommitMap::from([("WRT".to_string(), "aaa".to_string())]),
        )
        .await
        .unwrap();
    let history = fleet.store.get_release_history(appliance).await.unwrap();
    assert_eq!(history[0].success, Some(true));
}

#[tokio::test]
async fn test_upgrade_stages() {
    let fleet = TestFleet::new().await.expect("store setup failed");
    let release = mk_release(&fleet, 7, "rel").await;
    let site = mk_site(fleet.store.as_ref(), "site1").await;
    let appliance = mk_appliance(fleet.store.as_ref(), site, "gw0").await;

    fleet
        .store
        .set_upgrade_stage(
            appliance,
            release,
            ts(1),
            UpgradeStage::Notified,
            true,
            None,
        )
        .await
        .unwrap();
    fleet
        .store
        .set_upgrade_results(
            appliance,
            release,
            ts(2),
            false,
            Some("flash write failed"),
            "https://logs.example/upgrade/42",
        )
        .await
        .unwrap();

    let history = fleet.store.get_release_history(appliance).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].upgrade_stage().unwrap(), UpgradeStage::Installed);
    assert_eq!(history[0].success, Some(false));
    assert_eq!(history[0].message.as_deref(), Some("flash write failed"));
    assert_eq!(
        history[0].log_url.as_deref(),
        Some("https://logs.example/upgrade/42")
    );
    assert_eq!(history[1].upgrade_stage().unwrap(), UpgradeStage::Notified);

    // A recurring stage key updates in place rather than appending.
    fleet
        .store
        .set_upgrade_results(
            appliance,
            release,
            ts(3),
            true,
            None,
            "https://logs.example/upgrade/43",
        )
        .await
        .unwrap();
    let history = fleet.store.get_release_history(appliance).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].updated_ts, ts(3));
    assert_eq!(history[0].success, Some(true));
}

#[tokio::test]
async fn test_release_status_by_appliances() {
    let fleet = TestFleet::new().await.expect("store setup failed");
    let release1 = mk_release(&fleet, 8, "first").await;
    let release2 = mk_release(&fleet, 9, "second").await;
    let site = mk_site(fleet.store.as_ref(), "site1").await;
    let app1 = mk_appliance(fleet.store.as_ref(), site, "gw0").await;
    let app2 = mk_appliance(fleet.store.as_ref(), site, "gw1").await;
    let app3 = mk_appliance(fleet.store.as_ref(), site, "gw2").await;

    for app in [app1, app2, app3] {
        fleet
            .store
            .set_current_release(app, release1, ts(1), &CommitMap::new())
            .await
            .unwrap();
    }

    // Explicit selection returns exactly the requested appliances.
    let status = fleet
        .store
        .release_status_by_appliances(&[app1, app2, app3])
        .await
        .unwrap();
    assert_eq!(status.len(), 3);
    for app in [app1, app2, app3] {
        let entry = &status[&app];
        assert_eq!(entry.current_release_uuid, Some(release1));
        assert_eq!(entry.current_release_name.as_deref(), Some("first"));
        assert_eq!(entry.running_since, Some(ts(1)));
        assert!(entry.target_release_uuid.is_none());
    }

    // The empty selector means the whole fleet.
    let status = fleet.store.release_status_by_appliances(&[]).await.unwrap();
    assert_eq!(status.len(), 3);

    // A single-appliance selection stays scoped.
    let status = fleet
        .store
        .release_status_by_appliances(&[app2])
        .await
        .unwrap();
    assert_eq!(status.len(), 1);
    assert!(status.contains_key(&app2));

    // Moving one appliance forward shows only its newest current release.
    fleet
        .store
        .set_current_release(app3, release2, ts(2), &CommitMap::new())
        .await
        .unwrap();
    let status = fleet
        .store
        .release_status_by_appliances(&[app3])
        .await
        .unwrap();
    assert_eq!(status[&app3].current_release_uuid, Some(release2));
    assert_eq!(status[&app3].current_release_name.as_deref(), Some("second"));

    // Targets join in alongside currents.
    for app in [app1, app2, app3] {
        fleet.store.set_target_release(app, release2).await.unwrap();
    }
    let status = fleet.store.release_status_by_appliances(&[]).await.unwrap();
    assert_eq!(status.len(), 3);
    for app in [app1, app2, app3] {
        assert_eq!(status[&app].target_release_uuid, Some(release2));
        assert_eq!(
            status[&app].target_release_name.as_deref(),
            Some("second")
        );
    }
    assert_eq!(status[&app1].current_release_uuid, Some(release1));
    assert_eq!(status[&app3].current_release_uuid, Some(release2));
}

#[tokio::test]
async fn test_status_reports_off_catalog_and_stage_outcome() {
    let fleet = TestFleet::new().await.expect("store setup failed");
    let release = mk_release(&fleet, 10, "rel").await;
    let site = mk_site(fleet.store.as_ref(), "site1").await;
    let appliance = mk_appliance(fleet.store.as_ref(), site, "gw0").await;

    // The appliance runs something the catalog doesn't know.
    let commits = CommitMap::from([("WRT".to_string(), "deadbeef".to_string())]);
    fleet
        .store
        .set_current_release(appliance, Uuid::nil(), ts(1), &commits)
        .await
        .unwrap();
    // Then gets told about an upgrade, which fails to install.
    fleet
        .store
        .set_upgrade_stage(
            appliance,
            release,
            ts(2),
            UpgradeStage::Notified,
            true,
            None,
        )
        .await
        .unwrap();
    fleet
        .store
        .set_upgrade_results(
            appliance,
            release,
            ts(3),
            false,
            Some("no space left"),
            "https://logs.example/upgrade/99",
        )
        .await
        .unwrap();

    let status = fleet
        .store
        .release_status_by_appliances(&[appliance])
        .await
        .unwrap();
    let entry = &status[&appliance];

    // Current release is the nil sentinel plus the raw commit map...
    assert_eq!(entry.current_release_uuid, Some(Uuid::nil()));
    assert!(entry.current_release_name.is_none());
    assert_eq!(entry.running_since, Some(ts(1)));
    assert_eq!(entry.commits.get("WRT").unwrap(), "deadbeef");

    // ...while the stage outcome reflects the newest history row.
    assert_eq!(entry.stage, Some(UpgradeStage::Installed));
    assert_eq!(entry.success, Some(false));
    assert_eq!(entry.message.as_deref(), Some("no space left"));
    assert_eq!(
        entry.log_url.as_deref(),
        Some("https://logs.example/upgrade/99")
    );
}
