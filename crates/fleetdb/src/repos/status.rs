//! Fleet-wide release status reporting.

use crate::error::FleetResult;
use crate::models::{ApplianceReleaseStatus, ReleaseHistoryRow, ReleaseTargetRow};
use async_trait::async_trait;
use roost_core::UpgradeStage;
use std::collections::HashMap;
use uuid::Uuid;

/// Read-only aggregation joining release tracking state for reporting.
#[async_trait]
pub trait StatusRepo: Send + Sync {
    /// Release status for the given appliances, or for every appliance with
    /// any recorded release state when the slice is empty.
    ///
    /// Appliances that have neither reported a release nor been assigned a
    /// target do not appear in the result.
    async fn release_status_by_appliances(
        &self,
        appliance_uuids: &[Uuid],
    ) -> FleetResult<HashMap<Uuid, ApplianceReleaseStatus>>;
}

/// Join target pointers and history rows into per-appliance status.
///
/// The "current" release comes from the newest `complete`-stage row; the
/// stage/success/message outcome comes from the newest row of any stage, so
/// a fresh `notified` entry shows up without hiding what the appliance is
/// actually running.
pub(crate) fn assemble_release_status(
    targets: Vec<ReleaseTargetRow>,
    history: Vec<ReleaseHistoryRow>,
    release_names: HashMap<Uuid, Option<String>>,
) -> FleetResult<HashMap<Uuid, ApplianceReleaseStatus>> {
    let mut out: HashMap<Uuid, ApplianceReleaseStatus> = HashMap::new();

    for target in &targets {
        let entry = out.entry(target.appliance_uuid).or_default();
        entry.target_release_uuid = Some(target.release_uuid);
        entry.target_release_name = release_names.get(&target.release_uuid).cloned().flatten();
    }

    let mut newest_complete: HashMap<Uuid, &ReleaseHistoryRow> = HashMap::new();
    let mut newest_any: HashMap<Uuid, &ReleaseHistoryRow> = HashMap::new();
    for row in &history {
        let any = newest_any.entry(row.appliance_uuid).or_insert(row);
        if row.updated_ts > any.updated_ts {
            *any = row;
        }
        if row.stage == UpgradeStage::Complete.as_str() {
            let complete = newest_complete.entry(row.appliance_uuid).or_insert(row);
            if row.updated_ts > complete.updated_ts {
                *complete = row;
            }
        }
    }

    for (appliance_uuid, row) in &newest_complete {
        let entry = out.entry(*appliance_uuid).or_default();
        entry.current_release_uuid = Some(row.release_uuid);
        entry.current_release_name = release_names.get(&row.release_uuid).cloned().flatten();
        entry.running_since = Some(row.updated_ts);
        entry.commits = row.commit_map()?;
    }

    for (appliance_uuid, row) in &newest_any {
        let entry = out.entry(*appliance_uuid).or_default();
        entry.stage = Some(row.upgrade_stage()?);
        entry.success = row.success;
        entry.message = row.message.clone();
        entry.log_url = row.log_url.clone();
    }

    Ok(out)
}
