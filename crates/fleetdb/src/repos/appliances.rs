//! Appliance registry and per-appliance release tracking repositories.

use crate::error::FleetResult;
use crate::models::{ApplianceRow, ReleaseHistoryRow, SiteRow};
use async_trait::async_trait;
use roost_core::{CommitMap, UpgradeStage};
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for the site/appliance registry.
///
/// Identity and organization management live elsewhere; this is the minimal
/// record needed so command and release references point at real rows.
#[async_trait]
pub trait ApplianceRepo: Send + Sync {
    /// Register a site.
    async fn create_site(&self, site: &SiteRow) -> FleetResult<()>;

    /// Register an appliance under a site. An unknown site is a
    /// `FleetError::ForeignKey` naming `site`.
    async fn create_appliance(&self, appliance: &ApplianceRow) -> FleetResult<()>;

    /// Look up an appliance by UUID.
    async fn get_appliance(&self, appliance_uuid: Uuid) -> FleetResult<Option<ApplianceRow>>;

    /// List all known appliances.
    async fn list_appliances(&self) -> FleetResult<Vec<ApplianceRow>>;
}

/// Repository tracking which release each appliance runs and should run.
#[async_trait]
pub trait ReleaseTrackingRepo: Send + Sync {
    /// Set the release an appliance is expected to upgrade to. Overwrites
    /// any previous target; no history of targets is kept.
    async fn set_target_release(&self, appliance_uuid: Uuid, release_uuid: Uuid)
    -> FleetResult<()>;

    /// Get an appliance's target release. NotFound if none was ever set.
    async fn get_target_release(&self, appliance_uuid: Uuid) -> FleetResult<Uuid>;

    /// Record the release an appliance reports it is running, as a
    /// `complete`-stage history entry.
    ///
    /// `release_uuid` may be the nil sentinel when the reported commit set
    /// matches no cataloged release; `commits` is then the authoritative
    /// record of what is running. Re-recording identical content does not
    /// advance the stored timestamp, so repeated heartbeats are free;
    /// changed content does.
    async fn set_current_release(
        &self,
        appliance_uuid: Uuid,
        release_uuid: Uuid,
        ts: OffsetDateTime,
        commits: &CommitMap,
    ) -> FleetResult<()>;

    /// Get the release an appliance most recently reported running.
    /// NotFound if it has never reported.
    async fn get_current_release(&self, appliance_uuid: Uuid) -> FleetResult<Uuid>;

    /// Record a `notified`/`installed` upgrade-stage transition. The
    /// `complete` stage is recorded through
    /// [`set_current_release`](Self::set_current_release).
    async fn set_upgrade_stage(
        &self,
        appliance_uuid: Uuid,
        release_uuid: Uuid,
        ts: OffsetDateTime,
        stage: UpgradeStage,
        success: bool,
        message: Option<&str>,
    ) -> FleetResult<()>;

    /// Record the outcome of the pre-reboot install step: an `installed`
    /// stage entry carrying a short error message, if any, and a pointer to
    /// the upgrade log.
    async fn set_upgrade_results(
        &self,
        appliance_uuid: Uuid,
        release_uuid: Uuid,
        ts: OffsetDateTime,
        success: bool,
        message: Option<&str>,
        log_url: &str,
    ) -> FleetResult<()>;

    /// All history rows for an appliance, newest first.
    async fn get_release_history(
        &self,
        appliance_uuid: Uuid,
    ) -> FleetResult<Vec<ReleaseHistoryRow>>;
}
