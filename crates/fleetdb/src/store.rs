//! Fleet store trait and SQLite implementation.

use crate::error::{FleetError, FleetResult};
use crate::repos::{
    ApplianceRepo, ArtifactRepo, CommandRepo, ReleaseRepo, ReleaseTrackingRepo, StatusRepo,
};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined fleet store trait.
#[async_trait]
pub trait FleetStore:
    ArtifactRepo
    + ReleaseRepo
    + CommandRepo
    + ApplianceRepo
    + ReleaseTrackingRepo
    + StatusRepo
    + Send
    + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> FleetResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> FleetResult<()>;
}

/// SQLite-based fleet store.
///
/// The pool holds a single connection, so writers are fully serialized.
/// That is what satisfies the command-claim contract here: two concurrent
/// fetchers cannot interleave inside the claim statement, so neither can
/// observe the other's half-claimed rows. PostgreSQL gets the same
/// guarantee from `FOR UPDATE SKIP LOCKED` instead (see `postgres.rs`).
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Create a new SQLite store, running migrations.
    pub async fn new(path: impl AsRef<Path>) -> FleetResult<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // SQLite permits limited write concurrency; a single connection
            // serializes writers and avoids "database is locked" failures.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        tracing::info!(path = %path.display(), "Opening SQLite fleet store");

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl FleetStore for SqliteStore {
    async fn migrate(&self) -> FleetResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> FleetResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// Repository trait implementations for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::repos::releases::assemble_listing;
    use crate::repos::status::assemble_release_status;
    use roost_core::{CommitMap, KvMap, UpgradeStage, canonical_artifact_set};
    use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
    use std::collections::HashMap;
    use time::OffsetDateTime;
    use uuid::Uuid;

    /// Map an unnamed SQLite foreign-key failure to the one relation a
    /// statement can violate. Statements touching tables with several
    /// foreign keys pre-check referents instead (SQLite does not say which
    /// constraint fired).
    fn fk_as(relation: &'static str) -> impl FnOnce(sqlx::Error) -> FleetError {
        move |err| {
            if let sqlx::Error::Database(ref dbe) = err
                && dbe.is_foreign_key_violation()
            {
                return FleetError::ForeignKey {
                    relation,
                    message: dbe.message().to_string(),
                };
            }
            err.into()
        }
    }

    /// Verify an appliance and a release exist, inside the caller's
    /// transaction, so multi-foreign-key writes can name the violated
    /// relationship precisely.
    async fn check_appliance_and_release(
        conn: &mut SqliteConnection,
        appliance_uuid: Uuid,
        release_uuid: Uuid,
    ) -> FleetResult<()> {
        let appliance: Option<Uuid> =
            sqlx::query_scalar("SELECT appliance_uuid FROM appliances WHERE appliance_uuid = ?")
                .bind(appliance_uuid)
                .fetch_optional(&mut *conn)
                .await?;
        if appliance.is_none() {
            return Err(FleetError::ForeignKey {
                relation: "appliance",
                message: format!("unknown appliance UUID {appliance_uuid}"),
            });
        }
        let release: Option<Uuid> =
            sqlx::query_scalar("SELECT release_uuid FROM releases WHERE release_uuid = ?")
                .bind(release_uuid)
                .fetch_optional(&mut *conn)
                .await?;
        if release.is_none() {
            return Err(FleetError::ForeignKey {
                relation: "release",
                message: format!("unknown release UUID {release_uuid}"),
            });
        }
        Ok(())
    }

    #[async_trait]
    impl ArtifactRepo for SqliteStore {
        async fn insert_artifact(&self, artifact: &NewArtifact) -> FleetResult<ArtifactInsert> {
            let row = ArtifactRow {
                artifact_uuid: Uuid::new_v4(),
                platform_name: artifact.platform_name.clone(),
                repo_name: artifact.repo_name.clone(),
                commit_hash: artifact.commit_hash.clone(),
                generation: artifact.generation,
                filename: artifact.filename.clone(),
                hash: artifact.hash.clone(),
                hash_type: artifact.hash_type.clone(),
            };

            let result = sqlx::query(
                r#"
                INSERT INTO artifacts (
                    artifact_uuid, platform_name, repo_name, commit_hash,
                    generation, filename, hash, hash_type
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(row.artifact_uuid)
            .bind(&row.platform_name)
            .bind(&row.repo_name)
            .bind(&row.commit_hash)
            .bind(row.generation)
            .bind(&row.filename)
            .bind(&row.hash)
            .bind(&row.hash_type)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() > 0 {
                return Ok(ArtifactInsert::Created(row));
            }

            // The identity tuple already exists; fetch the canonical row so
            // the caller can report the duplicate without aborting a batch.
            let existing = sqlx::query_as::<_, ArtifactRow>(
                r#"
                SELECT * FROM artifacts
                WHERE platform_name = ? AND repo_name = ? AND commit_hash = ?
                  AND generation = ? AND filename = ? AND hash = ? AND hash_type = ?
                "#,
            )
            .bind(&row.platform_name)
            .bind(&row.repo_name)
            .bind(&row.commit_hash)
            .bind(row.generation)
            .bind(&row.filename)
            .bind(&row.hash)
            .bind(&row.hash_type)
            .fetch_one(&self.pool)
            .await?;

            Ok(ArtifactInsert::AlreadyExists(existing))
        }

        async fn get_artifact(&self, artifact_uuid: Uuid) -> FleetResult<Option<ArtifactRow>> {
            let row =
                sqlx::query_as::<_, ArtifactRow>("SELECT * FROM artifacts WHERE artifact_uuid = ?")
                    .bind(artifact_uuid)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }
    }

    #[async_trait]
    impl ReleaseRepo for SqliteStore {
        async fn insert_release(
            &self,
            artifact_uuids: &[Uuid],
            metadata: &KvMap,
            now: OffsetDateTime,
        ) -> FleetResult<Uuid> {
            let canonical = canonical_artifact_set(artifact_uuids.to_vec());
            if canonical.is_empty() {
                return Err(FleetError::EmptyRelease);
            }
            let n = canonical.len() as i64;

            // The whole check-then-insert runs on the store's single writer
            // connection inside one transaction, so two concurrent callers
            // proposing the same set cannot both pass the equality check.
            let mut tx = self.pool.begin().await?;

            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT COUNT(*) FROM artifacts WHERE artifact_uuid IN (");
            let mut sep = qb.separated(", ");
            for uuid in &canonical {
                sep.push_bind(*uuid);
            }
            qb.push(")");
            let known: i64 = qb.build_query_scalar().fetch_one(&mut *tx).await?;
            if known != n {
                return Err(FleetError::ForeignKey {
                    relation: "artifact",
                    message: format!("release references {} unknown artifact(s)", n - known),
                });
            }

            // Two-sided set equality: a release matches only if every
            // candidate artifact is a member and it has no member outside
            // the candidate set. Bridge rows are unique per (release,
            // artifact), so plain counts are exact.
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT release_uuid FROM release_artifacts GROUP BY release_uuid \
                 HAVING SUM(CASE WHEN artifact_uuid IN (",
            );
            let mut sep = qb.separated(", ");
            for uuid in &canonical {
                sep.push_bind(*uuid);
            }
            qb.push(") THEN 1 ELSE 0 END) = ");
            qb.push_bind(n);
            qb.push(" AND COUNT(*) = ");
            qb.push_bind(n);
            let existing: Option<Uuid> = qb.build_query_scalar().fetch_optional(&mut *tx).await?;

            if let Some(release_uuid) = existing {
                tx.rollback().await?;
                return Err(FleetError::ReleaseExists { release_uuid });
            }

            let release_uuid = Uuid::new_v4();
            let metadata_json = if metadata.is_empty() {
                None
            } else {
                Some(serde_json::to_string(metadata).map_err(|e| {
                    FleetError::InvalidState(roost_core::Error::Serialization(e.to_string()))
                })?)
            };
            sqlx::query("INSERT INTO releases (release_uuid, create_ts, metadata) VALUES (?, ?, ?)")
                .bind(release_uuid)
                .bind(now)
                .bind(metadata_json)
                .execute(&mut *tx)
                .await?;
            for uuid in &canonical {
                sqlx::query(
                    "INSERT INTO release_artifacts (release_uuid, artifact_uuid) VALUES (?, ?)",
                )
                .bind(release_uuid)
                .bind(*uuid)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            Ok(release_uuid)
        }

        async fn get_release(&self, release_uuid: Uuid) -> FleetResult<Option<Release>> {
            // The nil release is the "no release" sentinel, not a real
            // catalog entry.
            if release_uuid.is_nil() {
                return Ok(None);
            }

            let row = sqlx::query_as::<_, ReleaseRow>(
                "SELECT release_uuid, create_ts, metadata FROM releases WHERE release_uuid = ?",
            )
            .bind(release_uuid)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("release {release_uuid} not found")))?;

            let artifacts = sqlx::query_as::<_, ArtifactRow>(
                r#"
                SELECT a.*
                FROM artifacts a
                JOIN release_artifacts ra ON a.artifact_uuid = ra.artifact_uuid
                WHERE ra.release_uuid = ?
                ORDER BY a.repo_name, a.filename
                "#,
            )
            .bind(release_uuid)
            .fetch_all(&self.pool)
            .await?;

            Ok(Some(crate::repos::releases::assemble_release(
                row, artifacts,
            )?))
        }

        async fn list_releases(&self) -> FleetResult<ReleaseListing> {
            // The nil placeholder has no bridge rows and drops out of the
            // EXISTS filter.
            let rows = sqlx::query_as::<_, ReleaseRow>(
                r#"
                SELECT r.release_uuid, r.create_ts, r.metadata
                FROM releases r
                WHERE EXISTS (
                    SELECT 1 FROM release_artifacts ra WHERE ra.release_uuid = r.release_uuid
                )
                ORDER BY r.create_ts
                "#,
            )
            .fetch_all(&self.pool)
            .await?;

            let bridged = sqlx::query_as::<_, BridgedArtifactRow>(
                r#"
                SELECT ra.release_uuid AS bridge_release_uuid, a.*
                FROM release_artifacts ra
                JOIN artifacts a ON a.artifact_uuid = ra.artifact_uuid
                ORDER BY a.repo_name, a.filename
                "#,
            )
            .fetch_all(&self.pool)
            .await?;

            assemble_listing(rows, bridged)
        }
    }

    #[async_trait]
    impl CommandRepo for SqliteStore {
        async fn command_submit(
            &self,
            site_uuid: Uuid,
            query: &[u8],
            now: OffsetDateTime,
        ) -> FleetResult<i64> {
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO site_commands (site_uuid, enq_ts, state, config_query)
                VALUES (?, ?, 'ENQD', ?)
                RETURNING id
                "#,
            )
            .bind(site_uuid)
            .bind(now)
            .bind(query)
            .fetch_one(&self.pool)
            .await
            .map_err(fk_as("site"))?;
            Ok(id)
        }

        async fn command_search(
            &self,
            site_uuid: Uuid,
            cmd_id: i64,
        ) -> FleetResult<SiteCommandRow> {
            sqlx::query_as::<_, SiteCommandRow>(
                "SELECT * FROM site_commands WHERE site_uuid = ? AND id = ?",
            )
            .bind(site_uuid)
            .bind(cmd_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| FleetError::NotFound("command not found".to_string()))
        }

        async fn command_fetch(
            &self,
            site_uuid: Uuid,
            min_id: i64,
            max: u32,
            now: OffsetDateTime,
        ) -> FleetResult<Vec<SiteCommandRow>> {
            // One statement claims the whole batch; the single writer
            // connection serializes concurrent fetchers, so no two callers
            // can claim the same row. All SET expressions see the
            // pre-update row, which is why `resent_n` can test the old
            // state: NULL after a first claim, incremented on re-claims.
            let mut claimed = sqlx::query_as::<_, SiteCommandRow>(
                r#"
                UPDATE site_commands
                SET sent_ts = ?,
                    resent_n = CASE WHEN state = 'WORK' THEN COALESCE(resent_n, 0) + 1 END,
                    state = 'WORK'
                WHERE id IN (
                    SELECT id FROM site_commands
                    WHERE site_uuid = ? AND state IN ('ENQD', 'WORK') AND id > ?
                    ORDER BY id
                    LIMIT ?
                )
                RETURNING *
                "#,
            )
            .bind(now)
            .bind(site_uuid)
            .bind(min_id)
            .bind(max as i64)
            .fetch_all(&self.pool)
            .await?;
            claimed.sort_by_key(|cmd| cmd.id);
            Ok(claimed)
        }

        async fn command_audit(
            &self,
            site_uuid: Option<Uuid>,
            min_id: i64,
            max: u32,
        ) -> FleetResult<Vec<SiteCommandRow>> {
            let rows = match site_uuid {
                Some(site) => {
                    sqlx::query_as::<_, SiteCommandRow>(
                        "SELECT * FROM site_commands WHERE site_uuid = ? AND id > ? ORDER BY id LIMIT ?",
                    )
                    .bind(site)
                    .bind(min_id)
                    .bind(max as i64)
                    .fetch_all(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query_as::<_, SiteCommandRow>(
                        "SELECT * FROM site_commands WHERE id > ? ORDER BY id LIMIT ?",
                    )
                    .bind(min_id)
                    .bind(max as i64)
                    .fetch_all(&self.pool)
                    .await?
                }
            };
            Ok(rows)
        }

        async fn command_audit_window(
            &self,
            site_uuid: Option<Uuid>,
            from: OffsetDateTime,
            until: OffsetDateTime,
            max: u32,
        ) -> FleetResult<Vec<SiteCommandRow>> {
            let rows = match site_uuid {
                Some(site) => {
                    sqlx::query_as::<_, SiteCommandRow>(
                        r#"
                        SELECT * FROM site_commands
                        WHERE site_uuid = ? AND enq_ts >= ? AND enq_ts < ?
                        ORDER BY id
                        LIMIT ?
                        "#,
                    )
                    .bind(site)
                    .bind(from)
                    .bind(until)
                    .bind(max as i64)
                    .fetch_all(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query_as::<_, SiteCommandRow>(
                        r#"
                        SELECT * FROM site_commands
                        WHERE enq_ts >= ? AND enq_ts < ?
                        ORDER BY id
                        LIMIT ?
                        "#,
                    )
                    .bind(from)
                    .bind(until)
                    .bind(max as i64)
                    .fetch_all(&self.pool)
                    .await?
                }
            };
            Ok(rows)
        }

        async fn command_cancel(
            &self,
            site_uuid: Uuid,
            cmd_id: i64,
            now: OffsetDateTime,
        ) -> FleetResult<CommandTransition> {
            self.command_finish(site_uuid, cmd_id, None, now).await
        }

        async fn command_complete(
            &self,
            site_uuid: Uuid,
            cmd_id: i64,
            response: &[u8],
            now: OffsetDateTime,
        ) -> FleetResult<CommandTransition> {
            self.command_finish(site_uuid, cmd_id, Some(response), now)
                .await
        }

        async fn command_delete(&self, site_uuid: Uuid, keep: u32) -> FleetResult<u64> {
            let result = sqlx::query(
                r#"
                DELETE FROM site_commands
                WHERE site_uuid = ?1 AND state IN ('DONE', 'CNCL')
                  AND id NOT IN (
                      SELECT id FROM site_commands
                      WHERE site_uuid = ?1 AND state IN ('DONE', 'CNCL')
                      ORDER BY id DESC
                      LIMIT ?2
                  )
                "#,
            )
            .bind(site_uuid)
            .bind(keep as i64)
            .execute(&self.pool)
            .await?;
            tracing::debug!(
                site = %site_uuid,
                removed = result.rows_affected(),
                "trimmed terminal commands"
            );
            Ok(result.rows_affected())
        }
    }

    impl SqliteStore {
        /// Move a command to a terminal state -- done or canceled -- and
        /// return both the old and new snapshots. Terminal commands are
        /// left untouched: the unchanged row comes back as both ends of
        /// the transition.
        async fn command_finish(
            &self,
            site_uuid: Uuid,
            cmd_id: i64,
            response: Option<&[u8]>,
            now: OffsetDateTime,
        ) -> FleetResult<CommandTransition> {
            let state = if response.is_some() { "DONE" } else { "CNCL" };

            let mut tx = self.pool.begin().await?;

            let old = sqlx::query_as::<_, SiteCommandRow>(
                "SELECT * FROM site_commands WHERE site_uuid = ? AND id = ?",
            )
            .bind(site_uuid)
            .bind(cmd_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("could not find command ID {cmd_id}")))?;

            if old.command_state()?.is_terminal() {
                tx.commit().await?;
                let new = old.clone();
                return Ok(CommandTransition { old, new });
            }

            let new = sqlx::query_as::<_, SiteCommandRow>(
                r#"
                UPDATE site_commands
                SET state = ?, done_ts = ?, config_response = ?
                WHERE site_uuid = ? AND id = ?
                RETURNING *
                "#,
            )
            .bind(state)
            .bind(now)
            .bind(response)
            .bind(site_uuid)
            .bind(cmd_id)
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(CommandTransition { old, new })
        }
    }

    #[async_trait]
    impl ApplianceRepo for SqliteStore {
        async fn create_site(&self, site: &SiteRow) -> FleetResult<()> {
            sqlx::query("INSERT INTO sites (site_uuid, name, created_at) VALUES (?, ?, ?)")
                .bind(site.site_uuid)
                .bind(&site.name)
                .bind(site.created_at)
                .execute(&self.pool)
                .await
                .map_err(|err| {
                    if let sqlx::Error::Database(ref dbe) = err
                        && dbe.is_unique_violation()
                    {
                        return FleetError::AlreadyExists(format!(
                            "site {} already exists",
                            site.site_uuid
                        ));
                    }
                    err.into()
                })?;
            Ok(())
        }

        async fn create_appliance(&self, appliance: &ApplianceRow) -> FleetResult<()> {
            sqlx::query(
                "INSERT INTO appliances (appliance_uuid, site_uuid, name, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(appliance.appliance_uuid)
            .bind(appliance.site_uuid)
            .bind(&appliance.name)
            .bind(appliance.created_at)
            .execute(&self.pool)
            .await
            .map_err(fk_as("site"))?;
            Ok(())
        }

        async fn get_appliance(&self, appliance_uuid: Uuid) -> FleetResult<Option<ApplianceRow>> {
            let row = sqlx::query_as::<_, ApplianceRow>(
                "SELECT * FROM appliances WHERE appliance_uuid = ?",
            )
            .bind(appliance_uuid)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_appliances(&self) -> FleetResult<Vec<ApplianceRow>> {
            let rows =
                sqlx::query_as::<_, ApplianceRow>("SELECT * FROM appliances ORDER BY created_at")
                    .fetch_all(&self.pool)
                    .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl ReleaseTrackingRepo for SqliteStore {
        async fn set_target_release(
            &self,
            appliance_uuid: Uuid,
            release_uuid: Uuid,
        ) -> FleetResult<()> {
            let mut tx = self.pool.begin().await?;
            check_appliance_and_release(&mut *tx, appliance_uuid, release_uuid).await?;
            sqlx::query(
                r#"
                INSERT INTO appliance_release_targets (appliance_uuid, release_uuid)
                VALUES (?, ?)
                ON CONFLICT (appliance_uuid) DO UPDATE SET release_uuid = excluded.release_uuid
                "#,
            )
            .bind(appliance_uuid)
            .bind(release_uuid)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        }

        async fn get_target_release(&self, appliance_uuid: Uuid) -> FleetResult<Uuid> {
            sqlx::query_scalar(
                "SELECT release_uuid FROM appliance_release_targets WHERE appliance_uuid = ?",
            )
            .bind(appliance_uuid)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                FleetError::NotFound(format!(
                    "no target release recorded for appliance {appliance_uuid}"
                ))
            })
        }

        async fn set_current_release(
            &self,
            appliance_uuid: Uuid,
            release_uuid: Uuid,
            ts: OffsetDateTime,
            commits: &CommitMap,
        ) -> FleetResult<()> {
            let commits_json = serde_json::to_string(commits).map_err(|e| {
                FleetError::InvalidState(roost_core::Error::Serialization(e.to_string()))
            })?;

            let mut tx = self.pool.begin().await?;
            check_appliance_and_release(&mut *tx, appliance_uuid, release_uuid).await?;

            // `success` records whether the appliance landed on its target.
            // The change guard keeps redundant heartbeats from advancing
            // updated_ts: the row only moves when the success flag or the
            // reported commits actually differ (IS NOT is SQLite's
            // null-safe distinctness).
            sqlx::query(
                r#"
                INSERT INTO appliance_release_history (
                    appliance_uuid, release_uuid, stage, updated_ts, success, repo_commits
                )
                VALUES (
                    ?1, ?2, 'complete', ?3,
                    (SELECT release_uuid = ?2 FROM appliance_release_targets WHERE appliance_uuid = ?1),
                    ?4
                )
                ON CONFLICT (appliance_uuid, release_uuid, stage) DO UPDATE
                SET updated_ts = excluded.updated_ts,
                    success = excluded.success,
                    repo_commits = excluded.repo_commits
                WHERE appliance_release_history.success IS NOT excluded.success
                   OR appliance_release_history.repo_commits IS NOT excluded.repo_commits
                "#,
            )
            .bind(appliance_uuid)
            .bind(release_uuid)
            .bind(ts)
            .bind(commits_json)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        }

        async fn get_current_release(&self, appliance_uuid: Uuid) -> FleetResult<Uuid> {
            sqlx::query_scalar(
                r#"
                SELECT release_uuid FROM appliance_release_history
                WHERE appliance_uuid = ? AND stage = 'complete'
                ORDER BY updated_ts DESC
                LIMIT 1
                "#,
            )
            .bind(appliance_uuid)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                FleetError::NotFound(format!(
                    "no current release recorded for appliance {appliance_uuid}"
                ))
            })
        }

        async fn set_upgrade_stage(
            &self,
            appliance_uuid: Uuid,
            release_uuid: Uuid,
            ts: OffsetDateTime,
            stage: UpgradeStage,
            success: bool,
            message: Option<&str>,
        ) -> FleetResult<()> {
            let mut tx = self.pool.begin().await?;
            check_appliance_and_release(&mut *tx, appliance_uuid, release_uuid).await?;
            sqlx::query(
                r#"
                INSERT INTO appliance_release_history (
                    appliance_uuid, release_uuid, stage, updated_ts, success, message
                )
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT (appliance_uuid, release_uuid, stage) DO UPDATE
                SET updated_ts = excluded.updated_ts,
                    success = excluded.success,
                    message = excluded.message
                WHERE appliance_release_history.success IS NOT excluded.success
                   OR appliance_release_history.message IS NOT excluded.message
                "#,
            )
            .bind(appliance_uuid)
            .bind(release_uuid)
            .bind(stage.as_str())
            .bind(ts)
            .bind(success)
            .bind(message)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        }

        async fn set_upgrade_results(
            &self,
            appliance_uuid: Uuid,
            release_uuid: Uuid,
            ts: OffsetDateTime,
            success: bool,
            message: Option<&str>,
            log_url: &str,
        ) -> FleetResult<()> {
            let mut tx = self.pool.begin().await?;
            check_appliance_and_release(&mut *tx, appliance_uuid, release_uuid).await?;
            sqlx::query(
                r#"
                INSERT INTO appliance_release_history (
                    appliance_uuid, release_uuid, stage, updated_ts, success, message, log_url
                )
                VALUES (?, ?, 'installed', ?, ?, ?, ?)
                ON CONFLICT (appliance_uuid, release_uuid, stage) DO UPDATE
                SET updated_ts = excluded.updated_ts,
                    success = excluded.success,
                    message = excluded.message,
                    log_url = excluded.log_url
                WHERE appliance_release_history.success IS NOT excluded.success
                   OR appliance_release_history.message IS NOT excluded.message
                   OR appliance_release_history.log_url IS NOT excluded.log_url
                "#,
            )
            .bind(appliance_uuid)
            .bind(release_uuid)
            .bind(ts)
            .bind(success)
            .bind(message)
            .bind(log_url)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        }

        async fn get_release_history(
            &self,
            appliance_uuid: Uuid,
        ) -> FleetResult<Vec<ReleaseHistoryRow>> {
            let rows = sqlx::query_as::<_, ReleaseHistoryRow>(
                r#"
                SELECT * FROM appliance_release_history
                WHERE appliance_uuid = ?
                ORDER BY updated_ts DESC
                "#,
            )
            .bind(appliance_uuid)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl StatusRepo for SqliteStore {
        async fn release_status_by_appliances(
            &self,
            appliance_uuids: &[Uuid],
        ) -> FleetResult<HashMap<Uuid, ApplianceReleaseStatus>> {
            let (targets, history) = if appliance_uuids.is_empty() {
                let targets = sqlx::query_as::<_, ReleaseTargetRow>(
                    "SELECT * FROM appliance_release_targets",
                )
                .fetch_all(&self.pool)
                .await?;
                let history = sqlx::query_as::<_, ReleaseHistoryRow>(
                    "SELECT * FROM appliance_release_history",
                )
                .fetch_all(&self.pool)
                .await?;
                (targets, history)
            } else {
                let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                    "SELECT * FROM appliance_release_targets WHERE appliance_uuid IN (",
                );
                let mut sep = qb.separated(", ");
                for uuid in appliance_uuids {
                    sep.push_bind(*uuid);
                }
                qb.push(")");
                let targets = qb
                    .build_query_as::<ReleaseTargetRow>()
                    .fetch_all(&self.pool)
                    .await?;

                let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                    "SELECT * FROM appliance_release_history WHERE appliance_uuid IN (",
                );
                let mut sep = qb.separated(", ");
                for uuid in appliance_uuids {
                    sep.push_bind(*uuid);
                }
                qb.push(")");
                let history = qb
                    .build_query_as::<ReleaseHistoryRow>()
                    .fetch_all(&self.pool)
                    .await?;
                (targets, history)
            };

            let mut wanted: Vec<Uuid> = targets
                .iter()
                .map(|t| t.release_uuid)
                .chain(history.iter().map(|h| h.release_uuid))
                .collect();
            wanted.sort_unstable();
            wanted.dedup();

            let mut release_names: HashMap<Uuid, Option<String>> = HashMap::new();
            if !wanted.is_empty() {
                let mut qb: QueryBuilder<Sqlite> =
                    QueryBuilder::new("SELECT release_uuid, metadata FROM releases WHERE release_uuid IN (");
                let mut sep = qb.separated(", ");
                for uuid in &wanted {
                    sep.push_bind(*uuid);
                }
                qb.push(")");
                let rows: Vec<(Uuid, Option<String>)> =
                    qb.build_query_as().fetch_all(&self.pool).await?;
                for (release_uuid, metadata) in rows {
                    let name = decode_kv_map(metadata.as_deref())?.remove("name");
                    release_names.insert(release_uuid, name);
                }
            }

            assemble_release_status(targets, history, release_names)
        }
    }
}

/// SQLite schema (embedded). Executed wholesale on every connect; all
/// statements are idempotent.
const SCHEMA_SQL: &str = r#"
-- Sites and appliances
CREATE TABLE IF NOT EXISTS sites (
    site_uuid BLOB PRIMARY KEY,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS appliances (
    appliance_uuid BLOB PRIMARY KEY,
    site_uuid BLOB NOT NULL REFERENCES sites(site_uuid),
    name TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_appliances_site ON appliances(site_uuid);

-- Artifacts: immutable, content-identified build outputs
CREATE TABLE IF NOT EXISTS artifacts (
    artifact_uuid BLOB PRIMARY KEY,
    platform_name TEXT NOT NULL,
    repo_name TEXT NOT NULL,
    commit_hash BLOB NOT NULL,
    generation INTEGER NOT NULL,
    filename TEXT NOT NULL,
    hash BLOB NOT NULL,
    hash_type TEXT NOT NULL,
    UNIQUE (platform_name, repo_name, commit_hash, generation, filename, hash, hash_type)
);

-- Releases: deduplicated sets of artifacts
CREATE TABLE IF NOT EXISTS releases (
    release_uuid BLOB PRIMARY KEY,
    create_ts TEXT NOT NULL,
    metadata TEXT
);
-- The nil release is a placeholder: history rows reference it when an
-- appliance reports a commit set matching no cataloged release.
INSERT OR IGNORE INTO releases (release_uuid, create_ts, metadata)
VALUES (X'00000000000000000000000000000000', CURRENT_TIMESTAMP, NULL);

CREATE TABLE IF NOT EXISTS release_artifacts (
    release_uuid BLOB NOT NULL REFERENCES releases(release_uuid),
    artifact_uuid BLOB NOT NULL REFERENCES artifacts(artifact_uuid),
    PRIMARY KEY (release_uuid, artifact_uuid)
);
CREATE INDEX IF NOT EXISTS idx_release_artifacts_artifact
    ON release_artifacts(artifact_uuid, release_uuid);

-- Per-site command queue. AUTOINCREMENT keeps ids strictly increasing and
-- never reused, which the claim protocol's id cursor relies on.
CREATE TABLE IF NOT EXISTS site_commands (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    site_uuid BLOB NOT NULL REFERENCES sites(site_uuid),
    enq_ts TEXT NOT NULL,
    sent_ts TEXT,
    resent_n INTEGER,
    done_ts TEXT,
    state TEXT NOT NULL DEFAULT 'ENQD',
    config_query BLOB NOT NULL,
    config_response BLOB
);
CREATE INDEX IF NOT EXISTS idx_site_commands_pending ON site_commands(site_uuid, state, id);

-- Release tracking
CREATE TABLE IF NOT EXISTS appliance_release_targets (
    appliance_uuid BLOB PRIMARY KEY REFERENCES appliances(appliance_uuid),
    release_uuid BLOB NOT NULL REFERENCES releases(release_uuid)
);

CREATE TABLE IF NOT EXISTS appliance_release_history (
    appliance_uuid BLOB NOT NULL REFERENCES appliances(appliance_uuid),
    release_uuid BLOB NOT NULL REFERENCES releases(release_uuid),
    stage TEXT NOT NULL,
    updated_ts TEXT NOT NULL,
    success INTEGER,
    message TEXT,
    log_url TEXT,
    repo_commits TEXT,
    PRIMARY KEY (appliance_uuid, release_uuid, stage)
);
CREATE INDEX IF NOT EXISTS idx_release_history_updated
    ON appliance_release_history(appliance_uuid, updated_ts);
"#;
