//! PostgreSQL-based fleet store implementation.
//!
//! This is the production backend: multiple stateless service replicas
//! share one database, and every coordination point (command claiming,
//! release dedup, idempotent history updates) is expressed in the SQL
//! itself rather than in process memory.

use crate::error::{FleetError, FleetResult, map_fk_violation};
use crate::models::*;
use crate::repos::releases::{assemble_listing, assemble_release};
use crate::repos::status::assemble_release_status;
use crate::repos::{
    ApplianceRepo, ArtifactRepo, CommandRepo, ReleaseRepo, ReleaseTrackingRepo, StatusRepo,
};
use crate::store::FleetStore;
use async_trait::async_trait;
use roost_core::config::PgSslMode;
use roost_core::{CommitMap, KvMap, UpgradeStage, advisory_lock_key, canonical_artifact_set};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow, PgSslMode as SqlxPgSslMode};
use sqlx::{Pool, Postgres, Row};
use std::collections::HashMap;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// PostgreSQL-based fleet store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> FleetResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Create a new PostgreSQL store from individual connection parameters.
    ///
    /// This allows credentials to be passed separately, enabling better
    /// secret management (e.g., passwords via environment variables).
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> FleetResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        // Log connection info without password
        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL fleet store"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Internal: Connect to PostgreSQL with the given options.
    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> FleetResult<Self> {
        // A server-side statement timeout keeps a wedged query from pinning
        // a pool connection indefinitely.
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout_ms))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl FleetStore for PostgresStore {
    async fn migrate(&self) -> FleetResult<()> {
        // PostgreSQL doesn't allow multiple statements in a single prepared
        // statement, so we split the schema and execute each statement
        // separately.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> FleetResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Decode a site command from a row holding two full command snapshots
/// side by side (`RETURNING old.*, cmd.*`). Relies on the schema's column
/// order: id, site_uuid, enq_ts, sent_ts, resent_n, done_ts, state,
/// config_query, config_response.
fn command_at_offset(row: &PgRow, offset: usize) -> Result<SiteCommandRow, sqlx::Error> {
    Ok(SiteCommandRow {
        id: row.try_get(offset)?,
        site_uuid: row.try_get(offset + 1)?,
        enq_ts: row.try_get(offset + 2)?,
        sent_ts: row.try_get(offset + 3)?,
        resent_n: row.try_get(offset + 4)?,
        done_ts: row.try_get(offset + 5)?,
        state: row.try_get(offset + 6)?,
        config_query: row.try_get(offset + 7)?,
        config_response: row.try_get(offset + 8)?,
    })
}

#[async_trait]
impl ArtifactRepo for PostgresStore {
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
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

        // The identity tuple already exists; fetch the canonical row so the
        // caller can report the duplicate without aborting a batch.
        let existing = sqlx::query_as::<_, ArtifactRow>(
            r#"
            SELECT * FROM artifacts
            WHERE platform_name = $1 AND repo_name = $2 AND commit_hash = $3
              AND generation = $4 AND filename = $5 AND hash = $6 AND hash_type = $7
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
            sqlx::query_as::<_, ArtifactRow>("SELECT * FROM artifacts WHERE artifact_uuid = $1")
                .bind(artifact_uuid)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }
}

#[async_trait]
impl ReleaseRepo for PostgresStore {
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

        // The transaction-scoped advisory lock is keyed by a canonical
        // fingerprint of the artifact set, so two concurrent callers
        // proposing the same set serialize here; callers proposing
        // different sets proceed in parallel. The lock is released at
        // commit/rollback.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(advisory_lock_key(&canonical))
            .execute(&mut *tx)
            .await?;

        // Two-sided set equality: a release matches only if every candidate
        // artifact is a member and it has no member outside the candidate
        // set. Bridge rows are unique per (release, artifact), so plain
        // counts are exact.
        let existing: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT ra.release_uuid
            FROM release_artifacts ra
            GROUP BY ra.release_uuid
            HAVING count(*) FILTER (WHERE ra.artifact_uuid = ANY($1)) = $2
               AND count(*) = $2
            "#,
        )
        .bind(&canonical[..])
        .bind(n)
        .fetch_optional(&mut *tx)
        .await?;

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
        sqlx::query("INSERT INTO releases (release_uuid, create_ts, metadata) VALUES ($1, $2, $3)")
            .bind(release_uuid)
            .bind(now)
            .bind(metadata_json)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO release_artifacts (release_uuid, artifact_uuid)
            SELECT $1, unnest($2::uuid[])
            "#,
        )
        .bind(release_uuid)
        .bind(&canonical[..])
        .execute(&mut *tx)
        .await
        .map_err(map_fk_violation)?;

        tx.commit().await?;
        Ok(release_uuid)
    }

    async fn get_release(&self, release_uuid: Uuid) -> FleetResult<Option<Release>> {
        // The nil release is the "no release" sentinel, not a real catalog
        // entry.
        if release_uuid.is_nil() {
            return Ok(None);
        }

        let row = sqlx::query_as::<_, ReleaseRow>(
            "SELECT release_uuid, create_ts, metadata FROM releases WHERE release_uuid = $1",
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
            WHERE ra.release_uuid = $1
            ORDER BY a.repo_name, a.filename
            "#,
        )
        .bind(release_uuid)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(assemble_release(row, artifacts)?))
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
impl CommandRepo for PostgresStore {
    async fn command_submit(
        &self,
        site_uuid: Uuid,
        query: &[u8],
        now: OffsetDateTime,
    ) -> FleetResult<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO site_commands (site_uuid, enq_ts, state, config_query)
            VALUES ($1, $2, 'ENQD', $3)
            RETURNING id
            "#,
        )
        .bind(site_uuid)
        .bind(now)
        .bind(query)
        .fetch_one(&self.pool)
        .await
        .map_err(map_fk_violation)?;
        Ok(id)
    }

    async fn command_search(&self, site_uuid: Uuid, cmd_id: i64) -> FleetResult<SiteCommandRow> {
        sqlx::query_as::<_, SiteCommandRow>(
            "SELECT * FROM site_commands WHERE site_uuid = $1 AND id = $2",
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
        // SKIP LOCKED is what lets two concurrent fetchers make progress:
        // rows another transaction is mid-claim on are passed over instead
        // of blocked on, and the row lock guarantees nobody claims a
        // command twice. The CASE keeps resent_n NULL on a first claim and
        // counts subsequent re-claims.
        let mut claimed = sqlx::query_as::<_, SiteCommandRow>(
            r#"
            WITH pending AS (
                SELECT id, state
                FROM site_commands
                WHERE site_uuid = $1 AND state IN ('ENQD', 'WORK') AND id > $2
                ORDER BY id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE site_commands cmd
            SET state = 'WORK',
                sent_ts = $4,
                resent_n = CASE
                    WHEN pending.state = 'WORK' THEN COALESCE(cmd.resent_n, 0) + 1
                END
            FROM pending
            WHERE cmd.id = pending.id
            RETURNING cmd.*
            "#,
        )
        .bind(site_uuid)
        .bind(min_id)
        .bind(max as i64)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        // UPDATE ... RETURNING makes no ordering promise.
        claimed.sort_by_key(|cmd| cmd.id);
        Ok(claimed)
    }

    async fn command_audit(
        &self,
        site_uuid: Option<Uuid>,
        min_id: i64,
        max: u32,
    ) -> FleetResult<Vec<SiteCommandRow>> {
        let rows = sqlx::query_as::<_, SiteCommandRow>(
            r#"
            SELECT * FROM site_commands
            WHERE ($1::uuid IS NULL OR site_uuid = $1) AND id > $2
            ORDER BY id
            LIMIT $3
            "#,
        )
        .bind(site_uuid)
        .bind(min_id)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn command_audit_window(
        &self,
        site_uuid: Option<Uuid>,
        from: OffsetDateTime,
        until: OffsetDateTime,
        max: u32,
    ) -> FleetResult<Vec<SiteCommandRow>> {
        let rows = sqlx::query_as::<_, SiteCommandRow>(
            r#"
            SELECT * FROM site_commands
            WHERE ($1::uuid IS NULL OR site_uuid = $1)
              AND enq_ts >= $2 AND enq_ts < $3
            ORDER BY id
            LIMIT $4
            "#,
        )
        .bind(site_uuid)
        .bind(from)
        .bind(until)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await?;
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
            WHERE site_uuid = $1 AND state IN ('DONE', 'CNCL')
              AND id NOT IN (
                  SELECT id FROM site_commands
                  WHERE site_uuid = $1 AND state IN ('DONE', 'CNCL')
                  ORDER BY id DESC
                  LIMIT $2
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

impl PostgresStore {
    /// Move a command to a terminal state -- done or canceled -- and return
    /// both the old and new snapshots. The FOR UPDATE subquery pins the row
    /// so the old snapshot and the transition are one atomic unit; the
    /// state guard leaves terminal commands untouched, making both finish
    /// calls idempotent.
    async fn command_finish(
        &self,
        site_uuid: Uuid,
        cmd_id: i64,
        response: Option<&[u8]>,
        now: OffsetDateTime,
    ) -> FleetResult<CommandTransition> {
        let state = if response.is_some() { "DONE" } else { "CNCL" };

        let row = sqlx::query(
            r#"
            UPDATE site_commands cmd
            SET state = $3, done_ts = $4, config_response = $5
            FROM (
                SELECT * FROM site_commands WHERE site_uuid = $1 AND id = $2 FOR UPDATE
            ) old
            WHERE cmd.id = old.id AND old.state IN ('ENQD', 'WORK')
            RETURNING old.*, cmd.*
            "#,
        )
        .bind(site_uuid)
        .bind(cmd_id)
        .bind(state)
        .bind(now)
        .bind(response)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            let old = command_at_offset(&row, 0)?;
            let new = command_at_offset(&row, 9)?;
            return Ok(CommandTransition { old, new });
        }

        // Either the command doesn't exist (for this site) or it is already
        // terminal; a terminal command is returned unchanged.
        let existing = sqlx::query_as::<_, SiteCommandRow>(
            "SELECT * FROM site_commands WHERE site_uuid = $1 AND id = $2",
        )
        .bind(site_uuid)
        .bind(cmd_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| FleetError::NotFound(format!("could not find command ID {cmd_id}")))?;

        let new = existing.clone();
        Ok(CommandTransition { old: existing, new })
    }
}

#[async_trait]
impl ApplianceRepo for PostgresStore {
    async fn create_site(&self, site: &SiteRow) -> FleetResult<()> {
        sqlx::query("INSERT INTO sites (site_uuid, name, created_at) VALUES ($1, $2, $3)")
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
            "INSERT INTO appliances (appliance_uuid, site_uuid, name, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(appliance.appliance_uuid)
        .bind(appliance.site_uuid)
        .bind(&appliance.name)
        .bind(appliance.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_fk_violation)?;
        Ok(())
    }

    async fn get_appliance(&self, appliance_uuid: Uuid) -> FleetResult<Option<ApplianceRow>> {
        let row =
            sqlx::query_as::<_, ApplianceRow>("SELECT * FROM appliances WHERE appliance_uuid = $1")
                .bind(appliance_uuid)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    async fn list_appliances(&self) -> FleetResult<Vec<ApplianceRow>> {
        let rows = sqlx::query_as::<_, ApplianceRow>("SELECT * FROM appliances ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

#[async_trait]
impl ReleaseTrackingRepo for PostgresStore {
    async fn set_target_release(
        &self,
        appliance_uuid: Uuid,
        release_uuid: Uuid,
    ) -> FleetResult<()> {
        sqlx::query(
            r#"
            INSERT INTO appliance_release_targets (appliance_uuid, release_uuid)
            VALUES ($1, $2)
            ON CONFLICT (appliance_uuid) DO UPDATE SET release_uuid = EXCLUDED.release_uuid
            "#,
        )
        .bind(appliance_uuid)
        .bind(release_uuid)
        .execute(&self.pool)
        .await
        .map_err(map_fk_violation)?;
        Ok(())
    }

    async fn get_target_release(&self, appliance_uuid: Uuid) -> FleetResult<Uuid> {
        sqlx::query_scalar(
            "SELECT release_uuid FROM appliance_release_targets WHERE appliance_uuid = $1",
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

        // `success` records whether the appliance landed on its target
        // (NULL when it has none). The conflict guard keeps redundant
        // heartbeats from advancing updated_ts: the row only moves when
        // the success flag or the reported commits actually differ.
        sqlx::query(
            r#"
            INSERT INTO appliance_release_history (
                appliance_uuid, release_uuid, stage, updated_ts, success, repo_commits
            )
            VALUES (
                $1, $2, 'complete', $3,
                (SELECT release_uuid = $2 FROM appliance_release_targets WHERE appliance_uuid = $1),
                $4
            )
            ON CONFLICT (appliance_uuid, release_uuid, stage) DO UPDATE
            SET updated_ts = EXCLUDED.updated_ts,
                success = EXCLUDED.success,
                repo_commits = EXCLUDED.repo_commits
            WHERE appliance_release_history.success IS DISTINCT FROM EXCLUDED.success
               OR appliance_release_history.repo_commits IS DISTINCT FROM EXCLUDED.repo_commits
            "#,
        )
        .bind(appliance_uuid)
        .bind(release_uuid)
        .bind(ts)
        .bind(commits_json)
        .execute(&self.pool)
        .await
        .map_err(map_fk_violation)?;
        Ok(())
    }

    async fn get_current_release(&self, appliance_uuid: Uuid) -> FleetResult<Uuid> {
        sqlx::query_scalar(
            r#"
            SELECT release_uuid FROM appliance_release_history
            WHERE appliance_uuid = $1 AND stage = 'complete'
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
        sqlx::query(
            r#"
            INSERT INTO appliance_release_history (
                appliance_uuid, release_uuid, stage, updated_ts, success, message
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (appliance_uuid, release_uuid, stage) DO UPDATE
            SET updated_ts = EXCLUDED.updated_ts,
                success = EXCLUDED.success,
                message = EXCLUDED.message
            WHERE appliance_release_history.success IS DISTINCT FROM EXCLUDED.success
               OR appliance_release_history.message IS DISTINCT FROM EXCLUDED.message
            "#,
        )
        .bind(appliance_uuid)
        .bind(release_uuid)
        .bind(stage.as_str())
        .bind(ts)
        .bind(success)
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(map_fk_violation)?;
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
        sqlx::query(
            r#"
            INSERT INTO appliance_release_history (
                appliance_uuid, release_uuid, stage, updated_ts, success, message, log_url
            )
            VALUES ($1, $2, 'installed', $3, $4, $5, $6)
            ON CONFLICT (appliance_uuid, release_uuid, stage) DO UPDATE
            SET updated_ts = EXCLUDED.updated_ts,
                success = EXCLUDED.success,
                message = EXCLUDED.message,
                log_url = EXCLUDED.log_url
            WHERE appliance_release_history.success IS DISTINCT FROM EXCLUDED.success
               OR appliance_release_history.message IS DISTINCT FROM EXCLUDED.message
               OR appliance_release_history.log_url IS DISTINCT FROM EXCLUDED.log_url
            "#,
        )
        .bind(appliance_uuid)
        .bind(release_uuid)
        .bind(ts)
        .bind(success)
        .bind(message)
        .bind(log_url)
        .execute(&self.pool)
        .await
        .map_err(map_fk_violation)?;
        Ok(())
    }

    async fn get_release_history(
        &self,
        appliance_uuid: Uuid,
    ) -> FleetResult<Vec<ReleaseHistoryRow>> {
        let rows = sqlx::query_as::<_, ReleaseHistoryRow>(
            r#"
            SELECT * FROM appliance_release_history
            WHERE appliance_uuid = $1
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
impl StatusRepo for PostgresStore {
    async fn release_status_by_appliances(
        &self,
        appliance_uuids: &[Uuid],
    ) -> FleetResult<HashMap<Uuid, ApplianceReleaseStatus>> {
        let (targets, history) = if appliance_uuids.is_empty() {
            let targets =
                sqlx::query_as::<_, ReleaseTargetRow>("SELECT * FROM appliance_release_targets")
                    .fetch_all(&self.pool)
                    .await?;
            let history =
                sqlx::query_as::<_, ReleaseHistoryRow>("SELECT * FROM appliance_release_history")
                    .fetch_all(&self.pool)
                    .await?;
            (targets, history)
        } else {
            let targets = sqlx::query_as::<_, ReleaseTargetRow>(
                "SELECT * FROM appliance_release_targets WHERE appliance_uuid = ANY($1)",
            )
            .bind(appliance_uuids)
            .fetch_all(&self.pool)
            .await?;
            let history = sqlx::query_as::<_, ReleaseHistoryRow>(
                "SELECT * FROM appliance_release_history WHERE appliance_uuid = ANY($1)",
            )
            .bind(appliance_uuids)
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
            let rows: Vec<(Uuid, Option<String>)> = sqlx::query_as(
                "SELECT release_uuid, metadata FROM releases WHERE release_uuid = ANY($1)",
            )
            .bind(&wanted[..])
            .fetch_all(&self.pool)
            .await?;
            for (release_uuid, metadata) in rows {
                let name = decode_kv_map(metadata.as_deref())?.remove("name");
                release_names.insert(release_uuid, name);
            }
        }

        assemble_release_status(targets, history, release_names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_statement_splitting() {
        let statements = postgres_schema_statements(POSTGRES_SCHEMA);
        assert!(!statements.is_empty());
        // Comment-only fragments must not survive the split.
        for statement in &statements {
            assert!(
                statement
                    .lines()
                    .any(|line| !line.trim().is_empty() && !line.trim().starts_with("--")),
                "comment-only statement: {statement}"
            );
        }
        // The nil release seed has to be part of the schema.
        assert!(
            statements
                .iter()
                .any(|s| s.contains("00000000-0000-0000-0000-000000000000"))
        );
    }
}
