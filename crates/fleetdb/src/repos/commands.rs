//! Site command queue repository.

use crate::error::FleetResult;
use crate::models::{CommandTransition, SiteCommandRow};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for the persisted per-site command queue.
///
/// Commands move `ENQD -> WORK -> DONE | CNCL`; a `WORK` command may be
/// claimed again after a poller loses its lease, incrementing the resend
/// counter. Every state change is a single atomic operation against the
/// store; there is no in-memory queue state.
#[async_trait]
pub trait CommandRepo: Send + Sync {
    /// Enqueue a command for a site, returning its id.
    ///
    /// Ids are strictly increasing in submission order. An unknown site is
    /// a `FleetError::ForeignKey` naming `site`.
    async fn command_submit(
        &self,
        site_uuid: Uuid,
        query: &[u8],
        now: OffsetDateTime,
    ) -> FleetResult<i64>;

    /// Point lookup of one command. NotFound covers both a nonexistent id
    /// and an id belonging to a different site.
    async fn command_search(&self, site_uuid: Uuid, cmd_id: i64) -> FleetResult<SiteCommandRow>;

    /// Atomically claim up to `max` pending commands for a site with
    /// id > `min_id`, ordered by id.
    ///
    /// Each claimed command transitions to `WORK` with its sent timestamp
    /// refreshed; the resend counter stays unset on a first claim and
    /// increments on each re-claim. Concurrent fetchers never block on nor
    /// double-claim each other's in-flight rows: a row mid-claim by one
    /// caller is skipped by the other.
    async fn command_fetch(
        &self,
        site_uuid: Uuid,
        min_id: i64,
        max: u32,
        now: OffsetDateTime,
    ) -> FleetResult<Vec<SiteCommandRow>>;

    /// Reporting query over a site's queue regardless of state, id
    /// ascending.
    ///
    /// A `None` site selector spans all sites. Care must be used to be sure
    /// that public consumers are not allowed to pass `None`, which would
    /// expose every site's queue.
    async fn command_audit(
        &self,
        site_uuid: Option<Uuid>,
        min_id: i64,
        max: u32,
    ) -> FleetResult<Vec<SiteCommandRow>>;

    /// Like [`command_audit`](Self::command_audit), restricted to commands
    /// enqueued in `[from, until)`.
    async fn command_audit_window(
        &self,
        site_uuid: Option<Uuid>,
        from: OffsetDateTime,
        until: OffsetDateTime,
        max: u32,
    ) -> FleetResult<Vec<SiteCommandRow>>;

    /// Cancel a pending command, returning the pre- and post-transition
    /// snapshots.
    ///
    /// Canceling an already-terminal command is an idempotent no-op: the
    /// unchanged snapshot comes back as both old and new. Cross-site ids
    /// are NotFound.
    async fn command_cancel(
        &self,
        site_uuid: Uuid,
        cmd_id: i64,
        now: OffsetDateTime,
    ) -> FleetResult<CommandTransition>;

    /// Complete a claimed command with its response, returning the pre- and
    /// post-transition snapshots. Terminal commands are left untouched,
    /// like [`command_cancel`](Self::command_cancel).
    async fn command_complete(
        &self,
        site_uuid: Uuid,
        cmd_id: i64,
        response: &[u8],
        now: OffsetDateTime,
    ) -> FleetResult<CommandTransition>;

    /// Retention trim: delete all but the `keep` newest terminal
    /// (`DONE`/`CNCL`) commands for a site. Pending commands are never
    /// deleted. Returns the number removed.
    async fn command_delete(&self, site_uuid: Uuid, keep: u32) -> FleetResult<u64>;
}
