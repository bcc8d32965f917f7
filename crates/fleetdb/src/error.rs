//! Fleet store error types.

use thiserror::Error;
use uuid::Uuid;

/// Format a release-UUID list for display, capping at MAX_DISPLAYED to
/// prevent log/response bloat.
fn format_release_uuids(uuids: &[Uuid]) -> String {
    const MAX_DISPLAYED: usize = 5;
    let shown: Vec<String> = uuids
        .iter()
        .take(MAX_DISPLAYED)
        .map(Uuid::to_string)
        .collect();
    if uuids.len() <= MAX_DISPLAYED {
        shown.join(", ")
    } else {
        format!(
            "{} (and {} more)",
            shown.join(", "),
            uuids.len() - MAX_DISPLAYED
        )
    }
}

/// Fleet store operation errors.
///
/// The first five variants are domain errors callers are expected to branch
/// on; `Database`, `Io`, and `Config` indicate environment or programming
/// failures and abort the operation.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("a release already exists with these artifacts: {release_uuid}")]
    ReleaseExists { release_uuid: Uuid },

    #[error("cannot create a release with no artifacts")]
    EmptyRelease,

    #[error("unknown {relation}: {message}")]
    ForeignKey {
        relation: &'static str,
        message: String,
    },

    #[error("{} release(s) have inconsistent platforms: {}", release_uuids.len(), format_release_uuids(release_uuids))]
    InconsistentReleases { release_uuids: Vec<Uuid> },

    #[error("invalid persisted state: {0}")]
    InvalidState(#[from] roost_core::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Whether this is a domain error the caller can recover from, as
    /// opposed to an environment/invariant failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::AlreadyExists(_)
                | Self::ReleaseExists { .. }
                | Self::EmptyRelease
                | Self::ForeignKey { .. }
                | Self::InconsistentReleases { .. }
        )
    }
}

/// Result type for fleet store operations.
pub type FleetResult<T> = std::result::Result<T, FleetError>;

/// Map a PostgreSQL foreign-key violation to a `ForeignKey` error naming the
/// violated relationship; anything else passes through as `Database`.
///
/// SQLite cannot name the violated constraint, so the SQLite implementation
/// pre-checks referents inside the writing transaction instead.
pub(crate) fn map_fk_violation(err: sqlx::Error) -> FleetError {
    if let sqlx::Error::Database(ref dbe) = err
        && dbe.is_foreign_key_violation()
    {
        let message = dbe.message().to_string();
        let relation = match dbe.constraint() {
            Some(c) if c.contains("appliance_uuid") => "appliance",
            Some(c) if c.contains("release_uuid") => "release",
            Some(c) if c.contains("site_uuid") => "site",
            Some(c) if c.contains("artifact_uuid") => "artifact",
            _ => "reference",
        };
        return FleetError::ForeignKey { relation, message };
    }
    FleetError::Database(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inconsistent_release_format_small() {
        let uuids = vec![Uuid::new_v4(), Uuid::new_v4()];
        let err = FleetError::InconsistentReleases {
            release_uuids: uuids.clone(),
        };
        let msg = err.to_string();
        assert!(msg.contains("2 release(s)"));
        assert!(msg.contains(&uuids[0].to_string()));
        assert!(msg.contains(&uuids[1].to_string()));
    }

    #[test]
    fn test_inconsistent_release_format_large() {
        let uuids: Vec<Uuid> = (0..7).map(|_| Uuid::new_v4()).collect();
        let err = FleetError::InconsistentReleases {
            release_uuids: uuids.clone(),
        };
        let msg = err.to_string();
        assert!(msg.contains("7 release(s)"));
        assert!(msg.contains("and 2 more"));
        assert!(!msg.contains(&uuids[6].to_string()));
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(FleetError::NotFound("x".into()).is_recoverable());
        assert!(FleetError::EmptyRelease.is_recoverable());
        assert!(
            !FleetError::Config("bad".into()).is_recoverable(),
            "config errors are environment failures"
        );
    }
}
