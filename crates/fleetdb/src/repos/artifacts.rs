//! Artifact registry repository.

use crate::error::FleetResult;
use crate::models::{ArtifactInsert, ArtifactRow, NewArtifact};
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for immutable, content-identified build artifacts.
#[async_trait]
pub trait ArtifactRepo: Send + Sync {
    /// Register a build artifact, assigning it a fresh UUID.
    ///
    /// Registering an identity that already exists is not fatal: the
    /// canonical existing row comes back marked
    /// [`ArtifactInsert::AlreadyExists`] so a batch caller can report the
    /// duplicate and continue.
    async fn insert_artifact(&self, artifact: &NewArtifact) -> FleetResult<ArtifactInsert>;

    /// Look up an artifact by UUID.
    async fn get_artifact(&self, artifact_uuid: Uuid) -> FleetResult<Option<ArtifactRow>>;
}
