//! Verifies that a repository id belongs to the calling user.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

use crate::registry::{RepositoryRecord, RepositoryRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipRejection {
    NotFound,
    NotOwned,
}

impl fmt::Display for OwnershipRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnershipRejection::NotFound => write!(f, "repository not found"),
            OwnershipRejection::NotOwned => write!(f, "repository belongs to another user"),
        }
    }
}

/// A repository record the caller has been confirmed to own.
#[derive(Debug, Clone)]
pub struct OwnedRepository {
    record: RepositoryRecord,
    root: PathBuf,
}

impl OwnedRepository {
    pub fn record(&self) -> &RepositoryRecord {
        &self.record
    }

    /// On-disk location of the working clone.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Look up `repository_id` and confirm `user_id` owns it.
///
/// Called on every operation; no earlier result is reused.
pub async fn verify_ownership(
    registry: &dyn RepositoryRegistry,
    repos_root: &Path,
    repository_id: &Uuid,
    user_id: &str,
) -> Result<OwnedRepository, OwnershipRejection> {
    let Some(record) = registry.get(repository_id).await else {
        warn!(target: "security", repository = %repository_id, user = user_id, "repository not found");
        return Err(OwnershipRejection::NotFound);
    };

    if record.owner_user_id != user_id {
        warn!(
            target: "security",
            repository = %repository_id,
            user = user_id,
            "access to repository owned by another user"
        );
        return Err(OwnershipRejection::NotOwned);
    }

    let root = record.local_path(repos_root);
    Ok(OwnedRepository { record, root })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;

    async fn registry_with(record: RepositoryRecord) -> MemoryRegistry {
        let registry = MemoryRegistry::new();
        registry.insert_repository(record).await;
        registry
    }

    #[tokio::test]
    async fn owner_gets_record_and_root() {
        let record = RepositoryRecord::new("alice", "widgets", "https://example.com/w.git");
        let id = record.id;
        let registry = registry_with(record).await;

        let owned = verify_ownership(&registry, Path::new("/srv/repos"), &id, "alice")
            .await
            .unwrap();
        assert_eq!(owned.record().id, id);
        assert_eq!(owned.root(), Path::new("/srv/repos/alice/widgets"));
    }

    #[tokio::test]
    async fn other_user_is_rejected() {
        let record = RepositoryRecord::new("alice", "widgets", "https://example.com/w.git");
        let id = record.id;
        let registry = registry_with(record).await;

        let err = verify_ownership(&registry, Path::new("/srv/repos"), &id, "bob")
            .await
            .unwrap_err();
        assert_eq!(err, OwnershipRejection::NotOwned);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let registry = MemoryRegistry::new();
        let err = verify_ownership(&registry, Path::new("/srv/repos"), &Uuid::new_v4(), "alice")
            .await
            .unwrap_err();
        assert_eq!(err, OwnershipRejection::NotFound);
    }
}
