//! Makes sure a working clone exists on disk for a repository record.

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Result, SandboxError};
use crate::git::GitRepo;
use crate::registry::{now_millis, RepositoryRecord, RepositoryRegistry};

/// Result of [`Materializer::ensure_cloned`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Materialized {
    pub path: PathBuf,
    /// Working branch created by a fresh clone.
    pub branch_created: Option<String>,
    /// True when this call performed the clone.
    pub cloned: bool,
}

type CloneLocks = Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>;

/// Clone-if-absent, re-validate-if-present. At most one materialization
/// runs per clone directory at a time, even when several records map to it.
pub struct Materializer {
    config: Arc<Config>,
    registry: Arc<dyn RepositoryRegistry>,
    locks: CloneLocks,
}

impl Materializer {
    pub fn new(config: Arc<Config>, registry: Arc<dyn RepositoryRegistry>) -> Self {
        Self {
            config,
            registry,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn ensure_cloned(&self, record: &RepositoryRecord) -> Result<Materialized> {
        let path = record.local_path(self.config.repos_root());
        let lock = self.lock_for(&path).await;
        let result = {
            let _guard = lock.lock().await;
            self.materialize(record, path.clone()).await
        };
        self.release(&path, lock).await;
        result
    }

    async fn materialize(&self, record: &RepositoryRecord, path: PathBuf) -> Result<Materialized> {
        let repo = GitRepo::new(&path);

        if tokio::fs::try_exists(&path).await? {
            match repo.probe().await {
                Ok(()) => {
                    self.registry.touch(&record.id, now_millis()).await;
                    return Ok(Materialized {
                        path,
                        branch_created: None,
                        cloned: false,
                    });
                }
                Err(e) => {
                    warn!(
                        repository = %record.id,
                        path = %path.display(),
                        error = %e,
                        "Existing clone failed validation; recloning"
                    );
                    remove_quietly(&path).await;
                }
            }
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!(
            repository = %record.id,
            remote = %record.remote_url,
            branch = %record.default_branch,
            "Cloning repository"
        );
        let repo = match GitRepo::clone_into(
            &record.remote_url,
            &record.default_branch,
            self.config.clone_depth,
            &path,
        )
        .await
        {
            Ok(repo) => repo,
            Err(source) => {
                remove_quietly(&path).await;
                return Err(SandboxError::Materialize {
                    repository: record.id,
                    source,
                });
            }
        };

        if let Some(profile) = self.registry.user_profile(&record.owner_user_id).await {
            if let Err(e) = repo
                .set_identity(profile.name.as_deref(), profile.email.as_deref())
                .await
            {
                warn!(repository = %record.id, error = %e, "Could not configure commit identity");
            }
        }

        let branch = working_branch_name(&self.config.branch_prefix, now_millis());
        let branch_created = match repo.create_branch(&branch, true).await {
            Ok(_) => Some(branch),
            Err(e) => {
                warn!(repository = %record.id, error = %e, "Could not create working branch");
                None
            }
        };

        self.registry.touch(&record.id, now_millis()).await;
        info!(repository = %record.id, path = %path.display(), branch = ?branch_created, "Clone ready");

        Ok(Materialized {
            path,
            branch_created,
            cloned: true,
        })
    }

    async fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the map entry once nobody else holds or waits on it.
    async fn release(&self, path: &Path, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        if Arc::strong_count(&lock) == 2 {
            locks.remove(path);
        }
    }

    #[cfg(test)]
    async fn lock_count(&self) -> usize {
        self.locks.lock().await.len()
    }
}

/// Deterministic working-branch name for a clone made at `millis`.
pub fn working_branch_name(prefix: &str, millis: u64) -> String {
    format!("{}{}", prefix, millis)
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Could not remove clone directory");
        }
    }
}
