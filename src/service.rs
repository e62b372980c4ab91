//! Per-request entry points. Each one verifies ownership first, then
//! hands the verified clone root to the file, command or git layer.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Result, SandboxError};
use crate::files::{self, DirEntry};
use crate::git::{BranchOutcome, CommitOutcome, GitRepo, LogEntry, PushOutcome, StatusSummary};
use crate::materializer::{Materialized, Materializer};
use crate::ownership::{verify_ownership, OwnedRepository};
use crate::path_guard::relative_display;
use crate::registry::RepositoryRegistry;
use crate::runner::{self, CommandOutput, OutputChunk};

pub struct RepoService {
    config: Arc<Config>,
    registry: Arc<dyn RepositoryRegistry>,
    materializer: Materializer,
}

impl RepoService {
    pub fn new(config: Arc<Config>, registry: Arc<dyn RepositoryRegistry>) -> Self {
        let materializer = Materializer::new(config.clone(), registry.clone());
        Self {
            config,
            registry,
            materializer,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn authorize(&self, repository_id: &Uuid, user_id: &str) -> Result<OwnedRepository> {
        verify_ownership(
            self.registry.as_ref(),
            self.config.repos_root(),
            repository_id,
            user_id,
        )
        .await
        .map_err(SandboxError::AccessDenied)
    }

    /// Ownership plus an existing clone; never clones implicitly.
    async fn cloned_root(&self, repository_id: &Uuid, user_id: &str) -> Result<PathBuf> {
        let owned = self.authorize(repository_id, user_id).await?;
        files::ensure_cloned(owned.root()).await?;
        Ok(owned.root().to_path_buf())
    }

    async fn git_repo(&self, repository_id: &Uuid, user_id: &str) -> Result<GitRepo> {
        Ok(GitRepo::new(self.cloned_root(repository_id, user_id).await?))
    }

    pub async fn ensure_cloned(&self, repository_id: &Uuid, user_id: &str) -> Result<Materialized> {
        let owned = self.authorize(repository_id, user_id).await?;
        self.materializer.ensure_cloned(owned.record()).await
    }

    pub async fn read_file(&self, repository_id: &Uuid, user_id: &str, path: &str) -> Result<String> {
        let owned = self.authorize(repository_id, user_id).await?;
        files::read_text(owned.root(), path).await
    }

    pub async fn read_file_bytes(
        &self,
        repository_id: &Uuid,
        user_id: &str,
        path: &str,
    ) -> Result<Vec<u8>> {
        let owned = self.authorize(repository_id, user_id).await?;
        files::read_bytes(owned.root(), path).await
    }

    pub async fn write_file(
        &self,
        repository_id: &Uuid,
        user_id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<()> {
        let owned = self.authorize(repository_id, user_id).await?;
        files::write_bytes(owned.root(), path, content).await
    }

    pub async fn delete_file(&self, repository_id: &Uuid, user_id: &str, path: &str) -> Result<()> {
        let owned = self.authorize(repository_id, user_id).await?;
        files::delete(owned.root(), path).await
    }

    pub async fn list_directory(
        &self,
        repository_id: &Uuid,
        user_id: &str,
        directory: &str,
    ) -> Result<Vec<DirEntry>> {
        let owned = self.authorize(repository_id, user_id).await?;
        files::list(owned.root(), directory).await
    }

    pub async fn run_command(
        &self,
        repository_id: &Uuid,
        user_id: &str,
        command_line: &str,
    ) -> Result<CommandOutput> {
        self.run_command_streaming(repository_id, user_id, command_line, None)
            .await
    }

    pub async fn run_command_streaming(
        &self,
        repository_id: &Uuid,
        user_id: &str,
        command_line: &str,
        sink: Option<&mpsc::UnboundedSender<OutputChunk>>,
    ) -> Result<CommandOutput> {
        let root = self.cloned_root(repository_id, user_id).await?;
        Ok(runner::run_streaming(&root, command_line, self.config.command_timeout, sink).await)
    }

    pub async fn git_status(&self, repository_id: &Uuid, user_id: &str) -> Result<StatusSummary> {
        Ok(self.git_repo(repository_id, user_id).await?.status().await?)
    }

    pub async fn create_branch(
        &self,
        repository_id: &Uuid,
        user_id: &str,
        name: &str,
        checkout: bool,
    ) -> Result<BranchOutcome> {
        let repo = self.git_repo(repository_id, user_id).await?;
        Ok(repo.create_branch(name, checkout).await?)
    }

    pub async fn switch_branch(&self, repository_id: &Uuid, user_id: &str, name: &str) -> Result<()> {
        let repo = self.git_repo(repository_id, user_id).await?;
        Ok(repo.switch_branch(name).await?)
    }

    /// Commit `paths` (validated as repository paths) or everything.
    pub async fn commit(
        &self,
        repository_id: &Uuid,
        user_id: &str,
        message: &str,
        paths: &[String],
    ) -> Result<CommitOutcome> {
        let repo = self.git_repo(repository_id, user_id).await?;
        let pathspecs = paths
            .iter()
            .map(|p| pathspec(&repo, p))
            .collect::<Result<Vec<_>>>()?;
        Ok(repo.commit(message, &pathspecs).await?)
    }

    pub async fn push(
        &self,
        repository_id: &Uuid,
        user_id: &str,
        remote: Option<&str>,
        branch: Option<&str>,
        set_upstream: bool,
    ) -> Result<PushOutcome> {
        let repo = self.git_repo(repository_id, user_id).await?;
        Ok(repo.push(remote, branch, set_upstream).await?)
    }

    pub async fn log(&self, repository_id: &Uuid, user_id: &str, limit: usize) -> Result<Vec<LogEntry>> {
        Ok(self.git_repo(repository_id, user_id).await?.log(limit).await?)
    }

    pub async fn diff(
        &self,
        repository_id: &Uuid,
        user_id: &str,
        path: Option<&str>,
        staged: bool,
    ) -> Result<String> {
        let repo = self.git_repo(repository_id, user_id).await?;
        let spec = match path {
            Some(p) => Some(pathspec(&repo, p)?),
            None => None,
        };
        Ok(repo.diff(spec.as_deref(), staged).await?)
    }

    /// Irreversible: drops the last commit and every uncommitted change.
    pub async fn rollback(&self, repository_id: &Uuid, user_id: &str) -> Result<String> {
        Ok(self.git_repo(repository_id, user_id).await?.rollback().await?)
    }
}

/// A client path checked by the path guard, in the form git expects.
fn pathspec(repo: &GitRepo, raw: &str) -> Result<String> {
    let resolved = files::resolve(repo.root(), raw)?;
    let relative = relative_display(repo.root(), &resolved);
    Ok(if relative.is_empty() { ".".to_string() } else { relative })
}
