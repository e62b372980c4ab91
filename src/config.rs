//! Runtime configuration shared by every request handler.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Wall-clock limit for terminal commands (seconds).
pub const COMMAND_TIMEOUT_SECS: u64 = 30;

/// How long a resolved bearer token is trusted before re-validation (5 minutes).
pub const SESSION_TTL_SECS: u64 = 300;

/// Interval of the background sweep over the session cache.
pub const SESSION_SWEEP_SECS: u64 = 60;

/// Prefix of the working branch created after a fresh clone.
pub const DEFAULT_BRANCH_PREFIX: &str = "ai-edits-";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding every working clone, laid out as `<root>/<owner>/<repo>`.
    pub repos_root: PathBuf,
    pub command_timeout: Duration,
    pub session_ttl: Duration,
    pub session_sweep_interval: Duration,
    pub branch_prefix: String,
    pub clone_depth: u32,
}

impl Config {
    pub fn new(repos_root: impl Into<PathBuf>) -> Self {
        Self {
            repos_root: repos_root.into(),
            ..Self::default()
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_branch_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.branch_prefix = prefix.into();
        self
    }

    pub fn repos_root(&self) -> &Path {
        &self.repos_root
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repos_root: PathBuf::from("repos"),
            command_timeout: Duration::from_secs(COMMAND_TIMEOUT_SECS),
            session_ttl: Duration::from_secs(SESSION_TTL_SECS),
            session_sweep_interval: Duration::from_secs(SESSION_SWEEP_SECS),
            branch_prefix: DEFAULT_BRANCH_PREFIX.to_string(),
            clone_depth: 1,
        }
    }
}

/// A user entry in the seed file.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedUser {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub tokens: Vec<String>,
}

/// Startup data for the in-memory registry and the static token table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub users: Vec<SeedUser>,
    #[serde(default)]
    pub repositories: Vec<crate::registry::RepositoryRecord>,
}

impl Seed {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub async fn load(path: &Path) -> Result<Self, crate::error::SandboxError> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::from_json(&text).map_err(|e| {
            crate::error::SandboxError::InvalidRequest(format!(
                "seed file {}: {}",
                path.display(),
                e
            ))
        })
    }
}
