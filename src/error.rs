//! Error types for the sandbox layer.

use crate::ownership::OwnershipRejection;
use crate::path_guard::PathRejection;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Failure of a git subprocess.
#[derive(Error, Debug)]
pub enum GitError {
    #[error("failed to start git: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("git {command} exited with {code}: {stderr}")]
    Failed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("invalid git argument: {0}")]
    InvalidArgument(String),
}

/// Every failure an operation can surface to its caller.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Authentication required")]
    Unauthenticated,

    #[error("Access denied: {0}")]
    AccessDenied(OwnershipRejection),

    #[error("Path rejected: {0}")]
    PathRejected(PathRejection),

    #[error("Repository directory not found; clone the repository first")]
    RepositoryNotCloned,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed to clone repository {repository}: {source}")]
    Materialize {
        repository: Uuid,
        #[source]
        source: GitError,
    },

    #[error("Git error: {0}")]
    Git(#[from] GitError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Session service unavailable: {0}")]
    SessionBackend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Stable machine-readable code for the JSON error body.
    pub fn code(&self) -> &'static str {
        match self {
            SandboxError::Unauthenticated => "unauthenticated",
            SandboxError::AccessDenied(_) => "access_denied",
            SandboxError::PathRejected(_) => "path_rejected",
            SandboxError::RepositoryNotCloned => "repository_not_cloned",
            SandboxError::NotFound(_) => "not_found",
            SandboxError::Materialize { .. } => "clone_failed",
            SandboxError::Git(GitError::InvalidArgument(_)) => "invalid_request",
            SandboxError::Git(_) => "git_failed",
            SandboxError::InvalidRequest(_) => "invalid_request",
            SandboxError::SessionBackend(_) => "session_backend",
            SandboxError::Io(_) => "io_error",
        }
    }
}
