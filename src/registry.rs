//! Repository records and the registry that owns them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::Seed;

/// Opaque user identifier handed out by the session collaborator.
pub type UserId = String;

/// A tracked upstream repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryRecord {
    pub id: Uuid,
    pub owner_user_id: UserId,
    pub name: String,
    pub remote_url: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub last_accessed_at: Option<u64>,
}

fn default_branch() -> String {
    "main".to_string()
}

impl RepositoryRecord {
    pub fn new(
        owner_user_id: impl Into<UserId>,
        name: impl Into<String>,
        remote_url: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_user_id: owner_user_id.into(),
            name: name.into(),
            remote_url: remote_url.into(),
            default_branch: default_branch(),
            last_accessed_at: None,
        }
    }

    /// Directory name of the working clone, derived from `name`.
    pub fn local_directory_name(&self) -> String {
        let sanitized = sanitize_segment(&self.name);
        if sanitized.is_empty() {
            self.id.to_string()
        } else {
            sanitized
        }
    }

    /// `<repos_root>/<owner>/<local directory name>`; never built from client input.
    pub fn local_path(&self, repos_root: &Path) -> PathBuf {
        repos_root
            .join(owner_directory_name(&self.owner_user_id))
            .join(self.local_directory_name())
    }
}

/// Directory segment for a user. Distinct user ids always get distinct
/// segments: ids made only of `[A-Za-z0-9_-]` are used as-is, anything
/// else becomes `~` followed by the hex of its bytes.
pub fn owner_directory_name(user_id: &str) -> String {
    if !user_id.is_empty() && user_id.chars().all(is_safe_char) {
        return user_id.to_string();
    }
    let mut encoded = String::with_capacity(1 + user_id.len() * 2);
    encoded.push('~');
    for byte in user_id.bytes() {
        encoded.push_str(&format!("{:02x}", byte));
    }
    encoded
}

fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Replace every character outside `[A-Za-z0-9_-]` with `-`.
pub fn sanitize_segment(raw: &str) -> String {
    raw.chars()
        .map(|c| if is_safe_char(c) { c } else { '-' })
        .collect()
}

/// Commit identity of a user, used to configure fresh clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: Option<String>,
    pub email: Option<String>,
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Read side of the repository store, plus the `lastAccessedAt` bump.
#[async_trait]
pub trait RepositoryRegistry: Send + Sync {
    async fn get(&self, id: &Uuid) -> Option<RepositoryRecord>;

    async fn touch(&self, id: &Uuid, at_millis: u64);

    async fn user_profile(&self, user_id: &str) -> Option<UserProfile>;
}

/// In-process registry used by the server binary and the tests.
#[derive(Default)]
pub struct MemoryRegistry {
    repositories: RwLock<HashMap<Uuid, RepositoryRecord>>,
    users: RwLock<HashMap<UserId, UserProfile>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: &Seed) -> Self {
        let repositories = seed
            .repositories
            .iter()
            .map(|r| (r.id, r.clone()))
            .collect();
        let users = seed
            .users
            .iter()
            .map(|u| {
                (
                    u.id.clone(),
                    UserProfile {
                        name: u.name.clone(),
                        email: u.email.clone(),
                    },
                )
            })
            .collect();
        Self {
            repositories: RwLock::new(repositories),
            users: RwLock::new(users),
        }
    }

    pub async fn insert_repository(&self, record: RepositoryRecord) {
        self.repositories.write().await.insert(record.id, record);
    }

    pub async fn insert_user(&self, user_id: impl Into<UserId>, profile: UserProfile) {
        self.users.write().await.insert(user_id.into(), profile);
    }

}

#[async_trait]
impl RepositoryRegistry for MemoryRegistry {
    async fn get(&self, id: &Uuid) -> Option<RepositoryRecord> {
        self.repositories.read().await.get(id).cloned()
    }

    async fn touch(&self, id: &Uuid, at_millis: u64) {
        if let Some(record) = self.repositories.write().await.get_mut(id) {
            record.last_accessed_at = Some(at_millis);
        }
    }

    async fn user_profile(&self, user_id: &str) -> Option<UserProfile> {
        self.users.read().await.get(user_id).cloned()
    }
}
