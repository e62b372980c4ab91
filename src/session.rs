//! Bearer-token resolution and the short-lived cache in front of it.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

use crate::config::Seed;
use crate::error::SandboxError;
use crate::registry::UserId;

/// Turns a bearer token into a user id. `Ok(None)` means unauthenticated.
#[async_trait]
pub trait SessionResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<Option<UserId>, SandboxError>;
}

/// Fixed token table, loaded from the seed file.
#[derive(Debug, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, UserId>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: &Seed) -> Self {
        let tokens = seed
            .users
            .iter()
            .flat_map(|u| u.tokens.iter().map(move |t| (t.clone(), u.id.clone())))
            .collect();
        Self { tokens }
    }

    pub fn with_token(mut self, token: impl Into<String>, user: impl Into<UserId>) -> Self {
        self.tokens.insert(token.into(), user.into());
        self
    }
}

#[async_trait]
impl SessionResolver for StaticTokens {
    async fn resolve(&self, token: &str) -> Result<Option<UserId>, SandboxError> {
        Ok(self.tokens.get(token).cloned())
    }
}

#[derive(Deserialize)]
struct IntrospectionResponse {
    user_id: UserId,
}

/// Asks an external session service who owns a token.
pub struct RemoteSessionResolver {
    client: reqwest::Client,
    url: String,
}

impl RemoteSessionResolver {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl SessionResolver for RemoteSessionResolver {
    async fn resolve(&self, token: &str) -> Result<Option<UserId>, SandboxError> {
        let response = self
            .client
            .get(&self.url)
            .bearer_auth(token)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| SandboxError::SessionBackend(e.to_string()))?;

        match response.status() {
            s if s.is_success() => {
                let body: IntrospectionResponse = response
                    .json()
                    .await
                    .map_err(|e| SandboxError::SessionBackend(e.to_string()))?;
                Ok(Some(body.user_id))
            }
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => Ok(None),
            other => Err(SandboxError::SessionBackend(format!(
                "session service answered {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedSession {
    user: Option<UserId>,
    expires_at: Instant,
}

/// Token → (user or invalid, expiry). Expired entries are ignored on
/// lookup and removed by [`SessionCache::sweep_expired`].
#[derive(Debug)]
pub struct SessionCache {
    entries: RwLock<HashMap<String, CachedSession>>,
    ttl: Duration,
}

impl SessionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// `Some(result)` on a live hit.
    pub async fn get(&self, token: &str) -> Option<Option<UserId>> {
        let entries = self.entries.read().await;
        let cached = entries.get(token)?;
        if cached.expires_at <= Instant::now() {
            return None;
        }
        Some(cached.user.clone())
    }

    pub async fn insert(&self, token: &str, user: Option<UserId>) {
        let cached = CachedSession {
            user,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.write().await.insert(token.to_string(), cached);
    }

    /// Drop expired entries; returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, cached| cached.expires_at > now);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Periodically sweep until the cache is dropped elsewhere.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.sweep_expired().await;
                if removed > 0 {
                    info!(removed, "Swept expired sessions");
                }
            }
        })
    }
}

/// A resolver with a [`SessionCache`] in front of it.
pub struct CachedResolver {
    inner: Arc<dyn SessionResolver>,
    cache: Arc<SessionCache>,
}

impl CachedResolver {
    pub fn new(inner: Arc<dyn SessionResolver>, cache: Arc<SessionCache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl SessionResolver for CachedResolver {
    async fn resolve(&self, token: &str) -> Result<Option<UserId>, SandboxError> {
        if let Some(hit) = self.cache.get(token).await {
            debug!("Session cache hit");
            return Ok(hit);
        }
        match self.inner.resolve(token).await {
            Ok(user) => {
                self.cache.insert(token, user.clone()).await;
                Ok(user)
            }
            Err(e) => {
                warn!(error = %e, "Session resolution failed");
                Err(e)
            }
        }
    }
}
