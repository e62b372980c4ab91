//! Shared application state.

use std::sync::Arc;

use crate::config::Config;
use crate::registry::RepositoryRegistry;
use crate::service::RepoService;
use crate::session::{CachedResolver, SessionCache, SessionResolver};

/// State handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RepoService>,
    pub sessions: Arc<dyn SessionResolver>,
    pub session_cache: Arc<SessionCache>,
}

impl AppState {
    /// Wire the service and put a session cache in front of `resolver`.
    pub fn new(
        config: Config,
        registry: Arc<dyn RepositoryRegistry>,
        resolver: Arc<dyn SessionResolver>,
    ) -> Self {
        let config = Arc::new(config);
        let session_cache = Arc::new(SessionCache::new(config.session_ttl));
        let sessions = Arc::new(CachedResolver::new(resolver, session_cache.clone()));
        Self {
            service: Arc::new(RepoService::new(config, registry)),
            sessions,
            session_cache,
        }
    }

    pub fn config(&self) -> &Config {
        self.service.config()
    }
}
