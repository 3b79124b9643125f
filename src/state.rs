//! # Application State
//!
//! Shared by every HTTP handler and WebSocket actor through `web::Data`.
//!
//! Nothing here is behind a lock at this level: the config is immutable after
//! startup, and the engine pool and session registry synchronize internally.

use crate::config::AppConfig;
use crate::session::SessionRegistry;
use crate::transcription::EnginePool;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: Arc<EnginePool>,
    pub registry: Arc<SessionRegistry>,
    /// When the server started
    pub start_time: Instant,
}

impl AppState {
    /// Build the state; the registry limit comes from `performance.max_concurrent_sessions`.
    pub fn new(config: AppConfig, engine: Arc<EnginePool>) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            config.performance.max_concurrent_sessions,
        ));
        Self {
            config: Arc::new(config),
            engine,
            registry,
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Active sessions as a fraction of the configured limit.
    pub fn session_usage(&self) -> f64 {
        let max = self.config.performance.max_concurrent_sessions;
        if max == 0 {
            return 0.0;
        }
        self.registry.len() as f64 / max as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedLoader, Step};

    #[test]
    fn test_registry_uses_configured_limit() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 3;
        let loader = Arc::new(ScriptedLoader::new(vec![Step::text("x")]));
        let state = AppState::new(config, Arc::new(EnginePool::new(loader, 1)));

        assert_eq!(state.registry.totals().max_sessions, 3);
        assert_eq!(state.session_usage(), 0.0);
    }
}
