//! # Session Registry
//!
//! Process-wide map of live sessions keyed by connection id.
//!
//! ## Key Responsibilities:
//! - **Admission**: enforce `max_concurrent_sessions` and unique ids
//! - **Visibility**: a session is inserted only after its tasks exist and is
//!   removed by its own teardown, before the transport closes
//! - **Totals**: counters of closed sessions are folded into running totals so
//!   the metrics endpoint survives session churn
//!
//! Every operation takes the lock once; nothing is held across an await.

use crate::session::live::{Session, SessionSnapshot};
use crate::session::stats::StatsSnapshot;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryError {
    Full { limit: usize },
    Duplicate(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Full { limit } => {
                write!(f, "Maximum concurrent sessions ({}) reached", limit)
            }
            RegistryError::Duplicate(id) => write!(f, "Session {} already exists", id),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Aggregated counters for the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryTotals {
    pub active_sessions: usize,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub max_sessions: usize,
    pub counters: StatsSnapshot,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    max_sessions: usize,
    opened: AtomicU64,
    closed: AtomicU64,
    retired: Mutex<StatsSnapshot>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            opened: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            retired: Mutex::new(StatsSnapshot::default()),
        }
    }

    /// Cheap pre-check before a session spawns its tasks. `insert` re-checks.
    pub fn check_admission(&self, id: &str) -> Result<(), RegistryError> {
        let sessions = self.sessions.read();
        Self::admit(&sessions, id, self.max_sessions)
    }

    fn admit(
        sessions: &HashMap<String, Arc<Session>>,
        id: &str,
        max_sessions: usize,
    ) -> Result<(), RegistryError> {
        if sessions.contains_key(id) {
            return Err(RegistryError::Duplicate(id.to_string()));
        }
        if sessions.len() >= max_sessions {
            return Err(RegistryError::Full {
                limit: max_sessions,
            });
        }
        Ok(())
    }

    pub fn insert(&self, session: Arc<Session>) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write();
        Self::admit(&sessions, session.id(), self.max_sessions)?;
        sessions.insert(session.id().to_string(), session);
        self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().remove(id);
        if let Some(session) = &removed {
            self.retired.lock().accumulate(&session.stats());
            self.closed.fetch_add(1, Ordering::Relaxed);
            debug!(session_id = id, "Session removed from registry");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> = self.all().iter().map(|s| s.snapshot()).collect();
        snapshots.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        snapshots
    }

    pub fn totals(&self) -> RegistryTotals {
        let live = self.all();
        let mut counters = self.retired.lock().clone();
        for session in &live {
            counters.accumulate(&session.stats());
        }

        RegistryTotals {
            active_sessions: live.len(),
            sessions_opened: self.opened.load(Ordering::Relaxed),
            sessions_closed: self.closed.load(Ordering::Relaxed),
            max_sessions: self.max_sessions,
            counters,
        }
    }

    /// Ask every live session to drain, then wait (bounded) until all are closed.
    pub async fn close_all(&self, timeout: std::time::Duration) {
        let sessions = self.all();
        for session in &sessions {
            session.peer_disconnected();
        }
        let all_closed = futures_util::future::join_all(sessions.iter().map(|s| s.wait_closed()));
        if tokio::time::timeout(timeout, all_closed).await.is_err() {
            tracing::warn!(remaining = self.len(), "Some sessions did not close before shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::testing::{RecordingSink, ScriptedLoader, Step};
    use crate::transcription::EnginePool;
    use std::time::Duration;

    async fn open(registry: &Arc<SessionRegistry>, pool: &Arc<EnginePool>, id: &str) -> Result<Arc<Session>, RegistryError> {
        Session::open(
            id.to_string(),
            &AppConfig::default(),
            Arc::clone(pool),
            Arc::clone(registry),
            Arc::new(RecordingSink::default()),
        )
    }

    async fn pool() -> Arc<EnginePool> {
        let pool = EnginePool::new(Arc::new(ScriptedLoader::new(vec![Step::text("hi")])), 1);
        pool.load().await.unwrap();
        Arc::new(pool)
    }

    #[tokio::test]
    async fn test_duplicate_ids_rejected() {
        let registry = Arc::new(SessionRegistry::new(4));
        let pool = pool().await;

        let session = open(&registry, &pool, "dup").await.unwrap();
        assert_eq!(
            open(&registry, &pool, "dup").await.err(),
            Some(RegistryError::Duplicate("dup".to_string()))
        );
        assert!(registry.get("dup").is_some());

        registry.close_all(Duration::from_secs(2)).await;
        assert!(registry.is_empty());
        assert_eq!(session.state(), crate::session::SessionState::Closed);
    }

    #[tokio::test]
    async fn test_totals_survive_session_close() {
        let registry = Arc::new(SessionRegistry::new(4));
        let pool = pool().await;

        let session = open(&registry, &pool, "t1").await.unwrap();
        session.ingest_audio(&[0u8; 1000]);
        assert_eq!(registry.totals().counters.bytes_received, 1000);

        registry.close_all(Duration::from_secs(2)).await;
        let totals = registry.totals();
        assert_eq!(totals.active_sessions, 0);
        assert_eq!(totals.sessions_opened, 1);
        assert_eq!(totals.sessions_closed, 1);
        assert_eq!(totals.counters.bytes_received, 1000);
    }
}
