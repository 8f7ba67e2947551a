use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;

use super::session::{Session, SessionSettings};
use crate::services::results::ResultSink;
use crate::services::store::SnapshotStore;

/// Live sessions by id. Sessions are created on first lookup and drop out
/// of the map on their own once they finish.
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Arc<Session>>>,
    settings: SessionSettings,
    store: Arc<dyn SnapshotStore>,
    results: Arc<dyn ResultSink>,
}

impl SessionRegistry {
    pub fn new(
        settings: SessionSettings,
        store: Arc<dyn SnapshotStore>,
        results: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            settings,
            store,
            results,
        }
    }

    /// Returns the live session for `id`, creating and starting it if there
    /// is none. Concurrent callers for the same id get the same instance.
    pub fn get_or_create(&self, id: &str) -> Arc<Session> {
        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let session = Arc::new(Session::new(
                    id,
                    self.settings.clone(),
                    Arc::clone(&self.store),
                    Arc::clone(&self.results),
                ));
                entry.insert(Arc::clone(&session));

                let sessions = Arc::clone(&self.sessions);
                let finished = Arc::downgrade(&session);
                session.start(move || {
                    let Some(finished) = finished.upgrade() else {
                        return;
                    };
                    // A replacement may already sit under the same id.
                    let removed = sessions
                        .remove_if(finished.id(), |_, current| Arc::ptr_eq(current, &finished))
                        .is_some();
                    if removed {
                        tracing::debug!(session_id = %finished.id(), "session removed from registry");
                    }
                });

                tracing::info!(session_id = %id, "session created");
                session
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Stops and forgets the session. Unknown ids are ignored.
    pub fn remove(&self, id: &str) {
        if let Some((_, session)) = self.sessions.remove(id) {
            session.stop();
            tracing::info!(session_id = %id, "session removed");
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Stops every session and waits, up to `deadline`, for their tick
    /// loops to exit. Client sockets are not waited on.
    pub async fn shutdown_all(&self, deadline: Duration) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.sessions.clear();

        if sessions.is_empty() {
            return;
        }

        tracing::info!(count = sessions.len(), "stopping sessions");
        for session in &sessions {
            session.stop();
        }

        let exited = tokio::time::timeout(deadline, join_all(sessions.iter().map(|s| s.stopped()))).await;
        if exited.is_err() {
            tracing::warn!(?deadline, "tick loops still running at shutdown deadline");
        }
    }
}
