//! Object session tracking.
//!
//! Every remote participant that establishes a top-level stream to this
//! node (an individual object, an external object host, or a peer cluster
//! node) gets a session after authenticating. Session listeners are the
//! seam other subsystems use to wire per-session substream handling (the
//! location service listens for location substreams on each new session).

use crate::auth::Authenticator;
use crate::error::ServerError;
use crate::stream::SessionStream;
use async_trait::async_trait;
use meridian_location_system::{EntityId, NodeId, ObjectHostId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// What kind of participant a session belongs to. Determines which payload
/// shapes its location substreams carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// An individual simulated object announcing its own motion.
    Object,
    /// A peer cluster node replicating entity state.
    ClusterNode(NodeId),
    /// An external object-host node.
    ObjectHost(ObjectHostId),
}

/// One authenticated session and its top-level stream.
#[derive(Debug, Clone)]
pub struct ObjectSession {
    /// The remote participant's transport identity.
    pub object: EntityId,
    /// Participant kind.
    pub kind: SessionKind,
    /// The session's top-level stream.
    pub stream: Arc<SessionStream>,
}

/// Observer of session lifecycle.
#[async_trait]
pub trait SessionListener: Send + Sync {
    /// A session authenticated and became usable.
    async fn new_session(&self, session: &ObjectSession);

    /// A session ended; its streams are gone.
    async fn session_closed(&self, _object: EntityId) {}
}

/// Tracks authenticated sessions and notifies session listeners.
pub struct ObjectSessionManager {
    authenticator: Arc<dyn Authenticator>,
    sessions: RwLock<HashMap<EntityId, ObjectSession>>,
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
}

impl ObjectSessionManager {
    /// Creates a manager validating sessions through `authenticator`.
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            authenticator,
            sessions: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Registers a session listener.
    pub async fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.write().await.push(listener);
    }

    /// Authenticates and registers a new session.
    ///
    /// On credential rejection the stream is force-closed and no session
    /// exists; replication never starts for an unauthenticated peer.
    pub async fn new_session(
        &self,
        object: EntityId,
        kind: SessionKind,
        credential: &[u8],
        stream: Arc<SessionStream>,
    ) -> Result<(), ServerError> {
        if !self.authenticator.authenticate(object, credential).await {
            warn!("🚫 Authentication failed for {}", object);
            stream.close(true).await;
            return Err(ServerError::Auth(format!(
                "credential rejected for {object}"
            )));
        }

        let session = ObjectSession {
            object,
            kind,
            stream,
        };
        self.sessions.write().await.insert(object, session.clone());
        info!("🔑 Session established for {} ({:?})", object, kind);

        let listeners = self.listeners.read().await.clone();
        for listener in listeners {
            listener.new_session(&session).await;
        }
        Ok(())
    }

    /// Ends a session, closing its stream and notifying listeners.
    pub async fn end_session(&self, object: EntityId) {
        let removed = self.sessions.write().await.remove(&object);
        let Some(session) = removed else {
            return;
        };
        session.stream.close(false).await;
        info!("🔒 Session ended for {}", object);

        let listeners = self.listeners.read().await.clone();
        for listener in listeners {
            listener.session_closed(object).await;
        }
    }

    /// The top-level stream for an object's session, if present.
    pub async fn stream_for_object(&self, object: EntityId) -> Option<Arc<SessionStream>> {
        self.sessions.read().await.get(&object).map(|s| s.stream.clone())
    }

    /// The session record for `object`, if present.
    pub async fn session(&self, object: EntityId) -> Option<ObjectSession> {
        self.sessions.read().await.get(&object).cloned()
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl std::fmt::Debug for ObjectSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectSessionManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowAllAuthenticator, TicketAuthenticator};
    use crate::stream::{SessionStream, StreamState};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn detached_stream() -> Arc<SessionStream> {
        SessionStream::new(0, 51000, std::sync::Weak::new(), StreamState::Established)
    }

    struct CountingListener {
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl SessionListener for CountingListener {
        async fn new_session(&self, _session: &ObjectSession) {
            self.opened.fetch_add(1, Ordering::SeqCst);
        }

        async fn session_closed(&self, _object: EntityId) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_session_lifecycle_notifies_listeners() {
        let manager = ObjectSessionManager::new(Arc::new(AllowAllAuthenticator));
        let listener = Arc::new(CountingListener {
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        });
        manager.add_listener(listener.clone()).await;

        let object = EntityId::new();
        manager
            .new_session(object, SessionKind::Object, b"", detached_stream())
            .await
            .unwrap();
        assert_eq!(manager.session_count().await, 1);
        assert_eq!(listener.opened.load(Ordering::SeqCst), 1);

        manager.end_session(object).await;
        assert_eq!(manager.session_count().await, 0);
        assert_eq!(listener.closed.load(Ordering::SeqCst), 1);

        // Ending an unknown session is a no-op.
        manager.end_session(object).await;
        assert_eq!(listener.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_credentials_leave_no_session() {
        let auth = Arc::new(TicketAuthenticator::new());
        let manager = ObjectSessionManager::new(auth.clone());

        let object = EntityId::new();
        let result = manager
            .new_session(object, SessionKind::Object, b"bogus", detached_stream())
            .await;

        assert!(matches!(result, Err(ServerError::Auth(_))));
        assert_eq!(manager.session_count().await, 0);
        assert!(manager.stream_for_object(object).await.is_none());
    }
}
