//! Space server wiring.
//!
//! Assembles the location core and the transport into one node: the
//! location service and update policy, the session stream layer and
//! messaging manager, session tracking with authentication, the forwarder
//! that turns local churn into outbound update batches, and the inbound
//! bridges that turn received batches back into replica state.

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::messaging::{MessageSink, MessagingManager};
use crate::session::{ObjectSession, ObjectSessionManager, SessionKind, SessionListener};
use crate::stream::{
    lock, InMemoryNetwork, LinkConnector, SessionStream, SessionStreamLayer, STREAM_OK,
};
use async_trait::async_trait;
use meridian_location_system::{
    next_seqno, AggregateBounds, BulkLocationUpdate, EntityId,
    LocationListener, LocationService, LocationUpdateEntry, LocationUpdatePolicy,
    LocationUpdateRequest, MaxDistExtrapolator, NodeId, Provenance, ProximityResults, RemoteId,
    SimTime, TimedMotionQuaternion, TimedMotionVector, NULL_NODE_ID, PORT_LOCATION,
    PORT_PROXIMITY,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ============================================================================
// Outbound: local churn → subscribed remotes
// ============================================================================

/// Listener that serializes local location churn into update batches and
/// routes them to every subscribed remote.
pub struct UpdateForwarder {
    policy: Arc<LocationUpdatePolicy>,
    messaging: Arc<MessagingManager>,
    routes: RwLock<HashMap<RemoteId, EntityId>>,
    node_entity: EntityId,
}

impl UpdateForwarder {
    fn new(
        policy: Arc<LocationUpdatePolicy>,
        messaging: Arc<MessagingManager>,
        node_entity: EntityId,
    ) -> Self {
        Self {
            policy,
            messaging,
            routes: RwLock::new(HashMap::new()),
            node_entity,
        }
    }

    /// Maps a remote identity to the transport entity its updates are sent
    /// to. Cluster nodes derive their endpoint automatically; object hosts
    /// need an explicit route.
    pub async fn add_route(&self, remote: RemoteId, endpoint: EntityId) {
        self.routes.write().await.insert(remote, endpoint);
    }

    async fn endpoint_for(&self, remote: &RemoteId) -> Option<EntityId> {
        if let Some(endpoint) = self.routes.read().await.get(remote) {
            return Some(*endpoint);
        }
        match remote {
            RemoteId::ClusterNode(node) => Some(EntityId::for_node(*node)),
            RemoteId::Object(object) => Some(*object),
            RemoteId::ObjectHost(_) => None,
        }
    }
}

#[async_trait]
impl LocationListener for UpdateForwarder {
    async fn local_location_updated(
        &self,
        id: EntityId,
        _aggregate: bool,
        new_value: TimedMotionVector,
    ) {
        for remote in self.policy.subscribers_of(id).await {
            let seqno = match self.policy.seqno(remote, id).await {
                Some(handle) => Some(next_seqno(&handle)),
                None => None,
            };
            let batch = BulkLocationUpdate::single(LocationUpdateEntry {
                object: id,
                seqno,
                location: new_value,
            });
            let bytes = match batch.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("🔴 Failed to encode update batch for {}: {}", id, e);
                    continue;
                }
            };

            let Some(endpoint) = self.endpoint_for(&remote).await else {
                warn!("🗺️ No route to subscriber {}, dropping update", remote);
                continue;
            };
            if !self
                .messaging
                .send_on_port(self.node_entity, endpoint, PORT_LOCATION, bytes)
                .await
            {
                warn!("📪 Update for {} rejected: node presence offline", remote);
            }
        }
    }
}

// ============================================================================
// Inbound: peer batches → replica state
// ============================================================================

/// Sink applying inter-node update batches arriving on the location port.
struct BulkUpdateSink {
    location: Arc<LocationService>,
}

impl BulkUpdateSink {
    async fn apply(&self, node: NodeId, batch: &BulkLocationUpdate) {
        self.location
            .notify_location_update_from_server(node, batch)
            .await;
        for entry in &batch.update {
            if let Err(e) = self
                .location
                .apply_replica_update(entry.object, entry.location)
                .await
            {
                warn!("🔴 Dropping replica update for {}: {}", entry.object, e);
            }
        }
    }
}

#[async_trait]
impl MessageSink for BulkUpdateSink {
    async fn handle_message(&self, src: EntityId, _dst: EntityId, payload: &[u8]) -> bool {
        // Decode success doubles as the message-complete signal; a partial
        // accumulation simply fails to parse and we keep reading.
        let Ok(batch) = BulkLocationUpdate::decode(payload) else {
            return false;
        };
        let node = src.as_node().unwrap_or(NULL_NODE_ID);
        self.apply(node, &batch).await;
        true
    }
}

// ============================================================================
// Inbound: object sessions → local state
// ============================================================================

/// Session listener wiring a location substream handler onto every new
/// session.
struct LocationSessionBridge {
    location: Arc<LocationService>,
}

impl LocationSessionBridge {
    async fn apply_object_announcement(
        location: &Arc<LocationService>,
        object: EntityId,
        request: LocationUpdateRequest,
    ) {
        match location.provenance(object).await {
            Some(Provenance::Local) => {
                if let Err(e) = location.update_local_location(object, request.location).await {
                    warn!("🔴 Dropping announcement from {}: {}", object, e);
                }
            }
            Some(Provenance::Replica) => {
                warn!("🔴 Ignoring announcement for replica record {}", object);
            }
            None => {
                // First announcement: the connecting object becomes locally
                // present with defaults for the fields it has not sent yet.
                if let Err(e) = location
                    .add_local_object(
                        object,
                        false,
                        request.location,
                        TimedMotionQuaternion::default(),
                        AggregateBounds::default(),
                        String::new(),
                        String::new(),
                        String::new(),
                    )
                    .await
                {
                    warn!("🔴 Could not admit {}: {}", object, e);
                }
            }
        }
    }

    fn attach_location_reader(
        location: Arc<LocationService>,
        session: ObjectSession,
        substream: Arc<SessionStream>,
    ) {
        let accumulated: Arc<StdMutex<Vec<u8>>> = Arc::new(StdMutex::new(Vec::new()));
        let consumed = Arc::new(AtomicBool::new(false));
        let weak_stream = Arc::downgrade(&substream);

        substream.register_read_callback(Some(Box::new(move |bytes| {
            lock(&accumulated).extend_from_slice(bytes);
            let payload = lock(&accumulated).clone();
            let location = location.clone();
            let session = session.clone();
            let consumed = consumed.clone();
            let weak_stream = weak_stream.clone();

            tokio::spawn(async move {
                if consumed.load(Ordering::Acquire) {
                    return;
                }
                let complete = match session.kind {
                    SessionKind::Object => match LocationUpdateRequest::decode(&payload) {
                        Ok(request) => {
                            Self::apply_object_announcement(&location, session.object, request)
                                .await;
                            true
                        }
                        Err(_) => false,
                    },
                    SessionKind::ClusterNode(node) => {
                        match BulkLocationUpdate::decode(&payload) {
                            Ok(batch) => {
                                let sink = BulkUpdateSink { location };
                                sink.apply(node, &batch).await;
                                true
                            }
                            Err(_) => false,
                        }
                    }
                    SessionKind::ObjectHost(_) => match BulkLocationUpdate::decode(&payload) {
                        Ok(batch) => {
                            let sink = BulkUpdateSink { location };
                            sink.apply(NULL_NODE_ID, &batch).await;
                            true
                        }
                        Err(_) => false,
                    },
                };
                if complete && !consumed.swap(true, Ordering::AcqRel) {
                    if let Some(stream) = weak_stream.upgrade() {
                        stream.register_read_callback(None);
                        stream.close(false).await;
                    }
                }
            });
        })));
    }
}

#[async_trait]
impl SessionListener for LocationSessionBridge {
    async fn new_session(&self, session: &ObjectSession) {
        let location = self.location.clone();
        let session = session.clone();
        session.stream.clone().listen_substream(
            PORT_LOCATION,
            Box::new(move |err, substream| {
                if err != STREAM_OK {
                    return;
                }
                let Some(substream) = substream else { return };
                Self::attach_location_reader(location.clone(), session.clone(), substream);
            }),
        );
    }

    async fn session_closed(&self, object: EntityId) {
        // A departed object's local record goes with it.
        if self.location.provenance(object).await == Some(Provenance::Local) {
            if let Err(e) = self
                .location
                .remove_local_object(object, Box::new(|| {}))
                .await
            {
                warn!("🔴 Could not retire {}: {}", object, e);
            }
        }
    }
}

// ============================================================================
// The node
// ============================================================================

/// Transport the server accepts inbound links on.
pub enum TransportBinding {
    /// In-process fabric (tests, single-process multi-node deployments).
    InMemory(Arc<InMemoryNetwork>),
    /// WebSocket listener on the configured bind address.
    WebSocket,
}

/// One space server node: location core plus transport plumbing.
pub struct SpaceServer {
    config: ServerConfig,
    layer: Arc<SessionStreamLayer>,
    messaging: Arc<MessagingManager>,
    location: Arc<LocationService>,
    policy: Arc<LocationUpdatePolicy>,
    sessions: Arc<ObjectSessionManager>,
    forwarder: Arc<UpdateForwarder>,
    extrapolators: Mutex<HashMap<EntityId, MaxDistExtrapolator>>,
    node_entity: EntityId,
    serve_task: StdMutex<Option<JoinHandle<()>>>,
}

impl SpaceServer {
    /// Builds a fully wired node around the given update policy
    /// (typically constructed through the configuration registry). Call
    /// [`start`](Self::start) to begin serving.
    pub async fn new(
        config: ServerConfig,
        connector: Arc<dyn LinkConnector>,
        authenticator: Arc<dyn Authenticator>,
        policy: Arc<LocationUpdatePolicy>,
    ) -> Arc<Self> {
        let layer = SessionStreamLayer::new(connector);
        let messaging =
            MessagingManager::new(layer.clone(), config.retry_interval(), config.max_send_attempts);
        let location = Arc::new(LocationService::new());
        policy.initialize(&location).await;
        let sessions = Arc::new(ObjectSessionManager::new(authenticator));
        let node_entity = config.node_entity();

        let forwarder = Arc::new(UpdateForwarder::new(
            policy.clone(),
            messaging.clone(),
            node_entity,
        ));
        location
            .add_listener(forwarder.clone() as Arc<dyn LocationListener>, true)
            .await;

        messaging.register_sink(
            PORT_LOCATION,
            Arc::new(BulkUpdateSink {
                location: location.clone(),
            }),
        );

        sessions
            .add_listener(Arc::new(LocationSessionBridge {
                location: location.clone(),
            }))
            .await;

        Arc::new(Self {
            config,
            layer,
            messaging,
            location,
            policy,
            sessions,
            forwarder,
            extrapolators: Mutex::new(HashMap::new()),
            node_entity,
            serve_task: StdMutex::new(None),
        })
    }

    /// Starts serving: connects this node's transport presence and begins
    /// accepting inbound links.
    pub async fn start(&self, binding: TransportBinding) -> Result<(), ServerError> {
        self.messaging.presence_connected(self.node_entity).await;
        let handle = match binding {
            TransportBinding::InMemory(network) => {
                self.layer.serve_in_memory(&network, self.node_entity).await
            }
            TransportBinding::WebSocket => self.layer.serve_ws(self.config.bind_address).await?,
        };
        *lock(&self.serve_task) = Some(handle);
        info!(
            "🚀 Space server {} serving as {}",
            self.config.node(),
            self.node_entity
        );
        Ok(())
    }

    /// Stops accepting links and disconnects the node presence.
    pub async fn stop(&self) {
        if let Some(handle) = lock(&self.serve_task).take() {
            handle.abort();
        }
        self.messaging.presence_disconnected(self.node_entity).await;
        info!("🛑 Space server {} stopped", self.config.node());
    }

    /// Authenticates and registers a session for a connected participant.
    pub async fn accept_session(
        &self,
        object: EntityId,
        kind: SessionKind,
        credential: &[u8],
        stream: Arc<SessionStream>,
    ) -> Result<(), ServerError> {
        self.sessions.new_session(object, kind, credential, stream).await
    }

    /// Reports an entity's observed motion through the extrapolation
    /// predicate.
    ///
    /// Returns whether the divergence threshold was exceeded, in which
    /// case the authoritative record was updated and listeners (including
    /// the update forwarder) were notified.
    pub async fn report_local_motion(
        &self,
        id: EntityId,
        now: SimTime,
        observed: TimedMotionVector,
    ) -> Result<bool, ServerError> {
        let initial = self.location.location(id).await;
        let needs_update = {
            let mut extrapolators = self.extrapolators.lock().await;
            let predicate = extrapolators.entry(id).or_insert_with(|| {
                MaxDistExtrapolator::with_threshold(
                    initial.unwrap_or(observed),
                    self.config.motion_threshold,
                )
            });
            if predicate.needs_update(now, &observed.position) {
                predicate.update_value(now, observed);
                true
            } else {
                false
            }
        };

        if !needs_update {
            return Ok(false);
        }
        debug!("📡 Motion divergence for {}, broadcasting update", id);
        self.location
            .update_local_location(id, observed)
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        Ok(true)
    }

    /// Pushes a proximity result batch to an object over its session's
    /// datagram channel.
    pub async fn send_proximity_results(
        &self,
        object: EntityId,
        results: &ProximityResults,
    ) -> Result<(), ServerError> {
        let stream = self
            .sessions
            .stream_for_object(object)
            .await
            .ok_or_else(|| ServerError::Internal(format!("no session for {object}")))?;
        let connection = stream
            .connection()
            .ok_or_else(|| ServerError::Network("session connection dropped".to_string()))?;
        let bytes = results
            .encode()
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        connection
            .datagram(bytes, PORT_PROXIMITY, PORT_PROXIMITY, None)
            .await;
        Ok(())
    }

    /// Node configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// This node's transport identity.
    pub fn node_entity(&self) -> EntityId {
        self.node_entity
    }

    /// The location state store.
    pub fn location(&self) -> &Arc<LocationService> {
        &self.location
    }

    /// The subscription policy.
    pub fn policy(&self) -> &Arc<LocationUpdatePolicy> {
        &self.policy
    }

    /// The messaging manager (script-comm sends, presence bookkeeping).
    pub fn messaging(&self) -> &Arc<MessagingManager> {
        &self.messaging
    }

    /// The session tracker.
    pub fn sessions(&self) -> &Arc<ObjectSessionManager> {
        &self.sessions
    }

    /// The update forwarder (route table).
    pub fn forwarder(&self) -> &Arc<UpdateForwarder> {
        &self.forwarder
    }

    /// The session stream layer.
    pub fn layer(&self) -> &Arc<SessionStreamLayer> {
        &self.layer
    }
}

impl std::fmt::Debug for SpaceServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceServer")
            .field("node", &self.config.node())
            .field("entity", &self.node_entity)
            .finish()
    }
}
