//! # Stream Reuse / Retry Manager
//!
//! Caches one canonical top-level stream per `(local presence, remote)`
//! pair for outbound reuse, delivers each message on a dedicated substream
//! seeded with the payload, and retries failed sends on a shared timer
//! until a bounded attempt count is exhausted.
//!
//! Both sides of a pair may race to open a stream to each other; when the
//! cache notices the duplicate it keeps the stream whose *initiating*
//! identifier sorts lower and closes the other, so the cluster converges on
//! one canonical stream per pair no matter the arrival order.
//!
//! Sends are fire-and-forget past the synchronous presence check: no return
//! value on success, no error on transient failure, only a log-visible
//! exhaustion after the configured attempts.

use crate::stream::{
    lock, Endpoint, SessionStream, SessionStreamLayer, StreamState, SESSION_STREAM_PORT,
    STREAM_OK,
};
use async_trait::async_trait;
use meridian_location_system::{EntityId, PORT_SCRIPT_COMM};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, trace, warn};

/// Consumer of complete payloads arriving on one substream port.
///
/// The script-comm integration implements this for
/// [`PORT_SCRIPT_COMM`]: `handle_message` is the Rust shape of
/// `handleScriptCommRead(src, dst, payload) -> handled`.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Attempts to consume the accumulated payload of one message
    /// substream. Returning `true` marks the payload complete and closes
    /// the substream; `false` keeps accumulating.
    async fn handle_message(&self, src: EntityId, dst: EntityId, payload: &[u8]) -> bool;
}

struct PendingSend {
    sender: EntityId,
    receiver: EntityId,
    port: u16,
    payload: Vec<u8>,
    attempts: u32,
}

/// Stream reuse cache, presence bookkeeping, and reliable-send retry.
pub struct MessagingManager {
    layer: Arc<SessionStreamLayer>,
    presences: RwLock<HashSet<EntityId>>,
    streams: RwLock<HashMap<EntityId, HashMap<EntityId, Arc<SessionStream>>>>,
    sinks: StdMutex<HashMap<u16, Arc<dyn MessageSink>>>,
    pending: StdMutex<Vec<PendingSend>>,
    retry_running: AtomicBool,
    retry_interval: Duration,
    max_attempts: u32,
}

impl MessagingManager {
    /// Creates a manager sending through `layer`.
    pub fn new(
        layer: Arc<SessionStreamLayer>,
        retry_interval: Duration,
        max_attempts: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            layer,
            presences: RwLock::new(HashSet::new()),
            streams: RwLock::new(HashMap::new()),
            sinks: StdMutex::new(HashMap::new()),
            pending: StdMutex::new(Vec::new()),
            retry_running: AtomicBool::new(false),
            retry_interval,
            max_attempts,
        })
    }

    /// Registers the consumer for message substreams on `port`, replacing
    /// any previous one. Register sinks before connecting presences so
    /// inbound streams are wired for every port.
    pub fn register_sink(&self, port: u16, sink: Arc<dyn MessageSink>) {
        lock(&self.sinks).insert(port, sink);
    }

    /// Marks a local identity as connected and starts accepting inbound
    /// streams addressed to it.
    pub async fn presence_connected(self: &Arc<Self>, id: EntityId) {
        self.presences.write().await.insert(id);
        self.streams.write().await.entry(id).or_default();

        let weak = Arc::downgrade(self);
        self.layer.listen(
            Endpoint::new(id, SESSION_STREAM_PORT),
            Box::new(move |err, stream| {
                if err != STREAM_OK {
                    return;
                }
                let Some(stream) = stream else { return };
                if let Some(manager) = weak.upgrade() {
                    tokio::spawn(async move {
                        manager.setup_new_stream(stream).await;
                    });
                }
            }),
        );
        info!("🟢 Presence {} connected", id);
    }

    /// Marks a local identity as disconnected: future sends on its behalf
    /// are rejected, its cached streams close, and pending retries for it
    /// are abandoned.
    pub async fn presence_disconnected(&self, id: EntityId) {
        self.presences.write().await.remove(&id);
        self.layer.unlisten(&Endpoint::new(id, SESSION_STREAM_PORT));
        lock(&self.pending).retain(|p| p.sender != id);

        let removed = self.streams.write().await.remove(&id);
        if let Some(per_remote) = removed {
            for (remote, stream) in per_remote {
                self.layer.forget_connection(id, remote);
                stream.close(false).await;
            }
        }
        info!("🔴 Presence {} disconnected", id);
    }

    /// Whether `id` is currently a connected presence.
    pub async fn is_presence_connected(&self, id: EntityId) -> bool {
        self.presences.read().await.contains(&id)
    }

    /// The cached canonical stream for `(local, remote)`, if one exists.
    pub async fn get_stream(
        &self,
        local: EntityId,
        remote: EntityId,
    ) -> Option<Arc<SessionStream>> {
        self.streams
            .read()
            .await
            .get(&local)
            .and_then(|per_remote| per_remote.get(&remote))
            .cloned()
    }

    /// Inserts a freshly established stream into the reuse cache.
    ///
    /// If a stream for the same pair is already cached, only the one whose
    /// initiating identifier compares lower survives; the other is closed.
    pub async fn setup_new_stream(self: &Arc<Self>, stream: Arc<SessionStream>) {
        let Some(connection) = stream.connection() else {
            return;
        };
        let local = connection.local_endpoint().entity;
        let remote = connection.remote_endpoint().entity;
        self.wire_incoming(&stream);

        let loser = {
            let mut streams = self.streams.write().await;
            let per_remote = streams.entry(local).or_default();
            match per_remote.get(&remote) {
                None => {
                    per_remote.insert(remote, stream);
                    None
                }
                Some(existing) if Arc::ptr_eq(existing, &stream) => None,
                Some(existing) => {
                    let keep_new = match existing.connection() {
                        // A dead cached stream always yields to a live one.
                        None => true,
                        Some(existing_conn) if existing_conn.is_closed() => true,
                        Some(existing_conn) => connection.initiator() < existing_conn.initiator(),
                    };
                    if keep_new {
                        debug!(
                            "🔀 Duplicate stream {} ↔ {}; keeping initiator {}",
                            local,
                            remote,
                            connection.initiator()
                        );
                        per_remote.insert(remote, stream)
                    } else {
                        debug!(
                            "🔀 Duplicate stream {} ↔ {}; discarding initiator {}",
                            local,
                            remote,
                            connection.initiator()
                        );
                        Some(stream)
                    }
                }
            }
        };

        if let Some(loser) = loser {
            loser.close(false).await;
        }
    }

    fn wire_incoming(self: &Arc<Self>, stream: &Arc<SessionStream>) {
        let Some(connection) = stream.connection() else {
            return;
        };
        let ports: Vec<u16> = lock(&self.sinks).keys().copied().collect();
        for port in ports {
            let weak = Arc::downgrade(self);
            connection.listen_substream(
                port,
                Box::new(move |err, substream| {
                    if err != STREAM_OK {
                        return;
                    }
                    let Some(substream) = substream else { return };
                    if let Some(manager) = weak.upgrade() {
                        manager.attach_reader(port, substream);
                    }
                }),
            );
        }
    }

    /// Accumulates chunks on a message substream and offers the buffer to
    /// the port's sink after each read; a `true` return closes the
    /// substream.
    fn attach_reader(self: &Arc<Self>, port: u16, substream: Arc<SessionStream>) {
        let Some(connection) = substream.connection() else {
            return;
        };
        let src = connection.remote_endpoint().entity;
        let dst = connection.local_endpoint().entity;

        let accumulated: Arc<StdMutex<Vec<u8>>> = Arc::new(StdMutex::new(Vec::new()));
        let consumed = Arc::new(AtomicBool::new(false));
        let weak_manager = Arc::downgrade(self);
        let weak_stream = Arc::downgrade(&substream);

        substream.register_read_callback(Some(Box::new(move |bytes| {
            lock(&accumulated).extend_from_slice(bytes);
            let payload = lock(&accumulated).clone();
            let Some(manager) = weak_manager.upgrade() else {
                return;
            };
            let weak_stream = weak_stream.clone();
            let consumed = consumed.clone();
            tokio::spawn(async move {
                if consumed.load(Ordering::Acquire) {
                    return;
                }
                let sink = lock(&manager.sinks).get(&port).cloned();
                let Some(sink) = sink else { return };
                if sink.handle_message(src, dst, &payload).await
                    && !consumed.swap(true, Ordering::AcqRel)
                {
                    if let Some(stream) = weak_stream.upgrade() {
                        stream.register_read_callback(None);
                        stream.close(false).await;
                    }
                }
            });
        })));
    }

    /// Reliable application message to `receiver` on the script-comm port.
    ///
    /// Returns `false` synchronously when `sender` is not a connected
    /// presence; the send is rejected before any stream open is attempted.
    /// Otherwise the send proceeds fire-and-forget.
    pub async fn send_message_reliable(
        self: &Arc<Self>,
        sender: EntityId,
        receiver: EntityId,
        payload: Vec<u8>,
    ) -> bool {
        self.send_on_port(sender, receiver, PORT_SCRIPT_COMM, payload)
            .await
    }

    /// Reliable message on an explicit port; see
    /// [`send_message_reliable`](Self::send_message_reliable).
    pub async fn send_on_port(
        self: &Arc<Self>,
        sender: EntityId,
        receiver: EntityId,
        port: u16,
        payload: Vec<u8>,
    ) -> bool {
        if !self.presences.read().await.contains(&sender) {
            warn!("🚫 Rejecting send from disconnected presence {}", sender);
            return false;
        }

        let manager = self.clone();
        tokio::spawn(async move {
            if !manager.try_send(sender, receiver, port, &payload).await {
                manager.queue_retry(PendingSend {
                    sender,
                    receiver,
                    port,
                    payload,
                    attempts: 1,
                });
            }
        });
        true
    }

    /// One delivery attempt: reuse or lazily open a stream, then carry the
    /// whole message as the seed of a dedicated substream.
    async fn try_send(
        self: &Arc<Self>,
        sender: EntityId,
        receiver: EntityId,
        port: u16,
        payload: &[u8],
    ) -> bool {
        let stream = match self.get_stream(sender, receiver).await {
            Some(stream) if stream.state() == StreamState::Established => Some(stream),
            _ => self.connect_to(sender, receiver).await,
        };
        let Some(stream) = stream else {
            return false;
        };

        let (open_tx, open_rx) = oneshot::channel();
        stream
            .create_child_stream(
                Box::new(move |err, substream| {
                    let _ = open_tx.send((err, substream));
                }),
                Some(payload.to_vec()),
                port,
            )
            .await;

        match tokio::time::timeout(self.retry_interval * 2, open_rx).await {
            Ok(Ok((err, Some(substream)))) if err == STREAM_OK => {
                trace!("📨 Message to {} delivered on port {}", receiver, port);
                substream.close(false).await;
                true
            }
            _ => false,
        }
    }

    async fn connect_to(
        self: &Arc<Self>,
        sender: EntityId,
        receiver: EntityId,
    ) -> Option<Arc<SessionStream>> {
        let (tx, rx) = oneshot::channel();
        self.layer
            .connect_stream(
                Endpoint::new(sender, SESSION_STREAM_PORT),
                Endpoint::new(receiver, SESSION_STREAM_PORT),
                Box::new(move |err, stream| {
                    let _ = tx.send((err, stream));
                }),
            )
            .await;

        match rx.await {
            Ok((err, Some(stream))) if err == STREAM_OK => {
                self.setup_new_stream(stream).await;
                // The tie-break may have preferred a racing inbound stream.
                self.get_stream(sender, receiver).await
            }
            _ => None,
        }
    }

    fn queue_retry(self: &Arc<Self>, send: PendingSend) {
        if send.attempts >= self.max_attempts {
            warn!(
                "📪 Giving up on message {} → {} after {} attempts",
                send.sender, send.receiver, send.attempts
            );
            return;
        }
        lock(&self.pending).push(send);
        self.ensure_retry_timer();
    }

    /// One shared retry timer per manager; it runs only while sends are
    /// pending and stops itself once the queue drains.
    fn ensure_retry_timer(self: &Arc<Self>) {
        if self.retry_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(self);
        let interval = self.retry_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                let due: Vec<PendingSend> = lock(&manager.pending).drain(..).collect();
                if due.is_empty() {
                    manager.retry_running.store(false, Ordering::Release);
                    return;
                }
                for mut send in due {
                    // A disconnected sender abandons its retries.
                    if !manager.presences.read().await.contains(&send.sender) {
                        continue;
                    }
                    if manager
                        .try_send(send.sender, send.receiver, send.port, &send.payload)
                        .await
                    {
                        continue;
                    }
                    send.attempts += 1;
                    manager.queue_retry(send);
                }
            }
        });
    }

    /// Layer accessor for wiring.
    pub fn layer(&self) -> &Arc<SessionStreamLayer> {
        &self.layer
    }
}

impl std::fmt::Debug for MessagingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingManager")
            .field("retry_interval", &self.retry_interval)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}
