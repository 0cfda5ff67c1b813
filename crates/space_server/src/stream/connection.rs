//! Per-connection state machine and frame dispatch.
//!
//! One [`SessionConnection`] backs every stream between a pair of
//! endpoints. A single spawned read task drains the underlying link and
//! dispatches frames, which makes it the strand all callbacks for this
//! connection run on: no two callbacks for the same stream ever execute
//! concurrently.
//!
//! Substream establishment is an explicit state machine
//! ([`StreamState`]): `Connecting` until the peer acks or nacks the open,
//! then `Established`, `Closed`, or `Failed`. Substream ids are allocated
//! with disjoint parity per side (initiator even, acceptor odd) so the two
//! directions can open substreams concurrently without collisions; id 0 is
//! the connection's top-level stream.

use super::frame::StreamFrame;
use super::link::FrameLink;
use super::stream::SessionStream;
use super::{lock, Endpoint, STREAM_ERR_CLOSED, STREAM_ERR_REFUSED, STREAM_OK};
use crate::error::ServerError;
use meridian_location_system::EntityId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

/// Callback for an actively opened stream or substream: `(error_code,
/// stream)` with the stream present exactly when the code is
/// [`STREAM_OK`](super::STREAM_OK).
pub type ConnectCallback = Box<dyn FnOnce(i32, Option<Arc<SessionStream>>) + Send>;

/// Callback accepting inbound substreams on a listened port.
pub type SubstreamListener = Box<dyn FnMut(i32, Option<Arc<SessionStream>>) + Send>;

/// Callback receiving datagram payloads on a registered port.
pub type DatagramCallback = Box<dyn FnMut(&[u8]) + Send>;

/// Completion callback for a datagram send.
pub type DatagramDoneCallback = Box<dyn FnOnce(i32) + Send>;

/// Lifecycle of one stream establishment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Open sent, waiting for the peer's ack or nack.
    Connecting,
    /// Both sides agree the stream exists; reads and writes flow.
    Established,
    /// Torn down by either side.
    Closed,
    /// The establishment attempt was refused or the link died first.
    Failed,
}

/// The object backing all streams between one endpoint pair.
pub struct SessionConnection {
    local: Endpoint,
    remote: Endpoint,
    initiated_locally: bool,
    link: Arc<dyn FrameLink>,
    substreams: Mutex<HashMap<u32, Arc<SessionStream>>>,
    substream_listeners: Mutex<HashMap<u16, SubstreamListener>>,
    pending_opens: Mutex<HashMap<u32, ConnectCallback>>,
    datagram_callbacks: Mutex<HashMap<u16, DatagramCallback>>,
    next_substream_id: AtomicU32,
    read_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SessionConnection {
    pub(crate) fn new(
        local: Endpoint,
        remote: Endpoint,
        link: Arc<dyn FrameLink>,
        initiated_locally: bool,
    ) -> Arc<Self> {
        // id 0 is the top-level stream; each side then allocates its own
        // parity so concurrent opens from both directions never collide.
        let first_id = if initiated_locally { 2 } else { 3 };
        Arc::new(Self {
            local,
            remote,
            initiated_locally,
            link,
            substreams: Mutex::new(HashMap::new()),
            substream_listeners: Mutex::new(HashMap::new()),
            pending_opens: Mutex::new(HashMap::new()),
            datagram_callbacks: Mutex::new(HashMap::new()),
            next_substream_id: AtomicU32::new(first_id),
            read_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Local endpoint of this connection.
    pub fn local_endpoint(&self) -> Endpoint {
        self.local
    }

    /// Remote endpoint of this connection.
    pub fn remote_endpoint(&self) -> Endpoint {
        self.remote
    }

    /// The entity that actively opened this connection, on whichever side
    /// it lives. Used by the reuse cache to break ties between racing
    /// opens.
    pub fn initiator(&self) -> EntityId {
        if self.initiated_locally {
            self.local.entity
        } else {
            self.remote.entity
        }
    }

    /// Whether this side opened the connection.
    pub fn initiated_locally(&self) -> bool {
        self.initiated_locally
    }

    /// Whether the connection has been torn down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns the top-level stream (id 0), creating the handle on first
    /// use.
    pub(crate) fn ensure_top_stream(self: &Arc<Self>) -> Arc<SessionStream> {
        let mut substreams = lock(&self.substreams);
        substreams
            .entry(0)
            .or_insert_with(|| {
                SessionStream::new(0, self.remote.port, Arc::downgrade(self), StreamState::Established)
            })
            .clone()
    }

    /// Spawns the read task that drains the link and dispatches frames.
    pub(crate) fn start(self: &Arc<Self>) {
        let connection = self.clone();
        let handle = tokio::spawn(async move {
            connection.run().await;
        });
        *lock(&self.read_task) = Some(handle);
    }

    async fn run(self: Arc<Self>) {
        while let Some(bytes) = self.link.recv().await {
            match StreamFrame::decode(&bytes) {
                Ok(frame) => self.dispatch(frame).await,
                // A malformed frame is fatal to that frame only; a peer must
                // never be able to crash this node with garbage input.
                Err(e) => error!("🔴 Dropping malformed frame from {}: {}", self.remote, e),
            }
        }
        self.handle_link_closed();
    }

    async fn dispatch(self: &Arc<Self>, frame: StreamFrame) {
        match frame {
            StreamFrame::Hello { from, .. } => {
                debug!("🔌 Unexpected hello from {} on established connection", from);
            }
            StreamFrame::OpenSubstream { id, port, initial } => {
                if !lock(&self.substream_listeners).contains_key(&port) {
                    debug!("🚪 Refusing substream from {} on unlistened port {}", self.remote, port);
                    let _ = self.send_frame(StreamFrame::OpenNack { id, port }).await;
                    return;
                }
                let stream =
                    SessionStream::new(id, port, Arc::downgrade(self), StreamState::Established);
                lock(&self.substreams).insert(id, stream.clone());
                if self.send_frame(StreamFrame::OpenAck { id }).await.is_err() {
                    return;
                }
                if !initial.is_empty() {
                    stream.deliver(initial);
                }
                // Take-invoke-restore so the listener may re-register or
                // unregister itself from inside the callback.
                if let Some(mut listener) = lock(&self.substream_listeners).remove(&port) {
                    listener(STREAM_OK, Some(stream));
                    lock(&self.substream_listeners).entry(port).or_insert(listener);
                }
            }
            StreamFrame::OpenAck { id } => {
                let stream = lock(&self.substreams).get(&id).cloned();
                let callback = lock(&self.pending_opens).remove(&id);
                if let (Some(stream), Some(callback)) = (stream, callback) {
                    stream.set_state(StreamState::Established);
                    callback(STREAM_OK, Some(stream));
                }
            }
            StreamFrame::OpenNack { id, port } => {
                if let Some(stream) = lock(&self.substreams).remove(&id) {
                    stream.set_state(StreamState::Failed);
                }
                if let Some(callback) = lock(&self.pending_opens).remove(&id) {
                    debug!("🚪 Substream open refused by {} on port {}", self.remote, port);
                    callback(STREAM_ERR_REFUSED, None);
                }
            }
            StreamFrame::Data { id, bytes } => {
                let stream = lock(&self.substreams).get(&id).cloned();
                match stream {
                    Some(stream) => stream.deliver(bytes),
                    None => trace!("data for unknown substream {}", id),
                }
            }
            StreamFrame::CloseSubstream { id } => {
                if let Some(stream) = lock(&self.substreams).remove(&id) {
                    stream.set_state(StreamState::Closed);
                }
            }
            StreamFrame::Datagram { dst_port, bytes, .. } => {
                if let Some(mut callback) = lock(&self.datagram_callbacks).remove(&dst_port) {
                    callback(&bytes);
                    lock(&self.datagram_callbacks).entry(dst_port).or_insert(callback);
                } else {
                    trace!("datagram on unregistered port {}", dst_port);
                }
            }
        }
    }

    fn handle_link_closed(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let streams: Vec<Arc<SessionStream>> =
            lock(&self.substreams).drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.set_state(StreamState::Closed);
        }
        let pending: Vec<ConnectCallback> =
            lock(&self.pending_opens).drain().map(|(_, cb)| cb).collect();
        for callback in pending {
            callback(STREAM_ERR_CLOSED, None);
        }
        debug!("🔌 Connection {} ↔ {} closed", self.local, self.remote);
    }

    pub(crate) async fn send_frame(&self, frame: StreamFrame) -> Result<(), ServerError> {
        if self.is_closed() {
            return Err(ServerError::Network(format!(
                "connection to {} is closed",
                self.remote
            )));
        }
        self.link.send(frame.encode()?).await
    }

    pub(crate) fn remove_substream(&self, id: u32) {
        lock(&self.substreams).remove(&id);
    }

    /// Actively opens a substream on `port`, optionally pre-seeded with
    /// `initial` bytes delivered to the acceptor before any later write.
    pub async fn open_substream(
        self: &Arc<Self>,
        port: u16,
        initial: Option<Vec<u8>>,
        on_connect: ConnectCallback,
    ) {
        let id = self.next_substream_id.fetch_add(2, Ordering::AcqRel);
        let stream = SessionStream::new(id, port, Arc::downgrade(self), StreamState::Connecting);
        lock(&self.substreams).insert(id, stream);
        lock(&self.pending_opens).insert(id, on_connect);

        let frame = StreamFrame::OpenSubstream {
            id,
            port,
            initial: initial.unwrap_or_default(),
        };
        if let Err(e) = self.send_frame(frame).await {
            warn!("🔌 Substream open to {} failed: {}", self.remote, e);
            if let Some(stream) = lock(&self.substreams).remove(&id) {
                stream.set_state(StreamState::Failed);
            }
            if let Some(callback) = lock(&self.pending_opens).remove(&id) {
                callback(STREAM_ERR_CLOSED, None);
            }
        }
    }

    /// Accepts inbound substreams on `port`. One listener per port; a new
    /// registration replaces the old one.
    pub fn listen_substream(&self, port: u16, on_substream: SubstreamListener) {
        lock(&self.substream_listeners).insert(port, on_substream);
    }

    /// Registers the callback for datagrams addressed to `port`.
    pub fn register_read_datagram_callback(&self, port: u16, callback: DatagramCallback) {
        lock(&self.datagram_callbacks).insert(port, callback);
    }

    /// Sends an unreliable-semantics datagram outside any substream.
    ///
    /// `done` is invoked with [`STREAM_OK`](super::STREAM_OK) once the
    /// datagram has been handed to the link, or an error code if the
    /// connection is no longer usable.
    pub async fn datagram(
        &self,
        bytes: Vec<u8>,
        src_port: u16,
        dst_port: u16,
        done: Option<DatagramDoneCallback>,
    ) {
        let result = self
            .send_frame(StreamFrame::Datagram {
                src_port,
                dst_port,
                bytes,
            })
            .await;
        if let Some(done) = done {
            done(if result.is_ok() { STREAM_OK } else { STREAM_ERR_CLOSED });
        }
    }

    /// Tears down the connection and every stream on it.
    ///
    /// Graceful close (`force = false`) lets the peer's read loop observe
    /// the shutdown after already-queued frames; `force = true` aborts the
    /// read task immediately.
    pub async fn close(&self, force: bool) {
        if force {
            if let Some(handle) = lock(&self.read_task).take() {
                handle.abort();
            }
        }
        self.link.shutdown().await;
        self.handle_link_closed();
    }
}

impl std::fmt::Debug for SessionConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConnection")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("initiated_locally", &self.initiated_locally)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Weak handle used by streams to reach back to their connection.
pub(crate) type ConnectionRef = Weak<SessionConnection>;
