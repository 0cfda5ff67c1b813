//! The frame-link seam under the session stream layer.
//!
//! A [`FrameLink`] moves whole frames between two peers, reliably and in
//! order; everything above it (substream mux, datagrams, callbacks) is
//! transport-agnostic. Production links ride WebSockets, which already
//! frame messages; in-process links (used by tests and single-process
//! deployments) ride a length-delimited `tokio::io::duplex` pipe.

use super::Endpoint;
use crate::error::ServerError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use meridian_location_system::EntityId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

/// Buffer size for in-memory duplex pipes.
const DUPLEX_BUFFER: usize = 64 * 1024;
/// Frame size cap for length-delimited links.
const MAX_LINK_FRAME: usize = 4 * 1024 * 1024;

/// Reliable, ordered, whole-frame transport between two peers.
#[async_trait]
pub trait FrameLink: Send + Sync {
    /// Sends one frame. Errors indicate the link is unusable.
    async fn send(&self, frame: Vec<u8>) -> Result<(), ServerError>;

    /// Receives the next frame, or `None` once the link has closed.
    async fn recv(&self) -> Option<Vec<u8>>;

    /// Shuts down the sending side; queued frames are already flushed
    /// because every send completes its own write.
    async fn shutdown(&self);
}

/// Opens links toward remote endpoints.
#[async_trait]
pub trait LinkConnector: Send + Sync {
    /// Connects a fresh link from `from` to `to`.
    async fn connect(
        &self,
        from: &Endpoint,
        to: &Endpoint,
    ) -> Result<Arc<dyn FrameLink>, ServerError>;
}

// ============================================================================
// In-memory links
// ============================================================================

/// Length-delimited frame link over an in-process duplex pipe.
pub struct DuplexLink {
    reader: Mutex<ReadHalf<DuplexStream>>,
    writer: Mutex<WriteHalf<DuplexStream>>,
}

impl DuplexLink {
    fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }

    /// Creates both ends of a connected in-memory link.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (a, b) = tokio::io::duplex(DUPLEX_BUFFER);
        (Arc::new(Self::new(a)), Arc::new(Self::new(b)))
    }
}

#[async_trait]
impl FrameLink for DuplexLink {
    async fn send(&self, frame: Vec<u8>) -> Result<(), ServerError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_u32(frame.len() as u32)
            .await
            .map_err(|e| ServerError::Network(format!("link write: {e}")))?;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| ServerError::Network(format!("link write: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| ServerError::Network(format!("link flush: {e}")))
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        let mut reader = self.reader.lock().await;
        let len = reader.read_u32().await.ok()? as usize;
        if len > MAX_LINK_FRAME {
            warn!("🔴 Oversized link frame ({} bytes), closing link", len);
            return None;
        }
        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame).await.ok()?;
        Some(frame)
    }

    async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// In-process link fabric: pairs a connecting side with a bound listener.
///
/// Nodes bind their transport identity with [`bind`](Self::bind) and receive
/// the far ends of every link connected toward them. Used by tests and
/// single-process multi-node deployments.
pub struct InMemoryNetwork {
    inboxes: RwLock<HashMap<EntityId, mpsc::UnboundedSender<Arc<dyn FrameLink>>>>,
}

impl InMemoryNetwork {
    /// Creates an empty fabric.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inboxes: RwLock::new(HashMap::new()),
        })
    }

    /// Binds `entity` and returns the receiver of inbound links.
    pub async fn bind(&self, entity: EntityId) -> mpsc::UnboundedReceiver<Arc<dyn FrameLink>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.write().await.insert(entity, tx);
        rx
    }

    /// Removes a binding; future connects toward `entity` fail.
    pub async fn unbind(&self, entity: EntityId) {
        self.inboxes.write().await.remove(&entity);
    }
}

#[async_trait]
impl LinkConnector for InMemoryNetwork {
    async fn connect(
        &self,
        _from: &Endpoint,
        to: &Endpoint,
    ) -> Result<Arc<dyn FrameLink>, ServerError> {
        let inbox = self
            .inboxes
            .read()
            .await
            .get(&to.entity)
            .cloned()
            .ok_or_else(|| ServerError::Network(format!("no route to {}", to.entity)))?;
        let (near, far) = DuplexLink::pair();
        inbox
            .send(far)
            .map_err(|_| ServerError::Network(format!("listener for {} is gone", to.entity)))?;
        Ok(near)
    }
}

// ============================================================================
// WebSocket links
// ============================================================================

/// Frame link over a WebSocket connection; each frame is one binary message.
pub struct WsLink<S> {
    sink: Mutex<futures_util::stream::SplitSink<WebSocketStream<S>, Message>>,
    stream: Mutex<futures_util::stream::SplitStream<WebSocketStream<S>>>,
}

impl<S> WsLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps an established WebSocket.
    pub fn new(ws: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }
}

#[async_trait]
impl<S> FrameLink for WsLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, frame: Vec<u8>) -> Result<(), ServerError> {
        self.sink
            .lock()
            .await
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|e| ServerError::Network(format!("ws send: {e}")))
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        loop {
            let message = self.stream.lock().await.next().await?;
            match message {
                Ok(Message::Binary(bytes)) => return Some(bytes.into()),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue, // ping/pong/text are transport noise here
                Err(e) => {
                    debug!("🔌 WebSocket receive error: {}", e);
                    return None;
                }
            }
        }
    }

    async fn shutdown(&self) {
        let _ = self.sink.lock().await.close().await;
    }
}

/// Connector that dials peers over WebSockets using a route table mapping
/// transport identities to `host:port` addresses.
pub struct WsConnector {
    routes: RwLock<HashMap<EntityId, String>>,
}

impl WsConnector {
    /// Creates a connector with an empty route table.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: RwLock::new(HashMap::new()),
        })
    }

    /// Adds or replaces the address for `entity`.
    pub async fn add_route(&self, entity: EntityId, address: String) {
        self.routes.write().await.insert(entity, address);
    }
}

#[async_trait]
impl LinkConnector for WsConnector {
    async fn connect(
        &self,
        _from: &Endpoint,
        to: &Endpoint,
    ) -> Result<Arc<dyn FrameLink>, ServerError> {
        let address = self
            .routes
            .read()
            .await
            .get(&to.entity)
            .cloned()
            .ok_or_else(|| ServerError::Network(format!("no route to {}", to.entity)))?;
        let (ws, _response) = tokio_tungstenite::connect_async(format!("ws://{address}"))
            .await
            .map_err(|e| ServerError::Network(format!("connect {address}: {e}")))?;
        Ok(Arc::new(WsLink::new(ws)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplex_link_round_trips_frames_in_order() {
        let (a, b) = DuplexLink::pair();
        a.send(b"first".to_vec()).await.unwrap();
        a.send(b"second".to_vec()).await.unwrap();

        assert_eq!(b.recv().await.unwrap(), b"first");
        assert_eq!(b.recv().await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_shutdown_ends_the_peer_recv() {
        let (a, b) = DuplexLink::pair();
        a.shutdown().await;
        assert!(b.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_in_memory_connect_requires_a_binding() {
        let network = InMemoryNetwork::new();
        let from = Endpoint::new(EntityId::new(), 51000);
        let to = Endpoint::new(EntityId::new(), 51000);

        assert!(network.connect(&from, &to).await.is_err());

        let mut inbound = network.bind(to.entity).await;
        let near = network.connect(&from, &to).await.unwrap();
        let far = inbound.recv().await.unwrap();

        near.send(b"hello".to_vec()).await.unwrap();
        assert_eq!(far.recv().await.unwrap(), b"hello");
    }
}
