//! Passive listen / active connect entry points of the stream layer.
//!
//! The layer owns the set of passive endpoints (who accepts inbound
//! top-level streams) and the table of live connections, and binds the
//! whole mux to a concrete transport: an in-memory fabric for tests and
//! single-process deployments, or a WebSocket accept loop between real
//! nodes.

use super::connection::{ConnectCallback, SessionConnection};
use super::frame::StreamFrame;
use super::link::{FrameLink, InMemoryNetwork, LinkConnector, WsLink};
use super::stream::SessionStream;
use super::{lock, Endpoint, STREAM_ERR_CLOSED, STREAM_ERR_UNREACHABLE, STREAM_OK};
use crate::error::ServerError;
use dashmap::DashMap;
use meridian_location_system::EntityId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Callback accepting inbound top-level streams on a listened endpoint.
pub type AcceptCallback = Box<dyn FnMut(i32, Option<Arc<SessionStream>>) + Send>;

/// The session stream layer for one node.
pub struct SessionStreamLayer {
    connector: Arc<dyn LinkConnector>,
    listeners: Mutex<HashMap<Endpoint, AcceptCallback>>,
    connections: DashMap<(EntityId, EntityId), Arc<SessionConnection>>,
}

impl SessionStreamLayer {
    /// Creates a layer that opens outbound links through `connector`.
    pub fn new(connector: Arc<dyn LinkConnector>) -> Arc<Self> {
        Arc::new(Self {
            connector,
            listeners: Mutex::new(HashMap::new()),
            connections: DashMap::new(),
        })
    }

    /// Registers a passive endpoint; inbound connection attempts toward it
    /// invoke `on_accept` with the new top-level stream.
    pub fn listen(&self, endpoint: Endpoint, on_accept: AcceptCallback) {
        lock(&self.listeners).insert(endpoint, on_accept);
    }

    /// Unregisters a passive endpoint.
    pub fn unlisten(&self, endpoint: &Endpoint) {
        lock(&self.listeners).remove(endpoint);
    }

    /// The live connection for an endpoint pair, if any.
    pub fn connection(&self, local: EntityId, remote: EntityId) -> Option<Arc<SessionConnection>> {
        self.connections
            .get(&(local, remote))
            .map(|entry| entry.value().clone())
    }

    /// Actively opens a top-level stream from `from` to `to`.
    ///
    /// On success `on_connect(STREAM_OK, Some(stream))`; on failure
    /// `on_connect(error_code, None)`.
    pub async fn connect_stream(
        self: &Arc<Self>,
        from: Endpoint,
        to: Endpoint,
        on_connect: ConnectCallback,
    ) {
        let link = match self.connector.connect(&from, &to).await {
            Ok(link) => link,
            Err(e) => {
                warn!("🔌 Failed to reach {}: {}", to, e);
                on_connect(STREAM_ERR_UNREACHABLE, None);
                return;
            }
        };

        let hello = StreamFrame::Hello { from, to };
        let encoded = match hello.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("🔴 Hello encode failed: {}", e);
                on_connect(STREAM_ERR_CLOSED, None);
                return;
            }
        };
        if let Err(e) = link.send(encoded).await {
            warn!("🔌 Hello to {} failed: {}", to, e);
            on_connect(STREAM_ERR_CLOSED, None);
            return;
        }

        let connection = SessionConnection::new(from, to, link, true);
        self.connections
            .insert((from.entity, to.entity), connection.clone());
        connection.start();
        let top = connection.ensure_top_stream();
        debug!("🔗 Opened stream {} → {}", from, to);
        on_connect(STREAM_OK, Some(top));
    }

    /// Adopts a freshly accepted link: reads its hello, matches it against
    /// the registered passive endpoints, and hands the resulting top-level
    /// stream to the accept callback.
    pub async fn handle_incoming_link(self: &Arc<Self>, link: Arc<dyn FrameLink>) {
        let Some(first) = link.recv().await else {
            return;
        };
        let frame = match StreamFrame::decode(&first) {
            Ok(frame) => frame,
            Err(e) => {
                error!("🔴 Dropping inbound link with malformed hello: {}", e);
                link.shutdown().await;
                return;
            }
        };
        let StreamFrame::Hello { from, to } = frame else {
            warn!("🔌 Inbound link did not start with a hello, dropping");
            link.shutdown().await;
            return;
        };

        if !lock(&self.listeners).contains_key(&to) {
            warn!("🔌 No listener registered for {}, dropping inbound stream", to);
            link.shutdown().await;
            return;
        }

        let connection = SessionConnection::new(to, from, link, false);
        self.connections
            .insert((to.entity, from.entity), connection.clone());
        connection.start();
        let top = connection.ensure_top_stream();
        debug!("🔗 Accepted stream {} → {}", from, to);

        if let Some(mut callback) = lock(&self.listeners).remove(&to) {
            callback(STREAM_OK, Some(top));
            lock(&self.listeners).entry(to).or_insert(callback);
        }
    }

    /// Drops a connection from the table (it is closed separately).
    pub fn forget_connection(&self, local: EntityId, remote: EntityId) {
        self.connections.remove(&(local, remote));
    }

    /// Serves inbound links for `entity` from an in-memory fabric.
    pub async fn serve_in_memory(
        self: &Arc<Self>,
        network: &InMemoryNetwork,
        entity: EntityId,
    ) -> JoinHandle<()> {
        let mut inbound = network.bind(entity).await;
        let layer = self.clone();
        tokio::spawn(async move {
            while let Some(link) = inbound.recv().await {
                layer.handle_incoming_link(link).await;
            }
        })
    }

    /// Serves inbound links over WebSockets on `bind`.
    pub async fn serve_ws(self: &Arc<Self>, bind: SocketAddr) -> Result<JoinHandle<()>, ServerError> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| ServerError::Network(format!("bind {bind}: {e}")))?;
        info!("🌐 Session stream layer listening on {}", bind);

        let layer = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((tcp, peer)) => {
                        debug!("🔗 Inbound transport connection from {}", peer);
                        let layer = layer.clone();
                        tokio::spawn(async move {
                            match tokio_tungstenite::accept_async(tcp).await {
                                Ok(ws) => {
                                    let link: Arc<dyn FrameLink> = Arc::new(WsLink::new(ws));
                                    layer.handle_incoming_link(link).await;
                                }
                                Err(e) => {
                                    warn!("🔌 WebSocket handshake failed from {}: {}", peer, e)
                                }
                            }
                        });
                    }
                    Err(e) => warn!("🔌 Transport accept error: {}", e),
                }
            }
        }))
    }
}

impl std::fmt::Debug for SessionStreamLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStreamLayer")
            .field("connections", &self.connections.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamState;
    use tokio::sync::mpsc;

    async fn connected_pair(
        layer_a: &Arc<SessionStreamLayer>,
        a: Endpoint,
        b: Endpoint,
        accepted: &mut mpsc::UnboundedReceiver<Arc<SessionStream>>,
    ) -> (Arc<SessionStream>, Arc<SessionStream>) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        layer_a
            .connect_stream(
                a,
                b,
                Box::new(move |err, stream| {
                    let _ = tx.send((err, stream));
                }),
            )
            .await;
        let (err, initiated) = rx.await.unwrap();
        assert_eq!(err, STREAM_OK);
        let accepted_stream = accepted.recv().await.unwrap();
        (initiated.unwrap(), accepted_stream)
    }

    fn collecting_accept(tx: mpsc::UnboundedSender<Arc<SessionStream>>) -> AcceptCallback {
        Box::new(move |err, stream| {
            if err == STREAM_OK {
                if let Some(stream) = stream {
                    let _ = tx.send(stream);
                }
            }
        })
    }

    #[tokio::test]
    async fn test_connect_listen_and_exchange_bytes() {
        let network = InMemoryNetwork::new();
        let layer_a = SessionStreamLayer::new(network.clone());
        let layer_b = SessionStreamLayer::new(network.clone());

        let a = Endpoint::new(EntityId::new(), 51000);
        let b = Endpoint::new(EntityId::new(), 51000);

        let _serve_b = layer_b.serve_in_memory(&network, b.entity).await;
        let (tx, mut accepted) = mpsc::unbounded_channel();
        layer_b.listen(b, collecting_accept(tx));

        let (initiated, accepted_stream) =
            connected_pair(&layer_a, a, b, &mut accepted).await;

        // Top-level streams are established on both sides immediately.
        assert_eq!(initiated.state(), StreamState::Established);
        assert_eq!(accepted_stream.state(), StreamState::Established);

        let (read_tx, mut read_rx) = mpsc::unbounded_channel();
        accepted_stream.register_read_callback(Some(Box::new(move |bytes| {
            let _ = read_tx.send(bytes.to_vec());
        })));

        initiated.write(b"across the fabric").await.unwrap();
        assert_eq!(read_rx.recv().await.unwrap(), b"across the fabric");
    }

    #[tokio::test]
    async fn test_substream_open_ack_and_seed_delivery() {
        let network = InMemoryNetwork::new();
        let layer_a = SessionStreamLayer::new(network.clone());
        let layer_b = SessionStreamLayer::new(network.clone());

        let a = Endpoint::new(EntityId::new(), 51000);
        let b = Endpoint::new(EntityId::new(), 51000);

        let _serve_b = layer_b.serve_in_memory(&network, b.entity).await;
        let (tx, mut accepted) = mpsc::unbounded_channel();
        layer_b.listen(b, collecting_accept(tx));

        let (initiated, accepted_stream) =
            connected_pair(&layer_a, a, b, &mut accepted).await;

        // The acceptor listens for substreams on port 16 and records their
        // seeded payloads.
        let (sub_tx, mut sub_rx) = mpsc::unbounded_channel();
        accepted_stream.listen_substream(
            16,
            Box::new(move |err, substream| {
                if err != STREAM_OK {
                    return;
                }
                let Some(substream) = substream else { return };
                let sub_tx = sub_tx.clone();
                substream.register_read_callback(Some(Box::new(move |bytes| {
                    let _ = sub_tx.send(bytes.to_vec());
                })));
            }),
        );

        let (open_tx, open_rx) = tokio::sync::oneshot::channel();
        initiated
            .create_child_stream(
                Box::new(move |err, substream| {
                    let _ = open_tx.send((err, substream));
                }),
                Some(b"seeded".to_vec()),
                16,
            )
            .await;

        let (err, child) = open_rx.await.unwrap();
        assert_eq!(err, STREAM_OK);
        assert_eq!(child.unwrap().state(), StreamState::Established);
        assert_eq!(sub_rx.recv().await.unwrap(), b"seeded");
    }

    #[tokio::test]
    async fn test_substream_open_on_unlistened_port_is_refused() {
        let network = InMemoryNetwork::new();
        let layer_a = SessionStreamLayer::new(network.clone());
        let layer_b = SessionStreamLayer::new(network.clone());

        let a = Endpoint::new(EntityId::new(), 51000);
        let b = Endpoint::new(EntityId::new(), 51000);

        let _serve_b = layer_b.serve_in_memory(&network, b.entity).await;
        let (tx, mut accepted) = mpsc::unbounded_channel();
        layer_b.listen(b, collecting_accept(tx));

        let (initiated, _accepted_stream) =
            connected_pair(&layer_a, a, b, &mut accepted).await;

        let (open_tx, open_rx) = tokio::sync::oneshot::channel();
        initiated
            .create_child_stream(
                Box::new(move |err, substream| {
                    let _ = open_tx.send((err, substream.is_none()));
                }),
                None,
                999,
            )
            .await;

        let (err, no_stream) = open_rx.await.unwrap();
        assert_eq!(err, super::super::STREAM_ERR_REFUSED);
        assert!(no_stream);
    }

    #[tokio::test]
    async fn test_connect_to_unknown_endpoint_is_unreachable() {
        let network = InMemoryNetwork::new();
        let layer = SessionStreamLayer::new(network.clone());

        let (tx, rx) = tokio::sync::oneshot::channel();
        layer
            .connect_stream(
                Endpoint::new(EntityId::new(), 51000),
                Endpoint::new(EntityId::new(), 51000),
                Box::new(move |err, stream| {
                    let _ = tx.send((err, stream.is_none()));
                }),
            )
            .await;

        let (err, no_stream) = rx.await.unwrap();
        assert_eq!(err, STREAM_ERR_UNREACHABLE);
        assert!(no_stream);
    }

    #[tokio::test]
    async fn test_datagram_side_channel() {
        let network = InMemoryNetwork::new();
        let layer_a = SessionStreamLayer::new(network.clone());
        let layer_b = SessionStreamLayer::new(network.clone());

        let a = Endpoint::new(EntityId::new(), 51000);
        let b = Endpoint::new(EntityId::new(), 51000);

        let _serve_b = layer_b.serve_in_memory(&network, b.entity).await;
        let (tx, mut accepted) = mpsc::unbounded_channel();
        layer_b.listen(b, collecting_accept(tx));

        let (initiated, accepted_stream) =
            connected_pair(&layer_a, a, b, &mut accepted).await;

        let (dg_tx, mut dg_rx) = mpsc::unbounded_channel();
        let conn_b = accepted_stream.connection().unwrap();
        conn_b.register_read_datagram_callback(
            24,
            Box::new(move |bytes| {
                let _ = dg_tx.send(bytes.to_vec());
            }),
        );

        let conn_a = initiated.connection().unwrap();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        conn_a
            .datagram(
                b"fire and forget".to_vec(),
                24,
                24,
                Some(Box::new(move |err| {
                    let _ = done_tx.send(err);
                })),
            )
            .await;

        assert_eq!(done_rx.await.unwrap(), STREAM_OK);
        assert_eq!(dg_rx.recv().await.unwrap(), b"fire and forget");
    }
}
