//! # Session Stream Layer
//!
//! Endpoint-addressed, multiplexed, reliable, ordered byte-stream transport
//! between nodes and objects. One underlying connection per endpoint pair
//! carries any number of independent substreams, each addressed by a small
//! integer port, each delivering bytes reliably and in order, with no
//! ordering (and no head-of-line blocking) across substreams. Each
//! connection also carries an unreliable-semantics datagram side channel
//! addressed the same way.
//!
//! The layer is a byte stream: no message framing is implied on a
//! substream, framing is the caller's job.
//!
//! ## Strand guarantee
//!
//! All callbacks for one connection (substream accepts, read chunks,
//! datagrams) are dispatched from that connection's single read task, so
//! callbacks for the same stream are never invoked concurrently with each
//! other.
//!
//! ## Structure
//!
//! - [`frame`] - the mux frames carried on the underlying link
//! - [`link`] - the [`FrameLink`](link::FrameLink) seam with WebSocket and
//!   in-memory duplex implementations
//! - [`connection`] - per-connection state machine and frame dispatch
//! - [`stream`] - the per-substream handle
//! - [`layer`] - passive listen / active connect entry points

pub mod connection;
pub mod frame;
pub mod layer;
pub mod link;
pub mod stream;

pub use connection::{
    ConnectCallback, DatagramCallback, DatagramDoneCallback, SessionConnection, StreamState,
    SubstreamListener,
};
pub use frame::StreamFrame;
pub use layer::{AcceptCallback, SessionStreamLayer};
pub use link::{DuplexLink, FrameLink, InMemoryNetwork, LinkConnector, WsConnector, WsLink};
pub use stream::{ReadCallback, SessionStream};

use meridian_location_system::EntityId;
use serde::{Deserialize, Serialize};

/// Callback error code: success.
pub const STREAM_OK: i32 = 0;
/// Callback error code: the remote refused the substream (no listener).
pub const STREAM_ERR_REFUSED: i32 = 1;
/// Callback error code: the connection closed before the operation finished.
pub const STREAM_ERR_CLOSED: i32 = 2;
/// Callback error code: no route to the requested endpoint.
pub const STREAM_ERR_UNREACHABLE: i32 = 3;

/// Well-known endpoint port for top-level session streams.
pub const SESSION_STREAM_PORT: u16 = 51000;

/// A stream-layer address: an entity plus a port number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// The entity this endpoint belongs to (object or node transport
    /// identity).
    pub entity: EntityId,
    /// Port number; top-level streams use [`SESSION_STREAM_PORT`].
    pub port: u16,
}

impl Endpoint {
    /// Creates an endpoint.
    pub fn new(entity: EntityId, port: u16) -> Self {
        Self { entity, port }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.entity, self.port)
    }
}

/// Locks a std mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
