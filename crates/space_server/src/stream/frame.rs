//! Mux frames carried on the underlying link.
//!
//! Every link message is exactly one frame. Substream data is opaque bytes;
//! the frame layer adds only the substream id needed for demultiplexing.

use super::Endpoint;
use crate::error::ServerError;
use serde::{Deserialize, Serialize};

/// One multiplexing frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamFrame {
    /// First frame on a freshly connected link, identifying both endpoints.
    Hello {
        /// Initiating endpoint.
        from: Endpoint,
        /// Target endpoint; must match a registered passive listener.
        to: Endpoint,
    },
    /// Opens substream `id` on `port`, optionally pre-seeded with bytes.
    OpenSubstream {
        /// Substream id, unique per direction (initiator even, acceptor odd).
        id: u32,
        /// Destination port.
        port: u16,
        /// Initial payload delivered before any `Data` frame.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        initial: Vec<u8>,
    },
    /// The peer accepted substream `id`.
    OpenAck {
        /// Substream id from the corresponding `OpenSubstream`.
        id: u32,
    },
    /// The peer refused substream `id` (no listener on `port`).
    OpenNack {
        /// Substream id from the corresponding `OpenSubstream`.
        id: u32,
        /// The refused port.
        port: u16,
    },
    /// Ordered bytes for substream `id`.
    Data {
        /// Substream id.
        id: u32,
        /// Chunk payload.
        bytes: Vec<u8>,
    },
    /// Graceful close of substream `id`.
    CloseSubstream {
        /// Substream id.
        id: u32,
    },
    /// Unreliable-semantics datagram, outside any substream.
    Datagram {
        /// Sending side's port.
        src_port: u16,
        /// Receiving side's port; selects the registered callback.
        dst_port: u16,
        /// Datagram payload.
        bytes: Vec<u8>,
    },
}

impl StreamFrame {
    /// Serializes the frame for the link.
    pub fn encode(&self) -> Result<Vec<u8>, ServerError> {
        serde_json::to_vec(self).map_err(|e| ServerError::Internal(format!("frame encode: {e}")))
    }

    /// Decodes a frame received from the link.
    pub fn decode(bytes: &[u8]) -> Result<Self, ServerError> {
        serde_json::from_slice(bytes).map_err(|e| ServerError::Network(format!("frame decode: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_location_system::EntityId;

    #[test]
    fn test_initial_payload_is_optional_on_the_wire() {
        let bare = StreamFrame::OpenSubstream {
            id: 4,
            port: 16,
            initial: Vec::new(),
        };
        let encoded = bare.encode().unwrap();
        // An empty seed is omitted entirely rather than shipped as [].
        assert!(!String::from_utf8_lossy(&encoded).contains("initial"));
        assert_eq!(StreamFrame::decode(&encoded).unwrap(), bare);
    }

    #[test]
    fn test_malformed_frame_is_a_network_error() {
        let err = StreamFrame::decode(b"\x00\x01garbage").unwrap_err();
        assert!(matches!(err, ServerError::Network(_)));
    }

    #[test]
    fn test_hello_identifies_both_endpoints() {
        let frame = StreamFrame::Hello {
            from: Endpoint::new(EntityId::new(), 51000),
            to: Endpoint::new(EntityId::new(), 51000),
        };
        let decoded = StreamFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }
}
