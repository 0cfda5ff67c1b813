//! Wire payload structures for location and proximity traffic.
//!
//! These are the batch shapes carried opaquely by the session stream layer:
//! a batch is a finite ordered sequence of per-object records, decodable
//! independently of message boundaries on the stream. Encoding is JSON, the
//! same serialization the rest of the system uses for its messages.
//!
//! Decode failures are fatal to the offending message only: helpers return
//! [`LocationError::Decode`] and callers drop + log, so a malformed frame
//! from a remote node can never take down a peer.

use crate::error::LocationError;
use crate::types::{EntityId, TimedMotionVector};
use serde::{Deserialize, Serialize};

// ============================================================================
// Port conventions
// ============================================================================
//
// Logical substream/datagram ports are small integers; the concrete values
// are a deployment convention shared by every node in a cluster.

/// Substream port carrying application-level script messaging.
pub const PORT_SCRIPT_COMM: u16 = 16;
/// Substream/datagram port carrying location update batches.
pub const PORT_LOCATION: u16 = 23;
/// Datagram port carrying proximity result batches.
pub const PORT_PROXIMITY: u16 = 24;

// ============================================================================
// Location updates
// ============================================================================

/// One object's entry in a location update batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdateEntry {
    /// The object the update describes.
    pub object: EntityId,
    /// Per-subscription sequence number, used by the receiver to detect
    /// drops or reordering across streams and request a resync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seqno: Option<u64>,
    /// The new motion sample.
    pub location: TimedMotionVector,
}

/// A batch of location updates sent between nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkLocationUpdate {
    /// Ordered per-object update records.
    pub update: Vec<LocationUpdateEntry>,
}

impl BulkLocationUpdate {
    /// A batch holding a single entry.
    pub fn single(entry: LocationUpdateEntry) -> Self {
        Self {
            update: vec![entry],
        }
    }

    /// Serializes the batch for transmission.
    pub fn encode(&self) -> Result<Vec<u8>, LocationError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a batch received from a peer.
    pub fn decode(bytes: &[u8]) -> Result<Self, LocationError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// An object's own announcement of its new motion state, pushed to the node
/// it is connected to when its extrapolation predicate fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdateRequest {
    /// The announced motion sample.
    pub location: TimedMotionVector,
}

impl LocationUpdateRequest {
    /// Serializes the request for transmission.
    pub fn encode(&self) -> Result<Vec<u8>, LocationError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a request received from an object session.
    pub fn decode(bytes: &[u8]) -> Result<Self, LocationError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ============================================================================
// Proximity results
// ============================================================================

/// An object entering a subscriber's proximity query result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProximityAddition {
    /// The object that became proximate.
    pub object: EntityId,
    /// Its motion state at the time of the addition.
    pub location: TimedMotionVector,
}

/// An object leaving a subscriber's proximity query result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProximityRemoval {
    /// The object that is no longer proximate.
    pub object: EntityId,
}

/// A batch of proximity query result changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProximityResults {
    /// Objects newly in range.
    pub addition: Vec<ProximityAddition>,
    /// Objects newly out of range.
    pub removal: Vec<ProximityRemoval>,
}

impl ProximityResults {
    /// Serializes the batch for transmission.
    pub fn encode(&self) -> Result<Vec<u8>, LocationError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a batch received from a peer.
    pub fn decode(bytes: &[u8]) -> Result<Self, LocationError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SimTime, Vec3};

    #[test]
    fn test_bulk_update_carries_seqno() {
        let entry = LocationUpdateEntry {
            object: EntityId::new(),
            seqno: Some(42),
            location: TimedMotionVector::stationary(SimTime::ZERO, Vec3::new(1.0, 2.0, 3.0)),
        };
        let batch = BulkLocationUpdate::single(entry.clone());

        let decoded = BulkLocationUpdate::decode(&batch.encode().unwrap()).unwrap();
        assert_eq!(decoded.update.len(), 1);
        assert_eq!(decoded.update[0], entry);
    }

    #[test]
    fn test_malformed_payload_is_a_decode_error() {
        let err = BulkLocationUpdate::decode(b"{not json").unwrap_err();
        assert!(matches!(err, LocationError::Decode(_)));
    }

    #[test]
    fn test_reserved_ports_are_distinct() {
        assert_ne!(PORT_LOCATION, PORT_PROXIMITY);
        assert_ne!(PORT_LOCATION, PORT_SCRIPT_COMM);
        assert_ne!(PORT_PROXIMITY, PORT_SCRIPT_COMM);
    }
}
